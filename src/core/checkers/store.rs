use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;
use uuid::Uuid;

use crate::core::domain::CheckerId;

/// On-disk layout of checker builds and their logs.
///
/// Every successful build lands in its own directory `<base>/<id>/r<revision>-<uuid>`,
/// so a new build never overwrites files an in-flight grading run may be executing.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_path: PathBuf,
    base_log_path: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_path: impl AsRef<Path>, base_log_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            base_log_path: base_log_path.as_ref().to_path_buf(),
        }
    }

    fn checker_dir(&self, id: CheckerId) -> PathBuf {
        self.base_path.join(id.to_string())
    }

    pub fn staging_dir(&self, id: CheckerId) -> PathBuf {
        self.checker_dir(id)
            .join(format!("staging-{}", Uuid::new_v4()))
    }

    pub fn log_path(&self, id: CheckerId) -> PathBuf {
        self.base_log_path.join(format!("{id}.log"))
    }

    /// Moves a finished staging directory to its final place.
    pub async fn promote(
        &self,
        id: CheckerId,
        revision: u64,
        staging: &Path,
    ) -> io::Result<Arc<ArtifactFile>> {
        let dir = self
            .checker_dir(id)
            .join(format!("r{revision}-{}", Uuid::new_v4()));
        fs::rename(staging, &dir).await?;
        Ok(Arc::new(ArtifactFile { dir, revision }))
    }

    pub async fn discard(&self, staging: &Path) {
        if let Err(e) = fs::remove_dir_all(staging).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = ?staging, error = %e, "failed to remove staging directory");
            }
        }
    }

    pub async fn write_log(&self, id: CheckerId, content: &str) -> io::Result<()> {
        fs::create_dir_all(&self.base_log_path).await?;
        fs::write(self.log_path(id), content).await
    }

    pub async fn read_log(&self, id: CheckerId) -> io::Result<Option<String>> {
        match fs::read(self.log_path(id)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Removes the log and the checker directory once no artifact is left in it.
    pub async fn purge(&self, id: CheckerId) {
        match fs::remove_file(self.log_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(checker_id = id, error = %e, "failed to remove build log"),
        }
        // Fails while in-flight runs still hold an artifact; retiring the last one removes it.
        let _ = fs::remove_dir(self.checker_dir(id)).await;
    }
}

/// A built checker. The directory is deleted when the last holder drops it.
#[derive(Debug, PartialEq, Eq)]
pub struct ArtifactFile {
    dir: PathBuf,
    revision: u64,
}

impl ArtifactFile {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl Drop for ArtifactFile {
    fn drop(&mut self) {
        let dir = std::mem::take(&mut self.dir);
        let revision = self.revision;
        let removal = move || retire(&dir, revision);
        // Holders usually drop from async tasks.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(removal);
            }
            Err(_) => removal(),
        }
    }
}

fn retire(dir: &Path, revision: u64) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(path = ?dir, revision, "artifact retired"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?dir, error = %e, "failed to retire artifact"),
    }
    // Only succeeds once nothing else of the checker is left.
    if let Some(checker_dir) = dir.parent() {
        let _ = std::fs::remove_dir(checker_dir);
    }
}

/// Artifacts are removed in the background; polls until `path` is gone.
#[cfg(test)]
pub async fn removed(path: &Path) -> bool {
    for _ in 0..100 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_promote_moves_staging_and_drop_retires() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(base.path().join("bin"), base.path().join("logs"));
        let staging = store.staging_dir(7);
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("main"), "binary").unwrap();

        let artifact = store.promote(7, 3, &staging).await.unwrap();

        assert!(!staging.exists());
        assert_eq!(artifact.revision(), 3);
        assert!(artifact.dir().starts_with(base.path().join("bin").join("7")));
        assert_eq!(std::fs::read_to_string(artifact.dir().join("main")).unwrap(), "binary");

        let dir = artifact.dir().to_path_buf();
        let holder = artifact.clone();
        drop(artifact);
        assert!(dir.exists());
        drop(holder);
        assert!(removed(&dir).await);
    }

    #[tokio::test]
    async fn test_last_retired_artifact_removes_purged_checker_dir() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(base.path().join("bin"), base.path().join("logs"));
        let staging = store.staging_dir(4);
        std::fs::create_dir_all(&staging).unwrap();
        let in_flight = store.promote(4, 1, &staging).await.unwrap();
        let checker_dir = base.path().join("bin").join("4");

        store.purge(4).await;
        assert!(checker_dir.exists());

        drop(in_flight);
        assert!(removed(&checker_dir).await);
    }

    #[test]
    fn test_drop_outside_runtime_removes_synchronously() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("9").join("r1-x");
        std::fs::create_dir_all(&dir).unwrap();

        drop(ArtifactFile {
            dir: dir.clone(),
            revision: 1,
        });

        assert!(!dir.exists());
        assert!(!base.path().join("9").exists());
    }

    #[tokio::test]
    async fn test_log_round_trip_and_purge() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(base.path().join("bin"), base.path().join("logs"));

        assert_eq!(store.read_log(1).await.unwrap(), None);
        store.write_log(1, "error: expected `;`\n").await.unwrap();
        assert_eq!(
            store.read_log(1).await.unwrap().as_deref(),
            Some("error: expected `;`\n")
        );

        store.purge(1).await;
        assert_eq!(store.read_log(1).await.unwrap(), None);
    }
}
