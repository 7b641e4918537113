use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

use crate::core::{
    checkers::{errors::CheckerError, quota::Usage, store::ArtifactFile},
    domain::{BuildState, Checker, CheckerId, OwnerId},
};

#[derive(Debug, Clone)]
pub struct CheckerRecord {
    pub checker: Checker,
    pub source: Arc<str>,
    pub state: BuildState,
    /// Latest requested revision. Only a build of this revision may be swapped in.
    pub revision: u64,
    pub artifact: Option<Arc<ArtifactFile>>,
    pub last_error: Option<String>,
}

/// A checker pinned for one grading run. The artifact stays on disk while this is alive.
#[derive(Debug, Clone)]
pub struct ResolvedChecker {
    pub checker: Checker,
    pub artifact: Arc<ArtifactFile>,
}

#[derive(Debug)]
pub enum SwapOutcome {
    Swapped { retired: Option<Arc<ArtifactFile>> },
    Superseded(Arc<ArtifactFile>),
    Removed(Arc<ArtifactFile>),
}

/// Versioned pointer from checker ids to their current artifact.
#[derive(Debug)]
pub struct CheckerRegistry {
    records: DashMap<CheckerId, CheckerRecord>,
    next_id: AtomicU64,
}

impl Default for CheckerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(
        &self,
        owner: OwnerId,
        name: String,
        language: String,
        source: Arc<str>,
    ) -> CheckerRecord {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = CheckerRecord {
            checker: Checker {
                id,
                owner,
                name,
                language,
                size_bytes: source.len() as u64,
            },
            source,
            state: BuildState::Pending,
            revision: 1,
            artifact: None,
            last_error: None,
        };
        self.records.insert(id, record.clone());
        record
    }

    pub fn get(&self, id: CheckerId) -> Option<CheckerRecord> {
        self.records.get(&id).map(|record| record.clone())
    }

    pub fn resolve(&self, id: CheckerId) -> Result<ResolvedChecker, CheckerError> {
        let record = self.records.get(&id).ok_or(CheckerError::NotFound(id))?;
        let artifact = record
            .artifact
            .clone()
            .ok_or(CheckerError::NotReady(id))?;
        Ok(ResolvedChecker {
            checker: record.checker.clone(),
            artifact,
        })
    }

    pub fn usage(&self, owner: OwnerId) -> Usage {
        self.records
            .iter()
            .filter(|record| record.checker.owner == owner)
            .fold(Usage::default(), |usage, record| Usage {
                count: usage.count + 1,
                bytes: usage.bytes + record.checker.size_bytes,
            })
    }

    /// Applies `change` and opens a new revision. Returns the updated record.
    pub fn begin_revision(
        &self,
        id: CheckerId,
        change: impl FnOnce(&mut CheckerRecord),
    ) -> Result<CheckerRecord, CheckerError> {
        let mut record = self.records.get_mut(&id).ok_or(CheckerError::NotFound(id))?;
        change(record.value_mut());
        record.checker.size_bytes = record.source.len() as u64;
        record.revision += 1;
        record.state = BuildState::Pending;
        Ok(record.clone())
    }

    /// Applies a change that needs no rebuild.
    pub fn rename(&self, id: CheckerId, name: String) -> Result<CheckerRecord, CheckerError> {
        let mut record = self.records.get_mut(&id).ok_or(CheckerError::NotFound(id))?;
        record.checker.name = name;
        Ok(record.clone())
    }

    /// Returns false when the revision is already stale.
    pub fn mark_building(&self, id: CheckerId, revision: u64) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) if record.revision == revision => {
                record.state = BuildState::Building;
                true
            }
            _ => false,
        }
    }

    pub fn complete(
        &self,
        id: CheckerId,
        revision: u64,
        artifact: Arc<ArtifactFile>,
    ) -> SwapOutcome {
        let Some(mut record) = self.records.get_mut(&id) else {
            return SwapOutcome::Removed(artifact);
        };
        if record.revision != revision {
            return SwapOutcome::Superseded(artifact);
        }
        record.state = BuildState::Ready;
        record.last_error = None;
        let retired = record.artifact.replace(artifact);
        SwapOutcome::Swapped { retired }
    }

    /// Records a failed build. The current artifact, if any, stays in place.
    pub fn fail(&self, id: CheckerId, revision: u64, error: String) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) if record.revision == revision => {
                record.state = BuildState::Failed;
                record.last_error = Some(error);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: CheckerId) -> Option<CheckerRecord> {
        self.records.remove(&id).map(|(_, record)| record)
    }
}
