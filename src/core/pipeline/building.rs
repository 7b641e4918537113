use std::{path::PathBuf, sync::Arc};

use tokio::{
    sync::{
        mpsc::Receiver,
        oneshot::{self, Sender},
    },
    task::JoinHandle,
};

use crate::{
    constants::WORKER_STOPPED_ERR,
    core::{
        checkers::{
            errors::BuildFailure,
            registry::{CheckerRegistry, SwapOutcome},
            store::ArtifactStore,
        },
        compiler::build_log,
        domain::{CheckerId, ContainerType, ProgrammingLanguage},
        traits::{
            compiler::{CompileError, Compiler},
            notifier::{Notification, NotificationLevel, Notifier},
        },
    },
};

#[derive(Debug)]
pub enum CheckerAction {
    Build {
        source: Arc<str>,
        language: ProgrammingLanguage,
    },
    Delete,
}

#[derive(Debug)]
pub struct CheckerEvent {
    pub checker_id: CheckerId,
    pub revision: u64,
    pub action: CheckerAction,
    responder: Option<Sender<Result<ArtifactRef, BuildFailure>>>,
}

impl CheckerEvent {
    pub fn build(
        checker_id: CheckerId,
        revision: u64,
        source: Arc<str>,
        language: ProgrammingLanguage,
    ) -> (Self, BuildHandle) {
        let (tx, rx) = oneshot::channel();
        let event = Self {
            checker_id,
            revision,
            action: CheckerAction::Build { source, language },
            responder: Some(tx),
        };
        (event, BuildHandle { rx })
    }

    pub fn delete(checker_id: CheckerId) -> Self {
        Self {
            checker_id,
            revision: 0,
            action: CheckerAction::Delete,
            responder: None,
        }
    }
}

/// Where a successful build was put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub checker_id: CheckerId,
    pub revision: u64,
    pub path: PathBuf,
}

/// Resolves once the queued build finished. Dropping it does not cancel the build.
#[derive(Debug)]
pub struct BuildHandle {
    rx: oneshot::Receiver<Result<ArtifactRef, BuildFailure>>,
}

impl BuildHandle {
    pub async fn wait(self) -> Result<ArtifactRef, BuildFailure> {
        self.rx.await.unwrap_or_else(|_| {
            Err(BuildFailure::Internal {
                msg: WORKER_STOPPED_ERR.to_string(),
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    registry: Arc<CheckerRegistry>,
    store: ArtifactStore,
    compiler: Arc<dyn Compiler>,
    notifier: Arc<dyn Notifier>,
}

impl BuildContext {
    pub fn new(
        registry: Arc<CheckerRegistry>,
        store: ArtifactStore,
        compiler: Arc<dyn Compiler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            store,
            compiler,
            notifier,
        }
    }
}

#[tracing::instrument(skip_all)]
pub fn handle_building(mut events_rx: Receiver<CheckerEvent>, context: BuildContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let context = context.clone();
            tokio::spawn(async move {
                context.handle_event(event).await;
            });
        }
        tracing::debug!("checker event channel closed");
    })
}

impl BuildContext {
    async fn handle_event(&self, event: CheckerEvent) {
        let CheckerEvent {
            checker_id,
            revision,
            action,
            responder,
        } = event;

        match action {
            CheckerAction::Build { source, language } => {
                let outcome = self.build(checker_id, revision, &source, &language).await;
                if let Some(responder) = responder {
                    let _ = responder.send(outcome);
                }
            }
            CheckerAction::Delete => {
                self.store.purge(checker_id).await;
                tracing::info!(checker_id, "checker files purged");
            }
        }
    }

    #[tracing::instrument(skip(self, source, language), fields(language = %language.id))]
    async fn build(
        &self,
        checker_id: CheckerId,
        revision: u64,
        source: &str,
        language: &ProgrammingLanguage,
    ) -> Result<ArtifactRef, BuildFailure> {
        if !self.registry.mark_building(checker_id, revision) {
            tracing::debug!("revision is stale, skipping build");
            return Err(match self.registry.get(checker_id) {
                Some(_) => BuildFailure::Superseded,
                None => BuildFailure::Deleted,
            });
        }

        let staging = self.store.staging_dir(checker_id);
        tracing::debug!("Start building");
        let compiled = self
            .compiler
            .compile(source, language, &staging, ContainerType::Checker)
            .await;

        let log = match compiled {
            Ok(output) => output.log,
            Err(CompileError::CompilationFailed { result }) => {
                let log = build_log(&result);
                self.save_log(checker_id, &log).await;
                self.store.discard(&staging).await;
                return Err(self.failed(checker_id, revision, BuildFailure::Compilation { log }));
            }
            Err(CompileError::Internal { msg }) => {
                tracing::error!("Internal error during checker build: {}", msg);
                self.store.discard(&staging).await;
                return Err(self.failed(checker_id, revision, BuildFailure::Internal { msg }));
            }
        };
        self.save_log(checker_id, &log).await;

        let artifact = match self.store.promote(checker_id, revision, &staging).await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.store.discard(&staging).await;
                let failure = BuildFailure::Internal { msg: e.to_string() };
                return Err(self.failed(checker_id, revision, failure));
            }
        };
        let path = artifact.dir().to_path_buf();

        match self.registry.complete(checker_id, revision, artifact) {
            SwapOutcome::Swapped { retired } => {
                tracing::info!(path = ?path, "checker artifact swapped in");
                drop(retired);
                Ok(ArtifactRef {
                    checker_id,
                    revision,
                    path,
                })
            }
            SwapOutcome::Superseded(artifact) => {
                drop(artifact);
                Err(BuildFailure::Superseded)
            }
            SwapOutcome::Removed(artifact) => {
                drop(artifact);
                self.store.purge(checker_id).await;
                Err(BuildFailure::Deleted)
            }
        }
    }

    async fn save_log(&self, checker_id: CheckerId, log: &str) {
        if let Err(e) = self.store.write_log(checker_id, log).await {
            tracing::warn!(checker_id, error = %e, "failed to write build log");
        }
    }

    /// Records the failure and tells the author. A stale revision changes nothing.
    fn failed(&self, checker_id: CheckerId, revision: u64, failure: BuildFailure) -> BuildFailure {
        tracing::warn!(checker_id, revision, error = %failure, "checker build failed");
        if !self.registry.fail(checker_id, revision, failure.to_string()) {
            return failure;
        }
        if let Some(record) = self.registry.get(checker_id) {
            self.notifier.notify(Notification {
                recipient: record.checker.owner,
                level: NotificationLevel::Warn,
                title: format!("Checker \"{}\" failed to build", record.checker.name),
                body: failure.to_string(),
            });
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::{
        domain::ProcessResult,
        traits::{compiler::{BuildOutput, MockCompiler}, notifier::MockNotifier},
    };

    fn language() -> ProgrammingLanguage {
        ProgrammingLanguage {
            id: "cpp".to_string(),
            server_id: None,
            name: "C++".to_string(),
            version: "17".to_string(),
            editor_id: None,
            image: "gcc:13".to_string(),
            source_file: "main.cpp".to_string(),
            build: Some(vec!["g++".to_string(), "main.cpp".to_string()]),
            run: vec!["./main".to_string()],
        }
    }

    fn context(
        dir: &tempfile::TempDir,
        compiler: MockCompiler,
        notifier: MockNotifier,
    ) -> (BuildContext, Arc<CheckerRegistry>, ArtifactStore) {
        let registry = Arc::new(CheckerRegistry::new());
        let store = ArtifactStore::new(dir.path().join("bin"), dir.path().join("logs"));
        let context = BuildContext::new(
            registry.clone(),
            store.clone(),
            Arc::new(compiler),
            Arc::new(notifier),
        );
        (context, registry, store)
    }

    #[tokio::test]
    async fn test_successful_build_is_swapped_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = MockCompiler::new();
        compiler
            .expect_compile()
            .withf(|_, _, _, container_type| *container_type == ContainerType::Checker)
            .times(1)
            .returning(|_, _, dest, _| {
                std::fs::create_dir_all(dest).unwrap();
                std::fs::write(dest.join("main"), "binary").unwrap();
                Ok(BuildOutput {
                    log: "built\n".to_string(),
                })
            });
        let (context, registry, store) = context(&dir, compiler, MockNotifier::new());
        let record = registry.insert(3, "sum".to_string(), "cpp".to_string(), Arc::from("src"));
        let id = record.checker.id;

        let (tx, rx) = mpsc::channel(10);
        handle_building(rx, context);
        let (event, handle) = CheckerEvent::build(id, 1, record.source.clone(), language());
        tx.send(event).await.unwrap();

        let built = handle.wait().await.unwrap();
        assert_eq!(built.revision, 1);
        assert!(built.path.join("main").exists());
        assert_eq!(registry.resolve(id).unwrap().artifact.dir(), built.path);
        assert_eq!(store.read_log(id).await.unwrap().as_deref(), Some("built\n"));
    }

    #[tokio::test]
    async fn test_failed_build_notifies_and_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = MockCompiler::new();
        compiler.expect_compile().times(1).returning(|_, _, _, _| {
            Err(CompileError::CompilationFailed {
                result: ProcessResult {
                    exit_code: 1,
                    stderr: "main.cpp:1:1: error".to_string(),
                    ..Default::default()
                },
            })
        });
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|n| n.recipient == 3 && n.level == NotificationLevel::Warn)
            .times(1)
            .return_const(());
        let (context, registry, _) = context(&dir, compiler, notifier);
        let record = registry.insert(3, "sum".to_string(), "cpp".to_string(), Arc::from("src"));
        let id = record.checker.id;

        let failure = context.build(id, 1, "src", &language()).await.unwrap_err();

        assert!(matches!(failure, BuildFailure::Compilation { .. }));
        let record = registry.get(id).unwrap();
        assert_eq!(record.state, crate::core::domain::BuildState::Failed);
        assert!(record.last_error.unwrap().contains("main.cpp:1:1: error"));
        assert!(registry.resolve(id).is_err());
    }

    #[tokio::test]
    async fn test_stale_revision_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = MockCompiler::new();
        compiler.expect_compile().never();
        let (context, registry, _) = context(&dir, compiler, MockNotifier::new());
        let record = registry.insert(3, "sum".to_string(), "cpp".to_string(), Arc::from("src"));
        let id = record.checker.id;
        registry.begin_revision(id, |_| {}).unwrap();

        let failure = context.build(id, 1, "src", &language()).await.unwrap_err();
        assert_eq!(failure, BuildFailure::Superseded);

        registry.remove(id);
        let failure = context.build(id, 2, "src", &language()).await.unwrap_err();
        assert_eq!(failure, BuildFailure::Deleted);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_worker() {
        let (event, handle) = CheckerEvent::build(1, 1, Arc::from("src"), language());
        drop(event);

        let result = tokio::time::timeout(Duration::from_millis(100), handle.wait())
            .await
            .expect("handle must resolve once the responder is gone");
        assert!(matches!(result, Err(BuildFailure::Internal { .. })));
    }
}
