use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::Sender;

use crate::core::{
    checkers::{
        errors::CheckerError,
        quota::CheckerQuotas,
        registry::{CheckerRecord, CheckerRegistry},
        store::ArtifactStore,
    },
    domain::{BuildState, Checker, CheckerId, LanguageCatalog, OwnerId, ProgrammingLanguage},
    pipeline::building::{BuildHandle, CheckerEvent},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChecker {
    pub owner: OwnerId,
    pub name: String,
    pub language: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckerUpdate {
    pub name: Option<String>,
    pub language: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerStatus {
    pub checker: Checker,
    pub state: BuildState,
    pub revision: u64,
    pub artifact_revision: Option<u64>,
    pub last_error: Option<String>,
}

impl From<&CheckerRecord> for CheckerStatus {
    fn from(record: &CheckerRecord) -> Self {
        Self {
            checker: record.checker.clone(),
            state: record.state,
            revision: record.revision,
            artifact_revision: record.artifact.as_ref().map(|artifact| artifact.revision()),
            last_error: record.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLog {
    pub checker_id: CheckerId,
    pub content: String,
    pub read_at: DateTime<Utc>,
}

/// Checker lifecycle: quota admission, then a queued background build.
#[derive(Debug, Clone)]
pub struct CheckerService {
    registry: Arc<CheckerRegistry>,
    catalog: Arc<LanguageCatalog>,
    store: ArtifactStore,
    quotas: CheckerQuotas,
    events: Sender<CheckerEvent>,
    // Held across quota check and registration.
    admission: Arc<Mutex<()>>,
}

impl CheckerService {
    pub fn new(
        registry: Arc<CheckerRegistry>,
        catalog: Arc<LanguageCatalog>,
        store: ArtifactStore,
        quotas: CheckerQuotas,
        events: Sender<CheckerEvent>,
    ) -> Self {
        Self {
            registry,
            catalog,
            store,
            quotas,
            events,
            admission: Arc::new(Mutex::new(())),
        }
    }

    #[tracing::instrument(skip(self, new), fields(owner = new.owner, language = %new.language))]
    pub async fn create(&self, new: NewChecker) -> Result<(CheckerStatus, BuildHandle), CheckerError> {
        let language = self.language(&new.language)?;
        let record = {
            let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            self.quotas
                .check_new(new.source.len() as u64, self.registry.usage(new.owner))?;
            self.registry
                .insert(new.owner, new.name, new.language, Arc::from(new.source))
        };
        tracing::info!(checker_id = record.checker.id, "checker registered");

        match self.enqueue(&record, language).await {
            Ok(handle) => Ok((CheckerStatus::from(&record), handle)),
            Err(e) => {
                self.registry.remove(record.checker.id);
                Err(e)
            }
        }
    }

    /// Source or language changes trigger a rebuild; the current artifact serves until it succeeds.
    #[tracing::instrument(skip(self, update))]
    pub async fn update(
        &self,
        id: CheckerId,
        owner: OwnerId,
        update: CheckerUpdate,
    ) -> Result<(CheckerStatus, Option<BuildHandle>), CheckerError> {
        let current = self.owned(id, owner)?;
        let language = match &update.language {
            Some(language) => self.language(language)?,
            None => self.language(&current.checker.language)?,
        };
        let rebuild = update.source.is_some()
            || update
                .language
                .as_ref()
                .is_some_and(|language| *language != current.checker.language);

        if !rebuild {
            let record = match update.name {
                Some(name) => self.registry.rename(id, name)?,
                None => current,
            };
            return Ok((CheckerStatus::from(&record), None));
        }

        let record = {
            let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(source) = &update.source {
                self.quotas.check_replacement(
                    source.len() as u64,
                    current.checker.size_bytes,
                    self.registry.usage(owner),
                )?;
            }
            self.registry.begin_revision(id, |record| {
                if let Some(name) = update.name {
                    record.checker.name = name;
                }
                if let Some(language) = update.language {
                    record.checker.language = language;
                }
                if let Some(source) = update.source {
                    record.source = Arc::from(source);
                }
            })?
        };
        tracing::info!(revision = record.revision, "checker rebuild requested");

        let handle = self.enqueue(&record, language).await?;
        Ok((CheckerStatus::from(&record), Some(handle)))
    }

    /// Runs already holding the artifact finish with it.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: CheckerId, owner: OwnerId) -> Result<(), CheckerError> {
        self.owned(id, owner)?;
        drop(self.registry.remove(id));
        self.events
            .send(CheckerEvent::delete(id))
            .await
            .map_err(|_| CheckerError::Closed)?;
        tracing::info!("checker deleted");
        Ok(())
    }

    pub fn status(&self, id: CheckerId, owner: OwnerId) -> Result<CheckerStatus, CheckerError> {
        Ok(CheckerStatus::from(&self.owned(id, owner)?))
    }

    pub async fn build_log(&self, id: CheckerId, owner: OwnerId) -> Result<BuildLog, CheckerError> {
        self.owned(id, owner)?;
        let content = self.store.read_log(id).await?.unwrap_or_default();
        Ok(BuildLog {
            checker_id: id,
            content,
            read_at: Utc::now(),
        })
    }

    fn owned(&self, id: CheckerId, owner: OwnerId) -> Result<CheckerRecord, CheckerError> {
        let record = self.registry.get(id).ok_or(CheckerError::NotFound(id))?;
        if record.checker.owner != owner {
            return Err(CheckerError::Forbidden(id));
        }
        Ok(record)
    }

    fn language(&self, id: &str) -> Result<ProgrammingLanguage, CheckerError> {
        self.catalog
            .get(id)
            .cloned()
            .ok_or_else(|| CheckerError::UnsupportedLanguage(id.to_string()))
    }

    async fn enqueue(
        &self,
        record: &CheckerRecord,
        language: ProgrammingLanguage,
    ) -> Result<BuildHandle, CheckerError> {
        let (event, handle) = CheckerEvent::build(
            record.checker.id,
            record.revision,
            record.source.clone(),
            language,
        );
        self.events
            .send(event)
            .await
            .map_err(|_| CheckerError::Closed)?;
        Ok(handle)
    }
}
