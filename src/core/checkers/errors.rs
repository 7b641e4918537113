use crate::core::domain::CheckerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    #[error("checker source is {size} bytes, the limit is {limit}")]
    SourceTooLarge { size: u64, limit: u64 },
    #[error("owner already has {count} checkers, the limit is {limit}")]
    TooManyCheckers { count: u64, limit: u64 },
    #[error("owner would use {used} bytes of checker storage, the limit is {limit}")]
    StorageExceeded { used: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckerError {
    #[error("checker {0} does not exist")]
    NotFound(CheckerId),
    #[error("checker {0} has no successful build yet")]
    NotReady(CheckerId),
    #[error("checker {0} belongs to another owner")]
    Forbidden(CheckerId),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("language `{0}` is not supported")]
    UnsupportedLanguage(String),
    #[error("checker storage failed: {msg}")]
    Io { msg: String },
    #[error("checker build queue is closed")]
    Closed,
}

impl From<std::io::Error> for CheckerError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            msg: error.to_string(),
        }
    }
}

/// Why a requested build produced no usable artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildFailure {
    #[error("checker build failed:\n{log}")]
    Compilation { log: String },
    #[error("checker build could not run: {msg}")]
    Internal { msg: String },
    #[error("a newer revision replaced this build")]
    Superseded,
    #[error("checker was deleted during the build")]
    Deleted,
}
