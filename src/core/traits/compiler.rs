use std::path::Path;

use crate::core::domain::{ContainerType, ProcessResult, ProgrammingLanguage};

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("compilation failed with exit code {}", .result.exit_code)]
    CompilationFailed { result: ProcessResult },
    #[error("internal build error: {msg}")]
    Internal { msg: String },
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Compiler: std::fmt::Debug + Send + Sync {
    /// Writes `source` into `dest` and runs the language's build step there.
    async fn compile(
        &self,
        source: &str,
        language: &ProgrammingLanguage,
        dest: &Path,
        container_type: ContainerType,
    ) -> Result<BuildOutput, CompileError>;
}
