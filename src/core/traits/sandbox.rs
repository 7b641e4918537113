use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::process::Command;

use crate::core::{
    domain::{ContainerType, ProgrammingLanguage},
    limits::Ceilings,
    traits::runner::SandboxError,
};

/// Everything a sandbox needs to start one process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub container_type: ContainerType,
    pub workdir: PathBuf,
    pub read_only: bool,
    pub command: Vec<String>,
    pub memory_limit_mb: u32,
    pub time_limit: Duration,
    pub output_limit: usize,
}

impl LaunchSpec {
    pub fn new(
        image: impl Into<String>,
        container_type: ContainerType,
        workdir: impl AsRef<Path>,
        command: Vec<String>,
        ceilings: Ceilings,
    ) -> Self {
        Self {
            image: image.into(),
            container_type,
            workdir: workdir.as_ref().to_path_buf(),
            read_only: false,
            command,
            memory_limit_mb: ceilings.memory_limit_mb,
            time_limit: ceilings.time_limit,
            output_limit: ceilings.output_limit,
        }
    }

    /// Launches the language's run command inside `workdir`.
    pub fn program(
        language: &ProgrammingLanguage,
        container_type: ContainerType,
        workdir: impl AsRef<Path>,
        ceilings: Ceilings,
    ) -> Self {
        Self::new(
            &language.image,
            container_type,
            workdir,
            language.run.clone(),
            ceilings,
        )
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Releases whatever a sandbox allocated for one process.
#[async_trait::async_trait]
pub trait Teardown: Debug + Send + Sync {
    /// Starts the release without waiting for it. Used where awaiting is impossible, such as `Drop`.
    /// `exited` is true when the process has already been reaped.
    fn release(&self, pid: Option<u32>, exited: bool);

    /// Releases and returns once the sandbox confirms nothing is left running.
    async fn release_and_wait(&self, pid: Option<u32>, exited: bool) {
        self.release(pid, exited);
    }
}

#[derive(Debug)]
pub struct PreparedCommand {
    pub command: Command,
    pub teardown: Box<dyn Teardown>,
}

pub trait Sandbox: Debug + Send + Sync {
    fn prepare(&self, spec: &LaunchSpec) -> Result<PreparedCommand, SandboxError>;
}
