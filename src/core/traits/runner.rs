use std::{
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    time::{Duration, Instant},
};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::{
    constants::{EXIT_GRACE, TEARDOWN_GRACE},
    core::{domain::ProcessResult, traits::sandbox::{LaunchSpec, Teardown}},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to start sandboxed process: {msg}")]
    Spawn { msg: String },
    #[error("sandbox i/o failed: {msg}")]
    Io { msg: String },
    #[error("invalid launch spec: {msg}")]
    InvalidSpec { msg: String },
}

impl From<std::io::Error> for SandboxError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            msg: error.to_string(),
        }
    }
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send + Sync {
    /// Runs to completion or to the launch deadline, feeding `stdin` and capturing capped output.
    async fn run(&self, spec: &LaunchSpec, stdin: &str) -> Result<ProcessResult, SandboxError>;

    /// Starts a process with piped stdio and leaves the conversation to the caller.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SandboxProcess, SandboxError>;
}

/// A live sandboxed process. Dropping it kills the process and releases the sandbox.
#[derive(Debug)]
pub struct SandboxProcess {
    child: Child,
    pid: Option<u32>,
    teardown: Box<dyn Teardown>,
    released: bool,
    started: Instant,
}

impl SandboxProcess {
    pub fn new(child: Child, teardown: Box<dyn Teardown>) -> Self {
        Self {
            pid: child.id(),
            child,
            teardown,
            released: false,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        Ok(self.child.wait().await?)
    }

    /// Releases the sandbox after the process exited on its own.
    pub fn finish(&mut self) {
        if !self.released {
            self.released = true;
            self.teardown.release(self.pid, true);
        }
    }

    pub fn kill(&mut self) {
        if !self.released {
            self.released = true;
            self.teardown.release(self.pid, false);
        }
        let _ = self.child.start_kill();
    }

    /// Kills and reaps the process, waiting for the sandbox to be released.
    pub async fn terminate(&mut self) {
        if !self.released {
            self.released = true;
            let pid = self.pid;
            let release = self.teardown.release_and_wait(pid, false);
            if tokio::time::timeout(TEARDOWN_GRACE, release).await.is_err() {
                tracing::warn!(?pid, "sandbox release did not finish in time");
            }
        }
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(EXIT_GRACE, self.child.wait()).await;
    }
}

impl Drop for SandboxProcess {
    fn drop(&mut self) {
        if !self.released {
            self.kill();
        }
    }
}

/// Signals are reported the way shells do, as 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
