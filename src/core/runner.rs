use std::{process::Stdio, sync::Arc};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, time::timeout};

use crate::{
    constants::TIMEOUT_EXIT_CODE,
    core::{
        domain::ProcessResult,
        streams::{collect, read_capped},
        traits::{
            runner::{Runner, SandboxError, SandboxProcess, exit_code},
            sandbox::{LaunchSpec, PreparedCommand, Sandbox},
        },
    },
};

/// Drives sandboxed processes: stdin feeding, capped capture and deadline enforcement.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    sandbox: Arc<dyn Sandbox>,
}

impl ProcessRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    #[tracing::instrument(skip(self, stdin), fields(container = ?spec.container_type, command = ?spec.command))]
    async fn run(&self, spec: &LaunchSpec, stdin: &str) -> Result<ProcessResult, SandboxError> {
        let mut process = self.spawn(spec).await?;

        let stdout_task = tokio::spawn(read_capped(process.take_stdout(), spec.output_limit));
        let stderr_task = tokio::spawn(read_capped(process.take_stderr(), spec.output_limit));
        let stdin_pipe = process.take_stdin();
        let input = stdin.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            if let Some(mut pipe) = stdin_pipe {
                // A process may exit without reading its input.
                let _ = pipe.write_all(&input).await;
                let _ = pipe.shutdown().await;
            }
        });

        let waited = timeout(spec.time_limit, process.wait()).await;
        let status = match waited {
            Ok(status) => Some(status?),
            Err(_) => None,
        };
        match status {
            Some(_) => process.finish(),
            None => {
                tracing::debug!(limit = ?spec.time_limit, "process hit its time limit");
                process.terminate().await;
            }
        }
        writer.abort();

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        Ok(ProcessResult {
            exit_code: status.map(exit_code).unwrap_or(TIMEOUT_EXIT_CODE),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out: status.is_none(),
            elapsed: process.elapsed(),
        })
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<SandboxProcess, SandboxError> {
        let PreparedCommand {
            mut command,
            teardown,
        } = self.sandbox.prepare(spec)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| SandboxError::Spawn {
            msg: format!("{:?}: {e}", spec.command),
        })?;
        Ok(SandboxProcess::new(child, teardown))
    }
}
