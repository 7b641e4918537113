use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use tokio::process::Command;
use uuid::Uuid;

use crate::{
    config::SandboxConfig,
    constants::{RUN_TYPE_ENV, SANDBOX_MOUNT},
    core::traits::{
        runner::SandboxError,
        sandbox::{LaunchSpec, PreparedCommand, Sandbox, Teardown},
    },
};

#[derive(Clone, Debug)]
pub struct DockerSandbox {
    binary: String,
    host: Option<String>,
    isolation_profile: Option<PathBuf>,
    pids_limit: u32,
}

impl DockerSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            host: config.host.clone(),
            isolation_profile: config.isolation_profile.clone(),
            pids_limit: config.pids_limit,
        }
    }

    fn global_args(&self) -> Vec<String> {
        match &self.host {
            Some(host) => vec!["--host".to_string(), host.clone()],
            None => Vec::new(),
        }
    }
}

impl Sandbox for DockerSandbox {
    fn prepare(&self, spec: &LaunchSpec) -> Result<PreparedCommand, SandboxError> {
        if spec.command.is_empty() {
            return Err(SandboxError::InvalidSpec {
                msg: "empty command".to_string(),
            });
        }
        let workdir = spec.workdir.to_str().ok_or_else(|| SandboxError::InvalidSpec {
            msg: format!("workdir {:?} is not valid UTF-8", spec.workdir),
        })?;
        let name = format!("grader-{}", Uuid::new_v4());
        let mount_mode = if spec.read_only { ":ro" } else { "" };

        let mut command = Command::new(&self.binary);
        command
            .args(self.global_args())
            .args(["run", "--rm", "-i", "--name", &name])
            .args(["--network", "none"])
            .arg(format!("--memory={}m", spec.memory_limit_mb))
            .arg(format!("--memory-swap={}m", spec.memory_limit_mb))
            .arg(format!("--pids-limit={}", self.pids_limit))
            .arg("--cpus=1");
        if let Some(profile) = &self.isolation_profile {
            command.arg(format!("--security-opt=seccomp={}", profile.display()));
        }
        command
            .arg("-v")
            .arg(format!("{workdir}:{SANDBOX_MOUNT}{mount_mode}"))
            .args(["-w", SANDBOX_MOUNT])
            .arg("-e")
            .arg(format!(
                "{RUN_TYPE_ENV}={}",
                spec.container_type.script_run_type()
            ))
            .arg(&spec.image)
            .args(&spec.command);

        Ok(PreparedCommand {
            command,
            teardown: Box::new(ContainerTeardown {
                binary: self.binary.clone(),
                global_args: self.global_args(),
                name,
            }),
        })
    }
}

/// Killing the CLI client does not stop the container, so it is removed by name.
#[derive(Debug)]
struct ContainerTeardown {
    binary: String,
    global_args: Vec<String>,
    name: String,
}

impl ContainerTeardown {
    fn removal(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.binary);
        command
            .args(&self.global_args)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

fn log_removal(name: &str, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => tracing::debug!(%name, "container removed"),
        Ok(status) => tracing::debug!(%name, %status, "container removal reported failure"),
        Err(e) => tracing::warn!(%name, error = %e, "failed to remove container"),
    }
}

#[async_trait::async_trait]
impl Teardown for ContainerTeardown {
    fn release(&self, _pid: Option<u32>, exited: bool) {
        // `--rm` cleans up containers that ran to completion.
        if exited {
            return;
        }
        let mut command = self.removal();
        let name = self.name.clone();
        std::thread::spawn(move || log_removal(&name, command.status()));
    }

    async fn release_and_wait(&self, _pid: Option<u32>, exited: bool) {
        if exited {
            return;
        }
        let status = Command::from(self.removal()).status().await;
        log_removal(&self.name, status);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{domain::ContainerType, limits::Ceilings};

    fn sandbox(host: Option<&str>) -> DockerSandbox {
        DockerSandbox::new(&SandboxConfig {
            host: host.map(str::to_string),
            isolation_profile: Some(PathBuf::from("/etc/grader/seccomp.json")),
            ..SandboxConfig::default()
        })
    }

    fn spec() -> LaunchSpec {
        LaunchSpec::new(
            "gcc:13",
            ContainerType::Checker,
            "/var/lib/grader/checkers/7/r1",
            vec!["./main".to_string()],
            Ceilings {
                memory_limit_mb: 512,
                time_limit: Duration::from_secs(5),
                output_limit: 1024,
            },
        )
    }

    fn args(prepared: &PreparedCommand) -> Vec<String> {
        prepared
            .command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_container_flags() {
        let prepared = sandbox(None).prepare(&spec().read_only()).unwrap();
        let args = args(&prepared);

        assert_eq!(prepared.command.as_std().get_program(), "docker");
        assert_eq!(&args[..3], ["run", "--rm", "-i"]);
        for flag in [
            "--memory=512m",
            "--memory-swap=512m",
            "--pids-limit=64",
            "--security-opt=seccomp=/etc/grader/seccomp.json",
            "/var/lib/grader/checkers/7/r1:/sandbox:ro",
            "GRADER_RUN_TYPE=run_checker",
        ] {
            assert!(args.iter().any(|arg| arg == flag), "missing {flag}");
        }
        assert!(args.windows(2).any(|w| w == ["--network", "none"]));
        assert_eq!(&args[args.len() - 2..], ["gcc:13", "./main"]);
    }

    #[test]
    fn test_writable_mount_and_host() {
        let prepared = sandbox(Some("tcp://10.0.0.5:2375")).prepare(&spec()).unwrap();
        let args = args(&prepared);

        assert_eq!(&args[..2], ["--host", "tcp://10.0.0.5:2375"]);
        assert!(args.iter().any(|arg| arg == "/var/lib/grader/checkers/7/r1:/sandbox"));
    }

    /// Stands in for the docker CLI and appends its arguments to `calls`.
    fn recording_teardown(dir: &std::path::Path) -> ContainerTeardown {
        let script = dir.join("docker.sh");
        std::fs::write(
            &script,
            format!("sleep 0.2\necho \"$@\" >> {}\n", dir.join("calls").display()),
        )
        .unwrap();
        ContainerTeardown {
            binary: "sh".to_string(),
            global_args: vec![script.to_string_lossy().into_owned()],
            name: "grader-1234".to_string(),
        }
    }

    #[tokio::test]
    async fn test_release_and_wait_removes_container_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let teardown = recording_teardown(dir.path());

        teardown.release_and_wait(Some(42), false).await;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("calls")).unwrap(),
            "rm -f grader-1234\n"
        );
    }

    #[tokio::test]
    async fn test_exited_container_is_left_to_docker() {
        let dir = tempfile::tempdir().unwrap();
        let teardown = recording_teardown(dir.path());

        teardown.release_and_wait(Some(42), true).await;

        assert!(!dir.path().join("calls").exists());
    }

    #[test]
    fn test_each_launch_gets_its_own_container() {
        let sandbox = sandbox(None);
        let name_of = |prepared: &PreparedCommand| {
            let args = args(prepared);
            let at = args.iter().position(|arg| arg == "--name").unwrap();
            args[at + 1].clone()
        };
        let first = sandbox.prepare(&spec()).unwrap();
        let second = sandbox.prepare(&spec()).unwrap();
        assert_ne!(name_of(&first), name_of(&second));
    }
}
