use std::{io, path::PathBuf};

use tokio::process::Command;

use crate::{
    constants::RUN_TYPE_ENV,
    core::traits::{
        runner::SandboxError,
        sandbox::{LaunchSpec, PreparedCommand, Sandbox, Teardown},
    },
};

/// Runs commands on the host in their own process group.
/// Memory is capped through RLIMIT_AS and CPU time through RLIMIT_CPU.
/// There is no filesystem or network isolation.
#[derive(Clone, Debug, Default)]
pub struct NativeSandbox;

impl NativeSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for NativeSandbox {
    fn prepare(&self, spec: &LaunchSpec) -> Result<PreparedCommand, SandboxError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SandboxError::InvalidSpec {
                msg: "empty command".to_string(),
            })?;
        // `./main` means a file in the workdir, as it would inside a container.
        let program = match program.strip_prefix("./") {
            Some(relative) => spec.workdir.join(relative),
            None => PathBuf::from(program),
        };

        let memory_bytes = u64::from(spec.memory_limit_mb) << 20;
        let cpu_seconds = spec.time_limit.as_secs() + 1;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.workdir)
            .env(RUN_TYPE_ENV, spec.container_type.script_run_type())
            .process_group(0);
        unsafe {
            command.pre_exec(move || {
                set_limit(libc::RLIMIT_AS, memory_bytes)?;
                set_limit(libc::RLIMIT_CPU, cpu_seconds)
            });
        }

        Ok(PreparedCommand {
            command,
            teardown: Box::new(ProcessGroupTeardown),
        })
    }
}

fn set_limit(resource: libc::__rlimit_resource_t, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Kills every process left in the group, including detached descendants.
#[derive(Debug)]
struct ProcessGroupTeardown;

impl Teardown for ProcessGroupTeardown {
    fn release(&self, pid: Option<u32>, _exited: bool) {
        let Some(pid) = pid else { return };
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{domain::ContainerType, limits::Ceilings};

    fn spec(command: &[&str]) -> LaunchSpec {
        LaunchSpec::new(
            "native",
            ContainerType::Checker,
            "/tmp/work",
            command.iter().map(|s| s.to_string()).collect(),
            Ceilings {
                memory_limit_mb: 64,
                time_limit: Duration::from_secs(2),
                output_limit: 1024,
            },
        )
    }

    #[test]
    fn test_relative_program_resolves_against_workdir() {
        let prepared = NativeSandbox::new().prepare(&spec(&["./main", "-v"])).unwrap();
        let command = prepared.command.as_std();
        assert_eq!(command.get_program(), "/tmp/work/main");
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec!["-v"]);
        assert_eq!(command.get_current_dir(), Some(std::path::Path::new("/tmp/work")));
    }

    #[test]
    fn test_run_type_is_exported() {
        let prepared = NativeSandbox::new().prepare(&spec(&["sh"])).unwrap();
        let envs: Vec<_> = prepared.command.as_std().get_envs().collect();
        assert!(envs.contains(&(
            std::ffi::OsStr::new(RUN_TYPE_ENV),
            Some(std::ffi::OsStr::new("run_checker"))
        )));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let result = NativeSandbox::new().prepare(&spec(&[]));
        assert!(matches!(result, Err(SandboxError::InvalidSpec { .. })));
    }
}
