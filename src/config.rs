use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::core::domain::ProgrammingLanguage;

#[derive(Parser, Debug)]
#[command(name = "grader", version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: PathBuf,

    /// Process isolation backend
    #[arg(long, value_enum, default_value_t = SandboxKind::Docker)]
    pub sandbox: SandboxKind,

    /// Overrides `server.bind_address`
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxKind {
    /// Local processes in their own process group with rlimits. No filesystem or network isolation.
    Native,
    /// Throwaway docker containers.
    Docker,
}

impl CliArgs {
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let config = Config::load(&self.config_path)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {msg}")]
    Invalid { msg: String },
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub container: ContainerConfig,
    pub checker: CheckerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub languages: Vec<ProgrammingLanguage>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "[::1]:50051".to_string(),
        }
    }
}

/// Limits in megabytes and seconds.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub memory_limit: u32,
    pub time_limit: f64,
    pub checker_memory_limit: u32,
    pub checker_time_addition: f64,
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
    #[serde(default = "default_build_time_limit")]
    pub build_time_limit: f64,
    #[serde(default = "default_build_memory_limit")]
    pub build_memory_limit: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CheckerConfig {
    pub base_path: PathBuf,
    pub base_log_path: PathBuf,
    pub bytes_per_user_limit: u64,
    pub amount_per_user_limit: u64,
    pub code_file_size_limit: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    /// Docker daemon address, e.g. `unix:///var/run/docker.sock`
    #[serde(default)]
    pub host: Option<String>,
    /// Seccomp profile passed to every container
    #[serde(default)]
    pub isolation_profile: Option<PathBuf>,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Parent directory of per-request workspaces
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            host: None,
            isolation_profile: None,
            pids_limit: default_pids_limit(),
            work_dir: default_work_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_concurrent_executions: usize,
    /// Seconds a request may wait for an execution slot
    pub wait_timeout: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            wait_timeout: 120.0,
        }
    }
}

fn default_output_limit() -> usize {
    1 << 20
}

fn default_build_time_limit() -> f64 {
    30.0
}

fn default_build_memory_limit() -> u32 {
    1024
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_pids_limit() -> u32 {
    64
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("grader")
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let container = &self.container;
        for (name, value) in [
            ("container.time_limit", container.time_limit),
            ("container.build_time_limit", container.build_time_limit),
            ("queue.wait_timeout", self.queue.wait_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!("{name} must be a positive number of seconds")));
            }
        }
        if !container.checker_time_addition.is_finite() || container.checker_time_addition < 0.0 {
            return Err(invalid("container.checker_time_addition must not be negative"));
        }
        for (name, value) in [
            ("container.memory_limit", container.memory_limit),
            ("container.checker_memory_limit", container.checker_memory_limit),
            ("container.build_memory_limit", container.build_memory_limit),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }
        if container.output_limit == 0 {
            return Err(invalid("container.output_limit must be positive"));
        }
        if self.queue.max_concurrent_executions == 0 {
            return Err(invalid("queue.max_concurrent_executions must be positive"));
        }
        if self.checker.code_file_size_limit > self.checker.bytes_per_user_limit {
            return Err(invalid(
                "checker.code_file_size_limit exceeds checker.bytes_per_user_limit",
            ));
        }
        if self.languages.is_empty() {
            return Err(invalid("at least one language is required"));
        }
        for language in &self.languages {
            if language.run.is_empty() {
                return Err(invalid(format!("language `{}` has an empty run command", language.id)));
            }
            if language.build.as_ref().is_some_and(Vec::is_empty) {
                return Err(invalid(format!(
                    "language `{}` has an empty build command",
                    language.id
                )));
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { msg: msg.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> Config {
        serde_json::from_str(include_str!("../config.example.json")).unwrap()
    }

    #[test]
    fn test_config_deserialization() {
        let config = example();
        assert_eq!(config.server.bind_address, "[::1]:50051");
        assert_eq!(config.container.memory_limit, 256);
        assert_eq!(config.checker.amount_per_user_limit, 10);
        assert_eq!(config.queue.max_concurrent_executions, 4);
        assert_eq!(config.languages[0].id, "cpp");
        assert!(config.languages[0].build.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sandbox_section_defaults() {
        let config = example();
        assert_eq!(config.sandbox.docker_binary, "docker");
        assert_eq!(config.sandbox.pids_limit, 64);
    }

    #[test]
    fn test_validate_rejects_non_positive_time_limit() {
        let mut config = example();
        config.container.time_limit = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = example();
        config.container.checker_time_addition = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_memory_limits() {
        let mut config = example();
        config.container.build_memory_limit = 0;
        match config.validate() {
            Err(ConfigError::Invalid { msg }) => {
                assert_eq!(msg, "container.build_memory_limit must be positive")
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let mut config = example();
        config.container.checker_memory_limit = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_run_command() {
        let mut config = example();
        config.languages[0].run.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let result = Config::load("/nonexistent/grader.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
