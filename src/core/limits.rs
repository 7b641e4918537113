use std::time::Duration;

use crate::{
    config::ContainerConfig,
    core::domain::{ContainerType, Limits},
};

/// Resource ceilings applied to a single sandboxed process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ceilings {
    pub memory_limit_mb: u32,
    pub time_limit: Duration,
    pub output_limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitPolicy {
    pub memory_limit_mb: u32,
    pub time_limit: Duration,
    pub checker_memory_limit_mb: u32,
    pub checker_time_addition: Duration,
    pub build_memory_limit_mb: u32,
    pub build_time_limit: Duration,
    pub output_limit: usize,
}

impl LimitPolicy {
    /// Checkers get their own memory ceiling and the submission's time plus a fixed addition.
    pub fn ceilings(&self, container_type: ContainerType, limits: &Limits) -> Ceilings {
        let time_limit = limits.time_limit.unwrap_or(self.time_limit);
        match container_type {
            ContainerType::User => Ceilings {
                memory_limit_mb: limits.memory_limit_mb.unwrap_or(self.memory_limit_mb),
                time_limit,
                output_limit: self.output_limit,
            },
            ContainerType::Checker => Ceilings {
                memory_limit_mb: self.checker_memory_limit_mb,
                time_limit: time_limit + self.checker_time_addition,
                output_limit: self.output_limit,
            },
        }
    }

    pub fn build_ceilings(&self) -> Ceilings {
        Ceilings {
            memory_limit_mb: self.build_memory_limit_mb,
            time_limit: self.build_time_limit,
            output_limit: self.output_limit,
        }
    }
}

impl From<&ContainerConfig> for LimitPolicy {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            memory_limit_mb: config.memory_limit,
            time_limit: seconds(config.time_limit),
            checker_memory_limit_mb: config.checker_memory_limit,
            checker_time_addition: seconds(config.checker_time_addition),
            build_memory_limit_mb: config.build_memory_limit,
            build_time_limit: seconds(config.build_time_limit),
            output_limit: config.output_limit,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
