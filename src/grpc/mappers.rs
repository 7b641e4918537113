use std::time::Duration;

use tonic::Status;

use crate::{
    core::{
        checkers::{
            errors::CheckerError,
            service::{BuildLog, CheckerStatus, CheckerUpdate, NewChecker},
        },
        domain,
        pipeline::grading::GradingError,
    },
    grpc::models::{self, Empty, chrono_to_prost, grade_event},
};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(i32),
    #[error("Unknown comparison mode: {0}")]
    UnknownComparison(i32),
    #[error("Invalid value for {field}: {value}")]
    InvalidLimit { field: String, value: String },
}

impl From<ConversionError> for Status {
    fn from(error: ConversionError) -> Self {
        Status::invalid_argument(error.to_string())
    }
}

impl TryFrom<models::GradeRequest> for domain::GradingRequest {
    type Error = ConversionError;

    fn try_from(req: models::GradeRequest) -> Result<Self, ConversionError> {
        let task_type = domain::TaskType::from_code(req.task_type)
            .ok_or(ConversionError::UnknownTaskType(req.task_type))?;
        let comparison = match models::ComparisonMode::try_from(req.comparison) {
            Ok(models::ComparisonMode::Normalized) => domain::ComparisonMode::Normalized,
            Ok(models::ComparisonMode::Exact) => domain::ComparisonMode::Exact,
            Err(_) => return Err(ConversionError::UnknownComparison(req.comparison)),
        };
        let limits = match req.limits {
            Some(limits) => limits.try_into()?,
            None => domain::Limits::default(),
        };

        Ok(Self {
            code: req.code,
            language: req.language,
            task_type,
            cases: req.cases.into_iter().map(Into::into).collect(),
            checker_id: req.checker_id,
            limits,
            comparison,
        })
    }
}

impl TryFrom<models::Limits> for domain::Limits {
    type Error = ConversionError;

    fn try_from(limits: models::Limits) -> Result<Self, ConversionError> {
        let memory_limit_mb = match limits.memory_limit_mb {
            Some(0) => {
                return Err(ConversionError::InvalidLimit {
                    field: "memory_limit_mb".to_string(),
                    value: "0".to_string(),
                });
            }
            other => other,
        };
        let time_limit = limits
            .time_limit_seconds
            .map(|secs| match Duration::try_from_secs_f64(secs) {
                Ok(limit) if !limit.is_zero() => Ok(limit),
                _ => Err(ConversionError::InvalidLimit {
                    field: "time_limit_seconds".to_string(),
                    value: secs.to_string(),
                }),
            })
            .transpose()?;

        Ok(Self {
            memory_limit_mb,
            time_limit,
        })
    }
}

impl From<models::TestCase> for domain::TestCase {
    fn from(case: models::TestCase) -> Self {
        Self {
            input: case.input,
            expected_output: case.expected_output,
            points: case.points,
        }
    }
}

impl From<domain::CaseVerdict> for models::Verdict {
    fn from(verdict: domain::CaseVerdict) -> Self {
        match verdict {
            domain::CaseVerdict::Accepted => models::Verdict::Accepted,
            domain::CaseVerdict::WrongAnswer => models::Verdict::WrongAnswer,
            domain::CaseVerdict::Scored => models::Verdict::Scored,
            domain::CaseVerdict::CompilationError => models::Verdict::CompilationError,
            domain::CaseVerdict::RuntimeError => models::Verdict::RuntimeError,
            domain::CaseVerdict::TimeLimitExceeded => models::Verdict::TimeLimitExceeded,
            domain::CaseVerdict::MemoryLimitExceeded => models::Verdict::MemoryLimitExceeded,
            domain::CaseVerdict::CheckerError => models::Verdict::CheckerError,
        }
    }
}

impl From<domain::ProcessResult> for models::ProcessResult {
    fn from(result: domain::ProcessResult) -> Self {
        Self {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
            elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<domain::CaseReport> for models::CaseReport {
    fn from(report: domain::CaseReport) -> Self {
        Self {
            index: u32::try_from(report.index).unwrap_or(u32::MAX),
            verdict: models::Verdict::from(report.verdict).into(),
            score: report.score,
            max_score: report.max_score,
            message: report.message,
            process: report.process.map(Into::into),
        }
    }
}

impl From<domain::GradeReport> for models::GradeReport {
    fn from(report: domain::GradeReport) -> Self {
        Self {
            score: report.score,
            max_score: report.max_score,
            message: report.message,
            cases: report.cases.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<domain::GradeEvent> for models::GradeEvent {
    fn from(event: domain::GradeEvent) -> Self {
        let event = match event {
            domain::GradeEvent::Compiled => grade_event::Event::Compiled(Empty {}),
            domain::GradeEvent::CaseFinished(report) => {
                grade_event::Event::CaseFinished(report.into())
            }
            domain::GradeEvent::Finished(report) => grade_event::Event::Finished(report.into()),
        };
        Self { event: Some(event) }
    }
}

impl From<domain::RunReport> for models::RunResponse {
    fn from(report: domain::RunReport) -> Self {
        Self {
            verdict: models::Verdict::from(report.verdict).into(),
            message: report.message,
            process: report.process.map(Into::into),
        }
    }
}

impl From<domain::BuildState> for models::CheckerState {
    fn from(state: domain::BuildState) -> Self {
        match state {
            domain::BuildState::Pending => models::CheckerState::Pending,
            domain::BuildState::Building => models::CheckerState::Building,
            domain::BuildState::Ready => models::CheckerState::Ready,
            domain::BuildState::Failed => models::CheckerState::Failed,
        }
    }
}

impl From<CheckerStatus> for models::CheckerStatus {
    fn from(status: CheckerStatus) -> Self {
        Self {
            checker_id: status.checker.id,
            owner_id: status.checker.owner,
            name: status.checker.name,
            language: status.checker.language,
            size_bytes: status.checker.size_bytes,
            state: models::CheckerState::from(status.state).into(),
            revision: status.revision,
            artifact_revision: status.artifact_revision,
            last_error: status.last_error,
        }
    }
}

impl From<BuildLog> for models::CheckerLog {
    fn from(log: BuildLog) -> Self {
        Self {
            checker_id: log.checker_id,
            content: log.content,
            read_at: Some(chrono_to_prost(log.read_at)),
        }
    }
}

impl From<models::CreateCheckerRequest> for NewChecker {
    fn from(req: models::CreateCheckerRequest) -> Self {
        Self {
            owner: req.owner_id,
            name: req.name,
            language: req.language,
            source: req.source,
        }
    }
}

impl From<models::UpdateCheckerRequest> for CheckerUpdate {
    fn from(req: models::UpdateCheckerRequest) -> Self {
        Self {
            name: req.name,
            language: req.language,
            source: req.source,
        }
    }
}

impl From<CheckerError> for Status {
    fn from(error: CheckerError) -> Self {
        let message = error.to_string();
        match error {
            CheckerError::NotFound(_) => Status::not_found(message),
            CheckerError::NotReady(_) => Status::failed_precondition(message),
            CheckerError::Forbidden(_) => Status::permission_denied(message),
            CheckerError::Quota(_) => Status::resource_exhausted(message),
            CheckerError::UnsupportedLanguage(_) => Status::invalid_argument(message),
            CheckerError::Io { .. } => Status::internal(message),
            CheckerError::Closed => Status::unavailable(message),
        }
    }
}

impl From<GradingError> for Status {
    fn from(error: GradingError) -> Self {
        let message = error.to_string();
        match error {
            GradingError::InvalidRequest { .. } | GradingError::UnsupportedLanguage(_) => {
                Status::invalid_argument(message)
            }
            GradingError::Checker(e) => e.into(),
            GradingError::QueueTimeout(_) => Status::unavailable(message),
            GradingError::Cancelled => Status::cancelled(message),
            GradingError::Sandbox(_) | GradingError::Build { .. } | GradingError::Io(_) => {
                tracing::error!("Internal grading error: {}", message);
                Status::internal(message)
            }
        }
    }
}
