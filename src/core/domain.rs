use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::constants::MEMORY_LIMIT_EXIT_CODE;

pub type CheckerId = u64;
pub type OwnerId = u64;

/// Outcome of one sandboxed process.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Standard error when it has content, standard output otherwise.
    pub fn error_message(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    pub fn into_result(self) -> Result<ProcessResult, ProcessFailed> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProcessFailed { result: self })
        }
    }

    /// Verdict for a submission that did not finish cleanly.
    pub fn failure_verdict(&self) -> CaseVerdict {
        if self.timed_out {
            CaseVerdict::TimeLimitExceeded
        } else if self.exit_code == MEMORY_LIMIT_EXIT_CODE {
            CaseVerdict::MemoryLimitExceeded
        } else {
            CaseVerdict::RuntimeError
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("process exited with code {}: {}", .result.exit_code, .result.error_message().trim())]
pub struct ProcessFailed {
    pub result: ProcessResult,
}

/// Raw result reported by a checker, on the 0..=100 scale.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractiveResult {
    pub score: f64,
    pub message: String,
}

impl InteractiveResult {
    pub fn new(score: f64, message: impl Into<String>) -> Self {
        Self {
            score,
            message: message.into(),
        }
    }

    pub fn real_score(&self, max_score: f64) -> f64 {
        crate::core::score::real_score(self.score, max_score)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    NonInteractive,
    FullInteractive,
    OutputChecking,
}

impl TaskType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::NonInteractive),
            1 => Some(Self::FullInteractive),
            2 => Some(Self::OutputChecking),
            _ => None,
        }
    }

    pub fn needs_checker(self) -> bool {
        !matches!(self, Self::NonInteractive)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerType {
    User,
    Checker,
}

impl ContainerType {
    /// Value exported to the sandboxed process so shared images can tell roles apart.
    pub fn script_run_type(self) -> &'static str {
        match self {
            Self::User => "run_user",
            Self::Checker => "run_checker",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProgrammingLanguage {
    pub id: String,
    #[serde(default)]
    pub server_id: Option<u32>,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub editor_id: Option<String>,
    pub image: String,
    pub source_file: String,
    #[serde(default)]
    pub build: Option<Vec<String>>,
    pub run: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LanguageCatalog {
    languages: HashMap<String, ProgrammingLanguage>,
}

impl LanguageCatalog {
    pub fn new(languages: impl IntoIterator<Item = ProgrammingLanguage>) -> Self {
        Self {
            languages: languages
                .into_iter()
                .map(|language| (language.id.clone(), language))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ProgrammingLanguage> {
        self.languages.get(id)
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checker {
    pub id: CheckerId,
    pub owner: OwnerId,
    pub name: String,
    pub language: String,
    pub size_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Building,
    Ready,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    pub points: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ComparisonMode {
    Exact,
    #[default]
    Normalized,
}

impl ComparisonMode {
    pub fn matches(self, actual: &str, expected: &str) -> bool {
        match self {
            Self::Exact => actual == expected,
            Self::Normalized => normalize(actual) == normalize(expected),
        }
    }
}

/// Drops trailing whitespace on every line and trailing blank lines.
fn normalize(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

/// Per-request overrides of the global container limits.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Limits {
    pub memory_limit_mb: Option<u32>,
    pub time_limit: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GradingRequest {
    pub code: String,
    pub language: String,
    pub task_type: TaskType,
    pub cases: Vec<TestCase>,
    pub checker_id: Option<CheckerId>,
    pub limits: Limits,
    pub comparison: ComparisonMode,
}

impl GradingRequest {
    pub fn max_score(&self) -> f64 {
        self.cases.iter().map(|case| case.points).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseVerdict {
    Accepted,
    WrongAnswer,
    Scored,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CheckerError,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaseReport {
    pub index: usize,
    pub verdict: CaseVerdict,
    pub score: f64,
    pub max_score: f64,
    pub message: String,
    pub process: Option<ProcessResult>,
}

impl CaseReport {
    pub fn accepted(index: usize, max_score: f64, process: ProcessResult) -> Self {
        Self {
            index,
            verdict: CaseVerdict::Accepted,
            score: max_score,
            max_score,
            message: String::new(),
            process: Some(process),
        }
    }

    pub fn wrong_answer(index: usize, max_score: f64, process: ProcessResult) -> Self {
        Self {
            index,
            verdict: CaseVerdict::WrongAnswer,
            score: 0.0,
            max_score,
            message: "output does not match the expected answer".to_string(),
            process: Some(process),
        }
    }

    pub fn submission_failed(index: usize, max_score: f64, process: ProcessResult) -> Self {
        let verdict = process.failure_verdict();
        let message = match verdict {
            CaseVerdict::TimeLimitExceeded => "time limit exceeded".to_string(),
            CaseVerdict::MemoryLimitExceeded => "memory limit exceeded".to_string(),
            _ => format!(
                "runtime error (exit code {}): {}",
                process.exit_code,
                process.error_message().trim()
            ),
        };
        Self {
            index,
            verdict,
            score: 0.0,
            max_score,
            message,
            process: Some(process),
        }
    }

    pub fn checker_error(index: usize, max_score: f64, detail: impl AsRef<str>) -> Self {
        Self {
            index,
            verdict: CaseVerdict::CheckerError,
            score: 0.0,
            max_score,
            message: format!("checker error: {}", detail.as_ref()),
            process: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == CaseVerdict::Accepted
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GradeReport {
    pub score: f64,
    pub max_score: f64,
    pub message: String,
    pub cases: Vec<CaseReport>,
}

impl GradeReport {
    pub fn from_cases(cases: Vec<CaseReport>) -> Self {
        let passed = cases.iter().filter(|case| case.passed()).count();
        Self {
            score: cases.iter().map(|case| case.score).sum(),
            max_score: cases.iter().map(|case| case.max_score).sum(),
            message: format!("passed {passed}/{} cases", cases.len()),
            cases,
        }
    }

    pub fn compilation_failed(max_score: f64, diagnostics: &str) -> Self {
        Self {
            score: 0.0,
            max_score,
            message: format!("compilation error: {}", diagnostics.trim()),
            cases: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GradeEvent {
    Compiled,
    CaseFinished(CaseReport),
    Finished(GradeReport),
}

/// Result of an ad-hoc run without test data.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub verdict: CaseVerdict,
    pub message: String,
    pub process: Option<ProcessResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stdout: &str, stderr: &str) -> ProcessResult {
        ProcessResult {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_error_message_prefers_stderr() {
        assert_eq!(result(1, "out", "boom").error_message(), "boom");
        assert_eq!(result(1, "out", "  \n").error_message(), "out");
    }

    #[test]
    fn test_into_result_keeps_failed_process() {
        let failed = result(2, "", "bad").into_result().unwrap_err();
        assert_eq!(failed.result.exit_code, 2);
        assert_eq!(failed.to_string(), "process exited with code 2: bad");
        assert!(result(0, "", "").into_result().is_ok());
    }

    #[test]
    fn test_failure_verdict() {
        let mut timed_out = result(124, "", "");
        timed_out.timed_out = true;
        assert_eq!(timed_out.failure_verdict(), CaseVerdict::TimeLimitExceeded);
        assert_eq!(
            result(137, "", "").failure_verdict(),
            CaseVerdict::MemoryLimitExceeded
        );
        assert_eq!(result(1, "", "").failure_verdict(), CaseVerdict::RuntimeError);
    }

    #[test]
    fn test_task_type_codes() {
        assert_eq!(TaskType::from_code(1), Some(TaskType::FullInteractive));
        assert_eq!(TaskType::from_code(7), None);
        assert!(!TaskType::NonInteractive.needs_checker());
        assert!(TaskType::OutputChecking.needs_checker());
    }

    #[test]
    fn test_normalized_comparison() {
        let mode = ComparisonMode::Normalized;
        assert!(mode.matches("1 2 \n3\n\n\n", "1 2\n3"));
        assert!(!mode.matches("1 2\n3", "1 2\n 3"));
        assert!(!ComparisonMode::Exact.matches("1\n", "1"));
        assert!(ComparisonMode::Exact.matches("1\n", "1\n"));
    }

    #[test]
    fn test_report_totals() {
        let cases = vec![
            CaseReport::accepted(0, 40.0, ProcessResult::default()),
            CaseReport::wrong_answer(1, 60.0, ProcessResult::default()),
        ];
        let report = GradeReport::from_cases(cases);
        assert_eq!(report.score, 40.0);
        assert_eq!(report.max_score, 100.0);
        assert_eq!(report.message, "passed 1/2 cases");
    }

    #[test]
    fn test_checker_error_message_prefix() {
        let report = CaseReport::checker_error(3, 10.0, "exited with code 2");
        assert_eq!(report.score, 0.0);
        assert!(report.message.starts_with("checker error"));
    }
}
