use std::{path::PathBuf, sync::Arc, time::Duration};

use tempfile::TempDir;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc::Sender},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::core::{
    checkers::{
        errors::CheckerError,
        registry::{CheckerRegistry, ResolvedChecker},
    },
    compiler::build_log,
    domain::{
        CaseReport, CaseVerdict, ComparisonMode, ContainerType, GradeEvent, GradeReport,
        GradingRequest, InteractiveResult, LanguageCatalog, Limits, ProcessResult,
        ProgrammingLanguage, RunReport, TaskType, TestCase,
    },
    limits::LimitPolicy,
    pipeline::{
        checking::{ProtocolError, frame_sections, parse_verdict},
        interactive::{SessionOutcome, run_session},
    },
    score::{MAX_RAW_SCORE, clamp_raw},
    traits::{
        compiler::{CompileError, Compiler},
        notifier::{Notification, NotificationLevel, Notifier},
        runner::{Runner, SandboxError},
        sandbox::LaunchSpec,
    },
};

/// Infrastructure faults. Submission and checker misbehaviour are reported as verdicts instead.
#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error("invalid grading request: {msg}")]
    InvalidRequest { msg: String },
    #[error("language `{0}` is not supported")]
    UnsupportedLanguage(String),
    #[error(transparent)]
    Checker(#[from] CheckerError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("submission build could not run: {msg}")]
    Build { msg: String },
    #[error("no execution slot became free within {0:?}")]
    QueueTimeout(Duration),
    #[error("grading was cancelled")]
    Cancelled,
    #[error("workspace i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct GraderSettings {
    pub policy: LimitPolicy,
    pub max_concurrent: usize,
    pub queue_timeout: Duration,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Grader {
    runner: Arc<dyn Runner>,
    compiler: Arc<dyn Compiler>,
    checkers: Arc<CheckerRegistry>,
    catalog: Arc<LanguageCatalog>,
    notifier: Arc<dyn Notifier>,
    policy: LimitPolicy,
    slots: Arc<Semaphore>,
    queue_timeout: Duration,
    work_dir: PathBuf,
}

/// A checker pinned for the duration of one request, with its launch spec.
struct CheckerRun {
    resolved: ResolvedChecker,
    spec: LaunchSpec,
}

enum Plan {
    Compare(ComparisonMode),
    CheckOutput(CheckerRun),
    Interact(CheckerRun),
}

impl Grader {
    pub fn new(
        runner: Arc<dyn Runner>,
        compiler: Arc<dyn Compiler>,
        checkers: Arc<CheckerRegistry>,
        catalog: Arc<LanguageCatalog>,
        notifier: Arc<dyn Notifier>,
        settings: GraderSettings,
    ) -> Self {
        Self {
            runner,
            compiler,
            checkers,
            catalog,
            notifier,
            policy: settings.policy,
            slots: Arc::new(Semaphore::new(settings.max_concurrent)),
            queue_timeout: settings.queue_timeout,
            work_dir: settings.work_dir,
        }
    }

    pub async fn grade(&self, request: GradingRequest) -> Result<GradeReport, GradingError> {
        self.grade_inner(request, None).await
    }

    /// Grades with progress events. Cancelling the token kills whatever is running and
    /// returns [`GradingError::Cancelled`].
    pub async fn grade_with(
        &self,
        request: GradingRequest,
        progress: Option<Sender<GradeEvent>>,
        cancel: &CancellationToken,
    ) -> Result<GradeReport, GradingError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GradingError::Cancelled),
            result = self.grade_inner(request, progress.as_ref()) => result,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(language = %request.language, task_type = ?request.task_type, cases = request.cases.len())
    )]
    async fn grade_inner(
        &self,
        request: GradingRequest,
        progress: Option<&Sender<GradeEvent>>,
    ) -> Result<GradeReport, GradingError> {
        validate(&request)?;
        let language = self.language(&request.language)?;
        let plan = self.plan(&request)?;

        let _slot = self.acquire_slot().await?;
        let workspace = self.workspace().await?;

        tracing::debug!("Start compiling");
        match self
            .compiler
            .compile(&request.code, &language, workspace.path(), ContainerType::User)
            .await
        {
            Ok(_) => emit(progress, GradeEvent::Compiled).await,
            Err(CompileError::CompilationFailed { result }) => {
                let report = GradeReport::compilation_failed(request.max_score(), &build_log(&result));
                tracing::info!("submission failed to compile");
                emit(progress, GradeEvent::Finished(report.clone())).await;
                return Ok(report);
            }
            Err(CompileError::Internal { msg }) => return Err(GradingError::Build { msg }),
        }

        let submission = LaunchSpec::program(
            &language,
            ContainerType::User,
            workspace.path(),
            self.policy.ceilings(ContainerType::User, &request.limits),
        );

        let mut cases = Vec::with_capacity(request.cases.len());
        for (index, case) in request.cases.iter().enumerate() {
            let report = match &plan {
                Plan::Compare(mode) => self.judge_compare(index, case, &submission, *mode).await?,
                Plan::CheckOutput(checker) => {
                    self.judge_output(index, case, &submission, checker).await?
                }
                Plan::Interact(checker) => {
                    self.judge_interactive(index, case, &submission, checker)
                        .await?
                }
            };
            tracing::debug!(index, verdict = ?report.verdict, score = report.score, "case finished");
            emit(progress, GradeEvent::CaseFinished(report.clone())).await;
            cases.push(report);
        }

        let report = GradeReport::from_cases(cases);
        tracing::info!(score = report.score, max_score = report.max_score, "grading finished");
        emit(progress, GradeEvent::Finished(report.clone())).await;
        Ok(report)
    }

    /// Compiles and runs code once against `input`, without test data.
    #[tracing::instrument(skip(self, code, input))]
    pub async fn run(
        &self,
        code: &str,
        language: &str,
        input: &str,
    ) -> Result<RunReport, GradingError> {
        let language = self.language(language)?;
        let _slot = self.acquire_slot().await?;
        let workspace = self.workspace().await?;

        match self
            .compiler
            .compile(code, &language, workspace.path(), ContainerType::User)
            .await
        {
            Ok(_) => {}
            Err(CompileError::CompilationFailed { result }) => {
                return Ok(RunReport {
                    verdict: CaseVerdict::CompilationError,
                    message: build_log(&result),
                    process: Some(result),
                });
            }
            Err(CompileError::Internal { msg }) => return Err(GradingError::Build { msg }),
        }

        let spec = LaunchSpec::program(
            &language,
            ContainerType::User,
            workspace.path(),
            self.policy.ceilings(ContainerType::User, &Limits::default()),
        );
        let result = self.runner.run(&spec, input).await?;
        if result.is_success() {
            return Ok(RunReport {
                verdict: CaseVerdict::Accepted,
                message: String::new(),
                process: Some(result),
            });
        }
        let failed = CaseReport::submission_failed(0, 0.0, result);
        Ok(RunReport {
            verdict: failed.verdict,
            message: failed.message,
            process: failed.process,
        })
    }

    async fn judge_compare(
        &self,
        index: usize,
        case: &TestCase,
        submission: &LaunchSpec,
        mode: ComparisonMode,
    ) -> Result<CaseReport, GradingError> {
        let result = self.runner.run(submission, &case.input).await?;
        if !result.is_success() {
            return Ok(CaseReport::submission_failed(index, case.points, result));
        }
        Ok(if mode.matches(&result.stdout, &case.expected_output) {
            CaseReport::accepted(index, case.points, result)
        } else {
            CaseReport::wrong_answer(index, case.points, result)
        })
    }

    async fn judge_output(
        &self,
        index: usize,
        case: &TestCase,
        submission: &LaunchSpec,
        checker: &CheckerRun,
    ) -> Result<CaseReport, GradingError> {
        let result = self.runner.run(submission, &case.input).await?;
        if !result.is_success() {
            return Ok(CaseReport::submission_failed(index, case.points, result));
        }

        let stdin = frame_sections([
            case.input.as_str(),
            result.stdout.as_str(),
            case.expected_output.as_str(),
        ]);
        let verdict = self.runner.run(&checker.spec, &stdin).await?;
        if !verdict.is_success() {
            let detail = if verdict.timed_out {
                "checker exceeded its time limit".to_string()
            } else {
                format!(
                    "checker exited with code {}: {}",
                    verdict.exit_code,
                    verdict.error_message().trim()
                )
            };
            return Ok(with_process(
                CaseReport::checker_error(index, case.points, detail),
                result,
            ));
        }

        match parse_verdict(&verdict.stdout) {
            Ok(raw) => Ok(with_process(self.scored(index, case, raw, checker), result)),
            Err(e) => {
                self.report_malformed(checker, &e);
                Ok(with_process(
                    CaseReport::checker_error(index, case.points, e.to_string()),
                    result,
                ))
            }
        }
    }

    async fn judge_interactive(
        &self,
        index: usize,
        case: &TestCase,
        submission: &LaunchSpec,
        checker: &CheckerRun,
    ) -> Result<CaseReport, GradingError> {
        let outcome = run_session(&*self.runner, submission, &checker.spec, &case.input).await?;
        Ok(match outcome {
            SessionOutcome::Finished(raw) => self.scored(index, case, raw, checker),
            SessionOutcome::SubmissionFailed { verdict, message } => CaseReport {
                index,
                verdict,
                score: 0.0,
                max_score: case.points,
                message,
                process: None,
            },
            SessionOutcome::CheckerFailed { message } => {
                CaseReport::checker_error(index, case.points, message)
            }
            SessionOutcome::ProtocolViolation(e) => {
                self.report_malformed(checker, &e);
                CaseReport::checker_error(index, case.points, e.to_string())
            }
        })
    }

    /// Clamps the raw score into 0..=100 and scales it to the case's points.
    fn scored(
        &self,
        index: usize,
        case: &TestCase,
        raw: InteractiveResult,
        checker: &CheckerRun,
    ) -> CaseReport {
        let owner = &checker.resolved.checker;
        if raw.score > MAX_RAW_SCORE {
            tracing::warn!(checker_id = owner.id, score = raw.score, "checker score above maximum");
            self.notifier.notify(Notification {
                recipient: owner.owner,
                level: NotificationLevel::Critical,
                title: format!("Checker \"{}\" reported an out-of-range score", owner.name),
                body: format!(
                    "Reported {} where at most {MAX_RAW_SCORE} is allowed. The score was capped.",
                    raw.score
                ),
            });
        } else if raw.score < 0.0 {
            tracing::warn!(checker_id = owner.id, score = raw.score, "negative checker score");
        }

        let clamped = clamp_raw(raw.score);
        let verdict = if clamped >= MAX_RAW_SCORE {
            CaseVerdict::Accepted
        } else if clamped <= 0.0 {
            CaseVerdict::WrongAnswer
        } else {
            CaseVerdict::Scored
        };
        CaseReport {
            index,
            verdict,
            score: raw.real_score(case.points),
            max_score: case.points,
            message: raw.message,
            process: None,
        }
    }

    fn report_malformed(&self, checker: &CheckerRun, error: &ProtocolError) {
        let owner = &checker.resolved.checker;
        tracing::warn!(checker_id = owner.id, error = %error, "malformed checker output");
        self.notifier.notify(Notification {
            recipient: owner.owner,
            level: NotificationLevel::Warn,
            title: format!("Checker \"{}\" produced malformed output", owner.name),
            body: error.to_string(),
        });
    }

    fn plan(&self, request: &GradingRequest) -> Result<Plan, GradingError> {
        if !request.task_type.needs_checker() {
            return Ok(Plan::Compare(request.comparison));
        }
        let checker_id = request.checker_id.ok_or_else(|| GradingError::InvalidRequest {
            msg: "this task type requires a checker".to_string(),
        })?;
        let resolved = self.checkers.resolve(checker_id)?;
        let language = self.language(&resolved.checker.language)?;
        let spec = LaunchSpec::program(
            &language,
            ContainerType::Checker,
            resolved.artifact.dir(),
            self.policy.ceilings(ContainerType::Checker, &request.limits),
        )
        .read_only();
        let run = CheckerRun { resolved, spec };
        Ok(match request.task_type {
            TaskType::FullInteractive => Plan::Interact(run),
            _ => Plan::CheckOutput(run),
        })
    }

    fn language(&self, id: &str) -> Result<ProgrammingLanguage, GradingError> {
        self.catalog
            .get(id)
            .cloned()
            .ok_or_else(|| GradingError::UnsupportedLanguage(id.to_string()))
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, GradingError> {
        match timeout(self.queue_timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(GradingError::Cancelled),
            Err(_) => {
                tracing::warn!(waited = ?self.queue_timeout, "no execution slot available");
                Err(GradingError::QueueTimeout(self.queue_timeout))
            }
        }
    }

    async fn workspace(&self) -> Result<TempDir, GradingError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        Ok(tempfile::Builder::new()
            .prefix("submission-")
            .tempdir_in(&self.work_dir)?)
    }
}

fn validate(request: &GradingRequest) -> Result<(), GradingError> {
    let invalid = |msg: &str| GradingError::InvalidRequest {
        msg: msg.to_string(),
    };
    if request.cases.is_empty() {
        return Err(invalid("at least one test case is required"));
    }
    if request
        .cases
        .iter()
        .any(|case| !case.points.is_finite() || case.points < 0.0)
    {
        return Err(invalid("case points must be a non-negative number"));
    }
    if request.limits.time_limit.is_some_and(|limit| limit.is_zero()) {
        return Err(invalid("time limit must be positive"));
    }
    if request.limits.memory_limit_mb == Some(0) {
        return Err(invalid("memory limit must be positive"));
    }
    Ok(())
}

fn with_process(mut report: CaseReport, process: ProcessResult) -> CaseReport {
    report.process = Some(process);
    report
}

async fn emit(progress: Option<&Sender<GradeEvent>>, event: GradeEvent) {
    if let Some(progress) = progress {
        if progress.send(event).await.is_err() {
            tracing::debug!("progress receiver dropped");
        }
    }
}
