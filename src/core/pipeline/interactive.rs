use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    process::{ChildStdin, ChildStdout},
    time::{Duration, Instant, timeout, timeout_at},
};

use crate::{
    constants::{EXIT_GRACE, MEMORY_LIMIT_EXIT_CODE, OUTPUT_GRACE},
    core::{
        domain::{CaseVerdict, InteractiveResult},
        pipeline::checking::{CheckerLine, ProtocolError, frame_section, parse_checker_line},
        streams::{collect, read_capped, read_line_capped},
        traits::{
            runner::{Runner, SandboxError, SandboxProcess, exit_code},
            sandbox::LaunchSpec,
        },
    },
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Finished(InteractiveResult),
    SubmissionFailed {
        verdict: CaseVerdict,
        message: String,
    },
    CheckerFailed {
        message: String,
    },
    ProtocolViolation(ProtocolError),
}

/// Runs one interactive session between a checker and a submission.
///
/// The submission may spend at most its own time limit waiting on replies, summed over all
/// rounds. The whole session is bounded by the checker's time limit. Both processes are
/// killed before this returns, whatever the outcome.
#[tracing::instrument(skip_all)]
pub async fn run_session(
    runner: &dyn Runner,
    submission: &LaunchSpec,
    checker: &LaunchSpec,
    input: &str,
) -> Result<SessionOutcome, SandboxError> {
    let deadline = Instant::now() + checker.time_limit;
    let mut checker_process = runner.spawn(checker).await?;
    let mut submission_process = runner.spawn(submission).await?;

    let (Some(checker_in), Some(checker_out), Some(submission_in), Some(submission_out)) = (
        checker_process.take_stdin(),
        checker_process.take_stdout(),
        submission_process.take_stdin(),
        submission_process.take_stdout(),
    ) else {
        return Err(SandboxError::Spawn {
            msg: "interactive processes need piped stdio".to_string(),
        });
    };
    let checker_stderr = tokio::spawn(read_capped(
        checker_process.take_stderr(),
        checker.output_limit,
    ));
    let submission_stderr = tokio::spawn(read_capped(
        submission_process.take_stderr(),
        submission.output_limit,
    ));

    let mut relay = Relay {
        checker_in,
        checker_out: BufReader::new(checker_out),
        submission_in,
        submission_out: BufReader::new(submission_out),
        deadline,
        ceiling: checker.time_limit,
        budget: submission.time_limit,
        checker_line_limit: checker.output_limit,
        submission_line_limit: submission.output_limit,
    };
    let outcome = relay.run(input, &mut submission_process).await;
    drop(relay);

    checker_process.terminate().await;
    submission_process.terminate().await;
    tracing::debug!(outcome = ?outcome, "interactive session ended");

    Ok(match outcome {
        SessionOutcome::CheckerFailed { message } => SessionOutcome::CheckerFailed {
            message: with_diagnostics(message, collect(checker_stderr).await),
        },
        SessionOutcome::SubmissionFailed {
            verdict: CaseVerdict::RuntimeError,
            message,
        } => SessionOutcome::SubmissionFailed {
            verdict: CaseVerdict::RuntimeError,
            message: with_diagnostics(message, collect(submission_stderr).await),
        },
        other => other,
    })
}

fn with_diagnostics(message: String, stderr: Vec<u8>) -> String {
    let stderr = String::from_utf8_lossy(&stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message
    } else {
        format!("{message}: {stderr}")
    }
}

struct Relay {
    checker_in: ChildStdin,
    checker_out: BufReader<ChildStdout>,
    submission_in: ChildStdin,
    submission_out: BufReader<ChildStdout>,
    deadline: Instant,
    ceiling: Duration,
    budget: Duration,
    checker_line_limit: usize,
    submission_line_limit: usize,
}

impl Relay {
    async fn run(&mut self, input: &str, submission: &mut SandboxProcess) -> SessionOutcome {
        let opening = frame_section(input);
        if let Err(message) = self.send_to_checker(opening.as_bytes()).await {
            return message;
        }

        let mut rounds = 0usize;
        loop {
            let line = match timeout_at(
                self.deadline,
                read_line_capped(&mut self.checker_out, self.checker_line_limit),
            )
            .await
            {
                Err(_) => return self.ceiling_exceeded(),
                Ok(Err(e)) => {
                    return SessionOutcome::CheckerFailed {
                        message: format!("failed to read checker output: {e}"),
                    };
                }
                Ok(Ok(None)) => {
                    return SessionOutcome::CheckerFailed {
                        message: "checker exited without reporting a result".to_string(),
                    };
                }
                Ok(Ok(Some(line))) => line,
            };

            let prompt = match parse_checker_line(&line) {
                Ok(CheckerLine::Final(result)) => {
                    tracing::debug!(rounds, score = result.score, "checker reported a result");
                    return SessionOutcome::Finished(result);
                }
                Ok(CheckerLine::Prompt(prompt)) => prompt,
                Err(e) => return SessionOutcome::ProtocolViolation(e),
            };
            rounds += 1;

            let mut reply = match self.ask_submission(&prompt, submission).await {
                Ok(reply) => reply,
                Err(outcome) => return outcome,
            };
            reply.push(b'\n');
            if let Err(outcome) = self.send_to_checker(&reply).await {
                return outcome;
            }
        }
    }

    async fn send_to_checker(&mut self, bytes: &[u8]) -> Result<(), SessionOutcome> {
        match timeout_at(self.deadline, write_flushed(&mut self.checker_in, bytes)).await {
            Err(_) => Err(self.ceiling_exceeded()),
            Ok(Err(_)) => Err(SessionOutcome::CheckerFailed {
                message: "checker stopped reading its input".to_string(),
            }),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Forwards one prompt and waits for one reply line, charging the wait to the submission.
    async fn ask_submission(
        &mut self,
        prompt: &[u8],
        submission: &mut SandboxProcess,
    ) -> Result<Vec<u8>, SessionOutcome> {
        let started = Instant::now();
        let remaining = self.deadline.saturating_duration_since(started);
        // Past the session deadline the checker used up the time, not the submission.
        let ceiling_binds = remaining < self.budget;
        let allowed = self.budget.min(remaining);

        let exchange = async {
            let mut line = Vec::with_capacity(prompt.len() + 1);
            line.extend_from_slice(prompt);
            line.push(b'\n');
            if write_flushed(&mut self.submission_in, &line).await.is_err() {
                return Ok(None);
            }
            read_line_capped(&mut self.submission_out, self.submission_line_limit).await
        };
        let exchanged = timeout(allowed, exchange).await;
        self.budget = self.budget.saturating_sub(started.elapsed());

        match exchanged {
            Err(_) if ceiling_binds => Err(self.ceiling_exceeded()),
            Err(_) => Err(SessionOutcome::SubmissionFailed {
                verdict: CaseVerdict::TimeLimitExceeded,
                message: "time limit exceeded while waiting for a reply".to_string(),
            }),
            Ok(Err(e)) => Err(SessionOutcome::SubmissionFailed {
                verdict: CaseVerdict::RuntimeError,
                message: format!("failed to read submission output: {e}"),
            }),
            Ok(Ok(None)) => Err(submission_exited(submission).await),
            Ok(Ok(Some(reply))) => Ok(reply),
        }
    }

    fn ceiling_exceeded(&self) -> SessionOutcome {
        SessionOutcome::CheckerFailed {
            message: format!(
                "interaction exceeded the combined time limit of {:.1}s",
                self.ceiling.as_secs_f64()
            ),
        }
    }
}

async fn write_flushed<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn submission_exited(submission: &mut SandboxProcess) -> SessionOutcome {
    let code = match timeout(EXIT_GRACE + OUTPUT_GRACE, submission.wait()).await {
        Ok(Ok(status)) => Some(exit_code(status)),
        _ => None,
    };
    match code {
        Some(MEMORY_LIMIT_EXIT_CODE) => SessionOutcome::SubmissionFailed {
            verdict: CaseVerdict::MemoryLimitExceeded,
            message: "memory limit exceeded".to_string(),
        },
        Some(code) => SessionOutcome::SubmissionFailed {
            verdict: CaseVerdict::RuntimeError,
            message: format!("submission exited with code {code} before the interaction finished"),
        },
        None => SessionOutcome::SubmissionFailed {
            verdict: CaseVerdict::RuntimeError,
            message: "submission closed its output before the interaction finished".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::*;
    use crate::{
        core::{domain::ContainerType, limits::Ceilings, runner::ProcessRunner},
        native::sandbox::NativeSandbox,
    };

    fn script(
        dir: &Path,
        container_type: ContainerType,
        body: &str,
        time_limit: Duration,
    ) -> LaunchSpec {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("main.sh"), body).unwrap();
        LaunchSpec::new(
            "native",
            container_type,
            dir,
            vec!["sh".to_string(), "main.sh".to_string()],
            Ceilings {
                memory_limit_mb: 256,
                time_limit,
                output_limit: 4096,
            },
        )
    }

    struct Session {
        dir: tempfile::TempDir,
        submission: LaunchSpec,
        checker: LaunchSpec,
    }

    fn session(submission: &str, submission_limit: Duration, checker: &str, ceiling: Duration) -> Session {
        let dir = tempfile::tempdir().unwrap();
        let submission = script(
            &dir.path().join("submission"),
            ContainerType::User,
            submission,
            submission_limit,
        );
        let checker = script(&dir.path().join("checker"), ContainerType::Checker, checker, ceiling);
        Session {
            dir,
            submission,
            checker,
        }
    }

    async fn run(session: &Session, input: &str) -> SessionOutcome {
        let runner = ProcessRunner::new(Arc::new(NativeSandbox::new()));
        run_session(&runner, &session.submission, &session.checker, input)
            .await
            .unwrap()
    }

    fn assert_dead(pid_file: &Path) {
        let pid: i32 = std::fs::read_to_string(pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0, "process {pid} is still alive");
    }

    const ECHO_CHECKER: &str = r#"read len
read secret
echo "? $secret"
read reply
if [ "$reply" = "pong $secret" ]; then echo "! 100 well done"; else echo "! 0 got $reply"; fi
"#;

    #[tokio::test]
    async fn test_checker_verdict_is_returned() {
        let session = session(
            "read prompt\necho \"pong $prompt\"\n",
            Duration::from_secs(2),
            ECHO_CHECKER,
            Duration::from_secs(5),
        );

        let outcome = run(&session, "7\n").await;

        assert_eq!(
            outcome,
            SessionOutcome::Finished(InteractiveResult::new(100.0, "well done"))
        );
    }

    #[tokio::test]
    async fn test_multiple_rounds() {
        let checker = r#"read len
read n
i=0
total=0
while [ $i -lt $n ]; do
  echo "? $i"
  read reply
  total=$((total + reply))
  i=$((i + 1))
done
echo "! $total sum of doubles"
"#;
        let submission = "while read x; do echo $((x * 2)); done\n";
        let session = session(submission, Duration::from_secs(2), checker, Duration::from_secs(5));

        let outcome = run(&session, "5\n").await;

        assert_eq!(
            outcome,
            SessionOutcome::Finished(InteractiveResult::new(20.0, "sum of doubles"))
        );
    }

    #[tokio::test]
    async fn test_checker_crash_mid_exchange_kills_both() {
        let session = session(
            "echo $$ > pid\nread prompt\necho pong\nsleep 30\n",
            Duration::from_secs(2),
            "echo $$ > pid\nread len\nread secret\necho '? ping'\nread reply\necho broken >&2\nexit 3\n",
            Duration::from_secs(5),
        );
        let started = Instant::now();

        let outcome = run(&session, "1\n").await;

        assert_eq!(
            outcome,
            SessionOutcome::CheckerFailed {
                message: "checker exited without reporting a result: broken".to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_dead(&session.dir.path().join("submission").join("pid"));
        assert_dead(&session.dir.path().join("checker").join("pid"));
    }

    #[tokio::test]
    async fn test_silent_submission_runs_out_of_budget() {
        let session = session(
            "echo $$ > pid\nread prompt\nsleep 30\n",
            Duration::from_secs(1),
            ECHO_CHECKER,
            Duration::from_secs(10),
        );
        let started = Instant::now();

        let outcome = run(&session, "7\n").await;

        assert!(matches!(
            outcome,
            SessionOutcome::SubmissionFailed {
                verdict: CaseVerdict::TimeLimitExceeded,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_dead(&session.dir.path().join("submission").join("pid"));
    }

    #[tokio::test]
    async fn test_stalled_checker_hits_combined_ceiling() {
        let session = session(
            "read prompt\necho pong\n",
            Duration::from_secs(1),
            "read len\nread secret\nsleep 30\n",
            Duration::from_secs(2),
        );
        let started = Instant::now();

        let outcome = run(&session, "7\n").await;

        assert_eq!(
            outcome,
            SessionOutcome::CheckerFailed {
                message: "interaction exceeded the combined time limit of 2.0s".to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_slow_checker_is_not_charged_to_submission() {
        let session = session(
            "read prompt\nsleep 0.8\necho pong\n",
            Duration::from_secs(1),
            "read len\nread secret\nsleep 1.5\necho '? ping'\nread reply\necho '! 100 ok'\n",
            Duration::from_secs(2),
        );

        let outcome = run(&session, "7\n").await;

        assert_eq!(
            outcome,
            SessionOutcome::CheckerFailed {
                message: "interaction exceeded the combined time limit of 2.0s".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_submission_crash_is_runtime_error() {
        let session = session(
            "echo fatal >&2\nexit 1\n",
            Duration::from_secs(2),
            ECHO_CHECKER,
            Duration::from_secs(5),
        );

        let outcome = run(&session, "7\n").await;

        match outcome {
            SessionOutcome::SubmissionFailed { verdict, message } => {
                assert_eq!(verdict, CaseVerdict::RuntimeError);
                assert!(message.ends_with(": fatal"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_checker_line() {
        let session = session(
            "read prompt\necho pong\n",
            Duration::from_secs(2),
            "read len\nread secret\necho hello\n",
            Duration::from_secs(5),
        );

        let outcome = run(&session, "7\n").await;

        assert_eq!(
            outcome,
            SessionOutcome::ProtocolViolation(ProtocolError::UnexpectedLine("hello".to_string()))
        );
    }
}
