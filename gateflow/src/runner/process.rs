//! [`ToolRunner`] backed by real child processes.

use super::{CommandInvocation, CommandOutcome, ToolRunner};
use crate::cancellation::CancellationToken;
use crate::context::Redactor;
use crate::errors::InfrastructureError;
use crate::utils::elapsed_ms;
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines longer than this are truncated.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default cap on captured bytes per stream; older lines are dropped first.
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Default SIGTERM-to-SIGKILL grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs commands as child processes in their own process group.
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    grace_period: Duration,
    max_capture_bytes: usize,
}

impl Default for ProcessToolRunner {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

impl ProcessToolRunner {
    /// Creates a runner with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the per-stream capture cap.
    #[must_use]
    pub fn with_max_capture_bytes(mut self, bytes: usize) -> Self {
        self.max_capture_bytes = bytes;
        self
    }
}

enum ExitReason {
    Completed(std::process::ExitStatus),
    WaitError(io::Error),
    Timeout,
    Cancelled,
}

enum Drain {
    Done((String, String)),
    Overran,
    Cancelled,
}

async fn sleep_or_pending(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn execute(
        &self,
        invocation: &CommandInvocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, InfrastructureError> {
        if !invocation.workdir.is_dir() {
            return Err(InfrastructureError::spawn(
                &invocation.program,
                format!(
                    "working directory {} does not exist",
                    invocation.workdir.display()
                ),
            ));
        }

        let command_line = invocation.redactor.redact(&invocation.command_line());
        info!(stage = %invocation.stage, command = %command_line, "Running command");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child: AsyncGroupChild = cmd.group_spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                InfrastructureError::ToolNotFound {
                    program: invocation.program.clone(),
                }
            } else {
                InfrastructureError::spawn(&invocation.program, e.to_string())
            }
        })?;

        let pid = child.inner().id();
        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let stdout_handle = tokio::spawn(capture_stream(
            stdout,
            invocation.stage.clone(),
            "stdout",
            invocation.redactor.clone(),
            self.max_capture_bytes,
        ));
        let stderr_handle = tokio::spawn(capture_stream(
            stderr,
            invocation.stage.clone(),
            "stderr",
            invocation.redactor.clone(),
            self.max_capture_bytes,
        ));
        let aborts = [stdout_handle.abort_handle(), stderr_handle.abort_handle()];
        let mut captures = Box::pin(async move {
            let (out, err) = tokio::join!(stdout_handle, stderr_handle);
            (out.unwrap_or_default(), err.unwrap_or_default())
        });

        let deadline = invocation.timeout;
        let exit_reason = tokio::select! {
            wait_result = child.wait() => match wait_result {
                Ok(status) => ExitReason::Completed(status),
                Err(e) => ExitReason::WaitError(e),
            },
            () = sleep_or_pending(deadline) => ExitReason::Timeout,
            () = cancel.cancelled() => ExitReason::Cancelled,
        };
        let leader_exited = matches!(exit_reason, ExitReason::Completed(_));

        let mut outcome = CommandOutcome::default();
        match exit_reason {
            ExitReason::Completed(status) => outcome.exit_code = status.code(),
            ExitReason::WaitError(e) => {
                warn!(stage = %invocation.stage, error = %e, "Waiting for command failed");
                terminate_process_group(&mut child, self.grace_period).await;
            }
            ExitReason::Timeout => {
                warn!(
                    stage = %invocation.stage,
                    command = %command_line,
                    timeout_ms = deadline.map_or(0, |d| d.as_millis()),
                    "Command timed out"
                );
                terminate_process_group(&mut child, self.grace_period).await;
                outcome.timed_out = true;
            }
            ExitReason::Cancelled => {
                info!(stage = %invocation.stage, command = %command_line, "Command cancelled");
                terminate_process_group(&mut child, self.grace_period).await;
                outcome.cancelled = true;
            }
        }

        // Processes that outlive the leader keep the pipes open. The deadline
        // still applies to them, and so does cancellation.
        let drain_limit = if leader_exited {
            deadline.map(|d| d.saturating_sub(start.elapsed()))
        } else {
            Some(self.grace_period)
        };
        let drain = tokio::select! {
            biased;
            captured = &mut captures => Drain::Done(captured),
            () = sleep_or_pending(drain_limit) => Drain::Overran,
            () = cancel.cancelled(), if leader_exited => Drain::Cancelled,
        };
        let overran = matches!(drain, Drain::Overran);
        let (stdout, stderr) = match drain {
            Drain::Done(captured) => captured,
            Drain::Overran | Drain::Cancelled => {
                if leader_exited {
                    if overran {
                        warn!(
                            stage = %invocation.stage,
                            command = %command_line,
                            "Background processes held the output open past the timeout"
                        );
                        outcome.timed_out = true;
                    } else {
                        info!(stage = %invocation.stage, command = %command_line, "Command cancelled");
                        outcome.cancelled = true;
                    }
                }
                kill_process_group(pid);
                match tokio::time::timeout(self.grace_period, &mut captures).await {
                    Ok(captured) => captured,
                    Err(_) => {
                        warn!(stage = %invocation.stage, "Output pipes still open, discarding capture");
                        for abort in &aborts {
                            abort.abort();
                        }
                        captures.await
                    }
                }
            }
        };
        outcome.stdout = stdout;
        outcome.stderr = stderr;
        outcome.duration_ms = elapsed_ms(start);

        debug!(
            stage = %invocation.stage,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration_ms,
            "Command finished"
        );
        Ok(outcome)
    }
}

/// Streams a pipe line by line to the log and keeps the redacted tail.
async fn capture_stream<R>(
    pipe: Option<R>,
    stage: String,
    stream: &'static str,
    redactor: Redactor,
    max_bytes: usize,
) -> String
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut reader = BufReader::new(pipe);
    let mut buffer = Vec::new();
    let mut kept: VecDeque<String> = VecDeque::new();
    let mut kept_bytes = 0usize;
    let mut dropped = false;

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let mut line = redactor.redact(&String::from_utf8_lossy(&buffer));
                if line.len() > MAX_LINE_LENGTH {
                    let mut cut = MAX_LINE_LENGTH;
                    while !line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    line.truncate(cut);
                    line.push_str("... [truncated]\n");
                }
                debug!(stage = %stage, stream, "{}", line.trim_end());

                kept_bytes += line.len();
                kept.push_back(line);
                while kept_bytes > max_bytes {
                    match kept.pop_front() {
                        Some(old) => {
                            kept_bytes -= old.len();
                            dropped = true;
                        }
                        None => break,
                    }
                }
            }
            Err(e) => {
                warn!(stage = %stage, stream, error = %e, "Error reading command output");
                break;
            }
        }
    }

    let mut collected = String::with_capacity(kept_bytes + 32);
    if dropped {
        collected.push_str("... [earlier output truncated]\n");
    }
    collected.extend(kept);
    collected
}

/// Sends `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(Pid::from_raw(-raw), signal) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, signal = ?signal, error = ?e, "Signalling process group failed");
            false
        }
    }
}

/// Kills whatever is left of a process group, leader reaped or not.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Terminates a process group: SIGTERM, grace period, then SIGKILL.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pid) = child.inner().id() else {
        return;
    };
    if i32::try_from(pid).is_err() {
        let _ = child.kill().await;
        return;
    }

    signal_group(pid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            // The leader is gone; stragglers in its group get no grace.
            signal_group(pid, Signal::SIGKILL);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    signal_group(pid, Signal::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::SecretSet;
    use std::sync::Arc;

    fn sh(script: &str) -> CommandInvocation {
        CommandInvocation::new("test", "sh", std::env::temp_dir()).with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let runner = ProcessToolRunner::new();
        let token = CancellationToken::new();
        let outcome = runner
            .execute(&sh("echo out; echo err >&2; exit 3"), &token)
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_secrets_redacted_from_capture() {
        let secrets = SecretSet::new().with_secret("TOKEN", "hunter2");
        let invocation = sh("echo token is $TOKEN")
            .with_env("TOKEN", "hunter2")
            .with_redactor(secrets.redactor());

        let outcome = ProcessToolRunner::new()
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stdout, "token is ***\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let runner = ProcessToolRunner::new().with_grace_period(Duration::from_millis(100));
        let invocation = sh("sleep 30").with_timeout(Duration::from_millis(100));
        let started = Instant::now();

        let outcome = runner.execute(&invocation, &CancellationToken::new()).await.unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_child_cannot_outlive_timeout() {
        let runner = ProcessToolRunner::new().with_grace_period(Duration::from_millis(100));
        let invocation = sh("sleep 4 & echo started").with_timeout(Duration::from_millis(500));
        let started = Instant::now();

        let outcome = runner.execute(&invocation, &CancellationToken::new()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert_eq!(outcome.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_cancellation_reaches_background_child() {
        let runner = ProcessToolRunner::new().with_grace_period(Duration::from_millis(100));
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = Arc::clone(&token);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                token.cancel("interrupted");
            })
        };
        let started = Instant::now();

        let outcome = runner.execute(&sh("sleep 4 & echo started"), &token).await.unwrap();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_secret_split_by_line_truncation_is_still_masked() {
        let secret = "s3cr3t-value";
        let secrets = SecretSet::new().with_secret("TOKEN", secret);
        let padding = MAX_LINE_LENGTH - 2;
        let script = format!("printf '%{padding}s' x; printf '%s\\n' \"$TOKEN\"");
        let invocation = sh(&script)
            .with_env("TOKEN", secret)
            .with_redactor(secrets.redactor());

        let outcome = ProcessToolRunner::new()
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.stdout.ends_with("... [truncated]\n"));
        assert!(!outcome.stdout.contains("s3"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_group() {
        let runner = ProcessToolRunner::new().with_grace_period(Duration::from_millis(100));
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = Arc::clone(&token);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel("interrupted");
            })
        };

        let outcome = runner.execute(&sh("sleep 30"), &token).await.unwrap();
        canceller.await.unwrap();

        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_is_infrastructure_error() {
        let invocation =
            CommandInvocation::new("test", "definitely-not-a-real-tool-4f1c", std::env::temp_dir());
        let err = ProcessToolRunner::new()
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InfrastructureError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_capture_keeps_tail() {
        let runner = ProcessToolRunner::new().with_max_capture_bytes(16);
        let outcome = runner
            .execute(&sh("for i in 1 2 3 4 5 6 7 8; do echo line$i; done"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.stdout.starts_with("... [earlier output truncated]"));
        assert!(outcome.stdout.ends_with("line8\n"));
    }
}
