//! Inputs and outputs of one external command.

use crate::context::Redactor;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A fully resolved command ready to spawn.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    /// Stage that issued the command, for log context.
    pub stage: String,
    /// Program name or path.
    pub program: String,
    /// Arguments after substitution.
    pub args: Vec<String>,
    /// Extra environment, including injected secrets.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub workdir: PathBuf,
    /// Remaining stage budget, if the stage has one.
    pub timeout: Option<Duration>,
    /// Redacts secret values from captured and logged output.
    pub redactor: Redactor,
}

impl CommandInvocation {
    /// Creates an invocation with no args, env or timeout.
    #[must_use]
    pub fn new(stage: impl Into<String>, program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: workdir.into(),
            timeout: None,
            redactor: Redactor::default(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the redactor.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Program and arguments as one display string. Never includes env.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%${}".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// What happened when a command ran.
///
/// A non-zero exit is still an outcome; only spawn failures are errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Redacted stdout (possibly truncated to its tail).
    pub stdout: String,
    /// Redacted stderr (possibly truncated to its tail).
    pub stderr: String,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// The timeout elapsed and the process group was killed.
    pub timed_out: bool,
    /// Cancellation was requested and the process group was killed.
    pub cancelled: bool,
}

impl CommandOutcome {
    /// A successful outcome with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A failed outcome with the given exit code and stderr.
    #[must_use]
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// A timed-out outcome.
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    /// Returns true if the command exited 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quotes_only_when_needed() {
        let invocation = CommandInvocation::new("lint", "cargo", "/work")
            .with_args(["clippy", "--", "-D", "warnings", "it's here"])
            .with_env("TOKEN", "secret");
        assert_eq!(
            invocation.command_line(),
            r"cargo clippy -- -D warnings 'it'\''s here'"
        );
    }

    #[test]
    fn test_outcome_success() {
        assert!(CommandOutcome::ok("").success());
        assert!(!CommandOutcome::exit(1, "boom").success());
        assert!(!CommandOutcome::timeout().success());
    }
}
