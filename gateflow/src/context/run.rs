//! The invocation context of a pipeline run.

use super::SecretSet;
use crate::utils::generate_uuid_v7;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The event that started the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A push to `branch`.
    Push,
    /// A pull request targeting `branch`.
    PullRequest,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::PullRequest => write!(f, "pull_request"),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull_request" | "pull-request" | "pr" => Ok(Self::PullRequest),
            other => Err(format!(
                "unknown event '{other}' (expected 'push' or 'pull_request')"
            )),
        }
    }
}

/// Read-only description of one invocation.
///
/// For pushes `branch` is the pushed branch; for pull requests it is the
/// branch the pull request targets.
#[derive(Clone, Serialize)]
pub struct RunContext {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// The triggering event.
    pub event: EventKind,
    /// Branch name (see type docs).
    pub branch: String,
    /// Commit identifier.
    pub commit: String,
    /// Credentials available to commands and sinks.
    #[serde(skip)]
    pub secrets: SecretSet,
}

impl RunContext {
    /// Creates a new context with a fresh run id.
    #[must_use]
    pub fn new(event: EventKind, branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            run_id: generate_uuid_v7(),
            event,
            branch: branch.into(),
            commit: commit.into(),
            secrets: SecretSet::new(),
        }
    }

    /// Shorthand for a push context.
    #[must_use]
    pub fn push(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self::new(EventKind::Push, branch, commit)
    }

    /// Shorthand for a pull request context.
    #[must_use]
    pub fn pull_request(target_branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest, target_branch, commit)
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Sets the secrets.
    #[must_use]
    pub fn with_secrets(mut self, secrets: SecretSet) -> Self {
        self.secrets = secrets;
        self
    }

    /// Tags attached to every artifact of this run.
    #[must_use]
    pub fn artifact_tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("run_id".to_string(), self.run_id.to_string()),
            ("event".to_string(), self.event.to_string()),
            ("branch".to_string(), self.branch.clone()),
            ("commit".to_string(), self.commit.clone()),
        ])
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("event", &self.event)
            .field("branch", &self.branch)
            .field("commit", &self.commit)
            .field("secrets", &self.secrets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("push".parse::<EventKind>().unwrap(), EventKind::Push);
        assert_eq!("pr".parse::<EventKind>().unwrap(), EventKind::PullRequest);
        assert!("tag".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_run_context_tags() {
        let ctx = RunContext::push("main", "deadbeef");
        let tags = ctx.artifact_tags();

        assert_eq!(tags.get("event").map(String::as_str), Some("push"));
        assert_eq!(tags.get("commit").map(String::as_str), Some("deadbeef"));
        assert_eq!(tags.get("run_id"), Some(&ctx.run_id.to_string()));
    }

    #[test]
    fn test_debug_never_prints_secret_values() {
        let ctx = RunContext::pull_request("main", "abc")
            .with_secrets(SecretSet::new().with_secret("CODECOV_TOKEN", "s3cr3t-value"));
        let rendered = format!("{ctx:?}");

        assert!(rendered.contains("CODECOV_TOKEN"));
        assert!(!rendered.contains("s3cr3t-value"));
    }
}
