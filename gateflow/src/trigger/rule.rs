//! Trigger rules attached to stages and artifacts.

use crate::context::{EventKind, RunContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A condition on the run context.
///
/// Written as a string in pipeline files: `always`, `push_to_primary`,
/// `pull_request`, `event:<push|pull_request>` or `branch:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TriggerRule {
    /// Every triggered run.
    #[default]
    Always,
    /// Pushes to the primary branch.
    PushToPrimary,
    /// Pull requests targeting the primary branch.
    PullRequest,
    /// Runs started by the given event.
    Event(EventKind),
    /// Runs whose branch equals the given name.
    Branch(String),
}

impl TriggerRule {
    /// Evaluates the rule for a context.
    #[must_use]
    pub fn matches(&self, ctx: &RunContext, primary_branch: &str) -> bool {
        match self {
            Self::Always => true,
            Self::PushToPrimary => ctx.event == EventKind::Push && ctx.branch == primary_branch,
            Self::PullRequest => {
                ctx.event == EventKind::PullRequest && ctx.branch == primary_branch
            }
            Self::Event(kind) => ctx.event == *kind,
            Self::Branch(name) => ctx.branch == *name,
        }
    }
}

impl fmt::Display for TriggerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::PushToPrimary => write!(f, "push_to_primary"),
            Self::PullRequest => write!(f, "pull_request"),
            Self::Event(kind) => write!(f, "event:{kind}"),
            Self::Branch(name) => write!(f, "branch:{name}"),
        }
    }
}

impl FromStr for TriggerRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "always" => return Ok(Self::Always),
            "push_to_primary" => return Ok(Self::PushToPrimary),
            "pull_request" => return Ok(Self::PullRequest),
            _ => {}
        }
        match s.split_once(':') {
            Some(("event", kind)) => kind.trim().parse().map(Self::Event),
            Some(("branch", name)) if !name.trim().is_empty() => {
                Ok(Self::Branch(name.trim().to_string()))
            }
            _ => Err(format!("unknown trigger rule '{s}'")),
        }
    }
}

impl TryFrom<String> for TriggerRule {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TriggerRule> for String {
    fn from(rule: TriggerRule) -> Self {
        rule.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for text in ["always", "push_to_primary", "pull_request", "event:push", "branch:release"] {
            let rule: TriggerRule = text.parse().unwrap();
            assert_eq!(rule.to_string(), text);
        }
        assert!("branch:".parse::<TriggerRule>().is_err());
        assert!("nightly".parse::<TriggerRule>().is_err());
    }

    #[test]
    fn test_push_to_primary_rule() {
        let rule = TriggerRule::PushToPrimary;
        assert!(rule.matches(&RunContext::push("main", "c"), "main"));
        assert!(!rule.matches(&RunContext::push("feature", "c"), "main"));
        assert!(!rule.matches(&RunContext::pull_request("main", "c"), "main"));
    }

    #[test]
    fn test_event_rule() {
        let rule: TriggerRule = "event:pull_request".parse().unwrap();
        assert!(rule.matches(&RunContext::pull_request("dev", "c"), "main"));
        assert!(!rule.matches(&RunContext::push("dev", "c"), "main"));
    }

    #[test]
    fn test_yaml_form() {
        let rule: TriggerRule = serde_yaml::from_str("push_to_primary").unwrap();
        assert_eq!(rule, TriggerRule::PushToPrimary);
    }
}
