//! Secret credentials and output redaction.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Replacement text for redacted secrets.
pub const REDACTED: &str = "***";

/// Named secret values available to a run.
///
/// Values never appear in `Debug` output.
#[derive(Clone, Default)]
pub struct SecretSet {
    values: BTreeMap<String, String>,
}

impl SecretSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret.
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts a secret.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Reads the named variables from the process environment, ignoring unset ones.
    #[must_use]
    pub fn from_env<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for name in names {
            if let Ok(value) = std::env::var(name.as_ref()) {
                if !value.is_empty() {
                    set.insert(name.as_ref(), value);
                }
            }
        }
        set
    }

    /// Looks up a secret value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Secret names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no secrets are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds a redactor for every value in the set.
    #[must_use]
    pub fn redactor(&self) -> Redactor {
        Redactor::new(self.values.values().map(String::as_str))
    }
}

impl fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Replaces secret values in captured text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    pattern: Option<Regex>,
}

impl Redactor {
    /// Builds a redactor for the given values. Empty values are ignored.
    #[must_use]
    pub fn new<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut values: Vec<&str> = values.into_iter().filter(|v| !v.is_empty()).collect();
        if values.is_empty() {
            return Self::default();
        }
        // Longest first so overlapping secrets are fully masked.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values.dedup();

        let alternation = values
            .iter()
            .map(|v| regex::escape(v))
            .collect::<Vec<_>>()
            .join("|");

        match Regex::new(&alternation) {
            Ok(pattern) => Self {
                pattern: Some(pattern),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compile secret redaction pattern; masking all output");
                Self {
                    pattern: Regex::new(r"(?s).+").ok(),
                }
            }
        }
    }

    /// Returns `text` with every secret value replaced by [`REDACTED`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern.replace_all(text, REDACTED).into_owned(),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_all_occurrences() {
        let secrets = SecretSet::new()
            .with_secret("TOKEN", "abc.def")
            .with_secret("OTHER", "xyz");
        let redactor = secrets.redactor();

        let out = redactor.redact("token=abc.def other=xyz again abc.def; abcXdef stays");
        assert_eq!(out, "token=*** other=*** again ***; abcXdef stays");
    }

    #[test]
    fn test_overlapping_secrets_masked_fully() {
        let redactor = Redactor::new(["secret", "secret-extended"]);
        assert_eq!(redactor.redact("v=secret-extended"), "v=***");
    }

    #[test]
    fn test_empty_redactor_is_identity() {
        let redactor = SecretSet::new().redactor();
        assert_eq!(redactor.redact("nothing to hide"), "nothing to hide");

        let redactor = Redactor::new([""]);
        assert_eq!(redactor.redact("still nothing"), "still nothing");
    }

    #[test]
    fn test_debug_lists_names_only() {
        let secrets = SecretSet::new().with_secret("API_KEY", "hunter2");
        let rendered = format!("{secrets:?}");
        assert!(rendered.contains("API_KEY"));
        assert!(!rendered.contains("hunter2"));
    }
}
