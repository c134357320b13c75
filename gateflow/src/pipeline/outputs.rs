//! `${outputs.<stage>.<name>}` references in command arguments.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Resolved outputs of settled stages: stage id to output name to path.
pub type OutputMap = BTreeMap<String, BTreeMap<String, PathBuf>>;

fn pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{outputs\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\}").ok())
        .as_ref()
}

/// Every `(stage, output)` pair referenced by `text`.
#[must_use]
pub fn references(text: &str) -> Vec<(String, String)> {
    let Some(pattern) = pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Replaces references with resolved paths.
///
/// # Errors
///
/// Returns the first unresolved reference as `stage.output`.
pub fn substitute(text: &str, outputs: &OutputMap) -> Result<String, String> {
    let Some(pattern) = pattern() else {
        return Ok(text.to_string());
    };
    let mut missing: Option<String> = None;
    let replaced = pattern.replace_all(text, |caps: &Captures<'_>| {
        match outputs.get(&caps[1]).and_then(|o| o.get(&caps[2])) {
            Some(path) => path.display().to_string(),
            None => {
                missing.get_or_insert_with(|| format!("{}.{}", &caps[1], &caps[2]));
                String::new()
            }
        }
    });
    match missing {
        Some(reference) => Err(reference),
        None => Ok(replaced.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> OutputMap {
        let mut map = OutputMap::new();
        map.entry("build".to_string()).or_default().insert(
            "wasm".to_string(),
            PathBuf::from("/w/target/wasm32v1-none/release/token.wasm"),
        );
        map
    }

    #[test]
    fn test_references() {
        assert_eq!(
            references("--wasm=${outputs.build.wasm} ${outputs.cov.lcov}"),
            vec![
                ("build".to_string(), "wasm".to_string()),
                ("cov".to_string(), "lcov".to_string())
            ]
        );
        assert!(references("plain").is_empty());
    }

    #[test]
    fn test_substitute() {
        assert_eq!(
            substitute("--wasm=${outputs.build.wasm}", &outputs()).unwrap(),
            "--wasm=/w/target/wasm32v1-none/release/token.wasm"
        );
        assert_eq!(substitute("${outputs.build.lcov}", &outputs()).unwrap_err(), "build.lcov");
    }
}
