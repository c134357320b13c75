//! Path helpers.

use std::path::{Path, PathBuf};

/// Resolves a declared path.
///
/// `~/` is expanded against `HOME`; other relative paths are joined onto
/// `workdir`; absolute paths are returned unchanged.
#[must_use]
pub fn expand_home(path: &str, workdir: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workdir.join(candidate)
    }
}

/// Whether `name` is usable as a single path component: non-empty, not
/// `.` or `..`, and free of separators.
#[must_use]
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("contract.wasm"));
        assert!(is_plain_name("..hidden"));
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "/etc"] {
            assert!(!is_plain_name(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_relative_joins_workdir() {
        let resolved = expand_home("target/out.wasm", Path::new("/work"));
        assert_eq!(resolved, PathBuf::from("/work/target/out.wasm"));
    }

    #[test]
    fn test_absolute_unchanged() {
        let resolved = expand_home("/opt/cache", Path::new("/work"));
        assert_eq!(resolved, PathBuf::from("/opt/cache"));
    }

    #[test]
    fn test_home_prefix_expanded() {
        let resolved = expand_home("~/.cargo/registry", Path::new("/work"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(resolved, PathBuf::from(home).join(".cargo/registry"));
        }
    }
}
