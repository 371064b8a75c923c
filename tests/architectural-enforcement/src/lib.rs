//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the gateway crates:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//! - No panicking shortcuts (`unwrap`, `expect`) outside tests
//! - No process-wide mutable singletons
//!
//! The helpers here load production sources once so each rule stays a
//! short line filter.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories holding production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/daemon/src"];

/// One production source file with comments and test modules removed
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Code lines, 1-based numbering preserved by index + 1
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Format a violation for this file
    #[must_use]
    pub fn violation(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {}: {}",
            self.path.display(),
            idx + 1,
            what,
            self.lines[idx].trim()
        )
    }

    /// Whether the nearest enclosing `fn` above `idx` is async
    #[must_use]
    pub fn in_async_fn(&self, idx: usize) -> bool {
        self.lines[..=idx]
            .iter()
            .rev()
            .find(|line| is_fn_header(line))
            .is_some_and(|line| line.contains("async fn"))
    }
}

fn is_fn_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("fn ")
        || trimmed.starts_with("pub fn ")
        || trimmed.starts_with("pub(crate) fn ")
        || trimmed.starts_with("async fn ")
        || trimmed.starts_with("pub async fn ")
        || trimmed.starts_with("pub(crate) async fn ")
        || trimmed.starts_with("const fn ")
        || trimmed.starts_with("pub const fn ")
}

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Strip the trailing `//` comment from a line, leaving string literals alone
/// when the comment marker sits inside quotes
fn strip_comment(line: &str) -> String {
    let mut in_string = false;
    let mut prev = '\0';
    for (pos, ch) in line.char_indices() {
        match ch {
            '"' if prev != '\\' => in_string = !in_string,
            '/' if !in_string && prev == '/' => return line[..pos - 1].to_string(),
            _ => {}
        }
        prev = ch;
    }
    line.to_string()
}

fn load(path: &Path, root: &Path) -> Option<SourceFile> {
    let content = fs::read_to_string(path).ok()?;
    let lines = content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(strip_comment)
        .collect();
    Some(SourceFile {
        path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
        lines,
    })
}

/// Every production `.rs` file in [`PRODUCTION_DIRS`]
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| walkdir::WalkDir::new(root.join(dir)).into_iter())
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|entry| load(entry.path(), &root))
        .collect()
}

/// Print violations and fail the calling test
pub fn report(rule: &str, violations: &[String]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment_keeps_urls_in_strings() {
        assert_eq!(
            strip_comment(r#"let url = "http://localhost"; // note"#),
            r#"let url = "http://localhost"; "#
        );
        assert_eq!(strip_comment("/// docs"), "");
    }

    #[test]
    fn test_in_async_fn_uses_nearest_header() {
        let file = SourceFile {
            path: PathBuf::from("x.rs"),
            lines: vec![
                "async fn outer() {".to_string(),
                "}".to_string(),
                "fn inner() {".to_string(),
                "    body();".to_string(),
            ],
        };
        assert!(!file.in_async_fn(3));
        assert!(file.in_async_fn(0));
    }

    #[test]
    fn test_production_sources_are_found() {
        let sources = production_sources();
        assert!(sources
            .iter()
            .any(|file| file.path.ends_with("gateway/core/src/lib.rs")));
        assert!(sources
            .iter()
            .any(|file| file.path.ends_with("gateway/daemon/src/main.rs")));
    }
}
