//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions MUST NOT use blocking I/O.
//! **Required**: Use `tokio::fs`, `tokio::net`, `reqwest` (async), not `std::fs`, `std::net`
//!
//! Blocking calls in plain functions are acceptable: they run before the
//! runtime starts (config loading) or are one-off socket file housekeeping.

use architectural_enforcement::{production_sources, report};

#[test]
fn test_no_blocking_io_in_async_functions() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let kind = if line.contains("std::fs::") {
                "Blocking file I/O"
            } else if line.contains("std::net::") {
                "Blocking network I/O"
            } else if line.contains("std::process::Command") {
                "Blocking process I/O"
            } else if line.contains("std::io::stdin()") {
                "Blocking stdin"
            } else {
                continue;
            };
            if file.in_async_fn(idx) {
                violations.push(file.violation(idx, kind));
            }
        }
    }

    report("Blocking I/O calls found in async code", &violations);
}

#[test]
fn test_no_blocking_http_client() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if line.contains("reqwest::blocking") {
                violations.push(file.violation(idx, "Blocking HTTP client"));
            }
        }
    }

    report("Blocking HTTP client used in production code", &violations);
}
