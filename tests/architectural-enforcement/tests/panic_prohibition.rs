//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates errors with `Result` and `?`.
//! `unwrap()`, `expect()` and explicit panics are reserved for tests.

use architectural_enforcement::{production_sources, report};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if line.contains(".unwrap()") {
                violations.push(file.violation(idx, "unwrap()"));
            } else if line.contains(".expect(") {
                violations.push(file.violation(idx, "expect()"));
            } else if line.contains("panic!(") || line.contains("unreachable!(") {
                violations.push(file.violation(idx, "Explicit panic"));
            }
        }
    }

    report("Panicking calls found in production code", &violations);
}
