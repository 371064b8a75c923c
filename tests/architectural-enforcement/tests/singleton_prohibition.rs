//! Integration Test: Singleton Prohibition
//!
//! **Policy**: Shared state (quota store, health, metrics, providers) is
//! constructed by the gateway builder and passed by `Arc`. No process-wide
//! mutable statics.

use architectural_enforcement::{production_sources, report};

const FORBIDDEN: &[&str] = &[
    "lazy_static!",
    "OnceLock<",
    "OnceCell<",
    "LazyLock<",
    "static mut ",
    "thread_local!",
];

#[test]
fn test_no_global_singletons() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if let Some(pattern) = FORBIDDEN.iter().find(|p| line.contains(*p)) {
                violations.push(file.violation(idx, pattern));
            }
        }
    }

    report("Process-wide singletons found in production code", &violations);
}
