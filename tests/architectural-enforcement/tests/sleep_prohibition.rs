//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Waiting is done
//! on I/O, timeouts or cancellation tokens, never on wall-clock naps.
//!
//! **Exceptions**: Test code

use architectural_enforcement::{production_sources, report};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if line.contains("thread::sleep") {
                violations.push(file.violation(idx, "Blocking sleep"));
            } else if line.contains("time::sleep") || line.contains("sleep_until") {
                violations.push(file.violation(idx, "Async sleep"));
            }
        }
    }

    report("Sleep calls found in production code (use tokio::time::timeout or a CancellationToken)", &violations);
}
