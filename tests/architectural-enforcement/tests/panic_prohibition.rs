//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production relay code propagates errors. `unwrap()` and
//! `expect()` are for test code only.

use architectural_enforcement::production_files;

#[test]
fn test_no_unwrap_in_production_code() {
    let violations: Vec<String> = production_files()
        .iter()
        .flat_map(|file| {
            file.find(|code| code.contains(".unwrap()") || code.contains(".expect("))
        })
        .map(|hit| hit.to_string())
        .collect();

    assert!(
        violations.is_empty(),
        "unwrap()/expect() in production code:\n  {}",
        violations.join("\n  ")
    );
}
