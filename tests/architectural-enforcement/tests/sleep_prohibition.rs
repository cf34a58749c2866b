//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production relay code MUST NOT sleep to wait for events.
//! **Exceptions**: the quiescence timer task, reconnection backoff, scripted
//! fragment and demo step pacing, and test code. Deadlines use `sleep_until`, which is not
//! matched here.

use architectural_enforcement::{production_files, ProductionFile, SourceLine};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }

        eprintln!("\nAcceptable sleep uses:");
        eprintln!("  - The quiescence timer task of the animation driver");
        eprintln!("  - Reconnection backoff in the subscription client");
        eprintln!("  - Inter-fragment pacing of the scripted generator");
        eprintln!("  - Step pauses of the demo workflow");
        eprintln!("\nForbidden:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

fn find_sleep_violations() -> Vec<SourceLine> {
    production_files()
        .iter()
        .flat_map(|file| {
            file.find(|code| code.contains("::sleep(") || code.contains(".sleep("))
                .into_iter()
                .filter(|hit| !is_allowed(file, hit))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn is_allowed(file: &ProductionFile, hit: &SourceLine) -> bool {
    is_backoff_context(file, hit) || is_timer_context(file, hit) || is_pacing_context(file, hit)
}

/// Reconnection delay computed from the backoff policy
fn is_backoff_context(file: &ProductionFile, hit: &SourceLine) -> bool {
    let context = file.context(hit.number, 10, 2);
    context.contains("delay_for(") && context.contains("reconnect")
}

/// A spawned, abortable timer that fires a state machine transition
fn is_timer_context(file: &ProductionFile, hit: &SourceLine) -> bool {
    let context = file.context(hit.number, 10, 5);
    context.contains("tokio::spawn") && context.contains(".fire(")
}

/// Configured pause between scripted fragments or demo steps
fn is_pacing_context(file: &ProductionFile, hit: &SourceLine) -> bool {
    let fragment = file.path.ends_with("generation/scripted.rs") && hit.text.contains("script.delay");
    let demo_step = file.path.ends_with("workflow.rs")
        && file.context(hit.number, 3, 0).contains("async fn pause(");
    fragment || demo_step
}

#[test]
fn test_policy_catches_polling_sleep() {
    let file = ProductionFile {
        path: "relay/core/src/poller.rs".into(),
        lines: vec![
            "loop {".to_string(),
            "    if ready() { break; }".to_string(),
            "    tokio::time::sleep(Duration::from_millis(10)).await;".to_string(),
            "}".to_string(),
        ],
    };
    let hits = file.find(|code| code.contains("::sleep("));
    assert_eq!(hits.len(), 1);
    assert!(!is_allowed(&file, &hits[0]));
}

#[test]
fn test_policy_allows_only_the_demo_pause_in_workflow() {
    let file = ProductionFile {
        path: "relay/core/src/workflow.rs".into(),
        lines: vec![
            "async fn pause(delay: Duration) {".to_string(),
            "    if !delay.is_zero() {".to_string(),
            "        tokio::time::sleep(delay).await;".to_string(),
            "    }".to_string(),
            "}".to_string(),
            "".to_string(),
            "".to_string(),
            "async fn wait_for_ack() {".to_string(),
            "    tokio::time::sleep(Duration::from_millis(5)).await;".to_string(),
            "}".to_string(),
        ],
    };
    let hits = file.find(|code| code.contains("::sleep("));
    assert_eq!(hits.len(), 2);
    assert!(is_allowed(&file, &hits[0]));
    assert!(!is_allowed(&file, &hits[1]));
}
