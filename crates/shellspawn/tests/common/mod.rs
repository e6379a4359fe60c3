//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::sync::Once;

static TRACING: Once = Once::new();

/// Routes `tracing` output to the test harness. Set `RUST_LOG=shellspawn=trace`
/// to see it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Path of the interactive test client built alongside the library.
pub fn testclient() -> &'static str {
    env!("CARGO_BIN_EXE_shellspawn-testclient")
}

/// Command string running the test client with extra arguments.
pub fn testclient_command(args: &str) -> String {
    if args.is_empty() {
        format!("\"{}\"", testclient())
    } else {
        format!("\"{}\" {args}", testclient())
    }
}

/// The lines the test client prints for a single answer and no arguments.
pub fn greeting_for(name: &str) -> Vec<String> {
    vec![
        "Test Client for shellspawn".to_string(),
        "Argument 0:shellspawn-testclient".to_string(),
        "What is your name?".to_string(),
        format!("Your name is {name}"),
    ]
}

pub fn stderr_lines() -> Vec<String> {
    vec![
        "This is an error message".to_string(),
        "This is another error message".to_string(),
    ]
}
