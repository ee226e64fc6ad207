//! File logging writes JSON lines
//!
//! Installing a subscriber is process-global, so this binary holds a single test.

use tempfile::TempDir;
use tether::{init_logging, LogLevel, LoggingConfig, TetherError};

#[test]
fn test_file_logging_writes_json() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("tether.log");

    let config = LoggingConfig {
        level: LogLevel::Info,
        file: Some(log_path.clone()),
        verbose: false,
    };
    init_logging(&config).unwrap();

    tracing::info!(target: "tether", attempt = 1, "hello from the client");

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let line = contents.lines().next().unwrap();
    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(value["fields"]["message"], "hello from the client");
    assert_eq!(value["level"], "INFO");

    // The global subscriber is already set
    assert!(matches!(init_logging(&config), Err(TetherError::Logging(_))));
}
