//! Artifacts exchanged with the external test runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `verifier/test-config.json`, written by the Verifier next to
/// `tests-ready.flag` to tell the external runner what to execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Command line to execute
    pub test_command: String,
    /// Working directory for the command, relative to the workspace
    pub test_directory: String,
    /// Budget for the whole execution
    pub timeout_ms: u64,
}

/// `verifier/test-output.json`, written by the external runner when done.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Wall-clock duration of the execution
    pub duration_ms: u64,
    /// When the runner finished
    pub executed_at: DateTime<Utc>,
    /// Structured per-test results, if the runner produced them
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub test_results: Option<Value>,
}

/// `verifier/results.json`, the Verifier's own tally.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifierResults {
    /// Total tests observed
    pub total: u64,
    /// Tests that passed
    pub passed: u64,
    /// Tests that failed
    pub failed: u64,
    /// Coverage fraction, if measured
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coverage: Option<f64>,
    /// Verifier-defined extras, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_config_round_trip() {
        let raw = r#"{"test_command":"cargo test","test_directory":"crates/app","timeout_ms":600000}"#;
        let config: TestConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.test_command, "cargo test");
        assert_eq!(config.timeout_ms, 600_000);
    }

    #[test]
    fn test_results_preserve_extras() {
        let raw = r#"{"total":12,"passed":11,"failed":1,"flaky":["net::retry"]}"#;
        let results: VerifierResults = serde_json::from_str(raw).unwrap();
        assert_eq!(results.total, 12);
        assert!(results.coverage.is_none());
        assert_eq!(results.extra["flaky"][0], "net::retry");
    }
}
