//! Worker error flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::agent::AgentName;

/// Error taxonomy reported by workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorType {
    /// Worker process died unexpectedly
    Crash,
    /// Worker exceeded its own internal deadline
    Timeout,
    /// Worker rejected its inputs
    Validation,
    /// Worker lacked filesystem or API permissions
    Permission,
    /// Worker ran out of a resource (disk, quota, memory)
    Resource,
}

/// `<agent>/error.flag` as written by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorFlag {
    /// Agent slot that failed
    pub agent: AgentName,
    /// Classified error kind
    pub error_type: WorkerErrorType,
    /// Human-readable message
    pub message: String,
    /// Worker-side stack trace, if captured
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack: Option<String>,
    /// When the worker flagged the error
    pub timestamp: DateTime<Utc>,
    /// Whether the worker believes a retry could succeed
    pub recoverable: bool,
}

impl ErrorFlag {
    /// Synthesizes the record used when `error.flag` is not valid JSON.
    ///
    /// An unparseable flag means the worker died before it could explain
    /// itself, so the kind is `crash` and it is non-recoverable.
    pub fn synthetic_crash(agent: AgentName, message: impl Into<String>) -> Self {
        Self {
            agent,
            error_type: WorkerErrorType::Crash,
            message: message.into(),
            stack: None,
            timestamp: Utc::now(),
            recoverable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_spelling() {
        assert_eq!(
            serde_json::to_string(&WorkerErrorType::Permission).unwrap(),
            "\"permission\""
        );
    }

    #[test]
    fn test_flag_round_trip() {
        let raw = r#"{
            "agent": "builder",
            "error_type": "timeout",
            "message": "no output for 10m",
            "timestamp": "2026-01-01T12:00:00Z",
            "recoverable": true
        }"#;
        let flag: ErrorFlag = serde_json::from_str(raw).unwrap();
        assert_eq!(flag.agent, AgentName::Builder);
        assert_eq!(flag.error_type, WorkerErrorType::Timeout);
        assert!(flag.recoverable);
        assert!(flag.stack.is_none());
    }

    #[test]
    fn test_synthetic_crash_is_non_recoverable() {
        let flag = ErrorFlag::synthetic_crash(AgentName::Verifier, "unparseable error.flag");
        assert_eq!(flag.error_type, WorkerErrorType::Crash);
        assert!(!flag.recoverable);
    }
}
