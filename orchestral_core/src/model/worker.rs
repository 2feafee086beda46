//! Worker stdout documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::usage::{round_cost, Usage};

/// The `usage` block inside `<agent>/output.json`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerUsage {
    /// Input tokens consumed
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens produced
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens written to the provider cache
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Tokens read from the provider cache
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// `<agent>/output.json` as written by a worker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Token accounting
    #[serde(default)]
    pub usage: WorkerUsage,
    /// Total dollar cost of the worker session
    #[serde(default)]
    pub total_cost_usd: f64,
    /// Worker-defined payload (result text, file lists, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkerOutput {
    /// Converts the worker's accounting into the state-level record.
    pub fn to_usage(&self) -> Usage {
        Usage {
            input: self.usage.input_tokens,
            output: self.usage.output_tokens,
            cache_creation: self.usage.cache_creation_input_tokens,
            cache_read: self.usage.cache_read_input_tokens,
            cost_usd: round_cost(self.total_cost_usd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_output_to_usage() {
        let raw = r#"{
            "usage": {
                "input_tokens": 1200,
                "output_tokens": 340,
                "cache_creation_input_tokens": 100,
                "cache_read_input_tokens": 900
            },
            "total_cost_usd": 0.0123456789,
            "result": "done"
        }"#;
        let output: WorkerOutput = serde_json::from_str(raw).unwrap();
        let usage = output.to_usage();
        assert_eq!(usage.input, 1200);
        assert_eq!(usage.cache_read, 900);
        assert_eq!(usage.cost_usd, 0.012346);
        assert_eq!(output.extra["result"], "done");
    }

    #[test]
    fn test_missing_usage_defaults_to_zero() {
        let output: WorkerOutput = serde_json::from_str(r#"{"result":"ok"}"#).unwrap();
        assert_eq!(output.to_usage(), Usage::default());
    }
}
