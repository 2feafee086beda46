//! Merge-Readiness Pack documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, VcrId};
use crate::model::agent::AgentName;
use crate::model::usage::Usage;
use crate::model::verdict::GateVerdict;

/// Test tally embedded in the evidence document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTotals {
    /// Total tests observed
    pub total: u64,
    /// Tests that passed
    pub passed: u64,
    /// Tests that failed
    pub failed: u64,
}

/// `mrp/evidence.json`: the machine-readable half of the pack.
///
/// Regenerating the pack reproduces this document byte-for-byte apart from
/// `completed_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MrpEvidence {
    /// Run the pack belongs to
    pub run_id: RunId,
    /// Iteration that produced the passing verdict
    pub iteration: u32,
    /// When the pack was assembled
    pub completed_at: DateTime<Utc>,
    /// Test tally from the verifier results
    pub tests: TestTotals,
    /// Workspace-relative changed files copied under `mrp/code/`
    pub changed_files: Vec<String>,
    /// Human decisions that shaped the run
    pub decisions: Vec<VcrId>,
    /// Per-agent log paths relative to the run directory
    pub agent_logs: BTreeMap<AgentName, String>,
    /// Gatekeeper verdict, if present
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub verdict: Option<GateVerdict>,
    /// Aggregate usage, if recorded
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<Usage>,
}
