//! Gatekeeper verdicts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The Gatekeeper's structured decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Changes are merge-ready
    Pass,
    /// Changes need another full Build->Verify->Gate iteration
    Fail,
    /// Changes need a verifier-only re-run
    MinorFail,
    /// A human must weigh in (the Gatekeeper raises a CRP alongside)
    NeedsHuman,
}

/// `gatekeeper/verdict.json` as written by the worker.
///
/// Only the `verdict` field is interpreted; everything else the worker
/// writes (review notes, issue lists, scores) is preserved verbatim so the
/// MRP can embed it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// The decision
    pub verdict: Verdict,
    /// Worker-defined detail fields, passed through untouched
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl GateVerdict {
    /// Wraps a bare verdict with no detail fields.
    pub fn bare(verdict: Verdict) -> Self {
        Self {
            verdict,
            details: Map::new(),
        }
    }
}
