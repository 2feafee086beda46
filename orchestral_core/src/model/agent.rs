//! Agent slots and their per-run status records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestralError;
use crate::model::usage::Usage;

/// One of the four worker slots in the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    /// Refines the raw briefing into an actionable one.
    Refiner,
    /// Produces the code changes.
    Builder,
    /// Writes and runs tests against the changes.
    Verifier,
    /// Reviews the result and issues the verdict.
    Gatekeeper,
}

impl AgentName {
    /// All agents in pipeline order.
    pub const ALL: [AgentName; 4] = [
        AgentName::Refiner,
        AgentName::Builder,
        AgentName::Verifier,
        AgentName::Gatekeeper,
    ];

    /// Stable lowercase name, used for directory and prompt file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Refiner => "refiner",
            AgentName::Builder => "builder",
            AgentName::Verifier => "verifier",
            AgentName::Gatekeeper => "gatekeeper",
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentName {
    type Err = OrchestralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refiner" => Ok(AgentName::Refiner),
            "builder" => Ok(AgentName::Builder),
            "verifier" => Ok(AgentName::Verifier),
            "gatekeeper" => Ok(AgentName::Gatekeeper),
            other => Err(OrchestralError::Validation(format!(
                "unknown agent: {other:?}"
            ))),
        }
    }
}

/// Status of a single agent slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Not yet launched in the current iteration
    #[default]
    Pending,
    /// Worker process is running
    Running,
    /// Verifier handed off to the external test runner
    WaitingTestExecution,
    /// Blocked on a human reply to a CRP
    WaitingHuman,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Absolute timeout fired
    Timeout,
}

impl AgentStatus {
    /// True for statuses that end the slot's current attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Timeout
        )
    }
}

/// Per-agent record inside the run state document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Current status of the slot
    pub status: AgentStatus,
    /// When the worker was launched
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Absolute deadline armed for this attempt
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Last error message, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Token usage reported by the worker
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<Usage>,
}

impl AgentState {
    /// Fresh pending record.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Resets the slot for a new iteration, dropping timestamps and errors.
    pub fn reset(&mut self) {
        *self = Self::pending();
    }
}
