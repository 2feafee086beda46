//! Run phases.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::agent::AgentName;

/// Macro-state of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Refiner is turning the raw briefing into a refined one
    Refine,
    /// Builder is producing code changes
    Build,
    /// Verifier is testing the changes
    Verify,
    /// Gatekeeper is reviewing and issuing a verdict
    Gate,
    /// Blocked on a human reply to a pending CRP
    WaitingHuman,
    /// Verdict passed; MRP is assembled
    ReadyForMerge,
    /// Run finished successfully
    Completed,
    /// Run finished unsuccessfully
    Failed,
}

impl Phase {
    /// True once the run can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// True while the run still counts as active for the workspace.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The agent slot that executes this phase, if any.
    pub fn agent(&self) -> Option<AgentName> {
        match self {
            Phase::Refine => Some(AgentName::Refiner),
            Phase::Build => Some(AgentName::Builder),
            Phase::Verify => Some(AgentName::Verifier),
            Phase::Gate => Some(AgentName::Gatekeeper),
            _ => None,
        }
    }

    /// The phase an agent executes in.
    pub fn of_agent(agent: AgentName) -> Phase {
        match agent {
            AgentName::Refiner => Phase::Refine,
            AgentName::Builder => Phase::Build,
            AgentName::Verifier => Phase::Verify,
            AgentName::Gatekeeper => Phase::Gate,
        }
    }

    /// Happy-path successor of an agent phase.
    ///
    /// `gate` has no static successor; the Gatekeeper verdict decides.
    pub fn successor(&self) -> Option<Phase> {
        match self {
            Phase::Refine => Some(Phase::Build),
            Phase::Build => Some(Phase::Verify),
            Phase::Verify => Some(Phase::Gate),
            _ => None,
        }
    }

    /// Stable lowercase spelling as persisted in `state.json`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Refine => "refine",
            Phase::Build => "build",
            Phase::Verify => "verify",
            Phase::Gate => "gate",
            Phase::WaitingHuman => "waiting_human",
            Phase::ReadyForMerge => "ready_for_merge",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serde_spelling() {
        assert_eq!(
            serde_json::to_string(&Phase::WaitingHuman).unwrap(),
            "\"waiting_human\""
        );
        assert_eq!(
            serde_json::from_str::<Phase>("\"ready_for_merge\"").unwrap(),
            Phase::ReadyForMerge
        );
    }

    #[test]
    fn test_successor_chain() {
        assert_eq!(Phase::Refine.successor(), Some(Phase::Build));
        assert_eq!(Phase::Build.successor(), Some(Phase::Verify));
        assert_eq!(Phase::Verify.successor(), Some(Phase::Gate));
        assert_eq!(Phase::Gate.successor(), None);
        assert_eq!(Phase::WaitingHuman.successor(), None);
    }

    #[test]
    fn test_agent_phase_correspondence() {
        for agent in AgentName::ALL {
            assert_eq!(Phase::of_agent(agent).agent(), Some(agent));
        }
        assert_eq!(Phase::Failed.agent(), None);
    }

    #[test]
    fn test_terminality() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::ReadyForMerge.is_active());
        assert!(Phase::WaitingHuman.is_active());
    }
}
