//! The run-state document (`state.json`).
//!
//! `RunState` is the only mutable process-wide persistent document per run.
//! All mutation helpers here are pure in-memory transformations; persistence
//! and locking live in the state store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CrpId, RunId};
use crate::model::agent::{AgentName, AgentState, AgentStatus};
use crate::model::phase::Phase;
use crate::model::usage::Usage;

/// Default cap on verifier-only re-runs.
pub const DEFAULT_MAX_MINOR_FIX_ATTEMPTS: u32 = 2;

/// One line of run history, appended on every phase transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The phase that ended
    pub phase: Phase,
    /// How it ended ("completed", "failed", "crp", ...)
    pub result: String,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

/// Record of per-agent model choices (`model-selection.json`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Agent slot -> model identifier
    pub models: BTreeMap<AgentName, String>,
    /// Selector's reasoning, if it produced any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub analysis: Option<String>,
    /// How the selection was made ("heuristic", "fixed", ...)
    pub selection_method: String,
}

/// The persistent run-state document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Immutable run identity
    pub run_id: RunId,
    /// When the run was created
    pub started_at: DateTime<Utc>,
    /// Stamped on every save
    pub updated_at: DateTime<Utc>,
    /// Macro-state
    pub phase: Phase,
    /// Current Build->Verify->Gate loop, starting at 1
    pub iteration: u32,
    /// Cap on iterations, in `1..=100`
    pub max_iterations: u32,
    /// Verifier-only re-runs consumed in the current iteration
    pub minor_fix_attempts: u32,
    /// Cap on verifier-only re-runs
    pub max_minor_fix_attempts: u32,
    /// Per-agent records
    pub agents: BTreeMap<AgentName, AgentState>,
    /// Set iff `phase == waiting_human`
    pub pending_crp: Option<CrpId>,
    /// Name of the most recently routed event
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_event: Option<String>,
    /// Accumulated error messages
    #[serde(default)]
    pub errors: Vec<String>,
    /// Phase transition history
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Componentwise sum over `agents[*].usage`
    #[serde(default)]
    pub usage: Usage,
    /// Per-agent model choices, if a selector ran
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_selection: Option<ModelSelection>,
}

impl RunState {
    /// Fresh state for a newly created run: `phase=refine`, `iteration=1`,
    /// all four agents pending.
    pub fn new(run_id: RunId, max_iterations: u32, now: DateTime<Utc>) -> Self {
        let agents = AgentName::ALL
            .iter()
            .map(|a| (*a, AgentState::pending()))
            .collect();
        Self {
            run_id,
            started_at: now,
            updated_at: now,
            phase: Phase::Refine,
            iteration: 1,
            max_iterations,
            minor_fix_attempts: 0,
            max_minor_fix_attempts: DEFAULT_MAX_MINOR_FIX_ATTEMPTS,
            agents,
            pending_crp: None,
            last_event: None,
            errors: Vec::new(),
            history: Vec::new(),
            usage: Usage::default(),
            model_selection: None,
        }
    }

    /// The record for an agent slot, materializing a pending one if absent.
    pub fn agent_mut(&mut self, agent: AgentName) -> &mut AgentState {
        self.agents.entry(agent).or_insert_with(AgentState::pending)
    }

    /// Read-only view of an agent slot.
    pub fn agent(&self, agent: AgentName) -> Option<&AgentState> {
        self.agents.get(&agent)
    }

    /// Applies a status change with the timestamp bookkeeping that goes
    /// with it: `running` stamps `started_at`, terminal statuses stamp
    /// `completed_at`.
    pub fn set_agent_status(
        &mut self,
        agent: AgentName,
        status: AgentStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        let slot = self.agent_mut(agent);
        slot.status = status;
        match status {
            AgentStatus::Running => {
                slot.started_at = Some(now);
                slot.completed_at = None;
                slot.error = None;
            }
            s if s.is_terminal() => {
                slot.completed_at = Some(now);
            }
            _ => {}
        }
        if let Some(message) = error {
            slot.error = Some(message);
        }
    }

    /// Arms the recorded absolute deadline for an agent attempt.
    pub fn set_agent_timeout_at(&mut self, agent: AgentName, deadline: Option<DateTime<Utc>>) {
        self.agent_mut(agent).timeout_at = deadline;
    }

    /// Starts the next Build->Verify->Gate loop: bumps `iteration`, resets
    /// Builder/Verifier/Gatekeeper to pending, and zeroes the minor-fix
    /// counter.
    pub fn begin_iteration(&mut self) {
        self.iteration += 1;
        for agent in [AgentName::Builder, AgentName::Verifier, AgentName::Gatekeeper] {
            self.agent_mut(agent).reset();
        }
        self.minor_fix_attempts = 0;
    }

    /// Recomputes the aggregate usage from the per-agent records.
    pub fn recompute_usage(&mut self) {
        self.usage = Usage::sum(self.agents.values().filter_map(|a| a.usage.as_ref()));
    }

    /// Appends a history line.
    pub fn record_history(&mut self, phase: Phase, result: impl Into<String>, now: DateTime<Utc>) {
        self.history.push(HistoryEntry {
            phase,
            result: result.into(),
            timestamp: now,
        });
    }

    /// Enters `waiting_human` with the given pending CRP.
    pub fn enter_waiting_human(&mut self, crp_id: CrpId) {
        self.pending_crp = Some(crp_id);
        self.phase = Phase::WaitingHuman;
    }

    /// Leaves `waiting_human`, clearing the pending CRP and returning to the
    /// given phase.
    pub fn leave_waiting_human(&mut self, phase: Phase) {
        self.pending_crp = None;
        self.phase = phase;
    }

    /// True if no agent slot is currently `running`.
    pub fn no_agent_running(&self) -> bool {
        self.agents
            .values()
            .all(|a| a.status != AgentStatus::Running)
    }

    /// Checks the document-level invariants. Intended for tests and for
    /// debugging assertions; violations indicate an orchestrator bug.
    pub fn check_invariants(&self) -> Result<(), String> {
        if (self.phase == Phase::WaitingHuman) != self.pending_crp.is_some() {
            return Err(format!(
                "phase {} does not agree with pending_crp {:?}",
                self.phase, self.pending_crp
            ));
        }
        if matches!(
            self.phase,
            Phase::Completed | Phase::Failed | Phase::ReadyForMerge
        ) && !self.no_agent_running()
        {
            return Err(format!("agents still running in phase {}", self.phase));
        }
        if self.iteration > self.max_iterations {
            return Err(format!(
                "iteration {} exceeds max_iterations {}",
                self.iteration, self.max_iterations
            ));
        }
        let expected = Usage::sum(self.agents.values().filter_map(|a| a.usage.as_ref()));
        if expected != self.usage {
            return Err("aggregate usage is not the sum of per-agent usage".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> RunState {
        RunState::new(
            RunId::new("run-20260101120000").unwrap(),
            3,
            Utc::now(),
        )
    }

    #[test]
    fn test_new_state_shape() {
        let state = new_state();
        assert_eq!(state.phase, Phase::Refine);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.agents.len(), 4);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_begin_iteration_resets_loop_agents() {
        let mut state = new_state();
        let now = Utc::now();
        state.set_agent_status(AgentName::Builder, AgentStatus::Failed, Some("x".into()), now);
        state.set_agent_status(AgentName::Refiner, AgentStatus::Completed, None, now);
        state.minor_fix_attempts = 2;

        state.begin_iteration();

        assert_eq!(state.iteration, 2);
        assert_eq!(state.minor_fix_attempts, 0);
        assert_eq!(
            state.agent(AgentName::Builder).unwrap().status,
            AgentStatus::Pending
        );
        assert!(state.agent(AgentName::Builder).unwrap().error.is_none());
        // Refiner is outside the loop and keeps its record.
        assert_eq!(
            state.agent(AgentName::Refiner).unwrap().status,
            AgentStatus::Completed
        );
    }

    #[test]
    fn test_status_timestamps() {
        let mut state = new_state();
        let now = Utc::now();
        state.set_agent_status(AgentName::Refiner, AgentStatus::Running, None, now);
        let slot = state.agent(AgentName::Refiner).unwrap();
        assert_eq!(slot.started_at, Some(now));
        assert!(slot.completed_at.is_none());

        state.set_agent_status(AgentName::Refiner, AgentStatus::Completed, None, now);
        let slot = state.agent(AgentName::Refiner).unwrap();
        assert_eq!(slot.completed_at, Some(now));
    }

    #[test]
    fn test_waiting_human_invariant() {
        let mut state = new_state();
        state.enter_waiting_human(CrpId::new("crp-001").unwrap());
        assert!(state.check_invariants().is_ok());
        assert_eq!(state.phase, Phase::WaitingHuman);

        state.leave_waiting_human(Phase::Refine);
        assert!(state.pending_crp.is_none());
        assert!(state.check_invariants().is_ok());

        // A desynchronized document must be flagged.
        state.pending_crp = Some(CrpId::new("crp-002").unwrap());
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_recompute_usage_matches_sum() {
        let mut state = new_state();
        state.agent_mut(AgentName::Refiner).usage = Some(Usage {
            input: 10,
            output: 5,
            cache_creation: 0,
            cache_read: 0,
            cost_usd: 0.01,
        });
        state.agent_mut(AgentName::Builder).usage = Some(Usage {
            input: 90,
            output: 45,
            cache_creation: 1,
            cache_read: 2,
            cost_usd: 0.09,
        });
        state.recompute_usage();
        assert_eq!(state.usage.input, 100);
        assert_eq!(state.usage.cost_usd, 0.1);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = new_state();
        state.record_history(Phase::Refine, "completed", Utc::now());
        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
