//! The phase state machine.
//!
//! Sole authority over `phase`, `iteration`, and `minor_fix_attempts`.
//! Verdict handling returns a typed outcome; the orchestrator executes it
//! (MRP assembly, prompt regeneration, relaunches) so the machine itself
//! never touches workers or the filesystem beyond the state document.

use std::sync::Arc;

use tracing::info;

use orchestral_core::errors::Result;
use orchestral_core::model::{AgentName, GateVerdict, Phase, RunState, Verdict};
use orchestral_core::state_store::StateStore;

/// What the orchestrator must do after a Gatekeeper verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerdictOutcome {
    /// PASS: assemble the MRP and move to `ready_for_merge`
    Merge,
    /// FAIL with iterations left: a fresh Build->Verify->Gate loop
    Rebuild {
        /// The iteration that was just entered
        iteration: u32,
    },
    /// MINOR_FAIL with attempts left: verifier-only re-run
    ReverifyMinor {
        /// The minor-fix attempt that was just consumed (1-based)
        attempt: u32,
    },
    /// Out of iterations (or a MINOR_FAIL overflowed into a final FAIL)
    RunFailed {
        /// Message recorded against the run
        reason: String,
    },
    /// NEEDS_HUMAN: the CRP the Gatekeeper produced drives the transition
    AwaitHuman,
}

/// Owns phase transitions and the iteration counters for one run.
pub struct PhaseMachine {
    state: Arc<StateStore>,
}

impl PhaseMachine {
    /// Machine over the run's state store.
    pub fn new(state: Arc<StateStore>) -> Self {
        Self { state }
    }

    /// Appends `{prev, result, ts}` to history and sets the new phase.
    pub async fn transition_with(&self, next: Phase, result: &str) -> Result<RunState> {
        let result = result.to_string();
        self.state
            .update(|s| {
                let prev = s.phase;
                s.record_history(prev, result, chrono::Utc::now());
                s.phase = next;
            })
            .await
    }

    /// Transition recording the previous phase as completed.
    pub async fn transition(&self, next: Phase) -> Result<RunState> {
        self.transition_with(next, "completed").await
    }

    /// Advances past a finished agent phase, unless a CRP won the race.
    ///
    /// Called after the CRP-detection delay. If a pending CRP has been
    /// recorded meanwhile, the machine stays put (`waiting_human` already
    /// holds) and returns `None`; otherwise it transitions to the
    /// happy-path successor and returns it.
    pub async fn advance_after(&self, agent: AgentName) -> Result<Option<Phase>> {
        let current = self
            .state
            .load()
            .await?
            .ok_or(orchestral_core::errors::OrchestralError::StateNotFound)?;
        if current.pending_crp.is_some() || current.phase == Phase::WaitingHuman {
            info!(%agent, "pending CRP wins over phase advance");
            return Ok(None);
        }
        let Some(next) = Phase::of_agent(agent).successor() else {
            return Ok(None);
        };
        self.transition(next).await?;
        Ok(Some(next))
    }

    /// Applies a Gatekeeper verdict to the state document and reports what
    /// the orchestrator must do next.
    pub async fn handle_verdict(&self, verdict: &GateVerdict) -> Result<VerdictOutcome> {
        match verdict.verdict {
            Verdict::Pass => Ok(VerdictOutcome::Merge),
            Verdict::Fail => self.handle_fail().await,
            Verdict::MinorFail => {
                let current = self
                    .state
                    .load()
                    .await?
                    .ok_or(orchestral_core::errors::OrchestralError::StateNotFound)?;
                if current.minor_fix_attempts < current.max_minor_fix_attempts {
                    let state = self.state.increment_minor_fix_attempt().await?;
                    self.transition_with(Phase::Verify, "minor_fail").await?;
                    Ok(VerdictOutcome::ReverifyMinor {
                        attempt: state.minor_fix_attempts,
                    })
                } else {
                    // Attempts spent: a minor failure escalates to a full one.
                    self.handle_fail().await
                }
            }
            Verdict::NeedsHuman => Ok(VerdictOutcome::AwaitHuman),
        }
    }

    /// Records the interrupted phase in history and enters `waiting_human`
    /// with the given pending CRP.
    pub async fn enter_waiting_human(
        &self,
        crp_id: orchestral_core::ids::CrpId,
    ) -> Result<RunState> {
        self.state
            .update(|s| {
                let prev = s.phase;
                s.record_history(prev, "crp", chrono::Utc::now());
                s.enter_waiting_human(crp_id);
            })
            .await
    }

    /// Leaves `waiting_human` back to the phase whose agent raised the CRP,
    /// clearing the pending reference.
    pub async fn leave_waiting_human(&self, phase: Phase) -> Result<RunState> {
        self.state
            .update(|s| {
                s.record_history(Phase::WaitingHuman, "resolved", chrono::Utc::now());
                s.leave_waiting_human(phase);
            })
            .await
    }

    async fn handle_fail(&self) -> Result<VerdictOutcome> {
        let current = self
            .state
            .load()
            .await?
            .ok_or(orchestral_core::errors::OrchestralError::StateNotFound)?;
        if current.iteration < current.max_iterations {
            let state = self.state.increment_iteration().await?;
            self.transition_with(Phase::Build, "failed").await?;
            info!(iteration = state.iteration, "verdict FAIL, starting next iteration");
            Ok(VerdictOutcome::Rebuild {
                iteration: state.iteration,
            })
        } else {
            let reason = format!(
                "gatekeeper failed the run after exhausting all {} iterations",
                current.max_iterations
            );
            self.transition_with(Phase::Failed, "failed").await?;
            Ok(VerdictOutcome::RunFailed { reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestral_core::ids::{CrpId, RunId};
    use orchestral_core::model::AgentStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn machine_with_state(dir: &TempDir, max_iterations: u32) -> (PhaseMachine, Arc<StateStore>) {
        let store = Arc::new(StateStore::new(
            dir.path().join("state.json"),
            Duration::from_millis(0),
        ));
        store
            .save(RunState::new(
                RunId::new("run-20260101120000").unwrap(),
                max_iterations,
                chrono::Utc::now(),
            ))
            .await
            .unwrap();
        (PhaseMachine::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_transition_appends_history() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;

        machine.transition(Phase::Build).await.unwrap();
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Build);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].phase, Phase::Refine);
        assert_eq!(state.history[0].result, "completed");
    }

    #[tokio::test]
    async fn test_advance_suppressed_by_pending_crp() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;
        store
            .enter_waiting_human(CrpId::new("crp-001").unwrap())
            .await
            .unwrap();

        let next = machine.advance_after(AgentName::Refiner).await.unwrap();
        assert_eq!(next, None);
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::WaitingHuman);
    }

    #[tokio::test]
    async fn test_advance_follows_happy_path() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;

        assert_eq!(
            machine.advance_after(AgentName::Refiner).await.unwrap(),
            Some(Phase::Build)
        );
        assert_eq!(
            machine.advance_after(AgentName::Builder).await.unwrap(),
            Some(Phase::Verify)
        );
        assert_eq!(
            machine.advance_after(AgentName::Verifier).await.unwrap(),
            Some(Phase::Gate)
        );
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Gate);
        assert_eq!(state.history.len(), 3);
    }

    #[tokio::test]
    async fn test_fail_with_iterations_left_rebuilds() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;
        // Simulate being at iteration 2 of 3 in the gate phase.
        store.increment_iteration().await.unwrap();
        store.update_phase(Phase::Gate).await.unwrap();
        store
            .update_agent_status(AgentName::Builder, AgentStatus::Completed, None)
            .await
            .unwrap();
        store.increment_minor_fix_attempt().await.unwrap();

        let outcome = machine
            .handle_verdict(&GateVerdict::bare(Verdict::Fail))
            .await
            .unwrap();
        assert_eq!(outcome, VerdictOutcome::Rebuild { iteration: 3 });

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Build);
        assert_eq!(state.iteration, 3);
        assert_eq!(state.minor_fix_attempts, 0);
        assert_eq!(
            state.agent(AgentName::Builder).unwrap().status,
            AgentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_fail_at_last_iteration_fails_run() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;
        store.increment_iteration().await.unwrap();
        store.increment_iteration().await.unwrap();
        store.update_phase(Phase::Gate).await.unwrap();

        let outcome = machine
            .handle_verdict(&GateVerdict::bare(Verdict::Fail))
            .await
            .unwrap();
        assert!(matches!(outcome, VerdictOutcome::RunFailed { .. }));

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.iteration, state.max_iterations);
    }

    #[tokio::test]
    async fn test_minor_fail_consumes_attempt() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;
        store.update_phase(Phase::Gate).await.unwrap();

        let outcome = machine
            .handle_verdict(&GateVerdict::bare(Verdict::MinorFail))
            .await
            .unwrap();
        assert_eq!(outcome, VerdictOutcome::ReverifyMinor { attempt: 1 });
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Verify);
        assert_eq!(state.minor_fix_attempts, 1);
    }

    #[tokio::test]
    async fn test_minor_fail_overflow_escalates_to_fail() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;
        store.update_phase(Phase::Gate).await.unwrap();
        store.increment_minor_fix_attempt().await.unwrap();
        store.increment_minor_fix_attempt().await.unwrap();

        let outcome = machine
            .handle_verdict(&GateVerdict::bare(Verdict::MinorFail))
            .await
            .unwrap();
        // Escalates: iterations remain, so a rebuild starts.
        assert_eq!(outcome, VerdictOutcome::Rebuild { iteration: 2 });
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.minor_fix_attempts, 0);
    }

    #[tokio::test]
    async fn test_needs_human_takes_no_action() {
        let dir = TempDir::new().unwrap();
        let (machine, store) = machine_with_state(&dir, 3).await;
        store.update_phase(Phase::Gate).await.unwrap();

        let outcome = machine
            .handle_verdict(&GateVerdict::bare(Verdict::NeedsHuman))
            .await
            .unwrap();
        assert_eq!(outcome, VerdictOutcome::AwaitHuman);
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Gate);
        assert!(state.history.is_empty());
    }
}
