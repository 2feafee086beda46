//! Worker lifecycle for the four agent slots.
//!
//! One worker per slot within a run; launches are serialized by the
//! orchestrator's event loop. The lifecycle binds prompt files and output
//! directories, keeps agent status and the armed deadline in the state
//! document, and pipes reported usage into the aggregate.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use orchestral_core::config::AgentTimeouts;
use orchestral_core::errors::{OrchestralError, Result};
use orchestral_core::model::{AgentName, AgentStatus, Usage, WorkerOutput};
use orchestral_core::run_store::RunPaths;
use orchestral_core::state_store::StateStore;
use orchestral_runtime::monitor::ActivityMonitor;

use crate::runner::Runner;

/// Manages one worker process per agent slot within a run.
pub struct AgentLifecycle {
    runner: Arc<dyn Runner>,
    state: Arc<StateStore>,
    monitor: Arc<ActivityMonitor>,
    paths: RunPaths,
    timeouts: AgentTimeouts,
    models: BTreeMap<AgentName, String>,
}

impl AgentLifecycle {
    /// Lifecycle bound to one run's paths, state, and monitor.
    pub fn new(
        runner: Arc<dyn Runner>,
        state: Arc<StateStore>,
        monitor: Arc<ActivityMonitor>,
        paths: RunPaths,
        timeouts: AgentTimeouts,
        models: BTreeMap<AgentName, String>,
    ) -> Self {
        Self {
            runner,
            state,
            monitor,
            paths,
            timeouts,
            models,
        }
    }

    /// The model selected for an agent slot.
    ///
    /// # Errors
    ///
    /// Validation error if no model is selected for the slot; a worker is
    /// never launched without one.
    pub fn model_for(&self, agent: AgentName) -> Result<&str> {
        self.models
            .get(&agent)
            .map(String::as_str)
            .ok_or_else(|| {
                OrchestralError::Validation(format!("no model selected for agent {agent}"))
            })
    }

    /// Launches a worker for an agent slot with its standard prompt file.
    pub async fn start_agent(&self, agent: AgentName) -> Result<()> {
        let prompt = self.paths.prompt(agent);
        self.launch(agent, &prompt, None, false).await
    }

    /// Launches a worker with an explicit timeout budget (used when a
    /// recovery strategy extends it).
    pub async fn start_agent_with_budget(&self, agent: AgentName, budget: Duration) -> Result<()> {
        let prompt = self.paths.prompt(agent);
        self.launch(agent, &prompt, Some(budget), false).await
    }

    /// Relaunches the agent that raised a CRP with its continuation prompt.
    pub async fn restart_agent_with_vcr(&self, agent: AgentName, prompt_file: &Path) -> Result<()> {
        self.launch(agent, prompt_file, None, true).await
    }

    /// Launches the Verifier with the Phase-2 prompt after the external
    /// test runner finished.
    pub async fn start_verifier_phase2(&self, prompt_file: &Path) -> Result<()> {
        self.launch(AgentName::Verifier, prompt_file, None, false)
            .await
    }

    async fn launch(
        &self,
        agent: AgentName,
        prompt_file: &Path,
        budget: Option<Duration>,
        via_vcr: bool,
    ) -> Result<()> {
        let model = self.model_for(agent)?.to_string();
        let budget = budget.unwrap_or_else(|| self.timeouts.for_agent(agent));

        self.state
            .update_agent_status(agent, AgentStatus::Running, None)
            .await?;
        let deadline =
            Utc::now() + chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::zero());
        self.state.set_agent_timeout(agent, Some(deadline)).await?;
        self.monitor.watch_agent_for(agent, budget);

        let output_dir = self.paths.agent_dir(agent);
        let launch = if via_vcr {
            self.runner
                .restart_with_vcr(agent, &model, prompt_file, &output_dir)
                .await
        } else {
            self.runner
                .start_headless(agent, &model, prompt_file, &output_dir)
                .await
        };
        if let Err(e) = launch {
            self.monitor.unwatch_agent(agent);
            self.state
                .update_agent_status(agent, AgentStatus::Failed, Some(e.to_string()))
                .await?;
            return Err(e);
        }

        info!(%agent, model, via_vcr, "worker launched");
        Ok(())
    }

    /// Disarms monitoring for an agent. Status is set by the caller.
    pub fn stop_agent(&self, agent: AgentName) {
        self.monitor.unwatch_agent(agent);
    }

    /// Marks an agent completed and disarms its watch.
    pub async fn complete_agent(&self, agent: AgentName) -> Result<()> {
        self.stop_agent(agent);
        self.state
            .update_agent_status(agent, AgentStatus::Completed, None)
            .await?;
        self.state.set_agent_timeout(agent, None).await?;
        Ok(())
    }

    /// Marks an agent failed (or timed out) and disarms its watch.
    pub async fn fail_agent(
        &self,
        agent: AgentName,
        status: AgentStatus,
        error: impl Into<String>,
    ) -> Result<()> {
        debug_assert!(matches!(status, AgentStatus::Failed | AgentStatus::Timeout));
        self.stop_agent(agent);
        self.state
            .update_agent_status(agent, status, Some(error.into()))
            .await?;
        self.state.set_agent_timeout(agent, None).await?;
        Ok(())
    }

    /// Marks the Verifier as handed off to the external test runner.
    pub async fn set_agent_waiting_test_execution(&self) -> Result<()> {
        self.state
            .update_agent_status(AgentName::Verifier, AgentStatus::WaitingTestExecution, None)
            .await?;
        Ok(())
    }

    /// Marks an agent as blocked on a human reply and disarms its watch.
    pub async fn set_agent_waiting_human(&self, agent: AgentName) -> Result<()> {
        self.stop_agent(agent);
        self.state
            .update_agent_status(agent, AgentStatus::WaitingHuman, None)
            .await?;
        Ok(())
    }

    /// Records usage from a worker output document and returns the new
    /// aggregate.
    pub async fn record_usage(&self, agent: AgentName, output: &WorkerOutput) -> Result<Usage> {
        let state = self.state.update_agent_usage(agent, output.to_usage()).await?;
        debug!(%agent, cost_usd = state.usage.cost_usd, "usage updated");
        Ok(state.usage)
    }

    /// Captured terminal output for an agent, if the surface has any.
    pub fn capture_output(&self, agent: AgentName, lines: usize) -> Option<String> {
        self.runner.capture_output(agent, lines)
    }

    /// Stops monitoring and tears the worker surface down.
    pub async fn cleanup(&self) {
        self.monitor.stop();
        self.runner.kill().await;
    }
}
