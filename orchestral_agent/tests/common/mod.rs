//! Shared test harness: a scripted runner and a static prompt generator.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use orchestral_agent::runner::{PromptContext, PromptGenerator, Runner};
use orchestral_agent::Orchestrator;
use orchestral_core::config::{AgentTimeouts, OrchestralConfig};
use orchestral_core::errors::Result;
use orchestral_core::ids::RunId;
use orchestral_core::model::{AgentName, Phase, RunState};
use orchestral_core::run_store::RunStore;

/// One recorded worker launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Launch {
    pub agent: AgentName,
    pub model: String,
    pub via_vcr: bool,
    pub prompt_file: String,
}

/// Runner that records launches instead of spawning real workers.
#[derive(Default)]
pub struct ScriptedRunner {
    pub launches: Mutex<Vec<Launch>>,
    pub messages: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launches_of(&self, agent: AgentName) -> Vec<Launch> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.agent == agent)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn start_headless(
        &self,
        agent: AgentName,
        model: &str,
        prompt_file: &Path,
        _output_dir: &Path,
    ) -> Result<()> {
        self.launches.lock().unwrap().push(Launch {
            agent,
            model: model.to_string(),
            via_vcr: false,
            prompt_file: prompt_file.to_string_lossy().into_owned(),
        });
        Ok(())
    }

    async fn restart_with_vcr(
        &self,
        agent: AgentName,
        model: &str,
        prompt_file: &Path,
        _output_dir: &Path,
    ) -> Result<()> {
        self.launches.lock().unwrap().push(Launch {
            agent,
            model: model.to_string(),
            via_vcr: true,
            prompt_file: prompt_file.to_string_lossy().into_owned(),
        });
        Ok(())
    }

    fn capture_output(&self, _agent: AgentName, _lines: usize) -> Option<String> {
        None
    }

    fn is_agent_active(&self, _agent: AgentName) -> bool {
        true
    }

    async fn show_info(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    async fn kill(&self) {}
}

/// Prompt generator writing fixed markdown for all four agents.
pub struct StaticPrompts;

#[async_trait]
impl PromptGenerator for StaticPrompts {
    async fn generate_all(&self, prompts_dir: &Path, ctx: &PromptContext) -> Result<()> {
        for agent in AgentName::ALL {
            let body = format!(
                "# {agent} prompt\n\nrun: {}\niteration: {}\nhas_review: {}\n",
                ctx.run_id, ctx.iteration, ctx.has_review
            );
            tokio::fs::write(prompts_dir.join(format!("{agent}.md")), body).await?;
        }
        Ok(())
    }
}

/// Configuration tightened for tests: short windows, no bell.
pub fn fast_config() -> OrchestralConfig {
    OrchestralConfig {
        debounce_ms: 300,
        activity_check_interval_ms: 10_000,
        max_inactivity_ms: 60_000,
        file_watcher_stability_ms: 3_000,
        default_file_wait_timeout_ms: 2_000,
        retry_base_delay_ms: 30,
        retry_max_delay_ms: 100,
        retry_max_attempts: 2,
        auto_retry: true,
        state_cache_ttl_ms: 0,
        agent_timeouts: AgentTimeouts {
            refiner_ms: 60_000,
            builder_ms: 60_000,
            verifier_ms: 60_000,
            gatekeeper_ms: 60_000,
        },
        crp_detection_delay_ms: 400,
        max_minor_fix_attempts: 2,
        timeout_extension_ms: 1000,
        suppress_bell: true,
    }
}

/// Orchestrator over a temp workspace with the scripted collaborators.
pub fn orchestrator_in(workspace: &Path, runner: Arc<ScriptedRunner>) -> Orchestrator {
    Orchestrator::new(
        workspace,
        fast_config(),
        runner,
        Arc::new(StaticPrompts),
    )
    .with_max_iterations(3)
}

/// Polls the run state until the predicate holds or the timeout elapses.
pub async fn wait_for_state<F>(store: &RunStore, run_id: &RunId, timeout: Duration, pred: F) -> RunState
where
    F: Fn(&RunState) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let state_store = store.state_store(run_id, Duration::from_millis(0)).unwrap();
        if let Ok(Some(state)) = state_store.load().await {
            if pred(&state) {
                return state;
            }
            if Instant::now() >= deadline {
                panic!(
                    "state predicate never held; phase={} iteration={} errors={:?}",
                    state.phase, state.iteration, state.errors
                );
            }
        } else if Instant::now() >= deadline {
            panic!("state never became readable");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Polls until the run reaches the given phase.
pub async fn wait_for_phase(store: &RunStore, run_id: &RunId, phase: Phase, timeout: Duration) -> RunState {
    wait_for_state(store, run_id, timeout, |s| s.phase == phase).await
}
