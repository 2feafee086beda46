//! Collaborator seams: the worker runner, prompt generator, and model
//! selector.
//!
//! The orchestrator never interprets worker logic. It talks to the terminal
//! surface through [`Runner`], asks an external [`PromptGenerator`] for the
//! prompt files, and optionally consults a [`ModelSelector`] on the raw
//! briefing. All three are object-safe async traits so hosts can plug in
//! their own implementations (and tests can script them).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use orchestral_core::errors::Result;
use orchestral_core::ids::RunId;
use orchestral_core::model::{AgentName, ModelSelection};
use orchestral_runtime::monitor::AgentProbe;

/// Environment variable that marks a worker subprocess as operating under
/// orchestrator control. Runner implementations must set it on launch.
pub const MANAGED_ENV_FLAG: &str = "ORCHESTRAL_MANAGED";

/// Terminal surface that hosts worker processes.
///
/// Implementations launch one worker per agent slot, with stdout redirected
/// to `<agent>/output.json` and stderr to `<agent>/error.log` inside the
/// given output directory.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Launches a worker headlessly for an agent slot.
    async fn start_headless(
        &self,
        agent: AgentName,
        model: &str,
        prompt_file: &Path,
        output_dir: &Path,
    ) -> Result<()>;

    /// Relaunches a worker with a continuation prompt after a human reply.
    async fn restart_with_vcr(
        &self,
        agent: AgentName,
        model: &str,
        prompt_file: &Path,
        output_dir: &Path,
    ) -> Result<()>;

    /// Captures up to `lines` of the agent's current terminal output.
    fn capture_output(&self, agent: AgentName, lines: usize) -> Option<String>;

    /// Whether the surface still reports the agent as live.
    fn is_agent_active(&self, agent: AgentName) -> bool;

    /// Shows an informational message on the surface (also used for the
    /// terminal bell on CRP creation).
    async fn show_info(&self, message: &str);

    /// Tears the surface down, killing any remaining workers.
    async fn kill(&self);
}

/// Context handed to the prompt generator before each launch.
#[derive(Clone, Debug)]
pub struct PromptContext {
    /// Workspace the run operates on
    pub project_root: std::path::PathBuf,
    /// The run being prompted for
    pub run_id: RunId,
    /// Current iteration
    pub iteration: u32,
    /// Whether a Gatekeeper review exists from a previous iteration
    pub has_review: bool,
}

/// Produces the four per-agent prompt files before worker launch.
#[async_trait]
pub trait PromptGenerator: Send + Sync + 'static {
    /// Writes `prompts/<agent>.md` for all four agents.
    async fn generate_all(&self, prompts_dir: &Path, ctx: &PromptContext) -> Result<()>;
}

/// Chooses per-agent models from the raw briefing. Deterministic given its
/// input.
#[async_trait]
pub trait ModelSelector: Send + Sync + 'static {
    /// Returns the per-agent model choices.
    async fn select_models(&self, briefing: &str) -> Result<ModelSelection>;
}

/// Adapter exposing a [`Runner`] as the activity monitor's probe.
pub struct RunnerProbe {
    runner: Arc<dyn Runner>,
    lines: usize,
}

impl RunnerProbe {
    /// Probe capturing up to `lines` of output per sample.
    pub fn new(runner: Arc<dyn Runner>, lines: usize) -> Self {
        Self { runner, lines }
    }
}

impl AgentProbe for RunnerProbe {
    fn capture_output(&self, agent: AgentName) -> Option<String> {
        self.runner.capture_output(agent, self.lines)
    }

    fn is_agent_active(&self, agent: AgentName) -> bool {
        self.runner.is_agent_active(agent)
    }
}
