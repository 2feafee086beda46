//! The composition root for one run.
//!
//! The orchestrator wires the stores, the filesystem event source, the
//! activity monitor, the lifecycle, and the phase machine together, then
//! services one event at a time from the merged streams. Handlers run to
//! completion before the next event is taken, so no two handlers ever
//! observe interleaved state. Handler errors are logged and recorded
//! against the run; only `start_run`/`resume_run` return errors to callers.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orchestral_core::config::OrchestralConfig;
use orchestral_core::errors::{OrchestralError, Result};
use orchestral_core::event_log::EventLog;
use orchestral_core::ids::{CrpId, RunId};
use orchestral_core::model::{
    AgentName, AgentStatus, Crp, ErrorFlag, GateVerdict, ModelSelection, Phase, RunState, Usage,
    Vcr, WorkerErrorType, WorkerOutput,
};
use orchestral_core::run_store::{RunPaths, RunStore};
use orchestral_core::state_store::StateStore;
use orchestral_runtime::events::{MonitorEvent, PipelineEvent};
use orchestral_runtime::monitor::{ActivityMonitor, MonitorConfig};
use orchestral_runtime::watcher::FileEventSource;

use crate::lifecycle::AgentLifecycle;
use crate::mrp::MrpAssembler;
use crate::phase::{PhaseMachine, VerdictOutcome};
use crate::prompts;
use crate::recovery::{RecoveryAction, RecoveryStrategies};
use crate::retry::{RetryEvent, RetryPolicy};
use crate::runner::{ModelSelector, PromptContext, PromptGenerator, Runner, RunnerProbe};

/// Model assigned to every agent when no selector is configured.
pub const DEFAULT_MODEL: &str = "worker-default";

/// Lines of terminal output captured per activity sample.
const PROBE_LINES: usize = 40;

/// Everything the event loop needs for one run.
struct RunContext {
    run_id: RunId,
    paths: RunPaths,
    workspace_root: PathBuf,
    config: OrchestralConfig,
    store: RunStore,
    state: Arc<StateStore>,
    source: FileEventSource,
    monitor: Arc<ActivityMonitor>,
    lifecycle: AgentLifecycle,
    machine: PhaseMachine,
    log: EventLog,
    retry: RetryPolicy,
    recovery: RecoveryStrategies,
    runner: Arc<dyn Runner>,
    prompts: Arc<dyn PromptGenerator>,
    running: AtomicBool,
    shutdown: Notify,
    retry_counts: StdMutex<HashMap<AgentName, u32>>,
}

struct ActiveRun {
    ctx: Arc<RunContext>,
    loop_task: JoinHandle<()>,
}

/// Orchestrates the Refine->Build->Verify->Gate pipeline for one workspace.
pub struct Orchestrator {
    workspace_root: PathBuf,
    store: RunStore,
    config: OrchestralConfig,
    max_iterations: u32,
    runner: Arc<dyn Runner>,
    prompts: Arc<dyn PromptGenerator>,
    selector: Option<Arc<dyn ModelSelector>>,
    default_models: BTreeMap<AgentName, String>,
    active: Mutex<Option<ActiveRun>>,
}

impl Orchestrator {
    /// Orchestrator over a workspace, with a runner and prompt generator.
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        config: OrchestralConfig,
        runner: Arc<dyn Runner>,
        prompts: Arc<dyn PromptGenerator>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let store = RunStore::new(&workspace_root);
        let default_models = AgentName::ALL
            .iter()
            .map(|a| (*a, DEFAULT_MODEL.to_string()))
            .collect();
        Self {
            workspace_root,
            store,
            config,
            max_iterations: 3,
            runner,
            prompts,
            selector: None,
            default_models,
            active: Mutex::new(None),
        }
    }

    /// Attaches an optional model selector consulted on each briefing.
    pub fn with_model_selector(mut self, selector: Arc<dyn ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Overrides the per-agent models used when no selector is configured.
    pub fn with_default_models(mut self, models: BTreeMap<AgentName, String>) -> Self {
        self.default_models = models;
        self
    }

    /// Overrides the iteration cap for new runs (must be in `1..=100`).
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// The run store this orchestrator operates through.
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Starts a new run from a raw briefing and launches the Refiner.
    ///
    /// # Errors
    ///
    /// `Busy` if a run is already active in this workspace; validation
    /// errors for a bad briefing.
    pub async fn start_run(&self, raw_briefing: &str) -> Result<RunId> {
        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if run.ctx.running.load(Ordering::SeqCst) {
                return Err(OrchestralError::Busy);
            }
        }
        if self.store.get_active_run().await?.is_some() {
            // A run from a previous process still holds the workspace.
            return Err(OrchestralError::Busy);
        }

        let run_id = self.store.generate_run_id();
        self.store
            .create_run(&run_id, raw_briefing, self.max_iterations)
            .await?;

        match self.initialize_run(&run_id, raw_briefing).await {
            Ok(active_run) => {
                *active = Some(active_run);
                info!(%run_id, "run started");
                Ok(run_id)
            }
            Err(e) => {
                // Never leave a half-initialized run holding the workspace.
                if let Ok(state) = self.store.state_store(&run_id, self.config.state_cache_ttl()) {
                    let message = e.to_string();
                    let _ = state
                        .update(move |s| {
                            for agent in AgentName::ALL {
                                if s.agent(agent).map(|a| a.status) == Some(AgentStatus::Running) {
                                    s.set_agent_status(
                                        agent,
                                        AgentStatus::Failed,
                                        Some("run initialization failed".to_string()),
                                        chrono::Utc::now(),
                                    );
                                }
                            }
                            s.errors.push(message);
                            s.phase = Phase::Failed;
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn initialize_run(&self, run_id: &RunId, raw_briefing: &str) -> Result<ActiveRun> {
        let selection = match &self.selector {
            Some(selector) => Some(selector.select_models(raw_briefing).await?),
            None => None,
        };
        let models = match &selection {
            Some(selection) => selection.models.clone(),
            None => self.default_models.clone(),
        };

        let state = Arc::new(
            self.store
                .state_store(run_id, self.config.state_cache_ttl())?,
        );
        if let Some(selection) = &selection {
            self.store.save_model_selection(run_id, selection).await?;
            state.update_model_selection(selection.clone()).await?;
        }

        let paths = self.store.paths(run_id)?;
        self.prompts
            .generate_all(
                &paths.prompts_dir(),
                &PromptContext {
                    project_root: self.workspace_root.clone(),
                    run_id: run_id.clone(),
                    iteration: 1,
                    has_review: false,
                },
            )
            .await?;

        let (ctx, pipe_rx, mon_rx, retry_rx) = self.build_context(run_id.clone(), models)?;
        ctx.source.start()?;
        ctx.monitor.start();
        ctx.log
            .info("run_started", &[("run_id", run_id.to_string())])
            .await?;
        ctx.lifecycle.start_agent(AgentName::Refiner).await?;

        let loop_task = tokio::spawn(run_event_loop(Arc::clone(&ctx), pipe_rx, mon_rx, retry_rx));
        Ok(ActiveRun { ctx, loop_task })
    }

    /// Resumes a run blocked in `waiting_human` after its VCR was saved.
    ///
    /// Reloads state, re-opens watchers if needed, clears the pending CRP,
    /// and relaunches the agent that authored it with a continuation
    /// prompt.
    pub async fn resume_run(&self, run_id: &RunId) -> Result<()> {
        let mut active = self.active.lock().await;

        let state_store = Arc::new(
            self.store
                .state_store(run_id, self.config.state_cache_ttl())?,
        );
        let state = state_store
            .load()
            .await?
            .ok_or_else(|| OrchestralError::RunNotFound(run_id.to_string()))?;
        if state.phase != Phase::WaitingHuman {
            return Err(OrchestralError::Validation(format!(
                "run {run_id} is in phase {}, not waiting_human",
                state.phase
            )));
        }
        let pending = state
            .pending_crp
            .clone()
            .ok_or_else(|| OrchestralError::Validation("no pending CRP recorded".to_string()))?;
        let crp = self
            .store
            .get_crp(run_id, &pending)
            .await?
            .ok_or_else(|| OrchestralError::Validation(format!("pending CRP {pending} missing")))?;
        let vcr = self
            .store
            .list_vcrs(run_id)
            .await?
            .into_iter()
            .find(|v| v.crp_id == pending)
            .ok_or_else(|| {
                OrchestralError::Validation(format!("no VCR resolves pending CRP {pending}"))
            })?;

        if let Some(run) = active.as_ref() {
            if run.ctx.run_id == *run_id && run.ctx.running.load(Ordering::SeqCst) {
                let ctx = Arc::clone(&run.ctx);
                drop(active);
                return ctx.resume(&crp, &vcr).await;
            }
        }

        // Fresh process: rebuild the component set around the stored run.
        let models = match state.model_selection.as_ref() {
            Some(selection) => selection.models.clone(),
            None => self.default_models.clone(),
        };
        let (ctx, pipe_rx, mon_rx, retry_rx) = self.build_context(run_id.clone(), models)?;
        ctx.source.start()?;
        ctx.monitor.start();
        let loop_task = tokio::spawn(run_event_loop(Arc::clone(&ctx), pipe_rx, mon_rx, retry_rx));
        ctx.resume(&crp, &vcr).await?;
        *active = Some(ActiveRun { ctx, loop_task });
        Ok(())
    }

    /// Saves a human reply and, if the run is waiting on it, resumes.
    pub async fn submit_vcr(&self, run_id: &RunId, vcr: &Vcr) -> Result<()> {
        self.store.save_vcr(run_id, vcr).await?;
        let state_store = self
            .store
            .state_store(run_id, self.config.state_cache_ttl())?;
        if let Some(state) = state_store.load().await? {
            if state.phase == Phase::WaitingHuman && state.pending_crp == Some(vcr.crp_id.clone()) {
                return self.resume_run(run_id).await;
            }
        }
        Ok(())
    }

    /// Ordered, idempotent teardown of the active run.
    pub async fn stop_run(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(run) = active.take() {
            run.ctx.shutdown_now().await;
            let _ = run.loop_task.await;
            info!(run_id = %run.ctx.run_id, "run stopped");
        }
        Ok(())
    }

    /// Whether a run is currently being orchestrated by this instance.
    pub async fn get_is_running(&self) -> bool {
        let active = self.active.lock().await;
        active
            .as_ref()
            .is_some_and(|run| run.ctx.running.load(Ordering::SeqCst))
    }

    /// Identity of the run under orchestration, if any.
    pub async fn get_current_run_id(&self) -> Option<RunId> {
        let active = self.active.lock().await;
        active.as_ref().map(|run| run.ctx.run_id.clone())
    }

    /// Current state document of the run under orchestration.
    pub async fn get_current_state(&self) -> Result<Option<RunState>> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => run.ctx.state.load().await,
            None => Ok(None),
        }
    }

    /// Parsed `<agent>/output.json` of the run under orchestration.
    pub async fn get_agent_outputs(&self, agent: AgentName) -> Result<Option<WorkerOutput>> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) => {
                orchestral_core::fsutil::read_json_opt(&run.ctx.paths.agent_output(agent)).await
            }
            None => Ok(None),
        }
    }

    /// Captured terminal output for an agent.
    pub async fn get_agent_activity(&self, agent: AgentName) -> Option<String> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .and_then(|run| run.ctx.runner.capture_output(agent, PROBE_LINES))
    }

    /// One agent's recorded usage.
    pub async fn get_agent_usage(&self, agent: AgentName) -> Result<Option<Usage>> {
        Ok(self
            .get_current_state()
            .await?
            .and_then(|s| s.agent(agent).and_then(|a| a.usage)))
    }

    /// Aggregate usage for the run under orchestration.
    pub async fn get_total_usage(&self) -> Result<Option<Usage>> {
        Ok(self.get_current_state().await?.map(|s| s.usage))
    }

    /// Recorded model selection for the run under orchestration.
    pub async fn get_selected_models(&self) -> Result<Option<ModelSelection>> {
        match self.get_current_run_id().await {
            Some(run_id) => self.store.read_model_selection(&run_id).await,
            None => Ok(None),
        }
    }

    /// Builds the full component set for one run.
    #[allow(clippy::type_complexity)]
    fn build_context(
        &self,
        run_id: RunId,
        models: BTreeMap<AgentName, String>,
    ) -> Result<(
        Arc<RunContext>,
        mpsc::UnboundedReceiver<PipelineEvent>,
        mpsc::UnboundedReceiver<MonitorEvent>,
        mpsc::UnboundedReceiver<RetryEvent>,
    )> {
        let paths = self.store.paths(&run_id)?;
        let state = Arc::new(
            self.store
                .state_store(&run_id, self.config.state_cache_ttl())?,
        );

        let (pipe_tx, pipe_rx) = FileEventSource::channel();
        let source = FileEventSource::new(paths.root(), &self.config, pipe_tx);

        let (mon_tx, mon_rx) = ActivityMonitor::channel();
        let monitor = Arc::new(ActivityMonitor::new(
            MonitorConfig::from_config(&self.config),
            Arc::new(RunnerProbe::new(Arc::clone(&self.runner), PROBE_LINES)),
            mon_tx,
        ));

        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let retry = RetryPolicy::from_config(&self.config).with_events(retry_tx);

        let lifecycle = AgentLifecycle::new(
            Arc::clone(&self.runner),
            Arc::clone(&state),
            Arc::clone(&monitor),
            paths.clone(),
            self.config.agent_timeouts,
            models,
        );

        let ctx = Arc::new(RunContext {
            run_id,
            log: EventLog::new(paths.events_log()),
            paths,
            workspace_root: self.workspace_root.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            machine: PhaseMachine::new(Arc::clone(&state)),
            state,
            source,
            monitor,
            lifecycle,
            retry,
            recovery: RecoveryStrategies::from_config(&self.config),
            runner: Arc::clone(&self.runner),
            prompts: Arc::clone(&self.prompts),
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
            retry_counts: StdMutex::new(HashMap::new()),
        });
        Ok((ctx, pipe_rx, mon_rx, retry_rx))
    }
}

/// Services one event at a time until shutdown.
async fn run_event_loop(
    ctx: Arc<RunContext>,
    mut pipe_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    mut mon_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    mut retry_rx: mpsc::UnboundedReceiver<RetryEvent>,
) {
    while ctx.running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = ctx.shutdown.notified() => break,
            Some(event) = pipe_rx.recv() => {
                if let Err(e) = ctx.handle_pipeline_event(event).await {
                    ctx.record_handler_error(&e).await;
                }
            }
            Some(event) = mon_rx.recv() => {
                if let Err(e) = ctx.handle_monitor_event(event).await {
                    ctx.record_handler_error(&e).await;
                }
            }
            Some(event) = retry_rx.recv() => {
                let _ = ctx
                    .log
                    .info(event.name(), &[("detail", format!("{event:?}"))])
                    .await;
            }
            else => break,
        }
    }
}

impl RunContext {
    /// Errors inside handlers never escape the loop; they are logged and
    /// recorded against the run.
    async fn record_handler_error(&self, e: &OrchestralError) {
        error!(run_id = %self.run_id, error = %e, "event handler failed");
        let _ = self.log.error("error", &[("message", e.to_string())]).await;
        let _ = self.state.add_error(e.to_string()).await;
    }

    async fn handle_pipeline_event(&self, event: PipelineEvent) -> Result<()> {
        let _ = self.state.set_last_event(event.name()).await;
        match event {
            PipelineEvent::RefinerDone => self.agent_done(AgentName::Refiner).await,
            PipelineEvent::BuilderDone => self.agent_done(AgentName::Builder).await,
            PipelineEvent::VerifierDone => self.agent_done(AgentName::Verifier).await,
            PipelineEvent::TestsReady { config } => {
                self.log
                    .info(
                        "tests_ready",
                        &[("command", config.test_command.clone())],
                    )
                    .await?;
                self.lifecycle.set_agent_waiting_test_execution().await
            }
            PipelineEvent::TestExecutionDone { output } => {
                self.log
                    .info(
                        "test_execution_done",
                        &[("exit_code", output.exit_code.to_string())],
                    )
                    .await?;
                let prompt = prompts::verifier_phase2_prompt(&output);
                let path = self.paths.prompts_dir().join("verifier-phase2.md");
                tokio::fs::write(&path, prompt).await?;
                self.lifecycle.start_verifier_phase2(&path).await
            }
            PipelineEvent::GatekeeperDone { verdict } => self.handle_verdict(verdict).await,
            PipelineEvent::CrpCreated { crp } => self.handle_crp(crp).await,
            PipelineEvent::VcrCreated { vcr_id, crp_id } => {
                self.log
                    .info(
                        "vcr_created",
                        &[
                            ("vcr_id", vcr_id.to_string()),
                            ("crp_id", crp_id.to_string()),
                        ],
                    )
                    .await?;
                self.maybe_resume_from(crp_id).await
            }
            PipelineEvent::MrpCreated => self.log.info("mrp_created", &[]).await,
            PipelineEvent::AgentOutput { agent, output } => {
                let total = self.lifecycle.record_usage(agent, &output).await?;
                self.log
                    .info(
                        "usage_updated",
                        &[
                            ("agent", agent.to_string()),
                            ("total_cost_usd", format!("{:.6}", total.cost_usd)),
                        ],
                    )
                    .await
            }
            PipelineEvent::ErrorFlagged { agent, flag } => self.handle_error_flag(agent, flag).await,
            PipelineEvent::Error { message } => {
                warn!(run_id = %self.run_id, message, "event source error");
                self.log.error("error", &[("message", message.clone())]).await?;
                self.state.add_error(message).await?;
                Ok(())
            }
        }
    }

    async fn handle_monitor_event(&self, event: MonitorEvent) -> Result<()> {
        match event {
            MonitorEvent::Timeout { agent } => {
                self.log
                    .error("agent_timeout", &[("agent", agent.to_string())])
                    .await?;
                self.lifecycle
                    .fail_agent(agent, AgentStatus::Timeout, "absolute timeout fired")
                    .await?;
                self.state
                    .add_error(format!("{agent} hit its absolute timeout"))
                    .await?;
                if self.config.auto_retry {
                    self.attempt_recovery(agent, WorkerErrorType::Timeout).await?;
                } else {
                    self.fail_run(format!("{agent} timed out and auto-retry is disabled"))
                        .await?;
                }
                Ok(())
            }
            MonitorEvent::Stale { agent, inactive_ms } => {
                self.log
                    .append(
                        orchestral_core::event_log::EventLevel::Warn,
                        "agent_stale",
                        &[
                            ("agent", agent.to_string()),
                            ("inactive_ms", inactive_ms.to_string()),
                        ],
                    )
                    .await
            }
            MonitorEvent::Recovered { agent } => {
                self.log
                    .info("agent_recovered", &[("agent", agent.to_string())])
                    .await
            }
            MonitorEvent::ProcessEnded { agent } => {
                self.log
                    .append(
                        orchestral_core::event_log::EventLevel::Warn,
                        "process_ended",
                        &[("agent", agent.to_string())],
                    )
                    .await
            }
        }
    }

    /// Completion path shared by Refiner, Builder, and Verifier. Sleeps the
    /// CRP-detection window, then either yields to a clarification or
    /// advances the phase machine and launches the next agent.
    async fn agent_done(&self, agent: AgentName) -> Result<()> {
        let Some(state) = self.state.load().await? else {
            return Err(OrchestralError::StateNotFound);
        };
        if state.phase != Phase::of_agent(agent) {
            debug!(%agent, phase = %state.phase, "stale completion event ignored");
            return Ok(());
        }

        self.log
            .info("agent_done", &[("agent", agent.to_string())])
            .await?;
        self.lifecycle.complete_agent(agent).await?;
        self.clear_retry_count(agent);

        tokio::time::sleep(self.config.crp_detection_delay()).await;

        // The CRP may have been recorded by its event already, or it may
        // still be sitting unannounced on disk; check both.
        let Some(state) = self.state.load().await? else {
            return Err(OrchestralError::StateNotFound);
        };
        if state.pending_crp.is_some() {
            return Ok(());
        }
        let unresolved = self
            .store
            .list_crps(&self.run_id)
            .await?
            .into_iter()
            .find(|c| c.created_by == agent && !c.is_resolved());
        if let Some(crp) = unresolved {
            return self.handle_crp(crp).await;
        }

        if let Some(next) = self.machine.advance_after(agent).await? {
            self.launch_phase_agent(next).await?;
        }
        Ok(())
    }

    async fn launch_phase_agent(&self, phase: Phase) -> Result<()> {
        if let Some(agent) = phase.agent() {
            self.log
                .info("phase_started", &[("phase", phase.to_string())])
                .await?;
            self.lifecycle.start_agent(agent).await?;
        }
        Ok(())
    }

    async fn handle_verdict(&self, verdict: GateVerdict) -> Result<()> {
        let Some(state) = self.state.load().await? else {
            return Err(OrchestralError::StateNotFound);
        };
        if state.phase != Phase::Gate {
            debug!(phase = %state.phase, "verdict outside gate phase ignored");
            return Ok(());
        }
        self.log
            .info(
                "gatekeeper_done",
                &[("verdict", format!("{:?}", verdict.verdict))],
            )
            .await?;
        self.lifecycle.complete_agent(AgentName::Gatekeeper).await?;
        self.clear_retry_count(AgentName::Gatekeeper);

        match self.machine.handle_verdict(&verdict).await? {
            VerdictOutcome::Merge => {
                let state = self
                    .state
                    .load()
                    .await?
                    .ok_or(OrchestralError::StateNotFound)?;
                let assembler = MrpAssembler::new(self.store.clone(), self.run_id.clone())?;
                match assembler.generate(&state).await {
                    Ok(evidence) => {
                        self.log
                            .info(
                                "mrp_assembled",
                                &[("files", evidence.changed_files.len().to_string())],
                            )
                            .await?;
                    }
                    // Assembly failure never rolls back a PASS verdict.
                    Err(e) => {
                        self.log
                            .error("assembly_error", &[("message", e.to_string())])
                            .await?;
                        self.state.add_error(e.to_string()).await?;
                    }
                }
                self.machine.transition(Phase::ReadyForMerge).await?;
                self.runner
                    .show_info(&format!("Run {} is ready for merge", self.run_id))
                    .await;
                self.finish().await;
                Ok(())
            }
            VerdictOutcome::Rebuild { iteration } => {
                for agent in [AgentName::Builder, AgentName::Gatekeeper] {
                    self.store.reset_agent_for_rerun(&self.run_id, agent).await?;
                }
                self.store.reset_verifier_for_retry(&self.run_id).await?;
                self.prompts
                    .generate_all(
                        &self.paths.prompts_dir(),
                        &PromptContext {
                            project_root: self.workspace_root.clone(),
                            run_id: self.run_id.clone(),
                            iteration,
                            has_review: true,
                        },
                    )
                    .await?;
                self.launch_phase_agent(Phase::Build).await
            }
            VerdictOutcome::ReverifyMinor { attempt } => {
                self.log
                    .info("minor_fix", &[("attempt", attempt.to_string())])
                    .await?;
                self.store.reset_verifier_for_retry(&self.run_id).await?;
                self.launch_phase_agent(Phase::Verify).await
            }
            VerdictOutcome::RunFailed { reason } => {
                // The machine already moved the phase to failed.
                self.state.add_error(reason.clone()).await?;
                self.log.error("run_failed", &[("reason", reason)]).await?;
                self.settle_agents().await?;
                self.finish().await;
                Ok(())
            }
            VerdictOutcome::AwaitHuman => Ok(()),
        }
    }

    async fn handle_crp(&self, crp: Crp) -> Result<()> {
        if crp.is_resolved() {
            return Ok(());
        }
        let Some(state) = self.state.load().await? else {
            return Err(OrchestralError::StateNotFound);
        };
        if state.pending_crp.as_ref() == Some(&crp.crp_id) {
            return Ok(());
        }

        self.log
            .info(
                "crp_created",
                &[
                    ("crp_id", crp.crp_id.to_string()),
                    ("agent", crp.created_by.to_string()),
                ],
            )
            .await?;
        self.lifecycle.set_agent_waiting_human(crp.created_by).await?;
        self.machine.enter_waiting_human(crp.crp_id.clone()).await?;

        if !self.config.suppress_bell {
            self.runner
                .show_info(&format!(
                    "\u{7}Clarification needed: {} (from {})",
                    crp.crp_id, crp.created_by
                ))
                .await;
        }
        Ok(())
    }

    /// Resume path driven by a VCR file landing in the run directory.
    async fn maybe_resume_from(&self, crp_id: CrpId) -> Result<()> {
        let Some(state) = self.state.load().await? else {
            return Err(OrchestralError::StateNotFound);
        };
        if state.phase != Phase::WaitingHuman || state.pending_crp != Some(crp_id.clone()) {
            return Ok(());
        }
        let crp = self
            .store
            .get_crp(&self.run_id, &crp_id)
            .await?
            .ok_or_else(|| OrchestralError::Validation(format!("pending CRP {crp_id} missing")))?;
        let vcr = self
            .store
            .list_vcrs(&self.run_id)
            .await?
            .into_iter()
            .find(|v| v.crp_id == crp_id)
            .ok_or_else(|| {
                OrchestralError::Validation(format!("no VCR resolves pending CRP {crp_id}"))
            })?;
        self.resume(&crp, &vcr).await
    }

    /// Clears the pending CRP, writes the continuation prompt, and
    /// relaunches the authoring agent.
    async fn resume(&self, crp: &Crp, vcr: &Vcr) -> Result<()> {
        let agent = crp.created_by;
        let phase = Phase::of_agent(agent);
        self.machine.leave_waiting_human(phase).await?;

        let prompt = prompts::continuation_prompt(crp, vcr);
        let prompt_path = self.paths.continuation_prompt(agent);
        tokio::fs::write(&prompt_path, prompt).await?;

        self.lifecycle
            .restart_agent_with_vcr(agent, &prompt_path)
            .await?;
        self.log
            .info(
                "run_resumed",
                &[
                    ("agent", agent.to_string()),
                    ("vcr_id", vcr.vcr_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn handle_error_flag(&self, agent: AgentName, flag: ErrorFlag) -> Result<()> {
        self.log
            .error(
                "error_flag",
                &[
                    ("agent", agent.to_string()),
                    ("error_type", format!("{:?}", flag.error_type)),
                    ("message", flag.message.clone()),
                ],
            )
            .await?;
        self.lifecycle
            .fail_agent(agent, AgentStatus::Failed, flag.message.clone())
            .await?;
        self.state
            .add_error(format!("{agent}: {}", flag.message))
            .await?;

        if self.recovery.can_recover(&flag) {
            if self.config.auto_retry {
                self.attempt_recovery(agent, flag.error_type).await?;
            } else {
                self.runner
                    .show_info(&format!("{agent} failed ({}): auto-retry disabled", flag.message))
                    .await;
            }
            return Ok(());
        }

        match self.recovery.plan(flag.error_type) {
            RecoveryAction::FailRun { reason } => self.fail_run(reason).await,
            // Relaunchable kind, but the flag itself refused recovery.
            _ => {
                self.fail_run(format!("{agent} declared a non-recoverable {:?}", flag.error_type))
                    .await
            }
        }
    }

    /// One recovery step for a recoverable failure, paced by the retry
    /// policy. Exhaustion fails the run.
    async fn attempt_recovery(&self, agent: AgentName, error_type: WorkerErrorType) -> Result<()> {
        if !self.retry.is_recoverable(error_type) {
            return self
                .fail_run(format!("{agent} failed with non-retryable {error_type:?}"))
                .await;
        }

        let attempt = {
            let mut counts = self
                .retry_counts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = counts.entry(agent).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt > self.retry.max_attempts() {
            self.retry.emit(RetryEvent::Exhausted {
                agent,
                attempts: attempt - 1,
            });
            return self
                .fail_run(format!(
                    "{agent} still failing after {} retries",
                    attempt - 1
                ))
                .await;
        }

        let delay = self.retry.delay_for(attempt);
        self.retry.emit(RetryEvent::Attempt {
            agent,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        tokio::time::sleep(delay).await;

        match self.recovery.plan(error_type) {
            RecoveryAction::RelaunchAfterReset => {
                self.store.reset_agent_for_rerun(&self.run_id, agent).await?;
                self.regenerate_prompts().await?;
                self.lifecycle.start_agent(agent).await
            }
            RecoveryAction::ExtendTimeoutAndRelaunch => {
                self.store.reset_agent_for_rerun(&self.run_id, agent).await?;
                let base = self.config.agent_timeouts.for_agent(agent);
                let budget = match self.recovery.grant_extension(agent) {
                    Some(extra) => (base + extra).min(base * 2),
                    None => base,
                };
                self.lifecycle.start_agent_with_budget(agent, budget).await
            }
            RecoveryAction::FailRun { reason } => self.fail_run(reason).await,
        }
    }

    async fn regenerate_prompts(&self) -> Result<()> {
        let state = self
            .state
            .load()
            .await?
            .ok_or(OrchestralError::StateNotFound)?;
        self.prompts
            .generate_all(
                &self.paths.prompts_dir(),
                &PromptContext {
                    project_root: self.workspace_root.clone(),
                    run_id: self.run_id.clone(),
                    iteration: state.iteration,
                    has_review: state.iteration > 1,
                },
            )
            .await
    }

    fn clear_retry_count(&self, agent: AgentName) {
        let mut counts = self
            .retry_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if counts.remove(&agent).is_some_and(|n| n > 0) {
            self.retry.emit(RetryEvent::Success { agent, attempt: 0 });
        }
    }

    /// Marks the run failed with a reason and tears the loop down.
    async fn fail_run(&self, reason: String) -> Result<()> {
        self.state.add_error(reason.clone()).await?;
        let state = self
            .state
            .load()
            .await?
            .ok_or(OrchestralError::StateNotFound)?;
        if state.phase != Phase::Failed {
            self.machine.transition_with(Phase::Failed, "failed").await?;
        }
        self.log.error("run_failed", &[("reason", reason)]).await?;
        self.settle_agents().await?;
        self.finish().await;
        Ok(())
    }

    /// No agent may stay `running` in a terminal phase.
    async fn settle_agents(&self) -> Result<()> {
        let state = self
            .state
            .load()
            .await?
            .ok_or(OrchestralError::StateNotFound)?;
        for agent in AgentName::ALL {
            if state.agent(agent).map(|a| a.status) == Some(AgentStatus::Running) {
                self.lifecycle
                    .fail_agent(agent, AgentStatus::Failed, "run ended while agent was running")
                    .await?;
            }
        }
        Ok(())
    }

    /// Ends orchestration for this run without killing the surface.
    async fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.monitor.stop();
        self.source.stop().await;
        self.shutdown.notify_one();
    }

    /// Full teardown used by `stop_run`: cleanup, watchers, surface.
    /// Safe to call on an already finished run.
    async fn shutdown_now(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.lifecycle.cleanup().await;
        self.source.stop().await;
        self.shutdown.notify_one();
    }
}
