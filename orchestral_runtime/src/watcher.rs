//! Filesystem event source for a run directory.
//!
//! Translates raw `notify` events on the run directory into the typed
//! [`PipelineEvent`] stream. Workers communicate exclusively through files,
//! so this is the orchestrator's only input besides the activity monitor:
//! flags are picked up immediately, JSON artifacts only after their size
//! has been stable across two samples (workers may write incrementally).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use orchestral_core::config::OrchestralConfig;
use orchestral_core::errors::{OrchestralError, Result};
use orchestral_core::model::{AgentName, Crp, ErrorFlag, GateVerdict, TestConfig, TestOutput, WorkerOutput};

use crate::events::PipelineEvent;

/// Tunables for the event source.
#[derive(Clone, Copy, Debug)]
pub struct WatcherConfig {
    /// Suppression window per event key
    pub debounce: Duration,
    /// Interval between stability samples for JSON artifacts
    pub stability_poll: Duration,
    /// Hard cap on the stability wait; reaching it reads the file anyway
    pub stability_cap: Duration,
    /// Default budget for [`FileEventSource::wait_for_file`]
    pub default_wait_timeout: Duration,
}

impl WatcherConfig {
    /// Derives the watcher tunables from the effective configuration.
    pub fn from_config(config: &OrchestralConfig) -> Self {
        Self {
            debounce: config.debounce(),
            stability_poll: Duration::from_millis(1000),
            stability_cap: Duration::from_millis(config.file_watcher_stability_ms),
            default_wait_timeout: Duration::from_millis(config.default_file_wait_timeout_ms),
        }
    }
}

/// Artifact classes recognized under the run directory.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Artifact {
    RefinedBriefing,
    DoneFlag(AgentName),
    TestsReady,
    TestOutput,
    Verdict,
    CrpFile(String),
    VcrFile(String),
    MrpSummary,
    AgentOutput(AgentName),
    ErrorFlag(AgentName),
}

impl Artifact {
    /// Debounce key; one key per logical event.
    fn key(&self) -> String {
        match self {
            Artifact::RefinedBriefing => "refiner_done".to_string(),
            Artifact::DoneFlag(agent) => format!("{agent}_done"),
            Artifact::TestsReady => "tests_ready".to_string(),
            Artifact::TestOutput => "test_execution_done".to_string(),
            Artifact::Verdict => "gatekeeper_done".to_string(),
            Artifact::CrpFile(stem) => format!("crp_created_{stem}"),
            Artifact::VcrFile(stem) => format!("vcr_created_{stem}"),
            Artifact::MrpSummary => "mrp_created".to_string(),
            Artifact::AgentOutput(agent) => format!("agent_output_{agent}"),
            Artifact::ErrorFlag(agent) => format!("error_flag_{agent}"),
        }
    }
}

/// Watches one run directory and emits typed pipeline events.
pub struct FileEventSource {
    run_dir: PathBuf,
    config: WatcherConfig,
    sender: mpsc::UnboundedSender<PipelineEvent>,
    watcher: Arc<StdMutex<Option<RecommendedWatcher>>>,
    debounce: Arc<StdMutex<HashMap<String, Instant>>>,
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl FileEventSource {
    /// Source over a run directory with tunables from the effective config.
    pub fn new(
        run_dir: impl Into<PathBuf>,
        config: &OrchestralConfig,
        sender: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self::with_config(run_dir, WatcherConfig::from_config(config), sender)
    }

    /// Source with explicit tunables (used by tests).
    pub fn with_config(
        run_dir: impl Into<PathBuf>,
        config: WatcherConfig,
        sender: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            run_dir: run_dir.into(),
            config,
            sender,
            watcher: Arc::new(StdMutex::new(None)),
            debounce: Arc::new(StdMutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            task: StdMutex::new(None),
        }
    }

    /// Creates a new channel pair for pipeline events.
    pub fn channel() -> (
        mpsc::UnboundedSender<PipelineEvent>,
        mpsc::UnboundedReceiver<PipelineEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    /// Starts watching. Raw notify events flow through an internal channel
    /// into a classifier task owned by this source.
    pub fn start(&self) -> Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| OrchestralError::Watch(e.to_string()))?;
        watcher
            .watch(&self.run_dir, RecursiveMode::Recursive)
            .map_err(|e| OrchestralError::Watch(e.to_string()))?;
        *self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(watcher);

        let run_dir = self.run_dir.clone();
        let config = self.config;
        let sender = self.sender.clone();
        let debounce = Arc::clone(&self.debounce);
        let stopped = Arc::clone(&self.stopped);
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    event = raw_rx.recv() => match event {
                        Some(Ok(event)) => {
                            if stopped.load(Ordering::SeqCst) {
                                break;
                            }
                            handle_raw_event(&run_dir, config, &sender, &debounce, event);
                        }
                        Some(Err(e)) => {
                            let _ = sender.send(PipelineEvent::Error {
                                message: format!("watch error: {e}"),
                            });
                        }
                        None => break,
                    }
                }
            }
        });
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        debug!(run_dir = %self.run_dir.display(), "file event source started");
        Ok(())
    }

    /// Stops the source cleanly; the classifier task is awaited.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(watcher);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// One-shot alternative to event subscription: waits for a file to
    /// exist under the run directory.
    ///
    /// All `stat` failures count as "not yet"; only the total timeout
    /// bounds the wait.
    pub async fn wait_for_file(&self, rel: &Path, timeout: Option<Duration>) -> Result<PathBuf> {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_wait_timeout);
        let path = self.run_dir.join(rel);
        loop {
            if matches!(tokio::fs::try_exists(&path).await, Ok(true)) {
                return Ok(path);
            }
            if Instant::now() >= deadline {
                return Err(OrchestralError::Watch(format!(
                    "timed out waiting for {}",
                    rel.display()
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn handle_raw_event(
    run_dir: &Path,
    config: WatcherConfig,
    sender: &mpsc::UnboundedSender<PipelineEvent>,
    debounce: &Arc<StdMutex<HashMap<String, Instant>>>,
    event: notify::Event,
) {
    if !matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
    ) {
        return;
    }
    for path in event.paths {
        let Ok(rel) = path.strip_prefix(run_dir) else {
            continue;
        };
        let Some(artifact) = classify(rel) else {
            continue;
        };
        if !debounce_allows(debounce, config.debounce, &artifact.key()) {
            continue;
        }
        dispatch(config, sender.clone(), path.clone(), artifact);
    }
}

/// Maps a run-relative path onto the artifact class it represents.
fn classify(rel: &Path) -> Option<Artifact> {
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .collect();
    match parts.as_slice() {
        ["briefing", "refined.md"] => Some(Artifact::RefinedBriefing),
        ["builder", "done.flag"] => Some(Artifact::DoneFlag(AgentName::Builder)),
        ["verifier", "done.flag"] => Some(Artifact::DoneFlag(AgentName::Verifier)),
        ["verifier", "tests-ready.flag"] => Some(Artifact::TestsReady),
        ["verifier", "test-output.json"] => Some(Artifact::TestOutput),
        ["gatekeeper", "verdict.json"] => Some(Artifact::Verdict),
        ["mrp", "summary.md"] => Some(Artifact::MrpSummary),
        ["crp", file] => json_stem(file).map(|s| Artifact::CrpFile(s.to_string())),
        ["vcr", file] => json_stem(file).map(|s| Artifact::VcrFile(s.to_string())),
        [agent, "output.json"] => agent.parse().ok().map(Artifact::AgentOutput),
        [agent, "error.flag"] => agent.parse().ok().map(Artifact::ErrorFlag),
        _ => None,
    }
}

fn json_stem(file: &str) -> Option<&str> {
    file.strip_suffix(".json")
}

/// Records an emission for `key` unless one happened within the debounce
/// window. The table is pruned when it grows past a bound.
fn debounce_allows(
    table: &Arc<StdMutex<HashMap<String, Instant>>>,
    window: Duration,
    key: &str,
) -> bool {
    let mut table = match table.lock() {
        Ok(table) => table,
        Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    if let Some(last) = table.get(key) {
        if now.duration_since(*last) < window {
            return false;
        }
    }
    if table.len() > 256 {
        table.retain(|_, last| now.duration_since(*last) < window);
    }
    table.insert(key.to_string(), now);
    true
}

/// Emits the event for a classified artifact. JSON reads happen in a
/// spawned task so a slow writer never blocks other artifacts.
fn dispatch(
    config: WatcherConfig,
    sender: mpsc::UnboundedSender<PipelineEvent>,
    path: PathBuf,
    artifact: Artifact,
) {
    match artifact {
        Artifact::RefinedBriefing => {
            let _ = sender.send(PipelineEvent::RefinerDone);
        }
        Artifact::DoneFlag(AgentName::Builder) => {
            let _ = sender.send(PipelineEvent::BuilderDone);
        }
        Artifact::DoneFlag(agent) => {
            debug_assert_eq!(agent, AgentName::Verifier);
            let _ = sender.send(PipelineEvent::VerifierDone);
        }
        Artifact::MrpSummary => {
            let _ = sender.send(PipelineEvent::MrpCreated);
        }
        Artifact::TestsReady => {
            // The flag needs no stability wait, but the sibling config is
            // a JSON artifact and does.
            let config_path = path.with_file_name("test-config.json");
            tokio::spawn(async move {
                let event = match read_stable_json::<TestConfig>(&config_path, config).await {
                    Ok(parsed) => PipelineEvent::TestsReady { config: parsed },
                    Err(message) => PipelineEvent::Error { message },
                };
                let _ = sender.send(event);
            });
        }
        Artifact::TestOutput => {
            tokio::spawn(async move {
                let event = match read_stable_json::<TestOutput>(&path, config).await {
                    Ok(output) => PipelineEvent::TestExecutionDone { output },
                    Err(message) => PipelineEvent::Error { message },
                };
                let _ = sender.send(event);
            });
        }
        Artifact::Verdict => {
            tokio::spawn(async move {
                let event = match read_stable_json::<GateVerdict>(&path, config).await {
                    Ok(verdict) => PipelineEvent::GatekeeperDone { verdict },
                    Err(message) => PipelineEvent::Error { message },
                };
                let _ = sender.send(event);
            });
        }
        Artifact::CrpFile(_) => {
            tokio::spawn(async move {
                match read_stable_json::<Crp>(&path, config).await {
                    // A resolution rewrite re-lands the same file; only a
                    // pending CRP is a new clarification.
                    Ok(crp) if !crp.is_resolved() => {
                        let _ = sender.send(PipelineEvent::CrpCreated { crp });
                    }
                    Ok(_) => {}
                    Err(message) => {
                        let _ = sender.send(PipelineEvent::Error { message });
                    }
                }
            });
        }
        Artifact::VcrFile(_) => {
            tokio::spawn(async move {
                let event = match read_stable_json::<orchestral_core::model::Vcr>(&path, config).await
                {
                    Ok(vcr) => PipelineEvent::VcrCreated {
                        vcr_id: vcr.vcr_id,
                        crp_id: vcr.crp_id,
                    },
                    Err(message) => PipelineEvent::Error { message },
                };
                let _ = sender.send(event);
            });
        }
        Artifact::AgentOutput(agent) => {
            tokio::spawn(async move {
                let event = match read_stable_json::<WorkerOutput>(&path, config).await {
                    Ok(output) => PipelineEvent::AgentOutput { agent, output },
                    Err(message) => PipelineEvent::Error { message },
                };
                let _ = sender.send(event);
            });
        }
        Artifact::ErrorFlag(agent) => {
            // Flag files are read without stability checks. A flag that is
            // not valid JSON becomes a synthetic non-recoverable crash.
            tokio::spawn(async move {
                let flag = match tokio::fs::read(&path).await {
                    Ok(bytes) => serde_json::from_slice::<ErrorFlag>(&bytes).unwrap_or_else(|e| {
                        warn!(path = %path.display(), error = %e, "unparseable error flag");
                        ErrorFlag::synthetic_crash(
                            agent,
                            format!("error.flag is not valid JSON: {e}"),
                        )
                    }),
                    Err(e) => ErrorFlag::synthetic_crash(agent, format!("error.flag unreadable: {e}")),
                };
                let _ = sender.send(PipelineEvent::ErrorFlagged { agent, flag });
            });
        }
    }
}

/// Waits for the file size to be stable across two samples, then reads and
/// parses it. Stat failures count as "not yet"; hitting the cap reads the
/// file regardless.
async fn read_stable_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    config: WatcherConfig,
) -> std::result::Result<T, String> {
    wait_for_stable(path, config.stability_poll, config.stability_cap).await;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("{}: {e}", path.display()))
}

async fn wait_for_stable(path: &Path, poll: Duration, cap: Duration) {
    let started = Instant::now();
    let mut previous: Option<u64> = None;
    loop {
        let size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
        if size.is_some() && size == previous {
            return;
        }
        previous = size;
        if started.elapsed() >= cap {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}
