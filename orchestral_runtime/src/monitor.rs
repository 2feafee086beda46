//! Per-agent activity monitoring.
//!
//! Two independent signals per watched agent:
//!
//! - An absolute single-shot timeout measured from `watch_agent`, firing
//!   regardless of activity.
//! - A soft staleness signal from comparing captured terminal output on a
//!   periodic tick; silence past the inactivity threshold marks the agent
//!   stale, new output recovers it.
//!
//! The monitor only signals. It never terminates a worker itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use orchestral_core::config::{AgentTimeouts, OrchestralConfig};
use orchestral_core::model::AgentName;

use crate::events::MonitorEvent;

/// Minimum silence before a dead process surface is reported.
const PROCESS_END_GRACE: Duration = Duration::from_secs(5);

/// Supplies the monitor with a view of the worker surface.
///
/// Implemented over the terminal runner by the agent lifecycle layer.
pub trait AgentProbe: Send + Sync + 'static {
    /// Captures the agent's current terminal output, if any.
    fn capture_output(&self, agent: AgentName) -> Option<String>;

    /// Whether the process surface still reports the agent as live.
    fn is_agent_active(&self, agent: AgentName) -> bool;
}

/// Tunables for the monitor.
#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    /// Period of the staleness tick
    pub check_interval: Duration,
    /// Silence threshold before an agent is marked stale
    pub max_inactivity: Duration,
    /// Absolute per-agent budgets
    pub timeouts: AgentTimeouts,
}

impl MonitorConfig {
    /// Derives the monitor tunables from the effective configuration.
    pub fn from_config(config: &OrchestralConfig) -> Self {
        Self {
            check_interval: Duration::from_millis(config.activity_check_interval_ms),
            max_inactivity: Duration::from_millis(config.max_inactivity_ms),
            timeouts: config.agent_timeouts,
        }
    }
}

#[derive(Debug)]
struct ActivityRecord {
    last_activity: Instant,
    is_stale: bool,
    last_output: Option<String>,
    process_end_reported: bool,
}

impl ActivityRecord {
    fn fresh() -> Self {
        Self {
            last_activity: Instant::now(),
            is_stale: false,
            last_output: None,
            process_end_reported: false,
        }
    }
}

#[derive(Default)]
struct MonitorInner {
    records: HashMap<AgentName, ActivityRecord>,
    timers: HashMap<AgentName, JoinHandle<()>>,
}

/// Watches agent slots for absolute timeouts and staleness.
pub struct ActivityMonitor {
    config: MonitorConfig,
    sender: mpsc::UnboundedSender<MonitorEvent>,
    probe: Arc<dyn AgentProbe>,
    inner: Arc<StdMutex<MonitorInner>>,
    stopped: Arc<AtomicBool>,
    tick_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ActivityMonitor {
    /// Monitor over the given probe, emitting on `sender`.
    pub fn new(
        config: MonitorConfig,
        probe: Arc<dyn AgentProbe>,
        sender: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            config,
            sender,
            probe,
            inner: Arc::new(StdMutex::new(MonitorInner::default())),
            stopped: Arc::new(AtomicBool::new(false)),
            tick_task: StdMutex::new(None),
        }
    }

    /// Creates a new channel pair for monitor events.
    pub fn channel() -> (
        mpsc::UnboundedSender<MonitorEvent>,
        mpsc::UnboundedReceiver<MonitorEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    /// Initializes the per-agent records and schedules the periodic check.
    pub fn start(&self) {
        {
            let mut inner = lock(&self.inner);
            for agent in AgentName::ALL {
                inner.records.insert(agent, ActivityRecord::fresh());
            }
        }

        let config = self.config;
        let probe = Arc::clone(&self.probe);
        let inner = Arc::clone(&self.inner);
        let sender = self.sender.clone();
        let stopped = Arc::clone(&self.stopped);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                tick_once(config, &probe, &inner, &sender);
            }
        });
        *lock_opt(&self.tick_task) = Some(handle);
    }

    /// Arms the single-shot absolute timeout for an agent using its
    /// configured budget.
    pub fn watch_agent(&self, agent: AgentName) {
        self.watch_agent_for(agent, self.config.timeouts.for_agent(agent));
    }

    /// Arms the timeout with an explicit budget (used when a recovery
    /// strategy extends it).
    pub fn watch_agent_for(&self, agent: AgentName, budget: Duration) {
        let mut inner = lock(&self.inner);
        if let Some(old) = inner.timers.remove(&agent) {
            old.abort();
        }
        inner.records.insert(agent, ActivityRecord::fresh());

        let sender = self.sender.clone();
        let inner_ref = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            // Disarm before signalling so the slot reads as unwatched.
            lock(&inner_ref).timers.remove(&agent);
            let _ = sender.send(MonitorEvent::Timeout { agent });
        });
        inner.timers.insert(agent, handle);
        debug!(%agent, ?budget, "armed absolute timeout");
    }

    /// Cancels the armed timeout for an agent.
    pub fn unwatch_agent(&self, agent: AgentName) {
        let mut inner = lock(&self.inner);
        if let Some(timer) = inner.timers.remove(&agent) {
            timer.abort();
        }
    }

    /// Whether the agent currently has a timeout armed.
    pub fn is_watched(&self, agent: AgentName) -> bool {
        lock(&self.inner).timers.contains_key(&agent)
    }

    /// Clears all timers and caches.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = lock_opt(&self.tick_task).take() {
            task.abort();
        }
        let mut inner = lock(&self.inner);
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        inner.records.clear();
    }
}

fn lock<T>(mutex: &Arc<StdMutex<T>>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_opt<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One staleness pass over every watched agent.
fn tick_once(
    config: MonitorConfig,
    probe: &Arc<dyn AgentProbe>,
    inner: &Arc<StdMutex<MonitorInner>>,
    sender: &mpsc::UnboundedSender<MonitorEvent>,
) {
    let watched: Vec<AgentName> = lock(inner).timers.keys().copied().collect();
    for agent in watched {
        let output = probe.capture_output(agent);
        let active = probe.is_agent_active(agent);
        let now = Instant::now();

        let mut guard = lock(inner);
        let Some(record) = guard.records.get_mut(&agent) else {
            continue;
        };

        if output.is_some() && output != record.last_output {
            record.last_output = output;
            record.last_activity = now;
            record.process_end_reported = false;
            if record.is_stale {
                record.is_stale = false;
                let _ = sender.send(MonitorEvent::Recovered { agent });
            }
            continue;
        }

        let inactive = now.duration_since(record.last_activity);
        if !record.is_stale && inactive > config.max_inactivity {
            record.is_stale = true;
            let _ = sender.send(MonitorEvent::Stale {
                agent,
                inactive_ms: inactive.as_millis() as u64,
            });
        }
        if !active && inactive > PROCESS_END_GRACE && !record.process_end_reported {
            record.process_end_reported = true;
            let _ = sender.send(MonitorEvent::ProcessEnded { agent });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    /// Probe backed by mutable script state.
    struct ScriptedProbe {
        output: StdMutex<Option<String>>,
        active: StdMutex<bool>,
    }

    impl ScriptedProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                output: StdMutex::new(None),
                active: StdMutex::new(true),
            })
        }

        fn set_output(&self, output: &str) {
            *self.output.lock().unwrap() = Some(output.to_string());
        }

        fn set_active(&self, active: bool) {
            *self.active.lock().unwrap() = active;
        }
    }

    impl AgentProbe for ScriptedProbe {
        fn capture_output(&self, _agent: AgentName) -> Option<String> {
            self.output.lock().unwrap().clone()
        }

        fn is_agent_active(&self, _agent: AgentName) -> bool {
            *self.active.lock().unwrap()
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_millis(30),
            max_inactivity: Duration::from_millis(80),
            timeouts: AgentTimeouts {
                refiner_ms: 200,
                builder_ms: 200,
                verifier_ms: 200,
                gatekeeper_ms: 200,
            },
        }
    }

    #[tokio::test]
    async fn test_absolute_timeout_fires_and_disarms() {
        let probe = ScriptedProbe::new();
        let (tx, mut rx) = ActivityMonitor::channel();
        let monitor = ActivityMonitor::new(fast_config(), probe, tx);
        monitor.start();
        monitor.watch_agent(AgentName::Refiner);
        assert!(monitor.is_watched(AgentName::Refiner));

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MonitorEvent::Timeout {
                agent: AgentName::Refiner
            }
        );
        // Property: after firing, the watch is no longer armed.
        assert!(!monitor.is_watched(AgentName::Refiner));
        monitor.stop();
    }

    #[tokio::test]
    async fn test_unwatch_cancels_timeout() {
        let probe = ScriptedProbe::new();
        let (tx, mut rx) = ActivityMonitor::channel();
        let monitor = ActivityMonitor::new(fast_config(), probe, tx);
        monitor.start();
        monitor.watch_agent(AgentName::Builder);
        monitor.unwatch_agent(AgentName::Builder);

        assert!(!monitor.is_watched(AgentName::Builder));
        // Nothing fires after cancellation.
        let got = timeout(Duration::from_millis(400), rx.recv()).await;
        assert!(got.is_err() || !matches!(got, Ok(Some(MonitorEvent::Timeout { .. }))));
        monitor.stop();
    }

    #[tokio::test]
    async fn test_stale_then_recovered() {
        let probe = ScriptedProbe::new();
        let (tx, mut rx) = ActivityMonitor::channel();
        let mut config = fast_config();
        config.timeouts = AgentTimeouts {
            refiner_ms: 60_000,
            builder_ms: 60_000,
            verifier_ms: 60_000,
            gatekeeper_ms: 60_000,
        };
        let monitor = ActivityMonitor::new(config, Arc::clone(&probe) as Arc<dyn AgentProbe>, tx);
        monitor.start();
        probe.set_output("line one");
        monitor.watch_agent(AgentName::Builder);

        // Output never changes past the first capture, so silence accrues.
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            MonitorEvent::Stale { agent, inactive_ms } => {
                assert_eq!(agent, AgentName::Builder);
                assert!(inactive_ms >= 80);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // New output recovers the agent.
        probe.set_output("line one\nline two");
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MonitorEvent::Recovered {
                agent: AgentName::Builder
            }
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn test_process_ended_reported_once() {
        let probe = ScriptedProbe::new();
        let (tx, mut rx) = ActivityMonitor::channel();
        let mut config = fast_config();
        config.max_inactivity = Duration::from_secs(60);
        config.timeouts = AgentTimeouts {
            refiner_ms: 60_000,
            builder_ms: 60_000,
            verifier_ms: 60_000,
            gatekeeper_ms: 60_000,
        };
        let monitor = ActivityMonitor::new(config, Arc::clone(&probe) as Arc<dyn AgentProbe>, tx);
        monitor.start();
        probe.set_active(false);
        monitor.watch_agent(AgentName::Verifier);

        // The grace period gates the report; scripted inactivity must age
        // past it. Backdate by never updating output and waiting.
        let event = timeout(Duration::from_secs(7), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MonitorEvent::ProcessEnded {
                agent: AgentName::Verifier
            }
        );
        // No duplicate report on the next tick.
        let next = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(next.is_err());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_timers() {
        let probe = ScriptedProbe::new();
        let (tx, mut rx) = ActivityMonitor::channel();
        let monitor = ActivityMonitor::new(fast_config(), probe, tx);
        monitor.start();
        monitor.watch_agent(AgentName::Refiner);
        monitor.stop();
        assert!(!monitor.is_watched(AgentName::Refiner));
        assert!(timeout(Duration::from_millis(400), rx.recv()).await.is_err());
    }
}
