//! Safe persistence of the run-state document.
//!
//! One `StateStore` instance owns one `state.json`. Writes go through a
//! per-instance async mutex and land via atomic rename from a uniquely
//! named temp file, so a reader never observes a partial document. Reads
//! are served from a small TTL cache to keep the hot status queries off
//! the disk.

use std::path::PathBuf;
use std::sync::Mutex as SyncMutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::{OrchestralError, Result};
use crate::fsutil;
use crate::ids::CrpId;
use crate::model::agent::{AgentName, AgentStatus};
use crate::model::phase::Phase;
use crate::model::state::{ModelSelection, RunState};
use crate::model::usage::Usage;

#[derive(Clone)]
struct CachedState {
    state: RunState,
    loaded_at: Instant,
}

/// Mutex-protected, cached store for one run's `state.json`.
pub struct StateStore {
    path: PathBuf,
    ttl: Duration,
    write_lock: Mutex<()>,
    cache: SyncMutex<Option<CachedState>>,
}

impl StateStore {
    /// Store bound to a `state.json` path with the given cache TTL.
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            write_lock: Mutex::new(()),
            cache: SyncMutex::new(None),
        }
    }

    /// The path this store persists to.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads the current document, served from cache within the TTL.
    ///
    /// A missing or unparseable file yields `None`; the cache is dropped so
    /// the next call re-reads the disk. Only genuine I/O failures surface
    /// as errors.
    pub async fn load(&self) -> Result<Option<RunState>> {
        if let Some(cached) = self.fresh_cached() {
            return Ok(Some(cached));
        }
        self.load_from_disk().await
    }

    /// Persists a full document, stamping `updated_at`.
    pub async fn save(&self, mut state: RunState) -> Result<RunState> {
        let _guard = self.write_lock.lock().await;
        state.updated_at = Utc::now();
        self.save_locked(&state).await?;
        Ok(state)
    }

    /// Loads, applies `mutate`, stamps `updated_at`, and saves — all under
    /// the write lock, so concurrent mutators serialize.
    pub async fn update<F>(&self, mutate: F) -> Result<RunState>
    where
        F: FnOnce(&mut RunState),
    {
        let _guard = self.write_lock.lock().await;
        let mut state = match self.fresh_cached() {
            Some(state) => state,
            None => self
                .load_from_disk()
                .await?
                .ok_or(OrchestralError::StateNotFound)?,
        };
        mutate(&mut state);
        state.updated_at = Utc::now();
        self.save_locked(&state).await?;
        Ok(state)
    }

    /// Sets the run phase.
    pub async fn update_phase(&self, phase: Phase) -> Result<RunState> {
        self.update(|s| s.phase = phase).await
    }

    /// Sets an agent's status with the associated timestamp bookkeeping.
    pub async fn update_agent_status(
        &self,
        agent: AgentName,
        status: AgentStatus,
        error: Option<String>,
    ) -> Result<RunState> {
        self.update(|s| s.set_agent_status(agent, status, error, Utc::now()))
            .await
    }

    /// Records the armed absolute deadline for an agent attempt.
    pub async fn set_agent_timeout(
        &self,
        agent: AgentName,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<RunState> {
        self.update(|s| s.set_agent_timeout_at(agent, deadline)).await
    }

    /// Sets or clears the pending CRP reference.
    pub async fn set_pending_crp(&self, crp_id: Option<CrpId>) -> Result<RunState> {
        self.update(|s| s.pending_crp = crp_id).await
    }

    /// Enters `waiting_human` with a pending CRP, keeping invariant 1.
    pub async fn enter_waiting_human(&self, crp_id: CrpId) -> Result<RunState> {
        self.update(|s| s.enter_waiting_human(crp_id)).await
    }

    /// Leaves `waiting_human` back to the given phase, clearing the CRP.
    pub async fn leave_waiting_human(&self, phase: Phase) -> Result<RunState> {
        self.update(|s| s.leave_waiting_human(phase)).await
    }

    /// Starts the next iteration (resets the loop agents and the minor-fix
    /// counter).
    pub async fn increment_iteration(&self) -> Result<RunState> {
        self.update(RunState::begin_iteration).await
    }

    /// Consumes one verifier-only re-run slot.
    pub async fn increment_minor_fix_attempt(&self) -> Result<RunState> {
        self.update(|s| s.minor_fix_attempts += 1).await
    }

    /// Zeroes the verifier-only re-run counter.
    pub async fn reset_minor_fix_attempts(&self) -> Result<RunState> {
        self.update(|s| s.minor_fix_attempts = 0).await
    }

    /// Appends a history line.
    pub async fn add_history(&self, phase: Phase, result: impl Into<String>) -> Result<RunState> {
        let result = result.into();
        self.update(|s| s.record_history(phase, result, Utc::now()))
            .await
    }

    /// Appends an error message.
    pub async fn add_error(&self, message: impl Into<String>) -> Result<RunState> {
        let message = message.into();
        self.update(|s| s.errors.push(message)).await
    }

    /// Records the most recently routed event name.
    pub async fn set_last_event(&self, event: impl Into<String>) -> Result<RunState> {
        let event = event.into();
        self.update(|s| s.last_event = Some(event)).await
    }

    /// Stores one agent's usage and recomputes the aggregate.
    pub async fn update_agent_usage(&self, agent: AgentName, usage: Usage) -> Result<RunState> {
        self.update(|s| {
            s.agent_mut(agent).usage = Some(usage);
            s.recompute_usage();
        })
        .await
    }

    /// Overwrites the aggregate usage record directly.
    pub async fn update_total_usage(&self, usage: Usage) -> Result<RunState> {
        self.update(|s| s.usage = usage).await
    }

    /// Records the per-agent model choices.
    pub async fn update_model_selection(&self, selection: ModelSelection) -> Result<RunState> {
        self.update(|s| s.model_selection = Some(selection)).await
    }

    fn fresh_cached(&self) -> Option<RunState> {
        let cache = self.cache.lock().ok()?;
        cache
            .as_ref()
            .filter(|c| c.loaded_at.elapsed() <= self.ttl)
            .map(|c| c.state.clone())
    }

    fn store_cache(&self, state: &RunState) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedState {
                state: state.clone(),
                loaded_at: Instant::now(),
            });
        }
    }

    fn drop_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    async fn load_from_disk(&self) -> Result<Option<RunState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.drop_cache();
                return Ok(None);
            }
            Err(e) => {
                self.drop_cache();
                return Err(OrchestralError::StateLoad(e.to_string()));
            }
        };
        match serde_json::from_slice::<RunState>(&bytes) {
            Ok(state) => {
                self.store_cache(&state);
                Ok(Some(state))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state document unparseable");
                self.drop_cache();
                Ok(None)
            }
        }
    }

    async fn save_locked(&self, state: &RunState) -> Result<()> {
        fsutil::write_json_atomic(&self.path, state)
            .await
            .map_err(|e| OrchestralError::StateSave(e.to_string()))?;
        self.store_cache(state);
        Ok(())
    }
}
