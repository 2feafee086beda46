//! Orchestral runtime layer - Filesystem event source and activity monitoring.
//!
//! This crate turns the outside world into typed event streams:
//!
//! - [`FileEventSource`] watches a run directory with the `notify` crate and
//!   emits [`PipelineEvent`]s for worker artifacts
//! - [`ActivityMonitor`] arms absolute per-agent timeouts and detects
//!   staleness, emitting [`MonitorEvent`]s
//!
//! The orchestrator multiplexes both channels; nothing in this crate
//! mutates run state.

pub mod events;
pub mod monitor;
pub mod watcher;

pub use events::{MonitorEvent, PipelineEvent};
pub use monitor::{ActivityMonitor, AgentProbe, MonitorConfig};
pub use watcher::{FileEventSource, WatcherConfig};
