//! Orchestral core - Run store, state store, and pipeline data model.
//!
//! This crate owns everything that persists under a run directory:
//!
//! - The data model for runs, agents, CRPs/VCRs, verdicts, and usage
//! - Identifier validation for everything that becomes a path
//! - The run store (directory layout, creation, enumeration, deletion)
//! - The state store (mutex-protected, cached, atomic `state.json` writes)
//! - The append-only `events.log` writer
//! - The effective configuration with `ORCHESTRAL_*` env overrides

pub mod config;
pub mod errors;
pub mod event_log;
pub mod fsutil;
pub mod ids;
pub mod model;
pub mod run_store;
pub mod state_store;

pub use config::{AgentTimeouts, OrchestralConfig};
pub use errors::{OrchestralError, Result};
pub use event_log::{EventLevel, EventLog};
pub use ids::{sanitize_identifier, CrpId, RunId, VcrId};
pub use model::{
    AgentName, AgentState, AgentStatus, Crp, CrpBody, CrpOption, CrpQuestion, CrpStatus, Decision,
    ErrorFlag, GateVerdict, HistoryEntry, ModelSelection, MrpEvidence, Phase, RunState, TestConfig,
    TestOutput, TestTotals, Usage, Vcr, Verdict, VerifierResults, WorkerErrorType, WorkerOutput,
    WorkerUsage,
};
pub use run_store::{parse_duration, RunPaths, RunStore, RunSummary};
pub use state_store::StateStore;
