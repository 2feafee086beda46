//! Persisted data model for runs.
//!
//! Every type in this module maps one-to-one onto a JSON document under the
//! per-run directory. The documents are the external interface: workers,
//! dashboards, and the human operator all read them directly, so field
//! names and enum spellings are stable.

pub mod agent;
pub mod crp;
pub mod error_flag;
pub mod mrp;
pub mod phase;
pub mod state;
pub mod testing;
pub mod usage;
pub mod vcr;
pub mod verdict;
pub mod worker;

pub use agent::{AgentName, AgentState, AgentStatus};
pub use crp::{Crp, CrpBody, CrpOption, CrpQuestion, CrpStatus};
pub use error_flag::{ErrorFlag, WorkerErrorType};
pub use mrp::{MrpEvidence, TestTotals};
pub use phase::Phase;
pub use state::{HistoryEntry, ModelSelection, RunState};
pub use testing::{TestConfig, TestOutput, VerifierResults};
pub use usage::Usage;
pub use vcr::{Decision, Vcr};
pub use verdict::{GateVerdict, Verdict};
pub use worker::{WorkerOutput, WorkerUsage};
