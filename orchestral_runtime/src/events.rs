//! Typed event streams consumed by the orchestrator.
//!
//! Each event source owns a channel of its own tagged-union type; the
//! orchestrator multiplexes them with `tokio::select!`. Events carry the
//! already-parsed artifact, so handlers never re-read the disk.

use orchestral_core::ids::{CrpId, VcrId};
use orchestral_core::model::{
    AgentName, Crp, ErrorFlag, GateVerdict, TestConfig, TestOutput, WorkerOutput,
};

/// Event emitted by the filesystem event source.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// `briefing/refined.md` appeared or changed
    RefinerDone,
    /// `builder/done.flag` appeared
    BuilderDone,
    /// `verifier/done.flag` appeared
    VerifierDone,
    /// `verifier/tests-ready.flag` appeared; carries the sibling config
    TestsReady {
        /// Parsed `verifier/test-config.json`
        config: TestConfig,
    },
    /// `verifier/test-output.json` appeared
    TestExecutionDone {
        /// Parsed runner output
        output: TestOutput,
    },
    /// `gatekeeper/verdict.json` appeared or changed
    GatekeeperDone {
        /// Parsed verdict
        verdict: GateVerdict,
    },
    /// A new `crp/<id>.json` appeared
    CrpCreated {
        /// Parsed request
        crp: Crp,
    },
    /// A new `vcr/<id>.json` appeared
    VcrCreated {
        /// Reply identity
        vcr_id: VcrId,
        /// The CRP it resolves
        crp_id: CrpId,
    },
    /// `mrp/summary.md` appeared
    MrpCreated,
    /// `<agent>/output.json` appeared
    AgentOutput {
        /// Agent slot that wrote it
        agent: AgentName,
        /// Parsed document, usage included
        output: WorkerOutput,
    },
    /// `<agent>/error.flag` appeared
    ErrorFlagged {
        /// Agent slot that failed
        agent: AgentName,
        /// Parsed or synthesized flag
        flag: ErrorFlag,
    },
    /// The source itself hit a problem (parse failure, watch error)
    Error {
        /// Human-readable description with the offending path
        message: String,
    },
}

impl PipelineEvent {
    /// Stable event name used for `events.log` and `last_event`.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::RefinerDone => "refiner_done",
            PipelineEvent::BuilderDone => "builder_done",
            PipelineEvent::VerifierDone => "verifier_done",
            PipelineEvent::TestsReady { .. } => "tests_ready",
            PipelineEvent::TestExecutionDone { .. } => "test_execution_done",
            PipelineEvent::GatekeeperDone { .. } => "gatekeeper_done",
            PipelineEvent::CrpCreated { .. } => "crp_created",
            PipelineEvent::VcrCreated { .. } => "vcr_created",
            PipelineEvent::MrpCreated => "mrp_created",
            PipelineEvent::AgentOutput { .. } => "agent_output",
            PipelineEvent::ErrorFlagged { .. } => "error_flag",
            PipelineEvent::Error { .. } => "error",
        }
    }
}

/// Event emitted by the activity monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    /// An agent's absolute timeout fired
    Timeout {
        /// The agent that timed out
        agent: AgentName,
    },
    /// An agent produced no new output past the inactivity threshold
    Stale {
        /// The silent agent
        agent: AgentName,
        /// How long it has been silent
        inactive_ms: u64,
    },
    /// A previously stale agent produced output again
    Recovered {
        /// The recovered agent
        agent: AgentName,
    },
    /// The process surface reports the agent as gone
    ProcessEnded {
        /// The ended agent
        agent: AgentName,
    },
}

impl MonitorEvent {
    /// Stable event name used for `events.log`.
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::Timeout { .. } => "agent_timeout",
            MonitorEvent::Stale { .. } => "agent_stale",
            MonitorEvent::Recovered { .. } => "agent_recovered",
            MonitorEvent::ProcessEnded { .. } => "process_ended",
        }
    }
}
