//! Orchestral agent layer - Pipeline orchestration and worker lifecycle.
//!
//! The top of the stack: composes the core stores and the runtime event
//! sources into a running pipeline:
//!
//! - [`Orchestrator`]: composition root and event loop for one run
//! - [`PhaseMachine`]: sole authority over phase and iteration state
//! - [`AgentLifecycle`]: one worker per agent slot
//! - [`RetryPolicy`] and [`RecoveryStrategies`]: auto-retry for recoverable
//!   worker errors
//! - [`MrpAssembler`]: Merge-Readiness Pack assembly on a passing verdict
//! - Collaborator traits ([`Runner`], [`PromptGenerator`], [`ModelSelector`])
//!   for the process surface the core does not own

pub mod lifecycle;
pub mod mrp;
pub mod orchestrator;
pub mod phase;
pub mod prompts;
pub mod recovery;
pub mod retry;
pub mod runner;

pub use lifecycle::AgentLifecycle;
pub use mrp::MrpAssembler;
pub use orchestrator::{Orchestrator, DEFAULT_MODEL};
pub use phase::{PhaseMachine, VerdictOutcome};
pub use prompts::{continuation_prompt, verifier_phase2_prompt};
pub use recovery::{RecoveryAction, RecoveryStrategies};
pub use retry::{backoff_delay, RetryContext, RetryEvent, RetryPolicy};
pub use runner::{ModelSelector, PromptContext, PromptGenerator, Runner, RunnerProbe, MANAGED_ENV_FLAG};
