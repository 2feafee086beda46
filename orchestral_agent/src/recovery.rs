//! Recovery strategies for worker errors.
//!
//! Maps the error taxonomy onto typed recovery actions. The strategies only
//! plan; the orchestrator executes the plan with the lifecycle and store it
//! owns, the same way rollback decisions are separated from the engine that
//! applies them.

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use orchestral_core::config::OrchestralConfig;
use orchestral_core::model::{AgentName, ErrorFlag, WorkerErrorType};

/// What to do about a classified worker error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Reset the agent's flag files, regenerate its prompt, relaunch
    RelaunchAfterReset,
    /// Grant a one-shot timeout extension, then relaunch
    ExtendTimeoutAndRelaunch,
    /// Mark the run failed with the given reason
    FailRun {
        /// Message recorded against the run
        reason: String,
    },
}

/// Error-type to strategy mapping with per-agent extension bookkeeping.
pub struct RecoveryStrategies {
    extension: Duration,
    extended: StdMutex<HashSet<AgentName>>,
}

impl RecoveryStrategies {
    /// Strategies with the configured timeout extension.
    pub fn from_config(config: &OrchestralConfig) -> Self {
        Self {
            extension: Duration::from_millis(config.timeout_extension_ms),
            extended: StdMutex::new(HashSet::new()),
        }
    }

    /// The planned action for an error kind.
    pub fn plan(&self, error_type: WorkerErrorType) -> RecoveryAction {
        match error_type {
            WorkerErrorType::Crash => RecoveryAction::RelaunchAfterReset,
            WorkerErrorType::Timeout => RecoveryAction::ExtendTimeoutAndRelaunch,
            WorkerErrorType::Validation => RecoveryAction::FailRun {
                reason: "worker rejected its inputs; retry cannot help".to_string(),
            },
            WorkerErrorType::Permission => RecoveryAction::FailRun {
                reason: "worker lacked permissions for the workspace".to_string(),
            },
            WorkerErrorType::Resource => RecoveryAction::FailRun {
                reason: "worker exhausted a resource (disk, quota, or memory)".to_string(),
            },
        }
    }

    /// True iff a relaunching strategy exists for the flag's kind and the
    /// flag itself claims to be recoverable.
    pub fn can_recover(&self, flag: &ErrorFlag) -> bool {
        flag.recoverable
            && !matches!(self.plan(flag.error_type), RecoveryAction::FailRun { .. })
    }

    /// Grants the one-shot timeout extension for an agent. Returns the
    /// extra budget the first time, `None` afterwards.
    pub fn grant_extension(&self, agent: AgentName) -> Option<Duration> {
        let mut extended = self
            .extended
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if extended.insert(agent) {
            Some(self.extension)
        } else {
            None
        }
    }
}
