//! Effective orchestrator configuration.
//!
//! Defaults are explicit and fully populated at construction; later code
//! never merges partial configuration. `from_env` layers the numeric
//! `ORCHESTRAL_*` overrides on top of the defaults, ignoring unparseable
//! values with a warning.

use std::time::Duration;

use tracing::warn;

use crate::model::agent::AgentName;
use crate::model::state::DEFAULT_MAX_MINOR_FIX_ATTEMPTS;

/// Per-agent absolute timeout budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentTimeouts {
    /// Refiner budget (default 5m)
    pub refiner_ms: u64,
    /// Builder budget (default 10m)
    pub builder_ms: u64,
    /// Verifier budget (default 5m)
    pub verifier_ms: u64,
    /// Gatekeeper budget (default 5m)
    pub gatekeeper_ms: u64,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            refiner_ms: 5 * 60 * 1000,
            builder_ms: 10 * 60 * 1000,
            verifier_ms: 5 * 60 * 1000,
            gatekeeper_ms: 5 * 60 * 1000,
        }
    }
}

impl AgentTimeouts {
    /// Budget for one agent slot.
    pub fn for_agent(&self, agent: AgentName) -> Duration {
        let ms = match agent {
            AgentName::Refiner => self.refiner_ms,
            AgentName::Builder => self.builder_ms,
            AgentName::Verifier => self.verifier_ms,
            AgentName::Gatekeeper => self.gatekeeper_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Effective configuration for one orchestrator instance.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestralConfig {
    /// Event de-duplication window for the file event source
    pub debounce_ms: u64,
    /// Period of the activity monitor tick
    pub activity_check_interval_ms: u64,
    /// Silence threshold before an agent is marked stale
    pub max_inactivity_ms: u64,
    /// Hard cap on the write-finish stability wait for JSON artifacts
    pub file_watcher_stability_ms: u64,
    /// Default budget for `wait_for_file`
    pub default_file_wait_timeout_ms: u64,
    /// First retry delay
    pub retry_base_delay_ms: u64,
    /// Retry delay cap
    pub retry_max_delay_ms: u64,
    /// Maximum relaunch attempts per recoverable worker error
    pub retry_max_attempts: u32,
    /// Whether recoverable worker errors are retried automatically
    pub auto_retry: bool,
    /// TTL of the in-process state cache
    pub state_cache_ttl_ms: u64,
    /// Absolute per-agent budgets
    pub agent_timeouts: AgentTimeouts,
    /// Window after agent completion in which a CRP wins over the
    /// done-flag transition
    pub crp_detection_delay_ms: u64,
    /// Cap on verifier-only re-runs
    pub max_minor_fix_attempts: u32,
    /// One-shot timeout extension granted by the timeout recovery strategy
    pub timeout_extension_ms: u64,
    /// Suppress the terminal bell on CRP creation
    pub suppress_bell: bool,
}

impl Default for OrchestralConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            activity_check_interval_ms: 30_000,
            max_inactivity_ms: 2 * 60 * 1000,
            file_watcher_stability_ms: 300_000,
            default_file_wait_timeout_ms: 60_000,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            retry_max_attempts: 2,
            auto_retry: true,
            state_cache_ttl_ms: 1000,
            agent_timeouts: AgentTimeouts::default(),
            crp_detection_delay_ms: 1000,
            max_minor_fix_attempts: DEFAULT_MAX_MINOR_FIX_ATTEMPTS,
            timeout_extension_ms: 2 * 60 * 1000,
            suppress_bell: false,
        }
    }
}

impl OrchestralConfig {
    /// Defaults with the `ORCHESTRAL_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        override_ms("ORCHESTRAL_DEBOUNCE_MS", &mut config.debounce_ms);
        override_ms(
            "ORCHESTRAL_ACTIVITY_CHECK_INTERVAL_MS",
            &mut config.activity_check_interval_ms,
        );
        override_ms(
            "ORCHESTRAL_MAX_INACTIVITY_TIME_MS",
            &mut config.max_inactivity_ms,
        );
        override_ms(
            "ORCHESTRAL_FILE_WATCHER_STABILITY_MS",
            &mut config.file_watcher_stability_ms,
        );
        override_ms(
            "ORCHESTRAL_DEFAULT_FILE_WAIT_TIMEOUT_MS",
            &mut config.default_file_wait_timeout_ms,
        );
        override_ms(
            "ORCHESTRAL_RETRY_BASE_DELAY_MS",
            &mut config.retry_base_delay_ms,
        );
        override_ms(
            "ORCHESTRAL_RETRY_MAX_DELAY_MS",
            &mut config.retry_max_delay_ms,
        );
        override_ms(
            "ORCHESTRAL_STATE_CACHE_TTL_MS",
            &mut config.state_cache_ttl_ms,
        );
        override_ms(
            "ORCHESTRAL_REFINER_TIMEOUT_MS",
            &mut config.agent_timeouts.refiner_ms,
        );
        override_ms(
            "ORCHESTRAL_BUILDER_TIMEOUT_MS",
            &mut config.agent_timeouts.builder_ms,
        );
        override_ms(
            "ORCHESTRAL_VERIFIER_TIMEOUT_MS",
            &mut config.agent_timeouts.verifier_ms,
        );
        override_ms(
            "ORCHESTRAL_GATEKEEPER_TIMEOUT_MS",
            &mut config.agent_timeouts.gatekeeper_ms,
        );
        config
    }

    /// Debounce window as a `Duration`.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// CRP-detection delay as a `Duration`.
    pub fn crp_detection_delay(&self) -> Duration {
        Duration::from_millis(self.crp_detection_delay_ms)
    }

    /// State cache TTL as a `Duration`.
    pub fn state_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.state_cache_ttl_ms)
    }
}

fn override_ms(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.trim().parse::<u64>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(var, raw, "ignoring unparseable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestralConfig::default();
        assert_eq!(config.debounce_ms, 2000);
        assert_eq!(config.state_cache_ttl_ms, 1000);
        assert_eq!(config.agent_timeouts.builder_ms, 600_000);
        assert_eq!(config.max_minor_fix_attempts, 2);
    }

    #[test]
    fn test_agent_timeout_lookup() {
        let timeouts = AgentTimeouts::default();
        assert_eq!(
            timeouts.for_agent(AgentName::Builder),
            Duration::from_secs(600)
        );
        assert_eq!(
            timeouts.for_agent(AgentName::Gatekeeper),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_env_override_applies() {
        // Env mutation is process-global; keep the variable scoped to this test.
        std::env::set_var("ORCHESTRAL_DEBOUNCE_MS", "500");
        let config = OrchestralConfig::from_env();
        std::env::remove_var("ORCHESTRAL_DEBOUNCE_MS");
        assert_eq!(config.debounce_ms, 500);
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        std::env::set_var("ORCHESTRAL_RETRY_BASE_DELAY_MS", "soon");
        let config = OrchestralConfig::from_env();
        std::env::remove_var("ORCHESTRAL_RETRY_BASE_DELAY_MS");
        assert_eq!(config.retry_base_delay_ms, 1000);
    }
}
