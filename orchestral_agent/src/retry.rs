//! Retry policy with exponential backoff.
//!
//! The delay schedule is a pure function over the attempt index:
//! `min(base * 2^(n-1), max)`. The policy decides whether an error kind is
//! retryable and how long to wait; the orchestrator drives the actual
//! relaunches because worker failures arrive as events, not return values.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use orchestral_core::config::OrchestralConfig;
use orchestral_core::model::{AgentName, WorkerErrorType};

/// Lifecycle events emitted while retrying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to run after the backoff delay
    Attempt {
        /// Agent being relaunched
        agent: AgentName,
        /// 1-based retry attempt
        attempt: u32,
        /// Backoff applied before this attempt
        delay_ms: u64,
    },
    /// A retried operation succeeded
    Success {
        /// Agent that recovered
        agent: AgentName,
        /// Attempt that succeeded
        attempt: u32,
    },
    /// All attempts are spent
    Exhausted {
        /// Agent that stays failed
        agent: AgentName,
        /// Attempts consumed
        attempts: u32,
    },
}

impl RetryEvent {
    /// Stable event name used for `events.log`.
    pub fn name(&self) -> &'static str {
        match self {
            RetryEvent::Attempt { .. } => "agent_retry",
            RetryEvent::Success { .. } => "agent_retry_success",
            RetryEvent::Exhausted { .. } => "agent_retry_exhausted",
        }
    }
}

/// Pure backoff schedule: `min(base * 2^(n-1), max)` for attempt `n >= 1`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift).min(max)
}

/// Context describing the failure being retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryContext {
    /// Agent the failure belongs to
    pub agent: AgentName,
    /// Classified error kind
    pub error_type: WorkerErrorType,
}

/// Decides retryability and paces retries.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    recoverable: Vec<WorkerErrorType>,
    base_delay: Duration,
    max_delay: Duration,
    events: Option<mpsc::UnboundedSender<RetryEvent>>,
}

impl RetryPolicy {
    /// Policy with explicit knobs.
    pub fn new(
        max_attempts: u32,
        recoverable: Vec<WorkerErrorType>,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            recoverable,
            base_delay,
            max_delay,
            events: None,
        }
    }

    /// Policy derived from the effective configuration. Crashes and
    /// timeouts retry; validation, permission, and resource errors do not.
    pub fn from_config(config: &OrchestralConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            vec![WorkerErrorType::Crash, WorkerErrorType::Timeout],
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Attaches an event sink.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<RetryEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Maximum retry attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the error kind is in the recoverable set.
    pub fn is_recoverable(&self, error_type: WorkerErrorType) -> bool {
        self.recoverable.contains(&error_type)
    }

    /// Delay to apply before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }

    /// Runs `op`, retrying recoverable failures with exponential backoff.
    ///
    /// `op` receives the 1-based attempt index. The final error is returned
    /// once attempts are exhausted or the error kind is not recoverable.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        ctx: RetryContext,
        mut op: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        self.emit(RetryEvent::Success {
                            agent: ctx.agent,
                            attempt: attempt - 1,
                        });
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let retries_used = attempt - 1;
                    if !self.is_recoverable(ctx.error_type) || retries_used >= self.max_attempts {
                        if retries_used >= self.max_attempts {
                            self.emit(RetryEvent::Exhausted {
                                agent: ctx.agent,
                                attempts: retries_used,
                            });
                        }
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(agent = %ctx.agent, attempt, ?delay, error = %error, "retrying");
                    self.emit(RetryEvent::Attempt {
                        agent: ctx.agent,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Emits a retry lifecycle event to the attached sink, if any.
    pub fn emit(&self, event: RetryEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}
