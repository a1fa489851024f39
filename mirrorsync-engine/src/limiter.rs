//! Outbound call pacing and retry.
//!
//! Every remote call goes through [`RateLimiter::execute`], which consults the
//! target's breaker, waits for the target's next free slot, and retries
//! throttled or transient results with capped exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};

use mirrorsync_core::{EngineConfig, ErrorCategory, RemoteTarget, TargetId};

use crate::breaker::BreakerRegistry;
use crate::remote::{OperationResult, RemoteClient, RemoteOperation};

/// Result of one limited call, after all retries.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed { payload: Value, retries: u32 },
    /// The breaker refused the call; `attempts` calls were made before that.
    CircuitOpen { attempts: u32 },
    /// Retries ran out on a throttled or transient result.
    Exhausted {
        attempts: u32,
        category: ErrorCategory,
        detail: String,
    },
    Permanent(String),
}

impl CallOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CallOutcome::Completed { .. })
    }

    /// Error category for a failed outcome, `None` when completed.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            CallOutcome::Completed { .. } => None,
            CallOutcome::CircuitOpen { .. } => Some(ErrorCategory::CircuitOpen),
            CallOutcome::Exhausted { category, .. } => Some(*category),
            CallOutcome::Permanent(_) => Some(ErrorCategory::Permanent),
        }
    }

    /// Retries spent, for the job's `retry_count`.
    pub fn retries(&self) -> u32 {
        match self {
            CallOutcome::Completed { retries, .. } => *retries,
            CallOutcome::CircuitOpen { attempts } | CallOutcome::Exhausted { attempts, .. } => {
                attempts.saturating_sub(1)
            }
            CallOutcome::Permanent(_) => 0,
        }
    }
}

pub struct RateLimiter {
    config: Arc<EngineConfig>,
    breakers: Arc<BreakerRegistry>,
    /// Earliest instant the next call to each target may start.
    next_slot: Mutex<HashMap<TargetId, Instant>>,
}

impl RateLimiter {
    pub fn new(config: Arc<EngineConfig>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            config,
            breakers,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `operation` against `target`, honouring breaker, pacing and retry
    /// policy. Never panics on exhaustion; the caller decides the job status.
    pub async fn execute(
        &self,
        client: &dyn RemoteClient,
        target: &RemoteTarget,
        operation: &RemoteOperation,
    ) -> CallOutcome {
        let policy = self.config.limiter_for(&target.id);
        let breaker = self.breakers.get(&target.id);
        let mut retries = 0u32;

        loop {
            if !breaker.allow() {
                tracing::debug!(remote = %target.id, op = %operation, "circuit open, call refused");
                return CallOutcome::CircuitOpen { attempts: retries };
            }
            self.pace(&target.id, policy.min_interval()).await;

            match client.invoke(target, operation).await {
                OperationResult::Ok(payload) => {
                    breaker.record_success();
                    return CallOutcome::Completed { payload, retries };
                }
                OperationResult::PermanentError(detail) => {
                    breaker.record_neutral();
                    tracing::warn!(remote = %target.id, op = %operation, %detail, "permanent error");
                    return CallOutcome::Permanent(detail);
                }
                OperationResult::RateLimited { retry_after } => {
                    if retries >= policy.max_retries {
                        breaker.record_failure();
                        tracing::warn!(remote = %target.id, op = %operation, retries, "rate limit retries exhausted");
                        return CallOutcome::Exhausted {
                            attempts: retries + 1,
                            category: ErrorCategory::RateLimited,
                            detail: "too many requests".to_string(),
                        };
                    }
                    breaker.record_neutral();
                    let delay = policy
                        .backoff(retries)
                        .max(retry_after.unwrap_or_default())
                        .min(policy.max_backoff());
                    tracing::debug!(remote = %target.id, op = %operation, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                    sleep(delay).await;
                }
                OperationResult::TransientError(detail) => {
                    breaker.record_failure();
                    if retries >= policy.max_retries {
                        tracing::warn!(remote = %target.id, op = %operation, %detail, retries, "transient retries exhausted");
                        return CallOutcome::Exhausted {
                            attempts: retries + 1,
                            category: ErrorCategory::Transient,
                            detail,
                        };
                    }
                    let delay = policy.backoff(retries);
                    tracing::debug!(remote = %target.id, op = %operation, %detail, delay_ms = delay.as_millis() as u64, "transient error, retrying");
                    sleep(delay).await;
                }
            }
            retries += 1;
        }
    }

    /// Reserve the next call slot for `target` and sleep until it arrives.
    /// The reservation is taken under the lock; the sleep happens outside it.
    pub(crate) async fn pace(&self, target: &TargetId, interval: Duration) {
        let wait = {
            let mut slots = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let slot = slots
                .get(target)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(target.clone(), slot + interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}
