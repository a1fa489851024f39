//! Per-target circuit breakers.
//!
//! ```text
//! closed ──N consecutive failures──▶ open
//! open ──cooldown elapsed (in allow)──▶ half_open   (one trial call admitted)
//! half_open ──M consecutive successes──▶ closed
//! half_open ──any failure──▶ open
//! ```
//!
//! All state reads and writes for one breaker happen inside a single locked
//! `check_and_transition` call, so two callers can never both observe
//! `closed` across a transition or both take the half-open trial slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use mirrorsync_core::{BreakerConfig, BreakerState, EngineConfig, TargetId};

/// Point-in-time view of one breaker, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub target: TargetId,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition_at: DateTime<Utc>,
    pub total_successes: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Allow,
    Success,
    Failure,
    /// The call finished without a health signal (permanent error or throttle).
    Neutral,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    target: TargetId,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: TargetId, config: BreakerConfig) -> Self {
        Self {
            target,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition: Instant::now(),
                last_transition_at: Utc::now(),
                trial_in_flight: false,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed now. May move `open → half_open`.
    pub fn allow(&self) -> bool {
        self.check_and_transition(Event::Allow)
    }

    pub fn record_success(&self) {
        self.check_and_transition(Event::Success);
    }

    /// A counted failure: timeout, connection error, 5xx, exhausted retries.
    pub fn record_failure(&self) {
        self.check_and_transition(Event::Failure);
    }

    /// A finished call that says nothing about target health, such as a
    /// permanent 4xx. Frees the half-open trial slot without counting.
    pub fn record_neutral(&self) {
        self.check_and_transition(Event::Neutral);
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_transition_at: inner.last_transition_at,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_and_transition(&self, event: Event) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();

        match (inner.state, event) {
            (BreakerState::Closed, Event::Allow) => true,
            (BreakerState::Open, Event::Allow) => {
                if now.duration_since(inner.last_transition) >= self.config.cooldown() {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            (BreakerState::HalfOpen, Event::Allow) => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }

            (state, Event::Success) => {
                inner.total_successes += 1;
                match state {
                    BreakerState::Closed => inner.consecutive_failures = 0,
                    BreakerState::HalfOpen => {
                        inner.trial_in_flight = false;
                        inner.consecutive_successes += 1;
                        if inner.consecutive_successes >= self.config.success_threshold.max(1) {
                            self.transition(&mut inner, BreakerState::Closed, now);
                        }
                    }
                    // Late result of a call admitted before the breaker opened.
                    BreakerState::Open => {}
                }
                true
            }

            (state, Event::Failure) => {
                inner.total_failures += 1;
                match state {
                    BreakerState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                            self.transition(&mut inner, BreakerState::Open, now);
                        }
                    }
                    BreakerState::HalfOpen => {
                        inner.trial_in_flight = false;
                        self.transition(&mut inner, BreakerState::Open, now);
                    }
                    BreakerState::Open => {}
                }
                true
            }

            (BreakerState::HalfOpen, Event::Neutral) => {
                inner.trial_in_flight = false;
                true
            }
            (_, Event::Neutral) => true,
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = now;
        inner.last_transition_at = Utc::now();
        inner.consecutive_successes = 0;
        if to != BreakerState::Open {
            inner.consecutive_failures = 0;
        }
        match to {
            BreakerState::Open => tracing::warn!(
                remote = %self.target,
                from = %from,
                failures = inner.consecutive_failures,
                "circuit opened",
            ),
            _ => tracing::info!(remote = %self.target, from = %from, to = %to, "circuit transition"),
        }
    }
}

/// One breaker per remote target, created on first use.
///
/// Constructed once by the scheduler and shared by handle.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: Arc<EngineConfig>,
    breakers: Mutex<HashMap<TargetId, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for `target`, inserting a fresh closed one if absent.
    pub fn get(&self, target: &TargetId) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(target.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target.clone(),
                    self.config.breaker_for(target),
                ))
            })
            .clone()
    }

    /// Snapshots of every breaker created so far, sorted by target.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut out: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }
}
