//! Per-source circuit breaker and the registry that owns one breaker per
//! source id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediator_core::config::BreakerConfig;
use mediator_core::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests pass through.
    Closed,
    /// Too many failures; requests are rejected.
    Open,
    /// Testing recovery; a limited number of requests pass.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Answer to "may I call the source now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { remaining_cooldown: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Immutable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub source_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_ms: Option<u64>,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub source_id: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Bounded log of transitions shared by the breakers of one registry.
#[derive(Debug)]
pub struct TransitionLog {
    entries: Mutex<VecDeque<BreakerTransition>>,
    capacity: usize,
}

impl TransitionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn push(&self, transition: BreakerTransition) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(transition);
    }

    pub fn recent(&self) -> Vec<BreakerTransition> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_admitted: u32,
    last_failure_ms: Option<u64>,
}

/// Circuit breaker protecting a single source.
///
/// The state lock is only held for the in-memory transition, never across
/// the wrapped call. Transitions are reported after the lock is released.
#[derive(Debug)]
pub struct CircuitBreaker {
    source_id: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    log: Option<Arc<TransitionLog>>,
}

impl CircuitBreaker {
    pub fn new(source_id: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            source_id: source_id.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_admitted: 0,
                last_failure_ms: None,
            }),
            log: None,
        }
    }

    fn with_log(mut self, log: Arc<TransitionLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Check whether a call may go through, moving Open to HalfOpen once the
    /// reset timeout has elapsed since the last failure.
    pub fn try_acquire(&self) -> Admission {
        let now = self.clock.monotonic_ms();
        let reset_ms = self.config.reset_timeout_ms;

        let (admission, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => (Admission::Allowed, None),
                CircuitState::Open => {
                    let last = inner.last_failure_ms.unwrap_or(now);
                    let elapsed = now.saturating_sub(last);
                    if elapsed >= reset_ms {
                        inner.state = CircuitState::HalfOpen;
                        inner.success_count = 0;
                        inner.half_open_admitted = 1;
                        (
                            Admission::Allowed,
                            Some((CircuitState::Open, CircuitState::HalfOpen)),
                        )
                    } else {
                        (
                            Admission::Rejected {
                                remaining_cooldown: Duration::from_millis(reset_ms - elapsed),
                            },
                            None,
                        )
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_admitted < self.config.half_open_max_attempts {
                        inner.half_open_admitted += 1;
                        (Admission::Allowed, None)
                    } else {
                        (
                            Admission::Rejected {
                                remaining_cooldown: Duration::ZERO,
                            },
                            None,
                        )
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.emit(from, to);
        }
        admission
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.half_open_max_attempts {
                        inner.state = CircuitState::Closed;
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.half_open_admitted = 0;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                // Late completion of a call admitted before the circuit opened.
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.emit(from, to);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.monotonic_ms();
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    inner.last_failure_ms = Some(now);
                    if inner.failure_count >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // Any failure in half-open goes back to open
                    inner.state = CircuitState::Open;
                    inner.last_failure_ms = Some(now);
                    inner.success_count = 0;
                    inner.half_open_admitted = 0;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.emit(from, to);
        }
    }

    /// Give back a half-open slot for a call that ended without a verdict
    /// (caller cancellation, client-side rejection).
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
        }
    }

    /// Wrap a fallible call. Returns `Ok(None)` without invoking `f` while
    /// the circuit rejects calls; otherwise records the verdict and passes the
    /// call's result through.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire().is_allowed() {
            return Ok(None);
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(Some(value))
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Time left until an open circuit will admit a trial call. Zero unless open.
    pub fn remaining_cooldown(&self) -> Duration {
        let now = self.clock.monotonic_ms();
        let inner = self.inner.lock();
        match (inner.state, inner.last_failure_ms) {
            (CircuitState::Open, Some(last)) => {
                let elapsed = now.saturating_sub(last);
                Duration::from_millis(self.config.reset_timeout_ms.saturating_sub(elapsed))
            }
            _ => Duration::ZERO,
        }
    }

    /// Operator override: open the circuit now.
    pub fn force_open(&self) {
        let now = self.clock.monotonic_ms();
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = CircuitState::Open;
            inner.last_failure_ms = Some(now);
            inner.success_count = 0;
            inner.half_open_admitted = 0;
            previous
        };
        if previous != CircuitState::Open {
            self.emit(previous, CircuitState::Open);
        }
    }

    /// Operator override: close the circuit and clear counters.
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            *inner = BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_admitted: 0,
                last_failure_ms: None,
            };
            previous
        };
        if previous != CircuitState::Closed {
            self.emit(previous, CircuitState::Closed);
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            source_id: self.source_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_ms: inner.last_failure_ms,
        }
    }

    fn emit(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                source_id = %self.source_id,
                from = from.as_str(),
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                source_id = %self.source_id,
                "circuit breaker transitioning to half-open"
            ),
            CircuitState::Closed => info!(
                source_id = %self.source_id,
                "circuit breaker closed after recovery"
            ),
        }
        metrics::counter!(
            "breaker.transitions",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);

        if let Some(log) = &self.log {
            log.push(BreakerTransition {
                source_id: self.source_id.clone(),
                from,
                to,
                at: self.clock.wall(),
            });
        }
    }
}

/// Owns exactly one breaker per source id, created lazily on first use.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    clock: SharedClock,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    log: Arc<TransitionLog>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
            log: Arc::new(TransitionLog::new(256)),
        }
    }

    /// Breaker for `source_id`, created with the registry defaults if absent.
    pub fn get(&self, source_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(source_id) {
            return existing.clone();
        }
        self.breakers
            .entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(source_id, self.config.clone(), self.clock.clone())
                        .with_log(self.log.clone()),
                )
            })
            .clone()
    }

    pub fn state(&self, source_id: &str) -> Option<CircuitState> {
        self.breakers.get(source_id).map(|b| b.state())
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        snapshots
    }

    pub fn transitions(&self) -> Vec<BreakerTransition> {
        self.log.recent()
    }

    pub fn reset(&self, source_id: &str) {
        if let Some(breaker) = self.breakers.get(source_id).map(|b| b.clone()) {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::ManualClock;

    fn breaker(threshold: u32, reset_ms: u64, half_open: u32) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = ManualClock::shared();
        let cb = CircuitBreaker::new(
            "source-a",
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
                half_open_max_attempts: half_open,
            },
            clock.clone(),
        );
        (clock, cb)
    }

    #[test]
    fn test_opens_at_threshold() {
        let (_clock, cb) = breaker(5, 60_000, 3);
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire().is_allowed());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (_clock, cb) = breaker(3, 60_000, 3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.snapshot().failure_count, 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_cooldown_then_half_open() {
        let (clock, cb) = breaker(2, 60_000, 3);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance_ms(59_999);
        match cb.try_acquire() {
            Admission::Rejected { remaining_cooldown } => {
                assert_eq!(remaining_cooldown, Duration::from_millis(1));
            }
            Admission::Allowed => panic!("should still be open"),
        }
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance_ms(1);
        assert!(cb.try_acquire().is_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let (clock, cb) = breaker(1, 1_000, 3);
        cb.record_failure();
        clock.advance_ms(1_000);

        assert!(cb.try_acquire().is_allowed());
        cb.record_success();
        assert!(cb.try_acquire().is_allowed());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_allowed());
        cb.record_success();

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (clock, cb) = breaker(1, 1_000, 3);
        cb.record_failure();
        clock.advance_ms(1_000);
        assert!(cb.try_acquire().is_allowed());
        cb.record_success();

        clock.advance_ms(10);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Cooldown restarts from the new failure.
        assert_eq!(cb.remaining_cooldown(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_half_open_limits_admissions() {
        let (clock, cb) = breaker(1, 1_000, 2);
        cb.record_failure();
        clock.advance_ms(1_000);

        assert!(cb.try_acquire().is_allowed());
        assert!(cb.try_acquire().is_allowed());
        assert_eq!(
            cb.try_acquire(),
            Admission::Rejected {
                remaining_cooldown: Duration::ZERO
            }
        );

        cb.release();
        assert!(cb.try_acquire().is_allowed());
    }

    #[tokio::test]
    async fn test_call_skips_function_when_open() {
        let (_clock, cb) = breaker(1, 60_000, 1);
        let first: Result<Option<u32>, &str> = cb.call(|| async { Err("boom") }).await;
        assert_eq!(first, Err("boom"));
        assert_eq!(cb.state(), CircuitState::Open);

        let mut invoked = false;
        let second: Result<Option<u32>, &str> = cb
            .call(|| {
                invoked = true;
                async { Ok(1) }
            })
            .await;
        assert_eq!(second, Ok(None));
        assert!(!invoked);
    }

    #[test]
    fn test_registry_isolates_sources() {
        let clock = ManualClock::shared();
        let registry = CircuitBreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            clock,
        );

        registry.get("a").record_failure();
        assert_eq!(registry.state("a"), Some(CircuitState::Open));
        assert!(registry.get("b").try_acquire().is_allowed());
        assert!(Arc::ptr_eq(&registry.get("a"), &registry.get("a")));
        assert_eq!(registry.len(), 2);

        let transitions = registry.transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].source_id, "a");
        assert_eq!(transitions[0].to, CircuitState::Open);

        registry.reset("a");
        assert_eq!(registry.state("a"), Some(CircuitState::Closed));
    }

    #[test]
    fn test_force_open() {
        let (_clock, cb) = breaker(5, 10_000, 1);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.remaining_cooldown(), Duration::from_millis(10_000));
    }
}
