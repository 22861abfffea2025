//! Mediation arbiter: runs one pass over a placement's sources with the
//! waterfall or concurrent strategy and folds every attempt into the shared
//! breakers and the fill outcome tracker.

use crate::hedge::{hedge_delay, run_hedged};
use crate::pool::WorkerPools;
use crate::selection::{adaptive_timeout, weighted_pick};
use futures::future::BoxFuture;
use futures::FutureExt;
use mediator_core::config::ArbiterConfig;
use mediator_core::{AttemptOutcome, MediationError, PassContext, SharedClock, Source, Strategy};
use mediator_resilience::{
    Admission, CircuitBreaker, CircuitBreakerRegistry, FillOutcomeTracker, NetworkMonitor,
    Preflight,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NO_SOURCES_CONFIGURED: &str = "no_sources_configured";
pub const ALL_DISABLED: &str = "all_disabled";
pub const ALL_SOURCES_EXHAUSTED: &str = "all_sources_exhausted";
pub const ALL_TIMED_OUT: &str = "all_timed_out";
pub const BELOW_FLOOR: &str = "below_floor";

/// Host-facing summary of one mediation pass.
#[derive(Debug, Clone, Serialize)]
pub struct MediationOutcome {
    pub placement_id: String,
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
    /// Source id of the winner, if the pass filled.
    pub winner: Option<String>,
    /// Attempts that produced a verdict, including deadline timeouts.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl MediationOutcome {
    pub fn is_fill(&self) -> bool {
        self.outcome.is_success()
    }
}

enum Step {
    Completed(AttemptOutcome),
    Skipped,
    Cancelled,
}

struct PassResult {
    outcome: AttemptOutcome,
    winner: Option<String>,
    attempts: u32,
}

impl PassResult {
    fn terminal(outcome: AttemptOutcome, attempts: u32) -> Self {
        Self {
            outcome,
            winner: None,
            attempts,
        }
    }
}

fn cancelled_outcome() -> AttemptOutcome {
    AttemptOutcome::error(MediationError::cancelled())
}

fn apply_floor(source: &Source, outcome: AttemptOutcome) -> AttemptOutcome {
    match outcome {
        AttemptOutcome::Success { price_micros, .. } if price_micros < source.min_bid_micros() => {
            debug!(
                source_id = source.id(),
                price_micros,
                min_bid_micros = source.min_bid_micros(),
                "bid below source floor"
            );
            AttemptOutcome::no_fill(BELOW_FLOOR)
        }
        other => other,
    }
}

fn panicked() -> AttemptOutcome {
    AttemptOutcome::error(MediationError::InternalError(
        "adapter call-out panicked".into(),
    ))
}

pub struct MediationArbiter {
    config: ArbiterConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    tracker: Arc<FillOutcomeTracker>,
    network: Arc<NetworkMonitor>,
    pools: WorkerPools,
    rng: Mutex<StdRng>,
    clock: SharedClock,
}

impl MediationArbiter {
    pub fn new(
        config: ArbiterConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        tracker: Arc<FillOutcomeTracker>,
        network: Arc<NetworkMonitor>,
        clock: SharedClock,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let pools = WorkerPools::from_config(&config);
        info!(
            network_workers = pools.network_size(),
            compute_workers = pools.compute_size(),
            adaptive_weights = config.adaptive_weights,
            adaptive_timeouts = config.adaptive_timeouts,
            hedging = config.hedge.enabled,
            "mediation arbiter initialized"
        );
        Self {
            config,
            breakers,
            tracker,
            network,
            pools,
            rng: Mutex::new(rng),
            clock,
        }
    }

    pub fn with_pools(mut self, pools: WorkerPools) -> Self {
        self.pools = pools;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn tracker(&self) -> &Arc<FillOutcomeTracker> {
        &self.tracker
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    /// Run one pass and return the single terminal outcome.
    pub async fn execute<F, Fut>(
        &self,
        ctx: &PassContext,
        sources: &[Source],
        strategy: Strategy,
        attempt: F,
    ) -> AttemptOutcome
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        self.run(ctx, sources, strategy, attempt, &CancellationToken::new())
            .await
            .outcome
    }

    /// Run one pass under a caller cancellation token.
    pub async fn run<F, Fut>(
        &self,
        ctx: &PassContext,
        sources: &[Source],
        strategy: Strategy,
        attempt: F,
        cancel: &CancellationToken,
    ) -> MediationOutcome
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        let started = self.clock.monotonic_ms();
        metrics::counter!("mediation.passes", "strategy" => strategy.as_str()).increment(1);

        let pass = self.dispatch(ctx, sources, strategy, &attempt, cancel).await;
        let elapsed_ms = self.clock.monotonic_ms().saturating_sub(started);

        match &pass.outcome {
            AttemptOutcome::Success { price_micros, .. } => {
                metrics::counter!("mediation.wins", "strategy" => strategy.as_str()).increment(1);
                info!(
                    placement_id = %ctx.placement_id,
                    strategy = strategy.as_str(),
                    winner = pass.winner.as_deref().unwrap_or_default(),
                    price_micros,
                    attempts = pass.attempts,
                    elapsed_ms,
                    "mediation pass filled"
                );
            }
            AttemptOutcome::NoFill { reason } => {
                metrics::counter!("mediation.no_fill", "reason" => reason.clone()).increment(1);
                debug!(
                    placement_id = %ctx.placement_id,
                    strategy = strategy.as_str(),
                    reason = %reason,
                    attempts = pass.attempts,
                    "mediation pass ended without fill"
                );
            }
            other => {
                info!(
                    placement_id = %ctx.placement_id,
                    strategy = strategy.as_str(),
                    outcome = other.label(),
                    "mediation pass failed"
                );
            }
        }

        MediationOutcome {
            placement_id: ctx.placement_id.clone(),
            strategy,
            outcome: pass.outcome,
            winner: pass.winner,
            attempts: pass.attempts,
            elapsed_ms,
        }
    }

    async fn dispatch<F, Fut>(
        &self,
        ctx: &PassContext,
        sources: &[Source],
        strategy: Strategy,
        attempt: &F,
        cancel: &CancellationToken,
    ) -> PassResult
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        if sources.is_empty() {
            return PassResult::terminal(AttemptOutcome::no_fill(NO_SOURCES_CONFIGURED), 0);
        }
        let enabled: Vec<Source> = sources.iter().filter(|s| s.is_enabled()).cloned().collect();
        if enabled.is_empty() {
            return PassResult::terminal(AttemptOutcome::no_fill(ALL_DISABLED), 0);
        }
        if let Preflight::FastFail { reason, .. } = self.network.preflight() {
            return PassResult::terminal(
                AttemptOutcome::error(MediationError::NetworkError(reason)),
                0,
            );
        }
        if cancel.is_cancelled() {
            return PassResult::terminal(cancelled_outcome(), 0);
        }

        match strategy {
            Strategy::Waterfall => self.waterfall(ctx, enabled, attempt, cancel).await,
            Strategy::Concurrent => self.concurrent(ctx, enabled, attempt, cancel).await,
        }
    }

    // ─── Waterfall ──────────────────────────────────────────────────────

    async fn waterfall<F, Fut>(
        &self,
        ctx: &PassContext,
        enabled: Vec<Source>,
        attempt: &F,
        cancel: &CancellationToken,
    ) -> PassResult
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        let mut tiers: BTreeMap<u32, Vec<Source>> = BTreeMap::new();
        for source in enabled {
            tiers.entry(source.priority()).or_default().push(source);
        }

        let mut attempts = 0u32;
        for (priority, mut remaining) in tiers {
            debug!(
                placement_id = %ctx.placement_id,
                priority,
                candidates = remaining.len(),
                "entering waterfall tier"
            );
            while !remaining.is_empty() {
                if cancel.is_cancelled() {
                    return PassResult::terminal(cancelled_outcome(), attempts);
                }
                let idx = self.draw(&remaining);
                let source = remaining.remove(idx);

                let outcome = match self.attempt_source(ctx, &source, attempt, cancel).await {
                    Step::Completed(outcome) => outcome,
                    Step::Skipped => continue,
                    Step::Cancelled => return PassResult::terminal(cancelled_outcome(), attempts),
                };
                attempts += 1;
                if outcome.is_success() {
                    return PassResult {
                        outcome,
                        winner: Some(source.id().to_string()),
                        attempts,
                    };
                }
            }
        }

        PassResult::terminal(AttemptOutcome::no_fill(ALL_SOURCES_EXHAUSTED), attempts)
    }

    fn draw(&self, candidates: &[Source]) -> usize {
        let weights: Vec<f64> = candidates.iter().map(|s| self.draw_weight(s)).collect();
        let mut rng = self.rng.lock();
        weighted_pick(&weights, &mut *rng).unwrap_or(0)
    }

    async fn attempt_source<F, Fut>(
        &self,
        ctx: &PassContext,
        source: &Source,
        attempt: &F,
        cancel: &CancellationToken,
    ) -> Step
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        let breaker = self.breakers.get(source.id());
        if let Admission::Rejected { remaining_cooldown } = breaker.try_acquire() {
            self.note_skip(ctx, source, remaining_cooldown);
            return Step::Skipped;
        }

        let timeout = self.attempt_timeout(source);
        let started = self.clock.monotonic_ms();
        let call = AssertUnwindSafe(self.launch(source, timeout, attempt)).catch_unwind();

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                breaker.release();
                return Step::Cancelled;
            }
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => panicked(),
                Err(_) => AttemptOutcome::Timeout,
            },
        };
        if cancel.is_cancelled() {
            breaker.release();
            return Step::Cancelled;
        }

        let latency_ms = self.clock.monotonic_ms().saturating_sub(started);
        Step::Completed(self.settle(ctx, source, &breaker, raw, latency_ms))
    }

    // ─── Concurrent ─────────────────────────────────────────────────────

    async fn concurrent<F, Fut>(
        &self,
        ctx: &PassContext,
        enabled: Vec<Source>,
        attempt: &F,
        cancel: &CancellationToken,
    ) -> PassResult
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + ctx.placement_timeout;
        let mut set = JoinSet::new();
        let mut pending: BTreeMap<usize, (Source, Arc<CircuitBreaker>)> = BTreeMap::new();

        for (idx, source) in enabled.into_iter().enumerate() {
            let breaker = self.breakers.get(source.id());
            if let Admission::Rejected { remaining_cooldown } = breaker.try_acquire() {
                self.note_skip(ctx, &source, remaining_cooldown);
                continue;
            }

            let timeout = self.attempt_timeout(&source).min(ctx.placement_timeout);
            let pool = self.pools.for_source(&source);
            let call = AssertUnwindSafe(self.launch(&source, timeout, attempt)).catch_unwind();
            let clock = self.clock.clone();
            set.spawn(async move {
                let _permit = pool.acquire_owned().await.ok();
                let started = clock.monotonic_ms();
                let outcome = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => panicked(),
                    Err(_) => AttemptOutcome::Timeout,
                };
                (idx, outcome, clock.monotonic_ms().saturating_sub(started))
            });
            pending.insert(idx, (source, breaker));
        }

        debug!(
            placement_id = %ctx.placement_id,
            dispatched = pending.len(),
            deadline_ms = ctx.placement_timeout.as_millis() as u64,
            "concurrent fan-out dispatched"
        );

        let mut attempts = 0u32;
        let mut best: Option<(String, AttemptOutcome)> = None;
        let mut cancelled = false;
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        while !set.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = &mut expiry => break,
                joined = set.join_next() => {
                    let (idx, raw, latency_ms) = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(err)) => {
                            warn!(placement_id = %ctx.placement_id, error = %err, "concurrent attempt task failed");
                            continue;
                        }
                        None => break,
                    };
                    let Some((source, breaker)) = pending.remove(&idx) else {
                        continue;
                    };
                    attempts += 1;
                    let outcome = self.settle(ctx, &source, &breaker, raw, latency_ms);
                    if let Some(price) = outcome.price_micros() {
                        let leading = best
                            .as_ref()
                            .and_then(|(_, b)| b.price_micros())
                            .map_or(true, |current| price > current);
                        if leading {
                            best = Some((source.id().to_string(), outcome));
                        }
                    }
                }
            }
        }
        set.abort_all();

        // Whatever is still pending lost the race; it counts as a timeout for
        // statistics only and gives its breaker slot back.
        for (_, (source, breaker)) in pending {
            breaker.release();
            if cancelled {
                continue;
            }
            attempts += 1;
            self.tracker
                .record_with_format(source.id(), ctx.ad_format, &AttemptOutcome::Timeout);
            debug!(
                placement_id = %ctx.placement_id,
                source_id = source.id(),
                "source still pending at placement deadline"
            );
        }

        if cancelled {
            return PassResult::terminal(cancelled_outcome(), attempts);
        }
        match best {
            Some((winner, outcome)) => PassResult {
                outcome,
                winner: Some(winner),
                attempts,
            },
            None => PassResult::terminal(AttemptOutcome::no_fill(ALL_TIMED_OUT), attempts),
        }
    }

    // ─── Shared ─────────────────────────────────────────────────────────

    fn draw_weight(&self, source: &Source) -> f64 {
        if self.config.adaptive_weights {
            self.tracker.effective_weight(source.id(), source.weight())
        } else {
            source.weight()
        }
    }

    fn attempt_timeout(&self, source: &Source) -> Duration {
        if !self.config.adaptive_timeouts {
            return source.timeout();
        }
        adaptive_timeout(
            source.timeout(),
            Duration::from_millis(self.config.adaptive_timeout_floor_ms),
            self.tracker.trusted_average_latency_ms(source.id()),
        )
    }

    /// Build the call for one attempt, hedged when enabled.
    fn launch<F, Fut>(
        &self,
        source: &Source,
        timeout: Duration,
        attempt: &F,
    ) -> BoxFuture<'static, AttemptOutcome>
    where
        F: Fn(Source, Duration) -> Fut + Send + Sync,
        Fut: Future<Output = AttemptOutcome> + Send + 'static,
    {
        let primary = attempt(source.clone(), timeout);
        if !self.config.hedge.enabled {
            return primary.boxed();
        }
        let p95_ms = self
            .tracker
            .latency_percentiles(source.id())
            .map(|p| p.p95_ms);
        let delay = hedge_delay(&self.config.hedge, p95_ms, timeout);
        // Futures are lazy: the backup does no work until the delay elapses.
        let backup = attempt(source.clone(), timeout);
        run_hedged(source.id().to_string(), primary, backup, delay).boxed()
    }

    /// Skips never reach the tracker, so they get their own counter.
    fn note_skip(&self, ctx: &PassContext, source: &Source, remaining: Duration) {
        metrics::counter!(
            "mediation.circuit_skips",
            "source" => source.id().to_string()
        )
        .increment(1);
        debug!(
            placement_id = %ctx.placement_id,
            source_id = source.id(),
            remaining_cooldown_ms = remaining.as_millis() as u64,
            "source skipped, circuit open"
        );
    }

    /// Price the bid in USD, apply the floor, and feed the verdict to the
    /// breaker and the tracker. The tracker emits the per-attempt metrics.
    fn settle(
        &self,
        ctx: &PassContext,
        source: &Source,
        breaker: &CircuitBreaker,
        raw: AttemptOutcome,
        latency_ms: u64,
    ) -> AttemptOutcome {
        let outcome = apply_floor(source, raw.normalized(&self.config.exchange_rates));

        // An open downstream circuit is a skip, not a verdict on this source.
        if let AttemptOutcome::Error {
            cause: MediationError::CircuitOpen { .. },
        } = &outcome
        {
            breaker.release();
            return outcome;
        }

        if outcome.is_failure() {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
        self.tracker
            .record_with_format(source.id(), ctx.ad_format, &outcome);

        if let AttemptOutcome::Error { cause } = &outcome {
            debug!(
                placement_id = %ctx.placement_id,
                source_id = source.id(),
                error = %cause,
                latency_ms,
                "attempt failed"
            );
        }
        outcome
    }
}
