//! Hedged attempts: a backup call launched when the primary is slower than
//! the source usually is.

use mediator_core::config::HedgeConfig;
use mediator_core::AttemptOutcome;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay before the backup call starts.
///
/// A fixed `delay_ms` wins; otherwise the source's observed p95 latency is
/// used, or `fallback_delay_ms` before any latency is known. A delay longer
/// than half the attempt budget is cut to half, but never below `min_delay_ms`.
pub fn hedge_delay(config: &HedgeConfig, p95_ms: Option<u64>, budget: Duration) -> Duration {
    let base_ms = if config.delay_ms > 0 {
        config.delay_ms
    } else {
        p95_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(config.fallback_delay_ms)
    };
    let delay = Duration::from_millis(base_ms);
    let half = budget / 2;
    if delay > half {
        half.max(Duration::from_millis(config.min_delay_ms))
    } else {
        delay
    }
}

/// Race `primary` against a backup started after `delay`.
///
/// `backup` is not polled until the delay elapses, so it must be lazy. The
/// first success wins and the other call is dropped. If the first call to
/// finish fails, the other one is awaited and preferred if it succeeds. A
/// primary that finishes before the delay is returned as-is.
pub async fn run_hedged<P, B>(
    source_id: String,
    primary: P,
    backup: B,
    delay: Duration,
) -> AttemptOutcome
where
    P: Future<Output = AttemptOutcome>,
    B: Future<Output = AttemptOutcome>,
{
    tokio::pin!(primary);
    tokio::select! {
        outcome = &mut primary => return outcome,
        _ = tokio::time::sleep(delay) => {}
    }

    metrics::counter!("mediation.hedges", "source" => source_id.clone()).increment(1);
    debug!(
        source_id = %source_id,
        delay_ms = delay.as_millis() as u64,
        "primary still pending, launching hedge"
    );

    tokio::pin!(backup);
    let (first, primary_first) = tokio::select! {
        outcome = &mut primary => (outcome, true),
        outcome = &mut backup => (outcome, false),
    };
    if first.is_success() {
        return first;
    }

    let second = if primary_first {
        backup.await
    } else {
        primary.await
    };
    if second.is_success() {
        second
    } else {
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::{MediationError, WinningBid};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn bid(cpm: f64) -> AttemptOutcome {
        AttemptOutcome::success(
            WinningBid {
                price_cpm: cpm,
                currency: "USD".into(),
                creative: None,
                adapter: "test".into(),
                ttl_seconds: 60,
            },
            10,
        )
    }

    async fn after(ms: u64, outcome: AttemptOutcome) -> AttemptOutcome {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        outcome
    }

    /// Flags whether the future holding it was dropped before finishing.
    struct DropFlag {
        dropped: Arc<AtomicBool>,
        finished: bool,
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            if !self.finished {
                self.dropped.store(true, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_hedge_delay_sources() {
        let p95 = HedgeConfig::default();
        let budget = Duration::from_secs(2);
        assert_eq!(hedge_delay(&p95, Some(80), budget), Duration::from_millis(80));
        assert_eq!(hedge_delay(&p95, None, budget), Duration::from_millis(150));
        assert_eq!(hedge_delay(&p95, Some(0), budget), Duration::from_millis(150));

        let fixed = HedgeConfig {
            delay_ms: 40,
            ..HedgeConfig::default()
        };
        assert_eq!(hedge_delay(&fixed, Some(900), budget), Duration::from_millis(40));
    }

    #[test]
    fn test_hedge_delay_capped_at_half_budget() {
        let config = HedgeConfig::default();
        assert_eq!(
            hedge_delay(&config, Some(300), Duration::from_millis(400)),
            Duration::from_millis(200)
        );
        // Half of a tiny budget is raised to the minimum.
        assert_eq!(
            hedge_delay(&config, Some(300), Duration::from_millis(12)),
            Duration::from_millis(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_primary_never_launches_backup() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let backup = async move {
            flag.store(true, Ordering::SeqCst);
            bid(9.0)
        };
        let out = run_hedged("a".into(), after(20, bid(1.0)), backup, Duration::from_millis(50)).await;
        assert_eq!(out, bid(1.0));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_wins_after_fixed_delay() {
        let start = Instant::now();
        let delay = hedge_delay(
            &HedgeConfig {
                delay_ms: 50,
                ..HedgeConfig::default()
            },
            None,
            Duration::from_secs(2),
        );
        let out = run_hedged(
            "a".into(),
            after(500, bid(1.0)),
            after(100, bid(2.0)),
            delay,
        )
        .await;
        assert_eq!(out, bid(2.0));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150) && elapsed < Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_finisher_waits_for_other() {
        let out = run_hedged(
            "a".into(),
            after(300, bid(1.5)),
            after(10, AttemptOutcome::error(MediationError::ServerError(503))),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(out, bid(1.5));

        let out = run_hedged(
            "a".into(),
            after(300, AttemptOutcome::Timeout),
            after(10, AttemptOutcome::no_fill("empty")),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(out, AttemptOutcome::no_fill("empty"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_cancels_pending_call() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let backup = async move {
            let mut guard = DropFlag {
                dropped: flag,
                finished: false,
            };
            tokio::time::sleep(Duration::from_secs(5)).await;
            guard.finished = true;
            bid(3.0)
        };
        let start = Instant::now();
        let out = run_hedged("a".into(), after(120, bid(1.0)), backup, Duration::from_millis(50)).await;
        assert_eq!(out, bid(1.0));
        assert!(start.elapsed() < Duration::from_millis(130));
        assert!(dropped.load(Ordering::SeqCst));
    }
}
