//! Fill outcome tracker: per-source aggregates, a bounded raw event log,
//! and best-effort degradation pattern detection.
//!
//! Aggregates are lifetime counters and are never decayed. Only the raw
//! event log is pruned (by count and by age).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediator_core::config::TrackerConfig;
use mediator_core::{AdFormat, AttemptOutcome, SharedClock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Lifetime aggregate for one source. Callers only ever see clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStatistics {
    pub source_id: String,
    pub attempts: u64,
    pub successes: u64,
    pub no_fills: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub latency_sum_ms: u64,
    pub price_sum_micros: u64,
    pub consecutive_failures: u32,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

impl SourceStatistics {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }

    pub fn fill_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    /// Mean latency of successful attempts.
    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.successes == 0 {
            return None;
        }
        Some(self.latency_sum_ms as f64 / self.successes as f64)
    }

    pub fn average_price_micros(&self) -> Option<u64> {
        if self.successes == 0 {
            return None;
        }
        Some(self.price_sum_micros / self.successes)
    }
}

/// Latency percentiles over the recent success window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    NoFill,
    Error,
    Timeout,
}

impl From<&AttemptOutcome> for OutcomeKind {
    fn from(outcome: &AttemptOutcome) -> Self {
        match outcome {
            AttemptOutcome::Success { .. } => OutcomeKind::Success,
            AttemptOutcome::NoFill { .. } => OutcomeKind::NoFill,
            AttemptOutcome::Error { .. } => OutcomeKind::Error,
            AttemptOutcome::Timeout => OutcomeKind::Timeout,
        }
    }
}

#[derive(Debug, Clone)]
struct OutcomeEvent {
    ad_format: Option<AdFormat>,
    kind: OutcomeKind,
    at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    ConsecutiveFailures,
    FormatSpecific,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A degradation signal for operators. Never feeds selection directly.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedPattern {
    pub pattern_type: PatternType,
    /// Source id for failure streaks, ad format name for format patterns.
    pub subject: String,
    pub severity: Severity,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SourceEntry {
    stats: SourceStatistics,
    latencies: VecDeque<u64>,
}

#[derive(Debug, Default)]
struct EventLog {
    events: VecDeque<OutcomeEvent>,
    no_fills_by_format: HashMap<AdFormat, u64>,
    total_no_fills: u64,
}

impl EventLog {
    fn push(&mut self, event: OutcomeEvent) {
        if event.kind == OutcomeKind::NoFill {
            self.total_no_fills += 1;
            if let Some(format) = event.ad_format {
                *self.no_fills_by_format.entry(format).or_insert(0) += 1;
            }
        }
        self.events.push_back(event);
    }

    fn evict_front(&mut self) {
        let Some(event) = self.events.pop_front() else {
            return;
        };
        if event.kind == OutcomeKind::NoFill {
            self.total_no_fills = self.total_no_fills.saturating_sub(1);
            if let Some(format) = event.ad_format {
                if let Some(count) = self.no_fills_by_format.get_mut(&format) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.no_fills_by_format.remove(&format);
                    }
                }
            }
        }
    }

    fn prune(&mut self, now_ms: u64, max_events: usize, max_age_ms: u64) -> usize {
        let mut evicted = 0;
        while self.events.len() > max_events {
            self.evict_front();
            evicted += 1;
        }
        while self
            .events
            .front()
            .is_some_and(|e| now_ms.saturating_sub(e.at_ms) > max_age_ms)
        {
            self.evict_front();
            evicted += 1;
        }
        evicted
    }

    /// Format holding the majority of no-fills, with its sample count.
    fn dominant_no_fill_format(&self) -> Option<(AdFormat, u64)> {
        if self.total_no_fills == 0 {
            return None;
        }
        self.no_fills_by_format
            .iter()
            .max_by_key(|(_, count)| **count)
            .filter(|(_, count)| **count * 2 > self.total_no_fills)
            .map(|(format, count)| (*format, *count))
    }
}

/// Single ingestion point for attempt outcomes.
pub struct FillOutcomeTracker {
    config: TrackerConfig,
    clock: SharedClock,
    sources: DashMap<String, Arc<Mutex<SourceEntry>>>,
    events: Mutex<EventLog>,
    last_flagged: Mutex<HashMap<(PatternType, String), (u64, Severity)>>,
    patterns: Mutex<VecDeque<DetectedPattern>>,
}

impl FillOutcomeTracker {
    pub fn new(config: TrackerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            sources: DashMap::new(),
            events: Mutex::new(EventLog::default()),
            last_flagged: Mutex::new(HashMap::new()),
            patterns: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Record an outcome with no ad-format attribution.
    pub fn record(&self, source_id: &str, outcome: &AttemptOutcome) {
        self.record_with_format(source_id, None, outcome);
    }

    /// Record an outcome. Side-effect only; never panics on extreme inputs
    /// since every counter saturates.
    pub fn record_with_format(
        &self,
        source_id: &str,
        ad_format: Option<AdFormat>,
        outcome: &AttemptOutcome,
    ) {
        let kind = OutcomeKind::from(outcome);
        let now_ms = self.clock.monotonic_ms();
        let wall = self.clock.wall();

        let streak = {
            let entry = self.entry(source_id);
            let mut guard = entry.lock();
            let SourceEntry { stats, latencies } = &mut *guard;
            let window = self.config.latency_window;
            stats.attempts = stats.attempts.saturating_add(1);
            stats.last_outcome_at = Some(wall);
            match outcome {
                AttemptOutcome::Success {
                    latency_ms,
                    price_micros,
                    ..
                } => {
                    stats.successes = stats.successes.saturating_add(1);
                    stats.latency_sum_ms = stats.latency_sum_ms.saturating_add(*latency_ms);
                    stats.price_sum_micros = stats.price_sum_micros.saturating_add(*price_micros);
                    stats.consecutive_failures = 0;
                    if window > 0 {
                        if latencies.len() >= window {
                            latencies.pop_front();
                        }
                        latencies.push_back(*latency_ms);
                    }
                }
                AttemptOutcome::NoFill { .. } => {
                    stats.no_fills = stats.no_fills.saturating_add(1);
                    stats.consecutive_failures = 0;
                }
                AttemptOutcome::Error { .. } => {
                    stats.errors = stats.errors.saturating_add(1);
                    stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                }
                AttemptOutcome::Timeout => {
                    stats.timeouts = stats.timeouts.saturating_add(1);
                    stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                }
            }
            stats.consecutive_failures
        };

        let dominant = {
            let mut log = self.events.lock();
            log.push(OutcomeEvent {
                ad_format,
                kind,
                at_ms: now_ms,
            });
            log.prune(
                now_ms,
                self.config.max_events,
                self.config.max_event_age_secs.saturating_mul(1_000),
            );
            if kind == OutcomeKind::NoFill {
                log.dominant_no_fill_format()
                    .map(|(format, count)| (format, count, log.total_no_fills))
            } else {
                None
            }
        };

        if outcome.is_failure() && streak > self.config.consecutive_failure_threshold {
            let severity = if streak >= 10 {
                Severity::High
            } else if streak >= 5 {
                Severity::Medium
            } else {
                Severity::Low
            };
            self.flag(
                PatternType::ConsecutiveFailures,
                source_id.to_string(),
                severity,
                format!("{streak} consecutive failures"),
                now_ms,
            );
        }

        if let Some((format, count, total)) = dominant {
            if count >= self.config.format_min_samples {
                self.flag(
                    PatternType::FormatSpecific,
                    format.as_str().to_string(),
                    Severity::Medium,
                    format!("{count} of {total} no-fills are {format}"),
                    now_ms,
                );
            }
        }

        metrics::counter!(
            "mediation.attempts",
            "source" => source_id.to_string(),
            "outcome" => outcome.label()
        )
        .increment(1);
        if let AttemptOutcome::Success { latency_ms, .. } = outcome {
            metrics::histogram!("mediation.attempt_latency_ms", "source" => source_id.to_string())
                .record(*latency_ms as f64);
        }
    }

    fn entry(&self, source_id: &str) -> Arc<Mutex<SourceEntry>> {
        if let Some(entry) = self.sources.get(source_id) {
            return entry.clone();
        }
        self.sources
            .entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SourceEntry {
                    stats: SourceStatistics::new(source_id),
                    latencies: VecDeque::new(),
                }))
            })
            .clone()
    }

    fn flag(
        &self,
        pattern_type: PatternType,
        subject: String,
        severity: Severity,
        detail: String,
        now_ms: u64,
    ) {
        let cooldown_ms = self.config.pattern_cooldown_secs.saturating_mul(1_000);
        {
            let mut last = self.last_flagged.lock();
            let key = (pattern_type, subject.clone());
            if let Some((at_ms, prev_severity)) = last.get(&key) {
                // Escalations are reported even inside the cool-down window.
                if now_ms.saturating_sub(*at_ms) < cooldown_ms && severity <= *prev_severity {
                    return;
                }
            }
            last.insert(key, (now_ms, severity));
        }

        warn!(
            pattern = ?pattern_type,
            subject = %subject,
            severity = ?severity,
            detail = %detail,
            "degradation pattern detected"
        );

        let pattern = DetectedPattern {
            pattern_type,
            subject,
            severity,
            detail,
            detected_at: self.clock.wall(),
        };
        let mut patterns = self.patterns.lock();
        if patterns.len() >= self.config.max_patterns.max(1) {
            patterns.pop_front();
        }
        patterns.push_back(pattern);
    }

    pub fn snapshot(&self, source_id: &str) -> Option<SourceStatistics> {
        let entry = self.sources.get(source_id).map(|e| e.clone())?;
        let stats = entry.lock().stats.clone();
        Some(stats)
    }

    pub fn snapshots(&self) -> Vec<SourceStatistics> {
        let entries: Vec<Arc<Mutex<SourceEntry>>> =
            self.sources.iter().map(|e| e.value().clone()).collect();
        let mut stats: Vec<SourceStatistics> =
            entries.iter().map(|e| e.lock().stats.clone()).collect();
        stats.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        stats
    }

    pub fn fill_rate(&self, source_id: &str) -> Option<f64> {
        self.snapshot(source_id).map(|s| s.fill_rate())
    }

    pub fn average_latency_ms(&self, source_id: &str) -> Option<f64> {
        self.snapshot(source_id)?.average_latency_ms()
    }

    /// Draw weight adjusted by observed fill rate:
    /// `max(0.1, configured × (0.5 + fill_rate))`, once `min_sample_size`
    /// attempts exist. Below that the configured weight is returned as is.
    pub fn effective_weight(&self, source_id: &str, configured_weight: f64) -> f64 {
        match self.snapshot(source_id) {
            Some(stats) if stats.attempts >= self.config.min_sample_size => {
                (configured_weight * (0.5 + stats.fill_rate())).max(0.1)
            }
            _ => configured_weight,
        }
    }

    /// Mean success latency, only once enough attempts exist to trust it.
    pub fn trusted_average_latency_ms(&self, source_id: &str) -> Option<f64> {
        let stats = self.snapshot(source_id)?;
        if stats.attempts < self.config.min_sample_size {
            return None;
        }
        stats.average_latency_ms()
    }

    pub fn latency_percentiles(&self, source_id: &str) -> Option<LatencyPercentiles> {
        let entry = self.sources.get(source_id).map(|e| e.clone())?;
        let mut samples: Vec<u64> = entry.lock().latencies.iter().copied().collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let rank = |p: f64| -> u64 {
            let idx = ((p * samples.len() as f64).ceil() as usize).clamp(1, samples.len()) - 1;
            samples[idx]
        };
        Some(LatencyPercentiles {
            p50_ms: rank(0.50),
            p90_ms: rank(0.90),
            p95_ms: rank(0.95),
            p99_ms: rank(0.99),
            samples: samples.len(),
        })
    }

    pub fn patterns(&self) -> Vec<DetectedPattern> {
        self.patterns.lock().iter().cloned().collect()
    }

    /// Number of raw events currently retained.
    pub fn event_count(&self) -> usize {
        self.events.lock().events.len()
    }

    /// Run a retention pass. Returns the number of evicted events.
    pub fn prune(&self) -> usize {
        let now_ms = self.clock.monotonic_ms();
        self.events.lock().prune(
            now_ms,
            self.config.max_events,
            self.config.max_event_age_secs.saturating_mul(1_000),
        )
    }

    pub fn reset(&self, source_id: &str) {
        self.sources.remove(source_id);
    }

    pub fn reset_all(&self) {
        self.sources.clear();
        *self.events.lock() = EventLog::default();
        self.last_flagged.lock().clear();
        self.patterns.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::{ManualClock, MediationError, WinningBid};

    fn tracker() -> (Arc<ManualClock>, FillOutcomeTracker) {
        let clock = ManualClock::shared();
        (clock.clone(), FillOutcomeTracker::new(TrackerConfig::default(), clock))
    }

    fn success(latency_ms: u64, cpm: f64) -> AttemptOutcome {
        AttemptOutcome::success(
            WinningBid {
                price_cpm: cpm,
                currency: "USD".into(),
                creative: None,
                adapter: "test".into(),
                ttl_seconds: 60,
            },
            latency_ms,
        )
    }

    fn error() -> AttemptOutcome {
        AttemptOutcome::error(MediationError::ServerError(500))
    }

    #[test]
    fn test_aggregates() {
        let (_clock, t) = tracker();
        t.record("a", &success(100, 1.5));
        t.record("a", &success(300, 0.5));
        t.record("a", &AttemptOutcome::no_fill("no_bid"));
        t.record("a", &AttemptOutcome::Timeout);

        let s = t.snapshot("a").unwrap();
        assert_eq!(s.attempts, 4);
        assert_eq!(s.successes, 2);
        assert_eq!(s.no_fills, 1);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.price_sum_micros, 2_000_000);
        assert_eq!(s.fill_rate(), 0.5);
        assert_eq!(s.average_latency_ms(), Some(200.0));
        assert_eq!(s.consecutive_failures, 1);
        assert!(t.snapshot("missing").is_none());
    }

    #[test]
    fn test_effective_weight_boundaries() {
        let (_clock, t) = tracker();
        assert_eq!(t.effective_weight("fresh", 2.0), 2.0);

        for _ in 0..10 {
            t.record("dry", &AttemptOutcome::no_fill("no_bid"));
            t.record("wet", &success(50, 1.0));
        }
        assert!((t.effective_weight("dry", 2.0) - 1.0).abs() < 1e-9);
        assert!((t.effective_weight("wet", 2.0) - 3.0).abs() < 1e-9);
        // Floor applies to tiny weights.
        assert!((t.effective_weight("dry", 0.1) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_below_min_sample_uses_configured_weight() {
        let (_clock, t) = tracker();
        for _ in 0..9 {
            t.record("a", &AttemptOutcome::no_fill("no_bid"));
        }
        assert_eq!(t.effective_weight("a", 4.0), 4.0);
        assert!(t.trusted_average_latency_ms("a").is_none());
    }

    #[test]
    fn test_consecutive_failure_pattern_and_escalation() {
        let (clock, t) = tracker();
        for _ in 0..3 {
            t.record("flaky", &error());
        }
        assert!(t.patterns().is_empty());

        t.record("flaky", &error());
        let patterns = t.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::ConsecutiveFailures);
        assert_eq!(patterns[0].severity, Severity::Low);

        // Same severity inside the cool-down is suppressed.
        clock.advance_ms(1_000);
        t.record("flaky", &AttemptOutcome::Timeout);
        assert_eq!(t.patterns().len(), 2, "escalation to medium at 5");
        assert_eq!(t.patterns()[1].severity, Severity::Medium);

        t.record("flaky", &error());
        assert_eq!(t.patterns().len(), 2);

        for _ in 0..4 {
            t.record("flaky", &error());
        }
        let last = t.patterns().last().cloned().unwrap();
        assert_eq!(last.severity, Severity::High);
    }

    #[test]
    fn test_pattern_cooldown_expires() {
        let (clock, t) = tracker();
        for _ in 0..4 {
            t.record("s", &error());
        }
        assert_eq!(t.patterns().len(), 1);

        // Streak broken and rebuilt.
        t.record("s", &success(10, 1.0));
        for _ in 0..4 {
            t.record("s", &error());
        }
        assert_eq!(t.patterns().len(), 1);

        clock.advance_ms(5 * 60 * 1_000);
        t.record("s", &success(10, 1.0));
        for _ in 0..4 {
            t.record("s", &error());
        }
        assert_eq!(t.patterns().len(), 2);
    }

    #[test]
    fn test_format_specific_pattern() {
        let (_clock, t) = tracker();
        for _ in 0..9 {
            t.record_with_format("a", Some(AdFormat::Rewarded), &AttemptOutcome::no_fill("x"));
        }
        t.record_with_format("b", Some(AdFormat::Banner), &AttemptOutcome::no_fill("x"));
        assert!(t.patterns().is_empty());

        t.record_with_format("a", Some(AdFormat::Rewarded), &AttemptOutcome::no_fill("x"));
        let patterns = t.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::FormatSpecific);
        assert_eq!(patterns[0].subject, "rewarded");
    }

    #[test]
    fn test_format_pattern_needs_majority() {
        let (_clock, t) = tracker();
        for _ in 0..12 {
            t.record_with_format("a", Some(AdFormat::Rewarded), &AttemptOutcome::no_fill("x"));
            t.record_with_format("b", Some(AdFormat::Banner), &AttemptOutcome::no_fill("x"));
            t.record_with_format("c", Some(AdFormat::Native), &AttemptOutcome::no_fill("x"));
        }
        assert!(t
            .patterns()
            .iter()
            .all(|p| p.pattern_type != PatternType::FormatSpecific));
    }

    #[test]
    fn test_retention_by_count_and_age() {
        let clock = ManualClock::shared();
        let t = FillOutcomeTracker::new(
            TrackerConfig {
                max_events: 5,
                max_event_age_secs: 60,
                ..TrackerConfig::default()
            },
            clock.clone(),
        );
        for _ in 0..8 {
            t.record("a", &AttemptOutcome::no_fill("x"));
        }
        assert_eq!(t.event_count(), 5);

        clock.advance_ms(61_000);
        assert_eq!(t.prune(), 5);
        assert_eq!(t.event_count(), 0);
        // Aggregates survive eviction.
        assert_eq!(t.snapshot("a").unwrap().attempts, 8);
    }

    #[test]
    fn test_latency_percentiles() {
        let (_clock, t) = tracker();
        for latency in 1..=100 {
            t.record("a", &success(latency, 1.0));
        }
        let p = t.latency_percentiles("a").unwrap();
        assert_eq!(p.p50_ms, 50);
        assert_eq!(p.p90_ms, 90);
        assert_eq!(p.p95_ms, 95);
        assert_eq!(p.p99_ms, 99);
        assert_eq!(p.samples, 100);
        assert!(t.latency_percentiles("none").is_none());
    }

    #[test]
    fn test_reset() {
        let (_clock, t) = tracker();
        t.record("a", &success(10, 1.0));
        t.record("b", &success(10, 1.0));
        t.reset("a");
        assert!(t.snapshot("a").is_none());
        assert_eq!(t.snapshots().len(), 1);
        t.reset_all();
        assert!(t.snapshots().is_empty());
        assert_eq!(t.event_count(), 0);
    }

    #[test]
    fn test_record_never_panics_on_extremes() {
        let (_clock, t) = tracker();
        let huge = AttemptOutcome::Success {
            payload: WinningBid {
                price_cpm: 0.0,
                currency: "USD".into(),
                creative: None,
                adapter: "x".into(),
                ttl_seconds: 0,
            },
            latency_ms: u64::MAX,
            price_micros: u64::MAX,
        };
        t.record("a", &huge);
        t.record("a", &huge);
        let s = t.snapshot("a").unwrap();
        assert_eq!(s.latency_sum_ms, u64::MAX);
        assert_eq!(s.price_sum_micros, u64::MAX);
    }
}
