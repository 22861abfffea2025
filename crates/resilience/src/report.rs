//! Operational export: per-source health joined with breaker state,
//! recent transitions, and detected patterns.

use crate::breaker::{BreakerTransition, CircuitBreakerRegistry, CircuitState};
use crate::tracker::{DetectedPattern, FillOutcomeTracker, LatencyPercentiles};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub attempts: u64,
    pub fill_rate: f64,
    pub average_latency_ms: Option<f64>,
    pub latency: Option<LatencyPercentiles>,
    pub circuit_state: Option<CircuitState>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationalReport {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub transitions: Vec<BreakerTransition>,
    pub patterns: Vec<DetectedPattern>,
}

impl OperationalReport {
    /// Sources known to either the tracker or the breaker registry.
    pub fn collect(
        tracker: &FillOutcomeTracker,
        breakers: &CircuitBreakerRegistry,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let stats = tracker.snapshots();
        let circuits = breakers.snapshots();

        let ids: BTreeSet<&str> = stats
            .iter()
            .map(|s| s.source_id.as_str())
            .chain(circuits.iter().map(|c| c.source_id.as_str()))
            .collect();

        let sources = ids
            .into_iter()
            .map(|id| {
                let s = stats.iter().find(|s| s.source_id == id);
                SourceReport {
                    source_id: id.to_string(),
                    attempts: s.map_or(0, |s| s.attempts),
                    fill_rate: s.map_or(0.0, |s| s.fill_rate()),
                    average_latency_ms: s.and_then(|s| s.average_latency_ms()),
                    latency: tracker.latency_percentiles(id),
                    circuit_state: circuits
                        .iter()
                        .find(|c| c.source_id == id)
                        .map(|c| c.state),
                    consecutive_failures: s.map_or(0, |s| s.consecutive_failures),
                }
            })
            .collect();

        Self {
            generated_at,
            sources,
            transitions: breakers.transitions(),
            patterns: tracker.patterns(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::config::{BreakerConfig, TrackerConfig};
    use mediator_core::{AttemptOutcome, Clock, ManualClock, MediationError};

    #[test]
    fn test_report_joins_tracker_and_breakers() {
        let clock = ManualClock::shared();
        let tracker = FillOutcomeTracker::new(TrackerConfig::default(), clock.clone());
        let breakers = CircuitBreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            clock.clone(),
        );

        tracker.record("a", &AttemptOutcome::no_fill("no_bid"));
        tracker.record("b", &AttemptOutcome::error(MediationError::ServerError(502)));
        breakers.get("b").record_failure();
        breakers.get("c");

        let report = OperationalReport::collect(&tracker, &breakers, clock.wall());
        let ids: Vec<&str> = report.sources.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(report.sources[1].circuit_state, Some(CircuitState::Open));
        assert_eq!(report.sources[0].circuit_state, None);
        assert_eq!(report.sources[2].attempts, 0);
        assert_eq!(report.transitions.len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sources"][1]["circuit_state"], "open");
    }
}
