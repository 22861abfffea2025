//! Weighted random draw and adaptive attempt deadlines.

use rand::Rng;
use std::time::Duration;

/// Pick an index with probability proportional to its weight.
///
/// Non-finite and negative weights count as zero. When no weight is
/// positive the pick falls back to uniform. `None` only for an empty slice.
pub fn weighted_pick<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    let usable = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
    let total: f64 = weights.iter().map(|w| usable(*w)).sum();
    if !total.is_finite() || total <= 0.0 {
        return Some(rng.gen_range(0..weights.len()));
    }

    let mut roll = rng.gen_range(0.0..total);
    let mut last_positive = 0;
    for (idx, weight) in weights.iter().enumerate() {
        let weight = usable(*weight);
        if weight == 0.0 {
            continue;
        }
        last_positive = idx;
        roll -= weight;
        if roll <= 0.0 {
            return Some(idx);
        }
    }
    // Float rounding can leave a sliver of roll past the last candidate.
    Some(last_positive)
}

/// Shrink a configured deadline toward twice the observed mean latency,
/// never below `floor` and never above `configured`.
pub fn adaptive_timeout(configured: Duration, floor: Duration, average_latency_ms: Option<f64>) -> Duration {
    match average_latency_ms {
        Some(avg) if avg.is_finite() && avg >= 0.0 => {
            let doubled = Duration::from_millis((avg * 2.0).ceil() as u64);
            configured.min(floor.max(doubled))
        }
        _ => configured,
    }
}
