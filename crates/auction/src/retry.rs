//! Retry policy with exponential backoff, and the sleeper seam used to wait
//! between attempts.

use async_trait::async_trait;
use mediator_core::config::AuctionConfig;
use mediator_core::AdFormat;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Cap override per placement format.
    pub format_caps: BTreeMap<AdFormat, Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AuctionConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AuctionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            format_caps: config
                .max_backoff_by_format_ms
                .iter()
                .map(|(format, ms)| (*format, Duration::from_millis(*ms)))
                .collect(),
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_format_cap(mut self, format: AdFormat, cap: Duration) -> Self {
        self.format_caps.insert(format, cap);
        self
    }

    pub fn cap_for(&self, format: AdFormat) -> Duration {
        self.format_caps
            .get(&format)
            .copied()
            .unwrap_or(self.max_backoff)
    }

    /// Backoff to wait before retry number `retry` (0-indexed), capped at
    /// `max_backoff`.
    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        self.capped_backoff(retry, self.max_backoff)
    }

    /// Same as [`Self::backoff_for_retry`] under the placement format's cap.
    pub fn backoff_for_format(&self, retry: u32, format: AdFormat) -> Duration {
        self.capped_backoff(retry, self.cap_for(format))
    }

    fn capped_backoff(&self, retry: u32, cap: Duration) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let capped_ms = base_ms.min(cap.as_millis() as f64);
        if !capped_ms.is_finite() || capped_ms <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(capped_ms.round() as u64)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(1_500),
            format_caps: BTreeMap::new(),
        };
        assert_eq!(policy.backoff_for_retry(0), Duration::from_millis(250));
        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for_retry(3), Duration::from_millis(1_500));
        assert_eq!(policy.backoff_for_retry(40), Duration::from_millis(1_500));
    }

    #[test]
    fn test_backoff_cap_follows_format() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.cap_for(AdFormat::Banner), Duration::from_millis(500));
        assert_eq!(
            policy.backoff_for_format(3, AdFormat::Banner),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.backoff_for_format(3, AdFormat::Rewarded),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            policy.backoff_for_format(4, AdFormat::Rewarded),
            Duration::from_millis(3_000)
        );

        let policy = RetryPolicy {
            format_caps: BTreeMap::new(),
            ..RetryPolicy::default()
        }
        .with_format_cap(AdFormat::Native, Duration::from_millis(300));
        assert_eq!(policy.cap_for(AdFormat::Native), Duration::from_millis(300));
        assert_eq!(policy.cap_for(AdFormat::Banner), policy.max_backoff);
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_recording_sleeper() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_millis(10)).await;
        sleeper.sleep(Duration::from_millis(20)).await;
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }
}
