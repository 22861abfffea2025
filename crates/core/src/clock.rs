//! Time sources. Every time-dependent component takes a [`SharedClock`] so
//! breaker cooldowns, retention windows, and latency measurement can be
//! driven deterministically in tests.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic plus wall-clock time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds elapsed since an arbitrary fixed origin. Never goes backwards.
    fn monotonic_ms(&self) -> u64;

    /// Current wall-clock time, only used for reporting timestamps.
    fn wall(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by [`Instant`] and [`Utc::now`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests. Wall time moves in lockstep with the
/// monotonic reading, offset from the instant the clock was created.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
    wall_origin: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            wall_origin: Utc::now(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn wall(&self) -> DateTime<Utc> {
        self.wall_origin + chrono::Duration::milliseconds(self.monotonic_ms() as i64)
    }
}
