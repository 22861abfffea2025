//! Fault isolation and health tracking shared by every mediation pass:
//! per-source circuit breakers, fill outcome statistics, and network preflight.

pub mod breaker;
pub mod network;
pub mod report;
pub mod tracker;

pub use breaker::{Admission, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use network::{ConnectionClass, NetworkMonitor, NetworkState, Preflight};
pub use report::OperationalReport;
pub use tracker::{FillOutcomeTracker, SourceStatistics};
