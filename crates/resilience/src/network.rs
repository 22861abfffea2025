//! Connectivity awareness. The current [`NetworkState`] lives in a
//! `tokio::sync::watch` channel, which gives consumers an atomically replaced
//! snapshot and listeners a change stream.

use chrono::{DateTime, Utc};
use mediator_core::config::NetworkConfig;
use mediator_core::SharedClock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    None,
    Ethernet,
    Wifi,
    Cellular,
    Other,
}

/// Connectivity snapshot as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_connected: bool,
    pub connection_class: ConnectionClass,
    pub has_validated_internet: bool,
    pub bandwidth_estimate_kbps: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

impl NetworkState {
    pub fn offline(observed_at: DateTime<Utc>) -> Self {
        Self {
            is_connected: false,
            connection_class: ConnectionClass::None,
            has_validated_internet: false,
            bandwidth_estimate_kbps: None,
            observed_at,
        }
    }

    pub fn online(connection_class: ConnectionClass, observed_at: DateTime<Utc>) -> Self {
        Self {
            is_connected: true,
            connection_class,
            has_validated_internet: true,
            bandwidth_estimate_kbps: None,
            observed_at,
        }
    }

    /// Equal in every field except the observation timestamp.
    pub fn same_connectivity(&self, other: &NetworkState) -> bool {
        self.is_connected == other.is_connected
            && self.connection_class == other.connection_class
            && self.has_validated_internet == other.has_validated_internet
            && self.bandwidth_estimate_kbps == other.bandwidth_estimate_kbps
    }

    /// Reason a request must fail fast in this state, if any.
    pub fn fast_fail_reason(&self) -> Option<&'static str> {
        if !self.is_connected {
            Some("no_connectivity")
        } else if !self.has_validated_internet {
            Some("no_validated_internet")
        } else {
            None
        }
    }
}

/// Outcome of a connectivity check made before any network I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    Proceed(NetworkState),
    FastFail { reason: String, state: NetworkState },
}

impl Preflight {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Preflight::Proceed(_))
    }
}

pub struct NetworkMonitor {
    config: NetworkConfig,
    clock: SharedClock,
    state: watch::Sender<NetworkState>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkConfig, clock: SharedClock, initial: NetworkState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            config,
            clock,
            state,
        }
    }

    /// Start assuming a validated connection until the platform says otherwise.
    pub fn optimistic(config: NetworkConfig, clock: SharedClock) -> Self {
        let initial = NetworkState::online(ConnectionClass::Other, clock.wall());
        Self::new(config, clock, initial)
    }

    pub fn current(&self) -> NetworkState {
        self.state.borrow().clone()
    }

    /// In-memory check only; never touches the network.
    pub fn preflight(&self) -> Preflight {
        let state = self.current();
        match state.fast_fail_reason() {
            Some(reason) => {
                metrics::counter!("network.fast_fail", "reason" => reason).increment(1);
                Preflight::FastFail {
                    reason: reason.to_string(),
                    state,
                }
            }
            None => Preflight::Proceed(state),
        }
    }

    /// Short deadline while offline, normal deadline while online.
    pub fn effective_timeout(&self) -> Duration {
        if self.state.borrow().fast_fail_reason().is_some() {
            Duration::from_millis(self.config.offline_timeout_ms)
        } else {
            Duration::from_millis(self.config.online_timeout_ms)
        }
    }

    /// Apply a connectivity-change notification. The snapshot is replaced
    /// wholesale; listeners are woken only when connectivity actually changed.
    /// Returns whether listeners were notified.
    pub fn update(&self, next: NetworkState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            let changed = !current.same_connectivity(&next);
            *current = next.clone();
            changed
        });
        if changed {
            info!(
                connected = next.is_connected,
                class = ?next.connection_class,
                validated = next.has_validated_internet,
                "network state changed"
            );
        }
        changed
    }

    /// Convenience for platform callbacks; stamps the state with the clock.
    pub fn on_connectivity_change(
        &self,
        is_connected: bool,
        connection_class: ConnectionClass,
        has_validated_internet: bool,
        bandwidth_estimate_kbps: Option<u64>,
    ) -> bool {
        self.update(NetworkState {
            is_connected,
            connection_class,
            has_validated_internet,
            bandwidth_estimate_kbps,
            observed_at: self.clock.wall(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::{Clock, ManualClock};

    fn monitor() -> (std::sync::Arc<ManualClock>, NetworkMonitor) {
        let clock = ManualClock::shared();
        let m = NetworkMonitor::optimistic(NetworkConfig::default(), clock.clone());
        (clock, m)
    }

    #[test]
    fn test_offline_fast_fails() {
        let (_clock, m) = monitor();
        assert!(m.preflight().is_proceed());
        assert_eq!(m.effective_timeout(), Duration::from_millis(5_000));

        m.on_connectivity_change(false, ConnectionClass::None, false, None);
        match m.preflight() {
            Preflight::FastFail { reason, state } => {
                assert_eq!(reason, "no_connectivity");
                assert!(!state.is_connected);
            }
            Preflight::Proceed(_) => panic!("expected fast fail"),
        }
        assert_eq!(m.effective_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_unvalidated_internet_fast_fails() {
        let (_clock, m) = monitor();
        m.on_connectivity_change(true, ConnectionClass::Wifi, false, None);
        assert_eq!(
            m.preflight(),
            Preflight::FastFail {
                reason: "no_validated_internet".into(),
                state: m.current(),
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_update_does_not_notify() {
        let (clock, m) = monitor();
        let mut rx = m.subscribe();

        assert!(m.on_connectivity_change(true, ConnectionClass::Wifi, true, Some(20_000)));
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        clock.advance_ms(1_000);
        assert!(!m.on_connectivity_change(true, ConnectionClass::Wifi, true, Some(20_000)));
        assert!(!rx.has_changed().unwrap());
        // Snapshot still replaced with the newer observation.
        assert_eq!(m.current().observed_at, clock.wall());

        assert!(m.on_connectivity_change(true, ConnectionClass::Cellular, true, None));
        assert!(rx.has_changed().unwrap());
    }
}
