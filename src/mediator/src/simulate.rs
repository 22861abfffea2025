//! Simulated demand for running the mediator without live partners: a
//! randomised SDK call-out and a scripted auction endpoint.

use async_trait::async_trait;
use mediator_arbiter::{AdapterCallout, RequestMeta};
use mediator_auction::{HttpResponse, ScriptedTransport};
use mediator_core::config::PlacementConfig;
use mediator_core::{
    AdFormat, AdapterConfig, AdapterFamily, AttemptOutcome, MediationError, Source, SourceConfig,
    Strategy, WinningBid,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn meta_f64(source: &Source, key: &str, default: f64) -> f64 {
    source
        .metadata()
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Stand-in for a client-side network SDK. Behaviour is steered by source
/// metadata: `sim_fill_rate`, `sim_error_rate`, `sim_latency_ms`, `sim_cpm`.
pub struct SimulatedCallout {
    family: AdapterFamily,
    rng: Mutex<StdRng>,
}

impl SimulatedCallout {
    pub fn new(family: AdapterFamily, seed: u64) -> Self {
        Self {
            family,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl AdapterCallout for SimulatedCallout {
    fn family(&self) -> AdapterFamily {
        self.family
    }

    async fn load(&self, source: &Source, meta: &RequestMeta, _timeout: Duration) -> AttemptOutcome {
        let fill_rate = meta_f64(source, "sim_fill_rate", 0.6);
        let error_rate = meta_f64(source, "sim_error_rate", 0.05);
        let latency_ms = meta_f64(source, "sim_latency_ms", 120.0).max(0.0);
        let cpm = meta_f64(source, "sim_cpm", 1.0);

        let (roll, jitter, price_jitter) = {
            let mut rng = self.rng.lock();
            (
                rng.gen::<f64>(),
                rng.gen_range(0.5..1.5),
                rng.gen_range(0.8..1.2),
            )
        };
        let latency = (latency_ms * jitter).round() as u64;

        tokio::select! {
            _ = meta.cancel.cancelled() => return AttemptOutcome::error(MediationError::cancelled()),
            _ = tokio::time::sleep(Duration::from_millis(latency)) => {}
        }

        if roll < error_rate {
            return AttemptOutcome::error(MediationError::InternalError(format!(
                "{} sdk load failed",
                self.family.as_str()
            )));
        }
        if roll < error_rate + fill_rate {
            return AttemptOutcome::success(
                WinningBid {
                    price_cpm: (cpm * price_jitter * 100.0).round() / 100.0,
                    currency: "USD".into(),
                    creative: Some(format!("{}-{}", source.id(), meta.ad_format)),
                    adapter: self.family.as_str().to_string(),
                    ttl_seconds: 3_600,
                },
                latency,
            );
        }
        AttemptOutcome::no_fill("sdk_no_fill")
    }
}

/// Auction endpoint that stutters briefly before settling into steady fills.
pub fn auction_transport() -> ScriptedTransport {
    let winner = br#"{"winner":{"adapter":"sim-exchange","cpm":2.40,"currency":"USD","creative":"sim-cr-1","ttl_seconds":900}}"#;
    ScriptedTransport::new(Ok(HttpResponse::json(200, winner.to_vec())))
        .with_latency(Duration::from_millis(90))
        .then(Ok(HttpResponse::new(503)))
        .then(Ok(HttpResponse::new(204)))
        .then(Ok(HttpResponse::new(429).with_header("Retry-After", "2")))
}

fn sdk(id: &str, adapter: AdapterConfig, fill: f64, latency_ms: u64, cpm: f64) -> SourceConfig {
    SourceConfig::new(id, adapter)
        .meta("sim_fill_rate", fill.to_string())
        .meta("sim_latency_ms", latency_ms.to_string())
        .meta("sim_cpm", cpm.to_string())
}

/// Placements used when the configuration defines none.
pub fn demo_placements() -> Vec<PlacementConfig> {
    vec![
        PlacementConfig {
            placement_id: "home_banner".into(),
            ad_format: AdFormat::Banner,
            strategy: Strategy::Waterfall,
            timeout_ms: 5_000,
            floor_cpm: 0.2,
            sources: vec![
                sdk(
                    "admob_banner",
                    AdapterConfig::AdMob {
                        ad_unit_id: "ca-app-pub-0000000000000000/1111111111".into(),
                    },
                    0.5,
                    150,
                    1.1,
                )
                .weight(2.0),
                sdk(
                    "applovin_banner",
                    AdapterConfig::AppLovin {
                        sdk_key: "sim-sdk-key".into(),
                        ad_unit_id: "sim-banner".into(),
                    },
                    0.4,
                    200,
                    1.3,
                ),
                sdk(
                    "unity_banner",
                    AdapterConfig::UnityAds {
                        game_id: "0000000".into(),
                        placement_id: "Banner_Android".into(),
                    },
                    0.7,
                    250,
                    0.6,
                )
                .priority(1),
            ],
        },
        PlacementConfig {
            placement_id: "level_complete_rewarded".into(),
            ad_format: AdFormat::Rewarded,
            strategy: Strategy::Concurrent,
            timeout_ms: 2_500,
            floor_cpm: 1.0,
            sources: vec![
                SourceConfig::new("exchange", AdapterConfig::ServerAuction { endpoint: None })
                    .timeout_ms(2_000),
                sdk(
                    "ironsource_rewarded",
                    AdapterConfig::IronSource {
                        app_key: "sim-app-key".into(),
                        instance_id: "0".into(),
                    },
                    0.6,
                    400,
                    3.2,
                ),
                sdk(
                    "meta_rewarded",
                    AdapterConfig::MetaAudienceNetwork {
                        placement_id: "000000000000000_111111111111111".into(),
                    },
                    0.3,
                    600,
                    4.0,
                )
                .min_bid(2.0),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_placements_validate() {
        for placement in demo_placements() {
            let sources = placement.sources().unwrap();
            assert!(!sources.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_callout_respects_fill_rate_extremes() {
        let always = SourceConfig::new(
            "always",
            AdapterConfig::AdMob {
                ad_unit_id: "u".into(),
            },
        )
        .meta("sim_fill_rate", "1.0")
        .meta("sim_error_rate", "0.0")
        .build()
        .unwrap();
        let never = SourceConfig::new(
            "never",
            AdapterConfig::AdMob {
                ad_unit_id: "u".into(),
            },
        )
        .meta("sim_fill_rate", "0.0")
        .meta("sim_error_rate", "0.0")
        .build()
        .unwrap();

        let callout = SimulatedCallout::new(AdapterFamily::AdMob, 7);
        let meta = RequestMeta::new("p", AdFormat::Banner);
        for _ in 0..20 {
            assert!(callout.load(&always, &meta, Duration::from_secs(1)).await.is_success());
            assert_eq!(
                callout.load(&never, &meta, Duration::from_secs(1)).await,
                AttemptOutcome::no_fill("sdk_no_fill")
            );
        }
    }
}
