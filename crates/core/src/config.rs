use crate::auction::CurrencyRates;
use crate::error::{MediationError, MediationResult};
use crate::types::{AdFormat, PassContext, Source, SourceConfig, Strategy};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `MEDIATOR__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub auction: AuctionConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub placements: Vec<PlacementConfig>,
}

// ─── Circuit breaker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout_ms() -> u64 { 60_000 }
fn default_half_open_max_attempts() -> u32 { 3 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

// ─── Fill outcome tracker ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: u64,
    #[serde(default = "default_pattern_cooldown_secs")]
    pub pattern_cooldown_secs: u64,
    #[serde(default = "default_format_min_samples")]
    pub format_min_samples: u64,
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    #[serde(default = "default_max_patterns")]
    pub max_patterns: usize,
}

fn default_min_sample_size() -> u64 { 10 }
fn default_consecutive_failure_threshold() -> u32 { 3 }
fn default_max_events() -> usize { 5_000 }
fn default_max_event_age_secs() -> u64 { 12 * 60 * 60 }
fn default_pattern_cooldown_secs() -> u64 { 5 * 60 }
fn default_format_min_samples() -> u64 { 10 }
fn default_latency_window() -> usize { 256 }
fn default_max_patterns() -> usize { 200 }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_sample_size: default_min_sample_size(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            max_events: default_max_events(),
            max_event_age_secs: default_max_event_age_secs(),
            pattern_cooldown_secs: default_pattern_cooldown_secs(),
            format_min_samples: default_format_min_samples(),
            latency_window: default_latency_window(),
            max_patterns: default_max_patterns(),
        }
    }
}

// ─── Network preflight ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_offline_timeout_ms")]
    pub offline_timeout_ms: u64,
    #[serde(default = "default_online_timeout_ms")]
    pub online_timeout_ms: u64,
}

fn default_offline_timeout_ms() -> u64 { 50 }
fn default_online_timeout_ms() -> u64 { 5_000 }

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            offline_timeout_ms: default_offline_timeout_ms(),
            online_timeout_ms: default_online_timeout_ms(),
        }
    }
}

// ─── Auction protocol client ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AuctionConfig {
    #[serde(default = "default_auction_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Backoff cap per placement format; formats not listed use `max_backoff_ms`.
    #[serde(default = "default_max_backoff_by_format_ms")]
    pub max_backoff_by_format_ms: BTreeMap<AdFormat, u64>,
}

fn default_auction_endpoint() -> String {
    "https://auction.example.com/v1/bid".to_string()
}
fn default_request_timeout_ms() -> u64 { 3_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 250 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_backoff_ms() -> u64 { 2_000 }
fn default_max_backoff_by_format_ms() -> BTreeMap<AdFormat, u64> {
    BTreeMap::from([
        (AdFormat::Banner, 500),
        (AdFormat::Native, 1_000),
        (AdFormat::AppOpen, 1_000),
        (AdFormat::Interstitial, 2_000),
        (AdFormat::Rewarded, 3_000),
    ])
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_auction_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            max_backoff_by_format_ms: default_max_backoff_by_format_ms(),
        }
    }
}

impl AuctionConfig {
    pub fn validate(&self) -> MediationResult<()> {
        if self.max_attempts == 0 {
            return Err(MediationError::InvalidConfiguration(
                "auction.max_attempts must be at least 1".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(MediationError::InvalidConfiguration(format!(
                "auction.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(MediationError::InvalidConfiguration(format!(
                "auction.endpoint must be http(s): {}",
                self.endpoint
            )));
        }
        Ok(())
    }
}

// ─── Arbiter ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ArbiterConfig {
    #[serde(default = "default_adaptive_weights")]
    pub adaptive_weights: bool,
    #[serde(default = "default_adaptive_timeouts")]
    pub adaptive_timeouts: bool,
    #[serde(default = "default_adaptive_timeout_floor_ms")]
    pub adaptive_timeout_floor_ms: u64,
    /// Network-bound worker permits. `0` sizes from available parallelism.
    #[serde(default)]
    pub network_workers: usize,
    /// Compute-bound worker permits. `0` sizes from available parallelism.
    #[serde(default)]
    pub compute_workers: usize,
    /// Fixed seed for the weighted draw. Unset means OS entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// USD conversion applied to every bid before flooring and ranking.
    #[serde(default)]
    pub exchange_rates: CurrencyRates,
    #[serde(default)]
    pub hedge: HedgeConfig,
}

/// Hedged attempts: when the primary call is still pending after the hedge
/// delay, one backup call is launched and the first success wins.
#[derive(Debug, Clone, Deserialize)]
pub struct HedgeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Fixed hedge delay. `0` derives it from the source's p95 latency.
    #[serde(default)]
    pub delay_ms: u64,
    /// Delay used when `delay_ms` is 0 and no latency has been observed yet.
    #[serde(default = "default_hedge_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
    /// Lower bound once the delay is clamped to half the attempt budget.
    #[serde(default = "default_hedge_min_delay_ms")]
    pub min_delay_ms: u64,
}

fn default_hedge_fallback_delay_ms() -> u64 { 150 }
fn default_hedge_min_delay_ms() -> u64 { 10 }

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 0,
            fallback_delay_ms: default_hedge_fallback_delay_ms(),
            min_delay_ms: default_hedge_min_delay_ms(),
        }
    }
}

fn default_adaptive_weights() -> bool { true }
fn default_adaptive_timeouts() -> bool { true }
fn default_adaptive_timeout_floor_ms() -> u64 { 1_000 }

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            adaptive_weights: default_adaptive_weights(),
            adaptive_timeouts: default_adaptive_timeouts(),
            adaptive_timeout_floor_ms: default_adaptive_timeout_floor_ms(),
            network_workers: 0,
            compute_workers: 0,
            rng_seed: None,
            exchange_rates: CurrencyRates::default(),
            hedge: HedgeConfig::default(),
        }
    }
}

// ─── Metrics ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 { 9091 }

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// ─── Placements ─────────────────────────────────────────────────────────

/// One ad placement and its configured demand sources.
#[derive(Debug, Clone, Deserialize)]
pub struct PlacementConfig {
    pub placement_id: String,
    pub ad_format: AdFormat,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_placement_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub floor_cpm: f64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_placement_timeout_ms() -> u64 { 5_000 }

impl PlacementConfig {
    /// Validate and build every source. Duplicate ids are rejected.
    pub fn sources(&self) -> MediationResult<Vec<Source>> {
        let mut seen = HashSet::new();
        let mut built = Vec::with_capacity(self.sources.len());
        for cfg in &self.sources {
            if !seen.insert(cfg.id.as_str()) {
                return Err(MediationError::InvalidConfiguration(format!(
                    "placement {} has duplicate source id {}",
                    self.placement_id, cfg.id
                )));
            }
            built.push(cfg.clone().build()?);
        }
        tracing::debug!(
            placement_id = %self.placement_id,
            sources = built.len(),
            "placement sources validated"
        );
        Ok(built)
    }

    pub fn pass_context(&self) -> PassContext {
        PassContext::new(
            self.placement_id.clone(),
            Duration::from_millis(self.timeout_ms),
        )
        .with_format(self.ad_format)
    }
}

fn default_node_id() -> String {
    "mediator-01".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            breaker: BreakerConfig::default(),
            tracker: TrackerConfig::default(),
            network: NetworkConfig::default(),
            auction: AuctionConfig::default(),
            arbiter: ArbiterConfig::default(),
            metrics: MetricsConfig::default(),
            placements: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file overlaid with
    /// `MEDIATOR__`-prefixed environment variables.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MEDIATOR")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Cross-field validation performed once at startup.
    pub fn validate(&self) -> MediationResult<()> {
        self.auction.validate()?;
        self.arbiter.exchange_rates.validate()?;
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_max_attempts == 0 {
            return Err(MediationError::InvalidConfiguration(
                "breaker thresholds must be at least 1".into(),
            ));
        }
        let mut ids = HashSet::new();
        for placement in &self.placements {
            if !ids.insert(placement.placement_id.as_str()) {
                return Err(MediationError::InvalidConfiguration(format!(
                    "duplicate placement id {}",
                    placement.placement_id
                )));
            }
            if placement.timeout_ms == 0 {
                return Err(MediationError::InvalidConfiguration(format!(
                    "placement {} timeout_ms must be positive",
                    placement.placement_id
                )));
            }
            placement.sources()?;
        }
        Ok(())
    }
}
