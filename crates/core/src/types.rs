use crate::auction::{CurrencyRates, WinningBid};
use crate::error::{MediationError, MediationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Ad format of a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdFormat {
    Banner,
    Interstitial,
    Rewarded,
    Native,
    AppOpen,
}

impl AdFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdFormat::Banner => "banner",
            AdFormat::Interstitial => "interstitial",
            AdFormat::Rewarded => "rewarded",
            AdFormat::Native => "native",
            AdFormat::AppOpen => "app_open",
        }
    }
}

impl fmt::Display for AdFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection strategy, configured per placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Sequential priority tiers, weighted random draw inside a tier.
    #[default]
    Waterfall,
    /// Fan out to every source, highest price before the deadline wins.
    Concurrent,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Waterfall => "waterfall",
            Strategy::Concurrent => "concurrent",
        }
    }
}

// ─── Adapter configuration ──────────────────────────────────────────────

/// Adapter family a source is served through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFamily {
    ServerAuction,
    #[serde(rename = "admob")]
    AdMob,
    #[serde(rename = "applovin")]
    AppLovin,
    UnityAds,
    #[serde(rename = "ironsource")]
    IronSource,
    MetaAudienceNetwork,
    Custom,
}

impl AdapterFamily {
    pub const ALL: [AdapterFamily; 7] = [
        AdapterFamily::ServerAuction,
        AdapterFamily::AdMob,
        AdapterFamily::AppLovin,
        AdapterFamily::UnityAds,
        AdapterFamily::IronSource,
        AdapterFamily::MetaAudienceNetwork,
        AdapterFamily::Custom,
    ];
}

impl AdapterFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterFamily::ServerAuction => "server_auction",
            AdapterFamily::AdMob => "admob",
            AdapterFamily::AppLovin => "applovin",
            AdapterFamily::UnityAds => "unity_ads",
            AdapterFamily::IronSource => "ironsource",
            AdapterFamily::MetaAudienceNetwork => "meta_audience_network",
            AdapterFamily::Custom => "custom",
        }
    }
}

/// Typed per-family adapter settings, validated once when the source is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum AdapterConfig {
    /// Server-mediated auction. `endpoint` overrides the global auction endpoint.
    ServerAuction {
        #[serde(default)]
        endpoint: Option<String>,
    },
    #[serde(rename = "admob")]
    AdMob {
        ad_unit_id: String,
    },
    #[serde(rename = "applovin")]
    AppLovin {
        sdk_key: String,
        ad_unit_id: String,
    },
    UnityAds {
        game_id: String,
        placement_id: String,
    },
    #[serde(rename = "ironsource")]
    IronSource {
        app_key: String,
        instance_id: String,
    },
    MetaAudienceNetwork {
        placement_id: String,
    },
    Custom {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl AdapterConfig {
    pub fn family(&self) -> AdapterFamily {
        match self {
            AdapterConfig::ServerAuction { .. } => AdapterFamily::ServerAuction,
            AdapterConfig::AdMob { .. } => AdapterFamily::AdMob,
            AdapterConfig::AppLovin { .. } => AdapterFamily::AppLovin,
            AdapterConfig::UnityAds { .. } => AdapterFamily::UnityAds,
            AdapterConfig::IronSource { .. } => AdapterFamily::IronSource,
            AdapterConfig::MetaAudienceNetwork { .. } => AdapterFamily::MetaAudienceNetwork,
            AdapterConfig::Custom { .. } => AdapterFamily::Custom,
        }
    }

    pub fn validate(&self) -> MediationResult<()> {
        let required: Vec<(&str, &str)> = match self {
            AdapterConfig::ServerAuction { endpoint } => match endpoint {
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    return Err(MediationError::InvalidConfiguration(format!(
                        "server_auction endpoint must be http(s): {url}"
                    )));
                }
                _ => Vec::new(),
            },
            AdapterConfig::AdMob { ad_unit_id } => vec![("ad_unit_id", ad_unit_id.as_str())],
            AdapterConfig::AppLovin { sdk_key, ad_unit_id } => {
                vec![("sdk_key", sdk_key.as_str()), ("ad_unit_id", ad_unit_id.as_str())]
            }
            AdapterConfig::UnityAds { game_id, placement_id } => {
                vec![("game_id", game_id.as_str()), ("placement_id", placement_id.as_str())]
            }
            AdapterConfig::IronSource { app_key, instance_id } => {
                vec![("app_key", app_key.as_str()), ("instance_id", instance_id.as_str())]
            }
            AdapterConfig::MetaAudienceNetwork { placement_id } => {
                vec![("placement_id", placement_id.as_str())]
            }
            AdapterConfig::Custom { name, .. } => vec![("name", name.as_str())],
        };

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(MediationError::InvalidConfiguration(format!(
                    "{} adapter requires a non-empty {field}",
                    self.family().as_str()
                )));
            }
        }
        Ok(())
    }
}

// ─── Source ─────────────────────────────────────────────────────────────

/// Raw, deserialisable description of a demand source. Converted into a
/// validated [`Source`] with [`SourceConfig::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub min_bid: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub adapter: AdapterConfig,
}

fn default_weight() -> f64 { 1.0 }
fn default_source_timeout_ms() -> u64 { 3_000 }
fn default_enabled() -> bool { true }

impl SourceConfig {
    pub fn new(id: impl Into<String>, adapter: AdapterConfig) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            weight: default_weight(),
            timeout_ms: default_source_timeout_ms(),
            enabled: default_enabled(),
            min_bid: 0.0,
            metadata: BTreeMap::new(),
            adapter,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn min_bid(mut self, min_bid: f64) -> Self {
        self.min_bid = min_bid;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate invariants and produce an immutable [`Source`].
    pub fn build(self) -> MediationResult<Source> {
        if self.id.trim().is_empty() {
            return Err(MediationError::InvalidConfiguration(
                "source id must not be empty".into(),
            ));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(MediationError::InvalidConfiguration(format!(
                "source {} weight must be positive, got {}",
                self.id, self.weight
            )));
        }
        if self.timeout_ms == 0 {
            return Err(MediationError::InvalidConfiguration(format!(
                "source {} timeout_ms must be positive",
                self.id
            )));
        }
        if !self.min_bid.is_finite() || self.min_bid < 0.0 {
            return Err(MediationError::InvalidConfiguration(format!(
                "source {} min_bid must be non-negative, got {}",
                self.id, self.min_bid
            )));
        }
        self.adapter.validate()?;

        Ok(Source {
            id: self.id,
            priority: self.priority,
            weight: self.weight,
            timeout_ms: self.timeout_ms,
            enabled: self.enabled,
            min_bid: self.min_bid,
            metadata: self.metadata,
            adapter: self.adapter,
        })
    }
}

/// A validated demand candidate. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    id: String,
    priority: u32,
    weight: f64,
    timeout_ms: u64,
    enabled: bool,
    min_bid: f64,
    metadata: BTreeMap<String, String>,
    adapter: AdapterConfig,
}

impl Source {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn min_bid(&self) -> f64 {
        self.min_bid
    }

    pub fn min_bid_micros(&self) -> u64 {
        cpm_to_micros(self.min_bid)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn adapter(&self) -> &AdapterConfig {
        &self.adapter
    }
}

// ─── Attempt outcome ────────────────────────────────────────────────────

/// Result of one attempt against one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success {
        payload: WinningBid,
        latency_ms: u64,
        /// Price in micros; USD micros once [`AttemptOutcome::normalized`].
        price_micros: u64,
    },
    NoFill {
        reason: String,
    },
    Error {
        cause: MediationError,
    },
    Timeout,
}

impl AttemptOutcome {
    pub fn success(payload: WinningBid, latency_ms: u64) -> Self {
        let price_micros = payload.price_micros();
        AttemptOutcome::Success {
            payload,
            latency_ms,
            price_micros,
        }
    }

    pub fn no_fill(reason: impl Into<String>) -> Self {
        AttemptOutcome::NoFill {
            reason: reason.into(),
        }
    }

    pub fn error(cause: MediationError) -> Self {
        AttemptOutcome::Error { cause }
    }

    /// Re-price a success into USD micros. Other outcomes pass through.
    pub fn normalized(self, rates: &CurrencyRates) -> Self {
        match self {
            AttemptOutcome::Success {
                payload,
                latency_ms,
                ..
            } => {
                let price_micros = rates.to_usd_micros(&payload);
                AttemptOutcome::Success {
                    payload,
                    latency_ms,
                    price_micros,
                }
            }
            other => other,
        }
    }

    /// Fold an auction result into an attempt outcome. `NoFill` and `Timeout`
    /// keep their own variants; every other failure becomes `Error`.
    pub fn from_auction(result: MediationResult<WinningBid>, latency_ms: u64) -> Self {
        match result {
            Ok(bid) => AttemptOutcome::success(bid, latency_ms),
            Err(MediationError::NoFill(reason)) => AttemptOutcome::NoFill { reason },
            Err(MediationError::Timeout) => AttemptOutcome::Timeout,
            Err(cause) => AttemptOutcome::Error { cause },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }

    /// Error and timeout outcomes count against a source's health.
    pub fn is_failure(&self) -> bool {
        matches!(self, AttemptOutcome::Error { .. } | AttemptOutcome::Timeout)
    }

    pub fn price_micros(&self) -> Option<u64> {
        match self {
            AttemptOutcome::Success { price_micros, .. } => Some(*price_micros),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::NoFill { .. } => "no_fill",
            AttemptOutcome::Error { .. } => "error",
            AttemptOutcome::Timeout => "timeout",
        }
    }
}

/// Convert a CPM in currency units into integer micros.
pub fn cpm_to_micros(cpm: f64) -> u64 {
    if !cpm.is_finite() || cpm <= 0.0 {
        return 0;
    }
    (cpm * 1_000_000.0).round() as u64
}

/// Per-pass context the arbiter needs besides the source list.
#[derive(Debug, Clone)]
pub struct PassContext {
    pub placement_id: String,
    pub ad_format: Option<AdFormat>,
    /// Shared deadline for the concurrent strategy.
    pub placement_timeout: Duration,
}

impl PassContext {
    pub fn new(placement_id: impl Into<String>, placement_timeout: Duration) -> Self {
        Self {
            placement_id: placement_id.into(),
            ad_format: None,
            placement_timeout,
        }
    }

    pub fn with_format(mut self, ad_format: AdFormat) -> Self {
        self.ad_format = Some(ad_format);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admob() -> AdapterConfig {
        AdapterConfig::AdMob {
            ad_unit_id: "ca-app-pub-1/2".into(),
        }
    }

    #[test]
    fn test_source_build_enforces_invariants() {
        assert!(SourceConfig::new("a", admob()).build().is_ok());

        let zero_weight = SourceConfig::new("a", admob()).weight(0.0).build();
        assert!(matches!(
            zero_weight,
            Err(MediationError::InvalidConfiguration(_))
        ));

        let nan_weight = SourceConfig::new("a", admob()).weight(f64::NAN).build();
        assert!(nan_weight.is_err());

        let zero_timeout = SourceConfig::new("a", admob()).timeout_ms(0).build();
        assert!(zero_timeout.is_err());

        let negative_floor = SourceConfig::new("a", admob()).min_bid(-0.5).build();
        assert!(negative_floor.is_err());

        let empty_id = SourceConfig::new("  ", admob()).build();
        assert!(empty_id.is_err());
    }

    #[test]
    fn test_adapter_validation() {
        let missing = AdapterConfig::AppLovin {
            sdk_key: "key".into(),
            ad_unit_id: "".into(),
        };
        assert!(missing.validate().is_err());

        let bad_endpoint = AdapterConfig::ServerAuction {
            endpoint: Some("ftp://auction".into()),
        };
        assert!(bad_endpoint.validate().is_err());

        let default_endpoint = AdapterConfig::ServerAuction { endpoint: None };
        assert!(default_endpoint.validate().is_ok());
        assert_eq!(default_endpoint.family(), AdapterFamily::ServerAuction);
    }

    #[test]
    fn test_adapter_config_deserializes_tagged() {
        let json = r#"{"family":"unity_ads","game_id":"g1","placement_id":"p1"}"#;
        let cfg: AdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.family(), AdapterFamily::UnityAds);

        let json = r#"{"family":"admob","ad_unit_id":"ca-1"}"#;
        let cfg: AdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.family(), AdapterFamily::AdMob);
        assert!(serde_json::from_str::<AdapterConfig>(r#"{"family":"ad_mob","ad_unit_id":"ca-1"}"#).is_err());
    }

    #[test]
    fn test_family_serde_names_match_labels() {
        for family in AdapterFamily::ALL {
            let value = serde_json::to_value(family).unwrap();
            assert_eq!(value, serde_json::Value::from(family.as_str()));
            let back: AdapterFamily = serde_json::from_value(value).unwrap();
            assert_eq!(back, family);
        }

        let configs = [
            AdapterConfig::ServerAuction { endpoint: None },
            AdapterConfig::AdMob { ad_unit_id: "u".into() },
            AdapterConfig::AppLovin { sdk_key: "k".into(), ad_unit_id: "u".into() },
            AdapterConfig::UnityAds { game_id: "g".into(), placement_id: "p".into() },
            AdapterConfig::IronSource { app_key: "k".into(), instance_id: "0".into() },
            AdapterConfig::MetaAudienceNetwork { placement_id: "p".into() },
            AdapterConfig::Custom { name: "c".into(), params: BTreeMap::new() },
        ];
        for config in configs {
            let value = serde_json::to_value(&config).unwrap();
            assert_eq!(value["family"], serde_json::Value::from(config.family().as_str()));
        }
    }

    #[test]
    fn test_outcome_from_auction() {
        let bid = WinningBid {
            price_cpm: 2.5,
            currency: "USD".into(),
            creative: Some("cr-1".into()),
            adapter: "admob".into(),
            ttl_seconds: 300,
        };
        let ok = AttemptOutcome::from_auction(Ok(bid), 40);
        assert_eq!(ok.price_micros(), Some(2_500_000));

        let no_fill = AttemptOutcome::from_auction(Err(MediationError::NoFill("no_bid".into())), 5);
        assert_eq!(no_fill, AttemptOutcome::no_fill("no_bid"));

        let timeout = AttemptOutcome::from_auction(Err(MediationError::Timeout), 5);
        assert_eq!(timeout, AttemptOutcome::Timeout);

        let err = AttemptOutcome::from_auction(Err(MediationError::ServerError(503)), 5);
        assert!(err.is_failure());
    }

    #[test]
    fn test_normalized_reprices_success_only() {
        let eur = AttemptOutcome::success(
            WinningBid {
                price_cpm: 2.0,
                currency: "EUR".into(),
                creative: None,
                adapter: "x".into(),
                ttl_seconds: 60,
            },
            12,
        );
        assert_eq!(eur.price_micros(), Some(2_000_000));
        let usd = eur.normalized(&CurrencyRates::default());
        assert_eq!(usd.price_micros(), Some(2_160_000));
        assert!(matches!(usd, AttemptOutcome::Success { latency_ms: 12, .. }));

        assert_eq!(
            AttemptOutcome::Timeout.normalized(&CurrencyRates::default()),
            AttemptOutcome::Timeout
        );
    }

    #[test]
    fn test_cpm_to_micros() {
        assert_eq!(cpm_to_micros(1.234567), 1_234_567);
        assert_eq!(cpm_to_micros(-1.0), 0);
        assert_eq!(cpm_to_micros(f64::INFINITY), 0);
    }
}
