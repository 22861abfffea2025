//! Auction request/result value objects and the bid wire shape.

use crate::error::{MediationError, MediationResult};
use crate::types::{cpm_to_micros, AdFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Normalised privacy flags, attached verbatim to every auction request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdpr_applies: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdpr_consent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub us_privacy: Option<String>,
    #[serde(default)]
    pub coppa: bool,
    #[serde(default)]
    pub limit_ad_tracking: bool,
}

/// Device, app, and user metadata the host supplies once per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub device: BTreeMap<String, String>,
    #[serde(default)]
    pub app: BTreeMap<String, String>,
    #[serde(default)]
    pub user: BTreeMap<String, String>,
}

/// One bid request. Built once per attempt sequence; retries reuse it
/// unchanged so every retry carries the same `request_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionRequest {
    pub request_id: Uuid,
    pub placement_id: String,
    pub ad_format: AdFormat,
    pub floor_price: f64,
    pub device: BTreeMap<String, String>,
    pub app: BTreeMap<String, String>,
    pub user: BTreeMap<String, String>,
    pub consent: ConsentSnapshot,
    pub signal: Option<BTreeMap<String, String>>,
}

impl AuctionRequest {
    pub fn new(
        placement_id: impl Into<String>,
        ad_format: AdFormat,
        floor_price: f64,
        context: &RequestContext,
        consent: &ConsentSnapshot,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            placement_id: placement_id.into(),
            ad_format,
            floor_price,
            device: context.device.clone(),
            app: context.app.clone(),
            user: context.user.clone(),
            consent: consent.clone(),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: BTreeMap<String, String>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn to_wire(&self) -> BidRequestBody {
        BidRequestBody {
            request_id: self.request_id.to_string(),
            placement_id: self.placement_id.clone(),
            ad_type: self.ad_format,
            floor_cpm: self.floor_price,
            device: self.device.clone(),
            user: self.user.clone(),
            app: self.app.clone(),
            consent: self.consent.clone(),
            signal: self.signal.clone(),
        }
    }

    pub fn encode(&self) -> MediationResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire())?)
    }
}

/// The winning bid of an auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinningBid {
    pub price_cpm: f64,
    pub currency: String,
    pub creative: Option<String>,
    pub adapter: String,
    pub ttl_seconds: u64,
}

impl WinningBid {
    pub fn price_micros(&self) -> u64 {
        cpm_to_micros(self.price_cpm)
    }
}

/// Conversion rates into USD, the currency prices are compared and floored
/// in. Currencies missing from the table convert at 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyRates(BTreeMap<String, f64>);

impl Default for CurrencyRates {
    fn default() -> Self {
        Self(
            [("USD", 1.0), ("EUR", 1.08), ("GBP", 1.27), ("JPY", 0.0067)]
                .into_iter()
                .map(|(code, rate)| (code.to_string(), rate))
                .collect(),
        )
    }
}

impl CurrencyRates {
    pub fn with_rate(mut self, currency: impl Into<String>, rate: f64) -> Self {
        self.0.insert(currency.into().to_ascii_uppercase(), rate);
        self
    }

    /// USD per unit of `currency`. Lookup ignores case, since environment
    /// overrides arrive with lower-cased keys.
    pub fn rate(&self, currency: &str) -> f64 {
        self.0
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(currency.trim()))
            .map_or(1.0, |(_, rate)| *rate)
    }

    /// Bid price in USD micros.
    pub fn to_usd_micros(&self, bid: &WinningBid) -> u64 {
        cpm_to_micros(bid.price_cpm * self.rate(&bid.currency))
    }

    pub fn validate(&self) -> MediationResult<()> {
        match self.0.iter().find(|(_, rate)| !rate.is_finite() || **rate <= 0.0) {
            Some((code, rate)) => Err(MediationError::InvalidConfiguration(format!(
                "exchange rate for {code} must be positive, got {rate}"
            ))),
            None => Ok(()),
        }
    }
}

/// Result of one auction: the winning bid or a typed failure
/// (`MediationError::NoFill` when nobody bid).
pub type AuctionResult = MediationResult<WinningBid>;

// ─── Wire shape ─────────────────────────────────────────────────────────

/// JSON body POSTed to the auction endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRequestBody {
    pub request_id: String,
    pub placement_id: String,
    pub ad_type: AdFormat,
    pub floor_cpm: f64,
    pub device: BTreeMap<String, String>,
    pub user: BTreeMap<String, String>,
    pub app: BTreeMap<String, String>,
    pub consent: ConsentSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<BTreeMap<String, String>>,
}

/// Winner object inside a 200 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerBody {
    pub adapter: String,
    pub cpm: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, alias = "creative_id")]
    pub creative: Option<String>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_ttl_seconds() -> u64 {
    3600
}

impl From<WinnerBody> for WinningBid {
    fn from(body: WinnerBody) -> Self {
        WinningBid {
            price_cpm: body.cpm,
            currency: body.currency,
            creative: body.creative,
            adapter: body.adapter,
            ttl_seconds: body.ttl_seconds,
        }
    }
}

/// Parse the body of a 2xx auction response.
///
/// Empty body, a missing/`null` winner, or an empty winner object all mean
/// no fill. The winner may sit under `winner` or `response`.
pub fn parse_bid_response(body: &[u8]) -> AuctionResult {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(MediationError::NoFill("empty_response".into()));
    }

    let value: serde_json::Value = serde_json::from_slice(body)?;
    let winner = value
        .get("winner")
        .filter(|w| !w.is_null())
        .or_else(|| value.get("response").filter(|w| !w.is_null()));

    let winner = match winner {
        None => return Err(MediationError::NoFill("no_winner".into())),
        Some(w) if w.as_object().is_some_and(|o| o.is_empty()) => {
            return Err(MediationError::NoFill("no_winner".into()));
        }
        Some(w) => w.clone(),
    };

    let parsed: WinnerBody = serde_json::from_value(winner)
        .map_err(|e| MediationError::InternalError(format!("malformed winner: {e}")))?;

    if !parsed.cpm.is_finite() || parsed.cpm < 0.0 {
        return Err(MediationError::InternalError(format!(
            "malformed winner: invalid cpm {}",
            parsed.cpm
        )));
    }

    Ok(parsed.into())
}
