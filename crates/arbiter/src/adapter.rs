//! Adapter call-out seam. Each adapter family is served by one
//! [`AdapterCallout`]; server-auction sources route to the auction client.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use mediator_auction::AuctionClient;
use mediator_core::{
    AdFormat, AdapterConfig, AdapterFamily, AttemptOutcome, ConsentSnapshot, MediationError,
    PassContext, SharedClock, Source,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-pass request metadata handed to every call-out.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub placement_id: String,
    pub ad_format: AdFormat,
    pub floor_cpm: f64,
    pub consent: ConsentSnapshot,
    pub cancel: CancellationToken,
}

impl RequestMeta {
    pub fn new(placement_id: impl Into<String>, ad_format: AdFormat) -> Self {
        Self {
            placement_id: placement_id.into(),
            ad_format,
            floor_cpm: 0.0,
            consent: ConsentSnapshot::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_pass(ctx: &PassContext, fallback_format: AdFormat) -> Self {
        Self::new(ctx.placement_id.clone(), ctx.ad_format.unwrap_or(fallback_format))
    }

    pub fn with_floor(mut self, floor_cpm: f64) -> Self {
        self.floor_cpm = floor_cpm;
        self
    }

    pub fn with_consent(mut self, consent: ConsentSnapshot) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A single result-producing load call against one ad network.
#[async_trait]
pub trait AdapterCallout: Send + Sync {
    fn family(&self) -> AdapterFamily;

    /// Reject sources this call-out cannot serve. Called once per source
    /// when the registry is checked against a placement.
    fn validate_source(&self, _source: &Source) -> Result<(), MediationError> {
        Ok(())
    }

    async fn load(&self, source: &Source, meta: &RequestMeta, timeout: Duration) -> AttemptOutcome;
}

/// Routes server-auction sources to an [`AuctionClient`]. Sources that
/// override the endpoint use the client registered for that endpoint.
pub struct AuctionCallout {
    default: Arc<AuctionClient>,
    by_endpoint: HashMap<String, Arc<AuctionClient>>,
    clock: SharedClock,
}

impl AuctionCallout {
    pub fn new(default: Arc<AuctionClient>, clock: SharedClock) -> Self {
        Self {
            default,
            by_endpoint: HashMap::new(),
            clock,
        }
    }

    pub fn with_client(mut self, client: Arc<AuctionClient>) -> Self {
        self.by_endpoint.insert(client.endpoint().to_string(), client);
        self
    }

    fn client_for(&self, source: &Source) -> Result<&Arc<AuctionClient>, MediationError> {
        match source.adapter() {
            AdapterConfig::ServerAuction {
                endpoint: Some(endpoint),
            } if endpoint != self.default.endpoint() => {
                self.by_endpoint.get(endpoint).ok_or_else(|| {
                    MediationError::InvalidConfiguration(format!(
                        "source {} overrides auction endpoint {} with no registered client",
                        source.id(),
                        endpoint
                    ))
                })
            }
            _ => Ok(&self.default),
        }
    }
}

#[async_trait]
impl AdapterCallout for AuctionCallout {
    fn family(&self) -> AdapterFamily {
        AdapterFamily::ServerAuction
    }

    fn validate_source(&self, source: &Source) -> Result<(), MediationError> {
        self.client_for(source).map(|_| ())
    }

    async fn load(&self, source: &Source, meta: &RequestMeta, _timeout: Duration) -> AttemptOutcome {
        let client = match self.client_for(source) {
            Ok(client) => client,
            Err(err) => return AttemptOutcome::error(err),
        };
        let floor = meta.floor_cpm.max(source.min_bid());
        let started = self.clock.monotonic_ms();
        let result = client
            .request_bid_cancellable(
                &meta.placement_id,
                meta.ad_format,
                floor,
                &meta.consent,
                &meta.cancel,
            )
            .await;
        let latency_ms = self.clock.monotonic_ms().saturating_sub(started);
        AttemptOutcome::from_auction(result, latency_ms)
    }
}

/// Adapter family to call-out lookup, validated once at registration.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    callouts: HashMap<AdapterFamily, Arc<dyn AdapterCallout>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call-out for its family, replacing any earlier one.
    pub fn register(&mut self, callout: Arc<dyn AdapterCallout>) {
        let family = callout.family();
        if self.callouts.insert(family, callout).is_some() {
            info!(family = family.as_str(), "adapter call-out replaced");
        } else {
            debug!(family = family.as_str(), "adapter call-out registered");
        }
    }

    pub fn get(&self, family: AdapterFamily) -> Option<Arc<dyn AdapterCallout>> {
        self.callouts.get(&family).cloned()
    }

    pub fn families(&self) -> Vec<AdapterFamily> {
        let mut families: Vec<_> = self.callouts.keys().copied().collect();
        families.sort_by_key(|f| f.as_str());
        families
    }

    /// Check that every source has a registered call-out that accepts it.
    pub fn ensure_covers(&self, sources: &[Source]) -> Result<(), MediationError> {
        for source in sources {
            let family = source.adapter().family();
            let Some(callout) = self.callouts.get(&family) else {
                return Err(MediationError::InvalidConfiguration(format!(
                    "source {} uses unregistered adapter family {}",
                    source.id(),
                    family.as_str()
                )));
            };
            callout.validate_source(source)?;
        }
        Ok(())
    }

    /// Attempt function for the arbiter, dispatching by adapter family.
    pub fn attempt_fn(
        &self,
        meta: RequestMeta,
    ) -> impl Fn(Source, Duration) -> BoxFuture<'static, AttemptOutcome> + Send + Sync + 'static {
        let registry = self.clone();
        let meta = Arc::new(meta);
        move |source: Source, timeout: Duration| {
            let callout = registry.get(source.adapter().family());
            let meta = meta.clone();
            async move {
                match callout {
                    Some(callout) => callout.load(&source, &meta, timeout).await,
                    None => AttemptOutcome::error(MediationError::InvalidConfiguration(format!(
                        "no adapter registered for family {}",
                        source.adapter().family().as_str()
                    ))),
                }
            }
            .boxed()
        }
    }
}
