//! Auction protocol client: preflight, breaker gate, bounded send, status
//! mapping and retry with backoff against one logical auction endpoint.

use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::transport::{HttpResponse, HttpTransport, TransportError};
use mediator_core::auction::parse_bid_response;
use mediator_core::config::AuctionConfig;
use mediator_core::{
    AdFormat, AttemptOutcome, AuctionRequest, AuctionResult, ConsentSnapshot, MediationError,
    RequestContext, SharedClock,
};
use mediator_resilience::{
    Admission, CircuitBreaker, CircuitState, FillOutcomeTracker, NetworkMonitor, Preflight,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Map one HTTP response to the error taxonomy.
pub fn map_response(response: &HttpResponse) -> AuctionResult {
    match response.status {
        204 => Err(MediationError::NoFill("no_content".into())),
        200..=299 => parse_bid_response(&response.body),
        300..=399 => Err(MediationError::cancelled()),
        429 => Err(MediationError::RateLimited {
            retry_after_secs: response
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok()),
        }),
        400..=499 => Err(MediationError::ClientError(response.status)),
        500..=599 => Err(MediationError::ServerError(response.status)),
        other => Err(MediationError::InternalError(format!(
            "unexpected HTTP status {other}"
        ))),
    }
}

pub fn map_transport_error(err: TransportError) -> MediationError {
    match err {
        TransportError::Timeout => MediationError::Timeout,
        TransportError::Cancelled => MediationError::cancelled(),
        TransportError::Dns(detail) => MediationError::NetworkError(format!("dns: {detail}")),
        TransportError::Connect(detail) => {
            MediationError::NetworkError(format!("connect: {detail}"))
        }
        TransportError::Other(detail) => MediationError::NetworkError(detail),
    }
}

fn cooldown_secs(remaining: Duration) -> u64 {
    let ms = remaining.as_millis() as u64;
    ms.div_ceil(1_000)
}

/// Admitted breaker slot. Dropping it before a verdict hands the slot back,
/// so an attempt future abandoned mid-send never pins a half-open slot.
struct SlotGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release();
        }
    }
}

pub struct AuctionClient {
    source_id: String,
    endpoint: String,
    request_timeout: Duration,
    transport: Arc<dyn HttpTransport>,
    breaker: Arc<CircuitBreaker>,
    network: Arc<NetworkMonitor>,
    tracker: Option<Arc<FillOutcomeTracker>>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    clock: SharedClock,
    context: RequestContext,
}

impl AuctionClient {
    /// The breaker's source id doubles as the client's source id in logs,
    /// metrics and the tracker.
    pub fn new(
        config: &AuctionConfig,
        transport: Arc<dyn HttpTransport>,
        breaker: Arc<CircuitBreaker>,
        network: Arc<NetworkMonitor>,
        clock: SharedClock,
    ) -> Self {
        Self {
            source_id: breaker.source_id().to_string(),
            endpoint: config.endpoint.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            transport,
            breaker,
            network,
            tracker: None,
            retry: RetryPolicy::from_config(config),
            sleeper: Arc::new(TokioSleeper),
            clock,
            context: RequestContext::default(),
        }
    }

    /// Record every attempt into `tracker`. Leave unset when a caller (the
    /// arbiter) records the folded outcome itself.
    pub fn with_tracker(mut self, tracker: Arc<FillOutcomeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub async fn request_bid(
        &self,
        placement_id: &str,
        ad_format: AdFormat,
        floor_price: f64,
        consent: &ConsentSnapshot,
    ) -> AuctionResult {
        self.request_bid_cancellable(
            placement_id,
            ad_format,
            floor_price,
            consent,
            &CancellationToken::new(),
        )
        .await
    }

    pub async fn request_bid_cancellable(
        &self,
        placement_id: &str,
        ad_format: AdFormat,
        floor_price: f64,
        consent: &ConsentSnapshot,
        cancel: &CancellationToken,
    ) -> AuctionResult {
        let request =
            AuctionRequest::new(placement_id, ad_format, floor_price, &self.context, consent);
        self.execute(&request, cancel).await
    }

    /// Run the full attempt sequence for a prepared request. Every retry
    /// sends the same body, so the request id never changes.
    pub async fn execute(
        &self,
        request: &AuctionRequest,
        cancel: &CancellationToken,
    ) -> AuctionResult {
        if let Preflight::FastFail { reason, .. } = self.network.preflight() {
            debug!(source_id = %self.source_id, reason = %reason, "auction preflight fast-fail");
            return Err(MediationError::NetworkError(reason));
        }

        let body = request.encode()?;
        let request_id = request.request_id.to_string();
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(MediationError::cancelled());
            }

            if let Admission::Rejected { remaining_cooldown } = self.breaker.try_acquire() {
                debug!(
                    source_id = %self.source_id,
                    request_id = %request_id,
                    "auction endpoint circuit open"
                );
                return Err(MediationError::CircuitOpen {
                    remaining_cooldown_secs: cooldown_secs(remaining_cooldown),
                });
            }

            let mut slot = SlotGuard::new(&self.breaker);
            let started = self.clock.monotonic_ms();
            let result = self.send_once(body.clone(), cancel).await;
            slot.disarm();
            let latency_ms = self.clock.monotonic_ms().saturating_sub(started);
            let cancelled = cancel.is_cancelled();
            self.settle(request, &result, latency_ms, cancelled, attempt);

            let err = match result {
                Ok(bid) => return Ok(bid),
                Err(err) => err,
            };

            attempt += 1;
            // Redirects share the cancellation detail and are never retried.
            let retryable = err.is_transient() && err != MediationError::cancelled();
            if cancelled || !retryable || attempt >= max_attempts {
                if retryable && !cancelled {
                    warn!(
                        source_id = %self.source_id,
                        request_id = %request_id,
                        attempts = attempt,
                        error = %err,
                        "auction retries exhausted"
                    );
                }
                return Err(err);
            }

            // This attempt's failure tripped the breaker: no backoff, no more sends.
            if self.breaker.state() == CircuitState::Open {
                warn!(
                    source_id = %self.source_id,
                    request_id = %request_id,
                    attempts = attempt,
                    error = %err,
                    "auction endpoint circuit opened mid-retry"
                );
                return Err(MediationError::CircuitOpen {
                    remaining_cooldown_secs: cooldown_secs(self.breaker.remaining_cooldown()),
                });
            }

            let backoff = self.retry.backoff_for_format(attempt - 1, request.ad_format);
            metrics::counter!("auction.retries", "source" => self.source_id.clone()).increment(1);
            debug!(
                source_id = %self.source_id,
                request_id = %request_id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "retrying auction request"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MediationError::cancelled()),
                _ = self.sleeper.sleep(backoff) => {}
            }
        }
    }

    async fn send_once(&self, body: Vec<u8>, cancel: &CancellationToken) -> AuctionResult {
        let deadline = self.request_timeout.min(self.network.effective_timeout());
        metrics::counter!("auction.requests", "source" => self.source_id.clone()).increment(1);

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = tokio::time::timeout(deadline, self.transport.post_json(&self.endpoint, body, deadline)) => {
                r.unwrap_or(Err(TransportError::Timeout))
            }
        };

        match sent {
            Ok(response) => map_response(&response),
            Err(err) => Err(map_transport_error(err)),
        }
    }

    /// Feed one attempt's verdict to the breaker, the tracker and metrics.
    fn settle(
        &self,
        request: &AuctionRequest,
        result: &AuctionResult,
        latency_ms: u64,
        cancelled: bool,
        attempt: u32,
    ) {
        if cancelled {
            self.breaker.release();
            return;
        }

        match result {
            // A declined bid is a healthy response from the endpoint.
            Ok(_) | Err(MediationError::NoFill(_)) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }

        if let Err(err) = result {
            if !err.is_no_fill() {
                metrics::counter!("auction.errors", "class" => err.class()).increment(1);
            }
        }

        if let Some(tracker) = &self.tracker {
            let outcome = AttemptOutcome::from_auction(result.clone(), latency_ms);
            tracker.record_with_format(&self.source_id, Some(request.ad_format), &outcome);
        }

        if let Ok(bid) = result {
            info!(
                source_id = %self.source_id,
                request_id = %request.request_id,
                placement_id = %request.placement_id,
                adapter = %bid.adapter,
                cpm = bid.price_cpm,
                latency_ms,
                attempt,
                "auction won"
            );
        }
    }
}
