//! HTTP transport seam. The auction client only ever sees [`HttpResponse`]
//! or a [`TransportError`]; redirects are surfaced, never followed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Other(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

// ─── reqwest ────────────────────────────────────────────────────────────

/// Production transport over a pooled `reqwest::Client` with redirects disabled.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout;
        }
        let detail = err.to_string();
        if err.is_connect() {
            let lowered = detail.to_ascii_lowercase();
            if lowered.contains("dns") || lowered.contains("resolve") {
                return TransportError::Dns(detail);
            }
            return TransportError::Connect(detail);
        }
        TransportError::Other(detail)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(Self::classify)?.to_vec();

        debug!(url, status, bytes = body.len(), "auction response received");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// ─── Scripted ───────────────────────────────────────────────────────────

/// In-memory transport that replays a fixed script of responses. Used by
/// tests and by the host's offline simulation mode.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    fallback: Result<HttpResponse, TransportError>,
    latency: Duration,
    requests: AtomicUsize,
    bodies: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    /// Once the script runs out every request gets `fallback`.
    pub fn new(fallback: Result<HttpResponse, TransportError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            requests: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, step: Result<HttpResponse, TransportError>) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Simulated round-trip time (uses `tokio::time::sleep`).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, step: Result<HttpResponse, TransportError>) {
        self.script.lock().push_back(step);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post_json(
        &self,
        _url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().push(body);
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if !self.latency.is_zero() {
            if self.latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(self.latency).await;
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let resp = HttpResponse::new(429).with_header("Retry-After", "5");
        assert_eq!(resp.header("retry-after"), Some("5"));
        assert_eq!(resp.header("RETRY-AFTER"), Some("5"));
        assert_eq!(resp.header("x-missing"), None);
    }

    #[tokio::test]
    async fn test_scripted_transport_replays_then_falls_back() {
        let transport = ScriptedTransport::new(Ok(HttpResponse::new(204)))
            .then(Ok(HttpResponse::new(503)))
            .then(Err(TransportError::Timeout));

        let t = Duration::from_secs(1);
        assert_eq!(
            transport.post_json("u", b"a".to_vec(), t).await.unwrap().status,
            503
        );
        assert_eq!(
            transport.post_json("u", b"b".to_vec(), t).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(
            transport.post_json("u", b"c".to_vec(), t).await.unwrap().status,
            204
        );
        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.bodies()[1], b"b".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_latency_beyond_timeout() {
        let transport = ScriptedTransport::new(Ok(HttpResponse::new(204)))
            .with_latency(Duration::from_secs(5));
        let result = transport
            .post_json("u", Vec::new(), Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(TransportError::Timeout));
    }
}
