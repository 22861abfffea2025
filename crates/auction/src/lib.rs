//! Server-side auction protocol client with timeout, retry/backoff and
//! circuit breaking over a pluggable HTTP transport.

pub mod client;
pub mod retry;
pub mod transport;

pub use client::{map_response, map_transport_error, AuctionClient};
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, ScriptedTransport, TransportError};
