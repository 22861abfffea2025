//! Mediation arbiter: picks the winning demand source for one ad request
//! using a waterfall or concurrent strategy.

pub mod adapter;
pub mod arbiter;
pub mod hedge;
pub mod pool;
pub mod selection;

pub use adapter::{AdapterCallout, AdapterRegistry, AuctionCallout, RequestMeta};
pub use arbiter::{MediationArbiter, MediationOutcome};
pub use hedge::{hedge_delay, run_hedged};
pub use pool::WorkerPools;
pub use selection::{adaptive_timeout, weighted_pick};
