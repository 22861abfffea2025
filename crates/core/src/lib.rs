pub mod auction;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use auction::{
    AuctionRequest, AuctionResult, ConsentSnapshot, CurrencyRates, RequestContext, WinningBid,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use error::{MediationError, MediationResult};
pub use types::{AdFormat, AdapterConfig, AdapterFamily, AttemptOutcome, PassContext, Source, SourceConfig, Strategy};
