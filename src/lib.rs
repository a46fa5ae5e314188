//! Paper-Trading Execution Platform
//!
//! Order intents from spreadsheets, strategies, or the pyramid DCA
//! manager flow through a mandatory human-approval queue with pre-trade
//! risk annotation, execute against a deterministic fill simulator, and
//! land as append-only facts in the SOT store. A derived Trade Service
//! aggregates fills into trades, positions, and PnL, and is rebuildable
//! from the facts at any time.

pub mod clock;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod exec;
pub mod intake;
pub mod money;
pub mod pending;
pub mod price_source;
pub mod pyramid;
pub mod risk;
pub mod store;
pub mod types;

pub use clock::{Clock, OsRandom, RandomSource, SeededRng, SimClock, SystemClock};
pub use config::CoreConfig;
pub use coordinator::Coordinator;
pub use error::{CoreError, CoreResult};
pub use events::{BroadcastEvent, FillEvent, PendingResolution};
pub use exec::{ExecutionEngine, OrderRequest, StopScanner};
pub use pending::PendingQueue;
pub use price_source::{
    BinancePriceSource, CachedPriceSource, ExchangeInfo, PriceQuote, PriceSource,
    StaticPriceSource,
};
pub use pyramid::{PyramidManager, SessionParams};
pub use risk::{RiskEngine, RiskView};
pub use store::{OrderIntent, SotStore, TsStore};
pub use types::*;
