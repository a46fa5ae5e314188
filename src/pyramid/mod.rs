//! KSS pyramid DCA sessions
//!
//! Wave-based dollar-cost averaging: each session lays a ladder of BUY
//! LIMIT waves at geometrically decreasing prices, progresses wave by
//! wave as fills come back, and exits the whole stack through a single
//! take-profit SELL once the average entry is far enough in profit.

pub mod config;
pub mod manager;

pub use config::{AdjustParams, SessionParams};
pub use manager::{PyramidManager, PyramidRef, RefKind, SessionSummary};
