//! Paper execution engine
//!
//! Deterministic fill simulation for market, limit, and stop-loss
//! orders: slippage and fees from injected randomness and config,
//! partial fills on the exchange step grid, SELL position validation,
//! an async latency dispatcher, and a periodic stop-loss scanner.

pub mod engine;
pub mod scheduler;
pub mod stop_scan;

pub use engine::{ExecutionEngine, OrderRequest};
pub use scheduler::{LatencyQueue, PendingProgress};
pub use stop_scan::StopScanner;
