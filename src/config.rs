//! Configuration management
//!
//! JSON config file with per-section defaults. Constructed once at
//! startup and threaded explicitly through the components; there is no
//! module-level mutable state.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub pyramid: PyramidConfig,
    #[serde(default)]
    pub price_source: PriceSourceConfig,
}

impl CoreConfig {
    /// Load configuration from a JSON file, with environment overrides
    /// for the store paths.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: CoreConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("SOT_DB_PATH") {
            self.store.sot_db_path = path;
        }
        if let Ok(path) = std::env::var("TS_DB_PATH") {
            self.store.ts_db_path = path;
        }
    }
}

/// Store locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sot_db_path: String,
    pub ts_db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            sot_db_path: "data/sot.db".to_string(),
            ts_db_path: "data/ts.db".to_string(),
        }
    }
}

/// Pre-trade risk parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Account equity used as the denominator of the exposure checks.
    pub equity: Decimal,
    /// Pip sizing: one pip = pip_multiplier x exchange min_qty.
    pub pip_multiplier: Decimal,
    /// Max exposure on a single symbol, percent of equity.
    pub max_position_size_pct: Decimal,
    /// Max realized loss per UTC day, percent of equity.
    pub max_daily_loss_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            equity: dec!(100000),
            pip_multiplier: dec!(2.0),
            max_position_size_pct: dec!(10.0),
            max_daily_loss_pct: dec!(5.0),
        }
    }
}

/// Paper execution parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Fraction of remaining quantity filled per execution, in (0, 1].
    pub default_fill_pct: Decimal,
    /// Upper bound of the uniform slippage draw, percent of price.
    pub default_slippage_pct: f64,
    pub default_maker_fee: Decimal,
    pub default_taker_fee: Decimal,
    /// Base simulated latency; zero executes inline.
    pub default_latency_ms: u64,
    /// Upper bound of the uniform latency jitter draw.
    pub random_latency_ms: u64,
    pub stop_scan_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            default_fill_pct: dec!(1.0),
            default_slippage_pct: 0.0,
            default_maker_fee: dec!(0),
            default_taker_fee: dec!(0),
            default_latency_ms: 0,
            random_latency_ms: 0,
            stop_scan_interval_ms: 1000,
        }
    }
}

/// Pyramid session manager parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidConfig {
    /// Timer driving timeout checks and deferred wave enqueues.
    pub pyramid_timer_interval_ms: u64,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        PyramidConfig {
            pyramid_timer_interval_ms: 10_000,
        }
    }
}

/// Price feed parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSourceConfig {
    /// A cached quote older than this is treated as unavailable.
    pub price_cache_ttl_s: u64,
    /// Hard bound on a single upstream fetch.
    pub price_fetch_timeout_ms: u64,
}

impl Default for PriceSourceConfig {
    fn default() -> Self {
        PriceSourceConfig {
            price_cache_ttl_s: 60,
            price_fetch_timeout_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.risk.pip_multiplier, dec!(2.0));
        assert_eq!(config.risk.max_position_size_pct, dec!(10.0));
        assert_eq!(config.risk.max_daily_loss_pct, dec!(5.0));
        assert_eq!(config.execution.default_fill_pct, dec!(1.0));
        assert_eq!(config.execution.default_latency_ms, 0);
        assert_eq!(config.execution.stop_scan_interval_ms, 1000);
        assert_eq!(config.pyramid.pyramid_timer_interval_ms, 10_000);
        assert_eq!(config.price_source.price_cache_ttl_s, 60);
        assert_eq!(config.price_source.price_fetch_timeout_ms, 2000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"risk": {"equity": "50000", "pip_multiplier": "3.0", "max_position_size_pct": "20.0", "max_daily_loss_pct": "5.0"}}"#)
                .unwrap();
        assert_eq!(config.risk.equity, dec!(50000));
        assert_eq!(config.risk.pip_multiplier, dec!(3.0));
        // Untouched sections come from Default.
        assert_eq!(config.execution.stop_scan_interval_ms, 1000);
    }
}
