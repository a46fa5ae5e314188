//! Price feed capability
//!
//! The core consumes two operations: a current mid price with bounded
//! staleness, and per-symbol lot metadata that is immutable for the
//! lifetime of a run. Feed failure is non-fatal - it degrades
//! mark-to-market and pauses stop scanning, but order queuing, approval,
//! and accepted-price execution continue.

use crate::common::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::PriceSourceConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::Symbol;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A quote and how old it is.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub price: Decimal,
    pub age: Duration,
}

/// Exchange lot-size metadata for a symbol.
#[derive(Debug, Clone)]
pub struct ExchangeInfo {
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub max_qty: Decimal,
    pub price_step: Decimal,
}

impl Default for ExchangeInfo {
    fn default() -> Self {
        ExchangeInfo {
            min_qty: dec!(0.00001),
            step_size: dec!(0.00001),
            max_qty: dec!(9000),
            price_step: dec!(0.01),
        }
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current mid price. May serve a cached value up to the configured
    /// freshness bound; never blocks past the fetch timeout.
    async fn current_price(&self, symbol: &Symbol) -> CoreResult<PriceQuote>;

    /// Lot metadata; effectively immutable per run.
    async fn exchange_info(&self, symbol: &Symbol) -> CoreResult<ExchangeInfo>;
}

// =============================================================================
// Static source (tests, offline runs)
// =============================================================================

/// Fixed in-memory source. Prices are set by the test or operator;
/// a symbol with no price behaves like a dead feed.
#[derive(Debug, Default)]
pub struct StaticPriceSource {
    prices: Mutex<HashMap<Symbol, Decimal>>,
    info: Mutex<HashMap<Symbol, ExchangeInfo>>,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        self.prices.lock().unwrap().insert(symbol.clone(), price);
    }

    /// Remove the symbol's price, simulating feed loss.
    pub fn clear_price(&self, symbol: &Symbol) {
        self.prices.lock().unwrap().remove(symbol);
    }

    pub fn set_exchange_info(&self, symbol: &Symbol, info: ExchangeInfo) {
        self.info.lock().unwrap().insert(symbol.clone(), info);
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn current_price(&self, symbol: &Symbol) -> CoreResult<PriceQuote> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .map(|price| PriceQuote {
                price: *price,
                age: Duration::ZERO,
            })
            .ok_or_else(|| CoreError::PriceSourceUnavailable(format!("no price for {symbol}")))
    }

    async fn exchange_info(&self, symbol: &Symbol) -> CoreResult<ExchangeInfo> {
        Ok(self
            .info
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// Caching / fault-isolation wrapper
// =============================================================================

struct CachedQuote {
    price: Decimal,
    fetched_at: Instant,
}

/// Wraps an upstream source with a freshness-bounded cache, a fetch
/// timeout, and a circuit breaker. Stop scans hit this on every tick, so
/// a dead upstream has to fail fast rather than stack 2-second timeouts.
pub struct CachedPriceSource<S> {
    inner: S,
    ttl: Duration,
    fetch_timeout: Duration,
    quotes: Mutex<HashMap<Symbol, CachedQuote>>,
    info: Mutex<HashMap<Symbol, ExchangeInfo>>,
    breaker: Mutex<CircuitBreaker>,
}

impl<S: PriceSource> CachedPriceSource<S> {
    pub fn new(inner: S, config: &PriceSourceConfig) -> Self {
        Self {
            inner,
            ttl: Duration::from_secs(config.price_cache_ttl_s),
            fetch_timeout: Duration::from_millis(config.price_fetch_timeout_ms),
            quotes: Mutex::new(HashMap::new()),
            info: Mutex::new(HashMap::new()),
            breaker: Mutex::new(CircuitBreaker::new(
                CircuitBreakerConfig::default().with_cooldown(Duration::from_secs(10)),
            )),
        }
    }

    fn cached_within_ttl(&self, symbol: &Symbol) -> Option<PriceQuote> {
        let quotes = self.quotes.lock().unwrap();
        quotes.get(symbol).and_then(|q| {
            let age = q.fetched_at.elapsed();
            (age <= self.ttl).then_some(PriceQuote {
                price: q.price,
                age,
            })
        })
    }
}

#[async_trait]
impl<S: PriceSource> PriceSource for CachedPriceSource<S> {
    async fn current_price(&self, symbol: &Symbol) -> CoreResult<PriceQuote> {
        if !self.breaker.lock().unwrap().can_attempt() {
            // Circuit open: a recent cached quote is still acceptable.
            return self.cached_within_ttl(symbol).ok_or_else(|| {
                CoreError::PriceSourceUnavailable("feed circuit open".to_string())
            });
        }

        let fetched =
            tokio::time::timeout(self.fetch_timeout, self.inner.current_price(symbol)).await;

        match fetched {
            Ok(Ok(quote)) => {
                self.breaker.lock().unwrap().record_success();
                self.quotes.lock().unwrap().insert(
                    symbol.clone(),
                    CachedQuote {
                        price: quote.price,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(PriceQuote {
                    price: quote.price,
                    age: Duration::ZERO,
                })
            }
            Ok(Err(err)) => {
                self.breaker.lock().unwrap().record_failure();
                debug!("price fetch failed for {symbol}: {err}");
                self.cached_within_ttl(symbol).ok_or(err)
            }
            Err(_) => {
                self.breaker.lock().unwrap().record_failure();
                warn!(
                    "price fetch for {symbol} exceeded {}ms",
                    self.fetch_timeout.as_millis()
                );
                self.cached_within_ttl(symbol).ok_or_else(|| {
                    CoreError::PriceSourceUnavailable(format!("fetch timeout for {symbol}"))
                })
            }
        }
    }

    async fn exchange_info(&self, symbol: &Symbol) -> CoreResult<ExchangeInfo> {
        if let Some(info) = self.info.lock().unwrap().get(symbol) {
            return Ok(info.clone());
        }
        let info = self.inner.exchange_info(symbol).await?;
        self.info
            .lock()
            .unwrap()
            .insert(symbol.clone(), info.clone());
        Ok(info)
    }
}

// =============================================================================
// Binance-style live feed
// =============================================================================

const BINANCE_API_BASE: &str = "https://api.binance.com/api/v3";

#[derive(Debug, Deserialize)]
struct BookTicker {
    #[serde(rename = "bidPrice")]
    bid_price: Decimal,
    #[serde(rename = "askPrice")]
    ask_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum SymbolFilter {
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "minQty")]
        min_qty: Decimal,
        #[serde(rename = "maxQty")]
        max_qty: Decimal,
        #[serde(rename = "stepSize")]
        step_size: Decimal,
    },
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter {
        #[serde(rename = "tickSize")]
        tick_size: Decimal,
    },
    #[serde(other)]
    Other,
}

/// Public-market-data client; no API key required.
#[derive(Debug, Clone)]
pub struct BinancePriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl BinancePriceSource {
    pub fn new(config: &PriceSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.price_fetch_timeout_ms))
            .build()
            .expect("Failed to create HTTP client");
        BinancePriceSource {
            client,
            base_url: BINANCE_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl PriceSource for BinancePriceSource {
    async fn current_price(&self, symbol: &Symbol) -> CoreResult<PriceQuote> {
        let url = format!("{}/ticker/bookTicker", self.base_url);
        let ticker: BookTicker = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| CoreError::PriceSourceUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::PriceSourceUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::PriceSourceUnavailable(e.to_string()))?;

        let mid = (ticker.bid_price + ticker.ask_price) / Decimal::TWO;
        Ok(PriceQuote {
            price: mid,
            age: Duration::ZERO,
        })
    }

    async fn exchange_info(&self, symbol: &Symbol) -> CoreResult<ExchangeInfo> {
        let url = format!("{}/exchangeInfo", self.base_url);
        let response: ExchangeInfoResponse = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| CoreError::PriceSourceUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::PriceSourceUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| CoreError::PriceSourceUnavailable(e.to_string()))?;

        let mut info = ExchangeInfo::default();
        for filter in response
            .symbols
            .into_iter()
            .next()
            .map(|s| s.filters)
            .unwrap_or_default()
        {
            match filter {
                SymbolFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    info.min_qty = min_qty;
                    info.max_qty = max_qty;
                    info.step_size = step_size;
                }
                SymbolFilter::PriceFilter { tick_size } => {
                    info.price_step = tick_size;
                }
                SymbolFilter::Other => {}
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_round_trip() {
        let source = StaticPriceSource::new();
        let symbol = Symbol::new("BTCUSDT");
        source.set_price(&symbol, dec!(50000));

        let quote = source.current_price(&symbol).await.unwrap();
        assert_eq!(quote.price, dec!(50000));
        assert_eq!(quote.age, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_static_source_missing_symbol_is_unavailable() {
        let source = StaticPriceSource::new();
        let err = source
            .current_price(&Symbol::new("NOPE"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PriceSourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_cached_source_serves_stale_on_upstream_loss() {
        let inner = StaticPriceSource::new();
        let symbol = Symbol::new("BTCUSDT");
        inner.set_price(&symbol, dec!(42000));

        let cached = CachedPriceSource::new(inner, &PriceSourceConfig::default());
        assert_eq!(
            cached.current_price(&symbol).await.unwrap().price,
            dec!(42000)
        );

        // Upstream dies; the cached quote is inside the TTL and keeps
        // serving.
        cached.inner.clear_price(&symbol);
        let quote = cached.current_price(&symbol).await.unwrap();
        assert_eq!(quote.price, dec!(42000));
    }

    #[tokio::test]
    async fn test_cached_source_unavailable_without_history() {
        let inner = StaticPriceSource::new();
        let cached = CachedPriceSource::new(inner, &PriceSourceConfig::default());
        let err = cached
            .current_price(&Symbol::new("BTCUSDT"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PriceSourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_exchange_info_cached_per_run() {
        let inner = StaticPriceSource::new();
        let symbol = Symbol::new("BTCUSDT");
        inner.set_exchange_info(
            &symbol,
            ExchangeInfo {
                min_qty: dec!(0.001),
                ..ExchangeInfo::default()
            },
        );
        let cached = CachedPriceSource::new(inner, &PriceSourceConfig::default());
        assert_eq!(
            cached.exchange_info(&symbol).await.unwrap().min_qty,
            dec!(0.001)
        );

        // Mutating upstream after first read is invisible: info is pinned.
        cached.inner.set_exchange_info(
            &symbol,
            ExchangeInfo {
                min_qty: dec!(0.5),
                ..ExchangeInfo::default()
            },
        );
        assert_eq!(
            cached.exchange_info(&symbol).await.unwrap().min_qty,
            dec!(0.001)
        );
    }
}
