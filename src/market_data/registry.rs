// =============================================================================
// Market Data Registry — single source of truth for live prices
// =============================================================================
//
// Serves prices, candles, orderbook top, and indicator snapshots under
// explicit freshness contracts. Every price request names its purpose; the
// purpose selects the TTL (orders 1 s, exit_analysis 2 s, signals 3 s,
// general 5 s).
//
// Fallback chain for get_price:
//   1. WebSocket last tick, if fresh.
//   2. Close of the last closed 1m candle, if fresh.
//   3. REST ticker (1 s response cache; counted as a degradation event).
//   4. StaleData error — the caller decides whether to skip or anchor on
//      entry price.
//
// Sustained REST fallbacks (> REST_FALLBACK_LIMIT within the window) raise a
// reconnect request that the WebSocket supervisor consumes.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::gateway::client::OkxClient;
use crate::indicators::{self, IndicatorSnapshot};
use crate::market_data::{Candle, CandleBuffer, CandleKey, OrderBookManager};
use crate::types::{PricePurpose, Tick, Timeframe};

/// REST ticker responses are reused for this long. The only acceptable
/// REST-spam mitigation.
const REST_CACHE_TTL: Duration = Duration::from_millis(1_000);

/// Cached indicator snapshots stay valid this long (fast tier).
const SNAPSHOT_TTL: Duration = Duration::from_secs(10);

/// Cached funding rates stay valid this long (slow tier, API-derived).
const FUNDING_TTL: Duration = Duration::from_secs(30);

/// REST fallbacks within [`REST_FALLBACK_WINDOW`] that trigger a reconnect
/// request to the WebSocket supervisor.
const REST_FALLBACK_LIMIT: usize = 10;
const REST_FALLBACK_WINDOW: Duration = Duration::from_secs(60);

/// How many 1m candles feed a snapshot recomputation.
const SNAPSHOT_LOOKBACK: usize = 200;

/// Where a served price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Tick,
    Candle,
    Rest,
}

/// A price together with its age and provenance.
#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub price: f64,
    pub age_ms: u64,
    pub source: PriceSource,
}

struct TickEntry {
    tick: Tick,
    received: Instant,
}

struct RestEntry {
    price: f64,
    fetched: Instant,
}

struct SnapshotEntry {
    snapshot: IndicatorSnapshot,
    computed: Instant,
}

struct FundingEntry {
    rate: f64,
    fetched: Instant,
}

pub struct MarketDataRegistry {
    pub candles: CandleBuffer,
    pub books: OrderBookManager,
    ticks: RwLock<HashMap<String, TickEntry>>,
    rest_cache: RwLock<HashMap<String, RestEntry>>,
    snapshots: RwLock<HashMap<String, SnapshotEntry>>,
    funding: RwLock<HashMap<String, FundingEntry>>,
    /// 24h quote volume per symbol, from the tickers channel.
    day_volume: RwLock<HashMap<String, f64>>,
    rest_fallbacks: RwLock<VecDeque<Instant>>,
    reconnect_requested: AtomicBool,
}

impl MarketDataRegistry {
    pub fn new() -> Self {
        Self {
            candles: CandleBuffer::new(),
            books: OrderBookManager::new(),
            ticks: RwLock::new(HashMap::new()),
            rest_cache: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            funding: RwLock::new(HashMap::new()),
            day_volume: RwLock::new(HashMap::new()),
            rest_fallbacks: RwLock::new(VecDeque::new()),
            reconnect_requested: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // WebSocket-side writers
    // -------------------------------------------------------------------------

    pub fn upsert_tick(&self, symbol: &str, tick: Tick) {
        self.ticks.write().insert(
            symbol.to_string(),
            TickEntry {
                tick,
                received: Instant::now(),
            },
        );
    }

    /// Called by the WebSocket candle channel. A closed 1m candle invalidates
    /// the symbol's cached indicator snapshot.
    pub fn upsert_candle(&self, key: CandleKey, candle: Candle) {
        let invalidate = candle.is_closed && key.timeframe == Timeframe::M1;
        let symbol = key.symbol.clone();
        self.candles.upsert(key, candle);
        if invalidate {
            self.snapshots.write().remove(&symbol);
        }
    }

    pub fn set_day_volume(&self, symbol: &str, quote_volume_24h: f64) {
        self.day_volume
            .write()
            .insert(symbol.to_string(), quote_volume_24h);
    }

    pub fn day_volume(&self, symbol: &str) -> Option<f64> {
        self.day_volume.read().get(symbol).copied()
    }

    // -------------------------------------------------------------------------
    // get_price — tiered freshness
    // -------------------------------------------------------------------------

    /// Cache-only price lookup: tick, then last closed 1m candle, then the
    /// 1 s REST response cache. Never touches the network.
    pub fn get_price_cached(&self, symbol: &str, purpose: PricePurpose) -> Result<PriceSample> {
        let ttl_ms = purpose.ttl_ms();
        let mut freshest_age = u64::MAX;

        // 1. WebSocket tick.
        if let Some(entry) = self.ticks.read().get(symbol) {
            let age_ms = entry.received.elapsed().as_millis() as u64;
            freshest_age = freshest_age.min(age_ms);
            if age_ms <= ttl_ms && entry.tick.last > 0.0 {
                return Ok(PriceSample {
                    price: entry.tick.last,
                    age_ms,
                    source: PriceSource::Tick,
                });
            }
        }

        // 2. Last closed 1m candle.
        let key = CandleKey::new(symbol, Timeframe::M1);
        if let Some(candle) = self.candles.last_closed(&key) {
            let close_time = candle.timestamp_ms + Timeframe::M1.duration_ms();
            let age_ms = (chrono::Utc::now().timestamp_millis() - close_time).max(0) as u64;
            freshest_age = freshest_age.min(age_ms);
            if age_ms <= ttl_ms && candle.close > 0.0 {
                return Ok(PriceSample {
                    price: candle.close,
                    age_ms,
                    source: PriceSource::Candle,
                });
            }
        }

        // 3. Cached REST ticker.
        if let Some(entry) = self.rest_cache.read().get(symbol) {
            let age = entry.fetched.elapsed();
            freshest_age = freshest_age.min(age.as_millis() as u64);
            if age <= REST_CACHE_TTL && entry.price > 0.0 {
                return Ok(PriceSample {
                    price: entry.price,
                    age_ms: age.as_millis() as u64,
                    source: PriceSource::Rest,
                });
            }
        }

        Err(EngineError::StaleData {
            symbol: symbol.to_string(),
            age_ms: if freshest_age == u64::MAX { 0 } else { freshest_age },
            ttl_ms,
        })
    }

    /// Full fallback chain: cached tiers, then a live REST ticker call.
    /// REST use is counted; sustained degradation requests a WS reconnect.
    pub async fn get_price(
        &self,
        client: &OkxClient,
        symbol: &str,
        purpose: PricePurpose,
    ) -> Result<PriceSample> {
        match self.get_price_cached(symbol, purpose) {
            Ok(sample) => Ok(sample),
            Err(stale) => {
                self.record_rest_fallback();
                match client.get_ticker(symbol).await {
                    Ok(ticker) if ticker.last > 0.0 => {
                        self.rest_cache.write().insert(
                            symbol.to_string(),
                            RestEntry {
                                price: ticker.last,
                                fetched: Instant::now(),
                            },
                        );
                        debug!(symbol, price = ticker.last, purpose = %purpose, "price served from REST fallback");
                        Ok(PriceSample {
                            price: ticker.last,
                            age_ms: 0,
                            source: PriceSource::Rest,
                        })
                    }
                    Ok(_) => Err(stale),
                    Err(e) => {
                        warn!(symbol, error = %e, "REST price fallback failed");
                        Err(stale)
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Indicators
    // -------------------------------------------------------------------------

    /// Indicator snapshot for a symbol, recomputed when the 1m buffer has
    /// advanced past the cached basis or the cache aged out.
    pub fn get_indicators(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        let key = CandleKey::new(symbol, Timeframe::M1);
        let basis = self.candles.last_closed_ts(&key)?;

        {
            let cache = self.snapshots.read();
            if let Some(entry) = cache.get(symbol) {
                if entry.snapshot.basis_ts_ms == basis && entry.computed.elapsed() <= SNAPSHOT_TTL {
                    return Some(entry.snapshot.clone());
                }
            }
        }

        let candles = self.candles.get_closed(&key, SNAPSHOT_LOOKBACK);
        let snapshot = indicators::compute_snapshot(&candles)?;

        self.snapshots.write().insert(
            symbol.to_string(),
            SnapshotEntry {
                snapshot: snapshot.clone(),
                computed: Instant::now(),
            },
        );

        Some(snapshot)
    }

    // -------------------------------------------------------------------------
    // Funding rate cache (slow tier)
    // -------------------------------------------------------------------------

    pub fn funding_rate(&self, symbol: &str) -> Option<f64> {
        let cache = self.funding.read();
        cache.get(symbol).and_then(|entry| {
            if entry.fetched.elapsed() <= FUNDING_TTL {
                Some(entry.rate)
            } else {
                None
            }
        })
    }

    pub fn store_funding_rate(&self, symbol: &str, rate: f64) {
        self.funding.write().insert(
            symbol.to_string(),
            FundingEntry {
                rate,
                fetched: Instant::now(),
            },
        );
    }

    // -------------------------------------------------------------------------
    // Degradation tracking
    // -------------------------------------------------------------------------

    fn record_rest_fallback(&self) {
        let now = Instant::now();
        let mut window = self.rest_fallbacks.write();
        window.push_back(now);
        while let Some(front) = window.front() {
            if now.duration_since(*front) > REST_FALLBACK_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() > REST_FALLBACK_LIMIT {
            if !self.reconnect_requested.swap(true, Ordering::SeqCst) {
                warn!(
                    fallbacks = window.len(),
                    window_secs = REST_FALLBACK_WINDOW.as_secs(),
                    "sustained REST fallback — requesting WebSocket reconnect"
                );
            }
        }
    }

    /// Consume a pending reconnect request, if any. Called by the WebSocket
    /// supervisor; consuming resets the flag so reconnects stay idempotent.
    pub fn take_reconnect_request(&self) -> bool {
        self.reconnect_requested.swap(false, Ordering::SeqCst)
    }
}

impl Default for MarketDataRegistry {
    fn default() -> Self {
        Self::new()
    }
}
