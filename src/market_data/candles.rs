// =============================================================================
// Candle store — per-(symbol, timeframe) ring buffers
// =============================================================================
//
// The live (unclosed) candle is continuously updated in-place; when a candle
// closes it becomes permanent and the ring is trimmed to the timeframe's
// capacity. Buffers are seeded from REST at startup and then maintained by
// the WebSocket candle channels.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

/// A single OHLCV candle. `timestamp_ms` is the bar open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in contracts.
    pub volume: f64,
    /// Volume in quote currency.
    pub quote_volume: f64,
    pub is_closed: bool,
}

impl Candle {
    pub fn new(
        timestamp_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        quote_volume: f64,
        is_closed: bool,
    ) -> Self {
        Self {
            timestamp_ms,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
            is_closed,
        }
    }
}

/// Composite key identifying a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer of recent candles per (symbol, timeframe).
/// Capacity is fixed per timeframe (1m: 500, 5m: 300, 1H: 168, 1D: 20).
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
}

impl CandleBuffer {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// An incoming candle with the same open time as the current in-progress
    /// tail replaces it (live update or finalisation); otherwise it is
    /// appended. Closed candles trim the ring to the timeframe capacity.
    pub fn upsert(&self, key: CandleKey, candle: Candle) {
        let capacity = key.timeframe.capacity();
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(capacity + 1));

        if let Some(last) = ring.back() {
            if !last.is_closed && last.timestamp_ms == candle.timestamp_ms {
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        while ring.len() > capacity + 1 {
            ring.pop_front();
        }
    }

    /// Bulk-seed a series from a REST backfill (oldest first). Existing
    /// content for the key is replaced.
    pub fn seed(&self, key: CandleKey, candles: Vec<Candle>) {
        let capacity = key.timeframe.capacity();
        let mut ring: VecDeque<Candle> = candles.into();
        while ring.len() > capacity + 1 {
            ring.pop_front();
        }
        self.buffers.write().insert(key, ring);
    }

    /// Most recent `count` **closed** candles, oldest first.
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Most recent `count` candles, oldest first; the last may be open.
    pub fn get_recent(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close prices of the most recent `count` closed candles, oldest first.
    pub fn get_closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.get_closed(key, count).iter().map(|c| c.close).collect()
    }

    /// The most recent closed candle, if any.
    pub fn last_closed(&self, key: &CandleKey) -> Option<Candle> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).cloned())
    }

    /// Open timestamp of the most recent closed candle. Used as the
    /// invalidation basis for cached indicator snapshots.
    pub fn last_closed_ts(&self, key: &CandleKey) -> Option<i64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| {
            ring.iter()
                .rev()
                .find(|c| c.is_closed)
                .map(|c| c.timestamp_ms)
        })
    }

    /// Number of closed candles stored for a key.
    pub fn closed_count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key)
            .map_or(0, |ring| ring.iter().filter(|c| c.is_closed).count())
    }
}

impl Default for CandleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, close: f64, is_closed: bool) -> Candle {
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0, 1000.0, is_closed)
    }

    fn key(symbol: &str, tf: Timeframe) -> CandleKey {
        CandleKey::new(symbol, tf)
    }

    #[test]
    fn ring_trims_to_timeframe_capacity() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT-SWAP", Timeframe::D1); // capacity 20

        for i in 0..30 {
            buf.upsert(k.clone(), sample(i * 86_400_000, 100.0 + i as f64, true));
        }

        assert_eq!(buf.closed_count(&k), 21);
        let closes = buf.get_closes(&k, 100);
        assert_eq!(closes.last().copied(), Some(129.0));
    }

    #[test]
    fn live_candle_replaced_in_place() {
        let buf = CandleBuffer::new();
        let k = key("ETH-USDT-SWAP", Timeframe::M1);

        buf.upsert(k.clone(), sample(0, 50.0, false));
        buf.upsert(k.clone(), sample(0, 51.0, false));
        assert_eq!(buf.get_recent(&k, 10).len(), 1);

        // Finalise, then a new live candle starts.
        buf.upsert(k.clone(), sample(0, 52.0, true));
        buf.upsert(k.clone(), sample(60_000, 53.0, false));

        assert_eq!(buf.closed_count(&k), 1);
        assert_eq!(buf.last_closed(&k).unwrap().close, 52.0);
        assert_eq!(buf.get_recent(&k, 10).len(), 2);
    }

    #[test]
    fn get_closed_excludes_live_candle() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT-SWAP", Timeframe::M1);

        buf.upsert(k.clone(), sample(0, 100.0, true));
        buf.upsert(k.clone(), sample(60_000, 101.0, true));
        buf.upsert(k.clone(), sample(120_000, 102.0, false));

        assert_eq!(buf.get_closed(&k, 10).len(), 2);
        assert_eq!(buf.get_recent(&k, 10).len(), 3);
    }

    #[test]
    fn seed_replaces_existing() {
        let buf = CandleBuffer::new();
        let k = key("BTC-USDT-SWAP", Timeframe::M5);

        buf.upsert(k.clone(), sample(0, 1.0, true));
        buf.seed(
            k.clone(),
            (0..5).map(|i| sample(i * 300_000, 10.0 + i as f64, true)).collect(),
        );

        let closes = buf.get_closes(&k, 100);
        assert_eq!(closes, vec![10.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn last_closed_ts_tracks_finalised_bar() {
        let buf = CandleBuffer::new();
        let k = key("SOL-USDT-SWAP", Timeframe::M1);
        assert_eq!(buf.last_closed_ts(&k), None);

        buf.upsert(k.clone(), sample(60_000, 10.0, true));
        buf.upsert(k.clone(), sample(120_000, 11.0, false));
        assert_eq!(buf.last_closed_ts(&k), Some(60_000));
    }
}
