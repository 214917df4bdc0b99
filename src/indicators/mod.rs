// =============================================================================
// Indicator suite — standard definitions, computed per symbol on 1m candles
// =============================================================================

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

pub use adx::{AdxResult, TrendDirection};
pub use bollinger::BollingerResult;
pub use macd::MacdResult;

// Standard periods used throughout the engine.
pub const EMA_FAST_PERIOD: usize = 9;
pub const EMA_SLOW_PERIOD: usize = 21;
pub const SMA_FAST_PERIOD: usize = 20;
pub const SMA_SLOW_PERIOD: usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const ADX_PERIOD: usize = 14;
pub const BB_PERIOD: usize = 20;
pub const BB_NUM_STD: f64 = 2.0;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

/// Full indicator snapshot for one symbol, derived from its 1m candle buffer.
/// Recomputed when the buffer advances; cached under a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub atr: f64,
    pub rsi: f64,
    pub macd: MacdResult,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub sma_fast: f64,
    pub sma_slow: f64,
    pub bb: BollingerResult,
    pub adx: AdxResult,
    /// Close of the latest closed candle the snapshot was derived from.
    pub last_close: f64,
    /// Open timestamp of that candle — the freshness basis.
    pub basis_ts_ms: i64,
}

impl IndicatorSnapshot {
    /// ATR relative to price — the volatility measure used by regime scoring,
    /// leverage selection, and the executor's market-order cutover.
    pub fn volatility_pct(&self) -> f64 {
        if self.last_close > 0.0 {
            self.atr / self.last_close * 100.0
        } else {
            0.0
        }
    }
}

/// Compute a full snapshot from closed 1m candles (oldest first).
///
/// Returns `None` until every component indicator has enough history; the
/// startup REST backfill makes that immediate in practice.
pub fn compute_snapshot(candles: &[Candle]) -> Option<IndicatorSnapshot> {
    let last = candles.last()?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let atr = atr::calculate_atr(candles, ATR_PERIOD)?;
    let rsi = *rsi::calculate_rsi(&closes, RSI_PERIOD).last()?;
    let macd = macd::calculate_macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL)?;
    let ema_fast = *ema::calculate_ema(&closes, EMA_FAST_PERIOD).last()?;
    let ema_slow = *ema::calculate_ema(&closes, EMA_SLOW_PERIOD).last()?;
    let sma_fast = ema::calculate_sma(&closes, SMA_FAST_PERIOD)?;
    let sma_slow = ema::calculate_sma(&closes, SMA_SLOW_PERIOD)?;
    let bb = bollinger::calculate_bollinger(&closes, BB_PERIOD, BB_NUM_STD)?;
    let adx = adx::calculate_adx(candles, ADX_PERIOD)?;

    Some(IndicatorSnapshot {
        atr,
        rsi,
        macd,
        ema_fast,
        ema_slow,
        sma_fast,
        sma_slow,
        bb,
        adx,
        last_close: last.close,
        basis_ts_ms: last.timestamp_ms,
    })
}
