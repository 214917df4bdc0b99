// =============================================================================
// Market Regime Classifier — weighted three-way scoring
// =============================================================================
//
// On each 1m candle close, every symbol is scored for all three regimes:
//
//   trending: up to 0.3 each from |trend_deviation| > strength_pct,
//             ADX >= trending_adx, and DI gap > di_gap_min.
//   ranging:  up to 0.4 from a narrow 20-bar range, up to 0.3 from a small
//             |trend_deviation|, up to 0.3 from ADX < ranging_adx.
//   choppy:   up to 0.4 from high volatility (ATR/price), up to 0.3 from many
//             close-to-close reversals in the last 20 bars, up to 0.3 from an
//             abnormal volume ratio.
//
// Regime = argmax; confidence = max score. A tie keeps the previous regime —
// hysteresis prevents flapping at the score boundary.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::{IndicatorSnapshot, TrendDirection};
use crate::market_data::Candle;
use crate::regime::Regime;
use crate::types::Side;

/// Bars examined for range width, reversal counting, and volume baseline.
const LOOKBACK_BARS: usize = 20;

/// Tunable classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    /// |trend_deviation| (%) above which price counts as trending away.
    pub strength_pct: f64,
    /// ADX at or above which the trending score earns its ADX component.
    pub trending_adx: f64,
    /// ADX below which the ranging score earns its ADX component.
    pub ranging_adx: f64,
    /// ADX at or above which the counter-trend block engages.
    pub strong_adx: f64,
    /// DI gap above which direction conviction is assumed.
    pub di_gap_min: f64,
    /// 20-bar range (% of price) below which the market counts as narrow.
    pub narrow_range_pct: f64,
    /// |trend_deviation| (%) below which price hugs its long mean.
    pub small_deviation_pct: f64,
    /// ATR/price (%) above which volatility counts as high.
    pub high_volatility_pct: f64,
    /// Reversals in the last 20 bars that count as many.
    pub reversal_min: usize,
    /// Volume ratio bounds outside of which volume is abnormal.
    pub volume_ratio_hi: f64,
    pub volume_ratio_lo: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            strength_pct: 0.5,
            trending_adx: 25.0,
            ranging_adx: 20.0,
            strong_adx: 25.0,
            di_gap_min: 3.0,
            narrow_range_pct: 1.0,
            small_deviation_pct: 0.2,
            high_volatility_pct: 0.8,
            reversal_min: 8,
            volume_ratio_hi: 2.0,
            volume_ratio_lo: 0.3,
        }
    }
}

/// Snapshot of a symbol's classified regime plus the contributing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    /// Winning score, in [0, 1].
    pub confidence: f64,
    pub trending_score: f64,
    pub ranging_score: f64,
    pub choppy_score: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub adx_trend: TrendDirection,
    /// ATR / price, percent.
    pub volatility_pct: f64,
    /// (price - SMA_long) / SMA_long, percent.
    pub trend_deviation_pct: f64,
}

impl RegimeState {
    /// Counter-trend block: in a strongly trending market, signals opposing
    /// the ADX trend direction are discarded.
    pub fn blocks_counter_trend(&self, side: Side, strong_adx: f64) -> bool {
        if self.regime != Regime::Trending || self.adx < strong_adx {
            return false;
        }
        match self.adx_trend {
            TrendDirection::Bullish => side == Side::Short,
            TrendDirection::Bearish => side == Side::Long,
            TrendDirection::Neutral => false,
        }
    }
}

// =============================================================================
// RegimeClassifier
// =============================================================================

/// Thread-safe classifier that caches the latest state per symbol.
pub struct RegimeClassifier {
    thresholds: RegimeThresholds,
    states: RwLock<HashMap<String, RegimeState>>,
}

impl RegimeClassifier {
    pub fn new(thresholds: RegimeThresholds) -> Self {
        Self {
            thresholds,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &RegimeThresholds {
        &self.thresholds
    }

    /// Classify a symbol from its recent 1m candles and indicator snapshot,
    /// caching and returning the new state.
    pub fn classify(
        &self,
        symbol: &str,
        candles: &[Candle],
        snapshot: &IndicatorSnapshot,
    ) -> RegimeState {
        let previous = self.states.read().get(symbol).map(|s| s.regime);
        let state = self.score(candles, snapshot, previous);

        debug!(
            symbol,
            regime = %state.regime,
            confidence = format!("{:.2}", state.confidence),
            trending = format!("{:.2}", state.trending_score),
            ranging = format!("{:.2}", state.ranging_score),
            choppy = format!("{:.2}", state.choppy_score),
            adx = format!("{:.1}", state.adx),
            "regime classified"
        );

        self.states
            .write()
            .insert(symbol.to_string(), state.clone());
        state
    }

    /// Latest cached state without recomputing.
    pub fn current(&self, symbol: &str) -> Option<RegimeState> {
        self.states.read().get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    fn score(
        &self,
        candles: &[Candle],
        snapshot: &IndicatorSnapshot,
        previous: Option<Regime>,
    ) -> RegimeState {
        let t = &self.thresholds;
        let price = snapshot.last_close;

        let volatility_pct = snapshot.volatility_pct();

        let trend_deviation_pct = if snapshot.sma_slow > 0.0 {
            (price - snapshot.sma_slow) / snapshot.sma_slow * 100.0
        } else {
            0.0
        };

        let di_gap = snapshot.adx.di_gap();
        let range_width_pct = range_width_pct(candles, price);
        let reversals = reversal_count(candles);
        let volume_ratio = volume_ratio(candles);

        // --- trending -----------------------------------------------------
        let mut trending_score: f64 = 0.0;
        if trend_deviation_pct.abs() > t.strength_pct {
            trending_score += 0.3;
        }
        if snapshot.adx.adx >= t.trending_adx {
            trending_score += 0.3;
        }
        if di_gap > t.di_gap_min {
            trending_score += 0.3;
        }

        // --- ranging ------------------------------------------------------
        let mut ranging_score: f64 = 0.0;
        if range_width_pct < t.narrow_range_pct {
            ranging_score += 0.4;
        }
        if trend_deviation_pct.abs() < t.small_deviation_pct {
            ranging_score += 0.3;
        }
        if snapshot.adx.adx < t.ranging_adx {
            ranging_score += 0.3;
        }

        // --- choppy -------------------------------------------------------
        let mut choppy_score: f64 = 0.0;
        if volatility_pct > t.high_volatility_pct {
            choppy_score += 0.4;
        }
        if reversals >= t.reversal_min {
            choppy_score += 0.3;
        }
        if volume_ratio > t.volume_ratio_hi || volume_ratio < t.volume_ratio_lo {
            choppy_score += 0.3;
        }

        trending_score = trending_score.clamp(0.0, 1.0);
        ranging_score = ranging_score.clamp(0.0, 1.0);
        choppy_score = choppy_score.clamp(0.0, 1.0);

        let (regime, confidence) = argmax_with_hysteresis(
            trending_score,
            ranging_score,
            choppy_score,
            previous,
        );

        RegimeState {
            regime,
            confidence,
            trending_score,
            ranging_score,
            choppy_score,
            adx: snapshot.adx.adx,
            plus_di: snapshot.adx.plus_di,
            minus_di: snapshot.adx.minus_di,
            adx_trend: snapshot.adx.trend,
            volatility_pct,
            trend_deviation_pct,
        }
    }
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new(RegimeThresholds::default())
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Pick the regime with the highest score. On a tie the previous regime wins
/// when it is among the leaders.
fn argmax_with_hysteresis(
    trending: f64,
    ranging: f64,
    choppy: f64,
    previous: Option<Regime>,
) -> (Regime, f64) {
    let max = trending.max(ranging).max(choppy);

    let leaders: Vec<Regime> = [
        (Regime::Trending, trending),
        (Regime::Ranging, ranging),
        (Regime::Choppy, choppy),
    ]
    .iter()
    .filter(|(_, s)| (max - s).abs() < 1e-9)
    .map(|(r, _)| *r)
    .collect();

    let regime = match previous {
        Some(prev) if leaders.contains(&prev) => prev,
        _ => leaders[0],
    };

    (regime, max.clamp(0.0, 1.0))
}

/// High-low range over the trailing window as a percentage of price.
fn range_width_pct(candles: &[Candle], price: f64) -> f64 {
    if price <= 0.0 || candles.is_empty() {
        return 0.0;
    }
    let window = &candles[candles.len().saturating_sub(LOOKBACK_BARS)..];
    let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    ((high - low) / price * 100.0).max(0.0)
}

/// Count close-to-close direction flips over the trailing window.
fn reversal_count(candles: &[Candle]) -> usize {
    let window = &candles[candles.len().saturating_sub(LOOKBACK_BARS)..];
    let deltas: Vec<f64> = window.windows(2).map(|w| w[1].close - w[0].close).collect();

    deltas
        .windows(2)
        .filter(|pair| pair[0] * pair[1] < 0.0)
        .count()
}

/// Latest bar volume relative to the trailing-window average.
fn volume_ratio(candles: &[Candle]) -> f64 {
    let window = &candles[candles.len().saturating_sub(LOOKBACK_BARS)..];
    if window.len() < 2 {
        return 1.0;
    }
    let last = window.last().map(|c| c.volume).unwrap_or(0.0);
    let avg =
        window[..window.len() - 1].iter().map(|c| c.volume).sum::<f64>() / (window.len() - 1) as f64;
    if avg > 0.0 {
        last / avg
    } else {
        1.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::compute_snapshot;

    fn candle(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle::new(ts, open, high, low, close, volume, volume * close, true)
    }

    /// A steady directional climb: strong ADX, price well above its mean.
    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 1.5;
                candle(i as i64 * 60_000, base, base + 1.0, base - 0.3, base + 0.8, 50.0)
            })
            .collect()
    }

    /// Flat oscillation around a mean: narrow range, weak ADX.
    fn ranging_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let wiggle = (i as f64 * 1.3).sin() * 0.2;
                let base = 100.0 + wiggle;
                candle(i as i64 * 60_000, base, base + 0.1, base - 0.1, base, 50.0)
            })
            .collect()
    }

    #[test]
    fn trending_series_classifies_trending() {
        let candles = trending_candles(120);
        let snapshot = compute_snapshot(&candles).unwrap();
        let classifier = RegimeClassifier::default();

        let state = classifier.classify("BTC-USDT-SWAP", &candles, &snapshot);
        assert_eq!(state.regime, Regime::Trending);
        assert!(state.confidence > 0.5);
        assert_eq!(state.adx_trend, TrendDirection::Bullish);
    }

    #[test]
    fn flat_series_classifies_ranging() {
        let candles = ranging_candles(120);
        let snapshot = compute_snapshot(&candles).unwrap();
        let classifier = RegimeClassifier::default();

        let state = classifier.classify("ETH-USDT-SWAP", &candles, &snapshot);
        assert_eq!(state.regime, Regime::Ranging);
    }

    #[test]
    fn tie_keeps_previous_regime() {
        let (regime, conf) =
            argmax_with_hysteresis(0.6, 0.6, 0.1, Some(Regime::Ranging));
        assert_eq!(regime, Regime::Ranging);
        assert!((conf - 0.6).abs() < 1e-12);

        // Without a previous regime, first leader wins.
        let (regime, _) = argmax_with_hysteresis(0.6, 0.6, 0.1, None);
        assert_eq!(regime, Regime::Trending);

        // A previous regime that is not among the leaders does not stick.
        let (regime, _) = argmax_with_hysteresis(0.9, 0.3, 0.1, Some(Regime::Choppy));
        assert_eq!(regime, Regime::Trending);
    }

    #[test]
    fn counter_trend_block_matrix() {
        let candles = trending_candles(120);
        let snapshot = compute_snapshot(&candles).unwrap();
        let classifier = RegimeClassifier::default();
        let mut state = classifier.classify("BTC-USDT-SWAP", &candles, &snapshot);
        state.adx = 30.0; // force a strong trend reading

        // Bullish ADX trend at ADX 30: SHORT blocked, LONG kept.
        assert!(state.blocks_counter_trend(Side::Short, 25.0));
        assert!(!state.blocks_counter_trend(Side::Long, 25.0));

        // Below the strong-ADX bar nothing is blocked.
        state.adx = 20.0;
        assert!(!state.blocks_counter_trend(Side::Short, 25.0));
    }

    #[test]
    fn reversal_count_counts_flips() {
        // Alternating up/down closes flip direction every bar.
        let candles: Vec<Candle> = (0..21)
            .map(|i| {
                let close = if i % 2 == 0 { 100.0 } else { 101.0 };
                candle(i as i64 * 60_000, close, close + 0.5, close - 0.5, close, 10.0)
            })
            .collect();
        assert!(reversal_count(&candles) >= 15);

        let steady = trending_candles(21);
        assert_eq!(reversal_count(&steady), 0);
    }

    #[test]
    fn volume_ratio_detects_spike() {
        let mut candles = ranging_candles(20);
        let last = candles.last().cloned().unwrap();
        candles.push(candle(
            last.timestamp_ms + 60_000,
            last.close,
            last.close + 0.1,
            last.close - 0.1,
            last.close,
            500.0, // 10x baseline
        ));
        assert!(volume_ratio(&candles) > 2.0);
    }
}
