// =============================================================================
// Average Directional Index (ADX) with directional components
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder's smoothing (period) of +DM, -DM, TR.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100, -DI likewise.
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   5. ADX = Wilder's smoothed average of DX over `period` bars.
//
// ADX > 25 reads as trending, ADX < 20 as ranging. The DI gap gives the
// trend *direction*, which the counter-trend block needs.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// DI gap below which the trend direction is considered neutral.
const NEUTRAL_DI_GAP: f64 = 1.0;

/// Trend direction derived from the +DI / -DI gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Most recent ADX value with its directional components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdxResult {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub trend: TrendDirection,
}

impl AdxResult {
    /// |+DI - -DI| — the directional conviction used by regime scoring.
    pub fn di_gap(&self) -> f64 {
        (self.plus_di - self.minus_di).abs()
    }
}

/// Compute the most recent ADX from a slice of candles (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `2 * period + 1` candles
/// are available, or an intermediate calculation is non-finite.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<AdxResult> {
    if period == 0 {
        return None;
    }
    if candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let n = candles.len();
    let bar_count = n - 1;

    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let mut smooth_plus_dm: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values: Vec<f64> = Vec::with_capacity(bar_count - period + 1);
    dx_values.push(compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr)?);

    for i in period..bar_count {
        smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period_f + plus_dm[i];
        smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        dx_values.push(compute_dx(smooth_plus_dm, smooth_minus_dm, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let seed: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut adx = seed;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
        if !adx.is_finite() {
            return None;
        }
    }

    // Final DI values from the last smoothed state.
    if smooth_tr == 0.0 {
        return None;
    }
    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let trend = if plus_di - minus_di > NEUTRAL_DI_GAP {
        TrendDirection::Bullish
    } else if minus_di - plus_di > NEUTRAL_DI_GAP {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    };

    Some(AdxResult {
        adx,
        plus_di,
        minus_di,
        trend,
    })
}

/// DX from smoothed values. `None` when TR is zero or the result misbehaves.
fn compute_dx(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let dx = ((plus_di - minus_di).abs() / di_sum) * 100.0;
    if dx.is_finite() {
        Some(dx)
    } else {
        None
    }
}
