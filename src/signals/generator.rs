// =============================================================================
// Signal Generator — directional candidates from independent rules
// =============================================================================
//
// Each rule produces (side, base strength, kind). Per cycle a symbol emits at
// most one long and one short candidate: the strength is the maximum across
// contributing rules and the confidence combines them. Candidates then pass
// the counter-trend block and the regime's strength/ADX thresholds before
// reaching the filter pipeline.
// =============================================================================

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::IndicatorSnapshot;
use crate::market_data::Candle;
use crate::params::ParamRecord;
use crate::regime::{Regime, RegimeState};
use crate::types::Side;

/// Scales the tiny relative EMA gap into a usable strength magnitude.
const MA_CROSS_MULTIPLIER: f64 = 400.0;
/// Attenuation applied to the MA rule when the last bar is directionless.
const NEUTRAL_BAR_ATTENUATION: f64 = 0.9;
/// A bar whose body is under this fraction of its open is directionless.
const NEUTRAL_BAR_BODY_FRACTION: f64 = 0.0005;
/// MACD histogram equal to this fraction of price maps to strength 1.0.
const MACD_FULL_STRENGTH_FRACTION: f64 = 0.001;
/// Bollinger-breach distance (% of middle band) mapping to strength 1.0.
const BB_FULL_STRENGTH_PCT: f64 = 1.0;
/// Range-bounce proximity to support/resistance, as a fraction of price.
const BOUNCE_PROXIMITY: f64 = 0.0015;
/// Fixed strength of a range-bounce candidate.
const BOUNCE_STRENGTH: f64 = 0.75;
/// Bars scanned for range-bounce support/resistance.
const BOUNCE_LOOKBACK: usize = 20;

/// A directional trade candidate. Ephemeral — lives only through the current
/// evaluation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Effective strength in [0, 1]; filters may attenuate it further.
    pub strength: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub timestamp_ms: i64,
    pub suggested_price: f64,
    pub indicators: IndicatorSnapshot,
    /// Names of the rules and filters that contributed or passed.
    pub filters_passed: BTreeSet<String>,
}

/// Outcome of one generation pass for a symbol.
#[derive(Debug, Default)]
pub struct GenerationResult {
    pub signals: Vec<Signal>,
    /// Stable reason codes for candidates that were dropped.
    pub rejections: Vec<&'static str>,
}

struct Candidate {
    side: Side,
    strength: f64,
    kind: &'static str,
}

/// Generate candidates for one symbol from its indicators and regime.
///
/// `candles_1m` are the symbol's recent closed 1m candles (oldest first);
/// callers must already have verified the minimum buffered-candle count.
pub fn generate(
    symbol: &str,
    candles_1m: &[Candle],
    snapshot: &IndicatorSnapshot,
    regime_state: &RegimeState,
    params: &ParamRecord,
    strong_adx: f64,
    now_ms: i64,
) -> GenerationResult {
    let mut result = GenerationResult::default();
    let price = snapshot.last_close;
    if price <= 0.0 {
        result.rejections.push("invalid_price");
        return result;
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    candidates.extend(ma_crossover_rule(candles_1m, snapshot));
    candidates.extend(rsi_rule(snapshot));
    candidates.extend(macd_rule(snapshot));
    candidates.extend(bollinger_rule(snapshot));
    if regime_state.regime == Regime::Ranging {
        candidates.extend(range_bounce_rule(candles_1m));
    }

    for side in [Side::Long, Side::Short] {
        let contributing: Vec<&Candidate> =
            candidates.iter().filter(|c| c.side == side).collect();
        if contributing.is_empty() {
            continue;
        }

        let strength = contributing
            .iter()
            .map(|c| c.strength)
            .fold(0.0_f64, f64::max)
            .clamp(0.0, 1.0);
        let confidence = (contributing.iter().map(|c| c.strength).sum::<f64>()
            / contributing.len() as f64)
            .clamp(0.0, 1.0);

        // Counter-trend block: strong trends discard opposing candidates.
        if regime_state.blocks_counter_trend(side, strong_adx) {
            debug!(symbol, side = %side, adx = regime_state.adx, "counter-trend candidate discarded");
            result.rejections.push("counter_trend");
            continue;
        }

        if strength < params.min_signal_strength {
            result.rejections.push("low_strength");
            continue;
        }
        if snapshot.adx.adx < params.adx_threshold {
            result.rejections.push("adx_below_threshold");
            continue;
        }

        let mut filters_passed: BTreeSet<String> =
            contributing.iter().map(|c| c.kind.to_string()).collect();
        filters_passed.insert("threshold".to_string());

        result.signals.push(Signal {
            symbol: symbol.to_string(),
            side,
            strength,
            confidence,
            regime: regime_state.regime,
            timestamp_ms: now_ms,
            suggested_price: price,
            indicators: snapshot.clone(),
            filters_passed,
        });
    }

    result
}

// =============================================================================
// Rules
// =============================================================================

/// EMA fast/slow gap, scaled to a usable magnitude and attenuated when the
/// latest bar has no direction of its own.
fn ma_crossover_rule(candles: &[Candle], snapshot: &IndicatorSnapshot) -> Option<Candidate> {
    if snapshot.ema_slow <= 0.0 {
        return None;
    }
    let gap = snapshot.ema_fast - snapshot.ema_slow;
    if gap == 0.0 {
        return None;
    }

    let mut strength = (gap.abs() / snapshot.ema_slow * MA_CROSS_MULTIPLIER).min(1.0);

    if let Some(last) = candles.last() {
        if last.open > 0.0
            && ((last.close - last.open).abs() / last.open) < NEUTRAL_BAR_BODY_FRACTION
        {
            strength *= NEUTRAL_BAR_ATTENUATION;
        }
    }

    Some(Candidate {
        side: if gap > 0.0 { Side::Long } else { Side::Short },
        strength,
        kind: "ma_crossover",
    })
}

/// Oversold buys, overbought sells; strength scales with threshold distance.
fn rsi_rule(snapshot: &IndicatorSnapshot) -> Option<Candidate> {
    let rsi = snapshot.rsi;
    if rsi < 30.0 {
        Some(Candidate {
            side: Side::Long,
            strength: ((30.0 - rsi) / 30.0).clamp(0.0, 1.0),
            kind: "rsi",
        })
    } else if rsi > 70.0 {
        Some(Candidate {
            side: Side::Short,
            strength: ((rsi - 70.0) / 30.0).clamp(0.0, 1.0),
            kind: "rsi",
        })
    } else {
        None
    }
}

/// Histogram sign gives the side, magnitude (relative to price) the strength.
fn macd_rule(snapshot: &IndicatorSnapshot) -> Option<Candidate> {
    let hist = snapshot.macd.hist;
    if hist == 0.0 || snapshot.last_close <= 0.0 {
        return None;
    }
    let divisor = snapshot.last_close * MACD_FULL_STRENGTH_FRACTION;
    let strength = (hist.abs() / divisor).min(1.0);
    Some(Candidate {
        side: if hist > 0.0 { Side::Long } else { Side::Short },
        strength,
        kind: "macd",
    })
}

/// Price outside a band is a mean-reversion candidate toward the middle.
fn bollinger_rule(snapshot: &IndicatorSnapshot) -> Option<Candidate> {
    let price = snapshot.last_close;
    let bb = &snapshot.bb;
    if bb.middle <= 0.0 {
        return None;
    }

    if price < bb.lower {
        let dist_pct = (bb.middle - price) / bb.middle * 100.0;
        Some(Candidate {
            side: Side::Long,
            strength: (dist_pct / BB_FULL_STRENGTH_PCT).clamp(0.0, 1.0),
            kind: "bollinger",
        })
    } else if price > bb.upper {
        let dist_pct = (price - bb.middle) / bb.middle * 100.0;
        Some(Candidate {
            side: Side::Short,
            strength: (dist_pct / BB_FULL_STRENGTH_PCT).clamp(0.0, 1.0),
            kind: "bollinger",
        })
    } else {
        None
    }
}

/// Ranging regime only: price sitting at recent support/resistance and
/// turning back into the range.
fn range_bounce_rule(candles: &[Candle]) -> Option<Candidate> {
    if candles.len() < BOUNCE_LOOKBACK + 1 {
        return None;
    }
    let window = &candles[candles.len() - BOUNCE_LOOKBACK..];
    let support = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let resistance = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);

    let last = candles.last()?;
    let prev = &candles[candles.len() - 2];
    let price = last.close;
    if price <= 0.0 {
        return None;
    }

    let near_support = (price - support) / price < BOUNCE_PROXIMITY;
    let near_resistance = (resistance - price) / price < BOUNCE_PROXIMITY;
    let turning_up = last.close > prev.close;
    let turning_down = last.close < prev.close;

    if near_support && turning_up {
        Some(Candidate {
            side: Side::Long,
            strength: BOUNCE_STRENGTH,
            kind: "range_bounce",
        })
    } else if near_resistance && turning_down {
        Some(Candidate {
            side: Side::Short,
            strength: BOUNCE_STRENGTH,
            kind: "range_bounce",
        })
    } else {
        None
    }
}
