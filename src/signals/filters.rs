// =============================================================================
// Filter Pipeline — ordered signal vetting
// =============================================================================
//
// Filters run in a fixed order; each returns Allow, Warn (with a strength
// multiplier), or Block (with a stable reason code). Any Block is terminal.
// Per the soft-filter policy, alignment-style filters warn instead of
// blocking; only hard constraints (ADX floor, counter-trend, correlation cap,
// liquidity, order flow, funding) terminate a signal.
//
// Order:
//   1. ADX floor          4. Correlation        7. Volume profile (bonus)
//   2. Counter-trend      5. Liquidity          8. Funding rate
//   3. MTF alignment      6. Order flow         9. Pivot proximity (bonus)
// =============================================================================

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::{FiltersConfig, RiskConfig};
use crate::indicators::ema::ema_trend;
use crate::market_data::{Candle, OrderBookTop};
use crate::params::ParamRecord;
use crate::regime::RegimeState;
use crate::signals::Signal;
use crate::types::Side;

/// Bars used for the inter-symbol correlation window.
const CORRELATION_WINDOW: usize = 60;
/// Bars and bucket count for the volume profile histogram.
const VOLUME_PROFILE_BARS: usize = 100;
const VOLUME_PROFILE_BUCKETS: usize = 20;

/// Verdict of a single filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterVerdict {
    Allow,
    Warn { multiplier: f64 },
    Block { reason: &'static str },
}

/// Market context a filter run needs. The cycle snapshots all of it from the
/// registry up front so the pipeline itself stays synchronous and testable.
#[derive(Debug, Default)]
pub struct FilterInputs {
    pub book: Option<OrderBookTop>,
    /// 24h quote volume for the liquidity fallback.
    pub day_volume_usd: Option<f64>,
    pub funding_rate: Option<f64>,
    pub closes_5m: Vec<f64>,
    pub closes_1h: Vec<f64>,
    /// Previous daily candle, for classical pivots.
    pub daily_candle: Option<Candle>,
    /// 1m closes of the signal's symbol, for correlation.
    pub closes_1m: Vec<f64>,
    /// 1m closes of symbols with open positions.
    pub open_position_closes: Vec<(String, Vec<f64>)>,
    /// Recent 1m candles for the volume profile.
    pub recent_1m: Vec<Candle>,
    /// Slow-cycle degradation: REST-derived filters are skipped.
    pub degraded: bool,
}

/// Result of running the whole pipeline over one signal.
#[derive(Debug)]
pub struct FilterOutcome {
    pub effective_strength: f64,
    pub passed: BTreeSet<String>,
    pub blocked: Option<&'static str>,
}

impl FilterOutcome {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Run the ordered pipeline. Warn multipliers compound onto the signal
/// strength; the first Block stops evaluation.
pub fn run_filters(
    signal: &Signal,
    params: &ParamRecord,
    filters_cfg: &FiltersConfig,
    risk_cfg: &RiskConfig,
    regime_state: &RegimeState,
    strong_adx: f64,
    inputs: &FilterInputs,
) -> FilterOutcome {
    let mut strength = signal.strength;
    let mut passed: BTreeSet<String> = BTreeSet::new();

    let stages: [(&'static str, FilterVerdict); 9] = [
        ("adx", adx_filter(signal, params)),
        ("counter_trend", counter_trend_filter(signal, regime_state, strong_adx)),
        ("mtf", mtf_filter(signal, filters_cfg, inputs)),
        ("correlation", correlation_filter(signal, risk_cfg, inputs)),
        ("liquidity", liquidity_filter(signal, filters_cfg, inputs)),
        ("order_flow", order_flow_filter(signal, filters_cfg, inputs)),
        ("volume_profile", volume_profile_filter(signal, filters_cfg, inputs)),
        ("funding", funding_filter(signal, filters_cfg, inputs)),
        ("pivot", pivot_filter(signal, filters_cfg, inputs)),
    ];

    for (name, verdict) in stages {
        match verdict {
            FilterVerdict::Allow => {
                passed.insert(name.to_string());
            }
            FilterVerdict::Warn { multiplier } => {
                strength = (strength * multiplier).clamp(0.0, 1.0);
                passed.insert(name.to_string());
                debug!(
                    symbol = %signal.symbol,
                    filter = name,
                    multiplier,
                    strength,
                    "filter warned"
                );
            }
            FilterVerdict::Block { reason } => {
                debug!(symbol = %signal.symbol, filter = name, reason, "filter blocked signal");
                return FilterOutcome {
                    effective_strength: strength,
                    passed,
                    blocked: Some(reason),
                };
            }
        }
    }

    FilterOutcome {
        effective_strength: strength,
        passed,
        blocked: None,
    }
}

// =============================================================================
// Individual filters
// =============================================================================

/// Hard ADX floor per regime, re-verified with the signal's own snapshot.
fn adx_filter(signal: &Signal, params: &ParamRecord) -> FilterVerdict {
    if signal.indicators.adx.adx < params.adx_threshold {
        FilterVerdict::Block {
            reason: "adx_below_threshold",
        }
    } else {
        FilterVerdict::Allow
    }
}

/// Counter-trend re-verification against the freshest regime state.
fn counter_trend_filter(
    signal: &Signal,
    regime_state: &RegimeState,
    strong_adx: f64,
) -> FilterVerdict {
    if regime_state.blocks_counter_trend(signal.side, strong_adx) {
        FilterVerdict::Block {
            reason: "counter_trend",
        }
    } else {
        FilterVerdict::Allow
    }
}

/// Multi-timeframe alignment: 5m and 1H EMA trends. Neutral on either side
/// is a no-bonus warn; an opposing senior timeframe warns with the soft
/// multiplier. This filter never blocks.
fn mtf_filter(signal: &Signal, cfg: &FiltersConfig, inputs: &FilterInputs) -> FilterVerdict {
    if !cfg.mtf_enabled {
        return FilterVerdict::Allow;
    }

    let direction: i8 = match signal.side {
        Side::Long => 1,
        Side::Short => -1,
    };

    let trend_5m = ema_trend(&inputs.closes_5m);
    let trend_1h = ema_trend(&inputs.closes_1h);

    match (trend_5m, trend_1h) {
        (Some(t5), Some(t1h)) if t5 == direction && t1h == direction => FilterVerdict::Allow,
        (_, Some(t1h)) if t1h == -direction => FilterVerdict::Warn {
            multiplier: cfg.mtf_warn_multiplier,
        },
        _ => FilterVerdict::Warn { multiplier: 1.0 },
    }
}

/// Reject when the number of already-open correlated positions would exceed
/// the cap; warn when correlation exists but stays under it.
fn correlation_filter(
    signal: &Signal,
    risk_cfg: &RiskConfig,
    inputs: &FilterInputs,
) -> FilterVerdict {
    if inputs.open_position_closes.is_empty() || inputs.closes_1m.len() < CORRELATION_WINDOW {
        return FilterVerdict::Allow;
    }

    let mut correlated = 0usize;
    for (other_symbol, other_closes) in &inputs.open_position_closes {
        if other_symbol == &signal.symbol {
            continue;
        }
        if let Some(rho) = pearson_tail(&inputs.closes_1m, other_closes, CORRELATION_WINDOW) {
            if rho.abs() >= risk_cfg.corr_threshold {
                correlated += 1;
            }
        }
    }

    if correlated >= risk_cfg.max_correlated_positions {
        FilterVerdict::Block {
            reason: "correlation_limit",
        }
    } else if correlated > 0 {
        FilterVerdict::Warn { multiplier: 1.0 }
    } else {
        FilterVerdict::Allow
    }
}

/// Require top-of-book size on the side being entered: longs consume the bid
/// side, shorts the ask side. Thin books fall back to 24h volume.
fn liquidity_filter(signal: &Signal, cfg: &FiltersConfig, inputs: &FilterInputs) -> FilterVerdict {
    if !cfg.liquidity_enabled {
        return FilterVerdict::Allow;
    }

    let book_side_size = inputs.book.as_ref().map(|b| match signal.side {
        Side::Long => b.bid_size,
        Side::Short => b.ask_size,
    });

    match book_side_size {
        Some(size) if size >= cfg.liquidity_min_book_size => FilterVerdict::Allow,
        _ => match inputs.day_volume_usd {
            Some(volume) if volume >= cfg.liquidity_volume_fallback_usd => {
                FilterVerdict::Warn { multiplier: 1.0 }
            }
            _ => FilterVerdict::Block {
                reason: "insufficient_liquidity",
            },
        },
    }
}

/// The bid/ask imbalance must not lean against the signal side beyond the
/// configured threshold.
fn order_flow_filter(signal: &Signal, cfg: &FiltersConfig, inputs: &FilterInputs) -> FilterVerdict {
    if !cfg.orderflow_enabled {
        return FilterVerdict::Allow;
    }
    let Some(book) = &inputs.book else {
        return FilterVerdict::Allow;
    };

    let against = match signal.side {
        Side::Long => book.imbalance < -cfg.orderflow_threshold,
        Side::Short => book.imbalance > cfg.orderflow_threshold,
    };

    if against {
        FilterVerdict::Block {
            reason: "order_flow_against",
        }
    } else {
        FilterVerdict::Allow
    }
}

/// Bonus when price sits in a high-volume node of the recent profile.
/// Never blocks.
fn volume_profile_filter(
    signal: &Signal,
    cfg: &FiltersConfig,
    inputs: &FilterInputs,
) -> FilterVerdict {
    if !cfg.volume_profile_enabled || inputs.degraded {
        return FilterVerdict::Allow;
    }

    if in_high_volume_node(&inputs.recent_1m, signal.suggested_price) {
        FilterVerdict::Warn {
            multiplier: cfg.volume_profile_bonus,
        }
    } else {
        FilterVerdict::Allow
    }
}

/// Reject longs into punitive positive funding and shorts into punitive
/// negative funding. Absent funding data (slow tier expired) passes.
fn funding_filter(signal: &Signal, cfg: &FiltersConfig, inputs: &FilterInputs) -> FilterVerdict {
    if !cfg.funding_enabled || inputs.degraded {
        return FilterVerdict::Allow;
    }
    let Some(rate) = inputs.funding_rate else {
        return FilterVerdict::Allow;
    };

    let punitive = match signal.side {
        Side::Long => rate > cfg.funding_max_positive_rate,
        Side::Short => rate < cfg.funding_max_negative_rate,
    };

    if punitive {
        FilterVerdict::Block {
            reason: "funding_rate",
        }
    } else {
        FilterVerdict::Allow
    }
}

/// Bonus near a classical pivot level (P, R1, S1 from the previous day).
/// Never blocks.
fn pivot_filter(signal: &Signal, cfg: &FiltersConfig, inputs: &FilterInputs) -> FilterVerdict {
    if !cfg.pivot_enabled {
        return FilterVerdict::Allow;
    }
    let Some(daily) = &inputs.daily_candle else {
        return FilterVerdict::Allow;
    };

    let pivot = (daily.high + daily.low + daily.close) / 3.0;
    let r1 = 2.0 * pivot - daily.low;
    let s1 = 2.0 * pivot - daily.high;

    let price = signal.suggested_price;
    if price <= 0.0 {
        return FilterVerdict::Allow;
    }

    let near = [pivot, r1, s1]
        .iter()
        .any(|level| ((price - level).abs() / price * 100.0) < cfg.pivot_proximity_pct);

    if near {
        FilterVerdict::Warn {
            multiplier: cfg.pivot_bonus,
        }
    } else {
        FilterVerdict::Allow
    }
}

// =============================================================================
// Statistics helpers
// =============================================================================

/// Pearson correlation over the aligned tails of two close series.
fn pearson_tail(a: &[f64], b: &[f64], window: usize) -> Option<f64> {
    let n = window.min(a.len()).min(b.len());
    if n < 10 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    let rho = cov / (var_a.sqrt() * var_b.sqrt());
    if rho.is_finite() {
        Some(rho)
    } else {
        None
    }
}

/// Whether `price` falls in a top-quintile volume bucket of the recent
/// profile.
fn in_high_volume_node(candles: &[Candle], price: f64) -> bool {
    let window = &candles[candles.len().saturating_sub(VOLUME_PROFILE_BARS)..];
    if window.len() < VOLUME_PROFILE_BUCKETS || price <= 0.0 {
        return false;
    }

    let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    if high <= low {
        return false;
    }

    let bucket_width = (high - low) / VOLUME_PROFILE_BUCKETS as f64;
    let mut volumes = vec![0.0_f64; VOLUME_PROFILE_BUCKETS];
    for c in window {
        let mid = (c.high + c.low) / 2.0;
        let idx = (((mid - low) / bucket_width) as usize).min(VOLUME_PROFILE_BUCKETS - 1);
        volumes[idx] += c.volume;
    }

    let price_idx = (((price - low) / bucket_width) as usize).min(VOLUME_PROFILE_BUCKETS - 1);

    let mut sorted = volumes.clone();
    sorted.sort_by(|x, y| y.partial_cmp(x).unwrap_or(std::cmp::Ordering::Equal));
    let cutoff = sorted[(VOLUME_PROFILE_BUCKETS / 5).saturating_sub(1)];

    volumes[price_idx] >= cutoff && volumes[price_idx] > 0.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{AdxResult, BollingerResult, IndicatorSnapshot, MacdResult, TrendDirection};
    use crate::regime::Regime;
    use std::collections::BTreeSet;

    fn snapshot(price: f64, adx: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            atr: 1.0,
            rsi: 50.0,
            macd: MacdResult {
                line: 0.0,
                signal: 0.0,
                hist: 0.0,
            },
            ema_fast: price,
            ema_slow: price,
            sma_fast: price,
            sma_slow: price,
            bb: BollingerResult {
                upper: price + 2.0,
                middle: price,
                lower: price - 2.0,
                width_pct: 4.0,
            },
            adx: AdxResult {
                adx,
                plus_di: 25.0,
                minus_di: 15.0,
                trend: TrendDirection::Bullish,
            },
            last_close: price,
            basis_ts_ms: 0,
        }
    }

    fn signal(side: Side, price: f64, adx: f64) -> Signal {
        Signal {
            symbol: "BTC-USDT-SWAP".to_string(),
            side,
            strength: 0.8,
            confidence: 0.7,
            regime: Regime::Ranging,
            timestamp_ms: 0,
            suggested_price: price,
            indicators: snapshot(price, adx),
            filters_passed: BTreeSet::new(),
        }
    }

    fn regime_state(regime: Regime, adx: f64, trend: TrendDirection) -> RegimeState {
        RegimeState {
            regime,
            confidence: 0.8,
            trending_score: 0.0,
            ranging_score: 0.0,
            choppy_score: 0.0,
            adx,
            plus_di: 25.0,
            minus_di: 15.0,
            adx_trend: trend,
            volatility_pct: 0.5,
            trend_deviation_pct: 0.0,
        }
    }

    fn params() -> ParamRecord {
        use crate::config::BotConfig;
        use crate::params::ParamProvider;

        let mut cfg = BotConfig::default();
        let mut table = crate::config::ParamTable::new();
        table.insert("tp_percent".into(), serde_json::json!(1.0));
        table.insert("sl_percent".into(), serde_json::json!(0.8));
        table.insert("leverage".into(), serde_json::json!(10));
        table.insert("adx_threshold".into(), serde_json::json!(15.0));
        cfg.adaptive_regime.insert("ranging".into(), table);
        ParamProvider::from_config(&cfg)
            .resolve("BTC-USDT-SWAP", Regime::Ranging)
            .unwrap()
    }

    fn book(bid_size: f64, ask_size: f64, imbalance_override: Option<f64>) -> OrderBookTop {
        let total = bid_size + ask_size;
        OrderBookTop {
            symbol: "BTC-USDT-SWAP".into(),
            best_bid: 100.0,
            best_ask: 100.1,
            bid_size,
            ask_size,
            spread_bps: 10.0,
            imbalance: imbalance_override
                .unwrap_or(if total > 0.0 { (bid_size - ask_size) / total } else { 0.0 }),
            updated_at_ms: 0,
        }
    }

    fn inputs_with_book(b: OrderBookTop) -> FilterInputs {
        FilterInputs {
            book: Some(b),
            ..Default::default()
        }
    }

    fn run(signal: &Signal, inputs: &FilterInputs) -> FilterOutcome {
        let rs = regime_state(Regime::Ranging, 20.0, TrendDirection::Neutral);
        run_filters(
            signal,
            &params(),
            &FiltersConfig::default(),
            &RiskConfig::default(),
            &rs,
            25.0,
            inputs,
        )
    }

    #[test]
    fn adx_floor_blocks_first() {
        let sig = signal(Side::Long, 100.0, 10.0); // below floor 15
        let outcome = run(&sig, &FilterInputs::default());
        assert_eq!(outcome.blocked, Some("adx_below_threshold"));
    }

    #[test]
    fn order_flow_against_long_blocks() {
        let sig = signal(Side::Long, 100.0, 20.0);
        let inputs = inputs_with_book(book(100.0, 100.0, Some(-0.5)));
        let outcome = run(&sig, &inputs);
        assert_eq!(outcome.blocked, Some("order_flow_against"));
    }

    #[test]
    fn liquidity_uses_entry_side_of_book() {
        // Long consumes the bid side: thin bids, fat asks must still block.
        let sig = signal(Side::Long, 100.0, 20.0);
        let inputs = inputs_with_book(book(1.0, 500.0, Some(0.0)));
        let outcome = run(&sig, &inputs);
        assert_eq!(outcome.blocked, Some("insufficient_liquidity"));

        // Short consumes the ask side: the same book passes.
        let sig = signal(Side::Short, 100.0, 20.0);
        let inputs = inputs_with_book(book(1.0, 500.0, Some(0.0)));
        let outcome = run(&sig, &inputs);
        assert!(outcome.blocked.is_none());
    }

    #[test]
    fn liquidity_volume_fallback() {
        let sig = signal(Side::Long, 100.0, 20.0);
        let mut inputs = inputs_with_book(book(1.0, 1.0, Some(0.0)));
        inputs.day_volume_usd = Some(10_000_000.0);
        let outcome = run(&sig, &inputs);
        assert!(outcome.blocked.is_none());
    }

    #[test]
    fn funding_blocks_expensive_side() {
        let mut inputs = inputs_with_book(book(100.0, 100.0, Some(0.0)));
        inputs.funding_rate = Some(0.001); // punitive for longs

        let long = signal(Side::Long, 100.0, 20.0);
        assert_eq!(run(&long, &inputs).blocked, Some("funding_rate"));

        let short = signal(Side::Short, 100.0, 20.0);
        assert!(run(&short, &inputs).blocked.is_none());
    }

    #[test]
    fn mtf_opposing_senior_timeframe_attenuates() {
        let sig = signal(Side::Long, 100.0, 20.0);
        let mut inputs = inputs_with_book(book(100.0, 100.0, Some(0.0)));
        // 1H trend clearly bearish.
        inputs.closes_1h = (1..=100).rev().map(|x| x as f64).collect();

        let outcome = run(&sig, &inputs);
        assert!(outcome.blocked.is_none());
        assert!(
            outcome.effective_strength < sig.strength,
            "opposing senior timeframe should attenuate: {} vs {}",
            outcome.effective_strength,
            sig.strength
        );
    }

    #[test]
    fn correlation_cap_blocks() {
        let sig = signal(Side::Long, 100.0, 20.0);
        let mut inputs = inputs_with_book(book(100.0, 100.0, Some(0.0)));

        // Perfectly correlated series for two open positions.
        let base: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.7).sin() * 3.0).collect();
        inputs.closes_1m = base.clone();
        inputs.open_position_closes = vec![
            ("ETH-USDT-SWAP".into(), base.clone()),
            ("SOL-USDT-SWAP".into(), base.clone()),
        ];

        let outcome = run(&sig, &inputs);
        assert_eq!(outcome.blocked, Some("correlation_limit"));
    }

    #[test]
    fn uncorrelated_positions_pass() {
        let sig = signal(Side::Long, 100.0, 20.0);
        let mut inputs = inputs_with_book(book(100.0, 100.0, Some(0.0)));

        inputs.closes_1m = (0..80).map(|i| 100.0 + (i as f64 * 0.7).sin() * 3.0).collect();
        // Anti-phase series still counts as correlated (|rho|); use noise-free
        // alternation orthogonal to the sine instead.
        inputs.open_position_closes = vec![(
            "DOGE-USDT-SWAP".into(),
            (0..80).map(|i| 50.0 + if i % 2 == 0 { 0.5 } else { -0.5 }).collect(),
        )];

        let outcome = run(&sig, &inputs);
        assert!(outcome.blocked.is_none());
    }

    #[test]
    fn pearson_detects_perfect_correlation() {
        let a: Vec<f64> = (0..60).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..60).map(|i| 2.0 * i as f64 + 5.0).collect();
        let rho = pearson_tail(&a, &b, 60).unwrap();
        assert!((rho - 1.0).abs() < 1e-9);

        let c: Vec<f64> = (0..60).map(|i| -(i as f64)).collect();
        let rho = pearson_tail(&a, &c, 60).unwrap();
        assert!((rho + 1.0).abs() < 1e-9);
    }

    #[test]
    fn degraded_cycle_skips_rest_derived_filters() {
        let sig = signal(Side::Long, 100.0, 20.0);
        let mut inputs = inputs_with_book(book(100.0, 100.0, Some(0.0)));
        inputs.funding_rate = Some(0.001); // would block
        inputs.degraded = true;

        let outcome = run(&sig, &inputs);
        assert!(outcome.blocked.is_none());
    }
}
