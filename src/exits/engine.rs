// =============================================================================
// Exit Decision Engine — ordered priority evaluation per live position
// =============================================================================
//
// The priority list is evaluated top to bottom; the first match wins. It is
// an explicit ordered walk — no nested branches sharing mutable locals, so a
// higher-priority step can never mangle the parameters a later step reads.
//
//    1. Peak-profit tracker update
//    2. Critical loss cut (2× loss cut; bypasses min holding)
//    3. Standard loss cut (min holding applies)
//    4. Min-profit-to-close gate (losing positions skip optimistic exits)
//    5. Stop-loss, price-based (ATR multiple or fixed percent)
//    6. Smart close (configured reversal score)
//    7. Take-profit, price-based
//    8. Big-profit harvest
//    9. Partial take-profit (fraction close + peak re-base)
//   10. Reversal detected
//   11. Max-holding timeout (non-losing positions only; trend extension)
//   12. Emergency loss protection (bypasses min holding)
//   13. Min-holding enforcement (implicit: nothing matched)
//
// Price contract: callers obtain the price with purpose=exit_analysis. When
// no price tier is fresh they anchor on the entry price with
// `price_is_fallback=true`, which suppresses fees so the position reads flat
// instead of showing the spurious −(fees) artifact.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SmartCloseConfig;
use crate::error::Result;
use crate::exits::pnl::{compute_pnl, PnlBreakdown};
use crate::position::Position;
use crate::regime::Regime;
use crate::types::Side;

/// Reversal score at or above which the pattern-based reversal exit fires.
const REVERSAL_EXIT_THRESHOLD: f64 = 0.8;
/// Trend strength at or above which a trending winner's timeout extends.
const TIMEOUT_EXTENSION_TREND_STRENGTH: f64 = 0.7;
/// Net PnL % a trending winner needs for the timeout extension.
const TIMEOUT_EXTENSION_MIN_PNL_PCT: f64 = 0.3;

/// Why a position is being closed. Codes are stable — they feed the trade
/// journal and the per-reason counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    LossCutCritical,
    LossCut,
    StopLoss,
    SmartClose,
    TakeProfit,
    BigProfit,
    PartialTp,
    Reversal,
    MaxHoldingTimeout,
    EmergencyLoss,
    TrailingStop,
    DriftClose,
}

impl ExitReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::LossCutCritical => "loss_cut_critical",
            Self::LossCut => "loss_cut",
            Self::StopLoss => "sl",
            Self::SmartClose => "smart_close",
            Self::TakeProfit => "tp",
            Self::BigProfit => "big_profit",
            Self::PartialTp => "partial_tp",
            Self::Reversal => "reversal",
            Self::MaxHoldingTimeout => "timeout",
            Self::EmergencyLoss => "emergency_loss",
            Self::TrailingStop => "trailing_sl",
            Self::DriftClose => "drift_close",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Close the whole position or a configured fraction of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    Full,
    Partial { fraction: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub action: ExitAction,
    pub reason: ExitReason,
}

/// Everything one evaluation needs, snapshotted up front.
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub current_price: f64,
    /// True when the price is the entry-price fallback (stale data).
    pub price_is_fallback: bool,
    pub now_ms: i64,
    /// Fresh ATR for price-based SL/TP; absent falls back to fixed percents.
    pub atr: Option<f64>,
    /// Reversal score in [0, 1] from candle pattern + order flow.
    pub reversal_score: Option<f64>,
    /// Trend strength in [0, 1] for the trending timeout extension.
    pub trend_strength: Option<f64>,
    pub smart_close: SmartCloseConfig,
}

/// Result of one pass: the PnL that was computed, the peak watermark the
/// caller should commit, and the decision (if any).
#[derive(Debug, Clone)]
pub struct ExitEvaluation {
    pub pnl: PnlBreakdown,
    pub new_peak_pct: Option<f64>,
    pub decision: Option<ExitDecision>,
}

/// Evaluate the full priority list for one position.
///
/// `params`, `ct_val`, and the fee pair come from the position's metadata —
/// resolved at entry, not re-derived here.
pub fn evaluate(
    position: &Position,
    params: &crate::params::ParamRecord,
    ct_val: f64,
    maker_fee: f64,
    taker_fee: f64,
    ctx: &ExitContext,
) -> Result<ExitEvaluation> {
    let include_fees = !ctx.price_is_fallback;
    let pnl = compute_pnl(
        position.side,
        position.entry_price,
        ctx.current_price,
        position.size,
        ct_val,
        position.margin_used,
        position.leverage,
        maker_fee,
        taker_fee,
        include_fees,
    )?;

    let net = pnl.net_pct_of_margin;
    let held_min = position.minutes_held(ctx.now_ms);
    let past_min_holding = held_min >= params.min_holding_minutes;

    // ── 1. Peak-profit tracker ───────────────────────────────────────────
    let new_peak_pct = if net > position.peak_profit_pct {
        Some(net)
    } else {
        None
    };

    let decide = |action, reason| ExitEvaluation {
        pnl,
        new_peak_pct,
        decision: Some(ExitDecision { action, reason }),
    };

    // A fallback-anchored price carries no real market information: the
    // position reads flat and no price-derived exit below can fire.

    // ── 2. Critical loss cut ─────────────────────────────────────────────
    if net <= -params.loss_cut_critical_percent() {
        return Ok(decide(ExitAction::Full, ExitReason::LossCutCritical));
    }

    // ── 3. Standard loss cut ─────────────────────────────────────────────
    if net <= -params.loss_cut_percent && past_min_holding {
        return Ok(decide(ExitAction::Full, ExitReason::LossCut));
    }

    // ── 4. Min-profit gate: losing positions skip optimistic exits ──────
    let optimistic_gated = net < 0.0 && pnl.net_usd < params.min_profit_to_close;

    // ── 5. Stop-loss (price-based) ───────────────────────────────────────
    if past_min_holding {
        let sl_price = stop_loss_price(position, params, ctx.atr);
        let sl_hit = match position.side {
            Side::Long => ctx.current_price <= sl_price,
            Side::Short => ctx.current_price >= sl_price,
        };
        if sl_hit && !ctx.price_is_fallback {
            return Ok(decide(ExitAction::Full, ExitReason::StopLoss));
        }
    }

    if !optimistic_gated {
        // ── 6. Smart close ───────────────────────────────────────────────
        if ctx.smart_close.enabled && past_min_holding {
            if let Some(score) = ctx.reversal_score {
                if score >= ctx.smart_close.reversal_threshold {
                    return Ok(decide(ExitAction::Full, ExitReason::SmartClose));
                }
            }
        }

        // ── 7. Take-profit (price-based) ─────────────────────────────────
        if past_min_holding && !ctx.price_is_fallback {
            let tp_price = take_profit_price(position, params, ctx.atr);
            let tp_hit = match position.side {
                Side::Long => ctx.current_price >= tp_price,
                Side::Short => ctx.current_price <= tp_price,
            };
            if tp_hit {
                return Ok(decide(ExitAction::Full, ExitReason::TakeProfit));
            }
        }

        // ── 8. Big-profit harvest ────────────────────────────────────────
        if past_min_holding
            && net >= params.ph_threshold_percent
            && pnl.net_usd >= params.ph_min_absolute
        {
            return Ok(decide(ExitAction::Full, ExitReason::BigProfit));
        }

        // ── 9. Partial take-profit ───────────────────────────────────────
        if past_min_holding
            && !position.partial_tp_executed
            && net >= params.partial_tp_trigger
        {
            return Ok(decide(
                ExitAction::Partial {
                    fraction: params.partial_tp_fraction,
                },
                ExitReason::PartialTp,
            ));
        }

        // ── 10. Reversal detected ────────────────────────────────────────
        if past_min_holding {
            if let Some(score) = ctx.reversal_score {
                if score >= REVERSAL_EXIT_THRESHOLD {
                    return Ok(decide(ExitAction::Full, ExitReason::Reversal));
                }
            }
        }

        // ── 11. Max-holding timeout (non-losing only) ────────────────────
        if held_min >= params.max_holding_minutes && net >= 0.0 {
            let extended = position.regime_at_entry == Regime::Trending
                && ctx.trend_strength.unwrap_or(0.0) >= TIMEOUT_EXTENSION_TREND_STRENGTH
                && net > TIMEOUT_EXTENSION_MIN_PNL_PCT;
            if !extended {
                return Ok(decide(ExitAction::Full, ExitReason::MaxHoldingTimeout));
            }
            debug!(
                symbol = %position.symbol,
                held_min,
                net_pnl_pct = net,
                "max-holding timeout extended for trending winner"
            );
        }
    }

    // ── 12. Emergency loss protection ────────────────────────────────────
    if net <= -params.emergency_loss_pct {
        return Ok(decide(ExitAction::Full, ExitReason::EmergencyLoss));
    }

    // ── 13. Min-holding enforcement: nothing matched ─────────────────────
    Ok(ExitEvaluation {
        pnl,
        new_peak_pct,
        decision: None,
    })
}

/// Fast-path subset run on every tick for symbols with a live position:
/// critical loss cut and emergency protection only. Trailing runs separately.
pub fn evaluate_fast_path(
    position: &Position,
    params: &crate::params::ParamRecord,
    ct_val: f64,
    maker_fee: f64,
    taker_fee: f64,
    current_price: f64,
) -> Result<Option<ExitDecision>> {
    let pnl = compute_pnl(
        position.side,
        position.entry_price,
        current_price,
        position.size,
        ct_val,
        position.margin_used,
        position.leverage,
        maker_fee,
        taker_fee,
        true,
    )?;

    let net = pnl.net_pct_of_margin;
    if net <= -params.loss_cut_critical_percent() {
        return Ok(Some(ExitDecision {
            action: ExitAction::Full,
            reason: ExitReason::LossCutCritical,
        }));
    }
    if net <= -params.emergency_loss_pct {
        return Ok(Some(ExitDecision {
            action: ExitAction::Full,
            reason: ExitReason::EmergencyLoss,
        }));
    }
    Ok(None)
}

// =============================================================================
// Price levels
// =============================================================================

/// SL level from ATR × multiplier when ATR is fresh, otherwise the fixed
/// percent. Both come from the resolved parameter record.
fn stop_loss_price(position: &Position, params: &crate::params::ParamRecord, atr: Option<f64>) -> f64 {
    let distance = match atr {
        Some(atr) if atr > 0.0 => atr * params.sl_atr_multiplier,
        _ => position.entry_price * params.sl_percent / 100.0,
    };
    match position.side {
        Side::Long => position.entry_price - distance,
        Side::Short => position.entry_price + distance,
    }
}

fn take_profit_price(
    position: &Position,
    params: &crate::params::ParamRecord,
    atr: Option<f64>,
) -> f64 {
    let distance = match atr {
        Some(atr) if atr > 0.0 => atr * params.tp_atr_multiplier,
        _ => position.entry_price * params.tp_percent / 100.0,
    };
    match position.side {
        Side::Long => position.entry_price + distance,
        Side::Short => position.entry_price - distance,
    }
}

// =============================================================================
// Tests — including the literal end-to-end scenarios
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BotConfig, ParamTable};
    use crate::params::{ParamProvider, ParamRecord};
    use crate::position::Position;

    fn params_with(fields: &[(&str, serde_json::Value)]) -> ParamRecord {
        let mut cfg = BotConfig::default();
        let mut table = ParamTable::new();
        table.insert("tp_percent".into(), serde_json::json!(1.0));
        table.insert("sl_percent".into(), serde_json::json!(0.8));
        table.insert("leverage".into(), serde_json::json!(10));
        for (k, v) in fields {
            table.insert(k.to_string(), v.clone());
        }
        cfg.adaptive_regime.insert("ranging".into(), table.clone());
        cfg.adaptive_regime.insert("trending".into(), table);
        ParamProvider::from_config(&cfg)
            .resolve("BTC-USDT-SWAP", Regime::Ranging)
            .unwrap()
    }

    fn position(side: Side, entry: f64, regime: Regime) -> Position {
        Position {
            symbol: "BTC-USDT-SWAP".into(),
            side,
            entry_price: entry,
            size: 100.0,
            leverage: 10.0,
            margin_used: 10.0,
            entry_time_ms: 0,
            regime_at_entry: regime,
            peak_profit_pct: 0.0,
            peak_profit_time_ms: 0,
            partial_tp_executed: false,
            closing_in_progress: false,
        }
    }

    fn ctx(price: f64, now_ms: i64) -> ExitContext {
        ExitContext {
            current_price: price,
            price_is_fallback: false,
            now_ms,
            atr: None,
            reversal_score: None,
            trend_strength: None,
            smart_close: SmartCloseConfig::default(),
        }
    }

    // Scenario 1 — Long TP in ranging: entry 100, ATR 2.0, tp_atr 2.5,
    // sl_atr 2.0, min_holding 0.5 min; price 105.00 at t = 36 s.
    #[test]
    fn scenario_long_tp_ranging() {
        let params = params_with(&[
            ("tp_atr_multiplier", serde_json::json!(2.5)),
            ("sl_atr_multiplier", serde_json::json!(2.0)),
            ("min_holding_minutes", serde_json::json!(0.5)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);
        let mut c = ctx(105.0, 36_000);
        c.atr = Some(2.0);

        // TP level = 100 + 2.0 * 2.5 = 105.0, held 36 s >= 30 s.
        let eval = evaluate(&pos, &params, 0.001, 0.0002, 0.0005, &c).unwrap();
        let decision = eval.decision.expect("tp should fire");
        assert_eq!(decision.reason, ExitReason::TakeProfit);
        assert_eq!(decision.action, ExitAction::Full);
        // Gross: 100 × 0.001 × 5 = 0.5 USD on 10 margin = +5% × leverage-free
        assert!(eval.pnl.gross_usd > 0.0);
    }

    // Scenario 2 — Short critical loss cut: entry 100, 10x, loss_cut 3%,
    // critical 6%; price 100.7 after 5 s → net ≈ −7.7% of margin.
    #[test]
    fn scenario_short_critical_loss_bypasses_min_holding() {
        let params = params_with(&[
            ("loss_cut_percent", serde_json::json!(3.0)),
            ("min_holding_minutes", serde_json::json!(0.5)),
        ]);
        let pos = position(Side::Short, 100.0, Regime::Ranging);
        let c = ctx(100.7, 5_000); // 5 s — well inside min holding

        // 100 contracts × 0.01 ctVal × 100 = 100 USD notional on 10 margin.
        let eval = evaluate(&pos, &params, 0.01, 0.0002, 0.0005, &c).unwrap();
        let decision = eval.decision.expect("critical cut should fire");
        assert_eq!(decision.reason, ExitReason::LossCutCritical);
        assert!(eval.pnl.net_pct_of_margin <= -6.0);
    }

    // Scenario 3 — Partial TP: trigger 1.5%, fraction 0.5; price 100.2 at
    // 10x ≈ +1.6% net of margin.
    #[test]
    fn scenario_partial_tp() {
        let params = params_with(&[
            ("partial_tp_trigger", serde_json::json!(1.5)),
            ("partial_tp_fraction", serde_json::json!(0.5)),
            ("min_holding_minutes", serde_json::json!(0.5)),
            // keep price-based TP out of the way for this scenario
            ("tp_percent", serde_json::json!(5.0)),
            ("ph_threshold_percent", serde_json::json!(50.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);
        let c = ctx(100.2, 60_000);

        // +0.2% price × 10x = +2% gross; fees 0.4% → net ≈ +1.6% of margin.
        let eval = evaluate(&pos, &params, 0.01, 0.0001, 0.0003, &c).unwrap();
        let decision = eval.decision.expect("partial tp should fire");
        assert_eq!(decision.reason, ExitReason::PartialTp);
        assert_eq!(decision.action, ExitAction::Partial { fraction: 0.5 });
        assert!((eval.pnl.net_pct_of_margin - 1.6).abs() < 0.05);

        // Once executed, the same conditions do not fire again.
        let mut done = position(Side::Long, 100.0, Regime::Ranging);
        done.partial_tp_executed = true;
        let eval = evaluate(&done, &params, 0.01, 0.0001, 0.0003, &c).unwrap();
        assert!(eval.decision.is_none());
    }

    // Scenario 4 — Fallback price: anchored on entry, fees suppressed,
    // no action, and definitely no loss cut from a phantom −100%.
    #[test]
    fn scenario_fallback_price_no_false_loss_cut() {
        let params = params_with(&[("min_holding_minutes", serde_json::json!(0.5))]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);
        let mut c = ctx(100.0, 300_000);
        c.price_is_fallback = true;

        let eval = evaluate(&pos, &params, 0.001, 0.0002, 0.0005, &c).unwrap();
        assert_eq!(eval.pnl.net_pct_of_margin, 0.0);
        assert!(eval.decision.is_none());
    }

    #[test]
    fn standard_loss_cut_waits_for_min_holding() {
        let params = params_with(&[
            ("loss_cut_percent", serde_json::json!(3.0)),
            ("min_holding_minutes", serde_json::json!(1.0)),
            ("emergency_loss_pct", serde_json::json!(10.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);

        // Net ≈ −4%: above critical (−6%), below standard (−3%).
        let early = ctx(99.67, 10_000);
        let eval = evaluate(&pos, &params, 0.01, 0.0002, 0.0005, &early).unwrap();
        assert!(eval.decision.is_none(), "min holding must gate the standard cut");

        let later = ctx(99.67, 120_000);
        let eval = evaluate(&pos, &params, 0.01, 0.0002, 0.0005, &later).unwrap();
        assert_eq!(eval.decision.unwrap().reason, ExitReason::LossCut);
    }

    #[test]
    fn timeout_only_closes_non_losing() {
        let params = params_with(&[
            ("max_holding_minutes", serde_json::json!(1.0)),
            ("min_holding_minutes", serde_json::json!(0.1)),
            ("loss_cut_percent", serde_json::json!(50.0)),
            ("emergency_loss_pct", serde_json::json!(60.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);

        // Losing position past max holding: no timeout close.
        let losing = ctx(99.9, 120_000);
        let eval = evaluate(&pos, &params, 0.01, 0.0, 0.0, &losing).unwrap();
        assert!(eval.decision.is_none());

        // Winning position past max holding: timeout closes.
        let winning = ctx(100.05, 120_000);
        let eval = evaluate(&pos, &params, 0.01, 0.0, 0.0, &winning).unwrap();
        assert_eq!(eval.decision.unwrap().reason, ExitReason::MaxHoldingTimeout);
    }

    #[test]
    fn trending_winner_timeout_extension() {
        let params = params_with(&[
            ("max_holding_minutes", serde_json::json!(1.0)),
            ("min_holding_minutes", serde_json::json!(0.1)),
            ("tp_percent", serde_json::json!(50.0)),
            ("ph_threshold_percent", serde_json::json!(500.0)),
            ("partial_tp_trigger", serde_json::json!(400.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Trending);
        let mut c = ctx(100.1, 120_000); // +0.1% price × 10x = +1% of margin
        c.trend_strength = Some(0.9);

        let eval = evaluate(&pos, &params, 0.01, 0.0, 0.0, &c).unwrap();
        assert!(eval.pnl.net_pct_of_margin > 0.3);
        assert!(eval.decision.is_none(), "strong trend should extend holding");

        // Weak trend: timeout applies.
        c.trend_strength = Some(0.2);
        let eval = evaluate(&pos, &params, 0.01, 0.0, 0.0, &c).unwrap();
        assert_eq!(eval.decision.unwrap().reason, ExitReason::MaxHoldingTimeout);
    }

    #[test]
    fn emergency_fires_inside_min_holding() {
        let params = params_with(&[
            ("loss_cut_percent", serde_json::json!(30.0)), // critical = 60%
            ("emergency_loss_pct", serde_json::json!(4.0)),
            ("min_holding_minutes", serde_json::json!(5.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);
        let c = ctx(99.5, 5_000); // net ≈ −5.7%

        let eval = evaluate(&pos, &params, 0.01, 0.0002, 0.0005, &c).unwrap();
        assert_eq!(eval.decision.unwrap().reason, ExitReason::EmergencyLoss);
    }

    #[test]
    fn min_profit_gate_skips_optimistic_for_losers() {
        let params = params_with(&[
            ("min_holding_minutes", serde_json::json!(0.1)),
            ("min_profit_to_close", serde_json::json!(0.05)),
            ("loss_cut_percent", serde_json::json!(50.0)),
            ("emergency_loss_pct", serde_json::json!(60.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);

        // Slightly losing, with a huge reversal score that would otherwise
        // trigger the reversal exit.
        let mut c = ctx(99.97, 60_000);
        c.reversal_score = Some(0.95);

        let eval = evaluate(&pos, &params, 0.001, 0.0002, 0.0005, &c).unwrap();
        assert!(eval.decision.is_none(), "gated loser must skip optimistic exits");
    }

    #[test]
    fn peak_watermark_reported_not_regressed() {
        let params = params_with(&[("min_holding_minutes", serde_json::json!(5.0))]);
        let mut pos = position(Side::Long, 100.0, Regime::Ranging);
        pos.peak_profit_pct = 2.0;

        // Net below the stored peak: no new watermark.
        let eval = evaluate(&pos, &params, 0.01, 0.0002, 0.0005, &ctx(100.1, 1_000)).unwrap();
        assert!(eval.new_peak_pct.is_none());

        // Net above the stored peak: watermark reported for commit.
        let eval = evaluate(&pos, &params, 0.01, 0.0002, 0.0005, &ctx(100.5, 2_000)).unwrap();
        assert!(eval.new_peak_pct.unwrap() > 2.0);
    }

    #[test]
    fn fast_path_catches_critical_and_emergency() {
        let params = params_with(&[
            ("loss_cut_percent", serde_json::json!(3.0)),
            ("emergency_loss_pct", serde_json::json!(4.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);

        // Critical first (−6% beats −4% in priority order).
        let decision = evaluate_fast_path(&pos, &params, 0.01, 0.0002, 0.0005, 99.3)
            .unwrap()
            .unwrap();
        assert_eq!(decision.reason, ExitReason::LossCutCritical);

        // Between emergency and critical: emergency.
        let decision = evaluate_fast_path(&pos, &params, 0.01, 0.0002, 0.0005, 99.55)
            .unwrap()
            .unwrap();
        assert_eq!(decision.reason, ExitReason::EmergencyLoss);

        // Healthy: nothing.
        assert!(evaluate_fast_path(&pos, &params, 0.01, 0.0002, 0.0005, 100.2)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sl_uses_param_multiplier_not_constants() {
        let tight = params_with(&[
            ("sl_atr_multiplier", serde_json::json!(1.0)),
            ("min_holding_minutes", serde_json::json!(0.1)),
            ("loss_cut_percent", serde_json::json!(90.0)),
            ("emergency_loss_pct", serde_json::json!(95.0)),
        ]);
        let wide = params_with(&[
            ("sl_atr_multiplier", serde_json::json!(3.0)),
            ("min_holding_minutes", serde_json::json!(0.1)),
            ("loss_cut_percent", serde_json::json!(90.0)),
            ("emergency_loss_pct", serde_json::json!(95.0)),
        ]);
        let pos = position(Side::Long, 100.0, Regime::Ranging);
        let mut c = ctx(98.5, 60_000);
        c.atr = Some(1.0);

        // SL at 99.0 with 1× ATR: hit. SL at 97.0 with 3× ATR: not hit.
        let eval = evaluate(&pos, &tight, 0.0001, 0.0, 0.0, &c).unwrap();
        assert_eq!(eval.decision.unwrap().reason, ExitReason::StopLoss);

        let eval = evaluate(&pos, &wide, 0.0001, 0.0, 0.0, &c).unwrap();
        assert_ne!(
            eval.decision.map(|d| d.reason),
            Some(ExitReason::StopLoss)
        );
    }
}
