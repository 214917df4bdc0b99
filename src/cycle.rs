// =============================================================================
// Trading Cycle — per-symbol entry evaluation and the exit pass
// =============================================================================
//
// Every cycle, for each symbol:
//   regime classification → signal generation → filter pipeline → risk gates
//   and sizing → order submission,
// then every live position runs through the full exit decision engine.
//
// Discipline: snapshot under short locks, release, then do I/O, then commit
// through the guarded registries. A slow cycle (over the configured budget)
// flips the `degraded` flag for the next one, which skips REST-derived
// filters.
//
// The fast path is a separate task fed by the tickers channel: on every tick
// for a symbol with a live position it runs only the loss-cut/emergency
// subset plus the trailing stop.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::executor::OrderExecutor;
use crate::exits::{self, ExitAction, ExitContext, ExitReason};
use crate::gateway::client::OkxClient;
use crate::journal::{SignalRecord, TradeRecord};
use crate::market_data::{Candle, CandleKey};
use crate::position::{Position, PositionMetadata, PositionSource};
use crate::risk::{compute_size, select_leverage};
use crate::signals::{self, FilterInputs};
use crate::types::{PricePurpose, Side, Timeframe};

/// Candles handed to the signal generator and regime classifier.
const SIGNAL_LOOKBACK: usize = 200;

/// Run one full trading cycle over all configured symbols.
pub async fn run_trading_cycle(
    state: &Arc<AppState>,
    client: &Arc<OkxClient>,
    executor: &Arc<OrderExecutor>,
    degraded: bool,
) {
    let symbols = state.config.symbols.clone();

    for symbol in &symbols {
        if let Err(e) = evaluate_symbol_entry(state, executor, symbol, degraded).await {
            state.count_reason(e.reason_code());
            debug!(symbol, error = %e, "entry evaluation ended early");
        }
    }

    run_exit_pass(state, client, executor).await;
}

// =============================================================================
// Entry evaluation
// =============================================================================

async fn evaluate_symbol_entry(
    state: &Arc<AppState>,
    executor: &Arc<OrderExecutor>,
    symbol: &str,
    degraded: bool,
) -> crate::error::Result<()> {
    // One position per symbol: a live position means exits only.
    if state.positions.has(symbol).await {
        return Ok(());
    }

    let key_1m = CandleKey::new(symbol, Timeframe::M1);
    let closed_count = state.market.candles.closed_count(&key_1m);
    if closed_count < state.config.scalping.min_candles_for_signals {
        debug!(symbol, closed_count, "insufficient candles buffered");
        return Ok(());
    }

    // Price freshness gates signal work for the symbol.
    state
        .market
        .get_price_cached(symbol, PricePurpose::Signals)?;

    let candles_1m = state.market.candles.get_closed(&key_1m, SIGNAL_LOOKBACK);
    let Some(snapshot) = state.market.get_indicators(symbol) else {
        debug!(symbol, "indicators not ready");
        return Ok(());
    };

    // Regime first; signals adapt to it.
    let regime_state = state.regimes.classify(symbol, &candles_1m, &snapshot);
    let params = state.params.resolve(symbol, regime_state.regime)?;
    let strong_adx = state.regimes.thresholds().strong_adx;

    let now_ms = Utc::now().timestamp_millis();
    let generation = signals::generate(
        symbol,
        &candles_1m,
        &snapshot,
        &regime_state,
        &params,
        strong_adx,
        now_ms,
    );
    for &reason in &generation.rejections {
        state.count_reason(reason);
    }
    if generation.signals.is_empty() {
        return Ok(());
    }

    // Snapshot filter inputs once per symbol.
    let inputs = build_filter_inputs(state, symbol, degraded).await;

    for mut signal in generation.signals {
        let outcome = signals::run_filters(
            &signal,
            &params,
            &state.config.futures_modules.filters,
            &state.config.risk,
            &regime_state,
            strong_adx,
            &inputs,
        );

        if let Some(reason) = outcome.blocked {
            state.count_reason(reason);
            let record = SignalRecord::from_signal(&signal, false, Some(reason.to_string()));
            if let Err(e) = state.journal.record_signal(&record) {
                warn!(symbol, error = %e, "failed to journal rejected signal");
            }
            continue;
        }

        signal.strength = outcome.effective_strength;
        signal.filters_passed.extend(outcome.passed.iter().cloned());

        match submit_signal(state, executor, &signal, &params, regime_state.volatility_pct).await {
            Ok(()) => {
                let record = SignalRecord::from_signal(&signal, true, None);
                if let Err(e) = state.journal.record_signal(&record) {
                    warn!(symbol, error = %e, "failed to journal executed signal");
                }
                // Per-symbol cap: one entry this cycle.
                break;
            }
            Err(reason) => {
                state.count_reason(reason);
                let record = SignalRecord::from_signal(&signal, false, Some(reason.to_string()));
                if let Err(e) = state.journal.record_signal(&record) {
                    warn!(symbol, error = %e, "failed to journal rejected signal");
                }
            }
        }
    }

    Ok(())
}

/// Size, gate, and submit one accepted signal. Returns the stable reason
/// code on rejection.
async fn submit_signal(
    state: &Arc<AppState>,
    executor: &Arc<OrderExecutor>,
    signal: &crate::signals::Signal,
    params: &crate::params::ParamRecord,
    volatility_pct: f64,
) -> Result<(), &'static str> {
    let symbol = &signal.symbol;

    let (allowed, reason) = state.risk.can_trade();
    if !allowed {
        debug!(symbol, reason = ?reason, "blocked by circuit breaker");
        return Err("risk_breaker");
    }

    let Some(instrument) = state.instrument(symbol) else {
        return Err("instrument_missing");
    };

    let leverage = select_leverage(signal.strength, signal.regime, volatility_pct);

    let equity = state.risk.equity();
    let profile = state.config.balance_profiles.select(equity);

    let size = compute_size(
        profile,
        params.regime_size_multiplier,
        params.size_multiplier,
        signal.strength,
        &instrument,
        signal.suggested_price,
        leverage,
    )
    .map_err(|e| {
        debug!(symbol, error = %e, "sizing failed");
        "sizing_failed"
    })?;

    let margins_in_use = state.positions.total_margin_usd().await;
    let notional_in_use = state.positions.total_notional_usd().await;
    let open_count = state.positions.count().await;
    let has_position = state.positions.has(symbol).await;

    if let Some(reason) = state.risk.margin_gate(
        size.margin_usd,
        size.notional_usd,
        margins_in_use,
        notional_in_use,
        open_count,
        has_position,
        profile.max_positions,
    ) {
        debug!(symbol, reason, margin = size.margin_usd, "margin gate rejected order");
        return Err(reason);
    }

    let outcome = executor
        .submit_entry(signal, size.contracts, leverage, params, &instrument)
        .await
        .map_err(|e| {
            warn!(symbol, error = %e, "order submission failed");
            state.push_error(format!("order failed for {symbol}: {e}"), None);
            e.reason_code()
        })?;

    let entry_price = outcome.effective_price;
    let filled = outcome.filled_size;
    let margin_used = filled * instrument.ct_val * entry_price / leverage;
    let now_ms = Utc::now().timestamp_millis();

    let position = Position {
        symbol: symbol.clone(),
        side: signal.side,
        entry_price,
        size: filled,
        leverage,
        margin_used,
        entry_time_ms: now_ms,
        regime_at_entry: signal.regime,
        peak_profit_pct: 0.0,
        peak_profit_time_ms: now_ms,
        partial_tp_executed: false,
        closing_in_progress: false,
    };
    let metadata = PositionMetadata::new(
        PositionSource::Entry,
        instrument.ct_val,
        instrument.maker_fee,
        instrument.taker_fee,
        params.clone(),
        Some(outcome.order_id.clone()),
    );

    if let Err(e) = state.positions.register(position, metadata).await {
        // The order is live but the book refused it — loud and visible.
        error!(symbol, error = %e, order_id = %outcome.order_id, "position registration failed after fill");
        state.push_error(format!("unregistered fill on {symbol}: {e}"), None);
        return Err("invariant_violation");
    }

    state
        .trailing
        .lock()
        .insert(symbol.clone(), exits::TrailingStop::new(signal.side, entry_price));

    info!(
        symbol,
        side = %signal.side,
        entry_price,
        size = filled,
        leverage,
        strength = signal.strength,
        regime = %signal.regime,
        "position opened"
    );
    Ok(())
}

async fn build_filter_inputs(state: &Arc<AppState>, symbol: &str, degraded: bool) -> FilterInputs {
    let key_1m = CandleKey::new(symbol, Timeframe::M1);
    let key_5m = CandleKey::new(symbol, Timeframe::M5);
    let key_1h = CandleKey::new(symbol, Timeframe::H1);
    let key_1d = CandleKey::new(symbol, Timeframe::D1);

    let mut open_position_closes = Vec::new();
    for (position, _) in state.positions.snapshot_all().await {
        let closes = state
            .market
            .candles
            .get_closes(&CandleKey::new(&position.symbol, Timeframe::M1), 80);
        open_position_closes.push((position.symbol, closes));
    }

    FilterInputs {
        book: state.market.books.get(symbol),
        day_volume_usd: state.market.day_volume(symbol),
        funding_rate: state.market.funding_rate(symbol),
        closes_5m: state.market.candles.get_closes(&key_5m, 80),
        closes_1h: state.market.candles.get_closes(&key_1h, 80),
        daily_candle: state.market.candles.last_closed(&key_1d),
        closes_1m: state.market.candles.get_closes(&key_1m, 80),
        open_position_closes,
        recent_1m: state.market.candles.get_closed(&key_1m, 100),
        degraded,
    }
}

// =============================================================================
// Exit pass
// =============================================================================

/// Evaluate the full exit decision engine for every live position.
pub async fn run_exit_pass(
    state: &Arc<AppState>,
    client: &Arc<OkxClient>,
    executor: &Arc<OrderExecutor>,
) {
    let positions = state.positions.snapshot_all().await;
    if positions.is_empty() {
        return;
    }

    for (position, metadata) in positions {
        let symbol = position.symbol.clone();

        // Price with the exit tier; stale data anchors on the entry price.
        let (current_price, price_is_fallback) = match state
            .market
            .get_price(client, &symbol, PricePurpose::ExitAnalysis)
            .await
        {
            Ok(sample) => (sample.price, false),
            Err(e) => {
                state.count_reason(e.reason_code());
                warn!(symbol, error = %e, "exit price unavailable — anchoring on entry");
                (position.entry_price, true)
            }
        };

        let snapshot = state.market.get_indicators(&symbol);
        let atr = snapshot.as_ref().map(|s| s.atr);
        let imbalance = state.market.books.imbalance(&symbol);
        let candles_1m = state
            .market
            .candles
            .get_closed(&CandleKey::new(&symbol, Timeframe::M1), 5);
        let smart_close = state.config.futures_modules.smart_close.clone();
        let reversal_score =
            compute_reversal_score(position.side, &candles_1m, imbalance, &smart_close);
        let trend_strength = state.regimes.current(&symbol).map(|r| r.trending_score);

        let now_ms = Utc::now().timestamp_millis();
        let ctx = ExitContext {
            current_price,
            price_is_fallback,
            now_ms,
            atr,
            reversal_score,
            trend_strength,
            smart_close,
        };

        let evaluation = match exits::evaluate(
            &position,
            &metadata.params,
            metadata.ct_val,
            metadata.maker_fee,
            metadata.taker_fee,
            &ctx,
        ) {
            Ok(eval) => eval,
            Err(e) => {
                state.count_reason(e.reason_code());
                error!(symbol, error = %e, "exit evaluation failed");
                continue;
            }
        };

        if let Some(peak) = evaluation.new_peak_pct {
            state.positions.update_peak(&symbol, peak, now_ms).await;
        }

        if let Some(decision) = evaluation.decision {
            match decision.action {
                ExitAction::Full => {
                    close_full(state, executor, &position, &metadata, decision.reason, current_price)
                        .await;
                }
                ExitAction::Partial { fraction } => {
                    close_partial(
                        state,
                        executor,
                        &position,
                        fraction,
                        evaluation.pnl.net_usd,
                        evaluation.pnl.net_pct_of_margin,
                    )
                    .await;
                }
            }
            continue;
        }

        // Trailing stop runs when nothing in the priority list fired.
        if state.config.futures_modules.trailing_sl.enabled && !price_is_fallback {
            let hit = {
                let mut trailing = state.trailing.lock();
                match trailing.get_mut(&symbol) {
                    Some(tsl) => tsl.update(
                        current_price,
                        Some(evaluation.pnl.net_pct_of_margin),
                        position.margin_used,
                        &metadata.params,
                        &state.config.futures_modules.trailing_sl,
                        now_ms,
                    ),
                    None => false,
                }
            };
            let past_min_holding =
                position.minutes_held(now_ms) >= metadata.params.min_holding_minutes;
            if hit && past_min_holding {
                close_full(
                    state,
                    executor,
                    &position,
                    &metadata,
                    ExitReason::TrailingStop,
                    current_price,
                )
                .await;
            }
        }
    }
}

/// Fully close a position: claim the exclusion, place the reduce-only order,
/// remove from the registry, journal, and feed the risk counters.
pub async fn close_full(
    state: &Arc<AppState>,
    executor: &Arc<OrderExecutor>,
    position: &Position,
    metadata: &PositionMetadata,
    reason: ExitReason,
    _reference_price: f64,
) {
    let symbol = &position.symbol;

    if !state.positions.mark_closing(symbol).await {
        state.count_reason("already_closing");
        debug!(symbol, reason = %reason, "close skipped — already closing");
        return;
    }

    let outcome = match executor
        .close_position(symbol, position.side, position.size)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            state.count_reason(e.reason_code());
            state.push_error(format!("close failed for {symbol}: {e}"), None);
            error!(symbol, error = %e, "close order failed — releasing claim");
            state.positions.clear_closing(symbol).await;
            return;
        }
    };

    // Realized PnL from the actual fill, not the trigger price.
    let realized = exits::compute_pnl(
        position.side,
        position.entry_price,
        outcome.effective_price,
        position.size,
        metadata.ct_val,
        position.margin_used,
        position.leverage,
        metadata.maker_fee,
        metadata.taker_fee,
        true,
    );

    let (realized_usd, fees_usd) = match realized {
        Ok(pnl) => (pnl.net_usd, pnl.fees_usd),
        Err(e) => {
            error!(symbol, error = %e, "realized pnl computation failed — recording zero");
            (0.0, outcome.fees_usd)
        }
    };
    let total_realized = realized_usd + metadata.partial_realized_usd;

    if let Some(closed) = state
        .positions
        .remove(symbol, outcome.effective_price, total_realized, fees_usd, reason.code())
        .await
    {
        state.trailing.lock().remove(symbol);
        state.risk.record_trade_result(total_realized);
        if let Err(e) = state.journal.record_trade(&TradeRecord::from(&closed)) {
            warn!(symbol, error = %e, "failed to journal closed trade");
        }
        info!(
            symbol,
            reason = %reason,
            exit_price = outcome.effective_price,
            realized_pnl = total_realized,
            "position closed"
        );
    }
}

async fn close_partial(
    state: &Arc<AppState>,
    executor: &Arc<OrderExecutor>,
    position: &Position,
    fraction: f64,
    net_usd_full: f64,
    net_pct_of_margin: f64,
) {
    let symbol = &position.symbol;

    if !state.positions.mark_closing(symbol).await {
        state.count_reason("already_closing");
        return;
    }

    let close_size = position.size * fraction;
    match executor.close_position(symbol, position.side, close_size).await {
        Ok(outcome) => {
            // The closed slice realizes its share of the current PnL.
            let realized_slice = net_usd_full * fraction;
            if let Err(e) = state
                .positions
                .apply_partial_close(symbol, fraction, realized_slice, net_pct_of_margin, Utc::now().timestamp_millis())
                .await
            {
                error!(symbol, error = %e, "partial close bookkeeping failed");
            }
            // Trailing re-anchors on the remaining position.
            {
                let mut trailing = state.trailing.lock();
                trailing.insert(
                    symbol.clone(),
                    exits::TrailingStop::new(position.side, position.entry_price),
                );
            }
            info!(
                symbol,
                fraction,
                fill_price = outcome.effective_price,
                realized_slice,
                "partial take-profit executed"
            );
        }
        Err(e) => {
            state.count_reason(e.reason_code());
            state.push_error(format!("partial close failed for {symbol}: {e}"), None);
            state.positions.clear_closing(symbol).await;
        }
    }
}

// =============================================================================
// Fast path — tick-driven exit checks
// =============================================================================

/// Consume tick notifications and run the loss-cut/emergency subset plus the
/// trailing stop for symbols with a live position.
pub async fn run_fast_path(
    state: Arc<AppState>,
    executor: Arc<OrderExecutor>,
    mut tick_rx: UnboundedReceiver<String>,
) {
    info!("fast-path exit checker started");

    while let Some(symbol) = tick_rx.recv().await {
        let Some((position, metadata)) = state.positions.get(&symbol).await else {
            continue;
        };
        if position.closing_in_progress {
            continue;
        }

        let Ok(sample) = state
            .market
            .get_price_cached(&symbol, PricePurpose::ExitAnalysis)
        else {
            continue;
        };

        // Critical loss cut + emergency floor.
        match exits::evaluate_fast_path(
            &position,
            &metadata.params,
            metadata.ct_val,
            metadata.maker_fee,
            metadata.taker_fee,
            sample.price,
        ) {
            Ok(Some(decision)) => {
                close_full(&state, &executor, &position, &metadata, decision.reason, sample.price)
                    .await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                state.count_reason(e.reason_code());
                continue;
            }
        }

        // Trailing stop on the same tick.
        if state.config.futures_modules.trailing_sl.enabled {
            let net_pct = exits::compute_pnl(
                position.side,
                position.entry_price,
                sample.price,
                position.size,
                metadata.ct_val,
                position.margin_used,
                position.leverage,
                metadata.maker_fee,
                metadata.taker_fee,
                true,
            )
            .map(|p| p.net_pct_of_margin)
            .ok();

            let now_ms = Utc::now().timestamp_millis();
            let hit = {
                let mut trailing = state.trailing.lock();
                match trailing.get_mut(&symbol) {
                    Some(tsl) => tsl.update(
                        sample.price,
                        net_pct,
                        position.margin_used,
                        &metadata.params,
                        &state.config.futures_modules.trailing_sl,
                        now_ms,
                    ),
                    None => false,
                }
            };
            let past_min_holding =
                position.minutes_held(now_ms) >= metadata.params.min_holding_minutes;
            if hit && past_min_holding {
                close_full(
                    &state,
                    &executor,
                    &position,
                    &metadata,
                    ExitReason::TrailingStop,
                    sample.price,
                )
                .await;
            }
        }
    }

    warn!("fast-path channel closed — checker exiting");
}

// =============================================================================
// Reversal scoring — candle pattern + order flow
// =============================================================================

/// Score an against-position reversal in [0, 1] from the last closed candles
/// and the current book imbalance. Weights come from the smart-close config
/// when set; the default split is 0.6 on the candle pattern, 0.4 on flow.
fn compute_reversal_score(
    side: Side,
    candles_1m: &[Candle],
    imbalance: Option<f64>,
    smart_close: &crate::config::SmartCloseConfig,
) -> Option<f64> {
    if candles_1m.len() < 2 {
        return None;
    }

    let (weight_candle, weight_flow) = {
        let sum = smart_close.weight_candle + smart_close.weight_orderflow;
        if smart_close.enabled && sum > 0.0 {
            (
                smart_close.weight_candle / sum,
                smart_close.weight_orderflow / sum,
            )
        } else {
            (0.6, 0.4)
        }
    };
    let last = &candles_1m[candles_1m.len() - 1];
    let prev = &candles_1m[candles_1m.len() - 2];

    let last_body = last.close - last.open;
    let prev_body = prev.close - prev.open;

    // Engulfing against the position: an opposing body that swallows the
    // prior bar's body.
    let candle_against = match side {
        Side::Long => last_body < 0.0 && last_body.abs() > prev_body.abs(),
        Side::Short => last_body > 0.0 && last_body.abs() > prev_body.abs(),
    };
    let candle_component = if candle_against { 1.0 } else { 0.0 };

    let flow_component = match imbalance {
        Some(imb) => {
            let adverse = match side {
                Side::Long => (-imb).max(0.0),
                Side::Short => imb.max(0.0),
            };
            adverse.min(1.0)
        }
        None => 0.0,
    };

    Some((weight_candle * candle_component + weight_flow * flow_component).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmartCloseConfig;

    fn sc() -> SmartCloseConfig {
        SmartCloseConfig::default()
    }

    fn candle(open: f64, close: f64) -> Candle {
        Candle::new(
            0,
            open,
            open.max(close) + 0.1,
            open.min(close) - 0.1,
            close,
            10.0,
            1_000.0,
            true,
        )
    }

    #[test]
    fn reversal_score_engulfing_against_long() {
        // Small up bar, then a big down bar: classic reversal against longs.
        let candles = vec![candle(100.0, 100.2), candle(100.2, 99.5)];
        let score = compute_reversal_score(Side::Long, &candles, Some(-0.5), &sc()).unwrap();
        assert!(score >= 0.7, "expected strong reversal score, got {score}");

        // Same tape read by a short: no reversal.
        let score = compute_reversal_score(Side::Short, &candles, Some(-0.5), &sc()).unwrap();
        assert!(score < 0.5);
    }

    #[test]
    fn reversal_score_needs_history() {
        assert!(compute_reversal_score(Side::Long, &[], None, &sc()).is_none());
        assert!(compute_reversal_score(Side::Long, &[candle(1.0, 1.1)], None, &sc()).is_none());
    }

    #[test]
    fn flow_only_reversal_is_moderate() {
        // Bullish candle but heavy ask pressure against a long.
        let candles = vec![candle(100.0, 100.1), candle(100.1, 100.3)];
        let score = compute_reversal_score(Side::Long, &candles, Some(-1.0), &sc()).unwrap();
        assert!((score - 0.4).abs() < 1e-9);
    }
}
