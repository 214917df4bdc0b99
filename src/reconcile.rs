// =============================================================================
// Drift Reconciliation — local registry vs the exchange's authoritative list
// =============================================================================
//
// Runs once per reconcile interval:
//   1. Refresh equity from the exchange balance.
//   2. Positions the exchange reports but the registry does not know are
//      imported with best-effort metadata (entry time from cTime, regime from
//      the current classification, TP/SL params from the provider) and
//      flagged as drift additions; the exit engine starts managing them on
//      the next cycle.
//   3. Positions the registry holds but the exchange no longer does are
//      closed locally with the realized PnL derived from the last known
//      price.
//
// An exchange row whose side cannot be parsed is skipped and logged — never
// imported with a guessed direction.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::Result;
use crate::exits::{self, ExitReason};
use crate::gateway::client::OkxClient;
use crate::journal::TradeRecord;
use crate::position::{Position, PositionMetadata, PositionSource};
use crate::regime::Regime;
use crate::types::{PricePurpose, Side};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub matched: usize,
    pub drift_added: usize,
    pub drift_closed: usize,
}

pub async fn reconcile_once(
    state: &Arc<AppState>,
    client: &Arc<OkxClient>,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    // 1. Equity refresh.
    match client.get_balance().await {
        Ok(equity) if equity > 0.0 => state.risk.set_equity(equity),
        Ok(_) => warn!("exchange reported non-positive equity"),
        Err(e) => warn!(error = %e, "balance refresh failed"),
    }

    // 2. Exchange view.
    let exchange_positions = client.get_positions().await?;
    let exchange_symbols: HashSet<String> = exchange_positions
        .iter()
        .map(|p| p.symbol.clone())
        .collect();

    // 2a. Import exchange-only positions.
    for exch in &exchange_positions {
        if state.positions.has(&exch.symbol).await {
            summary.matched += 1;
            continue;
        }

        let side = match Side::parse(&exch.side) {
            Ok(side) => side,
            Err(e) => {
                state.count_reason(e.reason_code());
                warn!(symbol = %exch.symbol, raw_side = %exch.side, "drift import skipped — unparsable side");
                continue;
            }
        };

        let regime = state
            .regimes
            .current(&exch.symbol)
            .map(|r| r.regime)
            .unwrap_or(Regime::Ranging);

        let params = match state.params.resolve(&exch.symbol, regime) {
            Ok(params) => params,
            Err(e) => {
                state.count_reason(e.reason_code());
                warn!(symbol = %exch.symbol, error = %e, "drift import skipped — params unresolved");
                continue;
            }
        };

        let Some(instrument) = state.instrument(&exch.symbol) else {
            warn!(symbol = %exch.symbol, "drift import skipped — unknown instrument");
            continue;
        };

        let entry_time_ms = if exch.c_time_ms > 0 {
            exch.c_time_ms
        } else {
            exch.u_time_ms
        };

        let leverage = exch.leverage.max(1.0);
        let margin = if exch.margin > 0.0 {
            exch.margin
        } else {
            exch.size * instrument.ct_val * exch.avg_entry / leverage
        };

        let position = Position {
            symbol: exch.symbol.clone(),
            side,
            entry_price: exch.avg_entry,
            size: exch.size,
            leverage,
            margin_used: margin,
            entry_time_ms,
            regime_at_entry: regime,
            peak_profit_pct: 0.0,
            peak_profit_time_ms: entry_time_ms,
            partial_tp_executed: false,
            closing_in_progress: false,
        };
        let metadata = PositionMetadata::new(
            PositionSource::DriftAdd,
            instrument.ct_val,
            instrument.maker_fee,
            instrument.taker_fee,
            params,
            None,
        );

        match state.positions.register(position, metadata).await {
            Ok(()) => {
                state
                    .trailing
                    .lock()
                    .insert(exch.symbol.clone(), exits::TrailingStop::new(side, exch.avg_entry));
                state.count_reason("drift_add");
                summary.drift_added += 1;
                info!(
                    symbol = %exch.symbol,
                    side = %side,
                    entry = exch.avg_entry,
                    size = exch.size,
                    "drift position imported"
                );
            }
            Err(e) => {
                state.count_reason(e.reason_code());
                warn!(symbol = %exch.symbol, error = %e, "drift import rejected by registry");
            }
        }
    }

    // 2b. Close registry-only positions locally.
    for (position, metadata) in state.positions.snapshot_all().await {
        if exchange_symbols.contains(&position.symbol) {
            continue;
        }

        let exit_price = state
            .market
            .get_price_cached(&position.symbol, PricePurpose::General)
            .map(|s| s.price)
            .unwrap_or(position.entry_price);

        let realized = exits::compute_pnl(
            position.side,
            position.entry_price,
            exit_price,
            position.size,
            metadata.ct_val,
            position.margin_used,
            position.leverage,
            metadata.maker_fee,
            metadata.taker_fee,
            exit_price != position.entry_price,
        )
        .map(|p| (p.net_usd, p.fees_usd))
        .unwrap_or((0.0, 0.0));

        let total = realized.0 + metadata.partial_realized_usd;
        if let Some(closed) = state
            .positions
            .remove(
                &position.symbol,
                exit_price,
                total,
                realized.1,
                ExitReason::DriftClose.code(),
            )
            .await
        {
            state.trailing.lock().remove(&position.symbol);
            state.risk.record_trade_result(total);
            state.count_reason("drift_close");
            summary.drift_closed += 1;
            if let Err(e) = state.journal.record_trade(&TradeRecord::from(&closed)) {
                warn!(symbol = %closed.symbol, error = %e, "failed to journal drift close");
            }
            info!(
                symbol = %closed.symbol,
                exit_price,
                realized_pnl = total,
                "registry-only position closed locally"
            );
        }
    }

    debug!(
        matched = summary.matched,
        drift_added = summary.drift_added,
        drift_closed = summary.drift_closed,
        "reconciliation pass complete"
    );
    Ok(summary)
}
