// =============================================================================
// Position Registry — authoritative store of live positions
// =============================================================================
//
// All mutations are linearized through a single async mutex. One position per
// symbol (netting mode). `mark_closing` provides the exclusion that prevents
// the fast-path tick check and the periodic cycle from closing the same
// position twice: the losing branch gets `false` and walks away.
//
// Registration validates the money invariants up front — a position with
// zero size, zero entry price, sub-1 leverage, or zero margin is refused,
// never stored and "fixed up" later.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::params::ParamRecord;
use crate::regime::Regime;
use crate::types::Side;

/// How a position entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    /// Opened by our own executor.
    Entry,
    /// Imported from the exchange during drift reconciliation.
    DriftAdd,
}

/// A live position. Exclusively owned by the registry; consumers work on
/// deep copies from `snapshot_all` and commit mutations back through the
/// guarded API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Remaining open size in contracts (reduced by partial closes).
    pub size: f64,
    pub leverage: f64,
    pub margin_used: f64,
    pub entry_time_ms: i64,
    pub regime_at_entry: Regime,
    /// Highest net PnL % of margin seen. Monotone, except the reset after a
    /// partial close re-bases it on the remaining position.
    pub peak_profit_pct: f64,
    pub peak_profit_time_ms: i64,
    pub partial_tp_executed: bool,
    pub closing_in_progress: bool,
}

impl Position {
    /// Notional exposure at entry, in quote currency.
    pub fn notional_usd(&self) -> f64 {
        self.margin_used * self.leverage
    }

    /// Minutes since entry.
    pub fn minutes_held(&self, now_ms: i64) -> f64 {
        ((now_ms - self.entry_time_ms).max(0)) as f64 / 60_000.0
    }
}

/// Per-position bookkeeping that travels alongside the position itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMetadata {
    pub position_id: String,
    pub source: PositionSource,
    /// Contract value of the instrument, captured at entry.
    pub ct_val: f64,
    /// Per-side fees, captured at entry — the single source of truth for
    /// this position's PnL math.
    pub maker_fee: f64,
    pub taker_fee: f64,
    /// Parameters resolved for (symbol, regime_at_entry).
    pub params: ParamRecord,
    pub entry_order_id: Option<String>,
    /// Realized PnL accumulated by partial closes; folded into the single
    /// realized record when the position finally closes.
    pub partial_realized_usd: f64,
}

impl PositionMetadata {
    pub fn new(
        source: PositionSource,
        ct_val: f64,
        maker_fee: f64,
        taker_fee: f64,
        params: ParamRecord,
        entry_order_id: Option<String>,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4().to_string(),
            source,
            ct_val,
            maker_fee,
            taker_fee,
            params,
            entry_order_id,
            partial_realized_usd: 0.0,
        }
    }
}

/// One realized-PnL record per closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub entry_time_ms: i64,
    pub exit_time_ms: i64,
    pub regime: Regime,
    pub realized_pnl_usd: f64,
    pub fees_usd: f64,
    pub exit_reason: String,
}

#[derive(Default)]
struct Book {
    positions: HashMap<String, (Position, PositionMetadata)>,
}

/// Thread-safe registry; every access goes through one async mutex.
pub struct PositionRegistry {
    book: Mutex<Book>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(Book::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a new position. Fails closed on invariant violations and on
    /// a duplicate symbol.
    pub async fn register(&self, position: Position, metadata: PositionMetadata) -> Result<()> {
        if position.size <= 0.0
            || position.entry_price <= 0.0
            || position.leverage < 1.0
            || position.margin_used <= 0.0
        {
            return Err(EngineError::InvariantViolation(format!(
                "refusing position for {}: size={} entry={} lev={} margin={}",
                position.symbol,
                position.size,
                position.entry_price,
                position.leverage,
                position.margin_used
            )));
        }

        let mut book = self.book.lock().await;
        if book.positions.contains_key(&position.symbol) {
            return Err(EngineError::InvariantViolation(format!(
                "position already exists for {}",
                position.symbol
            )));
        }

        info!(
            symbol = %position.symbol,
            side = %position.side,
            entry_price = position.entry_price,
            size = position.size,
            leverage = position.leverage,
            margin = position.margin_used,
            source = ?metadata.source,
            position_id = %metadata.position_id,
            "position registered"
        );

        book.positions
            .insert(position.symbol.clone(), (position, metadata));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get(&self, symbol: &str) -> Option<(Position, PositionMetadata)> {
        self.book.lock().await.positions.get(symbol).cloned()
    }

    pub async fn has(&self, symbol: &str) -> bool {
        self.book.lock().await.positions.contains_key(symbol)
    }

    /// Deep copies of every live position, safe to iterate without the lock.
    pub async fn snapshot_all(&self) -> Vec<(Position, PositionMetadata)> {
        self.book.lock().await.positions.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.book.lock().await.positions.len()
    }

    /// Total margin committed across live positions.
    pub async fn total_margin_usd(&self) -> f64 {
        self.book
            .lock()
            .await
            .positions
            .values()
            .map(|(p, _)| p.margin_used)
            .sum()
    }

    /// Total notional exposure across live positions.
    pub async fn total_notional_usd(&self) -> f64 {
        self.book
            .lock()
            .await
            .positions
            .values()
            .map(|(p, _)| p.notional_usd())
            .sum()
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Raise the peak profit watermark. Values below the current peak are
    /// ignored — the watermark only moves up between partial-close resets.
    pub async fn update_peak(&self, symbol: &str, net_pnl_pct: f64, now_ms: i64) {
        let mut book = self.book.lock().await;
        if let Some((position, _)) = book.positions.get_mut(symbol) {
            if net_pnl_pct > position.peak_profit_pct {
                position.peak_profit_pct = net_pnl_pct;
                position.peak_profit_time_ms = now_ms;
            }
        }
    }

    /// Claim the exclusive right to close a position. Returns `false` when a
    /// concurrent path got there first.
    pub async fn mark_closing(&self, symbol: &str) -> bool {
        let mut book = self.book.lock().await;
        match book.positions.get_mut(symbol) {
            Some((position, _)) if !position.closing_in_progress => {
                position.closing_in_progress = true;
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Release a close claim after a failed close attempt so a later cycle
    /// can retry.
    pub async fn clear_closing(&self, symbol: &str) {
        let mut book = self.book.lock().await;
        if let Some((position, _)) = book.positions.get_mut(symbol) {
            position.closing_in_progress = false;
        }
    }

    /// Apply a partial close: shrink size and margin by `fraction`, bank the
    /// realized slice, and re-base the peak on the remaining position's
    /// current PnL.
    pub async fn apply_partial_close(
        &self,
        symbol: &str,
        fraction: f64,
        realized_usd: f64,
        current_net_pnl_pct: f64,
        now_ms: i64,
    ) -> Result<()> {
        let mut book = self.book.lock().await;
        let (position, metadata) = book.positions.get_mut(symbol).ok_or_else(|| {
            EngineError::InvariantViolation(format!("partial close on unknown position {symbol}"))
        })?;

        if !(0.0..1.0).contains(&fraction) || fraction == 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "partial close fraction {fraction} out of (0, 1)"
            )));
        }

        position.size *= 1.0 - fraction;
        position.margin_used *= 1.0 - fraction;
        position.partial_tp_executed = true;
        position.closing_in_progress = false;
        metadata.partial_realized_usd += realized_usd;
        // Peak resets to the remaining position's PnL, not to zero.
        position.peak_profit_pct = current_net_pnl_pct;
        position.peak_profit_time_ms = now_ms;

        info!(
            symbol,
            fraction,
            remaining_size = position.size,
            new_peak_pct = position.peak_profit_pct,
            "partial close applied"
        );
        Ok(())
    }

    /// Remove a position, producing its realized-PnL record. A second remove
    /// of the same symbol is a benign no-op returning `None`.
    pub async fn remove(
        &self,
        symbol: &str,
        exit_price: f64,
        realized_pnl_usd: f64,
        fees_usd: f64,
        exit_reason: &str,
    ) -> Option<ClosedPosition> {
        let mut book = self.book.lock().await;
        let (position, _metadata) = match book.positions.remove(symbol) {
            Some(entry) => entry,
            None => {
                warn!(symbol, "remove on unknown position — already closed");
                return None;
            }
        };

        let record = ClosedPosition {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            entry_time_ms: position.entry_time_ms,
            exit_time_ms: Utc::now().timestamp_millis(),
            regime: position.regime_at_entry,
            realized_pnl_usd,
            fees_usd,
            exit_reason: exit_reason.to_string(),
        };

        info!(
            symbol,
            reason = exit_reason,
            realized_pnl = realized_pnl_usd,
            exit_price,
            "position removed"
        );

        Some(record)
    }
}

impl Default for PositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionRegistry").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParamRecord {
        use crate::config::BotConfig;
        use crate::params::ParamProvider;

        let mut cfg = BotConfig::default();
        let mut table = crate::config::ParamTable::new();
        table.insert("tp_percent".into(), serde_json::json!(1.0));
        table.insert("sl_percent".into(), serde_json::json!(0.8));
        table.insert("leverage".into(), serde_json::json!(10));
        cfg.adaptive_regime.insert("ranging".into(), table);
        ParamProvider::from_config(&cfg)
            .resolve("BTC-USDT-SWAP", Regime::Ranging)
            .unwrap()
    }

    fn position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            size: 10.0,
            leverage: 10.0,
            margin_used: 100.0,
            entry_time_ms: 0,
            regime_at_entry: Regime::Ranging,
            peak_profit_pct: 0.0,
            peak_profit_time_ms: 0,
            partial_tp_executed: false,
            closing_in_progress: false,
        }
    }

    fn metadata() -> PositionMetadata {
        PositionMetadata::new(PositionSource::Entry, 0.01, 0.0002, 0.0005, params(), None)
    }

    #[tokio::test]
    async fn register_and_remove_restores_empty() {
        let registry = PositionRegistry::new();
        registry.register(position("BTC-USDT-SWAP"), metadata()).await.unwrap();
        assert_eq!(registry.count().await, 1);

        let record = registry
            .remove("BTC-USDT-SWAP", 101.0, 10.0, 0.5, "tp")
            .await
            .unwrap();
        assert_eq!(record.exit_reason, "tp");
        assert_eq!(registry.count().await, 0);

        // Double-remove is a no-op.
        assert!(registry.remove("BTC-USDT-SWAP", 101.0, 0.0, 0.0, "tp").await.is_none());
    }

    #[tokio::test]
    async fn invariants_enforced_at_register() {
        let registry = PositionRegistry::new();

        let mut bad = position("X");
        bad.size = 0.0;
        assert!(registry.register(bad, metadata()).await.is_err());

        let mut bad = position("X");
        bad.entry_price = 0.0;
        assert!(registry.register(bad, metadata()).await.is_err());

        let mut bad = position("X");
        bad.leverage = 0.5;
        assert!(registry.register(bad, metadata()).await.is_err());

        let mut bad = position("X");
        bad.margin_used = 0.0;
        assert!(registry.register(bad, metadata()).await.is_err());
    }

    #[tokio::test]
    async fn one_position_per_symbol() {
        let registry = PositionRegistry::new();
        registry.register(position("ETH-USDT-SWAP"), metadata()).await.unwrap();
        let err = registry
            .register(position("ETH-USDT-SWAP"), metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn mark_closing_excludes_second_closer() {
        let registry = PositionRegistry::new();
        registry.register(position("BTC-USDT-SWAP"), metadata()).await.unwrap();

        assert!(registry.mark_closing("BTC-USDT-SWAP").await);
        assert!(!registry.mark_closing("BTC-USDT-SWAP").await);

        registry.clear_closing("BTC-USDT-SWAP").await;
        assert!(registry.mark_closing("BTC-USDT-SWAP").await);
    }

    #[tokio::test]
    async fn peak_is_monotonic_until_partial_reset() {
        let registry = PositionRegistry::new();
        registry.register(position("BTC-USDT-SWAP"), metadata()).await.unwrap();

        registry.update_peak("BTC-USDT-SWAP", 1.5, 1_000).await;
        registry.update_peak("BTC-USDT-SWAP", 0.8, 2_000).await; // ignored
        let (pos, _) = registry.get("BTC-USDT-SWAP").await.unwrap();
        assert!((pos.peak_profit_pct - 1.5).abs() < 1e-12);
        assert_eq!(pos.peak_profit_time_ms, 1_000);

        // Partial close re-bases the peak on the remaining position.
        registry
            .apply_partial_close("BTC-USDT-SWAP", 0.5, 0.8, 0.6, 3_000)
            .await
            .unwrap();
        let (pos, meta) = registry.get("BTC-USDT-SWAP").await.unwrap();
        assert!((pos.peak_profit_pct - 0.6).abs() < 1e-12);
        assert!(pos.partial_tp_executed);
        assert!((pos.size - 5.0).abs() < 1e-12);
        assert!((pos.margin_used - 50.0).abs() < 1e-12);
        assert!((meta.partial_realized_usd - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn partial_close_validates_fraction() {
        let registry = PositionRegistry::new();
        registry.register(position("BTC-USDT-SWAP"), metadata()).await.unwrap();

        assert!(registry
            .apply_partial_close("BTC-USDT-SWAP", 0.0, 0.0, 0.0, 0)
            .await
            .is_err());
        assert!(registry
            .apply_partial_close("BTC-USDT-SWAP", 1.0, 0.0, 0.0, 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn totals_aggregate_margins_and_notional() {
        let registry = PositionRegistry::new();
        registry.register(position("BTC-USDT-SWAP"), metadata()).await.unwrap();

        let mut second = position("ETH-USDT-SWAP");
        second.margin_used = 50.0;
        second.leverage = 5.0;
        registry.register(second, metadata()).await.unwrap();

        assert!((registry.total_margin_usd().await - 150.0).abs() < 1e-9);
        assert!((registry.total_notional_usd().await - (1000.0 + 250.0)).abs() < 1e-9);
    }
}
