// =============================================================================
// Risk Manager — margin gates and daily circuit breakers
// =============================================================================
//
// Two layers protect capital:
//
//   Margin gates (per order, fail closed):
//     - per-trade margin cap as a share of equity,
//     - portfolio margin cap across all open positions,
//     - maintenance-margin ratio floor after the new position,
//     - one position per symbol,
//     - global position cap from the balance profile.
//
//   Daily circuit breakers:
//     - daily loss %, consecutive losses, intraday drawdown, trades per day,
//     - manual kill switch.
//
// Daily statistics reset automatically when the UTC date rolls over.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;

/// Snapshot of the risk state for status logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub risk_mode: String,
    pub equity_usd: f64,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub daily_trades_count: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub max_drawdown_today_pct: f64,
    pub current_date: String,
}

struct Inner {
    equity_usd: f64,
    session_start_equity: f64,
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
    max_drawdown_today: f64,
    peak_equity_today: f64,
    current_date: String,
    killed: bool,
}

pub struct RiskManager {
    state: RwLock<Inner>,
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig, starting_equity_usd: f64) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            equity = starting_equity_usd,
            max_daily_loss_pct = config.max_daily_loss_pct,
            max_consecutive_losses = config.max_consecutive_losses,
            max_trades_per_day = config.max_trades_per_day,
            "risk manager initialised"
        );

        Self {
            state: RwLock::new(Inner {
                equity_usd: starting_equity_usd,
                session_start_equity: starting_equity_usd,
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
                max_drawdown_today: 0.0,
                peak_equity_today: starting_equity_usd,
                current_date: today,
                killed: false,
            }),
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Equity tracking
    // -------------------------------------------------------------------------

    /// Update equity from the latest exchange balance read.
    pub fn set_equity(&self, equity_usd: f64) {
        if equity_usd > 0.0 {
            self.state.write().equity_usd = equity_usd;
        }
    }

    pub fn equity(&self) -> f64 {
        self.state.read().equity_usd
    }

    // -------------------------------------------------------------------------
    // Margin gates (per order)
    // -------------------------------------------------------------------------

    /// Check every margin gate for a prospective order. Returns the blocking
    /// reason code, or `None` when all gates pass.
    #[allow(clippy::too_many_arguments)]
    pub fn margin_gate(
        &self,
        margin_required_usd: f64,
        notional_usd: f64,
        margins_in_use_usd: f64,
        notional_in_use_usd: f64,
        open_position_count: usize,
        symbol_has_position: bool,
        max_positions: usize,
    ) -> Option<&'static str> {
        let equity = self.equity();
        if equity <= 0.0 {
            return Some("margin_guard");
        }

        if symbol_has_position {
            return Some("symbol_position_exists");
        }

        if open_position_count >= max_positions {
            return Some("max_positions");
        }

        if margin_required_usd > self.config.max_margin_per_trade_pct / 100.0 * equity {
            return Some("margin_guard");
        }

        if margins_in_use_usd + margin_required_usd
            > self.config.max_portfolio_margin_pct / 100.0 * equity
        {
            return Some("margin_guard");
        }

        // Maintenance ratio: equity over total notional after the new
        // position must stay above the configured floor.
        let total_notional = notional_in_use_usd + notional_usd;
        if total_notional > 0.0 && equity / total_notional < self.config.maintenance_margin_floor {
            return Some("maintenance_margin");
        }

        None
    }

    // -------------------------------------------------------------------------
    // Daily circuit breakers
    // -------------------------------------------------------------------------

    /// Record the realized PnL of a completed trade.
    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;
        s.equity_usd += pnl;

        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }

        if s.equity_usd > s.peak_equity_today {
            s.peak_equity_today = s.equity_usd;
        }
        let drawdown = if s.peak_equity_today > 0.0 {
            (s.peak_equity_today - s.equity_usd) / s.peak_equity_today
        } else {
            0.0
        };
        if drawdown > s.max_drawdown_today {
            s.max_drawdown_today = drawdown;
        }

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            daily_trades = s.daily_trades_count,
            "trade result recorded"
        );
    }

    /// Whether the breakers permit a new trade right now.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return (false, Some("kill switch activated".to_string()));
        }

        let base = s.session_start_equity.max(1.0);
        let daily_loss_pct = (-s.daily_pnl) / base * 100.0;
        if daily_loss_pct >= self.config.max_daily_loss_pct {
            let msg = format!(
                "daily loss breaker: {:.2}% lost (limit {:.2}%)",
                daily_loss_pct, self.config.max_daily_loss_pct
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.consecutive_losses >= self.config.max_consecutive_losses {
            let msg = format!(
                "consecutive loss breaker: {} in a row (limit {})",
                s.consecutive_losses, self.config.max_consecutive_losses
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.max_drawdown_today * 100.0 >= self.config.max_drawdown_pct {
            let msg = format!(
                "drawdown breaker: {:.2}% (limit {:.2}%)",
                s.max_drawdown_today * 100.0,
                self.config.max_drawdown_pct
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.daily_trades_count >= self.config.max_trades_per_day {
            let msg = format!(
                "trade limit breaker: {} trades today (limit {})",
                s.daily_trades_count, self.config.max_trades_per_day
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        (true, None)
    }

    /// Block all trading until the process restarts.
    pub fn kill(&self) {
        self.state.write().killed = true;
        warn!("kill switch activated — all trading halted");
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        self.maybe_reset_daily();
        let s = self.state.read();
        let base = s.session_start_equity.max(1.0);

        RiskSnapshot {
            risk_mode: if s.killed {
                "KILLED".to_string()
            } else if !self.breakers_clear(&s) {
                "BREAKER_TRIPPED".to_string()
            } else {
                "Normal".to_string()
            },
            equity_usd: s.equity_usd,
            daily_pnl: s.daily_pnl,
            daily_pnl_pct: s.daily_pnl / base * 100.0,
            consecutive_losses: s.consecutive_losses,
            daily_trades_count: s.daily_trades_count,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            max_drawdown_today_pct: s.max_drawdown_today * 100.0,
            current_date: s.current_date.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn breakers_clear(&self, s: &Inner) -> bool {
        let base = s.session_start_equity.max(1.0);
        (-s.daily_pnl) / base * 100.0 < self.config.max_daily_loss_pct
            && s.consecutive_losses < self.config.max_consecutive_losses
            && s.max_drawdown_today * 100.0 < self.config.max_drawdown_pct
            && s.daily_trades_count < self.config.max_trades_per_day
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Re-check under the write lock; another task may have reset already.
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            s.daily_pnl = 0.0;
            s.consecutive_losses = 0;
            s.daily_trades_count = 0;
            s.daily_wins = 0;
            s.daily_losses = 0;
            s.max_drawdown_today = 0.0;
            s.peak_equity_today = s.equity_usd;
            s.session_start_equity = s.equity_usd;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskManager")
            .field("equity_usd", &s.equity_usd)
            .field("daily_pnl", &s.daily_pnl)
            .field("daily_trades", &s.daily_trades_count)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(equity: f64) -> RiskManager {
        RiskManager::new(RiskConfig::default(), equity)
    }

    #[test]
    fn margin_gates_pass_small_trade() {
        let rm = manager(10_000.0);
        // 50 USD margin on 500 notional, nothing else open.
        assert_eq!(rm.margin_gate(50.0, 500.0, 0.0, 0.0, 0, false, 9), None);
    }

    #[test]
    fn per_trade_margin_cap() {
        let rm = manager(1_000.0);
        // Default cap 10% of equity = 100 USD.
        assert_eq!(
            rm.margin_gate(150.0, 1_500.0, 0.0, 0.0, 0, false, 9),
            Some("margin_guard")
        );
    }

    #[test]
    fn portfolio_margin_cap() {
        let rm = manager(1_000.0);
        // Default portfolio cap 40% = 400 USD; 350 in use + 80 new > 400.
        assert_eq!(
            rm.margin_gate(80.0, 800.0, 350.0, 3_500.0, 3, false, 9),
            Some("margin_guard")
        );
    }

    #[test]
    fn one_position_per_symbol() {
        let rm = manager(10_000.0);
        assert_eq!(
            rm.margin_gate(50.0, 500.0, 0.0, 0.0, 1, true, 9),
            Some("symbol_position_exists")
        );
    }

    #[test]
    fn global_position_cap() {
        let rm = manager(10_000.0);
        assert_eq!(
            rm.margin_gate(50.0, 500.0, 400.0, 4_000.0, 9, false, 9),
            Some("max_positions")
        );
    }

    #[test]
    fn maintenance_floor() {
        let rm = manager(1_000.0);
        // 60k notional against 1k equity: ratio 1.6% < 2% floor.
        assert_eq!(
            rm.margin_gate(90.0, 30_000.0, 10.0, 30_000.0, 1, false, 9),
            Some("maintenance_margin")
        );
    }

    #[test]
    fn daily_loss_breaker_trips() {
        let rm = manager(1_000.0);
        assert!(rm.can_trade().0);

        // Default 3% daily loss limit.
        rm.record_trade_result(-35.0);
        let (allowed, reason) = rm.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("daily loss"));
    }

    #[test]
    fn consecutive_loss_breaker_resets_on_win() {
        let rm = manager(100_000.0);
        for _ in 0..4 {
            rm.record_trade_result(-1.0);
        }
        assert!(rm.can_trade().0);

        rm.record_trade_result(2.0); // win resets the streak
        for _ in 0..4 {
            rm.record_trade_result(-1.0);
        }
        assert!(rm.can_trade().0);

        rm.record_trade_result(-1.0); // fifth in a row
        assert!(!rm.can_trade().0);
    }

    #[test]
    fn kill_switch_blocks() {
        let rm = manager(10_000.0);
        rm.kill();
        let (allowed, reason) = rm.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("kill switch"));
        assert_eq!(rm.snapshot().risk_mode, "KILLED");
    }

    #[test]
    fn snapshot_tracks_wins_and_losses() {
        let rm = manager(10_000.0);
        rm.record_trade_result(10.0);
        rm.record_trade_result(-4.0);
        let snap = rm.snapshot();
        assert_eq!(snap.daily_wins, 1);
        assert_eq!(snap.daily_losses, 1);
        assert!((snap.daily_pnl - 6.0).abs() < 1e-9);
        assert!((snap.equity_usd - 10_006.0).abs() < 1e-9);
    }
}
