// =============================================================================
// Trailing Stop-Loss Controller — profit-widened, ratcheting trail
// =============================================================================
//
// Per-position state machine:
//   - Arms once net PnL (% of margin) reaches the activation threshold.
//   - `peak_price` ratchets monotonically in the profitable direction.
//   - The trail width grows with profit from `trailing_initial` toward
//     `trailing_max`, never below `trailing_min` (all in % of price).
//   - Above the high-profit threshold the trail tightens by the configured
//     factor to lock in gains.
//   - Stop price = peak × (1 − trail) for longs, mirrored for shorts.
//
// The controller is fed `margin_used` and the computed net PnL on every
// update. An update without valid margin data drops into the legacy
// price-only estimate — logged loudly, because that mode ignores leverage
// and fees and must not become the default.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrailingSlConfig;
use crate::params::ParamRecord;
use crate::types::Side;

/// Per-position trailing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStop {
    pub side: Side,
    pub entry_price: f64,
    pub active: bool,
    /// Best price seen since activation (highest for long, lowest for short).
    pub peak_price: f64,
    /// Current trail width in % of price.
    pub current_trail_pct: f64,
    pub last_update_ms: i64,
    /// Whether the high-profit tightening mode is engaged.
    pub high_profit_mode: bool,
}

impl TrailingStop {
    pub fn new(side: Side, entry_price: f64) -> Self {
        Self {
            side,
            entry_price,
            active: false,
            peak_price: entry_price,
            current_trail_pct: 0.0,
            last_update_ms: 0,
            high_profit_mode: false,
        }
    }

    /// Current stop price, meaningful only while active.
    pub fn stop_price(&self) -> f64 {
        match self.side {
            Side::Long => self.peak_price * (1.0 - self.current_trail_pct / 100.0),
            Side::Short => self.peak_price * (1.0 + self.current_trail_pct / 100.0),
        }
    }

    /// Feed a price update. `net_pnl_pct` is the position's net PnL as % of
    /// margin; `None` forces the deprecated price-only fallback.
    ///
    /// Returns `true` when the stop is crossed (caller still enforces the
    /// minimum holding time).
    pub fn update(
        &mut self,
        current_price: f64,
        net_pnl_pct: Option<f64>,
        margin_used: f64,
        params: &ParamRecord,
        config: &TrailingSlConfig,
        now_ms: i64,
    ) -> bool {
        if current_price <= 0.0 {
            return false;
        }
        self.last_update_ms = now_ms;

        let profit_pct = match net_pnl_pct {
            Some(pct) if margin_used > 0.0 => pct,
            _ => {
                // Legacy price-only estimate: % move from entry, no leverage,
                // no fees. Kept for resilience, flagged every time.
                warn!(
                    entry = self.entry_price,
                    price = current_price,
                    "trailing stop missing margin/pnl inputs — price-only fallback"
                );
                (current_price - self.entry_price) / self.entry_price
                    * 100.0
                    * self.side.sign()
            }
        };

        // --- Activation ----------------------------------------------------
        if !self.active {
            if profit_pct >= params.trailing_min_profit_to_activate {
                self.active = true;
                self.peak_price = current_price;
                self.current_trail_pct = params.trailing_initial.max(params.trailing_min);
                info!(
                    side = %self.side,
                    peak = self.peak_price,
                    trail_pct = self.current_trail_pct,
                    profit_pct,
                    "trailing stop activated"
                );
            }
            return false;
        }

        // --- Peak ratchet ---------------------------------------------------
        match self.side {
            Side::Long if current_price > self.peak_price => self.peak_price = current_price,
            Side::Short if current_price < self.peak_price => self.peak_price = current_price,
            _ => {}
        }

        // --- Trail width: widen with profit, tighten in high-profit mode ---
        let span = (config.high_profit_threshold - params.trailing_min_profit_to_activate)
            .max(f64::EPSILON);
        let progress = ((profit_pct - params.trailing_min_profit_to_activate) / span)
            .clamp(0.0, 1.0);
        let candidate =
            params.trailing_initial + (params.trailing_max - params.trailing_initial) * progress;

        self.high_profit_mode = profit_pct >= config.high_profit_threshold;
        self.current_trail_pct = if self.high_profit_mode {
            // Lock-in mode: the tightened width replaces the ratchet.
            (candidate * config.high_profit_max_factor).max(params.trailing_min)
        } else {
            // The width only ratchets wider; a profit pullback must not
            // yank the stop upward through the price.
            candidate
                .max(self.current_trail_pct)
                .max(params.trailing_min)
        };

        let stop = self.stop_price();
        let hit = match self.side {
            Side::Long => current_price <= stop,
            Side::Short => current_price >= stop,
        };

        debug!(
            side = %self.side,
            price = current_price,
            peak = self.peak_price,
            trail_pct = self.current_trail_pct,
            stop,
            high_profit = self.high_profit_mode,
            hit,
            "trailing stop updated"
        );

        hit
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::Regime;

    fn params() -> ParamRecord {
        use crate::config::BotConfig;
        use crate::params::ParamProvider;

        let mut cfg = BotConfig::default();
        let mut table = crate::config::ParamTable::new();
        table.insert("tp_percent".into(), serde_json::json!(1.0));
        table.insert("sl_percent".into(), serde_json::json!(0.8));
        table.insert("leverage".into(), serde_json::json!(10));
        table.insert("trailing_initial".into(), serde_json::json!(0.3));
        table.insert("trailing_max".into(), serde_json::json!(1.2));
        table.insert("trailing_min".into(), serde_json::json!(0.15));
        table.insert(
            "trailing_min_profit_to_activate".into(),
            serde_json::json!(0.5),
        );
        cfg.adaptive_regime.insert("ranging".into(), table);
        ParamProvider::from_config(&cfg)
            .resolve("BTC-USDT-SWAP", Regime::Ranging)
            .unwrap()
    }

    fn config() -> TrailingSlConfig {
        TrailingSlConfig::default() // high_profit_threshold 2.0, factor 0.5
    }

    #[test]
    fn arms_only_above_activation_threshold() {
        let mut tsl = TrailingStop::new(Side::Long, 100.0);
        let p = params();
        let c = config();

        assert!(!tsl.update(100.1, Some(0.2), 10.0, &p, &c, 1));
        assert!(!tsl.active);

        assert!(!tsl.update(100.2, Some(0.6), 10.0, &p, &c, 2));
        assert!(tsl.active);
        assert!((tsl.peak_price - 100.2).abs() < 1e-12);
    }

    #[test]
    fn peak_ratchets_and_stop_follows() {
        let mut tsl = TrailingStop::new(Side::Long, 100.0);
        let p = params();
        let c = config();

        tsl.update(100.2, Some(0.6), 10.0, &p, &c, 1); // activate
        tsl.update(101.0, Some(1.0), 10.0, &p, &c, 2);
        let stop_at_101 = tsl.stop_price();
        assert!((tsl.peak_price - 101.0).abs() < 1e-12);

        // Price eases back: peak holds, stop holds.
        tsl.update(100.8, Some(0.8), 10.0, &p, &c, 3);
        assert!((tsl.peak_price - 101.0).abs() < 1e-12);
        assert!(tsl.stop_price() <= stop_at_101 + 1e-9);
    }

    #[test]
    fn trail_widens_with_profit() {
        let mut tsl = TrailingStop::new(Side::Long, 100.0);
        let p = params();
        let c = config();

        tsl.update(100.2, Some(0.6), 10.0, &p, &c, 1);
        tsl.update(100.3, Some(0.7), 10.0, &p, &c, 2);
        let narrow = tsl.current_trail_pct;

        tsl.update(101.5, Some(1.8), 10.0, &p, &c, 3);
        let wide = tsl.current_trail_pct;
        assert!(
            wide > narrow,
            "trail should widen with profit: {wide} vs {narrow}"
        );
        assert!(wide <= p.trailing_max + 1e-9);
    }

    #[test]
    fn high_profit_mode_tightens() {
        let mut tsl = TrailingStop::new(Side::Long, 100.0);
        let p = params();
        let c = config();

        tsl.update(100.2, Some(0.6), 10.0, &p, &c, 1);
        tsl.update(101.5, Some(1.9), 10.0, &p, &c, 2);
        let before = tsl.current_trail_pct;
        assert!(!tsl.high_profit_mode);

        tsl.update(102.5, Some(2.5), 10.0, &p, &c, 3);
        assert!(tsl.high_profit_mode);
        assert!(
            tsl.current_trail_pct < before,
            "high-profit mode should tighten: {} vs {before}",
            tsl.current_trail_pct
        );
        assert!(tsl.current_trail_pct >= p.trailing_min - 1e-9);
    }

    #[test]
    fn long_stop_crossing_triggers() {
        let mut tsl = TrailingStop::new(Side::Long, 100.0);
        let p = params();
        let c = config();

        tsl.update(100.6, Some(0.6), 10.0, &p, &c, 1); // activate at peak 100.6
        let stop = tsl.stop_price();
        assert!(stop < 100.6);

        let hit = tsl.update(stop - 0.01, Some(0.1), 10.0, &p, &c, 2);
        assert!(hit);
    }

    #[test]
    fn short_side_is_mirrored() {
        let mut tsl = TrailingStop::new(Side::Short, 100.0);
        let p = params();
        let c = config();

        tsl.update(99.4, Some(0.6), 10.0, &p, &c, 1); // activate
        assert!(tsl.active);
        assert!(tsl.stop_price() > 99.4);

        // Further drop ratchets the peak down.
        tsl.update(99.0, Some(1.0), 10.0, &p, &c, 2);
        assert!((tsl.peak_price - 99.0).abs() < 1e-12);

        // Rally through the stop triggers.
        let hit = tsl.update(tsl.stop_price() + 0.01, Some(0.2), 10.0, &p, &c, 3);
        assert!(hit);
    }

    #[test]
    fn price_only_fallback_still_works() {
        let mut tsl = TrailingStop::new(Side::Long, 100.0);
        let p = params();
        let c = config();

        // No margin/pnl inputs: price moved +0.6% from entry, enough to arm.
        tsl.update(100.6, None, 0.0, &p, &c, 1);
        assert!(tsl.active);
    }
}
