// =============================================================================
// Order Executor — signal in, filled (or failed) order out
// =============================================================================
//
// Entry flow:
//   1. Fetch a fresh reference price (purpose=orders, 1 s TTL). A signal
//      whose suggested price drifted more than `stale_signal_pct` from the
//      reference is re-anchored on the reference.
//   2. Pick the order kind: post-only limit at `offset` from the best quote
//      on the entry side (buy below best bid, sell above best ask) when the
//      offset is positive and volatility is calm; market otherwise.
//   3. Set leverage, then place. A 51006 "price out of band" reject refetches
//      the exchange limits, clamps, and retries exactly once.
//   4. Wait up to `max_wait_seconds` for the fill. An unfilled limit whose
//      market moved toward it gets one amendment; one that ran away is
//      cancelled and (if allowed) replayed as a market order.
//
// Exits are reduce-only market orders — getting flat beats fee optimisation.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LimitOrderConfig;
use crate::error::{EngineError, Result};
use crate::gateway::client::{OkxClient, OrderKind, OrderState, PriceLimits};
use crate::market_data::MarketDataRegistry;
use crate::params::ParamRecord;
use crate::signals::Signal;
use crate::types::{Instrument, PricePurpose, Side};

/// Poll interval while waiting for a fill.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A completed (possibly partially filled) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderOutcome {
    pub order_id: String,
    pub kind: OrderKind,
    pub effective_price: f64,
    pub filled_size: f64,
    /// Fees paid, positive USD.
    pub fees_usd: f64,
}

pub struct OrderExecutor {
    client: Arc<OkxClient>,
    registry: Arc<MarketDataRegistry>,
    config: LimitOrderConfig,
}

impl OrderExecutor {
    pub fn new(
        client: Arc<OkxClient>,
        registry: Arc<MarketDataRegistry>,
        config: LimitOrderConfig,
    ) -> Self {
        Self {
            client,
            registry,
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    pub async fn submit_entry(
        &self,
        signal: &Signal,
        size_contracts: f64,
        leverage: f64,
        params: &ParamRecord,
        instrument: &Instrument,
    ) -> Result<OrderOutcome> {
        let symbol = &signal.symbol;

        // 1. Fresh reference price; replace a drifted signal price.
        let reference = self
            .registry
            .get_price(&self.client, symbol, PricePurpose::Orders)
            .await?
            .price;

        let mut anchor = signal.suggested_price;
        if deviation_pct(anchor, reference) > self.config.stale_signal_pct {
            warn!(
                symbol,
                suggested = anchor,
                reference,
                "signal price stale — re-anchoring on reference"
            );
            anchor = reference;
        }

        // 2. Order kind.
        let volatility = signal.indicators.volatility_pct();
        let offset = params.limit_offset_percent;
        let use_market =
            offset <= 0.0 || volatility > self.config.market_order_volatility_pct;

        // 3. Leverage precedes the order; the position inherits it.
        self.client.set_leverage(symbol, leverage).await?;

        if use_market {
            debug!(symbol, volatility, offset, "placing market entry");
            return self
                .place_market(symbol, signal.side, size_contracts, false)
                .await;
        }

        // Post-only limit offset from the entry side of the book.
        let book = self.registry.books.get(symbol);
        let (best_bid, best_ask) = book
            .map(|b| (b.best_bid, b.best_ask))
            .unwrap_or((anchor, anchor));
        let limit_price = limit_entry_price(
            signal.side,
            best_bid,
            best_ask,
            offset,
            instrument.tick_size,
        );

        self.place_limit_with_band_retry(
            symbol,
            signal.side,
            size_contracts,
            limit_price,
            params.max_wait_seconds,
            instrument,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    /// Close `size_contracts` of a position with a reduce-only market order.
    pub async fn close_position(
        &self,
        symbol: &str,
        position_side: Side,
        size_contracts: f64,
    ) -> Result<OrderOutcome> {
        if size_contracts <= 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "close with non-positive size {size_contracts}"
            )));
        }
        info!(symbol, side = %position_side, size = size_contracts, "closing position at market");
        self.place_market(symbol, position_side.opposite(), size_contracts, true)
            .await
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn place_market(
        &self,
        symbol: &str,
        order_direction: Side,
        size_contracts: f64,
        reduce_only: bool,
    ) -> Result<OrderOutcome> {
        let order_id = self
            .client
            .place_order(
                symbol,
                exchange_side(order_direction),
                OrderKind::Market,
                size_contracts,
                None,
                reduce_only,
            )
            .await?;

        let status = self
            .wait_for_fill(symbol, &order_id, Duration::from_secs(5))
            .await?;

        if status.filled_size <= 0.0 {
            return Err(EngineError::ExchangeTransient(format!(
                "market order {order_id} reported no fill"
            )));
        }

        Ok(OrderOutcome {
            order_id,
            kind: OrderKind::Market,
            effective_price: status.avg_fill_price,
            filled_size: status.filled_size,
            fees_usd: status.fee.abs(),
        })
    }

    async fn place_limit_with_band_retry(
        &self,
        symbol: &str,
        side: Side,
        size_contracts: f64,
        mut price: f64,
        max_wait_seconds: f64,
        instrument: &Instrument,
    ) -> Result<OrderOutcome> {
        let side_str = exchange_side(side);

        let order_id = match self
            .client
            .place_order(symbol, side_str, OrderKind::PostOnly, size_contracts, Some(price), false)
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_price_band_reject() => {
                // Bit-exact 51006: refetch limits, clamp, retry once.
                let limits = self.client.get_price_limits(symbol).await?;
                let clamped = clamp_to_band(side, price, &limits);
                warn!(
                    symbol,
                    rejected_price = price,
                    clamped_price = clamped,
                    "price out of band — clamped, retrying once"
                );
                price = round_to_tick(clamped, instrument.tick_size, side == Side::Long);

                match self
                    .client
                    .place_order(symbol, side_str, OrderKind::PostOnly, size_contracts, Some(price), false)
                    .await
                {
                    Ok(id) => id,
                    Err(retry_err) if self.config.allow_market_fallback => {
                        warn!(symbol, error = %retry_err, "clamped retry failed — market fallback");
                        return self.place_market(symbol, side, size_contracts, false).await;
                    }
                    Err(retry_err) => return Err(retry_err),
                }
            }
            Err(e) => return Err(e),
        };

        // 4. Wait for the fill, with one toward-move amendment.
        let wait = Duration::from_secs_f64(max_wait_seconds.max(1.0));
        let mut amended = false;
        let mut deadline = tokio::time::Instant::now() + wait;

        loop {
            let status = self.client.get_order(symbol, &order_id).await?;
            match status.state {
                OrderState::Filled => {
                    return Ok(OrderOutcome {
                        order_id,
                        kind: OrderKind::PostOnly,
                        effective_price: status.avg_fill_price,
                        filled_size: status.filled_size,
                        fees_usd: status.fee.abs(),
                    });
                }
                OrderState::Canceled | OrderState::Rejected => {
                    // Post-only orders that would cross get cancelled by the
                    // venue. Fall back to market when allowed.
                    if self.config.allow_market_fallback {
                        warn!(symbol, order_id, "limit order cancelled by venue — market fallback");
                        return self.place_market(symbol, side, size_contracts, false).await;
                    }
                    return Err(EngineError::ExchangeReject {
                        code: "post_only_cancelled".into(),
                        message: format!("order {order_id} cancelled before fill"),
                    });
                }
                OrderState::Pending | OrderState::PartiallyFilled => {}
            }

            if tokio::time::Instant::now() >= deadline {
                // Partial fills are kept; the remainder is cancelled.
                if status.filled_size > 0.0 {
                    let _ = self.client.cancel_order(symbol, &order_id).await;
                    info!(
                        symbol,
                        order_id,
                        filled = status.filled_size,
                        requested = size_contracts,
                        "partial fill accepted at wait deadline"
                    );
                    return Ok(OrderOutcome {
                        order_id,
                        kind: OrderKind::PostOnly,
                        effective_price: status.avg_fill_price,
                        filled_size: status.filled_size,
                        fees_usd: status.fee.abs(),
                    });
                }

                let current = self
                    .registry
                    .get_price(&self.client, symbol, PricePurpose::Orders)
                    .await
                    .map(|s| s.price)
                    .unwrap_or(price);
                let toward = toward_move_pct(side, price, current);

                if !amended && toward <= -self.config.replacement_threshold_pct {
                    // Market drifted toward the resting order but not through
                    // it: nudge the price and wait another window.
                    let new_price =
                        round_to_tick(reprice_toward(price, current), instrument.tick_size, side == Side::Long);
                    debug!(symbol, order_id, old_price = price, new_price, "amending limit toward market");
                    self.client
                        .amend_order(symbol, &order_id, Some(new_price), None)
                        .await?;
                    price = new_price;
                    amended = true;
                    deadline = tokio::time::Instant::now() + wait / 2;
                    continue;
                }

                // Moved away materially, or already amended: cancel and
                // (optionally) chase with a market order.
                let _ = self.client.cancel_order(symbol, &order_id).await;
                if self.config.allow_market_fallback
                    && toward >= self.config.replacement_threshold_pct
                {
                    warn!(symbol, order_id, toward, "price ran away — market fallback");
                    return self.place_market(symbol, side, size_contracts, false).await;
                }
                return Err(EngineError::ExchangeTransient(format!(
                    "order {order_id} unfilled within {max_wait_seconds}s"
                )));
            }

            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        timeout: Duration,
    ) -> Result<crate::gateway::OrderStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.client.get_order(symbol, order_id).await?;
            match status.state {
                OrderState::Filled | OrderState::Canceled | OrderState::Rejected => {
                    return Ok(status);
                }
                _ if tokio::time::Instant::now() >= deadline => return Ok(status),
                _ => tokio::time::sleep(FILL_POLL_INTERVAL).await,
            }
        }
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pure pricing helpers
// =============================================================================

/// Exchange order side for entering in `direction`.
fn exchange_side(direction: Side) -> &'static str {
    match direction {
        Side::Long => "buy",
        Side::Short => "sell",
    }
}

/// Relative deviation between two prices, percent of the reference.
fn deviation_pct(price: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    ((price - reference) / reference * 100.0).abs()
}

/// Maker entry price: buy `offset` below the best bid, sell `offset` above
/// the best ask, snapped to the tick grid away from the spread.
fn limit_entry_price(side: Side, best_bid: f64, best_ask: f64, offset_pct: f64, tick: f64) -> f64 {
    let raw = match side {
        Side::Long => best_bid * (1.0 - offset_pct / 100.0),
        Side::Short => best_ask * (1.0 + offset_pct / 100.0),
    };
    round_to_tick(raw, tick, side == Side::Long)
}

/// Snap to the tick grid: buys round down, sells round up, so the snapped
/// price never crosses the book.
fn round_to_tick(price: f64, tick: f64, round_down: bool) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    let steps = price / tick;
    let snapped = if round_down { steps.floor() } else { steps.ceil() };
    snapped * tick
}

/// Clamp a limit price into the exchange band: buys under `max_buy`, sells
/// over `min_sell`.
fn clamp_to_band(side: Side, price: f64, limits: &PriceLimits) -> f64 {
    match side {
        Side::Long => price.min(limits.max_buy),
        Side::Short => price.max(limits.min_sell),
    }
}

/// Signed move of the market relative to a resting limit, in percent.
/// Negative = market moved toward the order; positive = away.
fn toward_move_pct(side: Side, limit_price: f64, current: f64) -> f64 {
    if limit_price <= 0.0 {
        return 0.0;
    }
    match side {
        // Buy rests below the market: falling price approaches it.
        Side::Long => (current - limit_price) / limit_price * 100.0,
        Side::Short => (limit_price - current) / limit_price * 100.0,
    }
}

/// Re-price an amended limit halfway between the old level and the market.
fn reprice_toward(limit_price: f64, current: f64) -> f64 {
    (limit_price + current) / 2.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deviation_is_symmetric_percent() {
        assert!((deviation_pct(100.0, 100.1) - 0.0999).abs() < 0.001);
        assert!((deviation_pct(100.1, 100.0) - 0.1).abs() < 0.001);
        assert_eq!(deviation_pct(100.0, 0.0), 0.0);
    }

    #[test]
    fn limit_prices_sit_on_the_passive_side() {
        // Buy 0.05% below best bid 100.00, tick 0.01.
        let buy = limit_entry_price(Side::Long, 100.0, 100.1, 0.05, 0.01);
        assert!(buy < 100.0);
        assert!((buy - 99.95).abs() < 1e-9);

        // Sell 0.05% above best ask 100.10.
        let sell = limit_entry_price(Side::Short, 100.0, 100.1, 0.05, 0.01);
        assert!(sell > 100.1);
        assert!((sell - 100.16).abs() < 1e-9);
    }

    #[test]
    fn tick_rounding_never_crosses() {
        // Buy rounds down.
        assert!((round_to_tick(99.957, 0.01, true) - 99.95).abs() < 1e-9);
        // Sell rounds up.
        assert!((round_to_tick(100.152, 0.01, false) - 100.16).abs() < 1e-9);
        // Zero tick passes through.
        assert_eq!(round_to_tick(123.456, 0.0, true), 123.456);
    }

    #[test]
    fn band_clamp_directions() {
        let limits = PriceLimits {
            max_buy: 105.0,
            min_sell: 95.0,
        };
        assert_eq!(clamp_to_band(Side::Long, 110.0, &limits), 105.0);
        assert_eq!(clamp_to_band(Side::Long, 100.0, &limits), 100.0);
        assert_eq!(clamp_to_band(Side::Short, 90.0, &limits), 95.0);
        assert_eq!(clamp_to_band(Side::Short, 100.0, &limits), 100.0);
    }

    #[test]
    fn toward_move_sign_convention() {
        // Buy resting at 99.95, market falls to 99.90: toward (negative).
        assert!(toward_move_pct(Side::Long, 99.95, 99.90) < 0.0);
        // Market rallies to 100.30: away (positive).
        assert!(toward_move_pct(Side::Long, 99.95, 100.30) > 0.0);

        // Short resting at 100.16, market rallies to 100.20: toward.
        assert!(toward_move_pct(Side::Short, 100.16, 100.20) < 0.0);
        // Market falls to 99.80: away.
        assert!(toward_move_pct(Side::Short, 100.16, 99.80) > 0.0);
    }

    #[test]
    fn reprice_moves_halfway() {
        let p = reprice_toward(99.9, 100.0);
        assert!((p - 99.95).abs() < 1e-9);
    }

    #[test]
    fn exchange_sides() {
        assert_eq!(exchange_side(Side::Long), "buy");
        assert_eq!(exchange_side(Side::Short), "sell");
    }
}
