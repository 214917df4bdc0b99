// =============================================================================
// Order Book Manager — top-of-book cache fed by the books WebSocket channel
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Top-of-book state for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookTop {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Size at the best bid, in contracts.
    pub bid_size: f64,
    /// Size at the best ask, in contracts.
    pub ask_size: f64,
    pub spread_bps: f64,
    /// (bid_size - ask_size) / (bid_size + ask_size), in [-1, +1].
    pub imbalance: f64,
    /// Exchange timestamp of the update, milliseconds.
    pub updated_at_ms: i64,
}

/// Manages top-of-book state for multiple symbols.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBookTop>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Update the book top for a symbol from a WebSocket depth message.
    pub fn update(
        &self,
        symbol: &str,
        best_bid: f64,
        best_ask: f64,
        bid_size: f64,
        ask_size: f64,
        updated_at_ms: i64,
    ) {
        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = if mid > 0.0 {
            ((best_ask - best_bid) / mid) * 10_000.0
        } else {
            0.0
        };

        let total = bid_size + ask_size;
        let imbalance = if total > 0.0 {
            (bid_size - ask_size) / total
        } else {
            0.0
        };

        let top = OrderBookTop {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            bid_size,
            ask_size,
            spread_bps,
            imbalance,
            updated_at_ms,
        };

        self.books.write().insert(symbol.to_string(), top);
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookTop> {
        self.books.read().get(symbol).cloned()
    }

    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|b| b.imbalance)
    }

    pub fn spread_bps(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|b| b.spread_bps)
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imbalance_and_spread() {
        let mgr = OrderBookManager::new();
        mgr.update("BTC-USDT-SWAP", 100.0, 100.1, 30.0, 10.0, 1);

        let top = mgr.get("BTC-USDT-SWAP").unwrap();
        // (30 - 10) / 40 = 0.5
        assert!((top.imbalance - 0.5).abs() < 1e-10);
        // spread 0.1 over mid 100.05 ~ 9.995 bps
        assert!((top.spread_bps - 9.995).abs() < 0.01);
    }

    #[test]
    fn empty_book_sides() {
        let mgr = OrderBookManager::new();
        mgr.update("ETH-USDT-SWAP", 0.0, 0.0, 0.0, 0.0, 1);
        let top = mgr.get("ETH-USDT-SWAP").unwrap();
        assert_eq!(top.imbalance, 0.0);
        assert_eq!(top.spread_bps, 0.0);
    }

    #[test]
    fn missing_symbol_returns_none() {
        let mgr = OrderBookManager::new();
        assert!(mgr.get("XRP-USDT-SWAP").is_none());
        assert!(mgr.imbalance("XRP-USDT-SWAP").is_none());
    }
}
