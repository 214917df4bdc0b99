// =============================================================================
// Shared types used across the Kestrel trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Direction of a signal or position. Netting mode only — a symbol holds at
/// most one open position, long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// PnL sign: LONG profits when price rises, SHORT when it falls.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Parse an exchange-side string. Unknown sides fail closed — silently
    /// defaulting to long is a bug.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(EngineError::InvariantViolation(format!(
                "unknown position side '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// What a price will be used for. Each purpose carries its own freshness TTL;
/// money decisions use the tightest tiers. The legacy 60 s slow path from the
/// previous generation of this engine is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePurpose {
    /// Order placement reference price.
    Orders,
    /// SL/TP/PnL evaluation for open positions.
    ExitAnalysis,
    /// Signal generation.
    Signals,
    /// Everything else (status logs, diagnostics).
    General,
}

impl PricePurpose {
    /// Maximum acceptable price age in milliseconds.
    pub fn ttl_ms(self) -> u64 {
        match self {
            Self::Orders => 1_000,
            Self::ExitAnalysis => 2_000,
            Self::Signals => 3_000,
            Self::General => 5_000,
        }
    }
}

impl std::fmt::Display for PricePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orders => write!(f, "orders"),
            Self::ExitAnalysis => write!(f, "exit_analysis"),
            Self::Signals => write!(f, "signals"),
            Self::General => write!(f, "general"),
        }
    }
}

/// A single best-quote tick from the tickers WebSocket channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp_ms: i64,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
}

/// Candle timeframes the engine subscribes to, with their ring capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    H1,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Self::M1, Self::M5, Self::H1, Self::D1];

    /// OKX bar string for REST and WS candle channels.
    pub fn bar(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1H",
            Self::D1 => "1D",
        }
    }

    /// Closed candles retained per (symbol, timeframe) ring.
    pub fn capacity(self) -> usize {
        match self {
            Self::M1 => 500,
            Self::M5 => 300,
            Self::H1 => 168,
            Self::D1 => 20,
        }
    }

    /// Bar length in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::H1 => 3_600_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Parse an OKX bar string ("1m", "5m", "1H", "1D").
    pub fn from_bar(bar: &str) -> Option<Self> {
        match bar {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "1H" => Some(Self::H1),
            "1D" => Some(Self::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bar())
    }
}

/// Per-instrument contract metadata from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    /// Quote value of one contract unit.
    pub ct_val: f64,
    /// Minimum order quantity increment in contracts.
    pub lot_size: f64,
    /// Minimum price increment.
    pub tick_size: f64,
    /// Per-side maker fee as a fraction (e.g. 0.0002).
    pub maker_fee: f64,
    /// Per-side taker fee as a fraction (e.g. 0.0005).
    pub taker_fee: f64,
    pub quote_ccy: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parse_fails_closed() {
        assert_eq!(Side::parse("long").unwrap(), Side::Long);
        assert_eq!(Side::parse("SELL").unwrap(), Side::Short);
        assert!(Side::parse("net").is_err());
        assert!(Side::parse("").is_err());
    }

    #[test]
    fn side_sign() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn purpose_ttls_are_tiered() {
        assert_eq!(PricePurpose::Orders.ttl_ms(), 1_000);
        assert_eq!(PricePurpose::ExitAnalysis.ttl_ms(), 2_000);
        assert_eq!(PricePurpose::Signals.ttl_ms(), 3_000);
        assert_eq!(PricePurpose::General.ttl_ms(), 5_000);
    }

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_bar(tf.bar()), Some(tf));
        }
        assert_eq!(Timeframe::M1.capacity(), 500);
        assert_eq!(Timeframe::D1.capacity(), 20);
    }
}
