// =============================================================================
// Typed error kinds for the Kestrel trading engine
// =============================================================================
//
// Money-touching paths return `Result<_, EngineError>` and fail closed: a
// stale price, an unknown position side, or an unresolvable money parameter
// must never silently default to a tradeable value.
//
// Propagation policy: leaf components return typed results; the orchestrator
// logs structured errors and continues the cycle. Only `Config` at startup
// terminates the process.
// =============================================================================

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or invalid configuration — fatal at startup, recoverable at
    /// runtime only when a safe failsafe exists.
    #[error("config error: {0}")]
    Config(String),

    /// A price or indicator violated its freshness TTL. Callers decide:
    /// signal generation skips the symbol; exit analysis falls back.
    #[error("stale data for {symbol}: age {age_ms}ms exceeds ttl {ttl_ms}ms")]
    StaleData {
        symbol: String,
        age_ms: u64,
        ttl_ms: u64,
    },

    /// Transient exchange failure (5xx, SSL, timeout) — retry with backoff.
    #[error("exchange transient: {0}")]
    ExchangeTransient(String),

    /// Exchange rejected the request with a business error code.
    /// Code 51006 (price out of band) triggers clamp + single retry.
    #[error("exchange reject {code}: {message}")]
    ExchangeReject { code: String, message: String },

    /// An internal invariant would be violated (leverage = 0, unknown side,
    /// entry price = 0). The specific operation fails; nothing defaults.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A benign double-close race; the losing branch logs and returns.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether a bounded retry is appropriate for this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ExchangeTransient(_) | EngineError::Http(_)
        )
    }

    /// True for the OKX "price out of band" reject that gets one
    /// clamp-and-retry attempt.
    pub fn is_price_band_reject(&self) -> bool {
        matches!(self, EngineError::ExchangeReject { code, .. } if code == "51006")
    }

    /// Stable reason code for the per-reason rejection counters.
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config_error",
            EngineError::StaleData { .. } => "stale_price",
            EngineError::ExchangeTransient(_) => "exchange_transient",
            EngineError::ExchangeReject { code, .. } if code == "51006" => "price_band_reject",
            EngineError::ExchangeReject { .. } => "exchange_reject",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::ConcurrencyConflict(_) => "already_closing",
            EngineError::Http(_) => "exchange_transient",
            EngineError::Serde(_) => "bad_payload",
            EngineError::Io(_) => "io_error",
        }
    }
}
