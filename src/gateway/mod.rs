pub mod client;
pub mod limits;
pub mod ws;

pub use client::{ExchangePosition, OkxClient, OrderKind, OrderState, OrderStatus, PriceLimits};
pub use limits::{with_retries, RestLimiter};
