pub mod candles;
pub mod orderbook;
pub mod registry;

pub use candles::{Candle, CandleBuffer, CandleKey};
pub use orderbook::{OrderBookManager, OrderBookTop};
pub use registry::{MarketDataRegistry, PriceSample, PriceSource};
