pub mod leverage;
pub mod manager;
pub mod sizer;

pub use leverage::select_leverage;
pub use manager::{RiskManager, RiskSnapshot};
pub use sizer::{compute_size, SizeResult};
