pub mod engine;
pub mod pnl;
pub mod trailing;

pub use engine::{evaluate, evaluate_fast_path, ExitAction, ExitContext, ExitDecision, ExitReason};
pub use pnl::{compute_pnl, PnlBreakdown};
pub use trailing::TrailingStop;
