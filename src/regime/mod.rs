pub mod classifier;

pub use classifier::{RegimeClassifier, RegimeState, RegimeThresholds};

use serde::{Deserialize, Serialize};

/// Market regime driving adaptive parameters. Reclassified on each 1m candle
/// close per symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Choppy,
}

impl Regime {
    /// Lowercase key used for config lookups.
    pub fn key(self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Choppy => "choppy",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
