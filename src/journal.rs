// =============================================================================
// Journal — append-only, date-partitioned JSONL records
// =============================================================================
//
// Layout under the journal root:
//   trades/YYYY-MM-DD.jsonl        one record per closed position
//   signals/YYYY-MM-DD.jsonl       one record per emitted signal
//   candles_init/YYYY-MM-DD.jsonl  startup candle-buffer snapshot
//
// Writes are line-append only; a crash can truncate at most the line being
// written.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::market_data::Candle;
use crate::position::ClosedPosition;
use crate::regime::Regime;
use crate::signals::Signal;
use crate::types::{Side, Timeframe};

/// Journal record for one closed position.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub entry_time_ms: i64,
    pub exit_time_ms: i64,
    pub regime: Regime,
    pub realized_pnl_usd: f64,
    pub fees_usd: f64,
    pub exit_reason: String,
}

impl From<&ClosedPosition> for TradeRecord {
    fn from(closed: &ClosedPosition) -> Self {
        Self {
            symbol: closed.symbol.clone(),
            side: closed.side,
            entry_price: closed.entry_price,
            exit_price: closed.exit_price,
            size: closed.size,
            entry_time_ms: closed.entry_time_ms,
            exit_time_ms: closed.exit_time_ms,
            regime: closed.regime,
            realized_pnl_usd: closed.realized_pnl_usd,
            fees_usd: closed.fees_usd,
            exit_reason: closed.exit_reason.clone(),
        }
    }
}

/// Journal record for one emitted signal, executed or not.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub side: Side,
    pub strength: f64,
    pub confidence: f64,
    pub regime: Regime,
    pub timestamp_ms: i64,
    pub suggested_price: f64,
    pub executed: bool,
    /// Reason code when not executed.
    pub reject_reason: Option<String>,
}

impl SignalRecord {
    pub fn from_signal(signal: &Signal, executed: bool, reject_reason: Option<String>) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            side: signal.side,
            strength: signal.strength,
            confidence: signal.confidence,
            regime: signal.regime,
            timestamp_ms: signal.timestamp_ms,
            suggested_price: signal.suggested_price,
            executed,
            reject_reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CandleInitRecord<'a> {
    symbol: &'a str,
    timeframe: Timeframe,
    count: usize,
    candles: &'a [Candle],
}

/// Append-only journal writer rooted at a base directory.
pub struct Journal {
    base_dir: PathBuf,
}

impl Journal {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn record_trade(&self, record: &TradeRecord) -> Result<()> {
        self.append("trades", record)
    }

    pub fn record_signal(&self, record: &SignalRecord) -> Result<()> {
        self.append("signals", record)
    }

    /// Snapshot one symbol's startup candle backfill.
    pub fn record_candles_init(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<()> {
        self.append(
            "candles_init",
            &CandleInitRecord {
                symbol,
                timeframe,
                count: candles.len(),
                candles,
            },
        )
    }

    fn append<T: Serialize>(&self, kind: &str, record: &T) -> Result<()> {
        let dir = self.base_dir.join(kind);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;

        let path = dir.join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let line = serde_json::to_string(record).context("failed to serialise journal record")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal file {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
