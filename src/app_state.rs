// =============================================================================
// Central Application State — Kestrel Trading Engine
// =============================================================================
//
// The orchestrator owns one `Arc<AppState>`; components receive references,
// never singletons. Read-mostly market caches sit behind parking_lot locks
// with short critical sections; the position book linearizes through its own
// async mutex inside the PositionRegistry. No I/O happens under any lock —
// callers snapshot, release, do I/O, then re-acquire to commit.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::BotConfig;
use crate::exits::TrailingStop;
use crate::journal::Journal;
use crate::market_data::MarketDataRegistry;
use crate::params::ParamProvider;
use crate::position::PositionRegistry;
use crate::regime::RegimeClassifier;
use crate::risk::RiskManager;
use crate::types::Instrument;

/// Maximum recent errors retained for the status log.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

pub struct AppState {
    pub config: BotConfig,
    pub params: ParamProvider,
    pub market: Arc<MarketDataRegistry>,
    pub positions: Arc<PositionRegistry>,
    pub risk: Arc<RiskManager>,
    pub regimes: Arc<RegimeClassifier>,
    pub journal: Journal,

    /// Instrument metadata fetched once at startup.
    instruments: RwLock<HashMap<String, Instrument>>,

    /// Per-position trailing stop state, keyed by symbol.
    pub trailing: Mutex<HashMap<String, TrailingStop>>,

    /// Per-reason counters for rejected signals, failed orders, and
    /// anomalous exits.
    counters: RwLock<BTreeMap<&'static str, u64>>,

    recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: BotConfig, starting_equity_usd: f64, journal: Journal) -> Self {
        let params = ParamProvider::from_config(&config);
        let risk = Arc::new(RiskManager::new(config.risk.clone(), starting_equity_usd));

        Self {
            params,
            market: Arc::new(MarketDataRegistry::new()),
            positions: Arc::new(PositionRegistry::new()),
            risk,
            regimes: Arc::new(RegimeClassifier::default()),
            journal,
            instruments: RwLock::new(HashMap::new()),
            trailing: Mutex::new(HashMap::new()),
            counters: RwLock::new(BTreeMap::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: Instant::now(),
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    pub fn set_instrument(&self, instrument: Instrument) {
        self.instruments
            .write()
            .insert(instrument.symbol.clone(), instrument);
    }

    pub fn instrument(&self, symbol: &str) -> Option<Instrument> {
        self.instruments.read().get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Reason counters
    // -------------------------------------------------------------------------

    pub fn count_reason(&self, reason: &'static str) {
        *self.counters.write().entry(reason).or_insert(0) += 1;
    }

    pub fn counters_snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counters.read().clone()
    }

    // -------------------------------------------------------------------------
    // Error log
    // -------------------------------------------------------------------------

    pub fn push_error(&self, message: String, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }
}
