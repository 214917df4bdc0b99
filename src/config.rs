// =============================================================================
// Bot Configuration — typed sections, loaded once at startup
// =============================================================================
//
// Every field carries `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash.
//
// Regime keys are normalised to lowercase at load — mixed-case regime keys
// were a recurring bug in the previous generation of this engine. Commission
// is normalised to per-side at load: legacy configs that specified a
// "per round" rate are halved once here, and nowhere else re-derives fees.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Raw parameter table: field name → JSON value. Values may arrive as numbers
/// or numeric strings; the parameter provider parses them defensively.
pub type ParamTable = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDT-SWAP".to_string(),
        "ETH-USDT-SWAP".to_string(),
        "SOL-USDT-SWAP".to_string(),
    ]
}

fn default_maker_fee() -> f64 {
    0.0002
}

fn default_taker_fee() -> f64 {
    0.0005
}

fn default_min_candles_for_signals() -> usize {
    15
}

fn default_cycle_interval_secs() -> u64 {
    2
}

fn default_slow_cycle_warn_secs() -> f64 {
    5.0
}

fn default_max_margin_per_trade_pct() -> f64 {
    10.0
}

fn default_max_portfolio_margin_pct() -> f64 {
    40.0
}

fn default_maintenance_margin_floor() -> f64 {
    0.02
}

fn default_corr_threshold() -> f64 {
    0.8
}

fn default_max_correlated_positions() -> usize {
    2
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_trades_per_day() -> u32 {
    120
}

fn default_max_drawdown_pct() -> f64 {
    5.0
}

fn default_offset_percent() -> f64 {
    0.05
}

fn default_max_wait_seconds() -> u64 {
    5
}

fn default_replacement_threshold_pct() -> f64 {
    0.10
}

fn default_market_order_volatility_pct() -> f64 {
    0.8
}

fn default_stale_signal_pct() -> f64 {
    1.0
}

fn default_mtf_warn_multiplier() -> f64 {
    0.75
}

fn default_liquidity_min_book_size() -> f64 {
    50.0
}

fn default_liquidity_volume_fallback_usd() -> f64 {
    5_000_000.0
}

fn default_orderflow_threshold() -> f64 {
    0.10
}

fn default_funding_max_positive_rate() -> f64 {
    0.0005
}

fn default_funding_max_negative_rate() -> f64 {
    -0.0005
}

fn default_proximity_bonus() -> f64 {
    1.05
}

fn default_pivot_proximity_pct() -> f64 {
    0.15
}

fn default_high_profit_threshold() -> f64 {
    2.0
}

fn default_high_profit_max_factor() -> f64 {
    0.5
}

// =============================================================================
// scalping
// =============================================================================

/// Per-side commission rates. One source of truth — the executor, exit engine,
/// trailing controller, and PnL calculator all receive these values explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionConfig {
    #[serde(default = "default_maker_fee")]
    pub maker: f64,
    #[serde(default = "default_taker_fee")]
    pub taker: f64,
    /// Legacy flag: rates were quoted per round-trip. Normalised at load.
    #[serde(default)]
    pub per_round: bool,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            maker: default_maker_fee(),
            taker: default_taker_fee(),
            per_round: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpingConfig {
    #[serde(default)]
    pub commission: CommissionConfig,

    /// Minimum 1m candles buffered before a symbol may emit signals.
    #[serde(default = "default_min_candles_for_signals")]
    pub min_candles_for_signals: usize,

    /// Periodic evaluation cycle interval in seconds.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Cycles slower than this are logged and degrade non-essential filters.
    #[serde(default = "default_slow_cycle_warn_secs")]
    pub slow_cycle_warn_secs: f64,
}

impl Default for ScalpingConfig {
    fn default() -> Self {
        Self {
            commission: CommissionConfig::default(),
            min_candles_for_signals: default_min_candles_for_signals(),
            cycle_interval_secs: default_cycle_interval_secs(),
            slow_cycle_warn_secs: default_slow_cycle_warn_secs(),
        }
    }
}

// =============================================================================
// risk
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Margin for a single new trade must not exceed this share of equity.
    #[serde(default = "default_max_margin_per_trade_pct")]
    pub max_margin_per_trade_pct: f64,

    /// Sum of all margins (incl. the new trade) must not exceed this share.
    #[serde(default = "default_max_portfolio_margin_pct")]
    pub max_portfolio_margin_pct: f64,

    /// Maintenance-margin ratio after the new position must stay above this.
    #[serde(default = "default_maintenance_margin_floor")]
    pub maintenance_margin_floor: f64,

    /// |ρ| at or above which two symbols count as correlated.
    #[serde(default = "default_corr_threshold")]
    pub corr_threshold: f64,

    /// Maximum already-open positions correlated with a new signal.
    #[serde(default = "default_max_correlated_positions")]
    pub max_correlated_positions: usize,

    // --- Daily circuit breakers ------------------------------------------
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_margin_per_trade_pct: default_max_margin_per_trade_pct(),
            max_portfolio_margin_pct: default_max_portfolio_margin_pct(),
            maintenance_margin_floor: default_maintenance_margin_floor(),
            corr_threshold: default_corr_threshold(),
            max_correlated_positions: default_max_correlated_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            max_drawdown_pct: default_max_drawdown_pct(),
        }
    }
}

// =============================================================================
// balance_profiles
// =============================================================================

/// Sizing profile selected by account equity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceProfile {
    /// Equity upper bound for this profile (exclusive). Ignored for `large`.
    #[serde(default)]
    pub max_balance_usd: f64,
    /// Base notional per trade in USD.
    pub base_position_usd: f64,
    /// Multiplier applied on top of the base notional.
    pub size_boost: f64,
    /// Global cap on concurrently open positions for this profile.
    pub max_positions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceProfiles {
    pub small: BalanceProfile,
    pub medium: BalanceProfile,
    pub large: BalanceProfile,
}

impl Default for BalanceProfiles {
    fn default() -> Self {
        Self {
            small: BalanceProfile {
                max_balance_usd: 1_000.0,
                base_position_usd: 50.0,
                size_boost: 1.0,
                max_positions: 8,
            },
            medium: BalanceProfile {
                max_balance_usd: 10_000.0,
                base_position_usd: 300.0,
                size_boost: 1.15,
                max_positions: 9,
            },
            large: BalanceProfile {
                max_balance_usd: f64::MAX,
                base_position_usd: 1_500.0,
                size_boost: 1.30,
                max_positions: 10,
            },
        }
    }
}

impl BalanceProfiles {
    /// Pick the profile for the given account equity.
    pub fn select(&self, equity_usd: f64) -> &BalanceProfile {
        if equity_usd < self.small.max_balance_usd {
            &self.small
        } else if equity_usd < self.medium.max_balance_usd {
            &self.medium
        } else {
            &self.large
        }
    }
}

// =============================================================================
// futures_modules
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingSlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Net PnL % of margin above which the high-profit mode engages.
    #[serde(default = "default_high_profit_threshold")]
    pub high_profit_threshold: f64,
    /// Trail-tightening factor in high-profit mode (multiplies the trail).
    #[serde(default = "default_high_profit_max_factor")]
    pub high_profit_max_factor: f64,
}

impl Default for TrailingSlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_profit_threshold: default_high_profit_threshold(),
            high_profit_max_factor: default_high_profit_max_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default = "default_true")]
    pub mtf_enabled: bool,
    /// Strength multiplier when the senior timeframe opposes the signal.
    #[serde(default = "default_mtf_warn_multiplier")]
    pub mtf_warn_multiplier: f64,

    #[serde(default = "default_true")]
    pub liquidity_enabled: bool,
    /// Minimum top-of-book size (contracts) on the entry side.
    #[serde(default = "default_liquidity_min_book_size")]
    pub liquidity_min_book_size: f64,
    /// 24h quote-volume fallback threshold when the book is too thin.
    #[serde(default = "default_liquidity_volume_fallback_usd")]
    pub liquidity_volume_fallback_usd: f64,

    #[serde(default = "default_true")]
    pub orderflow_enabled: bool,
    /// Imbalance magnitude that must agree with the signal side.
    #[serde(default = "default_orderflow_threshold")]
    pub orderflow_threshold: f64,

    #[serde(default = "default_true")]
    pub funding_enabled: bool,
    /// Longs rejected when the funding rate exceeds this.
    #[serde(default = "default_funding_max_positive_rate")]
    pub funding_max_positive_rate: f64,
    /// Shorts rejected when the funding rate is below this.
    #[serde(default = "default_funding_max_negative_rate")]
    pub funding_max_negative_rate: f64,

    #[serde(default = "default_true")]
    pub volume_profile_enabled: bool,
    /// Strength bonus near a high-volume node.
    #[serde(default = "default_proximity_bonus")]
    pub volume_profile_bonus: f64,

    #[serde(default = "default_true")]
    pub pivot_enabled: bool,
    /// Strength bonus near a classical pivot level.
    #[serde(default = "default_proximity_bonus")]
    pub pivot_bonus: f64,
    /// Price distance (%) counting as "near" a pivot.
    #[serde(default = "default_pivot_proximity_pct")]
    pub pivot_proximity_pct: f64,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty filters config deserialises")
    }
}

/// Reversal-scored early close. Weights are configuration, not constants;
/// the module is inactive unless a threshold is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartCloseConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reversal score in [0,1] above which the position is closed.
    #[serde(default)]
    pub reversal_threshold: f64,
    #[serde(default)]
    pub weight_candle: f64,
    #[serde(default)]
    pub weight_orderflow: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuturesModules {
    #[serde(default)]
    pub trailing_sl: TrailingSlConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub smart_close: SmartCloseConfig,
}

// =============================================================================
// order_executor
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrderConfig {
    /// Post-only offset from the best quote, in percent. <= 0 means market.
    #[serde(default = "default_offset_percent")]
    pub offset_percent: f64,
    /// Seconds to wait for a fill before repricing or falling back.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    /// Favourable price move (%) that triggers a limit replacement.
    #[serde(default = "default_replacement_threshold_pct")]
    pub replacement_threshold_pct: f64,
    /// Above this 1m volatility (%), skip the limit and go straight to market.
    #[serde(default = "default_market_order_volatility_pct")]
    pub market_order_volatility_pct: f64,
    /// Signal price deviating from the fresh reference by more than this (%)
    /// is replaced with the reference.
    #[serde(default = "default_stale_signal_pct")]
    pub stale_signal_pct: f64,
    #[serde(default = "default_true")]
    pub allow_market_fallback: bool,
}

impl Default for LimitOrderConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty limit order config deserialises")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderExecutorConfig {
    #[serde(default)]
    pub limit_order: LimitOrderConfig,
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Kestrel engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Symbols the engine is watching and trading (OKX instIds).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub scalping: ScalpingConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub balance_profiles: BalanceProfiles,

    /// Per-regime parameter tables keyed by lowercase regime name
    /// ("trending", "ranging", "choppy").
    #[serde(default)]
    pub adaptive_regime: HashMap<String, ParamTable>,

    /// Per-symbol overrides. A table may contain plain fields and nested
    /// per-regime tables keyed by lowercase regime name.
    #[serde(default)]
    pub symbol_profiles: HashMap<String, ParamTable>,

    /// Global parameter defaults — the fourth level of the precedence chain.
    #[serde(default)]
    pub defaults: ParamTable,

    #[serde(default)]
    pub futures_modules: FuturesModules,

    #[serde(default)]
    pub order_executor: OrderExecutorConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            scalping: ScalpingConfig::default(),
            risk: RiskConfig::default(),
            balance_profiles: BalanceProfiles::default(),
            adaptive_regime: HashMap::new(),
            symbol_profiles: HashMap::new(),
            defaults: ParamTable::new(),
            futures_modules: FuturesModules::default(),
            order_executor: OrderExecutorConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path` and normalise it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.normalize();

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Normalise the loaded configuration in place:
    /// - legacy per-round commission becomes per-side,
    /// - all regime keys become lowercase.
    pub fn normalize(&mut self) {
        if self.scalping.commission.per_round {
            self.scalping.commission.maker /= 2.0;
            self.scalping.commission.taker /= 2.0;
            self.scalping.commission.per_round = false;
            warn!(
                maker = self.scalping.commission.maker,
                taker = self.scalping.commission.taker,
                "legacy per-round commission normalised to per-side"
            );
        }

        self.adaptive_regime = self
            .adaptive_regime
            .drain()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();

        for table in self.symbol_profiles.values_mut() {
            let keys: Vec<String> = table.keys().cloned().collect();
            for key in keys {
                let lower = key.to_lowercase();
                if lower != key {
                    if let Some(value) = table.remove(&key) {
                        table.insert(lower, value);
                    }
                }
            }
        }
    }

    /// Startup validation. A missing regime section for a live symbol set is
    /// a startup error — the engine refuses to trade without it.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("config error: no symbols configured");
        }

        for regime in ["trending", "ranging", "choppy"] {
            if !self.adaptive_regime.contains_key(regime) {
                anyhow::bail!(
                    "config error: adaptive_regime.{regime} section is missing"
                );
            }
        }

        if self.scalping.commission.maker < 0.0 || self.scalping.commission.taker < 0.0 {
            anyhow::bail!("config error: negative commission rates");
        }

        Ok(())
    }
}
