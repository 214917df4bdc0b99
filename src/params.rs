// =============================================================================
// Parameter Provider — resolves effective parameters for (symbol, regime)
// =============================================================================
//
// Precedence, highest first:
//   1. symbol_profiles.{SYMBOL}.{regime}.<field>
//   2. symbol_profiles.{SYMBOL}.<field>
//   3. adaptive_regime.{regime}.<field>
//   4. defaults.<field>
//   5. Code-level failsafe constant
//
// Regime keys are lowercase (normalised at config load). Numeric fields are
// parsed defensively — strings are accepted, and an unparsable value falls
// through to the next level rather than erroring.
//
// Money-critical fields (tp_percent, sl_percent, leverage) have NO code
// failsafe: if the chain is exhausted the caller gets a config error and the
// engine does not trade that symbol.
// =============================================================================

use std::collections::HashMap;

use serde_json::Value;

use crate::config::{BotConfig, ParamTable};
use crate::error::{EngineError, Result};
use crate::regime::Regime;

// =============================================================================
// Failsafe constants — the last resort for non-money fields
// =============================================================================

mod failsafe {
    pub const TP_ATR_MULTIPLIER: f64 = 2.5;
    pub const SL_ATR_MULTIPLIER: f64 = 2.0;
    pub const MAX_HOLDING_MINUTES: f64 = 45.0;
    pub const MIN_HOLDING_MINUTES: f64 = 0.5;
    pub const PH_THRESHOLD_PERCENT: f64 = 2.5;
    pub const PH_MIN_ABSOLUTE: f64 = 1.0;
    pub const PH_TIME_LIMIT_S: f64 = 900.0;
    pub const LOSS_CUT_PERCENT: f64 = 3.0;
    pub const TRAILING_INITIAL: f64 = 0.3;
    pub const TRAILING_MAX: f64 = 1.2;
    pub const TRAILING_MIN: f64 = 0.15;
    pub const TRAILING_MIN_PROFIT_TO_ACTIVATE: f64 = 0.5;
    pub const MIN_SCORE_THRESHOLD: f64 = 0.6;
    pub const REGIME_SIZE_MULTIPLIER: f64 = 1.0;
    pub const SIZE_MULTIPLIER: f64 = 1.0;
    pub const PARTIAL_TP_TRIGGER: f64 = 1.5;
    pub const PARTIAL_TP_FRACTION: f64 = 0.5;
    pub const MIN_PROFIT_TO_CLOSE: f64 = 0.0;
    pub const EMERGENCY_LOSS_PCT: f64 = 4.0;
    pub const LIMIT_OFFSET_PERCENT: f64 = 0.05;
    pub const MAX_WAIT_SECONDS: f64 = 5.0;
}

// =============================================================================
// ParamRecord — the flat, resolved record handed to consumers
// =============================================================================

/// Effective parameters for one (symbol, regime) pair. Flat and fully
/// resolved — consumers never walk nested config objects.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParamRecord {
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub tp_atr_multiplier: f64,
    pub sl_atr_multiplier: f64,
    pub max_holding_minutes: f64,
    pub min_holding_minutes: f64,
    /// Profit-harvest trigger as % of margin.
    pub ph_threshold_percent: f64,
    /// Minimum absolute USD profit before a harvest exit counts.
    pub ph_min_absolute: f64,
    /// Harvest time window in seconds.
    pub ph_time_limit_s: f64,
    /// Standard loss cut as % of margin; the critical cut is 2x this.
    pub loss_cut_percent: f64,
    pub trailing_initial: f64,
    pub trailing_max: f64,
    pub trailing_min: f64,
    pub trailing_min_profit_to_activate: f64,
    pub min_score_threshold: f64,
    pub adx_threshold: f64,
    pub min_signal_strength: f64,
    pub regime_size_multiplier: f64,
    /// Per-symbol sizing multiplier (resolved through the same chain, so a
    /// symbol-level override naturally wins).
    pub size_multiplier: f64,
    pub leverage: f64,
    pub partial_tp_trigger: f64,
    pub partial_tp_fraction: f64,
    /// Losing positions below this net USD profit skip optimistic exits.
    pub min_profit_to_close: f64,
    /// Hard emergency floor as % of margin; bypasses min-holding.
    pub emergency_loss_pct: f64,
    pub limit_offset_percent: f64,
    pub max_wait_seconds: f64,
}

impl ParamRecord {
    /// The critical loss cut fires at twice the standard cut.
    pub fn loss_cut_critical_percent(&self) -> f64 {
        self.loss_cut_percent * 2.0
    }
}

// =============================================================================
// ParamProvider
// =============================================================================

pub struct ParamProvider {
    adaptive_regime: HashMap<String, ParamTable>,
    symbol_profiles: HashMap<String, ParamTable>,
    defaults: ParamTable,
}

impl ParamProvider {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            adaptive_regime: config.adaptive_regime.clone(),
            symbol_profiles: config.symbol_profiles.clone(),
            defaults: config.defaults.clone(),
        }
    }

    /// Resolve the full effective record for a (symbol, regime) pair.
    pub fn resolve(&self, symbol: &str, regime: Regime) -> Result<ParamRecord> {
        use failsafe as fs;

        // Regime-dependent failsafes.
        let strength_fs = match regime {
            Regime::Trending => 0.70,
            Regime::Ranging => 0.65,
            Regime::Choppy => 0.75,
        };
        let adx_fs = match regime {
            Regime::Trending => 20.0,
            Regime::Ranging => 10.0,
            Regime::Choppy => 15.0,
        };

        Ok(ParamRecord {
            tp_percent: self.money_field(symbol, regime, "tp_percent")?,
            sl_percent: self.money_field(symbol, regime, "sl_percent")?,
            tp_atr_multiplier: self.field(symbol, regime, "tp_atr_multiplier", fs::TP_ATR_MULTIPLIER),
            sl_atr_multiplier: self.field(symbol, regime, "sl_atr_multiplier", fs::SL_ATR_MULTIPLIER),
            max_holding_minutes: self.field(symbol, regime, "max_holding_minutes", fs::MAX_HOLDING_MINUTES),
            min_holding_minutes: self.field(symbol, regime, "min_holding_minutes", fs::MIN_HOLDING_MINUTES),
            ph_threshold_percent: self.field(symbol, regime, "ph_threshold_percent", fs::PH_THRESHOLD_PERCENT),
            ph_min_absolute: self.field(symbol, regime, "ph_min_absolute", fs::PH_MIN_ABSOLUTE),
            ph_time_limit_s: self.field(symbol, regime, "ph_time_limit_s", fs::PH_TIME_LIMIT_S),
            loss_cut_percent: self.field(symbol, regime, "loss_cut_percent", fs::LOSS_CUT_PERCENT),
            trailing_initial: self.field(symbol, regime, "trailing_initial", fs::TRAILING_INITIAL),
            trailing_max: self.field(symbol, regime, "trailing_max", fs::TRAILING_MAX),
            trailing_min: self.field(symbol, regime, "trailing_min", fs::TRAILING_MIN),
            trailing_min_profit_to_activate: self.field(
                symbol,
                regime,
                "trailing_min_profit_to_activate",
                fs::TRAILING_MIN_PROFIT_TO_ACTIVATE,
            ),
            min_score_threshold: self.field(symbol, regime, "min_score_threshold", fs::MIN_SCORE_THRESHOLD),
            adx_threshold: self.field(symbol, regime, "adx_threshold", adx_fs),
            min_signal_strength: self.field(symbol, regime, "min_signal_strength", strength_fs),
            regime_size_multiplier: self.field(
                symbol,
                regime,
                "regime_size_multiplier",
                fs::REGIME_SIZE_MULTIPLIER,
            ),
            size_multiplier: self.field(symbol, regime, "size_multiplier", fs::SIZE_MULTIPLIER),
            leverage: self.money_field(symbol, regime, "leverage")?,
            partial_tp_trigger: self.field(symbol, regime, "partial_tp_trigger", fs::PARTIAL_TP_TRIGGER),
            partial_tp_fraction: self.field(symbol, regime, "partial_tp_fraction", fs::PARTIAL_TP_FRACTION),
            min_profit_to_close: self.field(symbol, regime, "min_profit_to_close", fs::MIN_PROFIT_TO_CLOSE),
            emergency_loss_pct: self.field(symbol, regime, "emergency_loss_pct", fs::EMERGENCY_LOSS_PCT),
            limit_offset_percent: self.field(symbol, regime, "limit_offset_percent", fs::LIMIT_OFFSET_PERCENT),
            max_wait_seconds: self.field(symbol, regime, "max_wait_seconds", fs::MAX_WAIT_SECONDS),
        })
    }

    // -------------------------------------------------------------------------
    // Field resolution
    // -------------------------------------------------------------------------

    /// Resolve one field through levels 1-4, falling back to the failsafe.
    fn field(&self, symbol: &str, regime: Regime, name: &str, failsafe: f64) -> f64 {
        self.lookup(symbol, regime, name).unwrap_or(failsafe)
    }

    /// Resolve a money-critical field. No failsafe exists: exhausting the
    /// chain is a config error and the caller must not trade.
    fn money_field(&self, symbol: &str, regime: Regime, name: &str) -> Result<f64> {
        self.lookup(symbol, regime, name).ok_or_else(|| {
            EngineError::Config(format!(
                "money-critical parameter '{name}' unresolved for {symbol}/{regime}"
            ))
        })
    }

    /// Walk the precedence chain. A present-but-unparsable value falls
    /// through to the next level.
    fn lookup(&self, symbol: &str, regime: Regime, name: &str) -> Option<f64> {
        let regime_key = regime.key();

        // 1. symbol_profiles.{SYMBOL}.{regime}.{field}
        if let Some(profile) = self.symbol_profiles.get(symbol) {
            if let Some(Value::Object(regime_table)) = profile.get(regime_key) {
                if let Some(v) = regime_table.get(name).and_then(value_to_f64) {
                    return Some(v);
                }
            }

            // 2. symbol_profiles.{SYMBOL}.{field}
            if let Some(v) = profile.get(name).and_then(value_to_f64) {
                return Some(v);
            }
        }

        // 3. adaptive_regime.{regime}.{field}
        if let Some(table) = self.adaptive_regime.get(regime_key) {
            if let Some(v) = table.get(name).and_then(value_to_f64) {
                return Some(v);
            }
        }

        // 4. defaults.{field}
        self.defaults.get(name).and_then(value_to_f64)
    }
}

/// Defensive numeric parse: numbers pass through, numeric strings parse,
/// everything else is treated as absent.
fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(
        adaptive: &[(&str, &[(&str, Value)])],
        symbols: &[(&str, &[(&str, Value)])],
        defaults: &[(&str, Value)],
    ) -> BotConfig {
        let mut cfg = BotConfig::default();
        for (regime, fields) in adaptive {
            let mut table = ParamTable::new();
            for (k, v) in *fields {
                table.insert(k.to_string(), v.clone());
            }
            cfg.adaptive_regime.insert(regime.to_string(), table);
        }
        for (symbol, fields) in symbols {
            let mut table = ParamTable::new();
            for (k, v) in *fields {
                table.insert(k.to_string(), v.clone());
            }
            cfg.symbol_profiles.insert(symbol.to_string(), table);
        }
        for (k, v) in defaults {
            cfg.defaults.insert(k.to_string(), v.clone());
        }
        cfg
    }

    fn full_regime_fields() -> Vec<(&'static str, Value)> {
        vec![
            ("tp_percent", serde_json::json!(1.0)),
            ("sl_percent", serde_json::json!(0.8)),
            ("leverage", serde_json::json!(10)),
        ]
    }

    #[test]
    fn regime_level_resolution() {
        let fields = full_regime_fields();
        let cfg = config_with(&[("ranging", &fields)], &[], &[]);
        let provider = ParamProvider::from_config(&cfg);

        let record = provider.resolve("BTC-USDT-SWAP", Regime::Ranging).unwrap();
        assert!((record.tp_percent - 1.0).abs() < f64::EPSILON);
        assert!((record.leverage - 10.0).abs() < f64::EPSILON);
        // Non-money field falls to failsafe.
        assert!((record.sl_atr_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn symbol_regime_override_beats_everything() {
        let fields = full_regime_fields();
        let symbol_fields = vec![
            ("tp_percent", serde_json::json!(3.0)),
            (
                "ranging",
                serde_json::json!({ "tp_percent": 2.0 }),
            ),
        ];
        let cfg = config_with(
            &[("ranging", &fields)],
            &[("BTC-USDT-SWAP", &symbol_fields)],
            &[("tp_percent", serde_json::json!(0.5))],
        );
        let provider = ParamProvider::from_config(&cfg);

        // symbol.regime (2.0) > symbol (3.0) > regime (1.0) > default (0.5)
        let record = provider.resolve("BTC-USDT-SWAP", Regime::Ranging).unwrap();
        assert!((record.tp_percent - 2.0).abs() < f64::EPSILON);

        // Other symbols see the regime table.
        let other = provider.resolve("ETH-USDT-SWAP", Regime::Ranging).unwrap();
        assert!((other.tp_percent - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn symbol_flat_override_beats_regime_table() {
        let fields = full_regime_fields();
        let symbol_fields = vec![("sl_percent", serde_json::json!(0.4))];
        let cfg = config_with(
            &[("trending", &fields)],
            &[("ETH-USDT-SWAP", &symbol_fields)],
            &[],
        );
        let provider = ParamProvider::from_config(&cfg);

        let record = provider.resolve("ETH-USDT-SWAP", Regime::Trending).unwrap();
        assert!((record.sl_percent - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn string_numbers_accepted() {
        let fields = vec![
            ("tp_percent", serde_json::json!("1.5")),
            ("sl_percent", serde_json::json!("0.9")),
            ("leverage", serde_json::json!("20")),
        ];
        let cfg = config_with(&[("choppy", &fields)], &[], &[]);
        let provider = ParamProvider::from_config(&cfg);

        let record = provider.resolve("BTC-USDT-SWAP", Regime::Choppy).unwrap();
        assert!((record.tp_percent - 1.5).abs() < f64::EPSILON);
        assert!((record.leverage - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unparsable_value_falls_through() {
        let fields = vec![
            ("tp_percent", serde_json::json!("not a number")),
            ("sl_percent", serde_json::json!(0.8)),
            ("leverage", serde_json::json!(10)),
        ];
        let cfg = config_with(
            &[("ranging", &fields)],
            &[],
            &[("tp_percent", serde_json::json!(1.1))],
        );
        let provider = ParamProvider::from_config(&cfg);

        let record = provider.resolve("BTC-USDT-SWAP", Regime::Ranging).unwrap();
        // Garbage at the regime level falls through to defaults.
        assert!((record.tp_percent - 1.1).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_money_field_fails_closed() {
        let fields = vec![
            ("tp_percent", serde_json::json!(1.0)),
            ("sl_percent", serde_json::json!(0.8)),
            // leverage missing everywhere
        ];
        let cfg = config_with(&[("ranging", &fields)], &[], &[]);
        let provider = ParamProvider::from_config(&cfg);

        let err = provider.resolve("BTC-USDT-SWAP", Regime::Ranging).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn loss_cut_critical_is_double() {
        let fields = full_regime_fields();
        let cfg = config_with(&[("trending", &fields)], &[], &[]);
        let provider = ParamProvider::from_config(&cfg);

        let record = provider.resolve("X", Regime::Trending).unwrap();
        assert!(
            (record.loss_cut_critical_percent() - record.loss_cut_percent * 2.0).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn config_roundtrip_resolves_identically() {
        let fields = full_regime_fields();
        let cfg = config_with(
            &[("ranging", &fields)],
            &[],
            &[("trailing_initial", serde_json::json!(0.4))],
        );

        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();

        let a = ParamProvider::from_config(&cfg)
            .resolve("BTC-USDT-SWAP", Regime::Ranging)
            .unwrap();
        let b = ParamProvider::from_config(&cfg2)
            .resolve("BTC-USDT-SWAP", Regime::Ranging)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn regime_dependent_strength_failsafes() {
        let fields = full_regime_fields();
        let cfg = config_with(
            &[
                ("trending", &fields),
                ("ranging", &fields),
                ("choppy", &fields),
            ],
            &[],
            &[],
        );
        let provider = ParamProvider::from_config(&cfg);

        let t = provider.resolve("X", Regime::Trending).unwrap();
        let r = provider.resolve("X", Regime::Ranging).unwrap();
        let c = provider.resolve("X", Regime::Choppy).unwrap();
        assert!((t.min_signal_strength - 0.70).abs() < f64::EPSILON);
        assert!((r.min_signal_strength - 0.65).abs() < f64::EPSILON);
        assert!((c.min_signal_strength - 0.75).abs() < f64::EPSILON);
    }
}
