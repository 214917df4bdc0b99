// =============================================================================
// Position Sizer — balance profile → notional USD → contracts
// =============================================================================
//
// Notional = base_position_usd × size_boost × regime multiplier × per-symbol
// multiplier × strength multiplier. The notional converts to contracts via
// the instrument's contract value and rounds *down* to the lot size; margin
// is notional / leverage.
// =============================================================================

use crate::config::BalanceProfile;
use crate::error::{EngineError, Result};
use crate::types::Instrument;

/// Strength scaling bins: monotonic from 0.5x (weakest) to 1.5x (strongest).
pub fn strength_multiplier(strength: f64) -> f64 {
    match strength {
        s if s < 0.2 => 0.50,
        s if s < 0.4 => 0.75,
        s if s < 0.6 => 1.00,
        s if s < 0.8 => 1.25,
        _ => 1.50,
    }
}

/// Resolved size for a new order.
#[derive(Debug, Clone, Copy)]
pub struct SizeResult {
    pub contracts: f64,
    pub notional_usd: f64,
    pub margin_usd: f64,
}

/// Compute the order size in contracts.
///
/// Fails closed on degenerate inputs (non-positive price, contract value, or
/// leverage) and when the rounded size collapses to zero contracts.
pub fn compute_size(
    profile: &BalanceProfile,
    regime_multiplier: f64,
    symbol_multiplier: f64,
    strength: f64,
    instrument: &Instrument,
    price: f64,
    leverage: f64,
) -> Result<SizeResult> {
    if price <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "sizing with non-positive price {price}"
        )));
    }
    if instrument.ct_val <= 0.0 || instrument.lot_size <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "bad instrument meta for {}: ct_val={} lot={}",
            instrument.symbol, instrument.ct_val, instrument.lot_size
        )));
    }
    if leverage < 1.0 {
        return Err(EngineError::InvariantViolation(format!(
            "leverage {leverage} below 1"
        )));
    }

    let notional_usd = profile.base_position_usd
        * profile.size_boost
        * regime_multiplier
        * symbol_multiplier
        * strength_multiplier(strength);

    let raw_contracts = notional_usd / (instrument.ct_val * price);
    let contracts = (raw_contracts / instrument.lot_size).floor() * instrument.lot_size;

    if contracts <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "computed size rounds to zero contracts (notional {notional_usd:.2} USD)"
        )));
    }

    let effective_notional = contracts * instrument.ct_val * price;
    let margin_usd = effective_notional / leverage;

    Ok(SizeResult {
        contracts,
        notional_usd: effective_notional,
        margin_usd,
    })
}
