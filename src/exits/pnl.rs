// =============================================================================
// PnL Calculator — fee-aware, side-aware, fail-closed
// =============================================================================
//
//   unrealized_pnl_usd      = size × ctVal × (exit − entry) × sign(side)
//   gross_pct_of_margin     = unrealized_pnl_usd / margin_used × 100
//   net_pct_of_margin       = gross_pct − (maker + taker) × leverage × 100
//
// Fees are per-side fractions (legacy per-round values are normalised at
// config load, not here). `include_fees=false` exists for the entry-price
// fallback: anchoring on the entry price must read as 0%, not as the
// spurious −(fees) artifact.
// =============================================================================

use crate::error::{EngineError, Result};
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlBreakdown {
    pub gross_usd: f64,
    pub gross_pct_of_margin: f64,
    pub fees_pct_of_margin: f64,
    pub fees_usd: f64,
    pub net_pct_of_margin: f64,
    pub net_usd: f64,
}

/// Compute the PnL of a position at `exit_price`.
///
/// Fails closed on degenerate inputs — a zero entry price or margin must
/// never flow into a −100% "loss" that triggers a close.
#[allow(clippy::too_many_arguments)]
pub fn compute_pnl(
    side: Side,
    entry_price: f64,
    exit_price: f64,
    size: f64,
    ct_val: f64,
    margin_used: f64,
    leverage: f64,
    maker_fee: f64,
    taker_fee: f64,
    include_fees: bool,
) -> Result<PnlBreakdown> {
    if entry_price <= 0.0 || exit_price <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "pnl with non-positive price: entry={entry_price} exit={exit_price}"
        )));
    }
    if size <= 0.0 || ct_val <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "pnl with non-positive size/ctVal: size={size} ct_val={ct_val}"
        )));
    }
    if margin_used <= 0.0 || leverage < 1.0 {
        return Err(EngineError::InvariantViolation(format!(
            "pnl with bad margin/leverage: margin={margin_used} leverage={leverage}"
        )));
    }

    let gross_usd = size * ct_val * (exit_price - entry_price) * side.sign();
    let gross_pct_of_margin = gross_usd / margin_used * 100.0;

    let (fees_pct_of_margin, fees_usd) = if include_fees {
        let pct = (maker_fee + taker_fee) * leverage * 100.0;
        (pct, pct / 100.0 * margin_used)
    } else {
        (0.0, 0.0)
    };

    let net_pct_of_margin = gross_pct_of_margin - fees_pct_of_margin;
    let net_usd = net_pct_of_margin / 100.0 * margin_used;

    Ok(PnlBreakdown {
        gross_usd,
        gross_pct_of_margin,
        fees_pct_of_margin,
        fees_usd,
        net_pct_of_margin,
        net_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_profits_when_price_rises() {
        // 10 contracts × 0.01 ctVal × (105 − 100) = +0.5 USD gross.
        let pnl = compute_pnl(
            Side::Long,
            100.0,
            105.0,
            10.0,
            0.01,
            1.0,
            10.0,
            0.0002,
            0.0005,
            true,
        )
        .unwrap();
        assert!((pnl.gross_usd - 0.5).abs() < 1e-12);
        assert!((pnl.gross_pct_of_margin - 50.0).abs() < 1e-9);
        // Fees: 0.0007 × 10 × 100 = 0.7% of margin.
        assert!((pnl.fees_pct_of_margin - 0.7).abs() < 1e-9);
        assert!((pnl.net_pct_of_margin - 49.3).abs() < 1e-9);
    }

    #[test]
    fn short_math_is_negated_long_math() {
        let long = compute_pnl(
            Side::Long, 100.0, 103.0, 5.0, 0.1, 10.0, 10.0, 0.0, 0.0, false,
        )
        .unwrap();
        let short = compute_pnl(
            Side::Short, 100.0, 103.0, 5.0, 0.1, 10.0, 10.0, 0.0, 0.0, false,
        )
        .unwrap();
        assert!((long.gross_usd + short.gross_usd).abs() < 1e-12);
        assert!(long.gross_usd > 0.0);
        assert!(short.gross_usd < 0.0);
    }

    #[test]
    fn fallback_at_entry_price_reads_flat() {
        // Price anchor = entry price with fees suppressed: exactly 0%.
        let pnl = compute_pnl(
            Side::Long, 100.0, 100.0, 10.0, 0.01, 10.0, 10.0, 0.0002, 0.0005, false,
        )
        .unwrap();
        assert_eq!(pnl.net_pct_of_margin, 0.0);
        assert_eq!(pnl.net_usd, 0.0);

        // With fees included the same anchor would read −0.7%.
        let with_fees = compute_pnl(
            Side::Long, 100.0, 100.0, 10.0, 0.01, 10.0, 10.0, 0.0002, 0.0005, true,
        )
        .unwrap();
        assert!(with_fees.net_pct_of_margin < 0.0);
    }

    #[test]
    fn degenerate_inputs_fail_closed() {
        // A zero price must never turn into a −100% loss.
        assert!(compute_pnl(
            Side::Long, 100.0, 0.0, 10.0, 0.01, 10.0, 10.0, 0.0, 0.0, true
        )
        .is_err());
        assert!(compute_pnl(
            Side::Long, 0.0, 100.0, 10.0, 0.01, 10.0, 10.0, 0.0, 0.0, true
        )
        .is_err());
        assert!(compute_pnl(
            Side::Long, 100.0, 100.0, 0.0, 0.01, 10.0, 10.0, 0.0, 0.0, true
        )
        .is_err());
        assert!(compute_pnl(
            Side::Long, 100.0, 100.0, 10.0, 0.01, 0.0, 10.0, 0.0, 0.0, true
        )
        .is_err());
        assert!(compute_pnl(
            Side::Long, 100.0, 100.0, 10.0, 0.01, 10.0, 0.0, 0.0, 0.0, true
        )
        .is_err());
    }

    #[test]
    fn realized_pnl_matches_cashflows() {
        // Entry 100, exit 102, 50 contracts of 0.01 BTC at 10x on 10 USD margin.
        let size = 50.0;
        let ct_val = 0.01;
        let margin = 10.0;
        let pnl = compute_pnl(
            Side::Long, 100.0, 102.0, size, ct_val, margin, 10.0, 0.0002, 0.0005, true,
        )
        .unwrap();

        let cashflow = size * ct_val * (102.0 - 100.0);
        let fees = (0.0002 + 0.0005) * 10.0 * margin;
        assert!((pnl.net_usd - (cashflow - fees)).abs() < 1e-9);
    }
}
