// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
//   line   = EMA(fast) - EMA(slow)
//   signal = EMA(line, signal_period)
//   hist   = line - signal
//
// Standard parameters: 12 / 26 / 9.
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// Latest MACD values.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MacdResult {
    pub line: f64,
    pub signal: f64,
    pub hist: f64,
}

/// Compute the most recent MACD from a close series.
///
/// Returns `None` when there are not enough closes to produce at least
/// `signal_period` MACD-line values.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_slow.is_empty() {
        return None;
    }

    // Align the two series on their tails: the slow EMA starts later.
    let offset = ema_fast.len().checked_sub(ema_slow.len())?;
    let line_series: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, &slow_v)| ema_fast[offset + i] - slow_v)
        .collect();

    let signal_series = calculate_ema(&line_series, signal_period);
    let signal = *signal_series.last()?;
    let line = *line_series.last()?;
    let hist = line - signal;

    if line.is_finite() && signal.is_finite() {
        Some(MacdResult { line, signal, hist })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards() {
        assert!(calculate_macd(&[1.0; 10], 12, 26, 9).is_none());
        assert!(calculate_macd(&[1.0; 100], 0, 26, 9).is_none());
        assert!(calculate_macd(&[1.0; 100], 26, 12, 9).is_none());
    }

    #[test]
    fn uptrend_has_positive_line() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        // Fast EMA sits above slow EMA in a steady rise.
        assert!(macd.line > 0.0);
    }

    #[test]
    fn downtrend_has_negative_line() {
        let closes: Vec<f64> = (1..=120).rev().map(|x| x as f64).collect();
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.line < 0.0);
    }

    #[test]
    fn flat_series_is_zero() {
        let closes = vec![100.0; 120];
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(macd.line.abs() < 1e-9);
        assert!(macd.hist.abs() < 1e-9);
    }

    #[test]
    fn hist_is_line_minus_signal() {
        let closes: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 8.0)
            .collect();
        let macd = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!((macd.hist - (macd.line - macd.signal)).abs() < 1e-12);
    }
}
