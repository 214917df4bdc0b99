// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//
// RSI > 70 overbought, RSI < 30 oversold.
// =============================================================================

/// RSI series for `closes` and `period`, one value per close starting at
/// index `period`. Empty when input is too short or period is zero.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let first = match rsi_from_averages(avg_gain, avg_loss) {
        Some(v) => v,
        None => return Vec::new(),
    };

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    result.push(first);

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(rsi) => result.push(rsi),
            None => break,
        }
    }

    result
}

/// RSI from smoothed averages. Zero average loss clamps to 100.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return None;
    }
    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    if rsi.is_finite() {
        Some(rsi)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards() {
        assert!(calculate_rsi(&[], 14).is_empty());
        assert!(calculate_rsi(&[1.0; 10], 0).is_empty());
        assert!(calculate_rsi(&[1.0; 10], 14).is_empty());
    }

    #[test]
    fn pure_uptrend_pegs_high() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let rsi = calculate_rsi(&closes, 14);
        assert!(!rsi.is_empty());
        assert!((rsi.last().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn pure_downtrend_pegs_low() {
        let closes: Vec<f64> = (1..=50).rev().map(|x| x as f64).collect();
        let rsi = calculate_rsi(&closes, 14);
        assert!(*rsi.last().unwrap() < 1.0);
    }

    #[test]
    fn flat_series_is_neutral() {
        let closes = vec![100.0; 50];
        let rsi = calculate_rsi(&closes, 14);
        assert!((rsi.last().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn values_bounded() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        for v in calculate_rsi(&closes, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }
}
