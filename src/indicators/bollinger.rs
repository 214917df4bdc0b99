// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle = SMA, upper/lower = SMA ± k*σ over the trailing window.
// Band width (upper - lower) / middle * 100 feeds the regime range metric.
// =============================================================================

/// Result of a Bollinger Band calculation over the trailing window.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Normalised band width in percent of the middle band.
    pub width_pct: f64,
}

/// Calculate Bollinger Bands for the trailing `period` closes with `num_std`
/// standard deviations. `None` on short input or a degenerate middle band.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width_pct = (upper - lower) / middle * 100.0;

    if width_pct.is_finite() {
        Some(BollingerResult {
            upper,
            middle,
            lower,
            width_pct,
        })
    } else {
        None
    }
}
