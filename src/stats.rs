use crate::error::{Error, Result};

/// z-score of the two-sided 95% normal interval.
const Z_95: f64 = 1.96;

/// Mean of the runs and the bounds of its 95% confidence interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub mean: f64,
    pub low: f64,
    pub high: f64,
}

impl Interval {
    pub fn half_width(&self) -> f64 {
        (self.high - self.low) / 2.0
    }
}

/// Mean and normal-approximation confidence interval over per-run results.
///
/// Uses the sample standard deviation (n - 1 denominator). A single result
/// gives the degenerate interval `[v, v]`; an empty slice is an error.
pub fn stats(results: &[f64]) -> Result<Interval> {
    let n = results.len();
    if n == 0 {
        return Err(Error::InsufficientSamples(0));
    }
    let mean = results.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return Ok(Interval {
            mean,
            low: mean,
            high: mean,
        });
    }

    let variance = results.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let stderr = variance.sqrt() / (n as f64).sqrt();
    Ok(Interval {
        mean,
        low: mean - Z_95 * stderr,
        high: mean + Z_95 * stderr,
    })
}
