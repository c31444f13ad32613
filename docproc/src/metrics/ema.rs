//! Exponential moving average.

use serde::{Deserialize, Serialize};

/// Smoothing factor used for duration averages.
pub const DEFAULT_ALPHA: f64 = 0.1;

/// Exponential moving average seeded by its first sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Default for Ema {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
        }
    }

    pub fn record(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(current) => self.alpha * sample + (1.0 - self.alpha) * current,
            None => sample,
        });
    }

    /// Current average, zero before any sample.
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_average() {
        let mut ema = Ema::default();
        assert_eq!(ema.value(), 0.0);
        ema.record(10.0);
        assert_eq!(ema.value(), 10.0);
    }

    #[test]
    fn test_smoothing() {
        let mut ema = Ema::default();
        ema.record(10.0);
        ema.record(20.0);
        assert!((ema.value() - 11.0).abs() < 1e-9);
    }
}
