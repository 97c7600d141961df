use crate::metrics::quality::{QualityHistory, SignalQuality};
use crate::signal::mean_std;
use serde::{Deserialize, Serialize};

/// Discrete trust level reported alongside the confidence fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_fraction(confidence: f64) -> Self {
        match confidence {
            c if c >= 0.8 => ConfidenceLevel::VeryHigh,
            c if c >= 0.6 => ConfidenceLevel::High,
            c if c >= 0.4 => ConfidenceLevel::Moderate,
            c if c >= 0.2 => ConfidenceLevel::Low,
            _ => ConfidenceLevel::VeryLow,
        }
    }
}

/// Policy knobs for [`ConfidenceEstimator`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Number of trailing readings used for the variance and the error bound.
    pub final_window: usize,
    /// Reading variance (BPM²) at which the stability factor halves.
    pub variance_scale: f64,
    /// Readings needed before the estimate is taken at face value.
    pub min_readings: usize,
    /// Poor-quality share that rules out high / very high confidence.
    pub substantial_poor_fraction: f64,
    /// Poor-quality share that rules out anything above low confidence.
    pub dominant_poor_fraction: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            final_window: 10,
            variance_scale: 16.0,
            min_readings: 3,
            substantial_poor_fraction: 0.25,
            dominant_poor_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceEstimate {
    /// Trust in the final BPM, in [0, 1].
    pub confidence: f64,
    pub level: ConfidenceLevel,
    /// Half-width of the reported range ("±N"); zero when there are no readings.
    pub error_bound_bpm: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceEstimator {
    cfg: ConfidenceConfig,
}

impl ConfidenceEstimator {
    pub fn new(cfg: ConfidenceConfig) -> Self {
        Self { cfg }
    }

    /// Score a session from its readings and the time spent in each quality bucket.
    ///
    /// `expected_readings` is how many readings a full, never-paused session
    /// produces; fewer readings lower the score proportionally.
    pub fn estimate(
        &self,
        readings: &[u32],
        history: &QualityHistory,
        expected_readings: usize,
    ) -> ConfidenceEstimate {
        if readings.is_empty() {
            return ConfidenceEstimate {
                confidence: 0.0,
                level: ConfidenceLevel::VeryLow,
                error_bound_bpm: 0,
            };
        }

        let tail_start = readings.len().saturating_sub(self.cfg.final_window.max(1));
        let tail: Vec<f64> = readings[tail_start..].iter().map(|&r| r as f64).collect();
        let (_, sd) = mean_std(&tail).unwrap_or((0.0, 0.0));
        let stability = 1.0 / (1.0 + sd * sd / self.cfg.variance_scale.max(f64::EPSILON));

        let coverage = if expected_readings == 0 {
            1.0
        } else {
            (readings.len() as f64 / expected_readings as f64).min(1.0)
        };
        let maturity = (readings.len() as f64 / self.cfg.min_readings.max(1) as f64).min(1.0);

        let mut confidence =
            (stability * history.weighted_score() * coverage * maturity).clamp(0.0, 1.0);

        let poor = history.fraction(SignalQuality::Poor);
        if poor >= self.cfg.dominant_poor_fraction {
            confidence = confidence.min(0.39);
        } else if poor >= self.cfg.substantial_poor_fraction {
            confidence = confidence.min(0.59);
        }

        ConfidenceEstimate {
            confidence,
            level: ConfidenceLevel::from_fraction(confidence),
            error_bound_bpm: (sd.round() as u32).max(1),
        }
    }
}
