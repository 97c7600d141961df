use serde::{Deserialize, Serialize};

/// Coarse reliability bucket for the current measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl SignalQuality {
    /// Contribution of time spent in this bucket to session confidence.
    pub fn weight(&self) -> f64 {
        match self {
            SignalQuality::Poor => 0.0,
            SignalQuality::Fair => 0.55,
            SignalQuality::Good => 0.85,
            SignalQuality::Excellent => 1.0,
        }
    }
}

/// Band edges for [`classify`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Amplitude-to-noise ratio below which the signal is poor (no finger / poor contact).
    pub fair_ratio: f64,
    pub good_ratio: f64,
    pub excellent_ratio: f64,
    /// Interval CV at or below which the rhythm can count as excellent.
    pub excellent_cv: f64,
    /// Interval CV at or below which the rhythm can count as good.
    pub good_cv: f64,
    /// Interval CV above which the window is treated as motion artifact.
    pub poor_cv: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            fair_ratio: 2.0,
            good_ratio: 4.0,
            excellent_ratio: 8.0,
            excellent_cv: 0.08,
            good_cv: 0.15,
            poor_cv: 0.25,
        }
    }
}

/// Classify a window from its amplitude-to-noise ratio and interval regularity.
///
/// `interval_cv` is `None` while fewer than two intervals are known; such a
/// window can be at most fair.
pub fn classify(
    amplitude_ratio: f64,
    interval_cv: Option<f64>,
    thresholds: &QualityThresholds,
) -> SignalQuality {
    if !amplitude_ratio.is_finite() || amplitude_ratio < thresholds.fair_ratio {
        return SignalQuality::Poor;
    }
    let by_amplitude = if amplitude_ratio >= thresholds.excellent_ratio {
        SignalQuality::Excellent
    } else if amplitude_ratio >= thresholds.good_ratio {
        SignalQuality::Good
    } else {
        SignalQuality::Fair
    };
    let by_rhythm = match interval_cv {
        None => SignalQuality::Fair,
        Some(cv) if !cv.is_finite() || cv > thresholds.poor_cv => return SignalQuality::Poor,
        Some(cv) if cv > thresholds.good_cv => SignalQuality::Fair,
        Some(cv) if cv > thresholds.excellent_cv => SignalQuality::Good,
        Some(_) => SignalQuality::Excellent,
    };
    by_amplitude.min(by_rhythm)
}

/// Seconds spent in each quality bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityHistory {
    pub poor_s: f64,
    pub fair_s: f64,
    pub good_s: f64,
    pub excellent_s: f64,
}

impl QualityHistory {
    pub fn record(&mut self, quality: SignalQuality, dt: f64) {
        let dt = dt.max(0.0);
        match quality {
            SignalQuality::Poor => self.poor_s += dt,
            SignalQuality::Fair => self.fair_s += dt,
            SignalQuality::Good => self.good_s += dt,
            SignalQuality::Excellent => self.excellent_s += dt,
        }
    }

    pub fn total_s(&self) -> f64 {
        self.poor_s + self.fair_s + self.good_s + self.excellent_s
    }

    pub fn fraction(&self, quality: SignalQuality) -> f64 {
        let total = self.total_s();
        if total <= 0.0 {
            return 0.0;
        }
        let spent = match quality {
            SignalQuality::Poor => self.poor_s,
            SignalQuality::Fair => self.fair_s,
            SignalQuality::Good => self.good_s,
            SignalQuality::Excellent => self.excellent_s,
        };
        spent / total
    }

    /// Time-weighted mean of the bucket weights; 1.0 when nothing was recorded.
    pub fn weighted_score(&self) -> f64 {
        let total = self.total_s();
        if total <= 0.0 {
            return 1.0;
        }
        (self.poor_s * SignalQuality::Poor.weight()
            + self.fair_s * SignalQuality::Fair.weight()
            + self.good_s * SignalQuality::Good.weight()
            + self.excellent_s * SignalQuality::Excellent.weight())
            / total
    }
}
