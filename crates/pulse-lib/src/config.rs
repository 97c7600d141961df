use crate::conditioner::ConditionerConfig;
use crate::detectors::peak::PeakDetectorConfig;
use crate::error::PulseError;
use crate::metrics::confidence::ConfidenceConfig;
use crate::metrics::quality::QualityThresholds;
use crate::result::UserContext;
use crate::sampler::SamplerConfig;
use crate::session::SessionConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Every tunable of a measurement, grouped by pipeline stage.
///
/// All sections default individually, so a TOML file only needs to name
/// what it changes:
///
/// ```toml
/// [session]
/// target_s = 20.0
///
/// [user]
/// athletic = true
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub sampler: SamplerConfig,
    pub conditioner: ConditionerConfig,
    pub detector: PeakDetectorConfig,
    pub quality: QualityThresholds,
    pub session: SessionConfig,
    pub confidence: ConfidenceConfig,
    pub user: UserContext,
}

impl MeasurementConfig {
    pub fn validate(&self) -> Result<(), PulseError> {
        let invalid = |msg: &str| Err(PulseError::InvalidConfig(msg.to_string()));
        let positive = |v: f64| v.is_finite() && v > 0.0;

        if !positive(self.sampler.nominal_fps) {
            return invalid("sampler.nominal_fps must be positive");
        }
        if !(self.sampler.roi_fraction > 0.0 && self.sampler.roi_fraction <= 1.0) {
            return invalid("sampler.roi_fraction must be in (0, 1]");
        }
        if !positive(self.sampler.drop_window_s) {
            return invalid("sampler.drop_window_s must be positive");
        }

        let c = &self.conditioner;
        if !(positive(c.band_low_hz) && c.band_high_hz > c.band_low_hz) {
            return invalid("conditioner band must satisfy 0 < band_low_hz < band_high_hz");
        }
        if c.band_high_hz >= self.sampler.nominal_fps / 2.0 {
            return invalid("conditioner.band_high_hz must be below the Nyquist rate");
        }
        if !(positive(c.baseline_window_s) && positive(c.amplitude_window_s)) {
            return invalid("conditioner windows must be positive");
        }
        if !(c.noise_smoothing > 0.0 && c.noise_smoothing <= 1.0) {
            return invalid("conditioner.noise_smoothing must be in (0, 1]");
        }

        let d = &self.detector;
        if !(positive(d.refractory_s) && d.max_interval_s > d.refractory_s) {
            return invalid("detector intervals must satisfy 0 < refractory_s < max_interval_s");
        }
        if d.refractory_s >= 1.0 / c.band_high_hz {
            return invalid("detector.refractory_s must be shorter than one period at conditioner.band_high_hz");
        }
        if d.history == 0 {
            return invalid("detector.history must be at least 1");
        }

        let q = &self.quality;
        if !(q.fair_ratio <= q.good_ratio && q.good_ratio <= q.excellent_ratio) {
            return invalid("quality ratios must be ordered fair <= good <= excellent");
        }
        if !(q.excellent_cv <= q.good_cv && q.good_cv <= q.poor_cv) {
            return invalid("quality CV thresholds must be ordered excellent <= good <= poor");
        }

        let s = &self.session;
        if !(positive(s.target_s) && positive(s.reading_interval_s)) {
            return invalid("session.target_s and reading_interval_s must be positive");
        }
        if s.preparing_s < 0.0 || s.calibrating_s < 0.0 || s.completing_s < 0.0 {
            return invalid("session phase lengths must not be negative");
        }
        if s.completing_s >= s.target_s {
            return invalid("session.completing_s must be shorter than target_s");
        }
        if !positive(s.max_paused_s) || !positive(s.max_frame_gap_s) {
            return invalid("session.max_paused_s and max_frame_gap_s must be positive");
        }
        Ok(())
    }
}

/// Read and validate a TOML measurement configuration.
pub fn load_config(path: &Path) -> Result<MeasurementConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg: MeasurementConfig =
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}
