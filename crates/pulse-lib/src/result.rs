use crate::error::PulseError;
use crate::metrics::confidence::{ConfidenceEstimate, ConfidenceLevel};
use crate::signal::median;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Resting heart-rate category of a finalized reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BpmCategory {
    Low,
    /// Below 60 BPM for someone who reported regular endurance training.
    Athlete,
    Normal,
    Elevated,
    High,
}

impl BpmCategory {
    pub fn from_bpm(bpm: u32, user: &UserContext) -> Self {
        match bpm {
            0..=59 if user.athletic => BpmCategory::Athlete,
            0..=59 => BpmCategory::Low,
            60..=100 => BpmCategory::Normal,
            101..=140 => BpmCategory::Elevated,
            _ => BpmCategory::High,
        }
    }
}

/// What the caller knows about the person being measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserContext {
    pub athletic: bool,
}

/// Finalized output of one completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    /// Absent when the session never produced a reading.
    #[serde(rename = "finalBPM")]
    pub final_bpm: Option<u32>,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub category: Option<BpmCategory>,
    #[serde(rename = "errorBoundBPM")]
    pub error_bound_bpm: u32,
    #[serde(rename = "bpmReadings")]
    pub bpm_readings: Vec<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Outlier-robust average of per-second readings.
///
/// Readings further than `mad_cutoff` scaled MADs from the median are
/// dropped before averaging.
#[derive(Debug, Clone, Copy)]
pub struct ResultAggregator {
    pub mad_cutoff: f64,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self { mad_cutoff: 3.0 }
    }
}

impl ResultAggregator {
    pub fn final_bpm(&self, readings: &[u32]) -> Option<u32> {
        let values: Vec<f64> = readings.iter().map(|&r| r as f64).collect();
        let center = median(&values)?;
        let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
        let mad = median(&deviations).unwrap_or(0.0) * 1.4826;
        // a zero MAD still admits readings one BPM away
        let limit = (self.mad_cutoff * mad).max(1.0);
        let kept: Vec<f64> = values
            .iter()
            .copied()
            .filter(|v| (v - center).abs() <= limit)
            .collect();
        let mean = if kept.is_empty() {
            center
        } else {
            kept.iter().sum::<f64>() / kept.len() as f64
        };
        Some(mean.round() as u32)
    }

    pub fn finalize(
        &self,
        readings: &[u32],
        estimate: ConfidenceEstimate,
        user: &UserContext,
        timestamp: DateTime<Utc>,
    ) -> MeasurementResult {
        let final_bpm = self.final_bpm(readings);
        MeasurementResult {
            final_bpm,
            confidence: estimate.confidence,
            confidence_level: estimate.level,
            category: final_bpm.map(|bpm| BpmCategory::from_bpm(bpm, user)),
            error_bound_bpm: estimate.error_bound_bpm,
            bpm_readings: readings.to_vec(),
            timestamp,
        }
    }
}

/// Persistence collaborator for finalized results.
pub trait ResultSink {
    fn save(&mut self, result: &MeasurementResult) -> Result<(), PulseError>;
}

/// A finalized result awaiting the caller's save-or-discard decision.
#[derive(Debug, Clone, Default)]
pub struct PendingResult {
    result: Option<MeasurementResult>,
}

impl PendingResult {
    pub fn set(&mut self, result: MeasurementResult) {
        if self.result.is_some() {
            warn!("replacing an unsaved result");
        }
        self.result = Some(result);
    }

    pub fn get(&self) -> Option<&MeasurementResult> {
        self.result.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.result.is_some()
    }

    /// Hand the result to `sink`. On failure the result stays pending so the
    /// caller can retry.
    pub fn save(&mut self, sink: &mut dyn ResultSink) -> Result<MeasurementResult, PulseError> {
        let result = self.result.as_ref().ok_or(PulseError::NoResult)?;
        match sink.save(result) {
            Ok(()) => {
                info!("saved result {:?} BPM", result.final_bpm);
                self.result.take().ok_or(PulseError::NoResult)
            }
            Err(err) => {
                warn!("save failed, keeping result pending: {err}");
                Err(match err {
                    PulseError::SaveFailure(_) => err,
                    other => PulseError::SaveFailure(other.to_string()),
                })
            }
        }
    }

    pub fn discard(&mut self) -> Option<MeasurementResult> {
        self.result.take()
    }
}
