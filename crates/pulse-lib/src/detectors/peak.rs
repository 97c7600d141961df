use crate::signal::{median, mean_std, ConditionedSample, PeakEvent, RingBuffer};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Configurable parameters for heartbeat detection on the conditioned pulse signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakDetectorConfig {
    /// Minimum physiological beat-to-beat distance (seconds).
    pub refractory_s: f64,
    /// Longest interval still accepted as one beat (seconds); longer gaps re-anchor.
    pub max_interval_s: f64,
    /// Minimum prominence as a multiple of the noise floor.
    pub min_prominence_noise: f64,
    /// Minimum prominence as a fraction of the recent peak-to-peak amplitude.
    pub min_prominence_relative: f64,
    /// Number of inter-beat intervals kept for smoothing.
    pub history: usize,
}

impl Default for PeakDetectorConfig {
    fn default() -> Self {
        Self {
            refractory_s: 0.28,
            max_interval_s: 1.5,
            min_prominence_noise: 3.0,
            min_prominence_relative: 0.35,
            history: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Point {
    t: f64,
    v: f64,
}

/// Streaming local-maximum detector with refractory tie-breaking.
///
/// A candidate peak is held back for one refractory interval; a stronger
/// candidate arriving inside that window replaces it, so a beat is never
/// counted twice.
#[derive(Debug, Clone)]
pub struct PeakDetector {
    cfg: PeakDetectorConfig,
    prev: [Option<Point>; 2],
    trough: f64,
    pending: Option<PeakEvent>,
    last_peak: Option<PeakEvent>,
    intervals: RingBuffer<f64>,
}

impl PeakDetector {
    pub fn new(cfg: PeakDetectorConfig) -> Self {
        Self {
            cfg,
            prev: [None, None],
            trough: f64::INFINITY,
            pending: None,
            last_peak: None,
            intervals: RingBuffer::with_capacity(cfg.history.max(1)),
        }
    }

    /// Feed one conditioned sample; returns a peak once it is confirmed.
    pub fn push(&mut self, sample: &ConditionedSample) -> Option<PeakEvent> {
        let now = Point {
            t: sample.timestamp,
            v: sample.value,
        };

        if let Some(last) = self.last_peak {
            if now.t - last.timestamp > 2.0 * self.cfg.max_interval_s && self.pending.is_none() {
                debug!("no beat for {:.1}s, clearing interval history", now.t - last.timestamp);
                self.last_peak = None;
                self.intervals.clear();
            }
        }

        let committed = match self.pending {
            Some(p) if now.t - p.timestamp >= self.cfg.refractory_s => {
                self.pending = None;
                self.commit(p);
                Some(p)
            }
            _ => None,
        };

        if let [Some(a), Some(b)] = self.prev {
            self.trough = self.trough.min(b.v);
            if b.v > a.v && b.v >= now.v && b.v > 0.0 {
                self.consider(a, b, now, sample);
            }
        }
        self.prev = [self.prev[1], Some(now)];
        committed
    }

    fn consider(&mut self, a: Point, b: Point, c: Point, sample: &ConditionedSample) {
        let peak = refine_peak(a, b, c);
        let prominence = peak.v - self.trough;
        let p2p = 2.0 * std::f64::consts::SQRT_2 * sample.amplitude_ratio * sample.noise_floor;
        let threshold = (self.cfg.min_prominence_noise * sample.noise_floor)
            .max(self.cfg.min_prominence_relative * p2p);
        if !prominence.is_finite() || prominence < threshold {
            trace!(
                "rejecting candidate at {:.3}s: prominence {:.3} < {:.3}",
                peak.t,
                prominence,
                threshold
            );
            return;
        }
        let candidate = PeakEvent {
            timestamp: peak.t,
            prominence,
        };
        match self.pending {
            Some(p) if candidate.prominence > p.prominence => {
                trace!("replacing candidate at {:.3}s with {:.3}s", p.timestamp, peak.t);
                self.pending = Some(candidate);
            }
            Some(_) => {
                trace!("discarding weaker candidate at {:.3}s", peak.t);
                return;
            }
            None => {
                if let Some(last) = self.last_peak {
                    if candidate.timestamp - last.timestamp < self.cfg.refractory_s {
                        trace!("candidate at {:.3}s inside refractory window", peak.t);
                        return;
                    }
                }
                self.pending = Some(candidate);
            }
        }
        self.trough = c.v;
    }

    fn commit(&mut self, peak: PeakEvent) {
        if let Some(last) = self.last_peak {
            let interval = peak.timestamp - last.timestamp;
            if interval <= self.cfg.max_interval_s {
                self.intervals.push(interval);
            } else {
                debug!("interval {:.2}s too long, re-anchoring at {:.3}s", interval, peak.timestamp);
            }
        }
        self.last_peak = Some(peak);
    }

    /// 60 / median of the recent intervals.
    pub fn smoothed_bpm(&self) -> Option<f64> {
        median(&self.intervals.to_vec()).map(|m| 60.0 / m)
    }

    /// Coefficient of variation of the recent intervals; needs at least two.
    pub fn interval_cv(&self) -> Option<f64> {
        if self.intervals.len() < 2 {
            return None;
        }
        interval_cv(&self.intervals.to_vec())
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.cfg);
    }
}

/// Standard deviation over mean of a set of intervals.
pub fn interval_cv(intervals: &[f64]) -> Option<f64> {
    let (mean, sd) = mean_std(intervals)?;
    if mean <= 0.0 {
        return None;
    }
    Some(sd / mean)
}

/// Run the streaming detector over a whole conditioned series.
pub fn detect_peaks(samples: &[ConditionedSample], cfg: &PeakDetectorConfig) -> Vec<PeakEvent> {
    let mut detector = PeakDetector::new(*cfg);
    let mut peaks: Vec<PeakEvent> = samples
        .iter()
        .filter(|s| s.trusted)
        .filter_map(|s| detector.push(s))
        .collect();
    if let Some(pending) = detector.pending {
        peaks.push(pending);
    }
    peaks
}

/// Parabolic interpolation through three samples around a local maximum.
fn refine_peak(a: Point, b: Point, c: Point) -> Point {
    let denom = a.v - 2.0 * b.v + c.v;
    if denom.abs() < f64::EPSILON {
        return b;
    }
    let offset = (0.5 * (a.v - c.v) / denom).clamp(-0.5, 0.5);
    let dt = if offset < 0.0 { b.t - a.t } else { c.t - b.t };
    Point {
        t: b.t + offset * dt,
        v: b.v - 0.25 * (a.v - c.v) * offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioner::{condition_series, ConditionerConfig};
    use std::f64::consts::PI;

    fn pulse(fs: f64, seconds: f64, freq: f64) -> Vec<f64> {
        let n = (fs * seconds) as usize;
        (0..n)
            .map(|i| 150.0 + 2.0 * (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn bpm_for(freq: f64) -> f64 {
        let fs = 30.0;
        let conditioned = condition_series(&pulse(fs, 12.0, freq), fs, &ConditionerConfig::default());
        let mut detector = PeakDetector::new(PeakDetectorConfig::default());
        for s in conditioned.iter().filter(|s| s.trusted) {
            detector.push(s);
        }
        detector.smoothed_bpm().expect("bpm")
    }

    #[test]
    fn converges_on_clean_sinusoids() {
        for freq in [1.0, 1.1, 1.25, 1.5, 2.0, 2.5] {
            let bpm = bpm_for(freq);
            assert!(
                (bpm - 60.0 * freq).abs() <= 2.0,
                "expected {} got {}",
                60.0 * freq,
                bpm
            );
        }
    }

    #[test]
    fn follows_rates_near_top_of_band() {
        let bpm = bpm_for(3.2);
        assert!((bpm - 192.0).abs() <= 3.0, "expected 192 got {}", bpm);
    }

    #[test]
    fn regular_beats_have_low_cv() {
        let fs = 30.0;
        let conditioned = condition_series(&pulse(fs, 12.0, 1.25), fs, &ConditionerConfig::default());
        let mut detector = PeakDetector::new(PeakDetectorConfig::default());
        for s in &conditioned {
            detector.push(s);
        }
        assert!(detector.interval_cv().unwrap() < 0.05);
    }

    fn raw(i: usize, value: f64) -> ConditionedSample {
        ConditionedSample {
            timestamp: i as f64 / 30.0,
            value,
            noise_floor: 0.01,
            amplitude_ratio: 0.0,
            trusted: true,
        }
    }

    #[test]
    fn keeps_stronger_peak_inside_refractory_window() {
        let mut values = vec![-1.0; 90];
        values[30] = 0.2;
        values[31] = -0.5;
        values[32] = -0.5;
        values[33] = 1.5;
        values[60] = 1.5;
        let mut detector = PeakDetector::new(PeakDetectorConfig::default());
        let peaks: Vec<PeakEvent> = values
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| detector.push(&raw(i, v)))
            .collect();
        assert_eq!(peaks.len(), 2);
        assert!((peaks[0].timestamp - 1.1).abs() < 0.02);
        assert!((peaks[1].timestamp - peaks[0].timestamp - 0.9).abs() < 0.01);
        assert!(peaks.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
    }

    #[test]
    fn ignores_bumps_below_noise_floor() {
        let values: Vec<f64> = (0..120)
            .map(|i| if i % 20 == 10 { 0.02 } else { 0.0 })
            .collect();
        let mut detector = PeakDetector::new(PeakDetectorConfig::default());
        let count = values
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| detector.push(&raw(i, v)))
            .count();
        assert_eq!(count, 0);
        assert!(detector.smoothed_bpm().is_none());
    }

    #[test]
    fn batch_detection_respects_refractory() {
        let fs = 30.0;
        let conditioned = condition_series(&pulse(fs, 10.0, 1.5), fs, &ConditionerConfig::default());
        let cfg = PeakDetectorConfig::default();
        let peaks = detect_peaks(&conditioned, &cfg);
        assert!(peaks.len() >= 10);
        assert!(peaks
            .windows(2)
            .all(|w| w[1].timestamp - w[0].timestamp >= cfg.refractory_s));
    }

    #[test]
    fn cv_of_constant_intervals_is_zero() {
        assert!(interval_cv(&[0.8, 0.8, 0.8]).unwrap().abs() < 1e-12);
        assert!(interval_cv(&[]).is_none());
    }
}
