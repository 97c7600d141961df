use crate::signal::{FrameSample, TimeSeries};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthMode {
    /// Finger on the lens: periodic pulse on top of the baseline.
    Pulse,
    /// No finger: constant baseline plus noise only.
    Flat,
    /// Pulse interrupted by large intensity swings every few seconds.
    Motion,
}

/// Deterministic camera-PPG waveform generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticPpg {
    pub bpm: f64,
    pub fs: f64,
    pub seed: u64,
    pub mode: SynthMode,
    pub baseline: f64,
    /// Peak amplitude of the fundamental.
    pub amplitude: f64,
    /// Half-width of the uniform noise added to every sample.
    pub noise: f64,
    /// Slow linear drift (intensity units per second).
    pub drift: f64,
}

impl SyntheticPpg {
    pub const DEFAULT_BASELINE: f64 = 150.0;

    pub fn new(bpm: f64, fs: f64, seed: u64) -> Self {
        Self {
            bpm,
            fs,
            seed,
            mode: SynthMode::Pulse,
            baseline: Self::DEFAULT_BASELINE,
            amplitude: 2.0,
            noise: 0.0,
            drift: 0.0,
        }
    }

    pub fn with_mode(mut self, mode: SynthMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(0.0);
        self
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Samples from t = 0 through t = `seconds` inclusive.
    pub fn frames(&self, seconds: f64) -> Vec<FrameSample> {
        let n = (seconds * self.fs).round().max(0.0) as usize + 1;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let freq = self.bpm / 60.0;
        (0..n)
            .map(|i| {
                let t = i as f64 / self.fs;
                let mut value = self.baseline + self.drift * t;
                if self.mode != SynthMode::Flat {
                    let theta = 2.0 * PI * freq * t;
                    // second harmonic gives the asymmetric systolic upstroke
                    value += self.amplitude * (theta.sin() + 0.2 * (2.0 * theta).sin());
                }
                if self.mode == SynthMode::Motion && (t % 8.0) > 5.0 && (t % 8.0) < 6.5 {
                    value += rng.gen_range(-8.0..8.0) * self.amplitude;
                }
                if self.noise > 0.0 {
                    value += rng.gen_range(-self.noise..=self.noise);
                }
                FrameSample {
                    timestamp: t,
                    intensity: value,
                }
            })
            .collect()
    }

    pub fn series(&self, seconds: f64) -> TimeSeries {
        TimeSeries {
            fs: self.fs,
            data: self.frames(seconds).into_iter().map(|s| s.intensity).collect(),
        }
    }
}
