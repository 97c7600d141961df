use crate::signal::{ConditionedSample, FrameSample, RingBuffer};
use serde::{Deserialize, Serialize};

/// Detrending and band-limiting parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionerConfig {
    /// Samples before this much signal has been seen are flagged untrusted (seconds).
    pub warmup_s: f64,
    /// Moving-average window subtracted as baseline (seconds).
    pub baseline_window_s: f64,
    /// Lower edge of the plausible heart-rate band (Hz).
    pub band_low_hz: f64,
    /// Upper edge of the plausible heart-rate band (Hz).
    pub band_high_hz: f64,
    /// Window over which the conditioned RMS amplitude is measured (seconds).
    pub amplitude_window_s: f64,
    /// EWMA weight of each new sample in the noise estimate.
    pub noise_smoothing: f64,
    /// Lower bound on the noise floor, in intensity units.
    pub min_noise_floor: f64,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            warmup_s: 2.0,
            baseline_window_s: 1.0,
            band_low_hz: 0.67,
            band_high_hz: 3.3,
            amplitude_window_s: 2.0,
            noise_smoothing: 0.05,
            min_noise_floor: 0.05,
        }
    }
}

/// Streaming single-pole high-pass filter with per-sample time step.
#[derive(Debug, Clone, Copy)]
struct SinglePoleHighpass {
    rc: f64,
    prev_x: Option<f64>,
    prev_y: f64,
}

impl SinglePoleHighpass {
    fn new(cutoff: f64) -> Self {
        Self {
            rc: 1.0 / (2.0 * std::f64::consts::PI * cutoff.max(0.01)),
            prev_x: None,
            prev_y: 0.0,
        }
    }

    fn step(&mut self, x: f64, dt: f64) -> f64 {
        let prev_x = self.prev_x.unwrap_or(x);
        let alpha = self.rc / (self.rc + dt);
        let y = alpha * (self.prev_y + x - prev_x);
        self.prev_x = Some(x);
        self.prev_y = y;
        y
    }
}

/// Streaming single-pole low-pass filter with per-sample time step.
#[derive(Debug, Clone, Copy)]
struct SinglePoleLowpass {
    rc: f64,
    prev: Option<f64>,
}

impl SinglePoleLowpass {
    fn new(cutoff: f64) -> Self {
        Self {
            rc: 1.0 / (2.0 * std::f64::consts::PI * cutoff.max(0.01)),
            prev: None,
        }
    }

    fn step(&mut self, x: f64, dt: f64) -> f64 {
        let alpha = dt / (self.rc + dt);
        let prev = self.prev.unwrap_or(x);
        let y = prev + alpha * (x - prev);
        self.prev = Some(y);
        y
    }
}

/// Linear predictor for a pulse and its first harmonic.
///
/// Any sum of two sinusoids at `w` and `2w` satisfies
/// `d[n] + d[n-4] = a1 (d[n-1] + d[n-3]) + a2 d[n-2]` exactly, whatever the
/// rate, so the prediction residual only carries what is not pulse. It runs
/// on first differences `d` so a constant offset left by the baseline
/// (a linear drift) is not mistaken for noise. The coefficients are refit
/// continuously from exponentially weighted normal equations.
#[derive(Debug, Clone)]
struct HarmonicPredictor {
    prev: Option<f64>,
    recent: RingBuffer<f64>,
    weight: f64,
    /// Weighted moments `[u1 u1, u1 u2, u2 u2, u1 y, u2 y]`.
    moments: [f64; 5],
}

impl HarmonicPredictor {
    fn new(weight: f64) -> Self {
        Self {
            prev: None,
            recent: RingBuffer::with_capacity(5),
            weight: weight.clamp(0.0, 1.0),
            moments: [0.0; 5],
        }
    }

    /// Forget the buffered samples; the fitted coefficients are kept.
    fn restart(&mut self) {
        self.prev = None;
        self.recent.clear();
    }

    /// Push a detrended sample; once enough are buffered, returns the
    /// prediction residual scaled so white noise of deviation `s` yields `s`.
    fn step(&mut self, x: f64) -> Option<f64> {
        let prev = self.prev.replace(x)?;
        self.recent.push(x - prev);
        if !self.recent.is_full() {
            return None;
        }
        let at = |i: usize| self.recent.get(i).unwrap_or(0.0);
        let y = at(4) + at(0);
        let u1 = at(3) + at(1);
        let u2 = at(2);

        let w = self.weight;
        for (m, v) in self
            .moments
            .iter_mut()
            .zip([u1 * u1, u1 * u2, u2 * u2, u1 * y, u2 * y])
        {
            *m = (1.0 - w) * *m + w * v;
        }
        let (a1, a2) = self.coefficients();
        let residual = y - a1 * u1 - a2 * u2;
        // white noise reaches the residual through taps
        // [1, -(1+a1), a1-a2, a2-a1, 1+a1, -1]
        let gain = 2.0 + 2.0 * (1.0 + a1).powi(2) + 2.0 * (a1 - a2).powi(2);
        Some(residual / gain.sqrt())
    }

    /// Ridge-regularised least squares; a pure sinusoid makes the system
    /// singular and the ridge picks the smallest exact predictor.
    fn coefficients(&self) -> (f64, f64) {
        let [s11, s12, s22, b1, b2] = self.moments;
        let ridge = 1e-6 * (s11 + s22);
        let (s11, s22) = (s11 + ridge, s22 + ridge);
        let det = s11 * s22 - s12 * s12;
        if !(det.is_finite() && det > f64::MIN_POSITIVE) {
            return (0.0, 0.0);
        }
        ((b1 * s22 - b2 * s12) / det, (s11 * b2 - s12 * b1) / det)
    }
}

/// Turns raw intensity samples into a detrended, band-limited pulse signal.
///
/// All state lives in fixed-capacity rings sized from the nominal sample
/// rate, so memory use does not grow with session length.
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    cfg: ConditionerConfig,
    fs: f64,
    baseline: RingBuffer<f64>,
    baseline_sum: f64,
    predictor: HarmonicPredictor,
    highpass: SinglePoleHighpass,
    lowpass: [SinglePoleLowpass; 2],
    amplitude: RingBuffer<f64>,
    amplitude_sum_sq: f64,
    noise_var: f64,
    last_timestamp: Option<f64>,
    seen: usize,
    warmup_samples: usize,
}

impl SignalConditioner {
    pub fn new(cfg: ConditionerConfig, fs: f64) -> Self {
        let fs = fs.max(1.0);
        let samples = |seconds: f64| ((seconds * fs).round() as usize).max(1);
        Self {
            cfg,
            fs,
            baseline: RingBuffer::with_capacity(samples(cfg.baseline_window_s)),
            baseline_sum: 0.0,
            predictor: HarmonicPredictor::new(cfg.noise_smoothing),
            highpass: SinglePoleHighpass::new(cfg.band_low_hz),
            lowpass: [
                SinglePoleLowpass::new(cfg.band_high_hz),
                SinglePoleLowpass::new(cfg.band_high_hz),
            ],
            amplitude: RingBuffer::with_capacity(samples(cfg.amplitude_window_s)),
            amplitude_sum_sq: 0.0,
            noise_var: 0.0,
            last_timestamp: None,
            seen: 0,
            warmup_samples: samples(cfg.warmup_s),
        }
    }

    /// Fold one sample into the rolling state and emit its conditioned value.
    pub fn push(&mut self, sample: FrameSample) -> ConditionedSample {
        let nominal_dt = 1.0 / self.fs;
        let gap = self.last_timestamp.map(|prev| sample.timestamp - prev);
        if gap.is_some_and(|g| g > 1.5 * nominal_dt) {
            // the predictor needs evenly spaced samples
            self.predictor.restart();
        }
        let dt = gap
            .map(|g| g.clamp(0.2 * nominal_dt, 0.5))
            .unwrap_or(nominal_dt);
        self.last_timestamp = Some(sample.timestamp);
        self.seen = self.seen.saturating_add(1);

        // (a) baseline drift removal
        if let Some(evicted) = self.baseline.push(sample.intensity) {
            self.baseline_sum -= evicted;
        }
        self.baseline_sum += sample.intensity;
        let baseline = self.baseline_sum / self.baseline.len() as f64;
        let detrended = sample.intensity - baseline;

        // (c) noise floor from whatever the pulse model cannot predict
        if let Some(residual) = self.predictor.step(detrended) {
            let w = self.cfg.noise_smoothing.clamp(0.0, 1.0);
            self.noise_var = (1.0 - w) * self.noise_var + w * residual * residual;
        }

        // (b) band-limit to the heart-rate band
        let mut value = self.highpass.step(detrended, dt);
        for lp in self.lowpass.iter_mut() {
            value = lp.step(value, dt);
        }

        if let Some(evicted) = self.amplitude.push(value) {
            self.amplitude_sum_sq -= evicted * evicted;
        }
        self.amplitude_sum_sq += value * value;

        let noise_floor = self.noise_floor();
        ConditionedSample {
            timestamp: sample.timestamp,
            value,
            noise_floor,
            amplitude_ratio: self.amplitude_rms() / noise_floor,
            trusted: self.seen >= self.warmup_samples,
        }
    }

    pub fn noise_floor(&self) -> f64 {
        self.noise_var.sqrt().max(self.cfg.min_noise_floor)
    }

    /// RMS of the conditioned signal over the amplitude window.
    pub fn amplitude_rms(&self) -> f64 {
        if self.amplitude.is_empty() {
            return 0.0;
        }
        (self.amplitude_sum_sq.max(0.0) / self.amplitude.len() as f64).sqrt()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.cfg, self.fs);
    }
}

/// Condition a whole uniformly sampled series at once.
pub fn condition_series(
    data: &[f64],
    fs: f64,
    cfg: &ConditionerConfig,
) -> Vec<ConditionedSample> {
    let mut conditioner = SignalConditioner::new(*cfg, fs);
    data.iter()
        .enumerate()
        .map(|(i, &intensity)| {
            conditioner.push(FrameSample {
                timestamp: i as f64 / fs,
                intensity,
            })
        })
        .collect()
}
