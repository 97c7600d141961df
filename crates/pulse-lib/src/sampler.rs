use crate::error::PulseError;
use crate::signal::{FramePayload, FrameSample, RawFrame, RingBuffer};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Which color plane the intensity is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorChannel {
    Red,
    Green,
    Blue,
    Luma,
}

/// Frame reduction and drop monitoring parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Expected capture rate (frames per second).
    pub nominal_fps: f64,
    pub channel: ColorChannel,
    /// Side length of the central region of interest, as a fraction of the frame.
    pub roi_fraction: f64,
    /// Sliding window used to compute the drop ratio (seconds).
    pub drop_window_s: f64,
    /// Drop ratio above which the window counts as overloaded.
    pub overload_drop_ratio: f64,
    /// How long the ratio must stay above the limit before overload is reported (seconds).
    pub overload_sustain_s: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            nominal_fps: 30.0,
            channel: ColorChannel::Red,
            roi_fraction: 0.5,
            drop_window_s: 2.0,
            overload_drop_ratio: 0.3,
            overload_sustain_s: 1.0,
        }
    }
}

/// Reduces camera frames to one intensity sample each.
///
/// Late (non-monotonic) and malformed frames are skipped silently; gaps in the
/// timestamp stream are counted as drops. A malformed frame with a usable
/// timestamp is counted through the gap it leaves, not on its own. Only a sustained drop ratio is
/// reported, through [`FrameSampler::overload`].
#[derive(Debug, Clone)]
pub struct FrameSampler {
    cfg: SamplerConfig,
    last_timestamp: Option<f64>,
    pending_drops: u64,
    dropped_total: u64,
    /// (timestamp, drops preceding the frame) for each accepted frame.
    window: RingBuffer<(f64, u64)>,
    overloaded_since: Option<f64>,
    overloaded: bool,
}

impl FrameSampler {
    pub fn new(cfg: SamplerConfig) -> Self {
        let capacity = (cfg.drop_window_s * cfg.nominal_fps).ceil().max(1.0) as usize + 1;
        Self {
            cfg,
            last_timestamp: None,
            pending_drops: 0,
            dropped_total: 0,
            window: RingBuffer::with_capacity(capacity),
            overloaded_since: None,
            overloaded: false,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.cfg
    }

    /// Reduce `frame` to a sample, or `None` when it has to be skipped.
    pub fn sample(&mut self, frame: &RawFrame) -> Option<FrameSample> {
        if !frame.timestamp.is_finite() {
            return self.skip("non-finite timestamp");
        }
        if let Some(prev) = self.last_timestamp {
            if frame.timestamp <= prev {
                return self.skip("late frame");
            }
        }
        let intensity = match self.reduce(&frame.payload) {
            Some(v) if v.is_finite() => v,
            _ => {
                debug!("skipping malformed frame at t={:.3}s", frame.timestamp);
                return None;
            }
        };

        let mut drops = std::mem::take(&mut self.pending_drops);
        if let Some(prev) = self.last_timestamp {
            let period = 1.0 / self.cfg.nominal_fps;
            let gap = frame.timestamp - prev;
            if gap > 1.5 * period {
                // float to int casts saturate, so a huge jump cannot wrap
                let missing = ((gap / period).round() as u64).saturating_sub(1);
                debug!("{} frame(s) missing before t={:.3}s", missing, frame.timestamp);
                drops = drops.saturating_add(missing);
                self.dropped_total = self.dropped_total.saturating_add(missing);
            }
        }
        self.last_timestamp = Some(frame.timestamp);
        self.window.push((frame.timestamp, drops));
        self.update_overload(frame.timestamp);

        Some(FrameSample {
            timestamp: frame.timestamp,
            intensity,
        })
    }

    /// Sustained-drop condition, if one is currently in effect.
    pub fn overload(&self) -> Option<PulseError> {
        if !self.overloaded {
            return None;
        }
        let dropped = self.window.iter().fold(0u64, |acc, (_, d)| acc.saturating_add(d));
        Some(PulseError::ProcessingOverload {
            dropped,
            window_s: self.cfg.drop_window_s,
        })
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Fraction of expected frames that were dropped over the sliding window.
    pub fn drop_ratio(&self) -> f64 {
        let accepted = self.window.len() as f64;
        let dropped: f64 = self.window.iter().map(|(_, d)| d as f64).sum();
        if accepted + dropped == 0.0 {
            0.0
        } else {
            dropped / (accepted + dropped)
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.cfg);
    }

    fn skip(&mut self, reason: &str) -> Option<FrameSample> {
        debug!("skipping frame: {}", reason);
        self.pending_drops = self.pending_drops.saturating_add(1);
        self.dropped_total = self.dropped_total.saturating_add(1);
        None
    }

    fn update_overload(&mut self, now: f64) {
        let horizon = now - self.cfg.drop_window_s;
        while matches!(self.window.get(0), Some((t, _)) if t < horizon) {
            self.window.pop_front();
        }

        if self.drop_ratio() > self.cfg.overload_drop_ratio {
            let since = *self.overloaded_since.get_or_insert(now);
            if !self.overloaded && now - since >= self.cfg.overload_sustain_s {
                warn!(
                    "frame processing overloaded: drop ratio {:.2} sustained for {:.1}s",
                    self.drop_ratio(),
                    now - since
                );
                self.overloaded = true;
            }
        } else {
            if self.overloaded {
                debug!("frame drop ratio back to normal at t={:.3}s", now);
            }
            self.overloaded_since = None;
            self.overloaded = false;
        }
    }

    fn reduce(&self, payload: &FramePayload) -> Option<f64> {
        match payload {
            FramePayload::Intensity(v) => Some(*v),
            FramePayload::Rgb8 {
                width,
                height,
                pixels,
            } => {
                let (w, h) = (*width, *height);
                if w == 0 || h == 0 || pixels.len() != w * h * 3 {
                    return None;
                }
                let frac = self.cfg.roi_fraction.clamp(0.01, 1.0);
                let roi_w = ((w as f64 * frac).round() as usize).clamp(1, w);
                let roi_h = ((h as f64 * frac).round() as usize).clamp(1, h);
                let x0 = (w - roi_w) / 2;
                let y0 = (h - roi_h) / 2;
                let mut acc = 0.0;
                for y in y0..y0 + roi_h {
                    let row = y * w * 3;
                    for x in x0..x0 + roi_w {
                        let px = &pixels[row + x * 3..row + x * 3 + 3];
                        acc += match self.cfg.channel {
                            ColorChannel::Red => px[0] as f64,
                            ColorChannel::Green => px[1] as f64,
                            ColorChannel::Blue => px[2] as f64,
                            ColorChannel::Luma => {
                                0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64
                            }
                        };
                    }
                }
                Some(acc / (roi_w * roi_h) as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(t: f64, w: usize, h: usize, rgb: [u8; 3]) -> RawFrame {
        let pixels = (0..w * h).flat_map(|_| rgb).collect();
        RawFrame::rgb(t, w, h, pixels)
    }

    #[test]
    fn reduces_red_channel_mean() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        let sample = sampler
            .sample(&solid_frame(0.0, 8, 6, [200, 10, 20]))
            .expect("sample");
        assert!((sample.intensity - 200.0).abs() < 1e-9);
    }

    #[test]
    fn roi_ignores_border_pixels() {
        let (w, h) = (4, 4);
        let mut pixels = vec![0u8; w * h * 3];
        for y in 1..3 {
            for x in 1..3 {
                pixels[(y * w + x) * 3] = 100;
            }
        }
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        let sample = sampler.sample(&RawFrame::rgb(0.0, w, h, pixels)).unwrap();
        assert!((sample.intensity - 100.0).abs() < 1e-9);
    }

    #[test]
    fn luma_weights_channels() {
        let cfg = SamplerConfig {
            channel: ColorChannel::Luma,
            ..SamplerConfig::default()
        };
        let mut sampler = FrameSampler::new(cfg);
        let sample = sampler.sample(&solid_frame(0.0, 2, 2, [100, 100, 100])).unwrap();
        assert!((sample.intensity - 100.0).abs() < 1e-6);
    }

    #[test]
    fn skips_malformed_and_late_frames() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        assert!(sampler.sample(&RawFrame::intensity(1.0, 10.0)).is_some());
        assert!(sampler.sample(&RawFrame::intensity(0.5, 10.0)).is_none());
        assert!(sampler
            .sample(&RawFrame::rgb(1.1, 4, 4, vec![0; 7]))
            .is_none());
        assert!(sampler.sample(&RawFrame::intensity(1.2, f64::NAN)).is_none());
        assert!(sampler.sample(&RawFrame::intensity(1.3, 11.0)).is_some());
        // the late frame, plus the eight slots between 1.0 and 1.3
        assert_eq!(sampler.dropped_total(), 9);
    }

    #[test]
    fn unreadable_frames_count_once() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        for i in 0..150 {
            let value = if i % 5 == 4 { f64::NAN } else { 1.0 };
            sampler.sample(&RawFrame::intensity(i as f64 / 30.0, value));
        }
        assert_eq!(sampler.dropped_total(), 29);
        assert!((sampler.drop_ratio() - 0.2).abs() < 0.03);
        assert!(sampler.overload().is_none());
    }

    #[test]
    fn huge_timestamp_jump_does_not_overflow() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        assert!(sampler.sample(&RawFrame::intensity(0.0, 1.0)).is_some());
        assert!(sampler.sample(&RawFrame::intensity(1.0e12, 1.0)).is_some());
        assert!(sampler.dropped_total() > u64::from(u32::MAX));
        assert!(sampler.sample(&RawFrame::intensity(f64::MAX, 1.0)).is_some());
        assert_eq!(sampler.dropped_total(), u64::MAX);
        assert!(sampler.drop_ratio() > 0.99);
    }

    #[test]
    fn isolated_gap_is_not_overload() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        for i in 0..90 {
            if i == 40 || i == 41 {
                continue;
            }
            sampler.sample(&RawFrame::intensity(i as f64 / 30.0, 1.0));
        }
        assert_eq!(sampler.dropped_total(), 2);
        assert!(sampler.overload().is_none());
    }

    #[test]
    fn sustained_drops_raise_overload_and_clear() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        // Only every third frame arrives for four seconds.
        for i in (0..120).step_by(3) {
            sampler.sample(&RawFrame::intensity(i as f64 / 30.0, 1.0));
        }
        assert!(matches!(
            sampler.overload(),
            Some(PulseError::ProcessingOverload { .. })
        ));
        for i in 120..240 {
            sampler.sample(&RawFrame::intensity(i as f64 / 30.0, 1.0));
        }
        assert!(sampler.overload().is_none());
    }
}
