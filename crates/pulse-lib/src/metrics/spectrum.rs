use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Strongest in-band component of a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralPeak {
    pub frequency_hz: f64,
    /// Share of in-band power carried by the peak's main lobe.
    pub power_fraction: f64,
}

impl SpectralPeak {
    pub fn bpm(&self) -> f64 {
        self.frequency_hz * 60.0
    }
}

/// Locate the dominant frequency of `data` within `[low_hz, high_hz]`.
///
/// The window is Hann-tapered and zero-padded to at least four times its
/// length; the peak bin is refined by parabolic interpolation.
pub fn dominant_frequency(data: &[f64], fs: f64, low_hz: f64, high_hz: f64) -> Option<SpectralPeak> {
    if data.len() < 8 || fs <= 0.0 || high_hz <= low_hz {
        return None;
    }
    let n = data.len();
    let mean = data.iter().sum::<f64>() / n as f64;
    let padded = (4 * n).next_power_of_two();
    let mut buffer = vec![0.0; padded];
    for (i, &x) in data.iter().enumerate() {
        let w = 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos();
        buffer[i] = (x - mean) * w;
    }

    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(padded);
    let mut spectrum = fft.make_output_vec();
    fft.process(&mut buffer, &mut spectrum).ok()?;
    let powers: Vec<f64> = spectrum.iter().map(|c| c.norm_sqr()).collect();

    let bin_hz = fs / padded as f64;
    let lo = ((low_hz / bin_hz).ceil() as usize).max(1);
    let hi = ((high_hz / bin_hz).floor() as usize).min(powers.len().saturating_sub(2));
    if lo >= hi {
        return None;
    }
    let band_power: f64 = powers[lo..=hi].iter().sum();
    if band_power <= 0.0 {
        return None;
    }
    let (peak, &peak_power) = powers[lo..=hi]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, p)| (i + lo, p))?;

    let (left, right) = (powers[peak - 1], powers[peak + 1]);
    let denom = left - 2.0 * peak_power + right;
    let offset = if denom.abs() > f64::EPSILON {
        (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    // a Hann main lobe spans two unpadded bins either side of the peak
    let lobe = (2 * padded).div_ceil(n);
    let local = powers[peak.saturating_sub(lobe).max(lo)..=(peak + lobe).min(hi)]
        .iter()
        .sum::<f64>();
    Some(SpectralPeak {
        frequency_hz: (peak as f64 + offset) * bin_hz,
        power_fraction: (local / band_power).min(1.0),
    })
}
