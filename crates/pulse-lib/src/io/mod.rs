pub mod frames;
pub mod text;

use crate::signal::FrameSample;
use anyhow::Result;
use std::path::Path;

/// Load a recording: `.csv` files carry their own timestamps, anything else
/// is read as a plain intensity series sampled at `fs`.
pub fn read_recording(path: &Path, fs: f64) -> Result<Vec<FrameSample>> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        frames::read_frames_csv(path)
    } else {
        Ok(text::read_intensity_series(path, fs)?.to_frame_samples())
    }
}
