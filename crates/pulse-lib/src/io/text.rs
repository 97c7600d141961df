use crate::signal::TimeSeries;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Intensity values separated by newlines, commas or whitespace. Text after
/// `#` on a line is ignored. Non-finite values such as `nan` mark a frame the
/// capture side could not measure; they keep their slot so later samples stay
/// on the right timestamp.
pub fn parse_intensities(text: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    let mut unmeasured = 0usize;
    for (line_no, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or_default();
        for token in content
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let value: f64 = token
                .parse()
                .with_context(|| format!("line {}: `{}` is not an intensity", line_no + 1, token))?;
            if !value.is_finite() {
                unmeasured += 1;
            }
            out.push(value);
        }
    }
    if out.len() == unmeasured {
        bail!("no intensity samples found");
    }
    if unmeasured > 0 {
        log::debug!("{unmeasured} unmeasured frame(s) kept as gaps");
    }
    Ok(out)
}

/// Read an intensity series from disk and attach the nominal rate `fs`.
pub fn read_intensity_series(path: &Path, fs: f64) -> Result<TimeSeries> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let data = parse_intensities(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(TimeSeries { fs, data })
}
