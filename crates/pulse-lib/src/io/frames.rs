use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim, WriterBuilder};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::signal::FrameSample;

/// Read a `timestamp,intensity` recording. Column order does not matter.
pub fn read_frames_csv(path: &Path) -> Result<Vec<FrameSample>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .with_context(|| format!("missing {} column", name))
    };
    let timestamp_idx = column("timestamp")?;
    let intensity_idx = column("intensity")?;

    let mut frames = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading record {}", idx + 1))?;
        let field = |i: usize| -> Result<f64> {
            let raw = record
                .get(i)
                .ok_or_else(|| anyhow::anyhow!("record {} is missing a column", idx + 1))?;
            raw.parse::<f64>()
                .with_context(|| format!("record {}: parsing {}", idx + 1, raw))
        };
        frames.push(FrameSample {
            timestamp: field(timestamp_idx)?,
            intensity: field(intensity_idx)?,
        });
    }
    if frames.is_empty() {
        anyhow::bail!("{} contains no frames", path.display());
    }
    Ok(frames)
}

pub fn write_frames_csv(path: &Path, frames: &[FrameSample]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_frames(file, frames)
}

/// Write `timestamp,intensity` rows to any sink (a file, stdout).
pub fn write_frames<W: Write>(sink: W, frames: &[FrameSample]) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(sink);
    writer.write_record(["timestamp", "intensity"])?;
    for frame in frames {
        writer.write_record([
            format!("{:.6}", frame.timestamp),
            format!("{:.6}", frame.intensity),
        ])?;
    }
    writer.flush().context("flushing frame csv")?;
    Ok(())
}
