use anyhow::{bail, Context, Result};
use log::debug;
use pulse_lib::error::PulseError;
use pulse_lib::result::{MeasurementResult, ResultSink};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Saves each result as a pretty-printed JSON file in one directory.
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    dir: PathBuf,
}

impl JsonResultStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, result: &MeasurementResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating result store {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(result).context("serializing result")?;
        let stem = format!("result-{}", result.timestamp.format("%Y%m%dT%H%M%S%.3fZ"));
        // results finalized in the same millisecond get a numeric suffix
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => format!("{stem}.json"),
                n => format!("{stem}-{n}.json"),
            };
            let path = self.dir.join(name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("creating {}", path.display()));
                }
            };
            file.write_all(json.as_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            debug!("wrote {}", path.display());
            return Ok(path);
        }
        bail!("no free file name for {stem} in {}", self.dir.display())
    }

    /// Saved results, newest first. Files that do not parse are skipped.
    pub fn history(&self) -> Result<Vec<MeasurementResult>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str::<MeasurementResult>(&text) {
                Ok(result) => results.push(result),
                Err(err) => debug!("skipping {}: {err}", path.display()),
            }
        }
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(results)
    }
}

impl ResultSink for JsonResultStore {
    fn save(&mut self, result: &MeasurementResult) -> Result<(), PulseError> {
        self.write(result)
            .map(|_| ())
            .map_err(|e| PulseError::SaveFailure(format!("{e:#}")))
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    saved: Vec<MeasurementResult>,
    failing: bool,
}

/// In-memory sink; clones share storage so a handle can be kept after boxing.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryResultStore {
    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn saved(&self) -> Vec<MeasurementResult> {
        self.lock().saved.clone()
    }

    /// Make subsequent saves fail, to exercise retry paths.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }
}

impl ResultSink for MemoryResultStore {
    fn save(&mut self, result: &MeasurementResult) -> Result<(), PulseError> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(PulseError::SaveFailure("store unavailable".into()));
        }
        inner.saved.push(result.clone());
        Ok(())
    }
}
