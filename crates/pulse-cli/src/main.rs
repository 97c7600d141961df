use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{info, warn};
use plotters::prelude::*;
use pulse_engine::store::{JsonResultStore, MemoryResultStore};
use pulse_engine::{EngineConfig, PulseEngine};
use pulse_lib::{
    conditioner::SignalConditioner,
    config::{load_config, MeasurementConfig},
    detectors::peak::{detect_peaks, interval_cv},
    error::PulseError,
    io::{frames as frame_io, read_recording},
    metrics::{quality::classify, quality::SignalQuality, spectrum::dominant_frequency},
    plot::{figure_from_conditioned, figure_from_readings, Figure, Series},
    result::{MeasurementResult, ResultSink},
    session::{MeasurementSession, Phase},
    signal::{median, FrameSample, RawFrame},
    synth::{SynthMode, SyntheticPpg},
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pulse", version, about = "Camera PPG heart-rate measurement tools")]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Pulse,
    Flat,
    Motion,
}

impl From<Mode> for SynthMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Pulse => SynthMode::Pulse,
            Mode::Flat => SynthMode::Flat,
            Mode::Motion => SynthMode::Motion,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recording through a measurement session and print the result
    Measure {
        /// `timestamp,intensity` CSV, or one intensity per line
        #[arg(long)]
        input: PathBuf,
        /// Sample rate for plain-text recordings
        #[arg(long)]
        fs: Option<f64>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Save the result as JSON into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,
        #[arg(long)]
        athlete: bool,
        /// Feed frames in real time through the background engine
        #[arg(long)]
        paced: bool,
        /// Playback speed multiplier for --paced
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Write a synthetic `timestamp,intensity` recording
    Simulate {
        #[arg(long, default_value_t = 75.0)]
        bpm: f64,
        #[arg(long, default_value_t = 30.0)]
        duration: f64,
        #[arg(long, default_value_t = 30.0)]
        fs: f64,
        #[arg(long, default_value_t = 2.0)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.0)]
        noise: f64,
        #[arg(long, default_value_t = 0.0)]
        drift: f64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value = "pulse")]
        mode: Mode,
        /// Output CSV; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Offline analysis of a whole recording
    Analyze {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        fs: Option<f64>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Render a result's readings trend, or a recording's conditioned waveform, to PNG
    Plot {
        #[arg(long, conflicts_with = "input", required_unless_present = "input")]
        result: Option<PathBuf>,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        fs: Option<f64>,
        #[arg(long)]
        out: PathBuf,
    },
    /// List saved results, newest first
    History {
        #[arg(long)]
        store: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();
    match cli.command {
        Commands::Measure {
            input,
            fs,
            config,
            save_dir,
            athlete,
            paced,
            speed,
        } => cmd_measure(
            &input,
            fs,
            config.as_deref(),
            save_dir.as_deref(),
            athlete,
            paced.then_some(speed),
        )?,
        Commands::Simulate {
            bpm,
            duration,
            fs,
            amplitude,
            noise,
            drift,
            seed,
            mode,
            out,
        } => {
            let mut synth = SyntheticPpg::new(bpm, fs, seed)
                .with_mode(mode.into())
                .with_amplitude(amplitude)
                .with_noise(noise);
            synth.drift = drift;
            cmd_simulate(&synth, duration, out.as_deref())?
        }
        Commands::Analyze { input, fs, config } => {
            cmd_analyze(&input, fs, config.as_deref())?
        }
        Commands::Plot {
            result,
            input,
            fs,
            out,
        } => cmd_plot(result.as_deref(), input.as_deref(), fs, &out)?,
        Commands::History { store } => cmd_history(&store)?,
    }
    Ok(())
}

fn measurement_config(config: Option<&Path>, fs: Option<f64>) -> Result<MeasurementConfig> {
    let mut cfg = match config {
        Some(path) => load_config(path)?,
        None => MeasurementConfig::default(),
    };
    if let Some(fs) = fs {
        cfg.sampler.nominal_fps = fs;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// The recording stands in for the camera, so failing to open it is a capture failure.
fn open_capture(input: &Path, fs: f64) -> Result<Vec<FrameSample>> {
    read_recording(input, fs).map_err(|e| PulseError::CameraUnavailable(format!("{e:#}")).into())
}

fn cmd_measure(
    input: &Path,
    fs: Option<f64>,
    config: Option<&Path>,
    save_dir: Option<&Path>,
    athlete: bool,
    paced_speed: Option<f64>,
) -> Result<()> {
    let mut cfg = measurement_config(config, fs)?;
    cfg.user.athletic |= athlete;
    let frames = open_capture(input, cfg.sampler.nominal_fps)?;
    info!("replaying {} frames from {}", frames.len(), input.display());

    let result = match paced_speed {
        Some(speed) => measure_paced(cfg, frames, speed, save_dir)?,
        None => {
            let result = measure_offline(cfg, &frames)?;
            if let Some(dir) = save_dir {
                JsonResultStore::new(dir).save(&result)?;
            }
            result
        }
    };
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn measure_offline(cfg: MeasurementConfig, frames: &[FrameSample]) -> Result<MeasurementResult> {
    let mut session = MeasurementSession::new(cfg);
    session.start();
    for frame in frames {
        session.push_frame(&RawFrame::from(*frame));
        if session.phase() == Phase::Completed {
            break;
        }
    }
    if session.phase() != Phase::Completed {
        let snapshot = session.snapshot();
        session.stop();
        bail!(
            "recording ended during {:?} with {:.1}s of {:.1}s measured",
            snapshot.phase,
            snapshot.elapsed_s,
            snapshot.target_s
        );
    }
    Ok(session.take_result()?)
}

fn measure_paced(
    cfg: MeasurementConfig,
    frames: Vec<FrameSample>,
    speed: f64,
    save_dir: Option<&Path>,
) -> Result<MeasurementResult> {
    if !(speed.is_finite() && speed > 0.0) {
        bail!("--speed must be positive");
    }
    let store: Box<dyn ResultSink + Send> = match save_dir {
        Some(dir) => Box::new(JsonResultStore::new(dir)),
        None => Box::new(MemoryResultStore::default()),
    };
    let engine_cfg = EngineConfig::default();
    let mut engine = PulseEngine::new(cfg, engine_cfg, store)?;
    engine.start()?;

    let sender = engine.frame_sender();
    let capture = std::thread::spawn(move || {
        let mut prev: Option<f64> = None;
        for frame in frames {
            if let Some(p) = prev {
                let wait = ((frame.timestamp - p) / speed).max(0.0);
                std::thread::sleep(Duration::from_secs_f64(wait));
            }
            prev = Some(frame.timestamp);
            sender.push(RawFrame::from(frame));
        }
    });

    let tick = Duration::from_millis(engine_cfg.tick_ms);
    let mut last_phase = None;
    while engine.result().is_none() && engine.last_error().is_none() {
        if let Some(snapshot) = engine.poll() {
            if last_phase != Some(snapshot.phase) {
                info!("phase {:?}", snapshot.phase);
                last_phase = Some(snapshot.phase);
            }
            if let Some(overload) = &snapshot.overload {
                warn!("{overload}");
            }
        }
        if capture.is_finished() {
            break;
        }
        std::thread::sleep(tick);
    }
    capture
        .join()
        .map_err(|_| anyhow!("capture thread panicked"))?;

    if engine.wait_for_result(Duration::from_secs(5)).is_err() && engine.last_error().is_none() {
        engine.report_capture_failure("recording ended before the session completed");
    }
    let result = engine.wait_for_result(Duration::from_secs(5))?.clone();
    if engine.dropped_frames() > 0 {
        warn!("{} frame(s) dropped by the engine", engine.dropped_frames());
    }
    if save_dir.is_some() {
        engine.save()?;
    }
    Ok(result)
}

fn cmd_simulate(synth: &SyntheticPpg, duration: f64, out: Option<&Path>) -> Result<()> {
    if !(synth.fs > 0.0 && duration >= 0.0) {
        bail!("--fs must be positive and --duration non-negative");
    }
    let frames = synth.frames(duration);
    match out {
        Some(path) => frame_io::write_frames_csv(path, &frames)?,
        None => frame_io::write_frames(io::stdout().lock(), &frames)?,
    }
    Ok(())
}

#[derive(Serialize)]
struct Analysis {
    samples: usize,
    duration_s: f64,
    peaks: Vec<f64>,
    smoothed_bpm: Option<f64>,
    spectral_bpm: Option<f64>,
    spectral_power_fraction: Option<f64>,
    amplitude_ratio: f64,
    interval_cv: Option<f64>,
    quality: SignalQuality,
}

fn cmd_analyze(input: &Path, fs: Option<f64>, config: Option<&Path>) -> Result<()> {
    let cfg = measurement_config(config, fs)?;
    let frames = open_capture(input, cfg.sampler.nominal_fps)?;
    let mut conditioner = SignalConditioner::new(cfg.conditioner, cfg.sampler.nominal_fps);
    let conditioned: Vec<_> = frames
        .iter()
        .filter(|f| f.intensity.is_finite())
        .map(|f| conditioner.push(*f))
        .collect();
    let peaks = detect_peaks(&conditioned, &cfg.detector);
    let intervals: Vec<f64> = peaks
        .windows(2)
        .map(|w| w[1].timestamp - w[0].timestamp)
        .filter(|&dt| dt <= cfg.detector.max_interval_s)
        .collect();
    let trusted: Vec<f64> = conditioned
        .iter()
        .filter(|s| s.trusted)
        .map(|s| s.value)
        .collect();
    let spectral = dominant_frequency(
        &trusted,
        cfg.sampler.nominal_fps,
        cfg.conditioner.band_low_hz,
        cfg.conditioner.band_high_hz,
    );
    let amplitude_ratio = conditioned.last().map(|s| s.amplitude_ratio).unwrap_or(0.0);
    let cv = if intervals.len() >= 2 {
        interval_cv(&intervals)
    } else {
        None
    };
    let analysis = Analysis {
        samples: frames.len(),
        duration_s: match (frames.first(), frames.last()) {
            (Some(a), Some(b)) => b.timestamp - a.timestamp,
            _ => 0.0,
        },
        peaks: peaks.iter().map(|p| p.timestamp).collect(),
        smoothed_bpm: median(&intervals).map(|m| 60.0 / m),
        spectral_bpm: spectral.map(|p| p.bpm()),
        spectral_power_fraction: spectral.map(|p| p.power_fraction),
        amplitude_ratio,
        interval_cv: cv,
        quality: classify(amplitude_ratio, cv, &cfg.quality),
    };
    println!("{}", serde_json::to_string(&analysis)?);
    Ok(())
}

fn cmd_plot(result: Option<&Path>, input: Option<&Path>, fs: Option<f64>, out: &Path) -> Result<()> {
    let fig = match (result, input) {
        (Some(path), _) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let result: MeasurementResult = serde_json::from_str(&text)
                .with_context(|| format!("parsing result {}", path.display()))?;
            figure_from_readings(&result.bpm_readings, 1.0, result.final_bpm)
        }
        (None, Some(path)) => {
            let cfg = measurement_config(None, fs)?;
            let frames = read_recording(path, cfg.sampler.nominal_fps)?;
            let mut conditioner = SignalConditioner::new(cfg.conditioner, cfg.sampler.nominal_fps);
            let conditioned: Vec<_> = frames
                .iter()
                .filter(|f| f.intensity.is_finite())
                .map(|f| conditioner.push(*f))
                .filter(|s| s.trusted)
                .collect();
            let peaks = detect_peaks(&conditioned, &cfg.detector);
            figure_from_conditioned(&conditioned, &peaks, 2048)
        }
        (None, None) => bail!("either --result or --input is required"),
    };
    draw_plotters_figure(out, &fig)
}

fn draw_plotters_figure(path: &Path, fig: &Figure) -> Result<()> {
    let (x_min, x_max, y_min, y_max) = fig
        .bounds()
        .ok_or_else(|| anyhow!("nothing to plot"))?;
    let backend = BitMapBackend::new(path, (800, 480));
    let root = backend.into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(
            fig.title.clone().unwrap_or_else(|| "Plot".into()),
            ("sans-serif", 24),
        )
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
    {
        let mut mesh = chart.configure_mesh();
        if let Some(label) = &fig.x.label {
            mesh.x_desc(label.as_str());
        }
        if let Some(label) = &fig.y.label {
            mesh.y_desc(label.as_str());
        }
        mesh.draw()?;
    }
    for series in &fig.series {
        match series {
            Series::Line(line) => {
                let (r, g, b) = line.style.color.rgb();
                chart.draw_series(LineSeries::new(
                    line.points.iter().map(|p| (p[0], p[1])),
                    RGBColor(r, g, b).stroke_width(line.style.width.round() as u32),
                ))?;
            }
            Series::Points(points) => {
                let (r, g, b) = points.style.color.rgb();
                let color = RGBColor(r, g, b);
                chart.draw_series(
                    points
                        .points
                        .iter()
                        .map(|p| Circle::new((p[0], p[1]), 3, color.filled())),
                )?;
            }
        }
    }
    root.present()?;
    Ok(())
}

fn cmd_history(store: &Path) -> Result<()> {
    let history = JsonResultStore::new(store).history()?;
    println!("{}", serde_json::to_string(&history)?);
    Ok(())
}
