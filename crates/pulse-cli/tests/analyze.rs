use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use std::{error::Error, fs, path::PathBuf};

fn analyze(args: &[&str]) -> Result<Value, Box<dyn Error>> {
    let mut cmd = cargo_bin_cmd!("pulse");
    cmd.arg("analyze").args(args);
    let output = cmd.assert().success().get_output().stdout.clone();
    Ok(serde_json::from_slice(&output)?)
}

#[test]
fn analyze_text_series_finds_rate() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("pulse.txt");
    let fs_hz = 30.0;
    let bpm = 72.0;
    let text: String = (0..600)
        .map(|i| {
            let t = i as f64 / fs_hz;
            let theta = 2.0 * std::f64::consts::PI * bpm / 60.0 * t;
            format!("{:.4}\n", 120.0 + 2.0 * theta.sin())
        })
        .collect();
    fs::write(&input, text)?;

    let analysis = analyze(&["--input", input.to_str().expect("utf8 path"), "--fs", "30"])?;

    assert_eq!(analysis["samples"], 600);
    assert_close(analysis["smoothed_bpm"].as_f64().expect("smoothed"), bpm, 2.0);
    assert_close(analysis["spectral_bpm"].as_f64().expect("spectral"), bpm, 3.0);
    assert!(analysis["peaks"].as_array().expect("peaks").len() >= 15);
    assert_ne!(analysis["quality"], "poor");
    Ok(())
}

#[test]
fn analyze_reads_frame_csv() -> Result<(), Box<dyn Error>> {
    let sample = workspace_root().join("test_data/frames_sample.csv");
    let analysis = analyze(&["--input", sample.to_str().expect("utf8 path")])?;
    assert_eq!(analysis["samples"], 6);
    assert!(analysis["smoothed_bpm"].is_null());
    Ok(())
}

fn assert_close(a: f64, b: f64, tol: f64) {
    let diff = (a - b).abs();
    assert!(diff <= tol, "diff {diff} exceeded tol {tol} ({a} vs {b})");
}

fn workspace_root() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .expect("crates dir")
        .parent()
        .expect("workspace root")
        .to_path_buf()
}
