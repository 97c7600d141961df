use assert_cmd::cargo::cargo_bin_cmd;
use std::{error::Error, fs};

#[test]
fn simulate_writes_timestamped_csv() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("sim.csv");

    let mut cmd = cargo_bin_cmd!("pulse");
    cmd.args([
        "simulate",
        "--bpm",
        "90",
        "--duration",
        "30",
        "--fs",
        "30",
        "--out",
        out.to_str().expect("utf8 path"),
    ]);
    cmd.assert().success();

    let text = fs::read_to_string(&out)?;
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("timestamp,intensity"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 901);
    assert!(rows[900].starts_with("30.000000,"));
    Ok(())
}

#[test]
fn simulate_is_reproducible_for_a_seed() -> Result<(), Box<dyn Error>> {
    let run = |seed: &str| -> Result<Vec<u8>, Box<dyn Error>> {
        let mut cmd = cargo_bin_cmd!("pulse");
        cmd.args([
            "simulate", "--duration", "5", "--noise", "0.5", "--seed", seed,
        ]);
        Ok(cmd.assert().success().get_output().stdout.clone())
    };
    assert_eq!(run("3")?, run("3")?);
    assert_ne!(run("3")?, run("4")?);
    Ok(())
}

#[test]
fn simulate_rejects_unknown_mode() {
    let mut cmd = cargo_bin_cmd!("pulse");
    cmd.args(["simulate", "--mode", "sideways"]);
    cmd.assert().failure();
}
