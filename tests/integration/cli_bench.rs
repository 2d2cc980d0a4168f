#![allow(missing_docs)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn json_report(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("umbra-bench")
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("report is json")
}

#[test]
fn increment_workload_reports_a_consistent_total() {
    let report = json_report(&["--threads", "3", "increment", "--ops", "200"]);
    assert_eq!(report["workload"], "increment");
    assert_eq!(report["threads"], 3);
    assert_eq!(report["transactions"], 600);
    assert_eq!(report["expected"], 600);
    assert_eq!(report["observed"], 600);
    assert_eq!(report["consistent"], true);
}

#[test]
fn commuting_increments_without_speculation() {
    let report = json_report(&[
        "--threads",
        "2",
        "--no-speculative",
        "increment",
        "--ops",
        "100",
        "--commute",
    ]);
    assert_eq!(report["observed"], 200);
    assert_eq!(report["consistent"], true);
}

#[test]
fn read_mostly_workload_keeps_the_total() {
    let report = json_report(&[
        "--threads",
        "4",
        "read-mostly",
        "--ops",
        "100",
        "--cells",
        "16",
        "--write-ratio",
        "0.3",
    ]);
    assert_eq!(report["workload"], "read-mostly");
    assert_eq!(report["expected"], 1_600);
    assert_eq!(report["observed"], 1_600);
    assert_eq!(report["consistent"], true);
}

#[test]
fn text_report_has_a_header() {
    let output = cargo_bin_cmd!("umbra-bench")
        .args(["--threads", "1", "increment", "--ops", "10"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8 output");
    let mut lines = text.lines();
    assert!(lines.next().unwrap_or_default().starts_with("WORKLOAD"));
    let row = lines.next().unwrap_or_default();
    assert!(row.starts_with("increment"));
    assert!(row.trim_end().ends_with("ok"));
}

#[test]
fn config_file_is_applied() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("umbra.toml");
    fs::write(&path, "spin_count = 256\npooling = false\nmax_fixed_length = 4\n").unwrap();

    let output = cargo_bin_cmd!("umbra-bench")
        .arg("--config")
        .arg(&path)
        .args(["--format", "json", "read-mostly", "--ops", "50", "--cells", "8"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["consistent"], true);
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "spin_count = \"many\"\n").unwrap();
    cargo_bin_cmd!("umbra-bench")
        .arg("--config")
        .arg(&path)
        .args(["increment", "--ops", "1"])
        .assert()
        .failure()
        .code(1);

    let path = dir.path().join("zero.toml");
    fs::write(&path, "max_fixed_length = 0\n").unwrap();
    cargo_bin_cmd!("umbra-bench")
        .env("UMBRA_CONFIG", &path)
        .args(["increment", "--ops", "1"])
        .assert()
        .failure();
}

#[test]
fn bad_arguments_fail() {
    cargo_bin_cmd!("umbra-bench")
        .args(["--threads", "0", "increment"])
        .assert()
        .failure()
        .code(1);
    cargo_bin_cmd!("umbra-bench")
        .args(["read-mostly", "--cells", "1"])
        .assert()
        .failure();
}
