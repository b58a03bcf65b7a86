//! Runs the `rowscan` binary against the simulated backend.

use std::path::Path;
use std::process::{Command, Output};

fn rowscan(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rowscan"))
        .args(args)
        .env("RUST_LOG", "info")
        .env("ROWSCAN_POINTCLOUD_DIR", root.join("pc"))
        .env("ROWSCAN_CALIBRATION_DIR", root.join("cal"))
        .env("ROWSCAN_SIM_DEVICES", "10.95.76.11,10.95.76.12")
        .env("ROWSCAN_STREAM_PORT_BASE", "0")
        .env("ROWSCAN_BRINGUP_DELAY_MS", "0")
        .env("ROWSCAN_FRAME_TIMEOUT_MS", "1000")
        .output()
        .unwrap()
}

#[test]
fn test_align_logs_to_stderr_only() {
    let root = tempfile::tempdir().unwrap();
    let out = rowscan(root.path(), &["align"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);

    assert!(stderr.contains("aligning"), "{stderr}");
    assert!(stdout.contains("10.95.76.11:"), "{stdout}");
    assert!(!stdout.contains("aligning"), "{stdout}");
}

#[test]
fn test_devices_lists_simulated_cameras() {
    let root = tempfile::tempdir().unwrap();
    let out = rowscan(root.path(), &["devices"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("10.95.76.11"), "{stdout}");
    assert!(stdout.contains("10.95.76.12"), "{stdout}");
}
