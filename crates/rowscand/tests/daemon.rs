use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rowscan_core::decode;
use rowscand::WorkerEvent;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_rowscand");

fn command(root: &Path, fail: &str) -> Command {
    let mut cmd = Command::new(BIN);
    cmd.env("ROWSCAN_POINTCLOUD_DIR", root.join("pc"))
        .env("ROWSCAN_CALIBRATION_DIR", root.join("cal"))
        .env("ROWSCAN_SIM_DEVICES", "10.95.76.11,10.95.76.12,10.95.76.13")
        .env("ROWSCAN_SIM_FAIL", fail)
        .env("ROWSCAN_STREAM_PORT_BASE", "0")
        .env("ROWSCAN_BRINGUP_DELAY_MS", "0")
        .env("ROWSCAN_PIPELINE_FPS", "100")
        .env("ROWSCAN_QUEUE_POLL_MS", "20")
        .env("ROWSCAN_WORKER_SHUTDOWN_MS", "10000")
        .env("RUST_LOG", "info")
        .env_remove("ROWSCAN_WORKER_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> ExitStatus {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        assert!(started.elapsed() < limit, "process still running after {limit:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn assert_capture(dir: &Path, present: &[usize], absent: &[usize]) {
    for i in present {
        let blob = std::fs::read(dir.join(format!("camera-{i}.drc"))).unwrap();
        assert!(!decode(&blob).unwrap().is_empty(), "camera-{i} is empty");
    }
    for i in absent {
        assert!(!dir.join(format!("camera-{i}.drc")).exists());
    }
}

#[test]
fn test_captures_in_enqueue_order_with_a_failed_camera() {
    let root = tempfile::tempdir().unwrap();
    let mut child = command(root.path(), "10.95.76.13").spawn().unwrap();
    {
        let mut stdin = child.stdin.take().unwrap();
        writeln!(
            stdin,
            r#"{{"action":"save_point_cloud","line_name":"rowA","row_number":2,"capture_number":0}}"#
        )
        .unwrap();
        writeln!(stdin, "garbage").unwrap();
        writeln!(
            stdin,
            r#"{{"action":"save_point_cloud","line_name":"rowA","row_number":2,"capture_number":1}}"#
        )
        .unwrap();
    }

    let status = wait_with_deadline(&mut child, Duration::from_secs(60));
    assert!(status.success());
    let row = root.path().join("pc/rowA/row_2");
    assert_capture(&row.join("capture_0"), &[0, 1], &[2]);
    assert_capture(&row.join("capture_1"), &[0, 1], &[2]);

    let written_at = |capture: &str, i: usize| {
        std::fs::metadata(row.join(capture).join(format!("camera-{i}.drc")))
            .unwrap()
            .modified()
            .unwrap()
    };
    let first_done = written_at("capture_0", 0).max(written_at("capture_0", 1));
    let second_started = written_at("capture_1", 0).min(written_at("capture_1", 1));
    assert!(first_done <= second_started, "captures written out of enqueue order");
}

#[test]
fn test_worker_stops_on_sigterm() {
    let root = tempfile::tempdir().unwrap();
    let mut child = command(root.path(), "").arg("worker").spawn().unwrap();
    let mut events = BufReader::new(child.stdout.take().unwrap()).lines();

    let ready: WorkerEvent = serde_json::from_str(&events.next().unwrap().unwrap()).unwrap();
    assert_eq!(
        ready,
        WorkerEvent::Ready {
            cameras: vec![
                "10.95.76.11".to_string(),
                "10.95.76.12".to_string(),
                "10.95.76.13".to_string()
            ]
        }
    );

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let stopped: WorkerEvent = serde_json::from_str(&events.next().unwrap().unwrap()).unwrap();
    assert_eq!(stopped, WorkerEvent::Stopped);
    assert!(wait_with_deadline(&mut child, Duration::from_secs(20)).success());
    drop(child.stdin.take());
}

#[test]
fn test_daemon_shuts_down_on_sigterm() {
    let root = tempfile::tempdir().unwrap();
    let mut child = command(root.path(), "10.95.76.12:stall").spawn().unwrap();
    let stderr = BufReader::new(child.stderr.take().unwrap());
    let ready = stderr
        .lines()
        .map_while(Result::ok)
        .any(|line| line.contains("rowscand ready"));
    assert!(ready);

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    assert!(wait_with_deadline(&mut child, Duration::from_secs(20)).success());
    drop(child.stdin.take());
}
