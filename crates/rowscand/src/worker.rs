//! The worker process: owns every camera and executes capture commands
//! one at a time, in the order they arrive.

use crate::config::Config;
use crate::fleet::{Fleet, FleetError};
use crate::ipc::{CaptureRequest, WorkerEvent, SAVE_POINT_CLOUD};
use crate::shutdown::{ParentWatch, ShutdownToken};
use rowscan_hw::DeviceBackend;
use std::io::{BufRead, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;

/// Run the worker until the command stream ends, the token is cancelled
/// or the parent goes away.
///
/// Emits [`WorkerEvent::Ready`] once discovery is done and
/// [`WorkerEvent::Stopped`] after every camera has been shut down.
pub fn run_worker<R, W>(
    config: &Config,
    backend: Arc<dyn DeviceBackend>,
    input: R,
    mut events: W,
    token: &ShutdownToken,
    parent: Option<ParentWatch>,
) -> Result<(), FleetError>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    // Commands arriving during bring-up wait in the channel.
    let commands = spawn_reader(input)?;

    let mut fleet = Fleet::discover(config, backend, token);
    emit(
        &mut events,
        &WorkerEvent::Ready {
            cameras: fleet.identities(),
        },
    )?;

    let poll = config.queue_poll();
    loop {
        if token.is_cancelled() {
            tracing::info!("termination requested");
            break;
        }
        if parent.is_some_and(|p| p.parent_exited()) {
            tracing::warn!("parent process exited");
            break;
        }
        match commands.recv_timeout(poll) {
            Ok(line) => handle_line(&mut fleet, &line),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("command stream closed");
                break;
            }
        }
    }

    fleet.shutdown();
    if let Err(err) = emit(&mut events, &WorkerEvent::Stopped) {
        tracing::debug!(error = %err, "stopped event not delivered");
    }
    tracing::info!("worker stopped");
    Ok(())
}

fn spawn_reader<R: BufRead + Send + 'static>(input: R) -> Result<mpsc::Receiver<String>, FleetError> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("rowscan-commands".into())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, "command stream read failed");
                        break;
                    }
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .map_err(FleetError::Spawn)?;
    Ok(rx)
}

fn handle_line(fleet: &mut Fleet, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let request: CaptureRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "malformed command ignored");
            return;
        }
    };
    match request.action.as_deref() {
        Some(SAVE_POINT_CLOUD) => {
            tracing::info!(command = %request, "capture requested");
            if let Err(err) = fleet.save_point_cloud(&request) {
                tracing::error!(command = %request, error = %err, "capture failed");
            }
        }
        other => tracing::warn!(action = ?other, "unknown action ignored"),
    }
}

fn emit<W: Write>(events: &mut W, event: &WorkerEvent) -> Result<(), FleetError> {
    let json = serde_json::to_string(event).map_err(FleetError::BadEvent)?;
    writeln!(events, "{json}")
        .and_then(|()| events.flush())
        .map_err(FleetError::Events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowscan_core::decode;
    use std::io::Cursor;
    use std::path::Path;

    fn test_config(root: &Path, devices: &[&str], fail: &[&str]) -> Config {
        Config {
            pointcloud_dir: root.join("pc"),
            calibration_dir: root.join("cal"),
            stream_port_base: 0,
            pipeline_fps: 100,
            frame_timeout_ms: 300,
            device_shutdown_ms: 2000,
            bringup_delay_ms: 0,
            queue_poll_ms: 10,
            sim_devices: devices.iter().map(|s| s.to_string()).collect(),
            sim_fail: fail.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    fn written_at(path: &Path) -> std::time::SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    fn events(out: &[u8]) -> Vec<WorkerEvent> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_runs_commands_in_order_and_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &["10.95.76.11", "10.95.76.12"], &[]);
        let input = concat!(
            "not json\n",
            "{\"action\":\"reboot\"}\n",
            "\n",
            "{\"action\":\"save_point_cloud\",\"line_name\":\"rowA\",\"row_number\":2,\"capture_number\":0}\n",
            "{\"action\":\"save_point_cloud\"}\n",
        );
        let mut out = Vec::new();
        run_worker(
            &config,
            config.backend(),
            Cursor::new(input.as_bytes().to_vec()),
            &mut out,
            &ShutdownToken::new(),
            None,
        )
        .unwrap();

        assert_eq!(
            events(&out),
            vec![
                WorkerEvent::Ready {
                    cameras: vec!["10.95.76.11".to_string(), "10.95.76.12".to_string()]
                },
                WorkerEvent::Stopped,
            ]
        );
        let mut files = Vec::new();
        for capture in ["pc/rowA/row_2/capture_0", "pc/X/row_X/capture_X"] {
            for i in 0..2 {
                let path = dir.path().join(capture).join(format!("camera-{i}.drc"));
                assert!(!decode(&std::fs::read(&path).unwrap()).unwrap().is_empty());
                files.push(path);
            }
        }
        // Commands run in arrival order, cameras in index order.
        for pair in files.windows(2) {
            assert!(written_at(&pair[0]) <= written_at(&pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn test_stalled_camera_only_loses_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &["a1", "a2"], &["a1:stall"]);
        let input = "{\"action\":\"save_point_cloud\",\"line_name\":\"l\",\"row_number\":1,\"capture_number\":1}\n";
        let mut out = Vec::new();
        run_worker(
            &config,
            config.backend(),
            Cursor::new(input.as_bytes().to_vec()),
            &mut out,
            &ShutdownToken::new(),
            None,
        )
        .unwrap();
        let capture = dir.path().join("pc/l/row_1/capture_1");
        assert!(!capture.join("camera-0.drc").exists());
        assert!(capture.join("camera-1.drc").exists());
        assert_eq!(events(&out).last(), Some(&WorkerEvent::Stopped));
    }

    #[test]
    fn test_cancelled_token_stops_without_reading() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &[], &[]);
        let token = ShutdownToken::new();
        token.cancel();
        let mut out = Vec::new();
        run_worker(
            &config,
            config.backend(),
            Cursor::new(b"{\"action\":\"save_point_cloud\"}\n".to_vec()),
            &mut out,
            &token,
            None,
        )
        .unwrap();
        assert_eq!(
            events(&out),
            vec![WorkerEvent::Ready { cameras: vec![] }, WorkerEvent::Stopped]
        );
        assert!(!dir.path().join("pc").exists());
    }
}
