//! Worker-side fleet: the cameras this process owns and the capture action.

use crate::config::Config;
use crate::ipc::CaptureRequest;
use crate::manager::FleetState;
use crate::shutdown::ShutdownToken;
use rowscan_core::{codec, EncodeOptions};
use rowscan_hw::{CalibrationStore, CameraDevice, CameraError, DeviceBackend, DeviceRegistry};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("failed to create capture directory {}: {source}", path.display())]
    CaptureDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Encode(#[from] codec::EncodeError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker event channel: {0}")]
    Events(#[source] std::io::Error),
    #[error("malformed worker event: {0}")]
    BadEvent(#[source] serde_json::Error),
    #[error("worker configuration: {0}")]
    Config(#[source] serde_json::Error),
    #[error("worker exited before reporting ready")]
    WorkerExited,
    #[error("fleet is not running (state: {0:?})")]
    NotRunning(FleetState),
    #[error("fleet already started (state: {0:?})")]
    AlreadyStarted(FleetState),
    #[error("command queue closed")]
    QueueClosed,
    #[error("worker did not exit within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Files produced by one capture command.
#[derive(Debug, Default)]
pub struct CaptureReport {
    pub dir: PathBuf,
    pub written: Vec<PathBuf>,
    /// Camera index and failure, per camera that produced no cloud file.
    pub failed: Vec<(usize, String)>,
}

/// The cameras owned by this process, in capture index order.
pub struct Fleet {
    cameras: Vec<CameraDevice>,
    pointcloud_dir: PathBuf,
    encode: EncodeOptions,
    save_rgb: bool,
}

impl Fleet {
    /// Discover devices and bring them up one at a time.
    ///
    /// A device that fails to come up is logged and left out; the fleet
    /// may end up with fewer cameras than devices, or none.
    pub fn discover(config: &Config, backend: Arc<dyn DeviceBackend>, token: &ShutdownToken) -> Self {
        let registry = DeviceRegistry::new(
            Arc::clone(&backend),
            config.excluded_devices.clone(),
            config.stream_port_base,
        );
        let store = CalibrationStore::new(&config.calibration_dir);
        let devices = registry.discover();
        tracing::info!(devices = devices.len(), "bringing up cameras");

        let mut cameras = Vec::with_capacity(devices.len());
        for (i, device) in devices.iter().enumerate() {
            if token.is_cancelled() {
                tracing::warn!("shutdown requested during bring-up");
                break;
            }
            // The hardware layer is not safe for overlapping bring-ups.
            if i > 0 && !config.bringup_delay().is_zero() {
                std::thread::sleep(config.bringup_delay());
            }
            match CameraDevice::construct(
                backend.as_ref(),
                device,
                config.camera_settings(),
                store.clone(),
            ) {
                Ok(camera) => cameras.push(camera),
                Err(err) => {
                    tracing::error!(identity = %device.info.identity, error = %err, "camera failed to start; continuing without it");
                }
            }
        }
        tracing::info!(cameras = cameras.len(), "fleet running");

        Self {
            cameras,
            pointcloud_dir: config.pointcloud_dir.clone(),
            encode: config.encode_options(),
            save_rgb: config.save_rgb,
        }
    }

    pub fn identities(&self) -> Vec<String> {
        self.cameras
            .iter()
            .map(|c| c.identity().to_string())
            .collect()
    }

    pub fn cameras(&self) -> &[CameraDevice] {
        &self.cameras
    }

    pub fn cameras_mut(&mut self) -> &mut [CameraDevice] {
        &mut self.cameras
    }

    /// Capture every camera once and write `camera-<i>.drc` files.
    ///
    /// Only a failure to create the capture directory fails the whole
    /// command; a failing camera loses just its own files.
    pub fn save_point_cloud(&mut self, request: &CaptureRequest) -> Result<CaptureReport, FleetError> {
        let dir = request.capture_dir(&self.pointcloud_dir);
        std::fs::create_dir_all(&dir).map_err(|source| FleetError::CaptureDir {
            path: dir.clone(),
            source,
        })?;

        let mut report = CaptureReport {
            dir: dir.clone(),
            ..CaptureReport::default()
        };
        for (index, camera) in self.cameras.iter_mut().enumerate() {
            match capture_camera(camera, index, &dir, self.encode, self.save_rgb) {
                Ok(mut files) => report.written.append(&mut files),
                Err(err) => {
                    tracing::warn!(identity = camera.identity(), index, error = %err, "camera capture failed");
                    report.failed.push((index, err.to_string()));
                }
            }
        }
        tracing::info!(
            line = %request.line_label(),
            row = %request.row_label(),
            capture = %request.capture_label(),
            written = report.written.len(),
            failed = report.failed.len(),
            "capture saved"
        );
        Ok(report)
    }

    /// Shut every camera down in capture order. Idempotent.
    pub fn shutdown(&mut self) {
        for camera in &mut self.cameras {
            camera.shutdown();
        }
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_camera(
    camera: &mut CameraDevice,
    index: usize,
    dir: &Path,
    encode: EncodeOptions,
    save_rgb: bool,
) -> Result<Vec<PathBuf>, FleetError> {
    let cloud = camera.update()?;
    let blob = codec::encode(cloud, encode)?;
    let cloud_path = dir.join(format!("camera-{index}.drc"));
    write_atomic(&cloud_path, &blob)?;
    let mut files = vec![cloud_path];

    if save_rgb {
        let png_path = dir.join(format!("rgb-camera-{index}.png"));
        match camera.save_color_png(&png_path) {
            Ok(true) => files.push(png_path),
            Ok(false) => {}
            Err(err) => tracing::warn!(identity = camera.identity(), error = %err, "color frame not saved"),
        }
    }
    Ok(files)
}

/// Write through a temporary file so readers never see a partial capture.
/// The temporary file is removed if the write or the rename fails.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FleetError> {
    let write_err = |source| FleetError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".camera-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}
