//! One RGB-D camera: device handle, calibration, current cloud and preview.

use crate::backend::{BackendError, DeviceBackend, DeviceHandle, PipelineSettings, RgbdBundle};
use crate::calibration::{CalibrationError, CalibrationStore, Extrinsics};
use crate::frame::{self, FrameError};
use crate::registry::DiscoveredDevice;
use crate::stream::VideoResponder;
use nalgebra::Matrix4;
use rowscan_core::types::{flip_z, translation_to_millimeters};
use rowscan_core::PointCloud;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("failed to initialize camera {identity}: {source}")]
    Init {
        identity: String,
        #[source]
        source: BackendError,
    },
    #[error("camera {identity}: no frame within {timeout:?}")]
    FrameTimeout { identity: String, timeout: Duration },
    #[error("camera {identity}: capture failed: {source}")]
    Capture {
        identity: String,
        #[source]
        source: BackendError,
    },
    #[error("camera {identity}: {source}")]
    Frame {
        identity: String,
        #[source]
        source: FrameError,
    },
    #[error("camera {0} is shut down")]
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub pipeline: PipelineSettings,
    /// Bound on a single wait for a synchronized bundle.
    pub frame_timeout: Duration,
    /// Bound on each shutdown step (preview join, device close).
    pub shutdown_timeout: Duration,
    pub cors_origin: String,
    /// Start the MJPEG preview responder.
    pub preview: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineSettings::default(),
            frame_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            cors_origin: "http://localhost:8042".to_string(),
            preview: true,
        }
    }
}

pub struct CameraDevice {
    identity: String,
    stream_port: u16,
    settings: CameraSettings,
    store: CalibrationStore,
    extrinsics: Extrinsics,
    alignment: Matrix4<f64>,
    transform: Matrix4<f64>,
    cloud: PointCloud,
    last_bundle: Option<RgbdBundle>,
    handle: Option<Box<dyn DeviceHandle>>,
    responder: Option<VideoResponder>,
}

impl CameraDevice {
    /// Open the device, load its calibration and start the preview.
    ///
    /// Only a failure to open the device is fatal. Missing or unreadable
    /// calibration falls back to identity, and a preview that cannot start
    /// leaves the camera running without one.
    pub fn construct(
        backend: &dyn DeviceBackend,
        device: &DiscoveredDevice,
        settings: CameraSettings,
        store: CalibrationStore,
    ) -> Result<Self, CameraError> {
        let identity = device.info.identity.clone();
        let mut handle = backend
            .open(&device.info, &settings.pipeline)
            .map_err(|source| CameraError::Init {
                identity: identity.clone(),
                source,
            })?;

        let extrinsics = match store.load_extrinsics(&identity) {
            Ok(ext) => ext,
            Err(err) => {
                tracing::warn!(identity = %identity, error = %err, "extrinsics unavailable; using identity");
                Extrinsics::identity()
            }
        };
        let alignment = match store.load_alignment(&identity) {
            Ok(m) => m,
            Err(CalibrationError::Missing(path)) => {
                tracing::warn!(identity = %identity, path = %path.display(), "no alignment record; using identity");
                Matrix4::identity()
            }
            Err(err) => {
                tracing::warn!(identity = %identity, error = %err, "alignment unreadable; using identity");
                Matrix4::identity()
            }
        };

        let responder = if settings.preview {
            start_preview(&mut *handle, &identity, device.stream_port, &settings.cors_origin)
        } else {
            None
        };

        let transform = compose_transform(&extrinsics, &alignment);
        tracing::info!(
            identity = %identity,
            port = device.stream_port,
            preview = responder.is_some(),
            pipeline_fps = settings.pipeline.pipeline_fps,
            video_fps = settings.pipeline.video_fps,
            "camera ready"
        );

        Ok(Self {
            identity,
            stream_port: device.stream_port,
            settings,
            store,
            extrinsics,
            alignment,
            transform,
            cloud: PointCloud::default(),
            last_bundle: None,
            handle: Some(handle),
            responder,
        })
    }

    /// Capture one synchronized frame and replace the stored cloud with it,
    /// mapped into the world frame (millimeters).
    pub fn update(&mut self) -> Result<&PointCloud, CameraError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| CameraError::Closed(self.identity.clone()))?;
        let timeout = self.settings.frame_timeout;
        let bundle = handle.next_bundle(timeout).map_err(|err| match err {
            BackendError::FrameTimeout(timeout) => CameraError::FrameTimeout {
                identity: self.identity.clone(),
                timeout,
            },
            source => CameraError::Capture {
                identity: self.identity.clone(),
                source,
            },
        })?;
        let cloud = frame::bundle_to_cloud(&bundle, &self.transform).map_err(|source| {
            CameraError::Frame {
                identity: self.identity.clone(),
                source,
            }
        })?;
        tracing::debug!(identity = %self.identity, sequence = bundle.sequence, points = cloud.len(), "frame converted");
        self.cloud = cloud;
        self.last_bundle = Some(bundle);
        Ok(&self.cloud)
    }

    /// Replace the alignment correction. The stored cloud is re-projected
    /// so it stays consistent with the new transform.
    pub fn set_alignment(&mut self, alignment: Matrix4<f64>) {
        let transform = compose_transform(&self.extrinsics, &alignment);
        match self.transform.try_inverse() {
            Some(inverse) => self.cloud.transform(&(transform * inverse)),
            None => self.cloud = PointCloud::default(),
        }
        self.alignment = alignment;
        self.transform = transform;
    }

    /// Write the current alignment to the calibration store.
    pub fn persist_alignment(&self) -> Result<(), CalibrationError> {
        self.store.save_alignment(&self.identity, &self.alignment)?;
        tracing::info!(identity = %self.identity, "alignment saved");
        Ok(())
    }

    /// Write the color frame behind the current cloud as PNG. Returns
    /// `false` when no frame has been captured yet.
    pub fn save_color_png(&self, path: &Path) -> Result<bool, CameraError> {
        let Some(bundle) = &self.last_bundle else {
            return Ok(false);
        };
        frame::save_color_png(bundle, path).map_err(|source| CameraError::Frame {
            identity: self.identity.clone(),
            source,
        })?;
        Ok(true)
    }

    /// Stop the preview and close the device, each with a bounded wait.
    /// Later calls do nothing.
    pub fn shutdown(&mut self) {
        let timeout = self.settings.shutdown_timeout;
        let mut released = false;
        if let Some(responder) = self.responder.take() {
            released = true;
            if let Err(err) = responder.stop(timeout) {
                tracing::warn!(identity = %self.identity, error = %err, "preview did not stop cleanly");
            }
        }
        if let Some(handle) = self.handle.take() {
            released = true;
            close_bounded(handle, &self.identity, timeout);
        }
        if released {
            tracing::info!(identity = %self.identity, "camera shut down");
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Port the preview is served on; the bound port when an ephemeral
    /// one was requested.
    pub fn stream_port(&self) -> u16 {
        self.preview_addr()
            .map_or(self.stream_port, |addr| addr.port())
    }

    pub fn preview_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(VideoResponder::local_addr)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn extrinsics(&self) -> &Extrinsics {
        &self.extrinsics
    }

    pub fn alignment(&self) -> &Matrix4<f64> {
        &self.alignment
    }

    /// `cam_to_world · alignment · flip_z`, translation in millimeters.
    pub fn transform(&self) -> &Matrix4<f64> {
        &self.transform
    }

    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compose_transform(extrinsics: &Extrinsics, alignment: &Matrix4<f64>) -> Matrix4<f64> {
    translation_to_millimeters(&(extrinsics.cam_to_world * alignment * flip_z()))
}

fn start_preview(
    handle: &mut dyn DeviceHandle,
    identity: &str,
    port: u16,
    cors_origin: &str,
) -> Option<VideoResponder> {
    let Some(source) = handle.take_video_source() else {
        tracing::warn!(identity, "device has no preview source");
        return None;
    };
    match VideoResponder::start(source, port, cors_origin, identity) {
        Ok(responder) => Some(responder),
        Err(err) => {
            tracing::warn!(identity, port, error = %err, "preview unavailable; continuing without it");
            None
        }
    }
}

/// Close a handle on a helper thread, giving up after `timeout`.
fn close_bounded(mut handle: Box<dyn DeviceHandle>, identity: &str, timeout: Duration) {
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("close-{identity}"))
        .spawn(move || {
            let _ = tx.send(handle.close());
        });
    if let Err(err) = spawned {
        tracing::warn!(identity, error = %err, "could not spawn close thread; device left open");
        return;
    }
    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(identity, error = %err, "device close failed"),
        Err(_) => tracing::warn!(identity, ?timeout, "device close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceInfo;
    use crate::sim::{terrain_height, Fault, SimulatedBackend};

    fn settings(preview: bool) -> CameraSettings {
        CameraSettings {
            pipeline: PipelineSettings {
                pipeline_fps: 200,
                video_fps: 200,
            },
            frame_timeout: Duration::from_millis(300),
            shutdown_timeout: Duration::from_secs(2),
            preview,
            ..CameraSettings::default()
        }
    }

    fn discovered(identity: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            info: DeviceInfo {
                identity: identity.to_string(),
                model: "sim-rgbd".to_string(),
            },
            stream_port: 0,
        }
    }

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(&["10.95.76.11"]).with_resolution(48, 36)
    }

    #[test]
    fn test_missing_calibration_degrades_to_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = CameraDevice::construct(
            &backend(),
            &discovered("10.95.76.11"),
            settings(false),
            CalibrationStore::new(dir.path()),
        )
        .unwrap();
        assert_eq!(cam.extrinsics(), &Extrinsics::identity());
        assert_eq!(cam.alignment(), &Matrix4::identity());
        assert_eq!(cam.transform(), &flip_z());

        let cloud = cam.update().unwrap();
        assert!(!cloud.is_empty());
        // Identity extrinsics leave the cloud in the mirrored camera frame.
        assert!(cloud.points().iter().all(|p| p.z < -800.0));
    }

    #[test]
    fn test_calibrated_cloud_lands_on_scene() {
        let dir = tempfile::tempdir().unwrap();
        let sim = backend();
        let store = CalibrationStore::new(dir.path());
        let pose = sim.pose("10.95.76.11").unwrap();
        store
            .save_extrinsics("10.95.76.11", &Extrinsics::from_pose(pose).unwrap())
            .unwrap();

        let mut cam =
            CameraDevice::construct(&sim, &discovered("10.95.76.11"), settings(false), store).unwrap();
        let cloud = cam.update().unwrap();
        for p in cloud.points() {
            let expected = terrain_height(p.x / 1000.0, p.y / 1000.0) * 1000.0;
            assert!((p.z - expected).abs() < 0.5);
        }
        assert_eq!(cloud.points().len(), cloud.colors().len());
    }

    #[test]
    fn test_set_alignment_reprojects_stored_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = CameraDevice::construct(
            &backend(),
            &discovered("10.95.76.11"),
            settings(false),
            CalibrationStore::new(dir.path()),
        )
        .unwrap();
        cam.update().unwrap();

        let mut correction = nalgebra::Rotation3::from_euler_angles(0.01, 0.0, -0.02).to_homogeneous();
        correction[(0, 3)] = 0.02;
        cam.set_alignment(correction);
        let reprojected = cam.cloud().clone();

        let fresh = cam.update().unwrap();
        assert_eq!(fresh.len(), reprojected.len());
        for (a, b) in fresh.points().iter().zip(reprojected.points()) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn test_persist_alignment_writes_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        let mut cam = CameraDevice::construct(
            &backend(),
            &discovered("10.95.76.11"),
            settings(false),
            store.clone(),
        )
        .unwrap();
        let mut m = Matrix4::identity();
        m[(1, 3)] = -0.004;
        cam.set_alignment(m);
        cam.persist_alignment().unwrap();
        cam.persist_alignment().unwrap();
        assert_eq!(store.load_alignment("10.95.76.11").unwrap(), m);
    }

    #[test]
    fn test_init_failure_and_frame_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedBackend::new(&["a1", "a2"])
            .with_resolution(16, 12)
            .with_fault("a1", Fault::FailOpen)
            .with_fault("a2", Fault::Stall);
        let store = CalibrationStore::new(dir.path());

        let err = CameraDevice::construct(&sim, &discovered("a1"), settings(false), store.clone())
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::Init { .. }));

        let mut stalled = CameraDevice::construct(&sim, &discovered("a2"), settings(false), store).unwrap();
        assert!(matches!(stalled.update(), Err(CameraError::FrameTimeout { .. })));
    }

    #[test]
    fn test_shutdown_idempotent_and_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let sim = backend();
        let mut cam = CameraDevice::construct(
            &sim,
            &discovered("10.95.76.11"),
            settings(true),
            CalibrationStore::new(dir.path()),
        )
        .unwrap();
        let addr = cam.preview_addr().unwrap();
        assert_eq!(cam.stream_port(), addr.port());
        assert_eq!(sim.open_handles(), 1);

        cam.shutdown();
        cam.shutdown();
        assert!(!cam.is_open());
        assert_eq!(sim.open_handles(), 0);
        assert!(matches!(cam.update(), Err(CameraError::Closed(_))));
        assert!(std::net::TcpStream::connect(addr).is_err());
        drop(cam);
    }

    #[test]
    fn test_color_png_after_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut cam = CameraDevice::construct(
            &backend(),
            &discovered("10.95.76.11"),
            settings(false),
            CalibrationStore::new(dir.path()),
        )
        .unwrap();
        let path = dir.path().join("rgb.png");
        assert!(!cam.save_color_png(&path).unwrap());
        cam.update().unwrap();
        assert!(cam.save_color_png(&path).unwrap());
        assert_eq!(image::open(&path).unwrap().to_rgb8().dimensions(), (48, 36));
    }
}
