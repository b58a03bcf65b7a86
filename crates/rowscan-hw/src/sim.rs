//! Simulated RGB-D backend.
//!
//! Renders a static crop row (an undulating, textured soil bed with a grid
//! of raised plants) as seen by downward-looking pinhole cameras mounted on
//! a boom. Each simulated device has a true pose; the bundles it produces
//! are exact camera-frame samples of the scene under that pose, so a fleet
//! whose calibration matches the poses fuses into one consistent surface.

use crate::backend::{
    BackendError, DeviceBackend, DeviceHandle, DeviceInfo, PipelineSettings, RgbdBundle,
    VideoSource,
};
use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rowscan_core::types::{flip_z, translation_to_millimeters};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_WIDTH: u32 = 160;
pub const DEFAULT_HEIGHT: u32 = 120;
const HORIZONTAL_FOV_DEG: f64 = 75.0;
const MOUNT_HEIGHT_M: f64 = 1.2;
const CAMERA_SPACING_M: f64 = 0.45;
const PLANT_PITCH_X_M: f64 = 0.3;
const PLANT_PITCH_Y_M: f64 = 0.35;
const PLANT_HEIGHT_M: f64 = 0.12;
const PLANT_SIGMA_M: f64 = 0.05;
const JPEG_QUALITY: u8 = 80;
const MODEL: &str = "sim-rgbd";

/// Injected misbehaviour for one simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `open` fails as if the pipeline could not be built.
    FailOpen,
    /// The device opens but never delivers a bundle.
    Stall,
}

#[derive(Debug, Clone)]
struct SimDevice {
    identity: String,
    pose: Matrix4<f64>,
}

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    devices: Vec<SimDevice>,
    faults: HashMap<String, Fault>,
    noise_mm: f64,
    width: u32,
    height: u32,
    open_handles: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    /// Devices placed along the boom in the given order, 45 cm apart.
    pub fn new<S: AsRef<str>>(identities: &[S]) -> Self {
        let devices = identities
            .iter()
            .enumerate()
            .map(|(i, id)| SimDevice {
                identity: id.as_ref().to_string(),
                pose: default_pose(i),
            })
            .collect();
        Self {
            devices,
            faults: HashMap::new(),
            noise_mm: 0.0,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build from config strings. Fault entries are `<identity>` (open
    /// failure) or `<identity>:stall`.
    pub fn from_config<S: AsRef<str>>(identities: &[S], faults: &[S], noise_mm: f64) -> Self {
        let mut backend = Self::new(identities).with_noise_mm(noise_mm);
        for entry in faults {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((id, "stall")) => backend = backend.with_fault(id, Fault::Stall),
                Some((id, other)) => {
                    tracing::warn!(identity = id, fault = other, "unknown simulated fault; using open failure");
                    backend = backend.with_fault(id, Fault::FailOpen);
                }
                None => backend = backend.with_fault(entry, Fault::FailOpen),
            }
        }
        backend
    }

    pub fn with_fault(mut self, identity: &str, fault: Fault) -> Self {
        self.faults.insert(identity.to_string(), fault);
        self
    }

    pub fn with_noise_mm(mut self, noise_mm: f64) -> Self {
        self.noise_mm = noise_mm.max(0.0);
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    /// Override the true pose (`cam_to_world`, meters) of one device.
    pub fn with_pose(mut self, identity: &str, pose: Matrix4<f64>) -> Self {
        if let Some(device) = self.devices.iter_mut().find(|d| d.identity == identity) {
            device.pose = pose;
        }
        self
    }

    /// True `cam_to_world` of a device, in meters.
    pub fn pose(&self, identity: &str) -> Option<Matrix4<f64>> {
        self.devices
            .iter()
            .find(|d| d.identity == identity)
            .map(|d| d.pose)
    }

    /// Number of handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for SimulatedBackend {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .map(|d| DeviceInfo {
                identity: d.identity.clone(),
                model: MODEL.to_string(),
            })
            .collect()
    }

    fn open(
        &self,
        device: &DeviceInfo,
        settings: &PipelineSettings,
    ) -> Result<Box<dyn DeviceHandle>, BackendError> {
        let sim = self
            .devices
            .iter()
            .find(|d| d.identity == device.identity)
            .ok_or_else(|| BackendError::DeviceNotFound(device.identity.clone()))?;

        let fault = self.faults.get(&sim.identity).copied();
        if fault == Some(Fault::FailOpen) {
            return Err(BackendError::OpenFailed {
                identity: sim.identity.clone(),
                reason: "pipeline setup failed (injected)".to_string(),
            });
        }

        let renderer = Renderer::new(sim.pose, self.width, self.height);
        let (preview_rgb, _) = renderer.render(None, 0.0);
        let jpeg = encode_jpeg(&preview_rgb, self.width, self.height)?;

        self.open_handles.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(identity = %sim.identity, width = self.width, height = self.height, "simulated device opened");

        Ok(Box::new(SimHandle {
            identity: sim.identity.clone(),
            renderer,
            stalled: fault == Some(Fault::Stall),
            noise_mm: self.noise_mm,
            pacer: Pacer::new(settings.pipeline_fps),
            sequence: 0,
            rng: StdRng::seed_from_u64(fnv1a(sim.identity.as_bytes())),
            video: Some(Box::new(SimVideo {
                jpeg,
                pacer: Pacer::new(settings.video_fps),
            })),
            open: true,
            open_handles: Arc::clone(&self.open_handles),
        }))
    }
}

/// Default mount: cameras spaced along +x at boom height, each slightly
/// tilted so neighbouring views are not related by a pure translation.
pub fn default_pose(index: usize) -> Matrix4<f64> {
    let sign = if index % 2 == 0 { 1.0 } else { -1.0 };
    let mut pose = Rotation3::from_euler_angles(0.04 * sign, -0.03 * sign, 0.02 * index as f64)
        .to_homogeneous();
    pose[(0, 3)] = CAMERA_SPACING_M * index as f64;
    pose[(1, 3)] = 0.0;
    pose[(2, 3)] = MOUNT_HEIGHT_M;
    pose
}

/// Scene surface height at ground position `(x, y)`, meters.
pub fn terrain_height(x: f64, y: f64) -> f64 {
    let bed = 0.025 * (2.1 * x).sin() * (1.7 * y).cos() + 0.01 * (5.3 * x + 1.1).sin();
    let px = (x / PLANT_PITCH_X_M).round() * PLANT_PITCH_X_M;
    let py = (y / PLANT_PITCH_Y_M).round() * PLANT_PITCH_Y_M;
    let r2 = (x - px).powi(2) + (y - py).powi(2);
    bed + PLANT_HEIGHT_M * (-r2 / (2.0 * PLANT_SIGMA_M * PLANT_SIGMA_M)).exp()
}

/// Scene color at ground position `(x, y)`, unit interval RGB.
pub fn terrain_color(x: f64, y: f64) -> Vector3<f64> {
    let plant = ((terrain_height(x, y) - 0.035) / 0.05).clamp(0.0, 1.0);
    let grain = 0.5 + 0.5 * (9.0 * x).sin() * (7.0 * y).cos();
    let soil = Vector3::new(0.35 + 0.25 * grain, 0.24 + 0.15 * grain, 0.12 + 0.08 * grain);
    let leaf = Vector3::new(0.15, 0.45 + 0.3 * grain, 0.12);
    soil * (1.0 - plant) + leaf * plant
}

struct Renderer {
    pose: Matrix4<f64>,
    width: u32,
    height: u32,
    focal: f64,
}

impl Renderer {
    fn new(pose: Matrix4<f64>, width: u32, height: u32) -> Self {
        let focal = (width as f64 / 2.0) / (HORIZONTAL_FOV_DEG.to_radians() / 2.0).tan();
        Self {
            pose,
            width,
            height,
            focal,
        }
    }

    /// Color buffer and camera-frame points (mm) for one frame.
    fn render(&self, mut rng: Option<&mut StdRng>, noise_mm: f64) -> (Vec<u8>, Vec<[f32; 3]>) {
        let pixels = self.width as usize * self.height as usize;
        let mut color = Vec::with_capacity(pixels * 3);
        let mut points = Vec::with_capacity(pixels);

        let to_world_mm = translation_to_millimeters(&(self.pose * flip_z()));
        let to_camera = to_world_mm.try_inverse().unwrap_or_else(Matrix4::identity);
        let rotation: Matrix3<f64> = self.pose.fixed_view::<3, 3>(0, 0).into_owned();
        let origin = Vector3::new(self.pose[(0, 3)], self.pose[(1, 3)], self.pose[(2, 3)]);
        let cx = (self.width as f64 - 1.0) / 2.0;
        let cy = (self.height as f64 - 1.0) / 2.0;

        for v in 0..self.height {
            for u in 0..self.width {
                let ray = rotation
                    * Vector3::new(
                        (u as f64 - cx) / self.focal,
                        (v as f64 - cy) / self.focal,
                        -1.0,
                    );
                if ray.z >= -1e-6 {
                    color.extend_from_slice(&[0, 0, 0]);
                    points.push([0.0; 3]);
                    continue;
                }
                let t = -origin.z / ray.z;
                let gx = origin.x + t * ray.x;
                let gy = origin.y + t * ray.y;
                let c = terrain_color(gx, gy);
                color.extend(c.iter().map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8));

                // Sparse deterministic dropout, like specular or out-of-range pixels.
                if (u * 31 + v * 17) % 97 == 0 {
                    points.push([0.0; 3]);
                    continue;
                }
                let world = Point3::new(gx, gy, terrain_height(gx, gy)) * 1000.0;
                let mut p = to_camera.transform_point(&world);
                if let Some(rng) = rng.as_deref_mut() {
                    if noise_mm > 0.0 {
                        p.z += rng.gen_range(-noise_mm..=noise_mm);
                    }
                }
                points.push([p.x as f32, p.y as f32, p.z as f32]);
            }
        }
        (color, points)
    }
}

/// Paces a source to a fixed frame rate.
struct Pacer {
    period: Duration,
    next_due: Instant,
}

impl Pacer {
    fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            next_due: Instant::now(),
        }
    }

    /// Sleep until the next frame is due. Returns false (after sleeping
    /// the full timeout) if it is not due within `timeout`.
    fn wait(&mut self, timeout: Duration) -> bool {
        let now = Instant::now();
        let wait = self.next_due.saturating_duration_since(now);
        if wait > timeout {
            std::thread::sleep(timeout);
            return false;
        }
        std::thread::sleep(wait);
        self.next_due = self.next_due.max(now) + self.period;
        true
    }
}

struct SimHandle {
    identity: String,
    renderer: Renderer,
    stalled: bool,
    noise_mm: f64,
    pacer: Pacer,
    sequence: u64,
    rng: StdRng,
    video: Option<Box<dyn VideoSource>>,
    open: bool,
    open_handles: Arc<AtomicUsize>,
}

impl DeviceHandle for SimHandle {
    fn next_bundle(&mut self, timeout: Duration) -> Result<RgbdBundle, BackendError> {
        if !self.open {
            return Err(BackendError::Disconnected(self.identity.clone()));
        }
        if self.stalled {
            std::thread::sleep(timeout);
            return Err(BackendError::FrameTimeout(timeout));
        }
        if !self.pacer.wait(timeout) {
            return Err(BackendError::FrameTimeout(timeout));
        }
        let (color, points) = self.renderer.render(Some(&mut self.rng), self.noise_mm);
        self.sequence += 1;
        Ok(RgbdBundle {
            width: self.renderer.width,
            height: self.renderer.height,
            color,
            points,
            sequence: self.sequence,
        })
    }

    fn take_video_source(&mut self) -> Option<Box<dyn VideoSource>> {
        self.video.take()
    }

    fn close(&mut self) -> Result<(), BackendError> {
        if self.open {
            self.open = false;
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(identity = %self.identity, "simulated device closed");
        }
        Ok(())
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct SimVideo {
    jpeg: Vec<u8>,
    pacer: Pacer,
}

impl VideoSource for SimVideo {
    fn next_frame(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.pacer.wait(timeout).then(|| self.jpeg.clone())
    }
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(rgb, width, height, image::ExtendedColorType::Rgb8)
        .map_err(|e| BackendError::Encode(e.to_string()))?;
    Ok(out)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
