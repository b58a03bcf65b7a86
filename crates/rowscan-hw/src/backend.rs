//! Device backend seam.
//!
//! A backend enumerates RGB-D devices and opens them into handles that
//! yield synchronized depth+color bundles and an independent JPEG preview
//! source. Handles are owned by exactly one thread at a time.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open {identity}: {reason}")]
    OpenFailed { identity: String, reason: String },
    #[error("no frame within {0:?}")]
    FrameTimeout(Duration),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("preview encoding failed: {0}")]
    Encode(String),
}

/// A device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable device address, e.g. `10.95.76.12`.
    pub identity: String,
    pub model: String,
}

/// Frame rates requested when building the capture graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub pipeline_fps: u32,
    pub video_fps: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pipeline_fps: 30,
            video_fps: 20,
        }
    }
}

/// One synchronized depth+color frame.
///
/// `points` holds one camera-frame position per color pixel in
/// millimeters, row-major. Pixels without a depth return are `[0, 0, 0]`.
#[derive(Debug, Clone)]
pub struct RgbdBundle {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, `width * height * 3` bytes.
    pub color: Vec<u8>,
    pub points: Vec<[f32; 3]>,
    pub sequence: u64,
}

impl RgbdBundle {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether the color and point buffers agree with the frame size.
    pub fn is_consistent(&self) -> bool {
        self.color.len() == self.pixel_count() * 3 && self.points.len() == self.pixel_count()
    }
}

pub trait DeviceBackend: Send + Sync {
    /// List reachable devices. Never fails; unreachable devices are omitted.
    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Build the capture graph and open the device.
    fn open(
        &self,
        device: &DeviceInfo,
        settings: &PipelineSettings,
    ) -> Result<Box<dyn DeviceHandle>, BackendError>;
}

pub trait DeviceHandle: Send {
    /// Block up to `timeout` for the next synchronized bundle.
    fn next_bundle(&mut self, timeout: Duration) -> Result<RgbdBundle, BackendError>;

    /// Detach the preview source so it can be pumped from its own thread.
    /// Returns `None` after the first call.
    fn take_video_source(&mut self) -> Option<Box<dyn VideoSource>>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self) -> Result<(), BackendError>;
}

pub trait VideoSource: Send {
    /// Block up to `timeout` for the next JPEG-encoded preview frame.
    fn next_frame(&mut self, timeout: Duration) -> Option<Vec<u8>>;
}
