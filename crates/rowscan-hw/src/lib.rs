//! RGB-D camera devices and everything that owns them.
//!
//! Devices are reached through the [`backend::DeviceBackend`] seam; the
//! shipped backend is [`sim::SimulatedBackend`]. On top of a backend sit the
//! device registry, per-camera state with its live MJPEG preview, the
//! calibration store, and the cross-camera alignment engine.

pub mod alignment;
pub mod backend;
pub mod calibration;
pub mod camera;
pub mod frame;
pub mod registry;
pub mod sim;
pub mod stream;

pub use alignment::{AlignmentEngine, AlignmentError, CameraAlignment};
pub use backend::{BackendError, DeviceBackend, DeviceHandle, DeviceInfo, PipelineSettings, RgbdBundle, VideoSource};
pub use calibration::{CalibrationError, CalibrationStore, Extrinsics};
pub use camera::{CameraDevice, CameraError, CameraSettings};
pub use registry::{DeviceRegistry, DiscoveredDevice};
pub use sim::SimulatedBackend;
pub use stream::{StreamError, VideoResponder};
