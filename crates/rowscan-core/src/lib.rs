//! Point cloud geometry, registration and compression.
//!
//! Holds everything that works on clouds without touching hardware:
//! voxel downsampling and normal estimation, multi-resolution colored ICP,
//! and the `.drc` capture codec read by downstream analysis tools.

pub mod codec;
pub mod registration;
pub mod spatial;
pub mod types;

pub use codec::{decode, encode, EncodeError, EncodeOptions, FormatError};
pub use registration::{PyramidStage, RegistrationError, RegistrationResult};
pub use types::{CloudError, PointCloud};
