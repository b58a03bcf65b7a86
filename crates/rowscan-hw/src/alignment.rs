//! Cross-camera alignment.
//!
//! Each non-reference camera is registered against the reference camera's
//! cloud. Registration works in meters in the body frame of the camera
//! being aligned:
//!
//! - source: the camera's own cloud with extrinsics and alignment removed,
//!   i.e. `flip_z · p` for each raw camera point `p`;
//! - target: the reference cloud mapped through the aligned camera's
//!   `world_to_cam`.
//!
//! Seeded with the current alignment, the registration result is the new
//! alignment itself, so a converged fleet is a fixed point of `align`.

use crate::calibration::CalibrationError;
use crate::camera::CameraDevice;
use nalgebra::Matrix4;
use rowscan_core::registration::{
    multi_scale_colored_icp, PyramidStage, RegistrationError, RegistrationResult, DEFAULT_PYRAMID,
};
use rowscan_core::types::uniform_scale;
use rowscan_core::PointCloud;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("alignment needs at least two cameras, got {0}")]
    TooFewCameras(usize),
    #[error("reference index {index} out of range for {count} cameras")]
    InvalidReference { index: usize, count: usize },
    #[error("reference camera {0} has no points")]
    EmptyReference(String),
    #[error("camera {identity}: calibration is not invertible")]
    Singular { identity: String },
    #[error("camera {identity}: {source}")]
    Registration {
        identity: String,
        #[source]
        source: RegistrationError,
    },
    #[error("camera {identity}: {source}")]
    Persist {
        identity: String,
        #[source]
        source: CalibrationError,
    },
}

/// Outcome of aligning one non-reference camera.
#[derive(Debug)]
pub struct CameraAlignment {
    pub identity: String,
    pub outcome: Result<RegistrationResult, AlignmentError>,
}

#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    stages: Vec<PyramidStage>,
}

impl Default for AlignmentEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PYRAMID.to_vec())
    }
}

impl AlignmentEngine {
    pub fn new(stages: Vec<PyramidStage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[PyramidStage] {
        &self.stages
    }

    /// Refine and persist the alignment of every camera except
    /// `cameras[reference]`, whose alignment is left untouched.
    ///
    /// Cameras must hold a current cloud (see [`CameraDevice::update`]).
    /// A camera whose registration fails keeps its previous alignment; the
    /// others still run.
    pub fn align(
        &self,
        cameras: &mut [CameraDevice],
        reference: usize,
    ) -> Result<Vec<CameraAlignment>, AlignmentError> {
        let count = cameras.len();
        if count < 2 {
            return Err(AlignmentError::TooFewCameras(count));
        }
        if reference >= count {
            return Err(AlignmentError::InvalidReference {
                index: reference,
                count,
            });
        }
        let target_world = cameras[reference].cloud().clone();
        if target_world.is_empty() {
            return Err(AlignmentError::EmptyReference(
                cameras[reference].identity().to_string(),
            ));
        }
        tracing::info!(
            reference = cameras[reference].identity(),
            cameras = count,
            points = target_world.len(),
            "alignment started"
        );

        let mut report = Vec::with_capacity(count - 1);
        for (index, camera) in cameras.iter_mut().enumerate() {
            if index == reference {
                continue;
            }
            let outcome = self.align_one(camera, &target_world);
            match &outcome {
                Ok(result) => tracing::info!(
                    identity = camera.identity(),
                    fitness = result.fitness,
                    inlier_rmse = result.inlier_rmse,
                    iterations = result.iterations,
                    "camera aligned"
                ),
                Err(err) => tracing::warn!(identity = camera.identity(), error = %err, "camera alignment failed"),
            }
            report.push(CameraAlignment {
                identity: camera.identity().to_string(),
                outcome,
            });
        }
        Ok(report)
    }

    fn align_one(
        &self,
        camera: &mut CameraDevice,
        target_world: &PointCloud,
    ) -> Result<RegistrationResult, AlignmentError> {
        let identity = camera.identity().to_string();
        let to_meters = uniform_scale(0.001);
        let extrinsics = *camera.extrinsics();
        let world_to_body = (extrinsics.cam_to_world * camera.alignment())
            .try_inverse()
            .ok_or_else(|| AlignmentError::Singular {
                identity: identity.clone(),
            })?;

        let source = camera.cloud().transformed(&(world_to_body * to_meters));
        let target = target_world.transformed(&(extrinsics.world_to_cam * to_meters));
        let result = multi_scale_colored_icp(&source, &target, camera.alignment(), &self.stages)
            .map_err(|source| AlignmentError::Registration {
                identity: identity.clone(),
                source,
            })?;

        camera.set_alignment(result.transformation);
        camera
            .persist_alignment()
            .map_err(|source| AlignmentError::Persist { identity, source })?;
        Ok(result)
    }

    /// Set every camera's alignment to identity and persist it.
    ///
    /// Every camera is attempted; the first persistence failure is returned.
    pub fn reset(&self, cameras: &mut [CameraDevice]) -> Result<(), AlignmentError> {
        let mut first_error = None;
        for camera in cameras.iter_mut() {
            camera.set_alignment(Matrix4::identity());
            if let Err(source) = camera.persist_alignment() {
                tracing::warn!(identity = camera.identity(), error = %source, "failed to persist reset alignment");
                first_error.get_or_insert(AlignmentError::Persist {
                    identity: camera.identity().to_string(),
                    source,
                });
            }
        }
        tracing::info!(cameras = cameras.len(), "alignment reset");
        first_error.map_or(Ok(()), Err)
    }
}
