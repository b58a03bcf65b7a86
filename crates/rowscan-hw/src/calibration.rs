//! Per-camera calibration files.
//!
//! One directory holds, per device identity:
//!
//! - `extrinsics_<identity>.toml` with `cam_to_world` and `world_to_cam`,
//!   written by the offline calibration procedure;
//! - `alignment_<identity>.toml` with the corrective `transform` produced
//!   by the alignment engine.
//!
//! Matrices are stored as four rows of four floats, translations in meters.

use nalgebra::Matrix4;
use rowscan_core::types::{matrix_from_rows, matrix_to_rows, MatrixRows};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("calibration file missing: {}", .0.display())]
    Missing(PathBuf),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed calibration file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize calibration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Camera placement produced by offline calibration. Meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    pub cam_to_world: Matrix4<f64>,
    pub world_to_cam: Matrix4<f64>,
}

impl Extrinsics {
    pub fn identity() -> Self {
        Self {
            cam_to_world: Matrix4::identity(),
            world_to_cam: Matrix4::identity(),
        }
    }

    /// Extrinsics from a `cam_to_world` pose, deriving its inverse.
    pub fn from_pose(cam_to_world: Matrix4<f64>) -> Option<Self> {
        Some(Self {
            cam_to_world,
            world_to_cam: cam_to_world.try_inverse()?,
        })
    }
}

impl Default for Extrinsics {
    fn default() -> Self {
        Self::identity()
    }
}

#[derive(Serialize, Deserialize)]
struct ExtrinsicsFile {
    cam_to_world: MatrixRows,
    world_to_cam: MatrixRows,
}

#[derive(Serialize, Deserialize)]
struct AlignmentFile {
    transform: MatrixRows,
}

#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extrinsics_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("extrinsics_{}.toml", file_safe(identity)))
    }

    pub fn alignment_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("alignment_{}.toml", file_safe(identity)))
    }

    pub fn load_extrinsics(&self, identity: &str) -> Result<Extrinsics, CalibrationError> {
        let file: ExtrinsicsFile = read_toml(&self.extrinsics_path(identity))?;
        Ok(Extrinsics {
            cam_to_world: matrix_from_rows(&file.cam_to_world),
            world_to_cam: matrix_from_rows(&file.world_to_cam),
        })
    }

    pub fn save_extrinsics(&self, identity: &str, extrinsics: &Extrinsics) -> Result<(), CalibrationError> {
        let file = ExtrinsicsFile {
            cam_to_world: matrix_to_rows(&extrinsics.cam_to_world),
            world_to_cam: matrix_to_rows(&extrinsics.world_to_cam),
        };
        write_toml_atomic(&self.extrinsics_path(identity), &file)
    }

    pub fn load_alignment(&self, identity: &str) -> Result<Matrix4<f64>, CalibrationError> {
        let file: AlignmentFile = read_toml(&self.alignment_path(identity))?;
        Ok(matrix_from_rows(&file.transform))
    }

    /// Overwrite the stored alignment. Readers see either the old or the
    /// new record, never a partial one.
    pub fn save_alignment(&self, identity: &str, transform: &Matrix4<f64>) -> Result<(), CalibrationError> {
        let file = AlignmentFile {
            transform: matrix_to_rows(transform),
        };
        write_toml_atomic(&self.alignment_path(identity), &file)
    }
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CalibrationError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CalibrationError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(CalibrationError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text).map_err(|source| CalibrationError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_toml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CalibrationError> {
    let text = toml::to_string(value)?;
    let io_err = |source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// Identity as it appears in file names: anything outside
/// `[A-Za-z0-9._-]` becomes `_`.
fn file_safe(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Matrix4<f64> {
        let mut m = nalgebra::Rotation3::from_euler_angles(0.1, -0.2, 0.3).to_homogeneous();
        m[(0, 3)] = 0.45;
        m[(2, 3)] = 1.2;
        m
    }

    #[test]
    fn test_missing_files_report_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        assert!(matches!(
            store.load_extrinsics("10.95.76.12"),
            Err(CalibrationError::Missing(_))
        ));
        assert!(matches!(
            store.load_alignment("10.95.76.12"),
            Err(CalibrationError::Missing(_))
        ));
    }

    #[test]
    fn test_alignment_overwritten_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("nested"));
        store.save_alignment("cam", &sample()).unwrap();
        store.save_alignment("cam", &Matrix4::identity()).unwrap();
        assert_eq!(store.load_alignment("cam").unwrap(), Matrix4::identity());
        assert!(!store.alignment_path("cam").with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_extrinsics_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        let ext = Extrinsics::from_pose(sample()).unwrap();
        store.save_extrinsics("10.95.76.11", &ext).unwrap();
        assert_eq!(store.load_extrinsics("10.95.76.11").unwrap(), ext);
        assert!(dir.path().join("extrinsics_10.95.76.11.toml").exists());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        std::fs::write(store.alignment_path("cam"), "transform = [[1.0, 2.0]]").unwrap();
        assert!(matches!(
            store.load_alignment("cam"),
            Err(CalibrationError::Parse { .. })
        ));
    }

    #[test]
    fn test_identity_sanitized_in_file_name() {
        let store = CalibrationStore::new("/calib");
        assert_eq!(
            store.alignment_path("usb/1:2"),
            PathBuf::from("/calib/alignment_usb_1_2.toml")
        );
    }
}
