//! RGB-D bundle conversion: world-frame colored clouds and color images.

use crate::backend::RgbdBundle;
use nalgebra::{Matrix4, Point3, Vector3};
use rowscan_core::PointCloud;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bundle buffers do not match {width}x{height}")]
    Inconsistent { width: u32, height: u32 },
    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),
}

/// Convert a bundle into a colored cloud in the frame of `transform`.
///
/// Pixels without a depth return (`z == 0`) are dropped together with
/// their color. Colors are rescaled to the unit interval.
pub fn bundle_to_cloud(bundle: &RgbdBundle, transform: &Matrix4<f64>) -> Result<PointCloud, FrameError> {
    if !bundle.is_consistent() {
        return Err(FrameError::Inconsistent {
            width: bundle.width,
            height: bundle.height,
        });
    }

    let mut cloud = PointCloud::with_capacity(bundle.points.len());
    for (p, rgb) in bundle.points.iter().zip(bundle.color.chunks_exact(3)) {
        if p[2] == 0.0 {
            continue;
        }
        let camera = Point3::new(p[0] as f64, p[1] as f64, p[2] as f64);
        let color = Vector3::new(rgb[0] as f64, rgb[1] as f64, rgb[2] as f64) / 255.0;
        cloud.push(transform.transform_point(&camera), color);
    }
    Ok(cloud)
}

/// Color frame of a bundle as an owned image.
pub fn color_image(bundle: &RgbdBundle) -> Result<image::RgbImage, FrameError> {
    image::RgbImage::from_raw(bundle.width, bundle.height, bundle.color.clone()).ok_or(
        FrameError::Inconsistent {
            width: bundle.width,
            height: bundle.height,
        },
    )
}

/// Write the color frame of a bundle as PNG.
pub fn save_color_png(bundle: &RgbdBundle, path: &Path) -> Result<(), FrameError> {
    color_image(bundle)?.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> RgbdBundle {
        RgbdBundle {
            width: 2,
            height: 2,
            color: vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 10, 20, 30],
            points: vec![
                [1.0, 2.0, 1000.0],
                [0.0, 0.0, 0.0],
                [-1.0, 0.5, 1200.0],
                [5.0, 5.0, 0.0],
            ],
            sequence: 1,
        }
    }

    #[test]
    fn test_zero_depth_pixels_dropped_with_their_color() {
        let cloud = bundle_to_cloud(&bundle(), &Matrix4::identity()).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.points()[1], Point3::new(-1.0, 0.5, 1200.0));
        assert_eq!(cloud.colors()[0], Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(cloud.colors()[1], Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_transform_applied() {
        let mut m = Matrix4::identity();
        m[(0, 3)] = 100.0;
        m[(2, 2)] = -1.0;
        let cloud = bundle_to_cloud(&bundle(), &m).unwrap();
        assert_eq!(cloud.points()[0], Point3::new(101.0, 2.0, -1000.0));
    }

    #[test]
    fn test_inconsistent_bundle_rejected() {
        let mut b = bundle();
        b.points.pop();
        assert!(matches!(
            bundle_to_cloud(&b, &Matrix4::identity()),
            Err(FrameError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_png_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        save_color_png(&bundle(), &path).unwrap();
        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(1, 1).0, [10, 20, 30]);
    }
}
