//! Colored point cloud container and rigid transform helpers.

use nalgebra::{Matrix4, Point3, Vector3};
use thiserror::Error;

/// Row-major 4×4 matrix as it is written to calibration files.
pub type MatrixRows = [[f64; 4]; 4];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CloudError {
    #[error("point cloud has {points} positions but {colors} colors")]
    LengthMismatch { points: usize, colors: usize },
}

/// A colored point cloud.
///
/// Positions and colors are index-aligned; the constructor and every
/// mutator keep their lengths equal. Colors are RGB in the unit interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<Point3<f64>>,
    colors: Vec<Vector3<f64>>,
}

impl PointCloud {
    pub fn new(points: Vec<Point3<f64>>, colors: Vec<Vector3<f64>>) -> Result<Self, CloudError> {
        if points.len() != colors.len() {
            return Err(CloudError::LengthMismatch {
                points: points.len(),
                colors: colors.len(),
            });
        }
        Ok(Self { points, colors })
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: Point3<f64>, color: Vector3<f64>) {
        self.points.push(point);
        self.colors.push(color);
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn colors(&self) -> &[Vector3<f64>] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Point3<f64>>, Vec<Vector3<f64>>) {
        (self.points, self.colors)
    }

    /// Apply a homogeneous transform to every position in place.
    pub fn transform(&mut self, m: &Matrix4<f64>) {
        for p in &mut self.points {
            *p = m.transform_point(p);
        }
    }

    /// Copy of this cloud with every position mapped through `m`.
    pub fn transformed(&self, m: &Matrix4<f64>) -> Self {
        let mut out = self.clone();
        out.transform(m);
        out
    }

    /// Axis-aligned bounds `(min, max)`, or `None` for an empty cloud.
    pub fn bounding_box(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.points.first()?;
        let mut min = *first;
        let mut max = *first;
        for p in &self.points[1..] {
            min = min.inf(p);
            max = max.sup(p);
        }
        Some((min, max))
    }

    /// Mean color, or black for an empty cloud.
    pub fn mean_color(&self) -> Vector3<f64> {
        if self.colors.is_empty() {
            return Vector3::zeros();
        }
        self.colors.iter().sum::<Vector3<f64>>() / self.colors.len() as f64
    }
}

/// Mirror of the camera Z axis: `diag(1, 1, -1, 1)`.
pub fn flip_z() -> Matrix4<f64> {
    Matrix4::from_diagonal(&nalgebra::Vector4::new(1.0, 1.0, -1.0, 1.0))
}

/// Same transform with its translation column rescaled from meters to millimeters.
pub fn translation_to_millimeters(m: &Matrix4<f64>) -> Matrix4<f64> {
    let mut out = *m;
    for row in 0..3 {
        out[(row, 3)] *= 1000.0;
    }
    out
}

/// Uniform homogeneous scaling, used to move clouds between mm and m.
pub fn uniform_scale(factor: f64) -> Matrix4<f64> {
    Matrix4::new_scaling(factor)
}

pub fn matrix_to_rows(m: &Matrix4<f64>) -> MatrixRows {
    let mut rows = [[0.0; 4]; 4];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = m[(r, c)];
        }
    }
    rows
}

pub fn matrix_from_rows(rows: &MatrixRows) -> Matrix4<f64> {
    Matrix4::from_fn(|r, c| rows[r][c])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_length_mismatch() {
        let err = PointCloud::new(vec![Point3::origin()], vec![]).unwrap_err();
        assert_eq!(err, CloudError::LengthMismatch { points: 1, colors: 0 });
    }

    #[test]
    fn test_bounding_box() {
        let cloud = PointCloud::new(
            vec![Point3::new(1.0, -2.0, 3.0), Point3::new(-1.0, 4.0, 0.5)],
            vec![Vector3::zeros(), Vector3::zeros()],
        )
        .unwrap();
        let (min, max) = cloud.bounding_box().unwrap();
        assert_eq!(min, Point3::new(-1.0, -2.0, 0.5));
        assert_eq!(max, Point3::new(1.0, 4.0, 3.0));
        assert!(PointCloud::default().bounding_box().is_none());
    }

    #[test]
    fn test_translation_to_millimeters_keeps_rotation() {
        let mut m = flip_z();
        m[(0, 3)] = 0.25;
        m[(2, 3)] = -1.5;
        let mm = translation_to_millimeters(&m);
        assert_eq!(mm[(0, 3)], 250.0);
        assert_eq!(mm[(2, 3)], -1500.0);
        assert_eq!(mm[(2, 2)], -1.0);
    }

    #[test]
    fn test_rows_roundtrip() {
        let mut m = Matrix4::identity();
        m[(1, 3)] = 7.0;
        m[(0, 1)] = -0.5;
        assert_eq!(matrix_from_rows(&matrix_to_rows(&m)), m);
    }

    #[test]
    fn test_uniform_scale_keeps_homogeneous_row() {
        let s = uniform_scale(0.001);
        let p = s.transform_point(&Point3::new(1000.0, 2000.0, -500.0));
        assert!((p - Point3::new(1.0, 2.0, -0.5)).norm() < 1e-12);
    }
}
