//! Spatial hashing, voxel downsampling and normal estimation.
//!
//! Registration only ever asks fixed-radius questions (correspondence
//! distance, normal neighbourhood), so a uniform hash grid sized to the
//! query radius answers them by scanning the 27 surrounding cells.

use crate::types::PointCloud;
use nalgebra::{Matrix3, Point3, Vector3};
use std::collections::HashMap;

type CellKey = (i64, i64, i64);

/// Uniform hash grid over a borrowed point slice.
pub struct SpatialIndex<'a> {
    points: &'a [Point3<f64>],
    cell_size: f64,
    cells: HashMap<CellKey, Vec<usize>>,
}

impl<'a> SpatialIndex<'a> {
    /// Build an index with the given cell edge length (must be positive).
    pub fn build(points: &'a [Point3<f64>], cell_size: f64) -> Self {
        let mut cells: HashMap<CellKey, Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(cell_key(p, cell_size)).or_default().push(i);
        }
        Self {
            points,
            cell_size,
            cells,
        }
    }

    /// Closest point within `max_distance`, as `(index, squared distance)`.
    pub fn nearest(&self, query: &Point3<f64>, max_distance: f64) -> Option<(usize, f64)> {
        let max_sq = max_distance * max_distance;
        let mut best: Option<(usize, f64)> = None;
        self.visit(query, max_distance, |i, d2| {
            if d2 <= max_sq && best.map_or(true, |(_, b)| d2 < b) {
                best = Some((i, d2));
            }
        });
        best
    }

    /// Up to `max_nn` points within `radius`, nearest first, as
    /// `(index, squared distance)`. The query point itself is included when
    /// it belongs to the indexed set.
    pub fn radius_search(
        &self,
        query: &Point3<f64>,
        radius: f64,
        max_nn: usize,
    ) -> Vec<(usize, f64)> {
        let r_sq = radius * radius;
        let mut found = Vec::new();
        self.visit(query, radius, |i, d2| {
            if d2 <= r_sq {
                found.push((i, d2));
            }
        });
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        found.truncate(max_nn);
        found
    }

    fn visit(&self, query: &Point3<f64>, radius: f64, mut f: impl FnMut(usize, f64)) {
        let reach = (radius / self.cell_size).ceil().max(1.0) as i64;
        let (cx, cy, cz) = cell_key(query, self.cell_size);
        for dx in -reach..=reach {
            for dy in -reach..=reach {
                for dz in -reach..=reach {
                    let Some(bucket) = self.cells.get(&(cx + dx, cy + dy, cz + dz)) else {
                        continue;
                    };
                    for &i in bucket {
                        f(i, (self.points[i] - query).norm_squared());
                    }
                }
            }
        }
    }
}

fn cell_key(p: &Point3<f64>, cell_size: f64) -> CellKey {
    (
        (p.x / cell_size).floor() as i64,
        (p.y / cell_size).floor() as i64,
        (p.z / cell_size).floor() as i64,
    )
}

/// Average positions and colors of all points sharing a voxel.
///
/// Output is ordered by voxel coordinate so repeated runs are identical.
pub fn voxel_downsample(cloud: &PointCloud, voxel_size: f64) -> PointCloud {
    if cloud.is_empty() || voxel_size <= 0.0 {
        return cloud.clone();
    }

    let mut voxels: HashMap<CellKey, (Vector3<f64>, Vector3<f64>, usize)> = HashMap::new();
    for (p, c) in cloud.points().iter().zip(cloud.colors()) {
        let slot = voxels
            .entry(cell_key(p, voxel_size))
            .or_insert((Vector3::zeros(), Vector3::zeros(), 0));
        slot.0 += p.coords;
        slot.1 += c;
        slot.2 += 1;
    }

    let mut keys: Vec<CellKey> = voxels.keys().copied().collect();
    keys.sort_unstable();

    let mut out = PointCloud::with_capacity(keys.len());
    for key in keys {
        let (sum_p, sum_c, n) = voxels[&key];
        let n = n as f64;
        out.push(Point3::from(sum_p / n), sum_c / n);
    }
    out
}

/// Estimate a unit normal per point from its local neighbourhood.
///
/// Uses the eigenvector of the smallest eigenvalue of the neighbourhood
/// covariance. Points with fewer than three neighbours get `+z`. Normals
/// are oriented into the `+z` hemisphere.
pub fn estimate_normals(points: &[Point3<f64>], radius: f64, max_nn: usize) -> Vec<Vector3<f64>> {
    let index = SpatialIndex::build(points, radius);
    points
        .iter()
        .map(|p| {
            let neighbours = index.radius_search(p, radius, max_nn);
            if neighbours.len() < 3 {
                return Vector3::z();
            }
            let n = neighbours.len() as f64;
            let mean = neighbours
                .iter()
                .map(|&(i, _)| points[i].coords)
                .sum::<Vector3<f64>>()
                / n;
            let mut cov = Matrix3::zeros();
            for &(i, _) in &neighbours {
                let d = points[i].coords - mean;
                cov += d * d.transpose();
            }
            cov /= n;

            let eigen = cov.symmetric_eigen();
            let (min_idx, _) = eigen
                .eigenvalues
                .iter()
                .enumerate()
                .fold((0, f64::INFINITY), |acc, (i, &v)| if v < acc.1 { (i, v) } else { acc });
            let normal = eigen.eigenvectors.column(min_idx).into_owned();
            let normal = normal.try_normalize(1e-12).unwrap_or_else(Vector3::z);
            if normal.z < 0.0 {
                -normal
            } else {
                normal
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, spacing: f64) -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for i in 0..n {
            for j in 0..n {
                pts.push(Point3::new(i as f64 * spacing, j as f64 * spacing, 0.0));
            }
        }
        pts
    }

    #[test]
    fn test_nearest_respects_max_distance() {
        let pts = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let index = SpatialIndex::build(&pts, 0.1);
        let (i, d2) = index.nearest(&Point3::new(0.95, 0.0, 0.0), 0.1).unwrap();
        assert_eq!(i, 1);
        assert!((d2 - 0.0025).abs() < 1e-12);
        assert!(index.nearest(&Point3::new(0.5, 0.0, 0.0), 0.1).is_none());
    }

    #[test]
    fn test_radius_search_sorted_and_capped() {
        let pts = grid(10, 0.01);
        let index = SpatialIndex::build(&pts, 0.02);
        let found = index.radius_search(&pts[55], 0.02, 5);
        assert_eq!(found.len(), 5);
        assert_eq!(found[0].0, 55);
        assert!(found.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_radius_larger_than_cell() {
        let pts = grid(10, 0.01);
        let index = SpatialIndex::build(&pts, 0.01);
        let found = index.radius_search(&pts[0], 0.035, usize::MAX);
        let expected = pts
            .iter()
            .filter(|p| (*p - pts[0]).norm() <= 0.035)
            .count();
        assert_eq!(found.len(), expected);
    }

    #[test]
    fn test_voxel_downsample_averages() {
        let cloud = PointCloud::new(
            vec![
                Point3::new(0.01, 0.01, 0.01),
                Point3::new(0.03, 0.03, 0.03),
                Point3::new(0.55, 0.0, 0.0),
            ],
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 1.0, 1.0),
                Vector3::new(0.5, 0.5, 0.5),
            ],
        )
        .unwrap();
        let down = voxel_downsample(&cloud, 0.1);
        assert_eq!(down.len(), 2);
        assert!((down.points()[0] - Point3::new(0.02, 0.02, 0.02)).norm() < 1e-12);
        assert!((down.colors()[0] - Vector3::new(0.5, 0.5, 0.5)).norm() < 1e-12);
    }

    #[test]
    fn test_normals_of_plane() {
        let pts: Vec<Point3<f64>> = grid(8, 0.01)
            .into_iter()
            .map(|p| Point3::new(p.x, p.y, 0.2 * p.x))
            .collect();
        let normals = estimate_normals(&pts, 0.02, 30);
        let expected = Vector3::new(-0.2, 0.0, 1.0).normalize();
        for n in &normals {
            assert!((n - expected).norm() < 1e-6, "normal {n:?}");
        }
    }
}
