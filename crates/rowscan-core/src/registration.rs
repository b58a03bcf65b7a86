//! Colored ICP registration with a coarse-to-fine voxel pyramid.
//!
//! Each iteration linearises a joint objective over correspondences: a
//! point-to-plane geometric term against the target normal and a
//! photometric term against the target's tangent-plane intensity gradient.
//! The 6×6 normal equations are solved for a twist `(α, β, γ, tx, ty, tz)`
//! that is left-multiplied onto the running estimate.

use crate::spatial::{estimate_normals, voxel_downsample, SpatialIndex};
use crate::types::PointCloud;
use nalgebra::{Matrix3, Matrix4, Matrix6, Point3, Rotation3, Vector3, Vector6};
use thiserror::Error;

/// Weight of the geometric term; the photometric term gets `1 - λ`.
const LAMBDA_GEOMETRIC: f64 = 0.968;
/// Neighbour cap for normal and color-gradient estimation.
const NORMAL_MAX_NN: usize = 30;
/// Minimum neighbours (including the point itself) for a color gradient.
const GRADIENT_MIN_NN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("{which} cloud is empty at voxel size {voxel_size} m")]
    EmptyCloud {
        which: &'static str,
        voxel_size: f64,
    },
    #[error("no correspondences within {max_distance} m")]
    NoCorrespondences { max_distance: f64 },
    #[error("normal equations are singular")]
    Degenerate,
}

/// One level of the registration pyramid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidStage {
    /// Voxel edge length in meters; also the correspondence distance.
    pub voxel_size: f64,
    pub max_iteration: usize,
}

/// Coarse-to-fine schedule: 4 cm / 50 iterations down to 1 cm / 14.
pub const DEFAULT_PYRAMID: [PyramidStage; 3] = [
    PyramidStage {
        voxel_size: 0.04,
        max_iteration: 50,
    },
    PyramidStage {
        voxel_size: 0.02,
        max_iteration: 30,
    },
    PyramidStage {
        voxel_size: 0.01,
        max_iteration: 14,
    },
];

/// Early-stop thresholds on the change in fitness and inlier RMSE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceCriteria {
    pub relative_fitness: f64,
    pub relative_rmse: f64,
    pub max_iteration: usize,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            max_iteration: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    /// Maps source points onto the target.
    pub transformation: Matrix4<f64>,
    /// Fraction of source points with a correspondence.
    pub fitness: f64,
    /// RMSE over corresponding pairs, in cloud units.
    pub inlier_rmse: f64,
    pub iterations: usize,
}

/// Target cloud with the per-point attributes colored ICP needs.
struct ColoredTarget<'a> {
    points: &'a [Point3<f64>],
    normals: Vec<Vector3<f64>>,
    intensity: Vec<f64>,
    gradient: Vec<Vector3<f64>>,
    index: SpatialIndex<'a>,
}

impl<'a> ColoredTarget<'a> {
    fn prepare(cloud: &'a PointCloud, normal_radius: f64, max_distance: f64) -> Self {
        let points = cloud.points();
        let normals = estimate_normals(points, normal_radius, NORMAL_MAX_NN);
        let intensity: Vec<f64> = cloud.colors().iter().map(intensity_of).collect();

        let neighbourhood = SpatialIndex::build(points, normal_radius);
        let gradient = points
            .iter()
            .enumerate()
            .map(|(k, vt)| {
                let nn = neighbourhood.radius_search(vt, normal_radius, NORMAL_MAX_NN);
                if nn.len() < GRADIENT_MIN_NN {
                    return Vector3::zeros();
                }
                color_gradient(k, vt, &normals[k], &nn, points, &intensity)
            })
            .collect();

        Self {
            points,
            normals,
            intensity,
            gradient,
            index: SpatialIndex::build(points, max_distance),
        }
    }
}

/// Least-squares intensity gradient in the tangent plane of `vt`.
///
/// Neighbours are projected onto the plane; an extra row weighted by the
/// neighbour count pins the gradient orthogonal to the normal.
fn color_gradient(
    k: usize,
    vt: &Point3<f64>,
    nt: &Vector3<f64>,
    nn: &[(usize, f64)],
    points: &[Point3<f64>],
    intensity: &[f64],
) -> Vector3<f64> {
    let mut ata = Matrix3::zeros();
    let mut atb = Vector3::zeros();
    let mut rows = 0usize;
    for &(j, _) in nn {
        if j == k {
            continue;
        }
        let adj = points[j];
        let projected = adj - nt * (adj - vt).dot(nt);
        let a = projected - vt;
        let b = intensity[j] - intensity[k];
        ata += a * a.transpose();
        atb += a * b;
        rows += 1;
    }
    let pin = nt * rows as f64;
    ata += pin * pin.transpose();

    ata.lu().solve(&atb).unwrap_or_else(Vector3::zeros)
}

fn intensity_of(c: &Vector3<f64>) -> f64 {
    (c.x + c.y + c.z) / 3.0
}

/// Colored ICP at a single resolution.
#[derive(Debug, Clone, Copy)]
pub struct ColoredIcp {
    pub max_correspondence_distance: f64,
    pub normal_radius: f64,
    pub criteria: ConvergenceCriteria,
}

impl ColoredIcp {
    /// Register `source` onto `target` starting from `init`.
    pub fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        init: &Matrix4<f64>,
    ) -> Result<RegistrationResult, RegistrationError> {
        let target = ColoredTarget::prepare(target, self.normal_radius, self.max_correspondence_distance);
        self.register_prepared(source, &target, init)
    }

    fn register_prepared(
        &self,
        source: &PointCloud,
        target: &ColoredTarget<'_>,
        init: &Matrix4<f64>,
    ) -> Result<RegistrationResult, RegistrationError> {
        let source_intensity: Vec<f64> = source.colors().iter().map(intensity_of).collect();
        let mut moved = source.transformed(init);
        let mut transformation = *init;

        let mut current = evaluate(&moved, target, self.max_correspondence_distance);
        if current.pairs.is_empty() {
            return Err(RegistrationError::NoCorrespondences {
                max_distance: self.max_correspondence_distance,
            });
        }

        let mut iterations = 0;
        for _ in 0..self.criteria.max_iteration {
            let previous = current;
            let update = solve_step(&moved, &source_intensity, target, &previous.pairs)?;
            transformation = update * transformation;
            moved.transform(&update);
            iterations += 1;

            current = evaluate(&moved, target, self.max_correspondence_distance);
            if current.pairs.is_empty() {
                return Err(RegistrationError::NoCorrespondences {
                    max_distance: self.max_correspondence_distance,
                });
            }
            if (previous.fitness - current.fitness).abs() < self.criteria.relative_fitness
                && (previous.rmse - current.rmse).abs() < self.criteria.relative_rmse
            {
                break;
            }
        }

        tracing::trace!(
            iterations,
            fitness = current.fitness,
            rmse = current.rmse,
            "colored ICP finished"
        );

        Ok(RegistrationResult {
            transformation,
            fitness: current.fitness,
            inlier_rmse: current.rmse,
            iterations,
        })
    }
}

struct Evaluation {
    pairs: Vec<(usize, usize)>,
    fitness: f64,
    rmse: f64,
}

fn evaluate(moved: &PointCloud, target: &ColoredTarget<'_>, max_distance: f64) -> Evaluation {
    let mut pairs = Vec::with_capacity(moved.len());
    let mut err = 0.0;
    for (s, p) in moved.points().iter().enumerate() {
        if let Some((t, d2)) = target.index.nearest(p, max_distance) {
            pairs.push((s, t));
            err += d2;
        }
    }
    let (fitness, rmse) = if pairs.is_empty() {
        (0.0, 0.0)
    } else {
        (
            pairs.len() as f64 / moved.len() as f64,
            (err / pairs.len() as f64).sqrt(),
        )
    };
    Evaluation {
        pairs,
        fitness,
        rmse,
    }
}

/// One Gauss-Newton step over the current correspondences.
fn solve_step(
    moved: &PointCloud,
    source_intensity: &[f64],
    target: &ColoredTarget<'_>,
    pairs: &[(usize, usize)],
) -> Result<Matrix4<f64>, RegistrationError> {
    let sqrt_geo = LAMBDA_GEOMETRIC.sqrt();
    let sqrt_photo = (1.0 - LAMBDA_GEOMETRIC).sqrt();

    let mut jtj = Matrix6::zeros();
    let mut jtr = Vector6::zeros();

    for &(s, t) in pairs {
        let vs = moved.points()[s].coords;
        let vt = target.points[t].coords;
        let nt = target.normals[t];
        let it = target.intensity[t];
        let dit = target.gradient[t];
        let is = source_intensity[s];

        let geo_j = twist_row(&vs, &nt) * sqrt_geo;
        let geo_r = sqrt_geo * (vs - vt).dot(&nt);

        let vs_proj = vs - nt * (vs - vt).dot(&nt);
        let is0_proj = dit.dot(&(vs_proj - vt)) + it;
        let m = Matrix3::identity() - nt * nt.transpose();
        let dit_m = -(m * dit);
        let photo_j = twist_row(&vs, &dit_m) * sqrt_photo;
        let photo_r = sqrt_photo * (is - is0_proj);

        jtj += geo_j * geo_j.transpose() + photo_j * photo_j.transpose();
        jtr += geo_j * geo_r + photo_j * photo_r;
    }

    let x = jtj
        .cholesky()
        .map(|c| c.solve(&(-jtr)))
        .or_else(|| jtj.lu().solve(&(-jtr)))
        .ok_or(RegistrationError::Degenerate)?;
    Ok(twist_to_matrix(&x))
}

fn twist_row(v: &Vector3<f64>, dir: &Vector3<f64>) -> Vector6<f64> {
    let rot = v.cross(dir);
    Vector6::new(rot.x, rot.y, rot.z, dir.x, dir.y, dir.z)
}

/// `(α, β, γ, tx, ty, tz)` → `T(t) · Rz(γ) · Ry(β) · Rx(α)`.
fn twist_to_matrix(x: &Vector6<f64>) -> Matrix4<f64> {
    let mut m = Rotation3::from_euler_angles(x[0], x[1], x[2]).to_homogeneous();
    m[(0, 3)] = x[3];
    m[(1, 3)] = x[4];
    m[(2, 3)] = x[5];
    m
}

/// Run colored ICP once per pyramid stage, each seeded by the previous one.
///
/// At every stage both clouds are voxel-downsampled to the stage size, the
/// target gets normals from a `2 × voxel` neighbourhood, and the stage's
/// voxel size is the correspondence distance.
pub fn multi_scale_colored_icp(
    source: &PointCloud,
    target: &PointCloud,
    init: &Matrix4<f64>,
    stages: &[PyramidStage],
) -> Result<RegistrationResult, RegistrationError> {
    let mut result = RegistrationResult {
        transformation: *init,
        fitness: 0.0,
        inlier_rmse: 0.0,
        iterations: 0,
    };

    for stage in stages {
        let source_down = voxel_downsample(source, stage.voxel_size);
        let target_down = voxel_downsample(target, stage.voxel_size);
        if source_down.is_empty() {
            return Err(RegistrationError::EmptyCloud {
                which: "source",
                voxel_size: stage.voxel_size,
            });
        }
        if target_down.is_empty() {
            return Err(RegistrationError::EmptyCloud {
                which: "target",
                voxel_size: stage.voxel_size,
            });
        }

        let icp = ColoredIcp {
            max_correspondence_distance: stage.voxel_size,
            normal_radius: stage.voxel_size * 2.0,
            criteria: ConvergenceCriteria {
                max_iteration: stage.max_iteration,
                ..ConvergenceCriteria::default()
            },
        };
        result = icp.register(&source_down, &target_down, &result.transformation)?;
        tracing::debug!(
            voxel_size = stage.voxel_size,
            source_points = source_down.len(),
            target_points = target_down.len(),
            iterations = result.iterations,
            fitness = result.fitness,
            rmse = result.inlier_rmse,
            "pyramid stage done"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Undulating 0.8 m × 0.8 m field at 1 cm spacing with a color pattern.
    fn field() -> PointCloud {
        let mut cloud = PointCloud::default();
        for i in 0..80 {
            for j in 0..80 {
                let x = i as f64 * 0.01;
                let y = j as f64 * 0.01;
                let z = 0.06 * (std::f64::consts::TAU * x / 0.4).sin()
                    * (std::f64::consts::TAU * y / 0.5).cos();
                let shade = 0.5
                    + 0.3 * (std::f64::consts::TAU * x / 0.3).sin()
                    + 0.2 * (std::f64::consts::TAU * y / 0.2).cos();
                cloud.push(
                    Point3::new(x, y, z),
                    Vector3::new(shade, 0.8 * shade, 1.0 - shade),
                );
            }
        }
        cloud
    }

    fn offset() -> Matrix4<f64> {
        let mut m = Rotation3::from_euler_angles(0.0, 0.0, 1.5_f64.to_radians()).to_homogeneous();
        m[(0, 3)] = 0.012;
        m[(1, 3)] = -0.008;
        m[(2, 3)] = 0.004;
        m
    }

    fn rotation_error_deg(a: &Matrix4<f64>, b: &Matrix4<f64>) -> f64 {
        let ra = Rotation3::from_matrix(&a.fixed_view::<3, 3>(0, 0).into_owned());
        let rb = Rotation3::from_matrix(&b.fixed_view::<3, 3>(0, 0).into_owned());
        ra.angle_to(&rb).to_degrees()
    }

    fn translation_error(a: &Matrix4<f64>, b: &Matrix4<f64>) -> f64 {
        (a.fixed_view::<3, 1>(0, 3) - b.fixed_view::<3, 1>(0, 3)).norm()
    }

    #[test]
    fn test_twist_to_matrix_identity() {
        assert_eq!(twist_to_matrix(&Vector6::zeros()), Matrix4::identity());
    }

    #[test]
    fn test_identical_clouds_stay_at_identity() {
        let cloud = field();
        let result =
            multi_scale_colored_icp(&cloud, &cloud, &Matrix4::identity(), &DEFAULT_PYRAMID).unwrap();
        assert!(translation_error(&result.transformation, &Matrix4::identity()) < 1e-4);
        assert!(rotation_error_deg(&result.transformation, &Matrix4::identity()) < 0.01);
        assert!(result.fitness > 0.99);
    }

    #[test]
    fn test_recovers_known_offset() {
        let target = field();
        let truth = offset();
        let inverse = truth.try_inverse().unwrap();
        let source = target.transformed(&inverse);

        let result =
            multi_scale_colored_icp(&source, &target, &Matrix4::identity(), &DEFAULT_PYRAMID).unwrap();
        assert!(
            translation_error(&result.transformation, &truth) < 0.003,
            "translation off by {}",
            translation_error(&result.transformation, &truth)
        );
        assert!(rotation_error_deg(&result.transformation, &truth) < 0.3);
    }

    #[test]
    fn test_no_overlap_is_an_error() {
        let target = field();
        let mut far = Matrix4::identity();
        far[(0, 3)] = 10.0;
        let source = target.transformed(&far);
        let err = multi_scale_colored_icp(&source, &target, &Matrix4::identity(), &DEFAULT_PYRAMID)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::NoCorrespondences { .. }));
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let err = multi_scale_colored_icp(
            &PointCloud::default(),
            &field(),
            &Matrix4::identity(),
            &DEFAULT_PYRAMID,
        )
        .unwrap_err();
        assert!(matches!(err, RegistrationError::EmptyCloud { which: "source", .. }));
    }
}
