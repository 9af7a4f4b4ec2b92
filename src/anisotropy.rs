use glam::{Mat3, Quat, Vec3};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use crate::mesh::InputMesh;

/// Best-fit ellipsoid of a point neighborhood.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipsoid {
    pub centroid: Vec3,
    pub orientation: Quat,
    /// Radii along the orientation's local X, Y and Z axes, longest first.
    pub radii: Vec3,
}

impl Ellipsoid {
    pub fn sphere(centroid: Vec3, radius: f32) -> Self {
        Self {
            centroid,
            orientation: Quat::IDENTITY,
            radii: Vec3::splat(radius),
        }
    }
}

/// Mesh vertices around a particle, with their averaged normal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Neighborhood {
    pub points: Vec<Vec3>,
    /// Zero when `points` is empty.
    pub average_normal: Vec3,
}

/// Collects every scaled vertex of `mesh` strictly closer than `radius` to `center`.
pub fn gather_neighborhood(
    center: Vec3,
    mesh: &InputMesh,
    scale: Vec3,
    radius: f32,
) -> Neighborhood {
    let mut points = Vec::new();
    let mut normal_sum = Vec3::ZERO;
    for (idx, v) in mesh.vertices.iter().enumerate() {
        let scaled = *v * scale;
        if scaled.distance(center) < radius {
            points.push(scaled);
            normal_sum += mesh.normal(idx);
        }
    }
    let average_normal = if points.is_empty() {
        Vec3::ZERO
    } else {
        normal_sum / points.len() as f32
    };
    Neighborhood {
        points,
        average_normal,
    }
}

/// Fits an ellipsoid to `points`.
///
/// The largest radius equals `particle_radius` and no radius is smaller than
/// `particle_radius / max_anisotropy`. When `average_normal` is non-zero, the
/// shortest axis (local Z) is flipped to face it. An empty or degenerate
/// neighborhood yields a sphere of `particle_radius` around `fallback`
/// (or the neighborhood's mean).
pub fn fit_ellipsoid(
    points: &[Vec3],
    average_normal: Vec3,
    particle_radius: f32,
    max_anisotropy: f32,
    fallback: Vec3,
) -> Ellipsoid {
    if points.is_empty() {
        return Ellipsoid::sphere(fallback, particle_radius);
    }

    let n = points.len() as f32;
    let centroid = points.iter().copied().sum::<Vec3>() / n;

    let mut covariance = Matrix3::<f32>::zeros();
    for p in points {
        let d = Vector3::from(*p - centroid);
        covariance += d * d.transpose();
    }
    covariance /= n;

    let eigen = SymmetricEigen::new(covariance);
    let values = eigen.eigenvalues;
    let mut order = [0, 1, 2];
    order.sort_by(|a, b| values[*b].total_cmp(&values[*a]));

    let largest = values[order[0]].max(0.).sqrt();
    if !largest.is_finite() || largest <= f32::EPSILON * particle_radius.max(1.) {
        return Ellipsoid::sphere(centroid, particle_radius);
    }

    let min_radius = particle_radius / max_anisotropy.max(1.);
    let radii = Vec3::from_array(
        order.map(|k| (values[k].max(0.).sqrt() / largest * particle_radius).max(min_radius)),
    );

    let axis = |k: usize| Vec3::from(eigen.eigenvectors.column(k).into_owned()).normalize_or_zero();
    let x = axis(order[0]);
    let mut y = axis(order[1]);
    let mut z = x.cross(y);
    if average_normal != Vec3::ZERO && z.dot(average_normal) < 0. {
        z = -z;
        y = -y;
    }

    Ellipsoid {
        centroid,
        orientation: Quat::from_mat3(&Mat3::from_cols(x, y, z)).normalize(),
        radii,
    }
}
