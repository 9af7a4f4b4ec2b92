use glam::{Quat, UVec3, Vec3};
use rayon::prelude::*;

use crate::{
    spatial::SpatialHash,
    voxel::{look_rotation, DistanceField, Voxel, VoxelGrid},
};

/// Voxel grids never exceed this many voxels per axis.
pub const MAX_VOXELS_PER_AXIS: f32 = 32.;

/// Accepts points in order, rejecting any closer than the minimum distance to
/// an already accepted one. The result depends on the order points are offered.
#[derive(Clone, Debug)]
pub struct SurfaceSampler {
    min_distance: f32,
    particles: Vec<Vec3>,
    grid: SpatialHash,
}

impl SurfaceSampler {
    pub fn new(radius: f32, overlap: f32) -> Self {
        let min_distance = radius * 2. * (1. - overlap);
        Self {
            min_distance,
            particles: Vec::new(),
            grid: SpatialHash::new(min_distance.max(f32::EPSILON)),
        }
    }

    /// Accepts `point` as a new particle unless one lies strictly closer than
    /// the minimum distance.
    pub fn offer(&mut self, point: Vec3) -> bool {
        if self
            .grid
            .any_within(point, self.min_distance, &self.particles)
        {
            return false;
        }
        self.grid.insert(self.particles.len() as u32, point);
        self.particles.push(point);
        true
    }

    pub fn particles(&self) -> &[Vec3] {
        &self.particles
    }

    pub fn into_particles(self) -> Vec<Vec3> {
        self.particles
    }
}

/// Samples scaled `vertices` in order. See [`SurfaceSampler`].
pub fn sample_surface(vertices: &[Vec3], scale: Vec3, radius: f32, overlap: f32) -> Vec<Vec3> {
    let mut sampler = SurfaceSampler::new(radius, overlap);
    for v in vertices {
        sampler.offer(*v * scale);
    }
    sampler.into_particles()
}

/// Index of the particle nearest to `point`; the lowest index wins ties.
/// Returns 0 when `particles` is empty.
pub fn nearest_particle(point: Vec3, particles: &[Vec3]) -> u32 {
    let mut best = 0;
    let mut min_distance = f32::MAX;
    for (idx, p) in particles.iter().enumerate() {
        let d = point.distance_squared(*p);
        if d < min_distance {
            min_distance = d;
            best = idx as u32;
        }
    }
    best
}

/// Nearest particle of each scaled vertex, evaluated in parallel.
pub fn map_vertices_to_particles(vertices: &[Vec3], scale: Vec3, particles: &[Vec3]) -> Vec<u32> {
    vertices
        .par_iter()
        .map(|v| nearest_particle(*v * scale, particles))
        .collect()
}

/// Edge length of the voxels used to sample a volume whose scaled bounds
/// measure `bounds_size`.
pub fn volume_voxel_size(bounds_size: Vec3, radius: f32, overlap: f32) -> f32 {
    (bounds_size / MAX_VOXELS_PER_AXIS)
        .max_element()
        .max(radius * 2. * (1. - overlap))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeSample {
    pub coord: UVec3,
    pub position: Vec3,
    /// +Z looks toward the nearest boundary voxel.
    pub orientation: Quat,
    pub principal_radii: Vec3,
}

/// Emits one sample per non-outside voxel, in grid order, at the voxel center.
pub fn sample_volume(grid: &VoxelGrid, field: &DistanceField, overlap: f32) -> Vec<VolumeSample> {
    let radii = Vec3::splat(grid.voxel_size * (0.5 + overlap));
    grid.iter()
        .filter(|(_, voxel)| *voxel != Voxel::Outside)
        .map(|(coord, _)| VolumeSample {
            coord,
            position: grid.center(coord),
            orientation: look_rotation(field.direction(coord), Vec3::Y),
            principal_radii: radii,
        })
        .collect()
}
