use std::collections::VecDeque;

use glam::{IVec3, Mat3, Quat, UVec3, Vec3};

use crate::mesh::InputMesh;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Voxel {
    #[default]
    Outside,
    Inside,
    Boundary,
}

/// Dense voxel classification of a mesh volume.
///
/// `origin` is expressed in voxel units: voxel `c` covers
/// `[(origin + c) * voxel_size, (origin + c + 1) * voxel_size)`.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelGrid {
    pub origin: IVec3,
    pub resolution: UVec3,
    pub voxel_size: f32,
    voxels: Vec<Voxel>,
}

impl VoxelGrid {
    pub fn new(origin: IVec3, resolution: UVec3, voxel_size: f32) -> Self {
        let len = (resolution.x * resolution.y * resolution.z) as usize;
        Self {
            origin,
            resolution,
            voxel_size,
            voxels: vec![Voxel::Outside; len],
        }
    }

    fn index(&self, coord: UVec3) -> Option<usize> {
        let r = self.resolution;
        (coord.x < r.x && coord.y < r.y && coord.z < r.z)
            .then(|| ((coord.x * r.y + coord.y) * r.z + coord.z) as usize)
    }

    pub fn get(&self, coord: UVec3) -> Voxel {
        self.index(coord)
            .map(|idx| self.voxels[idx])
            .unwrap_or(Voxel::Outside)
    }

    pub fn set(&mut self, coord: UVec3, voxel: Voxel) {
        if let Some(idx) = self.index(coord) {
            self.voxels[idx] = voxel;
        }
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Voxels in x-major, then y, then z order.
    pub fn iter(&self) -> impl Iterator<Item = (UVec3, Voxel)> + '_ {
        let r = self.resolution;
        (0..r.x).flat_map(move |x| {
            (0..r.y).flat_map(move |y| {
                (0..r.z).map(move |z| {
                    let coord = UVec3::new(x, y, z);
                    (coord, self.get(coord))
                })
            })
        })
    }

    pub fn center(&self, coord: UVec3) -> Vec3 {
        (self.origin.as_vec3() + coord.as_vec3() + 0.5) * self.voxel_size
    }
}

/// For each voxel, the coordinate of the nearest boundary voxel.
#[derive(Clone, Debug, PartialEq)]
pub struct DistanceField {
    resolution: UVec3,
    nearest: Vec<IVec3>,
}

impl DistanceField {
    pub fn new(resolution: UVec3, nearest: Vec<IVec3>) -> Self {
        debug_assert_eq!(
            nearest.len(),
            (resolution.x * resolution.y * resolution.z) as usize
        );
        Self {
            resolution,
            nearest,
        }
    }

    /// Multi-source breadth-first propagation from every boundary voxel over
    /// the 26-neighborhood. Voxels unreachable from any boundary point at themselves.
    pub fn flood(grid: &VoxelGrid) -> Self {
        let r = grid.resolution;
        let mut nearest: Vec<IVec3> = grid.iter().map(|(c, _)| c.as_ivec3()).collect();
        let mut visited = vec![false; nearest.len()];
        let mut queue = VecDeque::new();

        for (coord, voxel) in grid.iter() {
            if voxel == Voxel::Boundary {
                if let Some(idx) = grid.index(coord) {
                    visited[idx] = true;
                    queue.push_back(coord.as_ivec3());
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            let Some(source) = grid.index(current.as_uvec3()).map(|idx| nearest[idx]) else {
                continue;
            };
            for dx in -1..=1 {
                for dy in -1..=1 {
                    for dz in -1..=1 {
                        let n = current + IVec3::new(dx, dy, dz);
                        if n.cmplt(IVec3::ZERO).any() || n.as_uvec3().cmpge(r).any() {
                            continue;
                        }
                        if let Some(idx) = grid.index(n.as_uvec3()) {
                            if !visited[idx] {
                                visited[idx] = true;
                                nearest[idx] = source;
                                queue.push_back(n);
                            }
                        }
                    }
                }
            }
        }

        Self {
            resolution: r,
            nearest,
        }
    }

    pub fn nearest_surface(&self, coord: UVec3) -> IVec3 {
        let r = self.resolution;
        let idx = ((coord.x * r.y + coord.y) * r.z + coord.z) as usize;
        self.nearest
            .get(idx)
            .copied()
            .unwrap_or_else(|| coord.as_ivec3())
    }

    /// Offset from `coord` to its nearest boundary voxel, in voxel units.
    pub fn direction(&self, coord: UVec3) -> Vec3 {
        (self.nearest_surface(coord) - coord.as_ivec3()).as_vec3()
    }
}

pub trait Voxelizer {
    /// Classifies the mesh scaled by `scale` into voxels of `voxel_size`.
    fn voxelize(&self, mesh: &InputMesh, voxel_size: f32, scale: Vec3) -> VoxelGrid;

    fn nearest_surface(&self, grid: &VoxelGrid) -> DistanceField {
        DistanceField::flood(grid)
    }
}

/// Rotation whose +Z axis points along `forward` and whose +Y axis is as close
/// to `up` as possible. Zero `forward` gives the identity.
pub fn look_rotation(forward: Vec3, up: Vec3) -> Quat {
    let Some(f) = forward.try_normalize() else {
        return Quat::IDENTITY;
    };
    let right = up
        .cross(f)
        .try_normalize()
        .unwrap_or_else(|| f.any_orthonormal_vector());
    let up = f.cross(right);
    Quat::from_mat3(&Mat3::from_cols(right, up, f)).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_cube(n: u32) -> VoxelGrid {
        let mut grid = VoxelGrid::new(IVec3::ZERO, UVec3::splat(n), 1.);
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    let c = UVec3::new(x, y, z);
                    let on_face = [x, y, z].iter().any(|v| *v == 0 || *v == n - 1);
                    grid.set(c, if on_face { Voxel::Boundary } else { Voxel::Inside });
                }
            }
        }
        grid
    }

    #[test]
    fn iterates_in_x_major_order() {
        let grid = VoxelGrid::new(IVec3::new(-1, 0, 2), UVec3::new(2, 1, 2), 0.5);
        let coords: Vec<UVec3> = grid.iter().map(|(c, _)| c).collect();
        assert_eq!(
            coords,
            vec![
                UVec3::new(0, 0, 0),
                UVec3::new(0, 0, 1),
                UVec3::new(1, 0, 0),
                UVec3::new(1, 0, 1),
            ]
        );
        assert_eq!(grid.center(UVec3::ZERO), Vec3::new(-0.25, 0.25, 1.25));
    }

    #[test]
    fn flood_points_inside_voxels_at_the_boundary() {
        let grid = solid_cube(5);
        let field = DistanceField::flood(&grid);
        assert_eq!(field.direction(UVec3::ZERO), Vec3::ZERO);
        let center = UVec3::splat(2);
        let dir = field.direction(center);
        assert_eq!(dir.abs().max_element(), 2.);
        let target = field.nearest_surface(center).as_uvec3();
        assert_eq!(grid.get(target), Voxel::Boundary);
        let near_face = field.direction(UVec3::new(1, 2, 2));
        assert_eq!(near_face.x, -1.);
        assert_eq!(near_face.abs().max_element(), 1.);
    }

    #[test]
    fn look_rotation_aligns_forward() {
        let dir = Vec3::new(1., 2., -0.5).normalize();
        let q = look_rotation(dir, Vec3::Y);
        assert!((q * Vec3::Z).abs_diff_eq(dir, 1e-5));
        assert!((q * Vec3::X).dot(Vec3::Y).abs() < 1e-5);

        let straight_up = look_rotation(Vec3::Y * 3., Vec3::Y);
        assert!((straight_up * Vec3::Z).abs_diff_eq(Vec3::Y, 1e-5));
        assert_eq!(look_rotation(Vec3::ZERO, Vec3::Y), Quat::IDENTITY);
    }
}
