use std::collections::HashMap;

use glam::{IVec3, Vec3};

/// Uniform grid bucketing point indices by cell, for fixed-radius queries.
///
/// Queries return exactly the points a brute-force scan would, so callers can
/// swap one for the other without changing results.
#[derive(Clone, Debug)]
pub struct SpatialHash {
    cell_size: f32,
    cells: HashMap<IVec3, Vec<u32>>,
}

impl SpatialHash {
    pub fn new(cell_size: f32) -> Self {
        debug_assert!(cell_size > 0. && cell_size.is_finite());
        Self {
            cell_size,
            cells: HashMap::new(),
        }
    }

    fn cell_of(&self, p: Vec3) -> IVec3 {
        (p / self.cell_size).floor().as_ivec3()
    }

    pub fn insert(&mut self, index: u32, p: Vec3) {
        let cell = self.cell_of(p);
        self.cells.entry(cell).or_default().push(index);
    }

    pub fn from_points(cell_size: f32, points: &[Vec3]) -> Self {
        let mut hash = Self::new(cell_size);
        for (idx, p) in points.iter().enumerate() {
            hash.insert(idx as u32, *p);
        }
        hash
    }

    fn candidates(&self, p: Vec3, radius: f32) -> impl Iterator<Item = u32> + '_ {
        // One extra ring absorbs rounding at cell boundaries. Far points clamp
        // to the outermost cells, so the ring must not wrap around.
        let lo = self.cell_of(p - Vec3::splat(radius)).to_array().map(|c| c.saturating_sub(1));
        let hi = self.cell_of(p + Vec3::splat(radius)).to_array().map(|c| c.saturating_add(1));
        let (lo, hi) = (IVec3::from_array(lo), IVec3::from_array(hi));
        (lo.x..=hi.x).flat_map(move |x| {
            (lo.y..=hi.y).flat_map(move |y| {
                (lo.z..=hi.z).flat_map(move |z| {
                    self.cells
                        .get(&IVec3::new(x, y, z))
                        .into_iter()
                        .flat_map(|bucket| bucket.iter().copied())
                })
            })
        })
    }

    /// True if any indexed point lies strictly closer than `radius` to `p`.
    pub fn any_within(&self, p: Vec3, radius: f32, points: &[Vec3]) -> bool {
        self.candidates(p, radius)
            .any(|j| points[j as usize].distance(p) < radius)
    }

    /// Appends to `out`, in ascending order, every index strictly closer than `radius` to `p`.
    pub fn query_sorted(&self, p: Vec3, radius: f32, points: &[Vec3], out: &mut Vec<u32>) {
        let start = out.len();
        out.extend(
            self.candidates(p, radius)
                .filter(|j| points[*j as usize].distance(p) < radius),
        );
        out[start..].sort_unstable();
    }
}
