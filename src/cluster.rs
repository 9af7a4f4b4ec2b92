use glam::Vec3;

use crate::spatial::SpatialHash;

/// Shape-matching clusters stored as one flat index buffer plus offsets.
///
/// The first index of every cluster is its center particle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSet {
    particle_indices: Vec<u32>,
    offsets: Vec<u32>,
}

impl Default for ClusterSet {
    fn default() -> Self {
        Self {
            particle_indices: Vec::new(),
            offsets: vec![0],
        }
    }
}

impl ClusterSet {
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cluster(&self, idx: usize) -> &[u32] {
        let (start, end) = (self.offsets[idx] as usize, self.offsets[idx + 1] as usize);
        &self.particle_indices[start..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u32]> + '_ {
        self.offsets
            .windows(2)
            .map(|w| &self.particle_indices[w[0] as usize..w[1] as usize])
    }

    pub fn particle_indices(&self) -> &[u32] {
        &self.particle_indices
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn push(&mut self, cluster: &[u32]) {
        debug_assert!(!cluster.is_empty());
        self.particle_indices.extend_from_slice(cluster);
        self.offsets.push(self.particle_indices.len() as u32);
    }
}

/// Builds one cluster per particle, one particle at a time.
#[derive(Clone, Debug)]
pub struct ClusterBuilder {
    radius: f32,
    grid: Option<SpatialHash>,
    clusters: ClusterSet,
    scratch: Vec<u32>,
}

impl ClusterBuilder {
    pub fn new(positions: &[Vec3], radius: f32) -> Self {
        let grid = (radius > 0.).then(|| SpatialHash::from_points(radius, positions));
        Self {
            radius,
            grid,
            clusters: ClusterSet::default(),
            scratch: Vec::new(),
        }
    }

    pub fn next_center(&self) -> usize {
        self.clusters.len()
    }

    /// Builds the cluster centered on the next particle. Returns false once
    /// every particle has its cluster.
    pub fn push_next(&mut self, positions: &[Vec3]) -> bool {
        let center = self.next_center();
        let Some(p) = positions.get(center).copied() else {
            return false;
        };

        self.scratch.clear();
        self.scratch.push(center as u32);
        if let Some(grid) = &self.grid {
            let start = self.scratch.len();
            grid.query_sorted(p, self.radius, positions, &mut self.scratch);
            // drop the center itself, keep ascending order
            if let Ok(pos) = self.scratch[start..].binary_search(&(center as u32)) {
                self.scratch.remove(start + pos);
            }
        }
        self.clusters.push(&self.scratch);
        true
    }

    pub fn finish(self) -> ClusterSet {
        self.clusters
    }
}

/// Clusters every particle with all others strictly within `radius`.
pub fn build_clusters(positions: &[Vec3], radius: f32) -> ClusterSet {
    let mut builder = ClusterBuilder::new(positions, radius);
    while builder.push_next(positions) {}
    builder.finish()
}
