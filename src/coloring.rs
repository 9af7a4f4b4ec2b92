use crate::{cluster::ClusterSet, constraints::ShapeMatchingConstraints};

/// Colors already taken by clusters touching one particle.
#[derive(Clone, Debug, Default)]
struct ColorMask(Vec<u64>);

impl ColorMask {
    fn insert(&mut self, color: u32) {
        let word = color as usize / 64;
        if word >= self.0.len() {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1 << (color % 64);
    }
}

/// Greedy graph coloring of clusters, one cluster at a time in index order.
///
/// Two clusters conflict when they share a particle. Each cluster receives the
/// smallest color not used by any previously colored conflicting cluster.
#[derive(Clone, Debug, Default)]
pub struct GraphColoring {
    particle_colors: Vec<ColorMask>,
    colors: Vec<u32>,
    scratch: Vec<u64>,
}

impl GraphColoring {
    pub fn new(particle_count: usize) -> Self {
        Self {
            particle_colors: vec![ColorMask::default(); particle_count],
            ..Default::default()
        }
    }

    pub fn color_next(&mut self, cluster: &[u32]) -> u32 {
        self.scratch.clear();
        for p in cluster {
            let Some(mask) = self.particle_colors.get(*p as usize) else {
                continue;
            };
            if mask.0.len() > self.scratch.len() {
                self.scratch.resize(mask.0.len(), 0);
            }
            for (used, word) in self.scratch.iter_mut().zip(&mask.0) {
                *used |= word;
            }
        }

        let color = self
            .scratch
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(w, word)| w as u32 * 64 + word.trailing_ones())
            .unwrap_or(self.scratch.len() as u32 * 64);

        for p in cluster {
            let p = *p as usize;
            if p >= self.particle_colors.len() {
                self.particle_colors.resize_with(p + 1, Default::default);
            }
            self.particle_colors[p].insert(color);
        }
        self.colors.push(color);
        color
    }

    pub fn colors(&self) -> &[u32] {
        &self.colors
    }

    pub fn finish(self) -> Vec<u32> {
        self.colors
    }
}

pub fn colorize(clusters: &ClusterSet) -> Vec<u32> {
    let particle_count = clusters
        .particle_indices()
        .iter()
        .max()
        .map_or(0, |m| *m as usize + 1);
    let mut coloring = GraphColoring::new(particle_count);
    for cluster in clusters.iter() {
        coloring.color_next(cluster);
    }
    coloring.finish()
}

/// Groups clusters into one batch per color, keeping cluster order within a
/// batch. Every constraint starts active.
pub fn batch_clusters(clusters: &ClusterSet, colors: &[u32]) -> ShapeMatchingConstraints {
    debug_assert_eq!(clusters.len(), colors.len());
    let mut constraints = ShapeMatchingConstraints::default();
    for (cluster, color) in clusters.iter().zip(colors) {
        constraints
            .batch_for_color(*color as usize)
            .add_constraint(cluster);
    }
    constraints.activate_all();
    constraints
}
