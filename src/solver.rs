use glam::{Mat4, Quat, Vec3, Vec4};

use crate::{
    blueprint::{Blueprint, Phase},
    constraints::ShapeMatchingConstraints,
    params::ShapeMatchingMaterial,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.position + self.rotation * p
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterFrame {
    pub com: Vec3,
    pub orientation: Quat,
    /// Center of mass of the cluster's rest shape, in blueprint space.
    pub rest_com: Vec3,
}

impl ClusterFrame {
    /// Maps a blueprint-space rest point through the cluster's motion.
    pub fn transform_rest_point(&self, p: Vec3) -> Vec3 {
        self.com + self.orientation * (p - self.rest_com)
    }

    /// Where the blueprint origin ends up when the whole body follows this cluster.
    pub fn reference_pose(&self) -> Pose {
        Pose::new(self.com - self.orientation * self.rest_com, self.orientation)
    }
}

/// Mean rest position of `cluster`, every particle weighing the same.
pub fn cluster_rest_com(rest_positions: &[Vec4], cluster: &[u32]) -> Vec3 {
    let sum: Vec3 = cluster
        .iter()
        .filter_map(|p| rest_positions.get(*p as usize))
        .map(|p| p.truncate())
        .sum();
    if cluster.is_empty() {
        Vec3::ZERO
    } else {
        sum / cluster.len() as f32
    }
}

/// Read access to one completed simulation step.
///
/// Implementations must never expose a partially written step: every read
/// made between two steps observes the same state.
pub trait SolverReadback {
    fn inv_mass(&self, particle: usize) -> Option<f32>;

    fn particle_position(&self, particle: usize) -> Option<Vec3>;

    fn particle_orientation(&self, particle: usize) -> Option<Quat>;

    /// Frame of the `index`-th active cluster of `batch`.
    fn cluster_frame(&self, batch: usize, index: usize) -> Option<ClusterFrame>;
}

pub trait SoftbodySolver: SolverReadback {
    /// Recomputes the rest shape of every active cluster of `batch` from the
    /// blueprint's current rest positions.
    fn recalculate_rest_shape_matching(&mut self, blueprint: &Blueprint, batch: usize);

    /// Applies `material` to every shape-matching cluster of the body.
    fn set_shape_matching_material(&mut self, material: &ShapeMatchingMaterial);

    fn set_phase(&mut self, particle: usize, phase: Phase);
}

/// Immutable copy of one step's output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepSnapshot {
    positions: Vec<Vec3>,
    orientations: Vec<Quat>,
    inv_masses: Vec<f32>,
    frames: Vec<Vec<ClusterFrame>>,
}

impl StepSnapshot {
    pub fn new(
        positions: Vec<Vec3>,
        orientations: Vec<Quat>,
        inv_masses: Vec<f32>,
        frames: Vec<Vec<ClusterFrame>>,
    ) -> Self {
        debug_assert_eq!(positions.len(), orientations.len());
        debug_assert_eq!(positions.len(), inv_masses.len());
        Self {
            positions,
            orientations,
            inv_masses,
            frames,
        }
    }

    /// Copies `particle_count` particles and the frames of every active
    /// cluster of `constraints` out of `solver`.
    pub fn capture<S: SolverReadback + ?Sized>(
        solver: &S,
        particle_count: usize,
        constraints: &ShapeMatchingConstraints,
    ) -> Self {
        let particles = 0..particle_count;
        let frames = constraints
            .batches()
            .iter()
            .enumerate()
            .map(|(b, batch)| {
                (0..batch.active_constraint_count())
                    .map_while(|i| solver.cluster_frame(b, i))
                    .collect()
            })
            .collect();
        Self {
            positions: particles
                .clone()
                .map(|p| solver.particle_position(p).unwrap_or_default())
                .collect(),
            orientations: particles
                .clone()
                .map(|p| solver.particle_orientation(p).unwrap_or_default())
                .collect(),
            inv_masses: particles
                .map(|p| solver.inv_mass(p).unwrap_or_default())
                .collect(),
            frames,
        }
    }

    pub fn frames(&self) -> &[Vec<ClusterFrame>] {
        &self.frames
    }
}

impl SolverReadback for StepSnapshot {
    fn inv_mass(&self, particle: usize) -> Option<f32> {
        self.inv_masses.get(particle).copied()
    }

    fn particle_position(&self, particle: usize) -> Option<Vec3> {
        self.positions.get(particle).copied()
    }

    fn particle_orientation(&self, particle: usize) -> Option<Quat> {
        self.orientations.get(particle).copied()
    }

    fn cluster_frame(&self, batch: usize, index: usize) -> Option<ClusterFrame> {
        self.frames.get(batch)?.get(index).copied()
    }
}

/// Moves every loaded particle rigidly with one pose. Clusters keep their
/// rest shape exactly, which makes it a reference for hosts without a
/// physics backend.
#[derive(Clone, Debug, Default)]
pub struct KinematicSolver {
    rest_positions: Vec<Vec3>,
    rest_orientations: Vec<Quat>,
    inv_masses: Vec<f32>,
    rest_coms: Vec<Vec<Vec3>>,
    phases: Vec<Phase>,
    material: ShapeMatchingMaterial,
    pose: Pose,
}

impl KinematicSolver {
    /// Loads the particles of `blueprint` at solver indices `0..particle_count`.
    pub fn new(blueprint: &Blueprint) -> Self {
        let particles = blueprint.particles();
        Self {
            rest_positions: particles.rest_positions.iter().map(|p| p.truncate()).collect(),
            rest_orientations: particles.rest_orientations.clone(),
            inv_masses: particles.inv_masses.clone(),
            rest_coms: Vec::new(),
            phases: particles.phases.clone(),
            material: ShapeMatchingMaterial::default(),
            pose: Pose::default(),
        }
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn phase(&self, particle: usize) -> Option<Phase> {
        self.phases.get(particle).copied()
    }

    pub fn material(&self) -> &ShapeMatchingMaterial {
        &self.material
    }

    pub fn set_inv_mass(&mut self, particle: usize, inv_mass: f32) {
        if let Some(m) = self.inv_masses.get_mut(particle) {
            *m = inv_mass;
        }
    }
}

impl SolverReadback for KinematicSolver {
    fn inv_mass(&self, particle: usize) -> Option<f32> {
        self.inv_masses.get(particle).copied()
    }

    fn particle_position(&self, particle: usize) -> Option<Vec3> {
        let p = self.rest_positions.get(particle)?;
        Some(self.pose.transform_point(*p))
    }

    fn particle_orientation(&self, particle: usize) -> Option<Quat> {
        let q = self.rest_orientations.get(particle)?;
        Some(self.pose.rotation * *q)
    }

    fn cluster_frame(&self, batch: usize, index: usize) -> Option<ClusterFrame> {
        let rest_com = *self.rest_coms.get(batch)?.get(index)?;
        Some(ClusterFrame {
            com: self.pose.transform_point(rest_com),
            orientation: self.pose.rotation,
            rest_com,
        })
    }
}

impl SoftbodySolver for KinematicSolver {
    fn recalculate_rest_shape_matching(&mut self, blueprint: &Blueprint, batch: usize) {
        let Some(constraints) = blueprint.shape_matching_constraints().batch(batch) else {
            return;
        };
        if self.rest_coms.len() <= batch {
            self.rest_coms.resize_with(batch + 1, Vec::new);
        }
        let rest_positions = &blueprint.particles().rest_positions;
        self.rest_coms[batch] = constraints
            .active_constraints()
            .map(|cluster| cluster_rest_com(rest_positions, cluster))
            .collect();
    }

    fn set_shape_matching_material(&mut self, material: &ShapeMatchingMaterial) {
        self.material = *material;
    }

    fn set_phase(&mut self, particle: usize, phase: Phase) {
        if let Some(p) = self.phases.get_mut(particle) {
            *p = phase;
        }
    }
}
