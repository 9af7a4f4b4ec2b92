use std::sync::{Arc, Mutex, Weak};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    blueprint::{Blueprint, ParticleSwap, PhaseFlags},
    error::{BlueprintError, Result},
    params::ShapeMatchingMaterial,
    solver::{Pose, SoftbodySolver, SolverReadback},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeRef {
    pub batch: usize,
    /// Position among the batch's active constraints.
    pub index: usize,
}

/// Notified every time a [`Softbody`] reads a new step.
pub trait InterpolationListener: Send {
    fn on_interpolate(&mut self, body: &Softbody, solver: &dyn SolverReadback);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// One simulated instance of a blueprint.
///
/// Particle `i` of the blueprint lives at `solver_indices()[i]` in the solver.
pub struct Softbody {
    blueprint: Arc<Blueprint>,
    solver_indices: Vec<usize>,
    center_shape: Option<ShapeRef>,
    pose: Pose,
    material: ShapeMatchingMaterial,
    self_collisions: bool,
    loaded: bool,
    listeners: Vec<(ListenerId, Weak<Mutex<dyn InterpolationListener>>)>,
    next_listener: u64,
}

impl Softbody {
    /// Places the particles at solver indices `0..particle_count`.
    pub fn new(blueprint: Arc<Blueprint>) -> Self {
        let solver_indices = (0..blueprint.particle_count()).collect();
        Self {
            blueprint,
            solver_indices,
            center_shape: None,
            pose: Pose::default(),
            material: ShapeMatchingMaterial::default(),
            self_collisions: false,
            loaded: false,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn with_solver_indices(blueprint: Arc<Blueprint>, solver_indices: Vec<usize>) -> Result<Self> {
        if solver_indices.len() != blueprint.particle_count() {
            return Err(BlueprintError::InconsistentParticleArrays {
                array: "solver_indices",
                len: solver_indices.len(),
                expected: blueprint.particle_count(),
            });
        }
        Ok(Self {
            solver_indices,
            ..Self::new(blueprint)
        })
    }

    pub fn blueprint(&self) -> &Arc<Blueprint> {
        &self.blueprint
    }

    pub fn solver_indices(&self) -> &[usize] {
        &self.solver_indices
    }

    pub fn center_shape(&self) -> Option<ShapeRef> {
        self.center_shape
    }

    /// Pose computed by the last [`Softbody::interpolate`].
    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn material(&self) -> &ShapeMatchingMaterial {
        &self.material
    }

    pub fn set_material<S: SoftbodySolver + ?Sized>(
        &mut self,
        material: ShapeMatchingMaterial,
        solver: &mut S,
    ) -> Result<()> {
        material.validate()?;
        self.material = material;
        if self.loaded {
            solver.set_shape_matching_material(&self.material);
        }
        Ok(())
    }

    pub fn self_collisions(&self) -> bool {
        self.self_collisions
    }

    /// Sets or clears the self-collision flag on every particle's solver phase.
    pub fn set_self_collisions<S: SoftbodySolver + ?Sized>(
        &mut self,
        enabled: bool,
        solver: &mut S,
    ) {
        self.self_collisions = enabled;
        if self.loaded {
            self.push_phases(solver);
        }
    }

    fn push_phases<S: SoftbodySolver + ?Sized>(&self, solver: &mut S) {
        let phases = &self.blueprint.particles().phases;
        for (phase, idx) in phases.iter().zip(&self.solver_indices) {
            let phase = phase.with_flags(PhaseFlags::SELF_COLLIDE, self.self_collisions);
            solver.set_phase(*idx, phase);
        }
    }

    pub fn load<S: SoftbodySolver + ?Sized>(&mut self, solver: &mut S) {
        self.loaded = true;
        solver.set_shape_matching_material(&self.material);
        self.push_phases(solver);
        self.update_particle_properties(solver);
        debug!(
            "loaded softbody with {} particles, center shape {:?}",
            self.solver_indices.len(),
            self.center_shape
        );
    }

    pub fn unload(&mut self) {
        self.loaded = false;
        self.center_shape = None;
    }

    /// Re-reads particle properties after inverse masses or membership change.
    pub fn update_particle_properties<S: SoftbodySolver + ?Sized>(&mut self, solver: &mut S) {
        self.recalculate_rest_shape_matching(solver);
        self.recalculate_center_shape(solver);
    }

    pub fn recalculate_rest_shape_matching<S: SoftbodySolver + ?Sized>(&self, solver: &mut S) {
        for batch in 0..self.blueprint.shape_matching_constraints().batch_count() {
            solver.recalculate_rest_shape_matching(&self.blueprint, batch);
        }
    }

    /// Picks the active cluster whose center particle lies nearest to the
    /// blueprint origin. Stays unset while any particle is fixed, or missing
    /// from the solver.
    pub fn recalculate_center_shape<S: SolverReadback + ?Sized>(
        &mut self,
        solver: &S,
    ) -> Option<ShapeRef> {
        self.center_shape = None;
        let free = self
            .solver_indices
            .iter()
            .all(|i| solver.inv_mass(*i).map_or(false, |m| m > 0.));
        if !free {
            return None;
        }

        let positions = &self.blueprint.particles().positions;
        let mut min_distance = f32::MAX;
        for (batch, index, cluster) in self.blueprint.shape_matching_constraints().iter_active() {
            let Some(center) = cluster.first().and_then(|c| positions.get(*c as usize)) else {
                continue;
            };
            let d = center.length_squared();
            if d < min_distance {
                min_distance = d;
                self.center_shape = Some(ShapeRef { batch, index });
            }
        }
        self.center_shape
    }

    /// Reads the center shape's frame to place the body, then notifies listeners.
    pub fn interpolate(&mut self, solver: &dyn SolverReadback) -> Option<Pose> {
        let pose = self.center_pose(solver);
        if let Some(pose) = pose {
            self.pose = pose;
        }

        self.listeners.retain(|(_, l)| l.strong_count() > 0);
        for (_, listener) in &self.listeners {
            let Some(listener) = listener.upgrade() else {
                continue;
            };
            let Ok(mut listener) = listener.lock() else {
                continue;
            };
            listener.on_interpolate(self, solver);
        }
        pose
    }

    fn center_pose(&self, solver: &dyn SolverReadback) -> Option<Pose> {
        let shape = self.center_shape?;
        let batch = self
            .blueprint
            .shape_matching_constraints()
            .batch(shape.batch)?;
        if shape.index >= batch.active_constraint_count() {
            return None;
        }
        let frame = solver.cluster_frame(shape.batch, shape.index)?;
        Some(frame.reference_pose())
    }

    /// Registers `listener` until it is removed or its last `Arc` is dropped.
    pub fn add_listener<L: InterpolationListener + 'static>(
        &mut self,
        listener: &Arc<Mutex<L>>,
    ) -> ListenerId {
        let listener: Arc<Mutex<dyn InterpolationListener>> = listener.clone();
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Arc::downgrade(&listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    /// Moves particle `index` in or out of the active prefix. The blueprint is
    /// copied first if other instances share it. When loaded, rest shapes and
    /// the center shape are recomputed since cluster slots depend on
    /// membership.
    pub fn set_particle_active<S: SoftbodySolver + ?Sized>(
        &mut self,
        index: usize,
        active: bool,
        solver: &mut S,
    ) -> Result<Option<ParticleSwap>> {
        let blueprint = Arc::make_mut(&mut self.blueprint);
        let swap = if active {
            blueprint.activate_particle(index)?
        } else {
            blueprint.deactivate_particle(index)?
        };
        let Some(swap) = swap else {
            return Ok(None);
        };
        self.solver_indices
            .swap(swap.from as usize, swap.to as usize);
        if self.loaded {
            self.update_particle_properties(solver);
        }
        Ok(Some(swap))
    }
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;
    use crate::{
        blueprint::{BlueprintKind, ParticleBuffer, ParticleInit, Phase, PhaseFlags},
        coloring::{batch_clusters, colorize},
        cluster::build_clusters,
        params::SoftbodyParams,
        solver::KinematicSolver,
    };

    fn blueprint(positions: &[Vec3], radius: f32) -> Arc<Blueprint> {
        let mut particles = ParticleBuffer::with_capacity(positions.len());
        for p in positions {
            particles.push(ParticleInit {
                position: *p,
                orientation: Quat::IDENTITY,
                principal_radii: Vec3::splat(0.1),
                phase: Phase::new(1, PhaseFlags::empty()),
            });
        }
        let clusters = build_clusters(positions, radius);
        let constraints = batch_clusters(&clusters, &colorize(&clusters));
        Arc::new(Blueprint::new(
            BlueprintKind::Volume,
            SoftbodyParams::default(),
            particles,
            None,
            constraints,
        ))
    }

    fn row() -> Vec<Vec3> {
        vec![
            Vec3::new(3., 0., 0.),
            Vec3::new(2., 0., 0.),
            Vec3::new(1.5, 0., 0.),
            Vec3::new(-0.5, 0.5, 0.),
        ]
    }

    struct Counter(usize);

    impl InterpolationListener for Counter {
        fn on_interpolate(&mut self, _body: &Softbody, _solver: &dyn SolverReadback) {
            self.0 += 1;
        }
    }

    #[test]
    fn center_shape_is_nearest_to_origin() {
        let bp = blueprint(&row(), 0.);
        let mut solver = KinematicSolver::new(&bp);
        let mut body = Softbody::new(bp);
        body.load(&mut solver);
        // singleton clusters all land in batch 0, in particle order
        assert_eq!(body.center_shape(), Some(ShapeRef { batch: 0, index: 3 }));
    }

    #[test]
    fn fixed_particle_leaves_center_unset() {
        let bp = blueprint(&row(), 0.);
        let mut solver = KinematicSolver::new(&bp);
        solver.set_inv_mass(1, 0.);
        let mut body = Softbody::new(bp);
        body.load(&mut solver);
        assert_eq!(body.center_shape(), None);
        assert_eq!(body.interpolate(&solver), None);
    }

    #[test]
    fn interpolation_follows_the_solver_pose() {
        let bp = blueprint(&row(), 1.2);
        let mut solver = KinematicSolver::new(&bp);
        let mut body = Softbody::new(bp);
        body.load(&mut solver);
        assert!(body.center_shape().is_some());

        let moved = Pose::new(
            Vec3::new(0., 4., -1.),
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_4),
        );
        solver.set_pose(moved);
        let pose = body.interpolate(&solver).unwrap();
        assert!(pose.position.abs_diff_eq(moved.position, 1e-5));
        assert!(pose.rotation.abs_diff_eq(moved.rotation, 1e-6));
        assert_eq!(body.pose(), pose);
    }

    #[test]
    fn stale_center_shape_is_ignored() {
        let bp = blueprint(&row(), 0.);
        let solver = KinematicSolver::new(&bp);
        let mut body = Softbody::new(bp);
        body.center_shape = Some(ShapeRef { batch: 5, index: 0 });
        assert_eq!(body.interpolate(&solver), None);
        body.center_shape = Some(ShapeRef { batch: 0, index: 0 });
        // rest shapes were never computed, the solver has no frame to offer
        assert_eq!(body.interpolate(&solver), None);
    }

    #[test]
    fn listeners_run_until_removed_or_dropped() {
        let bp = blueprint(&row(), 0.);
        let mut solver = KinematicSolver::new(&bp);
        let mut body = Softbody::new(bp);
        body.load(&mut solver);

        let kept = Arc::new(Mutex::new(Counter(0)));
        let dropped = Arc::new(Mutex::new(Counter(0)));
        let removed = Arc::new(Mutex::new(Counter(0)));
        body.add_listener(&kept);
        body.add_listener(&dropped);
        let id = body.add_listener(&removed);

        body.interpolate(&solver);
        assert!(body.remove_listener(id));
        assert!(!body.remove_listener(id));
        drop(dropped);
        body.interpolate(&solver);

        assert_eq!(kept.lock().unwrap().0, 2);
        assert_eq!(removed.lock().unwrap().0, 1);
        assert_eq!(body.listeners.len(), 1);
    }

    #[test]
    fn deactivation_recomputes_center_shape() {
        let bp = blueprint(&row(), 0.);
        let shared = Arc::clone(&bp);
        let mut solver = KinematicSolver::new(&bp);
        let mut body = Softbody::new(bp);
        body.load(&mut solver);

        let swap = body.set_particle_active(3, false, &mut solver).unwrap();
        assert_eq!(swap, Some(ParticleSwap { from: 3, to: 3 }));
        assert_eq!(body.blueprint().active_particle_count(), 3);
        // the shared copy is untouched
        assert_eq!(shared.active_particle_count(), 4);

        let swap = body.set_particle_active(0, false, &mut solver).unwrap();
        assert_eq!(swap, Some(ParticleSwap { from: 0, to: 2 }));
        assert_eq!(body.solver_indices(), &[2, 1, 0, 3]);
        assert!(body.center_shape().is_some());
        assert!(body.interpolate(&solver).is_some());
    }

    #[test]
    fn material_reaches_the_solver_once_loaded() {
        let bp = blueprint(&row(), 0.);
        let mut solver = KinematicSolver::new(&bp);
        let mut body = Softbody::new(bp);
        let soft = ShapeMatchingMaterial {
            deformation_resistance: 0.4,
            plastic_yield: 0.1,
            plastic_creep: 0.5,
            ..Default::default()
        };
        body.set_material(soft, &mut solver).unwrap();
        assert_eq!(*solver.material(), ShapeMatchingMaterial::default());

        body.load(&mut solver);
        assert_eq!(*solver.material(), soft);

        let invalid = ShapeMatchingMaterial {
            max_deformation: 2.,
            ..soft
        };
        assert!(body.set_material(invalid, &mut solver).is_err());
        assert_eq!(*body.material(), soft);
        assert_eq!(*solver.material(), soft);
    }

    #[test]
    fn self_collisions_toggle_solver_phases() {
        let bp = blueprint(&row(), 0.);
        let mut solver = KinematicSolver::new(&bp);
        let mut body = Softbody::with_solver_indices(bp, vec![3, 2, 1, 0]).unwrap();
        body.set_self_collisions(true, &mut solver);
        assert!(solver.phase(0).unwrap().flags().is_empty());

        body.load(&mut solver);
        for idx in 0..4 {
            let phase = solver.phase(idx).unwrap();
            assert_eq!(phase.flags(), PhaseFlags::SELF_COLLIDE);
            assert_eq!(phase.group(), 1);
        }
        body.set_self_collisions(false, &mut solver);
        assert!(body.blueprint().particles().phases.iter().all(|p| p.flags().is_empty()));
        assert!((0..4).all(|idx| solver.phase(idx).unwrap().flags().is_empty()));
    }

    #[test]
    fn solver_index_count_must_match() {
        let bp = blueprint(&row(), 0.);
        assert!(Softbody::with_solver_indices(Arc::clone(&bp), vec![0, 1]).is_err());
        let body = Softbody::with_solver_indices(bp, vec![7, 6, 5, 4]).unwrap();
        assert_eq!(body.solver_indices(), &[7, 6, 5, 4]);
    }
}
