use std::{mem, sync::Arc};

use glam::Vec3;
use log::{debug, error, info};
use rayon::prelude::*;

use crate::{
    anisotropy::{fit_ellipsoid, gather_neighborhood},
    blueprint::{Blueprint, BlueprintKind, ParticleBuffer, ParticleInit, Phase, PhaseFlags},
    cluster::{ClusterBuilder, ClusterSet},
    coloring::{batch_clusters, GraphColoring},
    constraints::ShapeMatchingConstraints,
    error::{BlueprintError, Result},
    job::{run_to_completion, Job, JobStatus, Progress},
    mesh::InputMesh,
    params::SoftbodyParams,
    sampler::{
        map_vertices_to_particles, sample_volume, volume_voxel_size, SurfaceSampler, VolumeSample,
    },
    voxel::Voxelizer,
};

const SAMPLING: &str = "sampling mesh";
const MAPPING: &str = "mapping vertices to particles";
const GENERATING: &str = "generating particles";
const VOXELIZING: &str = "voxelizing mesh";
const CLUSTERING: &str = "generating shape matching constraints";
const COLORING: &str = "batching shape matching constraints";

/// Every particle is created in this collision group.
const PARTICLE_GROUP: i32 = 1;

fn step_range(next: usize, budget: usize, total: usize) -> std::ops::Range<usize> {
    next..next.saturating_add(budget).min(total)
}

enum ShapeMatchingState {
    Clustering(ClusterBuilder),
    Coloring {
        clusters: ClusterSet,
        coloring: GraphColoring,
    },
    Finished(Option<ShapeMatchingConstraints>),
}

/// Clusters a point set and colors the clusters into conflict-free batches.
pub struct ShapeMatchingJob {
    positions: Vec<Vec3>,
    state: ShapeMatchingState,
}

impl ShapeMatchingJob {
    pub fn new(positions: Vec<Vec3>, cluster_radius: f32) -> Self {
        let builder = ClusterBuilder::new(&positions, cluster_radius);
        Self {
            positions,
            state: ShapeMatchingState::Clustering(builder),
        }
    }
}

impl Job for ShapeMatchingJob {
    type Output = ShapeMatchingConstraints;

    fn step(&mut self, budget: usize) -> JobStatus {
        let total = self.positions.len();
        match &mut self.state {
            ShapeMatchingState::Clustering(builder) => {
                let mut done = 0;
                while done < budget && builder.push_next(&self.positions) {
                    done += 1;
                }
                let next = builder.next_center();
                if next < total {
                    return JobStatus::Pending(Progress::new(CLUSTERING, next, total));
                }
                if let ShapeMatchingState::Clustering(builder) =
                    mem::replace(&mut self.state, ShapeMatchingState::Finished(None))
                {
                    let clusters = builder.finish();
                    debug!(
                        "built {} clusters over {} particle references",
                        clusters.len(),
                        clusters.particle_indices().len()
                    );
                    self.state = ShapeMatchingState::Coloring {
                        clusters,
                        coloring: GraphColoring::new(total),
                    };
                }
                JobStatus::Pending(Progress::new(COLORING, 0, total))
            }
            ShapeMatchingState::Coloring { clusters, coloring } => {
                for idx in step_range(coloring.colors().len(), budget, clusters.len()) {
                    coloring.color_next(clusters.cluster(idx));
                }
                let colored = coloring.colors().len();
                if colored < clusters.len() {
                    return JobStatus::Pending(Progress::new(COLORING, colored, clusters.len()));
                }
                let constraints = batch_clusters(clusters, coloring.colors());
                debug!(
                    "colored {} clusters into {} batches",
                    clusters.len(),
                    constraints.batch_count()
                );
                self.state = ShapeMatchingState::Finished(Some(constraints));
                JobStatus::Done
            }
            ShapeMatchingState::Finished(_) => JobStatus::Done,
        }
    }

    fn take_output(&mut self) -> Option<ShapeMatchingConstraints> {
        match &mut self.state {
            ShapeMatchingState::Finished(constraints) => constraints.take(),
            _ => None,
        }
    }
}

fn particle_phase(one_sided: bool) -> Phase {
    let flags = if one_sided {
        PhaseFlags::ONE_SIDED
    } else {
        PhaseFlags::empty()
    };
    Phase::new(PARTICLE_GROUP, flags)
}

/// Fits an ellipsoid to the mesh around `sample` and places the particle.
fn surface_particle(mesh: &InputMesh, params: &SoftbodyParams, sample: Vec3) -> ParticleInit {
    let hood = gather_neighborhood(sample, mesh, params.scale, params.anisotropy_neighborhood);
    let fit = fit_ellipsoid(
        &hood.points,
        hood.average_normal,
        params.particle_radius,
        params.max_anisotropy,
        sample,
    );
    ParticleInit {
        position: sample.lerp(fit.centroid, params.shape_smoothing),
        orientation: fit.orientation,
        principal_radii: fit.radii,
        phase: particle_phase(params.one_sided),
    }
}

/// Checks the inputs shared by every build. On failure the job finishes
/// immediately with the error and without producing particles.
fn preflight(mesh: &InputMesh, params: &SoftbodyParams) -> Result<()> {
    params.validate()?;
    if !mesh.readable {
        error!("the input mesh is not readable");
        return Err(BlueprintError::UnreadableMesh);
    }
    Ok(())
}

enum SurfaceState {
    Sampling { next: usize },
    Mapping { next: usize },
    Generating { next: usize },
    Constraints(ShapeMatchingJob),
    Finished,
}

/// Builds a blueprint with one particle per retained mesh vertex.
pub struct SurfaceBlueprintBuilder {
    mesh: Arc<InputMesh>,
    params: SoftbodyParams,
    state: SurfaceState,
    sampler: SurfaceSampler,
    samples: Vec<Vec3>,
    vertex_to_particle: Vec<u32>,
    particles: ParticleBuffer,
    output: Option<Result<Blueprint>>,
}

impl SurfaceBlueprintBuilder {
    pub fn new(mesh: Arc<InputMesh>, params: SoftbodyParams) -> Self {
        let (state, output) = match preflight(&mesh, &params) {
            Ok(()) => {
                info!(
                    "building surface blueprint from {} vertices",
                    mesh.vertices.len()
                );
                (SurfaceState::Sampling { next: 0 }, None)
            }
            Err(e) => (SurfaceState::Finished, Some(Err(e))),
        };
        Self {
            sampler: SurfaceSampler::new(params.particle_radius, params.particle_overlap),
            mesh,
            params,
            state,
            samples: Vec::new(),
            vertex_to_particle: Vec::new(),
            particles: ParticleBuffer::default(),
            output,
        }
    }

    pub fn build(mesh: Arc<InputMesh>, params: SoftbodyParams) -> Result<Blueprint> {
        run_to_completion(&mut Self::new(mesh, params)).ok_or(BlueprintError::Incomplete)?
    }

    fn finish(&mut self, constraints: ShapeMatchingConstraints) {
        let blueprint = Blueprint::new(
            BlueprintKind::Surface,
            self.params,
            mem::take(&mut self.particles),
            Some(mem::take(&mut self.vertex_to_particle)),
            constraints,
        );
        info!(
            "surface blueprint ready: {} particles, {} clusters in {} batches",
            blueprint.particle_count(),
            blueprint.shape_matching_constraints().constraint_count(),
            blueprint.shape_matching_constraints().batch_count()
        );
        self.output = Some(Ok(blueprint));
        self.state = SurfaceState::Finished;
    }
}

impl Job for SurfaceBlueprintBuilder {
    type Output = Result<Blueprint>;

    fn step(&mut self, budget: usize) -> JobStatus {
        let vertex_count = self.mesh.vertices.len();
        match &mut self.state {
            SurfaceState::Sampling { next } => {
                let range = step_range(*next, budget, vertex_count);
                for v in &self.mesh.vertices[range.clone()] {
                    self.sampler.offer(*v * self.params.scale);
                }
                *next = range.end;
                if *next < vertex_count {
                    return JobStatus::Pending(Progress::new(SAMPLING, *next, vertex_count));
                }
                self.samples = self.sampler.particles().to_vec();
                debug!(
                    "accepted {} of {} vertices",
                    self.samples.len(),
                    vertex_count
                );
                self.vertex_to_particle = Vec::with_capacity(vertex_count);
                self.state = SurfaceState::Mapping { next: 0 };
                JobStatus::Pending(Progress::new(MAPPING, 0, vertex_count))
            }
            SurfaceState::Mapping { next } => {
                let range = step_range(*next, budget, vertex_count);
                self.vertex_to_particle.extend(map_vertices_to_particles(
                    &self.mesh.vertices[range.clone()],
                    self.params.scale,
                    &self.samples,
                ));
                *next = range.end;
                if *next < vertex_count {
                    return JobStatus::Pending(Progress::new(MAPPING, *next, vertex_count));
                }
                self.particles = ParticleBuffer::with_capacity(self.samples.len());
                self.state = SurfaceState::Generating { next: 0 };
                JobStatus::Pending(Progress::new(GENERATING, 0, self.samples.len()))
            }
            SurfaceState::Generating { next } => {
                let total = self.samples.len();
                let range = step_range(*next, budget, total);
                let (mesh, params) = (&self.mesh, &self.params);
                let inits: Vec<ParticleInit> = self.samples[range.clone()]
                    .par_iter()
                    .map(|sample| surface_particle(mesh, params, *sample))
                    .collect();
                for init in inits {
                    self.particles.push(init);
                }
                *next = range.end;
                if *next < total {
                    return JobStatus::Pending(Progress::new(GENERATING, *next, total));
                }
                // clusters are built over the raw samples, not the smoothed positions
                self.state = SurfaceState::Constraints(ShapeMatchingJob::new(
                    mem::take(&mut self.samples),
                    self.params.soft_cluster_radius,
                ));
                JobStatus::Pending(Progress::new(CLUSTERING, 0, total))
            }
            SurfaceState::Constraints(job) => match job.step(budget) {
                JobStatus::Pending(progress) => JobStatus::Pending(progress),
                JobStatus::Done => {
                    let constraints = job.take_output().unwrap_or_default();
                    self.finish(constraints);
                    JobStatus::Done
                }
            },
            SurfaceState::Finished => JobStatus::Done,
        }
    }

    fn take_output(&mut self) -> Option<Result<Blueprint>> {
        self.output.take()
    }
}

enum VolumeState {
    Voxelizing,
    Generating { next: usize },
    Constraints(ShapeMatchingJob),
    Finished,
}

/// Builds a blueprint with one particle per occupied voxel.
pub struct VolumeBlueprintBuilder<V> {
    mesh: Arc<InputMesh>,
    params: SoftbodyParams,
    voxelizer: V,
    state: VolumeState,
    samples: Vec<VolumeSample>,
    particles: ParticleBuffer,
    output: Option<Result<Blueprint>>,
}

impl<V: Voxelizer> VolumeBlueprintBuilder<V> {
    pub fn new(mesh: Arc<InputMesh>, params: SoftbodyParams, voxelizer: V) -> Self {
        let (state, output) = match preflight(&mesh, &params) {
            Ok(()) => {
                info!(
                    "building volume blueprint from {} vertices",
                    mesh.vertices.len()
                );
                (VolumeState::Voxelizing, None)
            }
            Err(e) => (VolumeState::Finished, Some(Err(e))),
        };
        Self {
            mesh,
            params,
            voxelizer,
            state,
            samples: Vec::new(),
            particles: ParticleBuffer::default(),
            output,
        }
    }

    pub fn build(mesh: Arc<InputMesh>, params: SoftbodyParams, voxelizer: V) -> Result<Blueprint> {
        run_to_completion(&mut Self::new(mesh, params, voxelizer))
            .ok_or(BlueprintError::Incomplete)?
    }

    fn voxelize(&mut self) {
        let Some(bounds) = self.mesh.bounds() else {
            debug!("input mesh has no vertices, nothing to voxelize");
            return;
        };
        let voxel_size = volume_voxel_size(
            bounds.scaled(self.params.scale).size(),
            self.params.particle_radius,
            self.params.particle_overlap,
        );
        let grid = self
            .voxelizer
            .voxelize(&self.mesh, voxel_size, self.params.scale);
        let field = self.voxelizer.nearest_surface(&grid);
        self.samples = sample_volume(&grid, &field, self.params.particle_overlap);
        debug!(
            "voxel size {voxel_size}, grid {}, {} occupied voxels",
            grid.resolution,
            self.samples.len()
        );
    }
}

impl<V: Voxelizer> Job for VolumeBlueprintBuilder<V> {
    type Output = Result<Blueprint>;

    fn step(&mut self, budget: usize) -> JobStatus {
        match &mut self.state {
            VolumeState::Voxelizing => {
                self.voxelize();
                self.particles = ParticleBuffer::with_capacity(self.samples.len());
                self.state = VolumeState::Generating { next: 0 };
                JobStatus::Pending(Progress::new(VOXELIZING, 1, 1))
            }
            VolumeState::Generating { next } => {
                let total = self.samples.len();
                let range = step_range(*next, budget, total);
                // self-collision and one-sidedness stay off for volumetric particles
                let phase = Phase::new(PARTICLE_GROUP, PhaseFlags::empty());
                for sample in &self.samples[range.clone()] {
                    self.particles.push(ParticleInit {
                        position: sample.position,
                        orientation: sample.orientation,
                        principal_radii: sample.principal_radii,
                        phase,
                    });
                }
                *next = range.end;
                if *next < total {
                    return JobStatus::Pending(Progress::new(GENERATING, *next, total));
                }
                let positions = self.samples.iter().map(|s| s.position).collect();
                self.samples.clear();
                self.state = VolumeState::Constraints(ShapeMatchingJob::new(
                    positions,
                    self.params.soft_cluster_radius,
                ));
                JobStatus::Pending(Progress::new(CLUSTERING, 0, total))
            }
            VolumeState::Constraints(job) => match job.step(budget) {
                JobStatus::Pending(progress) => JobStatus::Pending(progress),
                JobStatus::Done => {
                    let constraints = job.take_output().unwrap_or_default();
                    let blueprint = Blueprint::new(
                        BlueprintKind::Volume,
                        self.params,
                        mem::take(&mut self.particles),
                        None,
                        constraints,
                    );
                    info!(
                        "volume blueprint ready: {} particles, {} clusters in {} batches",
                        blueprint.particle_count(),
                        blueprint.shape_matching_constraints().constraint_count(),
                        blueprint.shape_matching_constraints().batch_count()
                    );
                    self.output = Some(Ok(blueprint));
                    self.state = VolumeState::Finished;
                    JobStatus::Done
                }
            },
            VolumeState::Finished => JobStatus::Done,
        }
    }

    fn take_output(&mut self) -> Option<Result<Blueprint>> {
        self.output.take()
    }
}

#[derive(Debug)]
pub enum SlotStatus {
    Idle,
    Building(Progress),
    /// A build finished and its blueprint replaced the current one.
    Replaced,
    /// A build failed. The current blueprint is unchanged.
    Failed(BlueprintError),
}

type BlueprintJob = Box<dyn Job<Output = Result<Blueprint>> + Send>;

/// Holds the blueprint running instances use, plus at most one build in flight.
///
/// A finished build replaces the current blueprint wholesale; a failed or
/// abandoned one leaves it untouched.
#[derive(Default)]
pub struct BlueprintSlot {
    current: Option<Arc<Blueprint>>,
    pending: Option<BlueprintJob>,
}

impl BlueprintSlot {
    pub fn new(blueprint: Blueprint) -> Self {
        Self {
            current: Some(Arc::new(blueprint)),
            pending: None,
        }
    }

    pub fn current(&self) -> Option<&Arc<Blueprint>> {
        self.current.as_ref()
    }

    pub fn is_building(&self) -> bool {
        self.pending.is_some()
    }

    /// Starts `job`, dropping any build already in flight.
    pub fn start_build(&mut self, job: impl Job<Output = Result<Blueprint>> + Send + 'static) {
        if self.pending.replace(Box::new(job)).is_some() {
            debug!("abandoning the previous blueprint build");
        }
    }

    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Advances the pending build by one step of `budget` units, at least one.
    pub fn poll(&mut self, budget: usize) -> SlotStatus {
        let Some(job) = &mut self.pending else {
            return SlotStatus::Idle;
        };
        if let JobStatus::Pending(progress) = job.step(budget.max(1)) {
            return SlotStatus::Building(progress);
        }
        let output = job.take_output();
        self.pending = None;
        match output {
            Some(Ok(blueprint)) => {
                self.current = Some(Arc::new(blueprint));
                SlotStatus::Replaced
            }
            Some(Err(e)) => {
                error!("blueprint build failed: {e}");
                SlotStatus::Failed(e)
            }
            None => SlotStatus::Failed(BlueprintError::Incomplete),
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{IVec3, UVec3};

    use super::*;
    use crate::voxel::{Voxel, VoxelGrid};

    fn quad_mesh() -> Arc<InputMesh> {
        let mut vertices = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                vertices.push(Vec3::new(i as f32 * 0.05, j as f32 * 0.05, 0.));
            }
        }
        let normals = vec![Vec3::Z; vertices.len()];
        Arc::new(InputMesh::new(vertices, normals))
    }

    struct BoxVoxelizer;

    impl Voxelizer for BoxVoxelizer {
        fn voxelize(&self, _mesh: &InputMesh, voxel_size: f32, _scale: Vec3) -> VoxelGrid {
            let mut grid = VoxelGrid::new(IVec3::ZERO, UVec3::splat(3), voxel_size);
            for (coord, _) in grid.clone().iter() {
                let voxel = if coord == UVec3::ONE {
                    Voxel::Inside
                } else {
                    Voxel::Boundary
                };
                grid.set(coord, voxel);
            }
            grid.set(UVec3::new(2, 2, 2), Voxel::Outside);
            grid
        }
    }

    #[test]
    fn stepping_in_small_budgets_matches_a_single_run() {
        let params = SoftbodyParams::default();
        let whole = SurfaceBlueprintBuilder::build(quad_mesh(), params).unwrap();

        let mut job = SurfaceBlueprintBuilder::new(quad_mesh(), params);
        let mut labels = Vec::new();
        loop {
            match job.step(7) {
                JobStatus::Pending(p) => {
                    assert!((0. ..=1.).contains(&p.fraction));
                    if labels.last() != Some(&p.label) {
                        labels.push(p.label);
                    }
                }
                JobStatus::Done => break,
            }
        }
        let stepped = job.take_output().unwrap().unwrap();
        assert_eq!(stepped, whole);
        assert_eq!(
            labels,
            vec![SAMPLING, MAPPING, GENERATING, CLUSTERING, COLORING]
        );
    }

    #[test]
    fn unreadable_mesh_fails_without_particles() {
        let mut mesh = (*quad_mesh()).clone();
        mesh.readable = false;
        let mut job = SurfaceBlueprintBuilder::new(Arc::new(mesh), SoftbodyParams::default());
        assert_eq!(job.step(1), JobStatus::Done);
        assert!(matches!(
            job.take_output(),
            Some(Err(BlueprintError::UnreadableMesh))
        ));
    }

    #[test]
    fn one_sided_flag_reaches_surface_phases() {
        let params = SoftbodyParams {
            one_sided: true,
            ..Default::default()
        };
        let bp = SurfaceBlueprintBuilder::build(quad_mesh(), params).unwrap();
        assert!(bp
            .particles()
            .phases
            .iter()
            .all(|p| p.flags() == PhaseFlags::ONE_SIDED && p.group() == 1));
    }

    #[test]
    fn volume_build_emits_one_particle_per_occupied_voxel() {
        let params = SoftbodyParams {
            particle_radius: 0.1,
            particle_overlap: 0.,
            soft_cluster_radius: 0.25,
            one_sided: true,
            ..Default::default()
        };
        let mut job = VolumeBlueprintBuilder::new(quad_mesh(), params, BoxVoxelizer);
        let mut labels = Vec::new();
        while let JobStatus::Pending(p) = job.step(10) {
            if labels.last() != Some(&p.label) {
                labels.push(p.label);
            }
        }
        assert_eq!(labels, vec![VOXELIZING, GENERATING, CLUSTERING, COLORING]);
        let bp = job.take_output().unwrap().unwrap();

        assert_eq!(bp.kind(), BlueprintKind::Volume);
        assert_eq!(bp.particle_count(), 26);
        assert!(bp.vertex_to_particle().is_none());
        assert!(bp.particles().principal_radii.iter().all(|r| *r == Vec3::splat(0.1)));
        assert!(bp.particles().phases.iter().all(|p| p.flags().is_empty()));
        assert_eq!(bp.shape_matching_constraints().constraint_count(), 26);
        assert!(bp.validate().is_ok());
    }

    #[test]
    fn slot_replaces_only_on_success() {
        let mut slot = BlueprintSlot::default();
        assert!(matches!(slot.poll(10), SlotStatus::Idle));

        slot.start_build(SurfaceBlueprintBuilder::new(
            quad_mesh(),
            SoftbodyParams::default(),
        ));
        let status = loop {
            match slot.poll(50) {
                SlotStatus::Building(_) => continue,
                other => break other,
            }
        };
        assert!(matches!(status, SlotStatus::Replaced));
        let first = Arc::clone(slot.current().unwrap());

        let bad = SoftbodyParams {
            particle_radius: -1.,
            ..Default::default()
        };
        slot.start_build(SurfaceBlueprintBuilder::new(quad_mesh(), bad));
        assert!(matches!(
            slot.poll(50),
            SlotStatus::Failed(BlueprintError::InvalidParameter { .. })
        ));
        assert!(Arc::ptr_eq(slot.current().unwrap(), &first));
        assert!(!slot.is_building());
    }

    #[test]
    fn zero_budget_polls_still_advance() {
        let mut slot = BlueprintSlot::default();
        slot.start_build(SurfaceBlueprintBuilder::new(
            quad_mesh(),
            SoftbodyParams::default(),
        ));
        let mut polls = 0;
        let status = loop {
            polls += 1;
            assert!(polls < 10_000, "build made no progress");
            match slot.poll(0) {
                SlotStatus::Building(_) => continue,
                other => break other,
            }
        };
        assert!(matches!(status, SlotStatus::Replaced));
        assert!(slot.current().is_some());
    }

    #[test]
    fn restarting_abandons_the_previous_build() {
        let mut slot = BlueprintSlot::default();
        slot.start_build(SurfaceBlueprintBuilder::new(
            quad_mesh(),
            SoftbodyParams::default(),
        ));
        assert!(matches!(slot.poll(3), SlotStatus::Building(_)));
        slot.start_build(SurfaceBlueprintBuilder::new(
            quad_mesh(),
            SoftbodyParams::default(),
        ));
        assert!(slot.cancel());
        assert!(matches!(slot.poll(3), SlotStatus::Idle));
        assert!(slot.current().is_none());
    }
}
