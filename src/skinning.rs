use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    blueprint::Blueprint,
    error::Result,
    gpu::{storage_bytes, GpuBone},
    job::{run_to_completion, Job, JobStatus, Progress},
    params::SkinningParams,
    softbody::{InterpolationListener, ListenerId, ShapeRef, Softbody},
    solver::SolverReadback,
};

const BIND_POSES: &str = "computing bind poses";
const WEIGHTS: &str = "computing skin weights";

/// Weight given to a bone sitting exactly on the vertex, before falloff.
const COINCIDENT_WEIGHT: f32 = 100.;

/// Up to four bone influences, strongest first. Unused slots hold index -1.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct BoneWeight {
    pub indices: [i32; 4],
    pub weights: [f32; 4],
}

impl Default for BoneWeight {
    fn default() -> Self {
        Self::UNBOUND
    }
}

impl BoneWeight {
    pub const UNBOUND: Self = Self {
        indices: [-1; 4],
        weights: [0.; 4],
    };

    /// Keeps the four strongest influences. An equal weight never displaces
    /// one inserted earlier.
    pub fn insert(&mut self, bone: i32, weight: f32) {
        let Some(slot) = (0..4).find(|i| self.indices[*i] < 0 || weight > self.weights[*i]) else {
            return;
        };
        for i in (slot + 1..4).rev() {
            self.indices[i] = self.indices[i - 1];
            self.weights[i] = self.weights[i - 1];
        }
        self.indices[slot] = bone;
        self.weights[slot] = weight;
    }

    /// Scales the used weights to sum to one. Weights must be finite.
    pub fn normalize(&mut self) {
        // dividing by the largest first keeps the sum from overflowing
        let largest = self.weights.iter().copied().fold(0f32, f32::max);
        if largest <= 0. {
            return;
        }
        for w in &mut self.weights {
            *w /= largest;
        }
        let sum: f32 = self.weights.iter().sum();
        for w in &mut self.weights {
            *w /= sum;
        }
    }

    pub fn is_unbound(&self) -> bool {
        self.indices.iter().all(|i| *i < 0)
    }

    /// Shifts the bone indices by `offset`. Unused slots point at `offset`
    /// with zero weight.
    pub fn offset(&self, offset: i32) -> Self {
        Self {
            indices: self.indices.map(|i| i.max(0) + offset),
            weights: self.weights,
        }
    }
}

/// Weights of the bones centered at `centers` on a world-space vertex.
pub fn compute_bone_weight(vertex: Vec3, centers: &[Vec3], params: &SkinningParams) -> BoneWeight {
    let mut weight = BoneWeight::UNBOUND;
    for (bone, center) in centers.iter().enumerate() {
        let distance = vertex.distance(*center);
        if distance > params.max_distance {
            continue;
        }
        let influence = if distance > 0. {
            params.max_distance / distance
        } else {
            COINCIDENT_WEIGHT
        };
        weight.insert(bone as i32, influence.powf(params.falloff).min(f32::MAX));
    }
    weight.normalize();
    weight
}

/// Rest state of the particle a bone follows, in blueprint space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoneRest {
    pub center: Vec3,
    pub orientation: Quat,
}

/// Output of a [`SkinBindJob`]: one bone per active cluster plus the
/// weights of every render vertex.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkinBinding {
    pub clusters: Vec<ShapeRef>,
    pub bone_rest: Vec<BoneRest>,
    /// Placement of the blueprint when the binding was made.
    pub source_to_world: Mat4,
    /// Rigid world transform of every bone at bind time.
    pub rest_bones: Vec<Mat4>,
    pub bind_poses: Vec<Mat4>,
    pub bone_weights: Vec<BoneWeight>,
}

impl SkinBinding {
    pub fn bone_count(&self) -> usize {
        self.bind_poses.len()
    }

    /// Appends the bones to `mesh` after the ones it already has, and
    /// overwrites the weights of every vertex with at least one influence.
    /// Returns the index of the first appended bone.
    pub fn append_to(&self, mesh: &mut SkinnedMesh) -> usize {
        let offset = mesh.bind_poses.len();
        if mesh.bone_weights.len() < mesh.vertices.len() {
            mesh.bone_weights
                .resize(mesh.vertices.len(), BoneWeight::UNBOUND);
        }
        for (dst, weight) in mesh.bone_weights.iter_mut().zip(&self.bone_weights) {
            if !weight.is_unbound() {
                *dst = weight.offset(offset as i32);
            }
        }
        mesh.bind_poses.extend_from_slice(&self.bind_poses);
        mesh.bones.extend_from_slice(&self.rest_bones);
        offset
    }

    /// Bone weights laid out as consecutive `[i32; 4]`, `[f32; 4]` pairs.
    pub fn bone_weight_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.bone_weights)
    }
}

/// Render mesh skin data, possibly shared by several skinners.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkinnedMesh {
    pub vertices: Vec<Vec3>,
    pub bind_poses: Vec<Mat4>,
    pub bone_weights: Vec<BoneWeight>,
    pub bones: Vec<Mat4>,
}

impl SkinnedMesh {
    pub fn new(vertices: Vec<Vec3>) -> Self {
        Self {
            bone_weights: vec![BoneWeight::UNBOUND; vertices.len()],
            vertices,
            ..Default::default()
        }
    }
}

enum BindState {
    BindPoses { next: usize },
    Weights { next: usize },
    Finished,
}

/// Binds render vertices to the active clusters of a blueprint.
pub struct SkinBindJob {
    params: SkinningParams,
    source_to_world: Mat4,
    source_rotation: Quat,
    target_to_world: Mat4,
    vertices: Vec<Vec3>,
    state: BindState,
    world_centers: Vec<Vec3>,
    binding: SkinBinding,
    output: Option<SkinBinding>,
}

impl SkinBindJob {
    /// `source_to_world` places the blueprint, `target_to_world` the render
    /// mesh whose `vertices` get weighted.
    pub fn new(
        blueprint: &Blueprint,
        vertices: Vec<Vec3>,
        source_to_world: Mat4,
        target_to_world: Mat4,
        params: SkinningParams,
    ) -> Result<Self> {
        params.validate()?;
        let particles = blueprint.particles();
        let mut binding = SkinBinding::default();
        for (batch, index, cluster) in blueprint.shape_matching_constraints().iter_active() {
            let Some(center) = cluster.first().map(|c| *c as usize) else {
                continue;
            };
            let (Some(position), Some(orientation)) = (
                particles.rest_positions.get(center),
                particles.rest_orientations.get(center),
            ) else {
                continue;
            };
            binding.clusters.push(ShapeRef { batch, index });
            binding.bone_rest.push(BoneRest {
                center: position.truncate(),
                orientation: *orientation,
            });
        }
        binding.source_to_world = source_to_world;
        let (_, source_rotation, _) = source_to_world.to_scale_rotation_translation();
        info!(
            "binding {} vertices to {} clusters",
            vertices.len(),
            binding.clusters.len()
        );
        Ok(Self {
            params,
            source_to_world,
            source_rotation,
            target_to_world,
            vertices,
            state: BindState::BindPoses { next: 0 },
            world_centers: Vec::with_capacity(binding.bone_rest.len()),
            binding,
            output: None,
        })
    }
}

impl Job for SkinBindJob {
    type Output = SkinBinding;

    fn step(&mut self, budget: usize) -> JobStatus {
        match &mut self.state {
            BindState::BindPoses { next } => {
                let total = self.binding.bone_rest.len();
                let end = next.saturating_add(budget).min(total);
                for rest in &self.binding.bone_rest[*next..end] {
                    let center = self.source_to_world.transform_point3(rest.center);
                    let orientation = self.source_rotation * rest.orientation;
                    let bone = Mat4::from_rotation_translation(orientation, center);
                    self.world_centers.push(center);
                    self.binding.bind_poses.push(bone.inverse() * self.target_to_world);
                    self.binding.rest_bones.push(bone);
                }
                *next = end;
                if *next < total {
                    return JobStatus::Pending(Progress::new(BIND_POSES, *next, total));
                }
                self.binding.bone_weights = Vec::with_capacity(self.vertices.len());
                self.state = BindState::Weights { next: 0 };
                JobStatus::Pending(Progress::new(WEIGHTS, 0, self.vertices.len()))
            }
            BindState::Weights { next } => {
                let total = self.vertices.len();
                let end = next.saturating_add(budget).min(total);
                let (centers, params, target_to_world) =
                    (&self.world_centers, &self.params, self.target_to_world);
                let weights: Vec<BoneWeight> = self.vertices[*next..end]
                    .par_iter()
                    .map(|v| {
                        compute_bone_weight(target_to_world.transform_point3(*v), centers, params)
                    })
                    .collect();
                self.binding.bone_weights.extend(weights);
                *next = end;
                if *next < total {
                    return JobStatus::Pending(Progress::new(WEIGHTS, *next, total));
                }
                let unbound = self
                    .binding
                    .bone_weights
                    .iter()
                    .filter(|w| w.is_unbound())
                    .count();
                debug!("{unbound} of {total} vertices have no bone within reach");
                self.output = Some(std::mem::take(&mut self.binding));
                self.state = BindState::Finished;
                JobStatus::Done
            }
            BindState::Finished => JobStatus::Done,
        }
    }

    fn take_output(&mut self) -> Option<SkinBinding> {
        self.output.take()
    }
}

/// Drives a render mesh's bones from the clusters of a simulated body.
#[derive(Debug)]
pub struct SoftbodySkinner {
    params: SkinningParams,
    solver_to_world: Mat4,
    binding: Option<SkinBinding>,
    bone_offset: usize,
    bones: Vec<Mat4>,
}

impl SoftbodySkinner {
    pub fn new(params: SkinningParams) -> Self {
        Self {
            params,
            solver_to_world: Mat4::IDENTITY,
            binding: None,
            bone_offset: 0,
            bones: Vec::new(),
        }
    }

    pub fn params(&self) -> &SkinningParams {
        &self.params
    }

    /// Transform applied to cluster frames read from the solver. Binding
    /// resets it to the binding's `source_to_world`.
    pub fn set_solver_to_world(&mut self, solver_to_world: Mat4) {
        self.solver_to_world = solver_to_world;
    }

    pub fn start_bind(
        &self,
        blueprint: &Blueprint,
        mesh: &SkinnedMesh,
        source_to_world: Mat4,
        target_to_world: Mat4,
    ) -> Result<SkinBindJob> {
        SkinBindJob::new(
            blueprint,
            mesh.vertices.clone(),
            source_to_world,
            target_to_world,
            self.params,
        )
    }

    pub fn bind(&mut self, binding: SkinBinding, mesh: &mut SkinnedMesh) {
        self.bone_offset = binding.append_to(mesh);
        self.solver_to_world = binding.source_to_world;
        self.bones = binding.rest_bones.clone();
        self.binding = Some(binding);
    }

    pub fn bind_now(
        &mut self,
        blueprint: &Blueprint,
        mesh: &mut SkinnedMesh,
        source_to_world: Mat4,
        target_to_world: Mat4,
    ) -> Result<()> {
        let mut job = self.start_bind(blueprint, mesh, source_to_world, target_to_world)?;
        if let Some(binding) = run_to_completion(&mut job) {
            self.bind(binding, mesh);
        }
        Ok(())
    }

    pub fn unbind(&mut self) -> Option<SkinBinding> {
        self.bones.clear();
        self.binding.take()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn binding(&self) -> Option<&SkinBinding> {
        self.binding.as_ref()
    }

    /// Index of this skinner's first bone in the mesh it was bound to.
    pub fn bone_offset(&self) -> usize {
        self.bone_offset
    }

    pub fn bones(&self) -> &[Mat4] {
        &self.bones
    }

    /// Moves every bone to its cluster's current frame. Bones stay rigid even
    /// when `solver_to_world` scales. Bones whose cluster has no frame keep
    /// their last transform. Returns how many moved.
    pub fn update_bones<S: SolverReadback + ?Sized>(&mut self, solver: &S) -> usize {
        let Some(binding) = &self.binding else {
            return 0;
        };
        let (_, solver_rotation, _) = self.solver_to_world.to_scale_rotation_translation();
        let mut updated = 0;
        for ((bone, shape), rest) in self
            .bones
            .iter_mut()
            .zip(&binding.clusters)
            .zip(&binding.bone_rest)
        {
            let Some(frame) = solver.cluster_frame(shape.batch, shape.index) else {
                continue;
            };
            let position = self
                .solver_to_world
                .transform_point3(frame.transform_rest_point(rest.center));
            let rotation = solver_rotation * frame.orientation * rest.orientation;
            *bone = Mat4::from_rotation_translation(rotation, position);
            updated += 1;
        }
        updated
    }

    pub fn skin_matrices(&self) -> Vec<Mat4> {
        let Some(binding) = &self.binding else {
            return Vec::new();
        };
        self.bones
            .iter()
            .zip(&binding.bind_poses)
            .map(|(bone, bind)| *bone * *bind)
            .collect()
    }

    /// Copies the current bones into this skinner's range of `mesh.bones`.
    pub fn write_bones(&self, mesh: &mut SkinnedMesh) {
        let start = self.bone_offset.min(mesh.bones.len());
        let end = (self.bone_offset + self.bones.len()).min(mesh.bones.len());
        mesh.bones[start..end].copy_from_slice(&self.bones[..end - start]);
    }

    pub fn bone_palette(&self) -> Result<Vec<u8>> {
        let bones: Vec<GpuBone> = self
            .skin_matrices()
            .into_iter()
            .map(|skin| GpuBone { skin })
            .collect();
        storage_bytes(&bones)
    }

    /// Updates `this` every time `body` interpolates.
    pub fn attach(this: &Arc<Mutex<Self>>, body: &mut Softbody) -> ListenerId {
        body.add_listener(this)
    }

    pub fn detach(body: &mut Softbody, id: ListenerId) -> bool {
        body.remove_listener(id)
    }
}

impl InterpolationListener for SoftbodySkinner {
    fn on_interpolate(&mut self, _body: &Softbody, solver: &dyn SolverReadback) {
        self.update_bones(solver);
    }
}
