pub mod anisotropy;
pub mod blueprint;
pub mod builder;
pub mod cluster;
pub mod coloring;
pub mod constraints;
pub mod error;
pub mod gpu;
pub mod job;
pub mod mesh;
pub mod params;
pub mod sampler;
pub mod skinning;
pub mod softbody;
pub mod solver;
pub mod spatial;
pub mod voxel;

pub use blueprint::{
    Blueprint, BlueprintAsset, BlueprintKind, ParticleBuffer, ParticleSwap, Phase, PhaseFlags,
};
pub use builder::{BlueprintSlot, SlotStatus, SurfaceBlueprintBuilder, VolumeBlueprintBuilder};
pub use constraints::{PinConstraints, ShapeMatchingBatch, ShapeMatchingConstraints};
pub use error::{BlueprintError, Result};
pub use job::{Job, JobStatus, Progress};
pub use mesh::InputMesh;
pub use params::{ShapeMatchingMaterial, SkinningParams, SoftbodyParams};
pub use skinning::{BoneWeight, SkinBindJob, SkinBinding, SkinnedMesh, SoftbodySkinner};
pub use softbody::{InterpolationListener, ShapeRef, Softbody};
pub use solver::{ClusterFrame, KinematicSolver, Pose, SoftbodySolver, SolverReadback, StepSnapshot};
pub use voxel::{DistanceField, Voxel, VoxelGrid, Voxelizer};
