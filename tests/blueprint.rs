use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use glam::{IVec3, UVec3, Vec3};
use softbody_clusters::{
    job::run_until, BlueprintAsset, BlueprintError, BlueprintKind, BlueprintSlot, InputMesh,
    KinematicSolver, SlotStatus, Softbody, SoftbodyParams, StepSnapshot, SurfaceBlueprintBuilder,
    VolumeBlueprintBuilder, Voxel, VoxelGrid, Voxelizer,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Vertices of a unit sphere, latitude rings from pole to pole.
fn sphere_mesh(rings: usize, segments: usize) -> Arc<InputMesh> {
    let mut vertices = Vec::new();
    for r in 0..=rings {
        let theta = std::f32::consts::PI * r as f32 / rings as f32;
        for s in 0..segments {
            let phi = std::f32::consts::TAU * s as f32 / segments as f32;
            vertices.push(Vec3::new(
                theta.sin() * phi.cos(),
                theta.cos(),
                theta.sin() * phi.sin(),
            ));
        }
    }
    let normals = vertices.clone();
    Arc::new(InputMesh::new(vertices, normals))
}

/// Marks every voxel whose center lies inside the unit sphere, with the
/// outermost shell as boundary.
struct SphereVoxelizer;

impl Voxelizer for SphereVoxelizer {
    fn voxelize(&self, _mesh: &InputMesh, voxel_size: f32, scale: Vec3) -> VoxelGrid {
        let half = (scale.max_element() / voxel_size).ceil() as i32;
        let side = (2 * half) as u32;
        let mut grid = VoxelGrid::new(IVec3::splat(-half), UVec3::splat(side), voxel_size);
        for (coord, _) in grid.clone().iter() {
            let d = grid.center(coord).length() / scale.max_element();
            let voxel = if d > 1. {
                Voxel::Outside
            } else if d > 1. - voxel_size * 1.5 {
                Voxel::Boundary
            } else {
                Voxel::Inside
            };
            grid.set(coord, voxel);
        }
        grid
    }
}

#[test]
fn surface_build_holds_its_invariants() {
    init();
    let mesh = sphere_mesh(16, 24);
    let params = SoftbodyParams::default();
    let bp = SurfaceBlueprintBuilder::build(mesh.clone(), params).unwrap();

    assert_eq!(bp.kind(), BlueprintKind::Surface);
    assert!(bp.particle_count() > 10 && bp.particle_count() < mesh.vertices.len());
    assert_eq!(bp.active_particle_count(), bp.particle_count());
    assert!(bp.validate().is_ok());

    let map = bp.vertex_to_particle().unwrap();
    assert_eq!(map.len(), mesh.vertices.len());

    let constraints = bp.shape_matching_constraints();
    assert_eq!(constraints.constraint_count(), bp.particle_count());
    assert_eq!(
        constraints.active_constraint_count(),
        constraints.constraint_count()
    );
    for batch in constraints.batches() {
        let mut seen = HashSet::new();
        for cluster in batch.active_constraints() {
            assert!(cluster.iter().all(|p| seen.insert(*p)));
        }
    }
    assert_eq!(bp.pin_constraints().batches().len(), 1);
    assert_eq!(bp.pin_constraints().constraint_count(), 0);
}

#[test]
fn rebuilding_is_deterministic() {
    init();
    let params = SoftbodyParams {
        shape_smoothing: 0.8,
        soft_cluster_radius: 0.4,
        ..Default::default()
    };
    let a = SurfaceBlueprintBuilder::build(sphere_mesh(12, 18), params).unwrap();
    let b = SurfaceBlueprintBuilder::build(sphere_mesh(12, 18), params).unwrap();
    assert_eq!(a, b);
}

#[test]
fn four_vertex_scenario() {
    init();
    let params = SoftbodyParams {
        particle_radius: 0.5,
        particle_overlap: 0.,
        ..Default::default()
    };
    let far = vec![Vec3::ZERO, Vec3::X * 3., Vec3::Y * 3., Vec3::Z * 3.];
    let near = vec![Vec3::ZERO, Vec3::X * 0.9, Vec3::Y * 3., Vec3::Z * 3.];
    for (vertices, expected) in [(far, 4), (near, 3)] {
        let mesh = Arc::new(InputMesh::new(vertices, Vec::new()));
        let bp = SurfaceBlueprintBuilder::build(mesh, params).unwrap();
        assert_eq!(bp.particle_count(), expected);
    }
}

#[test]
fn zero_cluster_radius_gives_one_batch_of_singletons() {
    init();
    let params = SoftbodyParams {
        soft_cluster_radius: 0.,
        ..Default::default()
    };
    let bp = SurfaceBlueprintBuilder::build(sphere_mesh(8, 12), params).unwrap();
    let constraints = bp.shape_matching_constraints();
    assert_eq!(constraints.batch_count(), 1);
    let batch = &constraints.batches()[0];
    assert_eq!(batch.constraint_count(), bp.particle_count());
    for (idx, cluster) in batch.active_constraints().enumerate() {
        assert_eq!(cluster, &[idx as u32]);
    }
}

#[test]
fn unreadable_mesh_keeps_the_previous_blueprint() {
    init();
    let mut slot = BlueprintSlot::default();
    slot.start_build(SurfaceBlueprintBuilder::new(
        sphere_mesh(6, 8),
        SoftbodyParams::default(),
    ));
    while let SlotStatus::Building(_) = slot.poll(16) {}
    let before = slot.current().cloned().unwrap();

    let mut unreadable = (*sphere_mesh(6, 8)).clone();
    unreadable.readable = false;
    slot.start_build(SurfaceBlueprintBuilder::new(
        Arc::new(unreadable),
        SoftbodyParams::default(),
    ));
    assert!(matches!(
        slot.poll(16),
        SlotStatus::Failed(BlueprintError::UnreadableMesh)
    ));
    assert!(Arc::ptr_eq(slot.current().unwrap(), &before));
}

#[test]
fn volume_build_fills_the_interior() {
    init();
    let params = SoftbodyParams {
        particle_radius: 0.1,
        soft_cluster_radius: 0.25,
        ..Default::default()
    };
    let mut job = VolumeBlueprintBuilder::new(sphere_mesh(6, 8), params, SphereVoxelizer);
    let far = Instant::now() + Duration::from_secs(600);
    let mut progress = 0;
    let bp = run_until(&mut job, 64, far, |_| progress += 1)
        .unwrap()
        .unwrap();

    assert!(progress > 1);
    assert_eq!(bp.kind(), BlueprintKind::Volume);
    assert!(bp.vertex_to_particle().is_none());
    assert!(bp.particle_count() > 100);
    assert!(bp
        .particles()
        .positions
        .iter()
        .all(|p| p.length() <= 1. + 1e-4));
    assert!(bp.validate().is_ok());
}

#[test]
fn built_blueprint_survives_an_asset_round_trip() {
    init();
    let bp = SurfaceBlueprintBuilder::build(sphere_mesh(6, 8), SoftbodyParams::default()).unwrap();
    let json = BlueprintAsset::new(bp.clone()).to_json().unwrap();
    assert_eq!(BlueprintAsset::from_json(&json).unwrap().blueprint, bp);
}

#[test]
fn runtime_body_tracks_a_snapshot() {
    init();
    let bp = Arc::new(
        SurfaceBlueprintBuilder::build(sphere_mesh(10, 12), SoftbodyParams::default()).unwrap(),
    );
    let mut solver = KinematicSolver::new(&bp);
    let mut body = Softbody::new(bp.clone());
    body.load(&mut solver);

    let center = body.center_shape().unwrap();
    let positions = &bp.particles().positions;
    let chosen = bp.shape_matching_constraints().batches()[center.batch]
        .active_constraints()
        .nth(center.index)
        .unwrap()[0];
    let best = bp
        .shape_matching_constraints()
        .iter_active()
        .map(|(_, _, c)| positions[c[0] as usize].length_squared())
        .fold(f32::MAX, f32::min);
    assert_eq!(positions[chosen as usize].length_squared(), best);

    let snapshot = StepSnapshot::capture(&solver, bp.particle_count(), bp.shape_matching_constraints());
    let pose = body.interpolate(&snapshot).unwrap();
    assert!(pose.position.abs_diff_eq(Vec3::ZERO, 1e-5));
}
