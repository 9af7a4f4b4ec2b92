use bitflags::bitflags;
use glam::{Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::{
    constraints::{swap_indices, PinConstraints, ShapeMatchingConstraints},
    error::{BlueprintError, Result},
    params::SoftbodyParams,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PhaseFlags: i32 {
        const SELF_COLLIDE = 1 << 24;
        const FLUID = 1 << 25;
        const ONE_SIDED = 1 << 26;
    }
}

/// Collision group and behavior flags packed the way solvers consume them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Phase(i32);

impl Phase {
    const GROUP_MASK: i32 = 0x00ff_ffff;

    pub fn new(group: i32, flags: PhaseFlags) -> Self {
        Self((group & Self::GROUP_MASK) | flags.bits())
    }

    pub fn group(self) -> i32 {
        self.0 & Self::GROUP_MASK
    }

    pub fn flags(self) -> PhaseFlags {
        PhaseFlags::from_bits_truncate(self.0)
    }

    pub fn bits(self) -> i32 {
        self.0
    }

    /// Same group, with `flags` set or cleared.
    pub fn with_flags(self, flags: PhaseFlags, enabled: bool) -> Self {
        let mut current = self.flags();
        current.set(flags, enabled);
        Self::new(self.group(), current)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleInit {
    pub position: Vec3,
    pub orientation: Quat,
    pub principal_radii: Vec3,
    pub phase: Phase,
}

/// Parallel per-particle arrays. Index `i` in every array describes particle `i`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleBuffer {
    pub positions: Vec<Vec3>,
    /// `w == 1` marks the rest position as active.
    pub rest_positions: Vec<Vec4>,
    pub orientations: Vec<Quat>,
    pub rest_orientations: Vec<Quat>,
    pub velocities: Vec<Vec3>,
    pub angular_velocities: Vec<Vec3>,
    pub inv_masses: Vec<f32>,
    pub inv_rotational_masses: Vec<f32>,
    pub principal_radii: Vec<Vec3>,
    pub phases: Vec<Phase>,
    pub colors: Vec<Vec4>,
}

impl ParticleBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            rest_positions: Vec::with_capacity(capacity),
            orientations: Vec::with_capacity(capacity),
            rest_orientations: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            angular_velocities: Vec::with_capacity(capacity),
            inv_masses: Vec::with_capacity(capacity),
            inv_rotational_masses: Vec::with_capacity(capacity),
            principal_radii: Vec::with_capacity(capacity),
            phases: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Appends a particle at rest with unit inverse masses and a white color.
    pub fn push(&mut self, init: ParticleInit) {
        self.positions.push(init.position);
        self.rest_positions.push(init.position.extend(1.));
        self.orientations.push(init.orientation);
        self.rest_orientations.push(init.orientation);
        self.velocities.push(Vec3::ZERO);
        self.angular_velocities.push(Vec3::ZERO);
        self.inv_masses.push(1.);
        self.inv_rotational_masses.push(1.);
        self.principal_radii.push(init.principal_radii);
        self.phases.push(init.phase);
        self.colors.push(Vec4::ONE);
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.len();
        let lens = [
            ("rest_positions", self.rest_positions.len()),
            ("orientations", self.orientations.len()),
            ("rest_orientations", self.rest_orientations.len()),
            ("velocities", self.velocities.len()),
            ("angular_velocities", self.angular_velocities.len()),
            ("inv_masses", self.inv_masses.len()),
            ("inv_rotational_masses", self.inv_rotational_masses.len()),
            ("principal_radii", self.principal_radii.len()),
            ("phases", self.phases.len()),
            ("colors", self.colors.len()),
        ];
        match lens.into_iter().find(|(_, len)| *len != expected) {
            Some((array, len)) => Err(BlueprintError::InconsistentParticleArrays {
                array,
                len,
                expected,
            }),
            None => Ok(()),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.positions.swap(a, b);
        self.rest_positions.swap(a, b);
        self.orientations.swap(a, b);
        self.rest_orientations.swap(a, b);
        self.velocities.swap(a, b);
        self.angular_velocities.swap(a, b);
        self.inv_masses.swap(a, b);
        self.inv_rotational_masses.swap(a, b);
        self.principal_radii.swap(a, b);
        self.phases.swap(a, b);
        self.colors.swap(a, b);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlueprintKind {
    Surface,
    Volume,
}

/// Two particle slots exchanged by an activation change. Every index equal to
/// `from` now reads `to` and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParticleSwap {
    pub from: u32,
    pub to: u32,
}

/// Immutable result of a build: particles, batched shape-matching clusters and pins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    kind: BlueprintKind,
    params: SoftbodyParams,
    particles: ParticleBuffer,
    active_particle_count: usize,
    vertex_to_particle: Option<Vec<u32>>,
    shape_matching: ShapeMatchingConstraints,
    pins: PinConstraints,
}

impl Blueprint {
    pub fn new(
        kind: BlueprintKind,
        params: SoftbodyParams,
        particles: ParticleBuffer,
        vertex_to_particle: Option<Vec<u32>>,
        shape_matching: ShapeMatchingConstraints,
    ) -> Self {
        Self {
            kind,
            params,
            active_particle_count: particles.len(),
            particles,
            vertex_to_particle,
            shape_matching,
            pins: PinConstraints::default(),
        }
    }

    pub fn empty(kind: BlueprintKind, params: SoftbodyParams) -> Self {
        Self::new(
            kind,
            params,
            ParticleBuffer::default(),
            (kind == BlueprintKind::Surface).then(Vec::new),
            ShapeMatchingConstraints::default(),
        )
    }

    pub fn kind(&self) -> BlueprintKind {
        self.kind
    }

    pub fn params(&self) -> &SoftbodyParams {
        &self.params
    }

    pub fn particles(&self) -> &ParticleBuffer {
        &self.particles
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Particles `0..active_particle_count()` are active.
    pub fn active_particle_count(&self) -> usize {
        self.active_particle_count
    }

    /// Nearest particle of every input vertex. Surface blueprints only.
    pub fn vertex_to_particle(&self) -> Option<&[u32]> {
        self.vertex_to_particle.as_deref()
    }

    pub fn shape_matching_constraints(&self) -> &ShapeMatchingConstraints {
        &self.shape_matching
    }

    pub fn shape_matching_constraints_mut(&mut self) -> &mut ShapeMatchingConstraints {
        &mut self.shape_matching
    }

    pub fn pin_constraints(&self) -> &PinConstraints {
        &self.pins
    }

    pub fn pin_constraints_mut(&mut self) -> &mut PinConstraints {
        &mut self.pins
    }

    /// Moves an inactive particle into the active prefix.
    /// Returns `None` if it is already active.
    pub fn activate_particle(&mut self, index: usize) -> Result<Option<ParticleSwap>> {
        self.check_particle(index)?;
        if index < self.active_particle_count {
            return Ok(None);
        }
        let swap = self.swap_particles(index, self.active_particle_count);
        self.active_particle_count += 1;
        Ok(Some(swap))
    }

    /// Moves an active particle out of the active prefix.
    /// Returns `None` if it is already inactive.
    pub fn deactivate_particle(&mut self, index: usize) -> Result<Option<ParticleSwap>> {
        self.check_particle(index)?;
        if index >= self.active_particle_count {
            return Ok(None);
        }
        self.active_particle_count -= 1;
        Ok(Some(self.swap_particles(index, self.active_particle_count)))
    }

    fn check_particle(&self, index: usize) -> Result<()> {
        if index < self.particle_count() {
            Ok(())
        } else {
            Err(BlueprintError::IndexOutOfBounds {
                what: "particle",
                index,
                len: self.particle_count(),
            })
        }
    }

    /// Exchanges two particle slots and renames them in every index map.
    fn swap_particles(&mut self, from: usize, to: usize) -> ParticleSwap {
        let swap = ParticleSwap {
            from: from as u32,
            to: to as u32,
        };
        if from == to {
            return swap;
        }
        self.particles.swap(from, to);
        if let Some(map) = &mut self.vertex_to_particle {
            swap_indices(map, swap.from, swap.to);
        }
        self.shape_matching.swap_particles(swap.from, swap.to);
        self.pins.swap_particles(swap.from, swap.to);
        swap
    }

    pub fn validate(&self) -> Result<()> {
        self.particles.validate()?;
        let len = self.particle_count();
        if self.active_particle_count > len {
            return Err(BlueprintError::IndexOutOfBounds {
                what: "active particle count",
                index: self.active_particle_count,
                len,
            });
        }
        let check = |what: &'static str, idx: u32| {
            if (idx as usize) < len {
                Ok(())
            } else {
                Err(BlueprintError::IndexOutOfBounds {
                    what,
                    index: idx as usize,
                    len,
                })
            }
        };
        for idx in self.vertex_to_particle.iter().flatten() {
            check("vertex to particle", *idx)?;
        }
        for batch in self.shape_matching.batches() {
            batch.validate()?;
            for idx in batch.particle_indices() {
                check("shape matching", *idx)?;
            }
        }
        for batch in self.pins.batches() {
            batch.validate()?;
            for idx in batch.particle_indices() {
                check("pin", *idx)?;
            }
        }
        Ok(())
    }
}

/// Versioned on-disk record of a blueprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlueprintAsset {
    pub version: u32,
    pub blueprint: Blueprint,
}

impl BlueprintAsset {
    pub const VERSION: u32 = 1;

    pub fn new(blueprint: Blueprint) -> Self {
        Self {
            version: Self::VERSION,
            blueprint,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates a record, rejecting other format versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let asset: Self = serde_json::from_str(json)?;
        if asset.version != Self::VERSION {
            return Err(BlueprintError::UnsupportedVersion {
                found: asset.version,
                expected: Self::VERSION,
            });
        }
        asset.blueprint.validate()?;
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cluster::build_clusters, coloring};

    fn line_blueprint(n: usize) -> Blueprint {
        let mut particles = ParticleBuffer::with_capacity(n);
        for i in 0..n {
            particles.push(ParticleInit {
                position: Vec3::new(i as f32, 0., 0.),
                orientation: Quat::IDENTITY,
                principal_radii: Vec3::splat(0.5),
                phase: Phase::new(1, PhaseFlags::empty()),
            });
        }
        let clusters = build_clusters(&particles.positions, 1.5);
        let colors = coloring::colorize(&clusters);
        let constraints = coloring::batch_clusters(&clusters, &colors);
        let map = (0..n as u32).flat_map(|i| [i, i]).collect();
        Blueprint::new(
            BlueprintKind::Surface,
            SoftbodyParams::default(),
            particles,
            Some(map),
            constraints,
        )
    }

    #[test]
    fn phase_packs_group_and_flags() {
        let phase = Phase::new(1, PhaseFlags::ONE_SIDED);
        assert_eq!(phase.group(), 1);
        assert_eq!(phase.flags(), PhaseFlags::ONE_SIDED);
        assert_eq!(phase.bits(), 1 | (1 << 26));

        let colliding = phase.with_flags(PhaseFlags::SELF_COLLIDE, true);
        assert_eq!(colliding.group(), 1);
        assert_eq!(colliding.flags(), PhaseFlags::ONE_SIDED | PhaseFlags::SELF_COLLIDE);
        assert_eq!(colliding.with_flags(PhaseFlags::SELF_COLLIDE, false), phase);
    }

    #[test]
    fn detects_inconsistent_arrays() {
        let mut bp = line_blueprint(3);
        assert!(bp.validate().is_ok());
        bp.particles.colors.pop();
        assert!(matches!(
            bp.validate(),
            Err(BlueprintError::InconsistentParticleArrays { array: "colors", .. })
        ));
    }

    #[test]
    fn deactivation_swaps_into_the_inactive_tail() {
        let mut bp = line_blueprint(4);
        let swap = bp.deactivate_particle(1).unwrap();
        assert_eq!(swap, Some(ParticleSwap { from: 1, to: 3 }));
        assert_eq!(bp.active_particle_count(), 3);
        assert_eq!(bp.particles().positions[3], Vec3::new(1., 0., 0.));
        assert_eq!(bp.particles().positions[1], Vec3::new(3., 0., 0.));
        assert_eq!(bp.vertex_to_particle().unwrap(), &[0, 0, 3, 3, 2, 2, 1, 1]);

        assert_eq!(bp.deactivate_particle(3).unwrap(), None);
        let swap = bp.activate_particle(3).unwrap();
        assert_eq!(swap, Some(ParticleSwap { from: 3, to: 3 }));
        assert_eq!(bp.active_particle_count(), 4);
        assert!(bp.activate_particle(9).is_err());
    }

    #[test]
    fn repeated_swaps_keep_vertices_on_their_particle() {
        let mut bp = line_blueprint(6);
        let rest = bp.particles().positions.clone();
        let original: Vec<Vec3> = bp
            .vertex_to_particle()
            .unwrap()
            .iter()
            .map(|p| rest[*p as usize])
            .collect();

        for idx in [0, 4, 2, 0, 1, 3] {
            if idx < bp.active_particle_count() {
                bp.deactivate_particle(idx).unwrap();
            } else {
                bp.activate_particle(idx).unwrap();
            }
            let positions = &bp.particles().positions;
            let mapped: Vec<Vec3> = bp
                .vertex_to_particle()
                .unwrap()
                .iter()
                .map(|p| positions[*p as usize])
                .collect();
            assert_eq!(mapped, original);
        }
        for idx in 0..6 {
            bp.activate_particle(idx).unwrap();
        }
        assert_eq!(bp.active_particle_count(), 6);
        assert!(bp.validate().is_ok());
    }

    #[test]
    fn swaps_keep_cluster_centers_on_their_particle() {
        let mut bp = line_blueprint(5);
        let centers = |bp: &Blueprint| -> Vec<Vec3> {
            bp.shape_matching_constraints()
                .iter_active()
                .map(|(_, _, c)| bp.particles().positions[c[0] as usize])
                .collect()
        };
        let before = centers(&bp);
        bp.deactivate_particle(0).unwrap();
        bp.deactivate_particle(2).unwrap();
        assert_eq!(centers(&bp), before);
    }

    #[test]
    fn asset_round_trip_and_version_check() {
        let bp = line_blueprint(3);
        let json = BlueprintAsset::new(bp.clone()).to_json().unwrap();
        let loaded = BlueprintAsset::from_json(&json).unwrap();
        assert_eq!(loaded.blueprint, bp);

        let mut future = BlueprintAsset::new(bp);
        future.version = 7;
        let json = serde_json::to_string(&future).unwrap();
        assert!(matches!(
            BlueprintAsset::from_json(&json),
            Err(BlueprintError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn asset_with_corrupt_cluster_extents_is_rejected() {
        let json = BlueprintAsset::new(line_blueprint(3)).to_json().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["blueprint"]["shape_matching"]["batches"][0]["first_index"][0] = 1000.into();
        let json = serde_json::to_string(&value).unwrap();
        assert!(matches!(
            BlueprintAsset::from_json(&json),
            Err(BlueprintError::IndexOutOfBounds {
                what: "shape matching extent",
                ..
            })
        ));
    }

    #[test]
    fn empty_blueprint_keeps_kind_specific_maps() {
        let surface = Blueprint::empty(BlueprintKind::Surface, SoftbodyParams::default());
        assert!(surface.is_empty());
        assert_eq!(surface.vertex_to_particle(), Some(&[][..]));
        assert_eq!(surface.pin_constraints().batches().len(), 1);

        let volume = Blueprint::empty(BlueprintKind::Volume, SoftbodyParams::default());
        assert!(volume.vertex_to_particle().is_none());
    }
}
