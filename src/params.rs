use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{BlueprintError, Result};

/// Largest overlap fraction allowed between neighbouring particles.
pub const MAX_PARTICLE_OVERLAP: f32 = 0.75;

/// Tunables used to turn a mesh into a soft-body blueprint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftbodyParams {
    /// Per-axis scale applied to mesh vertices before sampling.
    pub scale: Vec3,
    pub particle_radius: f32,
    /// Fraction of overlap allowed between particles, in `[0, 0.75]`.
    pub particle_overlap: f32,
    /// Blend between the raw sample (0) and the fitted neighborhood centroid (1).
    pub shape_smoothing: f32,
    /// Radius around each particle used to estimate its anisotropy.
    pub anisotropy_neighborhood: f32,
    /// Maximum ratio between the longest and shortest particle axis.
    pub max_anisotropy: f32,
    /// Particles closer than this to a cluster center join its cluster.
    pub soft_cluster_radius: f32,
    pub one_sided: bool,
}

impl Default for SoftbodyParams {
    fn default() -> Self {
        Self {
            scale: Vec3::ONE,
            particle_radius: 0.1,
            particle_overlap: 0.2,
            shape_smoothing: 0.5,
            anisotropy_neighborhood: 0.2,
            max_anisotropy: 3.0,
            soft_cluster_radius: 0.3,
            one_sided: false,
        }
    }
}

impl SoftbodyParams {
    /// Two accepted particles are never closer than this.
    pub fn min_particle_distance(&self) -> f32 {
        self.particle_radius * 2. * (1. - self.particle_overlap)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() {
            return Err(BlueprintError::invalid_parameter(
                "scale",
                format!("{} is not finite", self.scale),
            ));
        }
        if !(self.particle_radius.is_finite() && self.particle_radius > 0.) {
            return Err(BlueprintError::invalid_parameter(
                "particle_radius",
                format!("{} must be a positive number", self.particle_radius),
            ));
        }
        if !(0. ..=MAX_PARTICLE_OVERLAP).contains(&self.particle_overlap) {
            return Err(BlueprintError::invalid_parameter(
                "particle_overlap",
                format!(
                    "{} is outside [0, {MAX_PARTICLE_OVERLAP}]",
                    self.particle_overlap
                ),
            ));
        }
        if !(0. ..=1.).contains(&self.shape_smoothing) {
            return Err(BlueprintError::invalid_parameter(
                "shape_smoothing",
                format!("{} is outside [0, 1]", self.shape_smoothing),
            ));
        }
        if !(self.anisotropy_neighborhood.is_finite() && self.anisotropy_neighborhood >= 0.) {
            return Err(BlueprintError::invalid_parameter(
                "anisotropy_neighborhood",
                format!("{} must be non-negative", self.anisotropy_neighborhood),
            ));
        }
        if !(self.max_anisotropy.is_finite() && self.max_anisotropy >= 1.) {
            return Err(BlueprintError::invalid_parameter(
                "max_anisotropy",
                format!("{} must be at least 1", self.max_anisotropy),
            ));
        }
        if !(self.soft_cluster_radius.is_finite() && self.soft_cluster_radius >= 0.) {
            return Err(BlueprintError::invalid_parameter(
                "soft_cluster_radius",
                format!("{} must be non-negative", self.soft_cluster_radius),
            ));
        }
        Ok(())
    }
}

/// Tunables for binding a render mesh to shape-matching clusters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkinningParams {
    /// Exponent applied to `max_distance / distance`.
    pub falloff: f32,
    /// Clusters farther than this from a vertex do not influence it.
    pub max_distance: f32,
}

impl Default for SkinningParams {
    fn default() -> Self {
        Self {
            falloff: 1.0,
            max_distance: 0.5,
        }
    }
}

impl SkinningParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.falloff.is_finite() && self.falloff >= 0.) {
            return Err(BlueprintError::invalid_parameter(
                "falloff",
                format!("{} must be non-negative", self.falloff),
            ));
        }
        if !(self.max_distance.is_finite() && self.max_distance >= 0.) {
            return Err(BlueprintError::invalid_parameter(
                "max_distance",
                format!("{} must be non-negative", self.max_distance),
            ));
        }
        Ok(())
    }
}

/// Runtime behavior of a body's shape-matching clusters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeMatchingMaterial {
    pub enabled: bool,
    /// How strongly clusters pull back to their rest shape, in `[0, 1]`.
    pub deformation_resistance: f32,
    /// Largest deformation a cluster may reach, in `[0, 1]`. Zero disables the limit.
    pub max_deformation: f32,
    /// Deformation above which a cluster starts deforming plastically.
    pub plastic_yield: f32,
    /// Rate at which deformation above the yield becomes permanent.
    pub plastic_creep: f32,
    /// Rate at which plastic deformation returns to the original rest shape.
    pub plastic_recovery: f32,
}

impl Default for ShapeMatchingMaterial {
    fn default() -> Self {
        Self {
            enabled: true,
            deformation_resistance: 1.,
            max_deformation: 0.,
            plastic_yield: 0.,
            plastic_creep: 0.,
            plastic_recovery: 0.,
        }
    }
}

impl ShapeMatchingMaterial {
    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("deformation_resistance", self.deformation_resistance),
            ("max_deformation", self.max_deformation),
        ];
        for (name, value) in unit {
            if !(0. ..=1.).contains(&value) {
                return Err(BlueprintError::invalid_parameter(
                    name,
                    format!("{value} is outside [0, 1]"),
                ));
            }
        }
        let rates = [
            ("plastic_yield", self.plastic_yield),
            ("plastic_creep", self.plastic_creep),
            ("plastic_recovery", self.plastic_recovery),
        ];
        for (name, value) in rates {
            if !(value.is_finite() && value >= 0.) {
                return Err(BlueprintError::invalid_parameter(
                    name,
                    format!("{value} must be non-negative"),
                ));
            }
        }
        Ok(())
    }
}
