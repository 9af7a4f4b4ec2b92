use encase::{private::WriteInto, ShaderSize, ShaderType, StorageBuffer};
use glam::{Mat4, Vec3, Vec4};

use crate::{
    blueprint::Blueprint,
    error::{BlueprintError, Result},
};

/// One particle as laid out in a std430 storage buffer.
#[derive(Clone, Copy, Debug, PartialEq, ShaderType)]
pub struct GpuParticle {
    pub position: Vec3,
    pub inv_mass: f32,
    pub rest_position: Vec4,
    pub orientation: Vec4,
    pub rest_orientation: Vec4,
    pub velocity: Vec3,
    pub inv_rotational_mass: f32,
    pub angular_velocity: Vec3,
    pub phase: i32,
    pub principal_radii: Vec3,
    pub color: Vec4,
}

#[derive(Clone, Copy, Debug, PartialEq, ShaderType)]
pub struct GpuBone {
    pub skin: Mat4,
}

/// Packs `els` as a runtime-sized std430 array.
pub fn storage_bytes<T: ShaderType + WriteInto + ShaderSize>(els: &[T]) -> Result<Vec<u8>> {
    let mut buffer = StorageBuffer::new(Vec::new());
    buffer
        .write(&els)
        .map_err(|e| BlueprintError::GpuLayout(format!("{e:?}")))?;
    Ok(buffer.into_inner())
}

impl Blueprint {
    pub fn gpu_particles(&self) -> Vec<GpuParticle> {
        let p = self.particles();
        (0..p.len())
            .map(|i| GpuParticle {
                position: p.positions[i],
                inv_mass: p.inv_masses[i],
                rest_position: p.rest_positions[i],
                orientation: p.orientations[i].into(),
                rest_orientation: p.rest_orientations[i].into(),
                velocity: p.velocities[i],
                inv_rotational_mass: p.inv_rotational_masses[i],
                angular_velocity: p.angular_velocities[i],
                phase: p.phases[i].bits(),
                principal_radii: p.principal_radii[i],
                color: p.colors[i],
            })
            .collect()
    }

        pub fn particle_storage_bytes(&self) -> Result<Vec<u8>> {
        self.particles().validate()?;
        storage_bytes(&self.gpu_particles())
    }
}
