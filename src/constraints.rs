use glam::Vec3;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{BlueprintError, Result};

/// Shape-matching clusters that share no particles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeMatchingBatch {
    particle_indices: Vec<u32>,
    first_index: Vec<u32>,
    num_indices: Vec<u32>,
    active_constraint_count: usize,
}

impl ShapeMatchingBatch {
    pub fn add_constraint(&mut self, indices: &[u32]) {
        debug_assert!(!indices.is_empty());
        self.first_index.push(self.particle_indices.len() as u32);
        self.num_indices.push(indices.len() as u32);
        self.particle_indices.extend_from_slice(indices);
    }

    pub fn constraint_count(&self) -> usize {
        self.first_index.len()
    }

    pub fn active_constraint_count(&self) -> usize {
        self.active_constraint_count
    }

    pub fn set_active_constraint_count(&mut self, count: usize) {
        if count > self.constraint_count() {
            warn!(
                "clamping active constraint count {count} to {}",
                self.constraint_count()
            );
        }
        self.active_constraint_count = count.min(self.constraint_count());
    }

    pub fn constraint(&self, idx: usize) -> Option<&[u32]> {
        let start = *self.first_index.get(idx)? as usize;
        let len = *self.num_indices.get(idx)? as usize;
        self.particle_indices.get(start..start.checked_add(len)?)
    }

    /// Checks that every constraint's extent lies inside `particle_indices`
    /// and that no more constraints are active than exist.
    pub fn validate(&self) -> Result<()> {
        if self.num_indices.len() != self.first_index.len() {
            return Err(BlueprintError::InconsistentParticleArrays {
                array: "num_indices",
                len: self.num_indices.len(),
                expected: self.first_index.len(),
            });
        }
        let len = self.particle_indices.len();
        for (first, num) in self.first_index.iter().zip(&self.num_indices) {
            let end = *first as usize + *num as usize;
            if end > len {
                return Err(BlueprintError::IndexOutOfBounds {
                    what: "shape matching extent",
                    index: end,
                    len,
                });
            }
        }
        if self.active_constraint_count > self.constraint_count() {
            return Err(BlueprintError::IndexOutOfBounds {
                what: "active constraint count",
                index: self.active_constraint_count,
                len: self.constraint_count(),
            });
        }
        Ok(())
    }

    pub fn center_particle(&self, idx: usize) -> Option<u32> {
        self.constraint(idx).map(|c| c[0])
    }

    pub fn particle_indices(&self) -> &[u32] {
        &self.particle_indices
    }

    pub fn first_index(&self) -> &[u32] {
        &self.first_index
    }

    pub fn num_indices(&self) -> &[u32] {
        &self.num_indices
    }

    pub fn active_constraints(&self) -> impl Iterator<Item = &[u32]> + '_ {
        (0..self.active_constraint_count).filter_map(|idx| self.constraint(idx))
    }

    pub(crate) fn swap_particles(&mut self, a: u32, b: u32) {
        swap_indices(&mut self.particle_indices, a, b);
    }
}

/// All shape-matching constraints of a blueprint, one batch per color.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeMatchingConstraints {
    batches: Vec<ShapeMatchingBatch>,
}

impl ShapeMatchingConstraints {
    pub fn batches(&self) -> &[ShapeMatchingBatch] {
        &self.batches
    }

    pub fn batch(&self, idx: usize) -> Option<&ShapeMatchingBatch> {
        self.batches.get(idx)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn add_batch(&mut self, batch: ShapeMatchingBatch) {
        self.batches.push(batch);
    }

    /// The batch for `color`, creating empty batches up to it.
    pub fn batch_for_color(&mut self, color: usize) -> &mut ShapeMatchingBatch {
        if color >= self.batches.len() {
            self.batches.resize_with(color + 1, Default::default);
        }
        &mut self.batches[color]
    }

    pub fn constraint_count(&self) -> usize {
        self.batches.iter().map(|b| b.constraint_count()).sum()
    }

    pub fn active_constraint_count(&self) -> usize {
        self.batches.iter().map(|b| b.active_constraint_count()).sum()
    }

    pub fn activate_all(&mut self) {
        for batch in &mut self.batches {
            batch.active_constraint_count = batch.constraint_count();
        }
    }

    /// `(batch, index within batch, particles)` of every active constraint,
    /// in batch order.
    pub fn iter_active(&self) -> impl Iterator<Item = (usize, usize, &[u32])> + '_ {
        self.batches.iter().enumerate().flat_map(|(b, batch)| {
            batch
                .active_constraints()
                .enumerate()
                .map(move |(i, c)| (b, i, c))
        })
    }

    pub(crate) fn swap_particles(&mut self, a: u32, b: u32) {
        for batch in &mut self.batches {
            batch.swap_particles(a, b);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PinBatch {
    particle_indices: Vec<u32>,
    offsets: Vec<Vec3>,
    stiffnesses: Vec<f32>,
}

impl PinBatch {
    pub fn add_constraint(&mut self, particle: u32, offset: Vec3, stiffness: f32) {
        self.particle_indices.push(particle);
        self.offsets.push(offset);
        self.stiffnesses.push(stiffness);
    }

    pub fn constraint_count(&self) -> usize {
        self.particle_indices.len()
    }

    pub fn particle_indices(&self) -> &[u32] {
        &self.particle_indices
    }

    pub fn offset(&self, idx: usize) -> Option<Vec3> {
        self.offsets.get(idx).copied()
    }

    pub fn stiffness(&self, idx: usize) -> Option<f32> {
        self.stiffnesses.get(idx).copied()
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.particle_indices.len();
        let lens = [
            ("offsets", self.offsets.len()),
            ("stiffnesses", self.stiffnesses.len()),
        ];
        for (array, len) in lens {
            if len != expected {
                return Err(BlueprintError::InconsistentParticleArrays {
                    array,
                    len,
                    expected,
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinConstraints {
    batches: Vec<PinBatch>,
}

impl Default for PinConstraints {
    /// A single empty batch.
    fn default() -> Self {
        Self {
            batches: vec![PinBatch::default()],
        }
    }
}

impl PinConstraints {
    pub fn batches(&self) -> &[PinBatch] {
        &self.batches
    }

    pub fn batches_mut(&mut self) -> &mut [PinBatch] {
        &mut self.batches
    }

    pub fn constraint_count(&self) -> usize {
        self.batches.iter().map(|b| b.constraint_count()).sum()
    }

    pub(crate) fn swap_particles(&mut self, a: u32, b: u32) {
        for batch in &mut self.batches {
            swap_indices(&mut batch.particle_indices, a, b);
        }
    }
}

/// Renames `a` to `b` and `b` to `a` throughout `indices`.
pub(crate) fn swap_indices(indices: &mut [u32], a: u32, b: u32) {
    for idx in indices.iter_mut() {
        if *idx == a {
            *idx = b;
        } else if *idx == b {
            *idx = a;
        }
    }
}
