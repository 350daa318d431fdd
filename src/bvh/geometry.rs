//! Grid origin and dimensions derived from the world box.

use glam::{I16Vec3, IVec3, UVec3, Vec3};
use serde::Serialize;

use super::bounding_box::BoundingBox;
use crate::error::{BuildError, Stage};
use crate::options::Options;

/// Integer grid placement of the frame, in large-voxel units.
///
/// Read-only to every pass once derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridGeometry {
    /// Minimum corner of the grid.
    pub world_origin: I16Vec3,
    /// Large voxels along each axis.
    pub world_dimensions: I16Vec3,
    /// Large voxel width in nm.
    pub large_voxel_width: f32,
    /// Small voxel width in nm.
    pub small_voxel_width: f32,
    /// Small voxels per large voxel along one axis.
    pub small_cells_per_axis: u32,
}

impl GridGeometry {
    /// `origin = min / width`, `dimensions = (max - min) / width`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ResourceExhaustion`] if an axis spans more
    /// than `max_large_cells_per_axis` large voxels, or
    /// [`BuildError::InvariantViolation`] for an empty grid or an origin
    /// outside 16 bits.
    pub fn from_bounds(
        world: &BoundingBox,
        options: &Options,
    ) -> Result<Self, BuildError> {
        let width = options.grid.large_voxel_width;
        let origin = (world.min / width).round();
        let dimensions = ((world.max - world.min) / width).round();
        let limit = options.limits.max_large_cells_per_axis;
        if dimensions.cmplt(Vec3::ONE).any() {
            return Err(BuildError::invariant(
                Stage::GridArguments,
                format!("grid dimensions {dimensions:?} are empty"),
            ));
        }
        if dimensions.max_element() > limit as f32 {
            return Err(BuildError::exhausted(
                Stage::GridArguments,
                "large cells per axis",
                dimensions.max_element() as u64,
                u64::from(limit),
            ));
        }
        if origin.abs().max_element() > f32::from(i16::MAX) {
            return Err(BuildError::invariant(
                Stage::GridArguments,
                format!("grid origin {origin:?} does not fit 16 bits"),
            ));
        }
        let geometry = Self {
            world_origin: origin.as_i16vec3(),
            world_dimensions: dimensions.as_i16vec3(),
            large_voxel_width: width,
            small_voxel_width: options.grid.small_voxel_width,
            small_cells_per_axis: options.small_cells_per_axis(),
        };
        log::debug!(
            "grid origin {:?}, dimensions {:?}",
            geometry.world_origin,
            geometry.world_dimensions
        );
        Ok(geometry)
    }

    /// Large voxels along each axis.
    #[inline]
    #[must_use]
    pub fn dimensions(&self) -> UVec3 {
        self.world_dimensions.as_uvec3()
    }

    /// Small voxels along each axis of the whole grid.
    #[inline]
    #[must_use]
    pub fn small_dimensions(&self) -> UVec3 {
        self.dimensions() * self.small_cells_per_axis
    }

    /// Total large voxels in the dense grid.
    #[must_use]
    pub fn large_cell_count(&self) -> usize {
        let d = self.dimensions();
        d.x as usize * d.y as usize * d.z as usize
    }

    /// Small voxels per large voxel.
    #[must_use]
    pub fn small_cells_per_large(&self) -> usize {
        (self.small_cells_per_axis as usize).pow(3)
    }

    /// Grid origin in nm.
    #[must_use]
    pub fn origin_nm(&self) -> Vec3 {
        self.world_origin.as_vec3() * self.large_voxel_width
    }

    /// `x + y * dx + z * dx * dy` for a large cell.
    #[inline]
    #[must_use]
    pub fn linear_index(&self, cell: UVec3) -> usize {
        let d = self.dimensions();
        cell.x as usize
            + cell.y as usize * d.x as usize
            + cell.z as usize * d.x as usize * d.y as usize
    }

    /// Inverse of [`GridGeometry::linear_index`].
    #[inline]
    #[must_use]
    pub fn cell_coordinates(&self, index: usize) -> UVec3 {
        let d = self.dimensions();
        let (dx, dy) = (d.x as usize, d.y as usize);
        UVec3::new(
            (index % dx) as u32,
            (index / dx % dy) as u32,
            (index / (dx * dy)) as u32,
        )
    }

    /// Index of a small voxel inside its large voxel.
    #[inline]
    #[must_use]
    pub fn local_small_index(&self, local: UVec3) -> usize {
        let s = self.small_cells_per_axis as usize;
        local.x as usize + local.y as usize * s + local.z as usize * s * s
    }

    /// Position in small-voxel units relative to the grid origin.
    #[inline]
    #[must_use]
    pub fn to_small_units(&self, position: Vec3) -> Vec3 {
        (position - self.origin_nm()) / self.small_voxel_width
    }

    /// Large cell containing `position` (nm), if inside the grid.
    #[must_use]
    pub fn large_cell_at(&self, position: Vec3) -> Option<UVec3> {
        self.small_voxel_at(position)
            .map(|v| v / self.small_cells_per_axis)
    }

    /// Small voxel containing `position` (nm), if inside the grid.
    #[must_use]
    pub fn small_voxel_at(&self, position: Vec3) -> Option<UVec3> {
        let v = self.to_small_units(position).floor();
        let dims = self.small_dimensions().as_vec3();
        if v.cmplt(Vec3::ZERO).any() || v.cmpge(dims).any() {
            return None;
        }
        Some(v.as_uvec3())
    }

    /// Convert absolute large-voxel coordinates to grid-local ones.
    #[must_use]
    pub fn to_local(&self, absolute: IVec3) -> Option<UVec3> {
        let local = absolute - self.world_origin.as_ivec3();
        let dims = self.dimensions().as_ivec3();
        if local.cmplt(IVec3::ZERO).any() || local.cmpge(dims).any() {
            return None;
        }
        Some(local.as_uvec3())
    }
}
