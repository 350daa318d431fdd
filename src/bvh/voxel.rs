//! Sphere/voxel overlap arithmetic shared by every pass.
//!
//! All coordinates are in small-voxel units relative to the world origin.
//! A sphere overlaps a voxel when the closest point of the closed voxel box
//! lies strictly inside the sphere, so a sphere that only touches a face is
//! not referenced by the neighbor. Counting, scattering and
//! [`SparseIndex::validate`](super::SparseIndex::validate) all go through
//! these functions, which keeps their answers identical.

use glam::{UVec3, Vec3};

/// Inclusive range of small voxels a sphere may touch, clamped to a grid of
/// `dims` small voxels. `None` when the range is empty.
#[inline]
#[must_use]
pub fn small_voxel_range(
    center: Vec3,
    radius: f32,
    dims: UVec3,
) -> Option<(UVec3, UVec3)> {
    if dims.cmpeq(UVec3::ZERO).any() {
        return None;
    }
    let lo = (center - radius).floor();
    let hi = (center + radius).ceil() - 1.0;
    let max = (dims - 1).as_vec3();
    if hi.cmplt(Vec3::ZERO).any() || lo.cmpgt(max).any() || lo.cmpgt(hi).any()
    {
        return None;
    }
    let lo = lo.clamp(Vec3::ZERO, max).as_uvec3();
    let hi = hi.clamp(Vec3::ZERO, max).as_uvec3();
    Some((lo, hi))
}

/// Whether a sphere strictly overlaps the box `[lo, hi]`.
#[inline]
#[must_use]
pub fn sphere_overlaps_box(
    center: Vec3,
    radius_squared: f32,
    lo: Vec3,
    hi: Vec3,
) -> bool {
    let closest = center.clamp(lo, hi);
    center.distance_squared(closest) < radius_squared
}

/// Whether a sphere overlaps the unit small voxel at `voxel`.
#[inline]
#[must_use]
pub fn overlaps_small_voxel(
    center: Vec3,
    radius_squared: f32,
    voxel: UVec3,
) -> bool {
    let lo = voxel.as_vec3();
    sphere_overlaps_box(center, radius_squared, lo, lo + 1.0)
}

/// Call `f` with every small voxel inside large cell `cell` that the sphere
/// overlaps. `range` is the sphere's [`small_voxel_range`]; `ratio` is the
/// number of small voxels per large voxel along one axis.
#[inline]
pub fn for_each_small_voxel_in_cell(
    center: Vec3,
    radius_squared: f32,
    range: (UVec3, UVec3),
    cell: UVec3,
    ratio: u32,
    mut f: impl FnMut(UVec3),
) {
    let cell_lo = cell * ratio;
    let cell_hi = cell_lo + (ratio - 1);
    let lo = range.0.max(cell_lo);
    let hi = range.1.min(cell_hi);
    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let voxel = UVec3::new(x, y, z);
                if overlaps_small_voxel(center, radius_squared, voxel) {
                    f(voxel);
                }
            }
        }
    }
}

/// Large cells covered by a small-voxel range.
#[inline]
#[must_use]
pub fn large_cell_range(range: (UVec3, UVec3), ratio: u32) -> (UVec3, UVec3) {
    (range.0 / ratio, range.1 / ratio)
}

/// Call `f(cell, small_voxels)` for every large cell the sphere overlaps,
/// where `small_voxels` is the number of overlapped small voxels inside it.
///
/// A sphere overlaps a large cell exactly when it overlaps one of the cell's
/// small voxels, so cells with no overlapped small voxel are skipped.
#[inline]
pub fn for_each_overlapped_large_cell(
    center: Vec3,
    radius: f32,
    small_dims: UVec3,
    ratio: u32,
    mut f: impl FnMut(UVec3, u32),
) {
    let Some(range) = small_voxel_range(center, radius, small_dims) else {
        return;
    };
    let radius_squared = radius * radius;
    let (lo, hi) = large_cell_range(range, ratio);
    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let cell = UVec3::new(x, y, z);
                let mut count = 0;
                for_each_small_voxel_in_cell(
                    center,
                    radius_squared,
                    range,
                    cell,
                    ratio,
                    |_| count += 1,
                );
                if count > 0 {
                    f(cell, count);
                }
            }
        }
    }
}
