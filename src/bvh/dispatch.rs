//! Work sizes for the small-cell passes, derived from the large-cell counters.
//!
//! The small level only iterates occupied cells, so its thread counts depend
//! on data the large level just produced. This stage reads those counters
//! back, cross-checks them, and hands the renderer the bounds of the
//! occupied region.

use glam::IVec3;
use serde::Serialize;

use super::buffers::BufferSet;
use super::geometry::GridGeometry;
use crate::error::{BuildError, Stage};

/// Inclusive bounds of the occupied large cells, in absolute large-voxel
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OccupiedBounds {
    /// Minimum occupied cell.
    pub min: IVec3,
    /// Maximum occupied cell.
    pub max: IVec3,
}

/// Data-dependent sizes for the remaining passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchArguments {
    /// Occupied large cells (compacted slots `1..=n`).
    pub occupied_large_cells: u32,
    /// Threads for the per-small-cell passes: occupied cells times `S³`.
    pub small_cell_threads: u32,
    /// Entries in the large-reference pool.
    pub large_reference_count: u32,
    /// Entries in the small-reference pool.
    pub small_reference_count: u32,
    /// Occupied region, `None` when no atom touches the grid.
    pub occupied_bounds: Option<OccupiedBounds>,
}

/// Read back the large-cell counters and size the small-cell passes.
///
/// # Errors
///
/// Returns [`BuildError::InvariantViolation`] if the reserved pool
/// cursors disagree with the Pass A totals, or
/// [`BuildError::ResourceExhaustion`] if the small-cell thread count
/// does not fit 32 bits.
pub fn size_dispatch(
    buffers: &BufferSet,
    geometry: &GridGeometry,
) -> Result<DispatchArguments, BuildError> {
    let snapshot = buffers.counters.snapshot();
    let occupied = snapshot.slot_cursor.checked_sub(1).ok_or_else(|| {
        BuildError::invariant(Stage::DispatchSizing, "slot cursor below 1")
    })?;
    let large_reference_count = snapshot.large_reference_cursor.saturating_sub(1);
    let small_reference_count = snapshot.small_reference_cursor.saturating_sub(1);
    if u64::from(large_reference_count) != snapshot.large_reference_total {
        return Err(BuildError::invariant(
            Stage::DispatchSizing,
            format!(
                "reserved {} large references, counted {}",
                large_reference_count, snapshot.large_reference_total
            ),
        ));
    }
    if u64::from(small_reference_count) != snapshot.small_reference_total {
        return Err(BuildError::invariant(
            Stage::DispatchSizing,
            format!(
                "reserved {} small references, counted {}",
                small_reference_count, snapshot.small_reference_total
            ),
        ));
    }
    let per_cell = geometry.small_cells_per_large() as u64;
    let threads = u64::from(occupied) * per_cell;
    let small_cell_threads = u32::try_from(threads).map_err(|_| {
        BuildError::exhausted(
            Stage::DispatchSizing,
            "small cell threads",
            threads,
            u64::from(u32::MAX),
        )
    })?;

    let occupied_bounds = (occupied > 0).then(|| {
        let origin = geometry.world_origin.as_ivec3();
        OccupiedBounds {
            min: origin + snapshot.occupied_min,
            max: origin + snapshot.occupied_max,
        }
    });
    let arguments = DispatchArguments {
        occupied_large_cells: occupied,
        small_cell_threads,
        large_reference_count,
        small_reference_count,
        occupied_bounds,
    };
    log::debug!("dispatch arguments: {arguments:?}");
    Ok(arguments)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use glam::{UVec3, Vec3};

    use super::*;
    use crate::bvh::bounding_box::BoundingBox;
    use crate::options::Options;

    fn geometry() -> GridGeometry {
        GridGeometry::from_bounds(
            &BoundingBox {
                min: Vec3::splat(-4.0),
                max: Vec3::splat(4.0),
            },
            &Options::default(),
        )
        .unwrap()
    }

    #[test]
    fn sizes_follow_counters() {
        let buffers = BufferSet::new();
        let c = &buffers.counters;
        c.slot_cursor.store(4, Ordering::Relaxed);
        c.large_reference_cursor.store(11, Ordering::Relaxed);
        c.large_reference_total.store(10, Ordering::Relaxed);
        c.small_reference_cursor.store(31, Ordering::Relaxed);
        c.small_reference_total.store(30, Ordering::Relaxed);
        c.record_occupied(UVec3::new(0, 1, 2));
        c.record_occupied(UVec3::new(3, 1, 0));

        let args = size_dispatch(&buffers, &geometry()).unwrap();
        assert_eq!(args.occupied_large_cells, 3);
        assert_eq!(args.small_cell_threads, 3 * 512);
        assert_eq!(args.large_reference_count, 10);
        assert_eq!(args.small_reference_count, 30);
        let bounds = args.occupied_bounds.unwrap();
        assert_eq!(bounds.min, IVec3::new(-2, -1, -2));
        assert_eq!(bounds.max, IVec3::new(1, -1, 0));
    }

    #[test]
    fn mismatched_totals_are_an_invariant_violation() {
        let buffers = BufferSet::new();
        let c = &buffers.counters;
        c.slot_cursor.store(2, Ordering::Relaxed);
        c.large_reference_cursor.store(3, Ordering::Relaxed);
        c.large_reference_total.store(5, Ordering::Relaxed);
        let err = size_dispatch(&buffers, &geometry()).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::DispatchSizing));
    }

    #[test]
    fn empty_grid_has_no_bounds() {
        let buffers = BufferSet::new();
        let args = size_dispatch(&buffers, &geometry()).unwrap();
        assert_eq!(args.occupied_large_cells, 0);
        assert_eq!(args.small_cell_threads, 0);
        assert!(args.occupied_bounds.is_none());
    }
}
