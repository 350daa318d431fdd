//! Global atomic counters and the per-frame reset.
//!
//! Allocation cursors start at 1 so that 0 always means "never written".
//! Occupancy counts start at 0. Occupied bounds start inverted so the first
//! atomic min/max replaces them.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use glam::{IVec3, UVec3};

use super::buffers::BufferSet;
use super::geometry::GridGeometry;
use crate::compute::ComputeBackend;

/// Counters shared by every pass of one frame.
#[derive(Debug)]
pub struct GlobalCounters {
    pub(crate) occupied_min: [AtomicI32; 3],
    pub(crate) occupied_max: [AtomicI32; 3],
    pub(crate) slot_cursor: AtomicU32,
    pub(crate) large_reference_cursor: AtomicU32,
    pub(crate) small_reference_cursor: AtomicU32,
    pub(crate) large_reference_total: AtomicU64,
    pub(crate) small_reference_total: AtomicU64,
}

/// Plain copy of [`GlobalCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Minimum occupied large cell (grid-local), inverted when none.
    pub occupied_min: IVec3,
    /// Maximum occupied large cell (grid-local), inverted when none.
    pub occupied_max: IVec3,
    /// Next compacted slot.
    pub slot_cursor: u32,
    /// Next free large-reference index.
    pub large_reference_cursor: u32,
    /// Next free small-reference index.
    pub small_reference_cursor: u32,
    /// Large references counted so far.
    pub large_reference_total: u64,
    /// Small references counted so far.
    pub small_reference_total: u64,
}

impl Default for GlobalCounters {
    fn default() -> Self {
        let counters = Self {
            occupied_min: Default::default(),
            occupied_max: Default::default(),
            slot_cursor: AtomicU32::new(0),
            large_reference_cursor: AtomicU32::new(0),
            small_reference_cursor: AtomicU32::new(0),
            large_reference_total: AtomicU64::new(0),
            small_reference_total: AtomicU64::new(0),
        };
        counters.reset();
        counters
    }
}

impl GlobalCounters {
    /// Restore the documented sentinels.
    pub fn reset(&self) {
        for axis in 0..3 {
            self.occupied_min[axis].store(i32::MAX, Ordering::Relaxed);
            self.occupied_max[axis].store(i32::MIN, Ordering::Relaxed);
        }
        self.slot_cursor.store(1, Ordering::Relaxed);
        self.large_reference_cursor.store(1, Ordering::Relaxed);
        self.small_reference_cursor.store(1, Ordering::Relaxed);
        self.large_reference_total.store(0, Ordering::Relaxed);
        self.small_reference_total.store(0, Ordering::Relaxed);
    }

    /// Widen the occupied bounds to include `cell`.
    #[inline]
    pub(crate) fn record_occupied(&self, cell: UVec3) {
        let cell = cell.as_ivec3();
        for axis in 0..3 {
            let _ = self.occupied_min[axis].fetch_min(cell[axis], Ordering::Relaxed);
            let _ = self.occupied_max[axis].fetch_max(cell[axis], Ordering::Relaxed);
        }
    }

    /// Copy out the current values.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |a: &[AtomicI32; 3]| {
            IVec3::new(
                a[0].load(Ordering::Relaxed),
                a[1].load(Ordering::Relaxed),
                a[2].load(Ordering::Relaxed),
            )
        };
        CounterSnapshot {
            occupied_min: load(&self.occupied_min),
            occupied_max: load(&self.occupied_max),
            slot_cursor: self.slot_cursor.load(Ordering::Relaxed),
            large_reference_cursor: self
                .large_reference_cursor
                .load(Ordering::Relaxed),
            small_reference_cursor: self
                .small_reference_cursor
                .load(Ordering::Relaxed),
            large_reference_total: self
                .large_reference_total
                .load(Ordering::Relaxed),
            small_reference_total: self
                .small_reference_total
                .load(Ordering::Relaxed),
        }
    }
}

/// Reset the counters and the dense large-grid metadata of `buffers`.
///
/// Only touches the set it is handed; the ring guarantees no other frame
/// holds it.
pub fn reset_counters<B: ComputeBackend>(
    backend: &B,
    buffers: &mut BufferSet,
    geometry: &GridGeometry,
) {
    buffers.counters.reset();
    buffers.fault.clear();
    let cells = geometry.large_cell_count();
    let _ = buffers.large_atom_counts.ensure(cells);
    let _ = buffers.large_small_counts.ensure(cells);
    let _ = buffers.large_slots.ensure(cells);

    let buffers = &*buffers;
    backend.dispatch(cells, |i| {
        buffers.large_atom_counts.store(i, 0);
        buffers.large_small_counts.store(i, 0);
        buffers.large_slots.store(i, 0);
    });
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::bvh::bounding_box::BoundingBox;
    use crate::compute::SerialBackend;
    use crate::options::Options;

    #[test]
    fn reset_restores_sentinels_regardless_of_prior_contents() {
        let geometry = GridGeometry::from_bounds(
            &BoundingBox {
                min: Vec3::ZERO,
                max: Vec3::splat(4.0),
            },
            &Options::default(),
        )
        .unwrap();
        let mut buffers = BufferSet::new();
        reset_counters(&SerialBackend, &mut buffers, &geometry);
        let clean = buffers.counters.snapshot();

        buffers.counters.slot_cursor.store(77, Ordering::Relaxed);
        let _ = buffers
            .counters
            .small_reference_total
            .fetch_add(12, Ordering::Relaxed);
        buffers.counters.record_occupied(UVec3::new(1, 0, 1));
        for i in 0..geometry.large_cell_count() {
            buffers.large_atom_counts.store(i, 9);
            buffers.large_slots.store(i, 3);
        }

        reset_counters(&SerialBackend, &mut buffers, &geometry);
        let snapshot = buffers.counters.snapshot();
        assert_eq!(snapshot, clean);
        assert_eq!(snapshot.slot_cursor, 1);
        assert_eq!(snapshot.large_reference_cursor, 1);
        assert_eq!(snapshot.small_reference_cursor, 1);
        assert_eq!(snapshot.large_reference_total, 0);
        assert_eq!(snapshot.occupied_min, IVec3::splat(i32::MAX));
        assert_eq!(snapshot.occupied_max, IVec3::splat(i32::MIN));
        assert!(buffers
            .large_atom_counts
            .as_slice()
            .iter()
            .all(|c| c.load(Ordering::Relaxed) == 0));
        assert!((0..geometry.large_cell_count())
            .all(|i| buffers.large_slots.load(i) == 0));
    }

    #[test]
    fn occupied_bounds_widen() {
        let counters = GlobalCounters::default();
        counters.record_occupied(UVec3::new(3, 1, 4));
        counters.record_occupied(UVec3::new(1, 5, 9));
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.occupied_min, IVec3::new(1, 1, 4));
        assert_eq!(snapshot.occupied_max, IVec3::new(3, 5, 9));
    }
}
