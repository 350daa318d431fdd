//! Per-slot storage for one frame's index.

use super::convert::ConvertedAtom;
use super::counters::GlobalCounters;
use super::fault::FaultLatch;
use crate::compute::AtomicBuffer;

/// Everything a frame writes while building its index.
///
/// One set exists per ring slot. Large-grid arrays are dense over the grid;
/// occupied-table arrays are indexed by compacted slot (slot 0 unused);
/// small-cell arrays are indexed by `(slot - 1) * S³ + local`. Index 0 of
/// both reference pools is never written.
pub struct BufferSet {
    pub(crate) atoms: Vec<ConvertedAtom>,
    pub(crate) counters: GlobalCounters,
    pub(crate) fault: FaultLatch,

    pub(crate) large_atom_counts: AtomicBuffer,
    pub(crate) large_small_counts: AtomicBuffer,
    pub(crate) large_slots: AtomicBuffer,

    pub(crate) occupied_cells: AtomicBuffer,
    pub(crate) occupied_atom_offsets: AtomicBuffer,
    pub(crate) occupied_atom_cursors: AtomicBuffer,
    pub(crate) occupied_small_offsets: AtomicBuffer,
    pub(crate) occupied_small_cursors: AtomicBuffer,
    pub(crate) large_references: AtomicBuffer,

    pub(crate) small_counts: AtomicBuffer,
    pub(crate) small_offsets: AtomicBuffer,
    pub(crate) small_cursors: AtomicBuffer,
    pub(crate) small_references: AtomicBuffer,
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferSet {
    /// Empty set. Buffers are sized by the first frame that uses it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            atoms: Vec::new(),
            counters: GlobalCounters::default(),
            fault: FaultLatch::default(),
            large_atom_counts: AtomicBuffer::new("large atom counts"),
            large_small_counts: AtomicBuffer::new("large small counts"),
            large_slots: AtomicBuffer::new("large slots"),
            occupied_cells: AtomicBuffer::new("occupied cells"),
            occupied_atom_offsets: AtomicBuffer::new("occupied atom offsets"),
            occupied_atom_cursors: AtomicBuffer::new("occupied atom cursors"),
            occupied_small_offsets: AtomicBuffer::new(
                "occupied small offsets",
            ),
            occupied_small_cursors: AtomicBuffer::new(
                "occupied small cursors",
            ),
            large_references: AtomicBuffer::new("large references"),
            small_counts: AtomicBuffer::new("small counts"),
            small_offsets: AtomicBuffer::new("small offsets"),
            small_cursors: AtomicBuffer::new("small cursors"),
            small_references: AtomicBuffer::new("small references"),
        }
    }

    fn atomic_buffers(&self) -> [&AtomicBuffer; 13] {
        [
            &self.large_atom_counts,
            &self.large_small_counts,
            &self.large_slots,
            &self.occupied_cells,
            &self.occupied_atom_offsets,
            &self.occupied_atom_cursors,
            &self.occupied_small_offsets,
            &self.occupied_small_cursors,
            &self.large_references,
            &self.small_counts,
            &self.small_offsets,
            &self.small_cursors,
            &self.small_references,
        ]
    }

    /// Bytes currently allocated by this set.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        let atomics: usize = self
            .atomic_buffers()
            .iter()
            .map(|b| b.capacity() * std::mem::size_of::<u32>())
            .sum();
        atomics
            + self.atoms.capacity() * std::mem::size_of::<ConvertedAtom>()
    }

    /// Counter and sentinel values, for inspection.
    #[must_use]
    pub fn counters(&self) -> &GlobalCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_set_allocates_nothing() {
        let set = BufferSet::new();
        assert_eq!(set.allocated_bytes(), 0);
    }
}
