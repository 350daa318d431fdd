//! Coarse level: count, compact, fill.
//!
//! Pass A counts, per large cell, the atoms touching it and the small voxels
//! they touch inside it. Pass B walks the dense grid and gives every
//! occupied cell a compacted slot plus a region in each reference pool by
//! atomic fetch-add. Pass C writes every atom into the atom list of each cell
//! it touches, so the small level can run one task per occupied cell.

use std::sync::atomic::Ordering;

use super::buffers::BufferSet;
use super::fault::Fault;
use super::geometry::GridGeometry;
use super::voxel::for_each_overlapped_large_cell;
use crate::compute::ComputeBackend;
use crate::error::{BuildError, Stage};
use crate::options::LimitOptions;

/// Pass A: per-cell atom and small-reference counts.
pub fn count_large_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &BufferSet,
    geometry: &GridGeometry,
) {
    let small_dims = geometry.small_dimensions();
    let ratio = geometry.small_cells_per_axis;
    let counters = &buffers.counters;
    backend.dispatch(buffers.atoms.len(), |i| {
        let atom = buffers.atoms[i];
        let mut large_total = 0_u64;
        let mut small_total = 0_u64;
        for_each_overlapped_large_cell(
            atom.center(),
            atom.radius,
            small_dims,
            ratio,
            |cell, small| {
                let index = geometry.linear_index(cell);
                let _ = buffers.large_atom_counts.fetch_add(index, 1);
                let _ = buffers.large_small_counts.fetch_add(index, small);
                counters.record_occupied(cell);
                large_total += 1;
                small_total += u64::from(small);
            },
        );
        if large_total > 0 {
            let _ = counters
                .large_reference_total
                .fetch_add(large_total, Ordering::Relaxed);
            let _ = counters
                .small_reference_total
                .fetch_add(small_total, Ordering::Relaxed);
        }
    });
}

/// Size the reference pools and the occupied table from the Pass A totals.
fn size_pools(
    buffers: &mut BufferSet,
    geometry: &GridGeometry,
    limits: &LimitOptions,
) -> Result<(), BuildError> {
    let snapshot = buffers.counters.snapshot();
    let small_cap = u64::from(limits.max_small_references);
    if snapshot.small_reference_total >= small_cap {
        return Err(BuildError::exhausted(
            Stage::LargeCellCount,
            "small references",
            snapshot.small_reference_total,
            small_cap,
        ));
    }
    // Every large reference also owns at least one small reference.
    if snapshot.large_reference_total > snapshot.small_reference_total {
        return Err(BuildError::invariant(
            Stage::LargeCellCount,
            format!(
                "{} large references exceed {} small references",
                snapshot.large_reference_total,
                snapshot.small_reference_total
            ),
        ));
    }
    let _ = buffers
        .large_references
        .ensure(snapshot.large_reference_total as usize + 1);
    let _ = buffers
        .small_references
        .ensure(snapshot.small_reference_total as usize + 1);

    let table = (limits.max_occupied_large_cells as usize)
        .min(geometry.large_cell_count())
        + 1;
    let _ = buffers.occupied_cells.ensure(table);
    let _ = buffers.occupied_atom_offsets.ensure(table);
    let _ = buffers.occupied_atom_cursors.ensure(table);
    let _ = buffers.occupied_small_offsets.ensure(table);
    let _ = buffers.occupied_small_cursors.ensure(table);
    Ok(())
}

/// Pass B: stream compaction of the dense grid.
///
/// # Errors
///
/// Returns [`BuildError::ResourceExhaustion`] when more cells are
/// occupied than `max_occupied_large_cells`, or
/// [`BuildError::InvariantViolation`] if a reservation overran a pool.
pub fn compact_large_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &BufferSet,
    geometry: &GridGeometry,
    limits: &LimitOptions,
) -> Result<u32, BuildError> {
    let counters = &buffers.counters;
    let table = buffers.occupied_cells.len() as u64;
    let large_pool = buffers.large_references.len() as u64;
    let small_pool = buffers.small_references.len() as u64;
    let capacity = u64::from(limits.max_occupied_large_cells);
    backend.dispatch(geometry.large_cell_count(), |index| {
        let atoms = buffers.large_atom_counts.load(index);
        if atoms == 0 {
            return;
        }
        let smalls = buffers.large_small_counts.load(index);
        let slot = counters.slot_cursor.fetch_add(1, Ordering::Relaxed);
        if u64::from(slot) >= table {
            buffers.fault.record(
                Fault::OccupiedCellsExhausted,
                u64::from(slot),
                capacity,
            );
            return;
        }
        let slot_index = slot as usize;
        let atom_offset = counters
            .large_reference_cursor
            .fetch_add(atoms, Ordering::Relaxed);
        let small_offset = counters
            .small_reference_cursor
            .fetch_add(smalls, Ordering::Relaxed);
        let atom_end = u64::from(atom_offset) + u64::from(atoms);
        let small_end = u64::from(small_offset) + u64::from(smalls);
        if atom_end > large_pool {
            buffers
                .fault
                .record(Fault::ReferencePoolOverrun, atom_end, large_pool);
            return;
        }
        if small_end > small_pool {
            buffers
                .fault
                .record(Fault::ReferencePoolOverrun, small_end, small_pool);
            return;
        }
        buffers.large_slots.store(index, slot);
        buffers.occupied_cells.store(slot_index, index as u32);
        buffers.occupied_atom_offsets.store(slot_index, atom_offset);
        buffers.occupied_atom_cursors.store(slot_index, atom_offset);
        buffers.occupied_small_offsets.store(slot_index, small_offset);
        buffers.occupied_small_cursors.store(slot_index, small_offset);
    });

    let occupied = counters.slot_cursor.load(Ordering::Relaxed) - 1;
    if u64::from(occupied) > capacity {
        buffers.fault.clear();
        return Err(BuildError::exhausted(
            Stage::LargeCellCompact,
            "occupied large cells",
            u64::from(occupied),
            capacity,
        ));
    }
    buffers.fault.check(Stage::LargeCellCompact)?;
    Ok(occupied)
}

/// Pass C: per-cell atom lists.
///
/// # Errors
///
/// Returns [`BuildError::InvariantViolation`] if an atom's cell has no
/// slot or a cell's region overflows.
pub fn fill_large_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &BufferSet,
    geometry: &GridGeometry,
) -> Result<(), BuildError> {
    let small_dims = geometry.small_dimensions();
    let ratio = geometry.small_cells_per_axis;
    backend.dispatch(buffers.atoms.len(), |i| {
        let atom = buffers.atoms[i];
        for_each_overlapped_large_cell(
            atom.center(),
            atom.radius,
            small_dims,
            ratio,
            |cell, _| {
                let index = geometry.linear_index(cell);
                let slot = buffers.large_slots.load(index) as usize;
                if slot == 0 {
                    buffers.fault.record(Fault::MissingSlot, index as u64, 0);
                    return;
                }
                let end = u64::from(buffers.occupied_atom_offsets.load(slot))
                    + u64::from(buffers.large_atom_counts.load(index));
                let position = buffers.occupied_atom_cursors.fetch_add(slot, 1);
                if u64::from(position) >= end {
                    buffers.fault.record(
                        Fault::RegionOverrun,
                        u64::from(position),
                        end,
                    );
                    return;
                }
                buffers.large_references.store(position as usize, i as u32);
            },
        );
    });
    buffers.fault.check(Stage::LargeCellFill)
}

/// Passes A to C, returning the occupied-cell count.
///
/// # Errors
///
/// Returns [`BuildError::ResourceExhaustion`] when the small-reference
/// total reaches `max_small_references` or the occupied cells exceed
/// their limit, and [`BuildError::InvariantViolation`] for impossible
/// counts.
pub fn build_large_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &mut BufferSet,
    geometry: &GridGeometry,
    limits: &LimitOptions,
) -> Result<u32, BuildError> {
    count_large_cells(backend, buffers, geometry);
    buffers.fault.check(Stage::LargeCellCount)?;
    size_pools(buffers, geometry, limits)?;
    let occupied = compact_large_cells(backend, buffers, geometry, limits)?;
    fill_large_cells(backend, buffers, geometry)?;
    log::debug!(
        "large cells: {} occupied of {}",
        occupied,
        geometry.large_cell_count()
    );
    Ok(occupied)
}
