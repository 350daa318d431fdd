//! Fine level: a counting sort scoped to each occupied large cell.
//!
//! The count and scatter passes run one task per occupied large cell and walk
//! that cell's atom list; the allocate pass runs one task per small cell.
//! Small cells of slot `k` live at `(k - 1) * S³ ..`, and their references
//! land inside the region Pass B reserved for slot `k`.

use glam::UVec3;

use super::buffers::BufferSet;
use super::dispatch::DispatchArguments;
use super::fault::Fault;
use super::geometry::GridGeometry;
use super::voxel::{for_each_small_voxel_in_cell, small_voxel_range};
use crate::compute::ComputeBackend;
use crate::error::{BuildError, Stage};

/// Call `f(small_index, atom)` for every (atom, small voxel) overlap inside
/// occupied slot `slot`.
#[inline]
fn for_each_overlap_in_slot(
    buffers: &BufferSet,
    geometry: &GridGeometry,
    slot: usize,
    mut f: impl FnMut(usize, u32),
) {
    let ratio = geometry.small_cells_per_axis;
    let small_dims = geometry.small_dimensions();
    let cell_index = buffers.occupied_cells.load(slot) as usize;
    let cell = geometry.cell_coordinates(cell_index);
    let base = (slot - 1) * geometry.small_cells_per_large();
    let offset = buffers.occupied_atom_offsets.load(slot) as usize;
    let count = buffers.large_atom_counts.load(cell_index) as usize;
    let cell_origin = cell * ratio;
    for k in offset..offset + count {
        let atom_index = buffers.large_references.load(k);
        let atom = buffers.atoms[atom_index as usize];
        let center = atom.center();
        let Some(range) = small_voxel_range(center, atom.radius, small_dims)
        else {
            continue;
        };
        for_each_small_voxel_in_cell(
            center,
            atom.radius_squared(),
            range,
            cell,
            ratio,
            |voxel: UVec3| {
                let local = geometry.local_small_index(voxel - cell_origin);
                f(base + local, atom_index);
            },
        );
    }
}

/// Zero the small-cell metadata of the occupied cells.
pub fn clear_small_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &mut BufferSet,
    arguments: &DispatchArguments,
) {
    let threads = arguments.small_cell_threads as usize;
    let _ = buffers.small_counts.ensure(threads);
    let _ = buffers.small_offsets.ensure(threads);
    let _ = buffers.small_cursors.ensure(threads);
    let buffers = &*buffers;
    backend.dispatch(threads, |i| {
        buffers.small_counts.store(i, 0);
        buffers.small_offsets.store(i, 0);
        buffers.small_cursors.store(i, 0);
    });
}

/// Pass 1: references per small cell.
pub fn count_small_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &BufferSet,
    geometry: &GridGeometry,
    arguments: &DispatchArguments,
) {
    backend.dispatch(arguments.occupied_large_cells as usize, |t| {
        for_each_overlap_in_slot(buffers, geometry, t + 1, |small, _| {
            let _ = buffers.small_counts.fetch_add(small, 1);
        });
    });
}

/// Pass 2: carve each small cell's slice out of its large cell's region.
///
/// # Errors
///
/// Returns [`BuildError::InvariantViolation`] if a slice overflows its
/// large cell's region or a region is not handed out exactly.
pub fn allocate_small_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &BufferSet,
    geometry: &GridGeometry,
    arguments: &DispatchArguments,
) -> Result<(), BuildError> {
    let per_cell = geometry.small_cells_per_large();
    backend.dispatch(arguments.small_cell_threads as usize, |i| {
        let count = buffers.small_counts.load(i);
        if count == 0 {
            return;
        }
        let slot = i / per_cell + 1;
        let cell_index = buffers.occupied_cells.load(slot) as usize;
        let end = u64::from(buffers.occupied_small_offsets.load(slot))
            + u64::from(buffers.large_small_counts.load(cell_index));
        let offset = buffers.occupied_small_cursors.fetch_add(slot, count);
        if u64::from(offset) + u64::from(count) > end {
            buffers.fault.record(
                Fault::RegionOverrun,
                u64::from(offset) + u64::from(count),
                end,
            );
            return;
        }
        buffers.small_offsets.store(i, offset);
        buffers.small_cursors.store(i, offset);
    });
    buffers.fault.check(Stage::SmallCellAllocate)?;

    // Every large cell's region must be handed out exactly.
    backend.dispatch(arguments.occupied_large_cells as usize, |t| {
        let slot = t + 1;
        let cell_index = buffers.occupied_cells.load(slot) as usize;
        let offset = buffers.occupied_small_offsets.load(slot);
        let filled =
            buffers.occupied_small_cursors.load(slot).wrapping_sub(offset);
        if filled != buffers.large_small_counts.load(cell_index) {
            buffers.fault.record(
                Fault::IncompleteRegion,
                slot as u64,
                u64::from(filled),
            );
        }
    });
    buffers.fault.check(Stage::SmallCellAllocate)
}

/// Pass 3: write atom indices through each small cell's fill cursor.
///
/// # Errors
///
/// Returns [`BuildError::InvariantViolation`] if a cursor runs past
/// its slice.
pub fn scatter_small_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &BufferSet,
    geometry: &GridGeometry,
    arguments: &DispatchArguments,
) -> Result<(), BuildError> {
    backend.dispatch(arguments.occupied_large_cells as usize, |t| {
        for_each_overlap_in_slot(buffers, geometry, t + 1, |small, atom| {
            let end = u64::from(buffers.small_offsets.load(small))
                + u64::from(buffers.small_counts.load(small));
            let position = buffers.small_cursors.fetch_add(small, 1);
            if u64::from(position) >= end {
                buffers.fault.record(
                    Fault::RegionOverrun,
                    u64::from(position),
                    end,
                );
                return;
            }
            buffers.small_references.store(position as usize, atom);
        });
    });
    buffers.fault.check(Stage::SmallCellScatter)
}

/// Clear, count, allocate and scatter.
///
/// # Errors
///
/// Returns the first error of [`allocate_small_cells`] or
/// [`scatter_small_cells`].
pub fn build_small_cells<B: ComputeBackend>(
    backend: &B,
    buffers: &mut BufferSet,
    geometry: &GridGeometry,
    arguments: &DispatchArguments,
) -> Result<(), BuildError> {
    clear_small_cells(backend, buffers, arguments);
    count_small_cells(backend, buffers, geometry, arguments);
    buffers.fault.check(Stage::SmallCellCount)?;
    allocate_small_cells(backend, buffers, geometry, arguments)?;
    scatter_small_cells(backend, buffers, geometry, arguments)?;
    log::debug!(
        "small cells: {} threads, {} references",
        arguments.small_cell_threads,
        arguments.small_reference_count
    );
    Ok(())
}
