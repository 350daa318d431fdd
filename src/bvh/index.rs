//! Read-only view of a finished frame's index.
//!
//! A [`SparseIndex`] holds the frame's [`SlotLease`], so the ring cannot hand
//! its buffers to a later frame until the index is dropped.

use glam::{IVec3, UVec3, Vec3};
use rustc_hash::FxHashSet;
use serde::Serialize;

use super::dispatch::DispatchArguments;
use super::geometry::GridGeometry;
use super::voxel::overlaps_small_voxel;
use crate::error::{BuildError, Stage};
use crate::pipeline::SlotLease;

/// Compacted metadata of one occupied large cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LargeCellView {
    /// Grid-local large cell coordinate.
    pub cell: UVec3,
    /// Compacted slot, `1..=occupied`.
    pub slot: u32,
    /// Start of the cell's atom list in the large-reference pool.
    pub atom_offset: u32,
    /// Atoms touching the cell.
    pub atom_count: u32,
    /// Start of the cell's region in the small-reference pool.
    pub small_offset: u32,
    /// Small references inside the cell.
    pub small_count: u32,
}

/// Reference slice of one small cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SmallCellView {
    /// Start in the small-reference pool.
    pub offset: u32,
    /// Atoms overlapping the cell.
    pub count: u32,
}

/// Wall-clock durations of the build passes, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BuildTimings {
    /// Large-cell passes.
    pub build_large: f64,
    /// Dispatch sizing plus small-cell passes.
    pub build_small: f64,
}

/// One frame's two-level index.
pub struct SparseIndex {
    pub(crate) lease: SlotLease,
    pub(crate) geometry: GridGeometry,
    pub(crate) dispatch: DispatchArguments,
    pub(crate) timings: BuildTimings,
}

impl SparseIndex {
    /// Frame the index was built for.
    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.lease.frame_id()
    }

    /// Ring slot holding the buffers.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.lease.slot()
    }

    /// Grid placement.
    #[must_use]
    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Occupancy and pool sizes.
    #[must_use]
    pub fn dispatch(&self) -> &DispatchArguments {
        &self.dispatch
    }

    /// Durations of the build passes.
    #[must_use]
    pub fn timings(&self) -> BuildTimings {
        self.timings
    }

    /// Atoms indexed this frame.
    #[must_use]
    pub fn atom_count(&self) -> usize {
        self.lease.buffers().atoms.len()
    }

    /// Number of occupied large cells.
    #[must_use]
    pub fn occupied_large_cells(&self) -> u32 {
        self.dispatch.occupied_large_cells
    }

    fn view_of_slot(&self, slot: u32) -> LargeCellView {
        let buffers = self.lease.buffers();
        let s = slot as usize;
        let index = buffers.occupied_cells.load(s) as usize;
        LargeCellView {
            cell: self.geometry.cell_coordinates(index),
            slot,
            atom_offset: buffers.occupied_atom_offsets.load(s),
            atom_count: buffers.large_atom_counts.load(index),
            small_offset: buffers.occupied_small_offsets.load(s),
            small_count: buffers.large_small_counts.load(index),
        }
    }

    /// Occupied large cells in slot order.
    pub fn large_cells(&self) -> impl Iterator<Item = LargeCellView> + '_ {
        (1..=self.dispatch.occupied_large_cells).map(|s| self.view_of_slot(s))
    }

    /// Metadata of the large cell at grid-local `cell`, if occupied.
    #[must_use]
    pub fn large_cell(&self, cell: UVec3) -> Option<LargeCellView> {
        if cell.cmpge(self.geometry.dimensions()).any() {
            return None;
        }
        let index = self.geometry.linear_index(cell);
        let slot = self.lease.buffers().large_slots.load(index);
        (slot != 0).then(|| self.view_of_slot(slot))
    }

    /// Metadata of the large cell at absolute large-voxel coordinates.
    #[must_use]
    pub fn large_cell_absolute(&self, cell: IVec3) -> Option<LargeCellView> {
        self.geometry.to_local(cell).and_then(|c| self.large_cell(c))
    }

    fn small_index(&self, voxel: UVec3) -> Option<usize> {
        if voxel.cmpge(self.geometry.small_dimensions()).any() {
            return None;
        }
        let ratio = self.geometry.small_cells_per_axis;
        let cell = voxel / ratio;
        let index = self.geometry.linear_index(cell);
        let slot = self.lease.buffers().large_slots.load(index) as usize;
        if slot == 0 {
            return None;
        }
        let local = self.geometry.local_small_index(voxel - cell * ratio);
        Some((slot - 1) * self.geometry.small_cells_per_large() + local)
    }

    /// Reference slice of the small voxel at grid-local `voxel`, if any atom
    /// overlaps it.
    #[must_use]
    pub fn small_cell(&self, voxel: UVec3) -> Option<SmallCellView> {
        let i = self.small_index(voxel)?;
        let buffers = self.lease.buffers();
        let count = buffers.small_counts.load(i);
        (count > 0).then(|| SmallCellView {
            offset: buffers.small_offsets.load(i),
            count,
        })
    }

    /// Atoms overlapping the small voxel at grid-local `voxel`.
    pub fn atoms_in_small_voxel(
        &self,
        voxel: UVec3,
    ) -> impl Iterator<Item = u32> + '_ {
        let range = self
            .small_cell(voxel)
            .map(|c| c.offset as usize..(c.offset + c.count) as usize)
            .unwrap_or(0..0);
        let references = &self.lease.buffers().small_references;
        range.map(move |k| references.load(k))
    }

    /// Atoms overlapping the small voxel containing `position` (nm).
    #[must_use]
    pub fn atoms_near(&self, position: Vec3) -> Vec<u32> {
        match self.geometry.small_voxel_at(position) {
            Some(voxel) => self.atoms_in_small_voxel(voxel).collect(),
            None => Vec::new(),
        }
    }

    /// Atoms overlapping any small voxel that intersects the box
    /// `[min, max]` (nm), sorted and deduplicated.
    #[must_use]
    pub fn atoms_in_region(&self, min: Vec3, max: Vec3) -> Vec<u32> {
        let Some((first, last)) = self.voxels_in_box(min.min(max), min.max(max))
        else {
            return Vec::new();
        };
        let mut seen = FxHashSet::default();
        for z in first.z..=last.z {
            for y in first.y..=last.y {
                for x in first.x..=last.x {
                    seen.extend(self.atoms_in_small_voxel(UVec3::new(x, y, z)));
                }
            }
        }
        let mut atoms: Vec<u32> = seen.into_iter().collect();
        atoms.sort_unstable();
        atoms
    }

    /// Inclusive small-voxel range covering the box `[min, max]` (nm).
    fn voxels_in_box(&self, min: Vec3, max: Vec3) -> Option<(UVec3, UVec3)> {
        let limit = (self.geometry.small_dimensions() - 1).as_vec3();
        let first = self.geometry.to_small_units(min).floor();
        let last = self.geometry.to_small_units(max).floor();
        if last.cmplt(Vec3::ZERO).any() || first.cmpgt(limit).any() {
            return None;
        }
        Some((
            first.clamp(Vec3::ZERO, limit).as_uvec3(),
            last.clamp(Vec3::ZERO, limit).as_uvec3(),
        ))
    }

    /// Check the structural invariants of the index.
    ///
    /// Slots form a permutation of `1..=occupied`, reserved regions in both
    /// pools tile them without overlap, every fill cursor reached the end of
    /// its region, and every reference lands in a voxel its atom overlaps.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvariantViolation`] describing the first
    /// broken invariant.
    pub fn validate(&self) -> Result<(), BuildError> {
        let fail = |reason: String| {
            Err(BuildError::invariant(Stage::SmallCellScatter, reason))
        };
        let buffers = self.lease.buffers();
        let occupied = self.dispatch.occupied_large_cells;
        let mut slots = FxHashSet::default();
        for index in 0..self.geometry.large_cell_count() {
            let slot = buffers.large_slots.load(index);
            let atoms = buffers.large_atom_counts.load(index);
            if (slot == 0) != (atoms == 0) {
                return fail(format!(
                    "cell {index} has slot {slot} and {atoms} atoms"
                ));
            }
            if slot != 0 && (slot > occupied || !slots.insert(slot)) {
                return fail(format!("slot {slot} is out of range or reused"));
            }
        }
        if slots.len() != occupied as usize {
            return fail(format!(
                "{} slots for {occupied} occupied cells",
                slots.len()
            ));
        }

        let mut atom_regions = Vec::with_capacity(occupied as usize);
        let mut small_regions = Vec::with_capacity(occupied as usize);
        for view in self.large_cells() {
            atom_regions.push((view.atom_offset, view.atom_count));
            small_regions.push((view.small_offset, view.small_count));
            let cursor = buffers.occupied_atom_cursors.load(view.slot as usize);
            if cursor != view.atom_offset + view.atom_count {
                return fail(format!(
                    "slot {} atom cursor stopped at {cursor}",
                    view.slot
                ));
            }
        }
        for (name, regions, total) in [
            ("large", &mut atom_regions, self.dispatch.large_reference_count),
            ("small", &mut small_regions, self.dispatch.small_reference_count),
        ] {
            regions.sort_unstable();
            let mut next = 1;
            for &(offset, count) in regions.iter() {
                if offset != next {
                    return fail(format!(
                        "{name} region at {offset} does not follow {next}"
                    ));
                }
                next = offset + count;
            }
            if next != total + 1 {
                return fail(format!(
                    "{name} regions end at {next}, pool holds {total}"
                ));
            }
        }

        let per_cell = self.geometry.small_cells_per_large();
        let ratio = self.geometry.small_cells_per_axis;
        for view in self.large_cells() {
            let base = (view.slot as usize - 1) * per_cell;
            let mut filled = 0;
            for local in 0..per_cell {
                let i = base + local;
                let count = buffers.small_counts.load(i);
                if count == 0 {
                    continue;
                }
                let offset = buffers.small_offsets.load(i);
                if buffers.small_cursors.load(i) != offset + count {
                    return fail(format!("small cell {i} cursor incomplete"));
                }
                if offset < view.small_offset
                    || offset + count > view.small_offset + view.small_count
                {
                    return fail(format!(
                        "small cell {i} escapes slot {} region",
                        view.slot
                    ));
                }
                filled += count;
                let s = ratio as usize;
                let local_voxel = UVec3::new(
                    (local % s) as u32,
                    (local / s % s) as u32,
                    (local / (s * s)) as u32,
                );
                let voxel = view.cell * ratio + local_voxel;
                for k in offset..offset + count {
                    let atom = buffers.small_references.load(k as usize);
                    let Some(converted) = buffers.atoms.get(atom as usize)
                    else {
                        return fail(format!("reference to missing atom {atom}"));
                    };
                    if !overlaps_small_voxel(
                        converted.center(),
                        converted.radius_squared(),
                        voxel,
                    ) {
                        return fail(format!(
                            "atom {atom} referenced by voxel {voxel:?} it \
                             does not overlap"
                        ));
                    }
                }
            }
            if filled != view.small_count {
                return fail(format!(
                    "slot {} holds {filled} of {} small references",
                    view.slot, view.small_count
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SparseIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseIndex")
            .field("frame_id", &self.frame_id())
            .field("slot", &self.slot())
            .field("geometry", &self.geometry)
            .field("dispatch", &self.dispatch)
            .finish()
    }
}
