//! Per-frame two-level sparse voxel index.
//!
//! A frame runs these stages strictly in order, each a data-parallel dispatch
//! over the previous stage's output:
//!
//! 1. bounding-box reduction ([`bounding_box`])
//! 2. grid arguments ([`geometry`])
//! 3. atom conversion ([`convert`])
//! 4. counter reset ([`counters`])
//! 5. large cells: count, compact, fill ([`large_cell`])
//! 6. dispatch sizing ([`dispatch`])
//! 7. small cells: count, allocate, scatter ([`small_cell`])
//!
//! [`BvhBuilder::prepare`] runs 1 to 4 and [`BvhBuilder::build`] runs 5 to 7,
//! so a pipeline can prepare frame `f + 1` on one thread while frame `f`
//! builds on another.

pub mod bounding_box;
mod buffers;
pub mod convert;
pub mod counters;
pub mod dispatch;
mod fault;
pub mod geometry;
mod index;
pub mod large_cell;
pub mod small_cell;
pub mod voxel;

use std::sync::Arc;

pub use bounding_box::{BoundingBox, ReducedBounds};
pub use buffers::BufferSet;
pub use counters::CounterSnapshot;
pub use dispatch::{DispatchArguments, OccupiedBounds};
pub use geometry::GridGeometry;
pub use index::{BuildTimings, LargeCellView, SmallCellView, SparseIndex};
use web_time::Instant;

use crate::atom::{Atom, RadiusTable};
use crate::compute::{ComputeBackend, RayonBackend};
use crate::error::{BuildError, Stage};
use crate::options::Options;
use crate::pipeline::{BufferRing, SlotLease};

/// CPU-side durations of the prepare stages, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrepareTimings {
    /// Bounding-box reduction.
    pub reduce_bounding_box: f64,
    /// Grid arguments, conversion and counter reset.
    pub upload: f64,
}

/// A frame whose slot has been reset and whose atoms are converted.
#[derive(Debug)]
pub struct PreparedFrame {
    lease: SlotLease,
    geometry: GridGeometry,
    bounds: ReducedBounds,
    timings: PrepareTimings,
}

impl PreparedFrame {
    /// Frame identifier.
    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.lease.frame_id()
    }

    /// Grid placement.
    #[must_use]
    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Reduced bounds and estimates.
    #[must_use]
    pub fn bounds(&self) -> &ReducedBounds {
        &self.bounds
    }

    /// Prepare-stage durations.
    #[must_use]
    pub fn timings(&self) -> PrepareTimings {
        self.timings
    }
}

/// Runs the index stages on a compute backend.
pub struct BvhBuilder<B: ComputeBackend = RayonBackend> {
    options: Options,
    radii: RadiusTable,
    backend: B,
}

impl BvhBuilder<RayonBackend> {
    /// Builder on a rayon pool sized by `options.pipeline.worker_threads`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] for invalid options, or
    /// [`BuildError::ThreadSpawn`] if the pool fails to start.
    pub fn new(options: Options, radii: RadiusTable) -> Result<Self, BuildError> {
        options.validate()?;
        let backend =
            RayonBackend::new(options.pipeline.worker_threads as usize)?;
        Self::with_backend(options, radii, backend)
    }
}

impl<B: ComputeBackend> BvhBuilder<B> {
    /// Builder on an explicit backend.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] for invalid options.
    pub fn with_backend(
        options: Options,
        radii: RadiusTable,
        backend: B,
    ) -> Result<Self, BuildError> {
        options.validate()?;
        log::debug!(
            "bvh builder on {} backend ({} workers)",
            backend.name(),
            backend.parallelism()
        );
        Ok(Self {
            options,
            radii,
            backend,
        })
    }

    /// Active options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Element radii.
    #[must_use]
    pub fn radii(&self) -> &RadiusTable {
        &self.radii
    }

    /// Compute backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stages 1 to 4 into the leased slot.
    ///
    /// # Errors
    ///
    /// Returns the bounding-box reduction's error, a grid that does not
    /// fit the limits, or an atom the conversion rejects. The lease is
    /// released on error.
    pub fn prepare(
        &self,
        atoms: &[Atom],
        mut lease: SlotLease,
    ) -> Result<PreparedFrame, BuildError> {
        let start = Instant::now();
        let bounds =
            bounding_box::reduce_bounding_box(&self.backend, atoms, &self.radii, &self.options)?;
        let reduced = Instant::now();

        let geometry = GridGeometry::from_bounds(&bounds.world, &self.options)?;
        let buffers = lease.buffers_mut();
        convert::convert_atoms(
            &self.backend,
            atoms,
            &self.radii,
            &geometry,
            self.options.grid.padding_epsilon,
            &mut buffers.atoms,
            &buffers.fault,
        );
        buffers.fault.check(Stage::Convert)?;
        counters::reset_counters(&self.backend, buffers, &geometry);
        let uploaded = Instant::now();

        let timings = PrepareTimings {
            reduce_bounding_box: reduced.duration_since(start).as_secs_f64(),
            upload: uploaded.duration_since(reduced).as_secs_f64(),
        };
        log::debug!(
            "frame {} prepared in slot {}: {} atoms, reduce {:.3} ms, upload \
             {:.3} ms",
            lease.frame_id(),
            lease.slot(),
            atoms.len(),
            timings.reduce_bounding_box * 1e3,
            timings.upload * 1e3
        );
        Ok(PreparedFrame {
            lease,
            geometry,
            bounds,
            timings,
        })
    }

    /// Stages 5 to 7, producing the frame's index.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ResourceExhaustion`] when a capacity is
    /// exceeded, or [`BuildError::InvariantViolation`] for impossible counts.
    pub fn build(
        &self,
        prepared: PreparedFrame,
    ) -> Result<SparseIndex, BuildError> {
        let PreparedFrame {
            mut lease,
            geometry,
            ..
        } = prepared;
        let start = Instant::now();
        let buffers = lease.buffers_mut();
        let _ = large_cell::build_large_cells(
            &self.backend,
            buffers,
            &geometry,
            &self.options.limits,
        )?;
        let large_done = Instant::now();

        let dispatch = dispatch::size_dispatch(buffers, &geometry)?;
        small_cell::build_small_cells(
            &self.backend,
            buffers,
            &geometry,
            &dispatch,
        )?;
        let small_done = Instant::now();

        let timings = BuildTimings {
            build_large: large_done.duration_since(start).as_secs_f64(),
            build_small: small_done.duration_since(large_done).as_secs_f64(),
        };
        log::debug!(
            "frame {} built: {} occupied cells, {} small references, large \
             {:.3} ms, small {:.3} ms",
            lease.frame_id(),
            dispatch.occupied_large_cells,
            dispatch.small_reference_count,
            timings.build_large * 1e3,
            timings.build_small * 1e3
        );
        Ok(SparseIndex {
            lease,
            geometry,
            dispatch,
            timings,
        })
    }

    /// Acquire the frame's slot from `ring` and run every stage.
    ///
    /// # Errors
    ///
    /// Returns any error of [`BufferRing::acquire`],
    /// [`BvhBuilder::prepare`] or [`BvhBuilder::build`].
    pub fn build_frame(
        &self,
        frame_id: u64,
        atoms: &[Atom],
        ring: &Arc<BufferRing>,
    ) -> Result<SparseIndex, BuildError> {
        let lease = ring.acquire(frame_id)?;
        let prepared = self.prepare(atoms, lease)?;
        self.build(prepared)
    }
}

#[cfg(test)]
mod tests {
    use glam::{IVec3, UVec3, Vec3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rustc_hash::FxHashSet;

    use super::*;
    use crate::compute::SerialBackend;
    use crate::error::ErrorKind;

    fn serial_builder(options: Options) -> BvhBuilder<SerialBackend> {
        BvhBuilder::with_backend(options, RadiusTable::covalent(), SerialBackend)
            .unwrap()
    }

    fn random_scene(count: usize, seed: u64, spread: f32) -> Vec<Atom> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                Atom::new(
                    Vec3::new(
                        rng.random_range(-spread..spread),
                        rng.random_range(-spread..spread),
                        rng.random_range(-spread..spread),
                    ),
                    rng.random_range(1..=18),
                )
            })
            .collect()
    }

    /// Every (atom, small voxel) overlap, recomputed in nanometers with f64
    /// arithmetic. Pairs within 1e-4 relative of touching go in
    /// `borderline`, where f32 rounding in the passes may go either way.
    struct Overlaps {
        certain: Vec<(UVec3, u32)>,
        borderline: FxHashSet<(UVec3, u32)>,
    }

    fn brute_force_overlaps(
        atoms: &[Atom],
        radii: &RadiusTable,
        geometry: &GridGeometry,
        epsilon: f32,
    ) -> Overlaps {
        let width = f64::from(geometry.small_voxel_width);
        let origin = geometry.origin_nm().as_dvec3();
        let last = geometry.small_dimensions().as_ivec3() - 1;
        let mut certain = Vec::new();
        let mut borderline = FxHashSet::default();
        for (i, atom) in atoms.iter().enumerate() {
            let center = atom.position().as_dvec3();
            let radius = f64::from(radii.radius(atom.element).unwrap())
                + f64::from(epsilon);
            let r2 = radius * radius;
            let lo = ((center - radius - origin) / width)
                .floor()
                .as_ivec3()
                .max(IVec3::ZERO);
            let hi = ((center + radius - origin) / width)
                .floor()
                .as_ivec3()
                .min(last);
            for z in lo.z..=hi.z {
                for y in lo.y..=hi.y {
                    for x in lo.x..=hi.x {
                        let voxel = IVec3::new(x, y, z);
                        let box_lo = origin + voxel.as_dvec3() * width;
                        let closest = center.clamp(box_lo, box_lo + width);
                        let d2 = center.distance_squared(closest);
                        let pair = (voxel.as_uvec3(), i as u32);
                        if d2 < r2 * (1.0 - 1e-4) {
                            certain.push(pair);
                        } else if d2 < r2 * (1.0 + 1e-4) {
                            let _ = borderline.insert(pair);
                        }
                    }
                }
            }
        }
        certain.sort_unstable_by_key(|&(v, a)| (v.z, v.y, v.x, a));
        Overlaps {
            certain,
            borderline,
        }
    }

    fn assert_covers(actual: &[(UVec3, u32)], overlaps: &Overlaps) {
        let indexed: FxHashSet<_> = actual.iter().copied().collect();
        assert_eq!(indexed.len(), actual.len(), "a pair is indexed twice");
        for pair in &overlaps.certain {
            assert!(indexed.contains(pair), "missing {pair:?}");
        }
        let certain: FxHashSet<_> = overlaps.certain.iter().copied().collect();
        for pair in actual {
            assert!(
                certain.contains(pair) || overlaps.borderline.contains(pair),
                "{pair:?} does not overlap"
            );
        }
    }

    fn indexed_pairs(index: &SparseIndex) -> Vec<(UVec3, u32)> {
        let dims = index.geometry().small_dimensions();
        let mut pairs = Vec::new();
        for z in 0..dims.z {
            for y in 0..dims.y {
                for x in 0..dims.x {
                    let voxel = UVec3::new(x, y, z);
                    pairs.extend(
                        index.atoms_in_small_voxel(voxel).map(|a| (voxel, a)),
                    );
                }
            }
        }
        pairs.sort_unstable_by_key(|&(v, a)| (v.z, v.y, v.x, a));
        pairs
    }

    #[test]
    fn three_carbons_occupy_two_large_cells() {
        let atoms = [
            Atom::new(Vec3::new(0.6, 0.6, 0.6), 6),
            Atom::new(Vec3::new(0.85, 0.6, 0.6), 6),
            Atom::new(Vec3::new(5.1, 5.1, 5.1), 6),
        ];
        let builder = serial_builder(Options::default());
        let ring = BufferRing::new(3);
        let index = builder.build_frame(0, &atoms, &ring).unwrap();
        assert_eq!(index.occupied_large_cells(), 2);

        let near = index.large_cell(UVec3::ZERO).unwrap();
        assert_eq!(near.small_count, 2);
        assert_eq!(near.atom_count, 2);
        let far = index.large_cell(UVec3::splat(2)).unwrap();
        assert_eq!(far.small_count, 1);
        assert!(index.large_cell(UVec3::new(1, 1, 1)).is_none());

        assert_eq!(index.atoms_near(Vec3::new(0.6, 0.6, 0.6)), vec![0]);
        assert_eq!(index.atoms_near(Vec3::new(0.8, 0.6, 0.6)), vec![1]);
        assert_eq!(index.atoms_near(Vec3::new(5.1, 5.1, 5.1)), vec![2]);
        assert!(index.atoms_near(Vec3::new(3.0, 3.0, 3.0)).is_empty());
        assert_eq!(
            index.atoms_in_region(Vec3::splat(0.0), Vec3::splat(1.0)),
            vec![0, 1]
        );
        index.validate().unwrap();
    }

    #[test]
    fn carbon_on_a_grid_corner_spans_eight_cells() {
        // (0, 0, 0) sits on the corner shared by eight large cells, so its
        // padded sphere overlaps one small voxel in each.
        let atoms = [
            Atom::new(Vec3::ZERO, 6),
            Atom::new(Vec3::new(0.1, 0.0, 0.0), 6),
            Atom::new(Vec3::splat(5.0), 6),
        ];
        let builder = serial_builder(Options::default());
        let ring = BufferRing::new(1);
        let index = builder.build_frame(0, &atoms, &ring).unwrap();
        index.validate().unwrap();
        assert_eq!(index.geometry().world_origin.x, -1);
        assert_eq!(index.geometry().dimensions(), UVec3::splat(4));

        // Eight cells around the origin plus the one holding (5, 5, 5).
        assert_eq!(index.occupied_large_cells(), 9);
        assert_eq!(index.dispatch().small_reference_count, 20);
        assert_eq!(index.dispatch().large_reference_count, 13);

        let shared = index.large_cell_absolute(IVec3::ZERO).unwrap();
        assert_eq!(shared.atom_count, 2);
        assert_eq!(shared.small_count, 2);
        let behind = index.large_cell_absolute(IVec3::splat(-1)).unwrap();
        assert_eq!(behind.atom_count, 1);
        assert_eq!(behind.small_count, 1);
        let far = index.large_cell_absolute(IVec3::splat(2)).unwrap();
        assert_eq!(far.atom_count, 1);
        assert_eq!(far.small_count, 8);

        let mut near = index.atoms_near(Vec3::ZERO);
        near.sort_unstable();
        assert_eq!(near, vec![0, 1]);
        assert_eq!(index.atoms_near(Vec3::splat(-0.05)), vec![0]);
    }

    #[test]
    fn empty_scene_is_a_configuration_error() {
        let builder = serial_builder(Options::default());
        let ring = BufferRing::new(1);
        let err = builder.build_frame(0, &[], &ring).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        // No pass ran, so the slot is back in the ring untouched.
        assert!(ring.is_available(0));
        assert_eq!(ring.acquire(0).unwrap().buffers().allocated_bytes(), 0);
    }

    #[test]
    fn too_many_atoms_fail_before_any_pass() {
        let atoms: Vec<Atom> =
            vec![bytemuck::Zeroable::zeroed(); 5_000_000];
        let builder = serial_builder(Options::default());
        let ring = BufferRing::new(1);
        let err = builder.build_frame(0, &atoms, &ring).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(err.stage(), Some(Stage::BoundingBox));
        assert_eq!(ring.acquire(0).unwrap().buffers().allocated_bytes(), 0);
    }

    #[test]
    fn every_overlap_is_indexed_exactly_once() {
        let options = Options::default();
        let radii = RadiusTable::covalent();
        let atoms = random_scene(2_000, 42, 3.0);
        let backend = RayonBackend::new(4).unwrap();
        let builder =
            BvhBuilder::with_backend(options.clone(), radii.clone(), backend)
                .unwrap();
        let ring = BufferRing::new(2);
        let index = builder.build_frame(7, &atoms, &ring).unwrap();
        index.validate().unwrap();

        let overlaps = brute_force_overlaps(
            &atoms,
            &radii,
            index.geometry(),
            options.grid.padding_epsilon,
        );
        let actual = indexed_pairs(&index);
        assert_covers(&actual, &overlaps);
        assert_eq!(
            index.dispatch().small_reference_count as usize,
            actual.len()
        );
    }

    #[test]
    fn reference_totals_are_conserved() {
        let options = Options::default();
        let atoms = random_scene(800, 3, 8.0);
        let builder = serial_builder(options.clone());
        let ring = BufferRing::new(1);
        let index = builder.build_frame(0, &atoms, &ring).unwrap();

        let counted: u32 = index.large_cells().map(|c| c.small_count).sum();
        let atom_refs: u32 = index.large_cells().map(|c| c.atom_count).sum();
        let overlaps = brute_force_overlaps(
            &atoms,
            builder.radii(),
            index.geometry(),
            options.grid.padding_epsilon,
        );
        let certain = overlaps.certain.len();
        let counted = counted as usize;
        assert!(counted >= certain);
        assert!(counted <= certain + overlaps.borderline.len());
        assert_eq!(counted, index.dispatch().small_reference_count as usize);
        assert_eq!(atom_refs, index.dispatch().large_reference_count);
        assert_eq!(indexed_pairs(&index).len(), counted);
    }

    #[test]
    fn coarser_small_ratio_still_covers_everything() {
        let mut options = Options::default();
        options.grid.small_voxel_width = 0.5;
        let atoms = random_scene(600, 17, 4.0);
        let builder = serial_builder(options.clone());
        let ring = BufferRing::new(1);
        let index = builder.build_frame(0, &atoms, &ring).unwrap();
        assert_eq!(index.geometry().small_cells_per_axis, 4);
        index.validate().unwrap();
        let overlaps = brute_force_overlaps(
            &atoms,
            builder.radii(),
            index.geometry(),
            options.grid.padding_epsilon,
        );
        assert_covers(&indexed_pairs(&index), &overlaps);
    }

    #[test]
    fn slots_are_reused_across_frames() {
        let builder = serial_builder(Options::default());
        let ring = BufferRing::new(2);
        let first = random_scene(300, 1, 5.0);
        let second = random_scene(50, 2, 1.0);
        for frame in 0..4_u64 {
            let atoms = if frame % 2 == 0 { &first } else { &second };
            let index = builder.build_frame(frame, atoms, &ring).unwrap();
            assert_eq!(index.slot(), (frame % 2) as usize);
            assert_eq!(index.atom_count(), atoms.len());
            index.validate().unwrap();
        }
        assert_eq!(ring.generation(0), 2);
        assert_eq!(ring.generation(1), 2);
    }

    #[test]
    fn overflowing_occupied_capacity_fails_the_frame() {
        let mut options = Options::default();
        options.limits.max_occupied_large_cells = 8;
        let builder = serial_builder(options);
        let ring = BufferRing::new(1);
        let atoms = random_scene(1_000, 8, 10.0);
        let err = builder.build_frame(0, &atoms, &ring).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(err.stage(), Some(Stage::LargeCellCompact));
    }
}
