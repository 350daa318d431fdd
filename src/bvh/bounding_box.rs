//! Bounding-box reduction over the raw atoms.
//!
//! Atoms are split into fixed-size chunks reduced in parallel; the tail that
//! does not fill a chunk is reduced on the calling thread and merged last.
//! Besides the box, each chunk sums how many voxels every padded sphere's
//! voxel range spans at both grid widths. Those sums bound the reference
//! counts of the frame and reject scenes that would blow the pools before
//! any pass runs.

use glam::Vec3;

use crate::atom::{Atom, RadiusTable, MAX_ELEMENT_CLASSES};
use crate::compute::ComputeBackend;
use crate::error::{BuildError, Stage};
use crate::options::Options;

/// Axis-aligned box in nanometers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl BoundingBox {
    /// Whether `other` lies entirely inside this box.
    #[must_use]
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Edge lengths.
    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }
}

/// Output of [`reduce_bounding_box`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducedBounds {
    /// Tight box around every padded sphere.
    pub padded: BoundingBox,
    /// Padded box clamped to the world extent and rounded outward to whole
    /// large voxels.
    pub world: BoundingBox,
    /// Estimated large-voxel references.
    pub large_reference_estimate: f64,
    /// Estimated small-voxel references.
    pub small_reference_estimate: f64,
}

#[derive(Debug, Clone, Copy)]
struct Partial {
    min: Vec3,
    max: Vec3,
    large: f64,
    small: f64,
    first_invalid: Option<usize>,
}

impl Partial {
    const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
        large: 0.0,
        small: 0.0,
        first_invalid: None,
    };

    fn merge(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            large: self.large + other.large,
            small: self.small + other.small,
            first_invalid: match (self.first_invalid, other.first_invalid) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// Voxels spanned by `[lo, hi]` on a grid of `width`, aligned at the world
/// origin.
#[inline]
fn cell_span(lo: Vec3, hi: Vec3, width: f32) -> f64 {
    let span = (hi / width).ceil() - (lo / width).floor();
    f64::from(span.x) * f64::from(span.y) * f64::from(span.z)
}

struct ChunkReducer<'a> {
    radii: &'a RadiusTable,
    epsilon: f32,
    large_width: f32,
    small_width: f32,
}

impl ChunkReducer<'_> {
    fn reduce(&self, atoms: &[Atom], base: usize) -> Partial {
        let mut partial = Partial::EMPTY;
        for (i, atom) in atoms.iter().enumerate() {
            let position = atom.position();
            let radius = match self.radii.radius(atom.element) {
                Some(r) if position.is_finite() => r + self.epsilon,
                _ => {
                    if partial.first_invalid.is_none() {
                        partial.first_invalid = Some(base + i);
                    }
                    continue;
                }
            };
            let lo = position - radius;
            let hi = position + radius;
            partial.min = partial.min.min(lo);
            partial.max = partial.max.max(hi);
            partial.large += cell_span(lo, hi, self.large_width);
            partial.small += cell_span(lo, hi, self.small_width);
        }
        partial
    }
}

/// Reduce `atoms` to a world box and reference estimates.
///
/// # Errors
///
/// Returns [`BuildError::Configuration`] for an empty atom list, a
/// malformed radius table, an atom with an unknown element or a
/// non-finite position, or a small-reference estimate at or above
/// `max_small_references`. Returns [`BuildError::ResourceExhaustion`]
/// when there are more than `max_atoms` atoms or a padded sphere
/// reaches past the world extent.
pub fn reduce_bounding_box<B: ComputeBackend>(
    backend: &B,
    atoms: &[Atom],
    radii: &RadiusTable,
    options: &Options,
) -> Result<ReducedBounds, BuildError> {
    if atoms.is_empty() {
        return Err(BuildError::configuration(
            Stage::BoundingBox,
            "atom list is empty",
        ));
    }
    if radii.is_empty() || radii.len() > MAX_ELEMENT_CLASSES {
        return Err(BuildError::configuration(
            Stage::BoundingBox,
            format!("radius table has {} classes", radii.len()),
        ));
    }
    let max_atoms = options.limits.max_atoms;
    if atoms.len() > max_atoms as usize {
        return Err(BuildError::exhausted(
            Stage::BoundingBox,
            "atoms",
            atoms.len() as u64,
            u64::from(max_atoms),
        ));
    }

    let grid = &options.grid;
    let reducer = ChunkReducer {
        radii,
        epsilon: grid.padding_epsilon,
        large_width: grid.large_voxel_width,
        small_width: grid.small_voxel_width,
    };
    let chunk = options.pipeline.reduction_chunk_size.max(1) as usize;
    let full_chunks = atoms.len() / chunk;
    let bulk = backend.map_reduce(
        full_chunks,
        || Partial::EMPTY,
        |c| reducer.reduce(&atoms[c * chunk..(c + 1) * chunk], c * chunk),
        Partial::merge,
    );
    let tail_start = full_chunks * chunk;
    let tail = reducer.reduce(&atoms[tail_start..], tail_start);
    let total = bulk.merge(tail);

    if let Some(index) = total.first_invalid {
        let atom = &atoms[index];
        let reason = if atom.position().is_finite() {
            format!(
                "atom {index} has element class {} outside the radius table \
                 ({} classes)",
                atom.element,
                radii.len()
            )
        } else {
            format!("atom {index} has a non-finite position")
        };
        return Err(BuildError::configuration(Stage::BoundingBox, reason));
    }

    let cap = options.limits.max_small_references;
    if total.small >= f64::from(cap) {
        return Err(BuildError::configuration(
            Stage::BoundingBox,
            format!(
                "estimated {:.0} small references, dense-grid ceiling is {cap}",
                total.small.ceil()
            ),
        ));
    }

    let padded = BoundingBox {
        min: total.min,
        max: total.max,
    };
    let extent = grid.world_extent;
    if padded.min.cmplt(Vec3::splat(-extent)).any()
        || padded.max.cmpgt(Vec3::splat(extent)).any()
    {
        let reach = padded.min.abs().max(padded.max.abs()).max_element();
        return Err(BuildError::exhausted(
            Stage::BoundingBox,
            "world extent",
            reach.ceil() as u64,
            extent as u64,
        ));
    }

    let world = round_to_large_voxels(padded, grid.large_voxel_width, extent);
    log::debug!(
        "bounding box {:?}..{:?} (world {:?}..{:?}), estimates {:.0} large \
         / {:.0} small",
        padded.min,
        padded.max,
        world.min,
        world.max,
        total.large,
        total.small
    );
    Ok(ReducedBounds {
        padded,
        world,
        large_reference_estimate: total.large,
        small_reference_estimate: total.small,
    })
}

/// Clamp to `±extent` and round outward to whole multiples of `width`.
/// Every axis keeps at least one voxel.
fn round_to_large_voxels(
    bounds: BoundingBox,
    width: f32,
    extent: f32,
) -> BoundingBox {
    let limit = Vec3::splat(extent);
    let min = bounds.min.clamp(-limit, limit);
    let max = bounds.max.clamp(-limit, limit);
    let min = (min / width).floor() * width;
    let mut max = (max / width).ceil() * width;
    for axis in 0..3 {
        if max[axis] <= min[axis] {
            max[axis] = min[axis] + width;
        }
    }
    BoundingBox { min, max }
}
