//! Raw atoms to build-optimized form.
//!
//! Every later pass works in small-voxel units relative to the grid origin,
//! so the float conversion happens once per atom here.

use glam::Vec3;

use super::fault::{Fault, FaultLatch};
use super::geometry::GridGeometry;
use crate::atom::{Atom, RadiusTable};
use crate::compute::{ensure_len, ComputeBackend};

/// An atom in small-voxel units: center relative to the grid origin and
/// padded radius.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct ConvertedAtom {
    /// Center in small-voxel units.
    pub center: [f32; 3],
    /// Radius plus padding, in small-voxel units.
    pub radius: f32,
}

impl ConvertedAtom {
    /// Center as a vector.
    #[inline]
    #[must_use]
    pub fn center(&self) -> Vec3 {
        Vec3::from_array(self.center)
    }

    /// Squared radius.
    #[inline]
    #[must_use]
    pub fn radius_squared(&self) -> f32 {
        self.radius * self.radius
    }
}

/// Convert `atoms` into `out`, one task per atom.
pub fn convert_atoms<B: ComputeBackend>(
    backend: &B,
    atoms: &[Atom],
    radii: &RadiusTable,
    geometry: &GridGeometry,
    padding_epsilon: f32,
    out: &mut Vec<ConvertedAtom>,
    fault: &FaultLatch,
) {
    let _ = ensure_len(out, atoms.len());
    let width = geometry.small_voxel_width;
    backend.dispatch_mut(out.as_mut_slice(), |i, converted| {
        let atom = &atoms[i];
        let Some(radius) = radii.radius(atom.element) else {
            fault.record(Fault::UnknownElement, i as u64, u64::from(atom.element));
            *converted = ConvertedAtom::default();
            return;
        };
        *converted = ConvertedAtom {
            center: geometry.to_small_units(atom.position()).to_array(),
            radius: (radius + padding_epsilon) / width,
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::bounding_box::BoundingBox;
    use crate::compute::SerialBackend;
    use crate::error::Stage;
    use crate::options::Options;

    fn geometry() -> GridGeometry {
        GridGeometry::from_bounds(
            &BoundingBox {
                min: Vec3::splat(-2.0),
                max: Vec3::splat(2.0),
            },
            &Options::default(),
        )
        .unwrap()
    }

    #[test]
    fn converts_to_small_voxel_units() {
        let atoms = [Atom::new(Vec3::new(0.0, 0.5, -1.0), 6)];
        let mut out = Vec::new();
        let fault = FaultLatch::default();
        convert_atoms(
            &SerialBackend,
            &atoms,
            &RadiusTable::covalent(),
            &geometry(),
            0.0,
            &mut out,
            &fault,
        );
        assert!(fault.check(Stage::Convert).is_ok());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].center(), Vec3::new(8.0, 10.0, 4.0));
        assert!((out[0].radius - 0.308).abs() < 1e-5);
    }

    #[test]
    fn unknown_element_trips_the_latch() {
        let atoms = [Atom::new(Vec3::ZERO, 6), Atom::new(Vec3::ZERO, 120)];
        let mut out = vec![ConvertedAtom::default(); 8];
        let fault = FaultLatch::default();
        convert_atoms(
            &SerialBackend,
            &atoms,
            &RadiusTable::covalent(),
            &geometry(),
            1e-4,
            &mut out,
            &fault,
        );
        assert_eq!(out.len(), 2);
        assert!(fault.check(Stage::Convert).is_err());
    }
}
