//! Raw atoms and the element radius table.

use glam::Vec3;

use crate::error::{BuildError, Stage};

/// Maximum number of element classes a [`RadiusTable`] may hold.
pub const MAX_ELEMENT_CLASSES: usize = 254;

/// One atom as supplied by the atom source: position in nm plus an
/// element class indexing the [`RadiusTable`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Atom {
    /// Position in nanometers.
    pub position: [f32; 3],
    /// Element class (index into the radius table).
    pub element: u32,
}

impl Atom {
    /// Atom at `position` with element class `element`.
    #[must_use]
    pub fn new(position: Vec3, element: u8) -> Self {
        Self {
            position: position.to_array(),
            element: u32::from(element),
        }
    }

    /// Position as a vector.
    #[inline]
    #[must_use]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// Per-element-class radii in nanometers.
#[derive(Debug, Clone, PartialEq)]
pub struct RadiusTable {
    radii: Vec<f32>,
    max_radius: f32,
}

impl RadiusTable {
    /// Build a table, rejecting empty or oversized tables and radii that
    /// are negative or non-finite.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] if the table is empty, has more
    /// than [`MAX_ELEMENT_CLASSES`] classes, or holds a negative or
    /// non-finite radius.
    pub fn new(radii: Vec<f32>) -> Result<Self, BuildError> {
        if radii.is_empty() {
            return Err(BuildError::configuration(
                Stage::Setup,
                "radius table is empty",
            ));
        }
        if radii.len() > MAX_ELEMENT_CLASSES {
            return Err(BuildError::configuration(
                Stage::Setup,
                format!(
                    "radius table has {} classes, limit is {}",
                    radii.len(),
                    MAX_ELEMENT_CLASSES
                ),
            ));
        }
        if let Some((class, r)) = radii
            .iter()
            .enumerate()
            .find(|(_, r)| !r.is_finite() || **r < 0.0)
        {
            return Err(BuildError::configuration(
                Stage::Setup,
                format!("element class {class} has invalid radius {r}"),
            ));
        }
        let max_radius = radii.iter().copied().fold(0.0_f32, f32::max);
        Ok(Self { radii, max_radius })
    }

    /// Covalent radii indexed by atomic number, hydrogen through argon.
    /// Index 0 is a zero-radius placeholder.
    #[must_use]
    pub fn covalent() -> Self {
        let radii = vec![
            0.0, 0.031, 0.028, 0.128, 0.096, 0.084, 0.077, 0.071, 0.066,
            0.057, 0.058, 0.166, 0.141, 0.121, 0.111, 0.107, 0.105, 0.102,
            0.106,
        ];
        Self {
            max_radius: 0.166,
            radii,
        }
    }

    /// Radius of `element`, or `None` when the class is out of range.
    #[inline]
    #[must_use]
    pub fn radius(&self, element: u32) -> Option<f32> {
        self.radii.get(element as usize).copied()
    }

    /// Number of element classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.radii.len()
    }

    /// Whether the table is empty (never true for a constructed table).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.radii.is_empty()
    }

    /// Largest radius in the table.
    #[must_use]
    pub fn max_radius(&self) -> f32 {
        self.max_radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Atom>(), 16);
        let atom = Atom::new(Vec3::new(1.0, 2.0, 3.0), 6);
        let bytes: &[u8] = bytemuck::bytes_of(&atom);
        assert_eq!(bytes.len(), 16);
        assert_eq!(atom.position(), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn rejects_malformed_tables() {
        assert!(RadiusTable::new(Vec::new()).is_err());
        assert!(RadiusTable::new(vec![0.1; 255]).is_err());
        assert!(RadiusTable::new(vec![0.1, -0.2]).is_err());
        assert!(RadiusTable::new(vec![f32::NAN]).is_err());
        assert!(RadiusTable::new(vec![0.1; MAX_ELEMENT_CLASSES]).is_ok());
    }

    #[test]
    fn covalent_table_has_carbon() {
        let table = RadiusTable::covalent();
        assert_eq!(table.radius(6), Some(0.077));
        assert_eq!(table.radius(200), None);
        assert_eq!(table.len(), 19);
        assert_eq!(table.max_radius(), 0.166);
    }
}
