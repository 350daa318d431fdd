//! First-fault latch written by kernels.
//!
//! Kernels cannot return errors, so an impossible count or an overflowing
//! reservation is recorded here instead. Only the first fault sticks; the host
//! turns it into a [`BuildError`] after the pass completes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{BuildError, Stage};

/// What a kernel tripped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Fault {
    /// A compacted slot index past the occupied-cell capacity.
    OccupiedCellsExhausted = 1,
    /// A reservation ran past the end of a reference pool.
    ReferencePoolOverrun = 2,
    /// A fill cursor ran past the end of its reserved region.
    RegionOverrun = 3,
    /// An occupied cell without a compacted slot.
    MissingSlot = 4,
    /// An atom whose element class has no radius.
    UnknownElement = 5,
    /// A reserved region whose cursor stopped short of (or past) its end.
    IncompleteRegion = 6,
}

impl Fault {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::OccupiedCellsExhausted),
            2 => Some(Self::ReferencePoolOverrun),
            3 => Some(Self::RegionOverrun),
            4 => Some(Self::MissingSlot),
            5 => Some(Self::UnknownElement),
            6 => Some(Self::IncompleteRegion),
            _ => None,
        }
    }
}

/// Shared fault record: a code plus two payload words.
#[derive(Debug, Default)]
pub struct FaultLatch {
    code: AtomicU32,
    first: AtomicU64,
    second: AtomicU64,
}

impl FaultLatch {
    /// Record `fault` unless another fault was recorded first.
    #[cold]
    pub fn record(&self, fault: Fault, first: u64, second: u64) {
        if self
            .code
            .compare_exchange(0, fault as u32, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.first.store(first, Ordering::Relaxed);
            self.second.store(second, Ordering::Relaxed);
        }
    }

    /// Whether any fault has been recorded.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.code.load(Ordering::Acquire) != 0
    }

    /// Clear the latch before a pass.
    pub fn clear(&self) {
        self.code.store(0, Ordering::Relaxed);
        self.first.store(0, Ordering::Relaxed);
        self.second.store(0, Ordering::Relaxed);
    }

    /// Convert a recorded fault into an error for `stage`, clearing the
    /// latch.
    ///
    /// # Errors
    ///
    /// Returns the error matching the recorded fault, if any.
    pub fn check(&self, stage: Stage) -> Result<(), BuildError> {
        let code = self.code.swap(0, Ordering::AcqRel);
        if code == 0 {
            return Ok(());
        }
        let first = self.first.load(Ordering::Relaxed);
        let second = self.second.load(Ordering::Relaxed);
        Err(match Fault::from_code(code) {
            Some(Fault::OccupiedCellsExhausted) => BuildError::exhausted(
                stage,
                "occupied large cells",
                first,
                second,
            ),
            Some(Fault::ReferencePoolOverrun) => BuildError::invariant(
                stage,
                format!(
                    "reservation ending at {first} overran a pool of {second}"
                ),
            ),
            Some(Fault::RegionOverrun) => BuildError::invariant(
                stage,
                format!("cursor {first} ran past region end {second}"),
            ),
            Some(Fault::MissingSlot) => BuildError::invariant(
                stage,
                format!("occupied cell {first} has no compacted slot"),
            ),
            Some(Fault::UnknownElement) => BuildError::invariant(
                stage,
                format!("atom {first} has unknown element class {second}"),
            ),
            Some(Fault::IncompleteRegion) => BuildError::invariant(
                stage,
                format!("slot {first} region filled to {second} references"),
            ),
            None => {
                BuildError::invariant(stage, format!("unknown fault {code}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn first_fault_wins() {
        let latch = FaultLatch::default();
        assert!(latch.check(Stage::LargeCellFill).is_ok());
        latch.record(Fault::RegionOverrun, 10, 8);
        latch.record(Fault::MissingSlot, 3, 0);
        assert!(latch.is_set());
        let err = latch.check(Stage::LargeCellFill).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert!(err.to_string().contains("cursor 10"));
        assert!(!latch.is_set());
    }

    #[test]
    fn occupied_overflow_is_exhaustion() {
        let latch = FaultLatch::default();
        latch.record(Fault::OccupiedCellsExhausted, 131_073, 131_072);
        let err = latch.check(Stage::LargeCellCompact).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    }
}
