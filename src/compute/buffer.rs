//! Growable buffers shared by the build passes.
//!
//! Buffers grow to the next power of two when a frame needs more room and
//! never shrink, so steady-state frames do not reallocate.

use std::sync::atomic::{AtomicU32, Ordering};

/// Smallest allocation for any buffer, in elements.
const MIN_CAPACITY: usize = 64;

fn grown_capacity(len: usize) -> usize {
    len.max(MIN_CAPACITY).next_power_of_two()
}

/// A `u32` buffer updated through atomics by concurrent kernels.
///
/// `len` is the active region for the current frame; capacity beyond it is
/// kept for later frames.
pub struct AtomicBuffer {
    data: Vec<AtomicU32>,
    len: usize,
    label: &'static str,
}

impl AtomicBuffer {
    /// Empty buffer. Nothing is allocated until [`AtomicBuffer::ensure`].
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            data: Vec::new(),
            len: 0,
            label,
        }
    }

    /// Set the active length, growing if necessary.
    ///
    /// Returns `true` if the buffer was reallocated. Contents of the active
    /// region are unspecified afterwards; passes reset what they read.
    pub fn ensure(&mut self, len: usize) -> bool {
        self.len = len;
        if len <= self.data.len() {
            return false;
        }
        let capacity = grown_capacity(len);
        log::debug!(
            "growing '{}' buffer: {} -> {} elements",
            self.label,
            self.data.len(),
            capacity
        );
        self.data = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        true
    }

    /// Active elements.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[AtomicU32] {
        &self.data[..self.len]
    }

    /// Relaxed load of element `index`.
    #[inline]
    #[must_use]
    pub fn load(&self, index: usize) -> u32 {
        self.data[index].load(Ordering::Relaxed)
    }

    /// Relaxed store to element `index`.
    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        self.data[index].store(value, Ordering::Relaxed);
    }

    /// Relaxed fetch-add on element `index`, returning the previous value.
    #[inline]
    #[must_use]
    pub fn fetch_add(&self, index: usize, value: u32) -> u32 {
        self.data[index].fetch_add(value, Ordering::Relaxed)
    }

    /// Element `index`, if it lies in the active region.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&AtomicU32> {
        self.as_slice().get(index)
    }

    /// Active length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the active region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Buffer label used in log lines.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// Resize `vec` to `len`, reserving power-of-two capacity when it grows.
///
/// Returns `true` if the vector reallocated.
pub fn ensure_len<T: Default + Clone>(vec: &mut Vec<T>, len: usize) -> bool {
    let reallocated = len > vec.capacity();
    if reallocated {
        vec.reserve_exact(grown_capacity(len) - vec.len());
    }
    vec.resize(len, T::default());
    reallocated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_powers_of_two_and_never_shrinks() {
        let mut buffer = AtomicBuffer::new("test");
        assert!(buffer.is_empty());
        assert!(buffer.ensure(10));
        assert_eq!(buffer.capacity(), 64);
        assert!(buffer.ensure(100));
        assert_eq!(buffer.capacity(), 128);
        assert!(!buffer.ensure(5));
        assert_eq!(buffer.capacity(), 128);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.as_slice().len(), 5);
        assert!(buffer.get(5).is_none());
    }

    #[test]
    fn atomic_accessors() {
        let mut buffer = AtomicBuffer::new("test");
        let _ = buffer.ensure(4);
        buffer.store(2, 7);
        assert_eq!(buffer.fetch_add(2, 3), 7);
        assert_eq!(buffer.load(2), 10);
    }

    #[test]
    fn ensure_len_reserves_power_of_two() {
        let mut v: Vec<u32> = Vec::new();
        assert!(ensure_len(&mut v, 100));
        assert_eq!(v.len(), 100);
        assert!(v.capacity() >= 128);
        assert!(!ensure_len(&mut v, 20));
        assert_eq!(v.len(), 20);
    }
}
