//! N-slot ring of buffer sets.
//!
//! Frame `f` writes slot `f mod N`. A slot is handed out as a [`SlotLease`]
//! that owns the slot's [`BufferSet`] until dropped, so a frame can never
//! reset or overwrite buffers an older frame (or the renderer) still reads.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::bvh::BufferSet;
use crate::error::{BuildError, Stage};

struct SlotState {
    buffers: Option<Box<BufferSet>>,
    generation: u64,
}

struct Slot {
    state: Mutex<SlotState>,
    returned: Condvar,
}

/// Round-robin arena of pre-allocated buffer sets.
pub struct BufferRing {
    slots: Vec<Slot>,
}

impl BufferRing {
    /// Ring with `slots` buffer sets (at least one).
    #[must_use]
    pub fn new(slots: usize) -> Arc<Self> {
        let slots = (0..slots.max(1))
            .map(|_| Slot {
                state: Mutex::new(SlotState {
                    buffers: Some(Box::new(BufferSet::new())),
                    generation: 0,
                }),
                returned: Condvar::new(),
            })
            .collect();
        Arc::new(Self { slots })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring has at least one slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot used by `frame_id`.
    #[must_use]
    pub fn slot_for(&self, frame_id: u64) -> usize {
        (frame_id % self.slots.len() as u64) as usize
    }

    fn lock(&self, slot: usize) -> Result<MutexGuard<'_, SlotState>, BuildError> {
        self.slots[slot].state.lock().map_err(|_| {
            BuildError::invariant(Stage::Pipeline, "buffer ring lock poisoned")
        })
    }

    /// Take the slot for `frame_id`, blocking until its previous lease is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvariantViolation`] if the slot's lock is
    /// poisoned.
    pub fn acquire(
        self: &Arc<Self>,
        frame_id: u64,
    ) -> Result<SlotLease, BuildError> {
        let slot = self.slot_for(frame_id);
        let mut state = self.lock(slot)?;
        loop {
            if let Some(buffers) = state.buffers.take() {
                return Ok(self.lease(slot, frame_id, buffers, state.generation));
            }
            state = self.slots[slot].returned.wait(state).map_err(|_| {
                BuildError::invariant(
                    Stage::Pipeline,
                    "buffer ring lock poisoned",
                )
            })?;
        }
    }

    /// Take the slot for `frame_id` if it is free.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvariantViolation`] if the slot's lock is
    /// poisoned.
    pub fn try_acquire(
        self: &Arc<Self>,
        frame_id: u64,
    ) -> Result<Option<SlotLease>, BuildError> {
        let slot = self.slot_for(frame_id);
        let mut state = self.lock(slot)?;
        let generation = state.generation;
        Ok(state
            .buffers
            .take()
            .map(|buffers| self.lease(slot, frame_id, buffers, generation)))
    }

    /// Whether the slot for `frame_id` is free right now.
    #[must_use]
    pub fn is_available(&self, frame_id: u64) -> bool {
        self.lock(self.slot_for(frame_id))
            .map(|state| state.buffers.is_some())
            .unwrap_or(false)
    }

    /// Times the slot has been returned since the ring was created.
    #[must_use]
    pub fn generation(&self, slot: usize) -> u64 {
        self.lock(slot).map(|state| state.generation).unwrap_or(0)
    }

    fn lease(
        self: &Arc<Self>,
        slot: usize,
        frame_id: u64,
        buffers: Box<BufferSet>,
        generation: u64,
    ) -> SlotLease {
        log::trace!(
            "frame {frame_id} leased slot {slot} (generation {generation})"
        );
        SlotLease {
            ring: Arc::clone(self),
            slot,
            frame_id,
            generation,
            buffers,
        }
    }

    fn give_back(&self, slot: usize, buffers: Box<BufferSet>) {
        // A poisoned slot stays empty; later acquires report the poison.
        if let Ok(mut state) = self.slots[slot].state.lock() {
            state.buffers = Some(buffers);
            state.generation += 1;
            self.slots[slot].returned.notify_all();
        }
    }
}

/// Exclusive ownership of one ring slot's buffers for one frame.
pub struct SlotLease {
    ring: Arc<BufferRing>,
    slot: usize,
    frame_id: u64,
    generation: u64,
    buffers: Box<BufferSet>,
}

impl SlotLease {
    /// Ring slot index.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Frame the lease was taken for.
    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Slot generation when the lease was taken.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffers of the slot.
    #[must_use]
    pub fn buffers(&self) -> &BufferSet {
        &self.buffers
    }

    /// Mutable buffers of the slot.
    pub fn buffers_mut(&mut self) -> &mut BufferSet {
        &mut self.buffers
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        self.ring.give_back(self.slot, buffers);
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("slot", &self.slot)
            .field("frame_id", &self.frame_id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn frames_map_to_slots_round_robin() {
        let ring = BufferRing::new(3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.slot_for(0), 0);
        assert_eq!(ring.slot_for(4), 1);
        assert_eq!(ring.slot_for(8), 2);
    }

    #[test]
    fn leased_slot_is_unavailable_until_dropped() {
        let ring = BufferRing::new(2);
        let lease = ring.acquire(0).unwrap();
        assert_eq!(lease.slot(), 0);
        assert!(!ring.is_available(2));
        assert!(ring.try_acquire(2).unwrap().is_none());
        assert!(ring.try_acquire(1).unwrap().is_some());

        drop(lease);
        assert_eq!(ring.generation(0), 1);
        let again = ring.try_acquire(2).unwrap().unwrap();
        assert_eq!(again.generation(), 1);
        assert_eq!(again.frame_id(), 2);
    }

    #[test]
    fn acquire_blocks_until_the_slot_returns() {
        let ring = BufferRing::new(1);
        let lease = ring.acquire(0).unwrap();
        let waiter = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.acquire(1).map(|l| l.generation()))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(lease);
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn buffers_survive_the_round_trip() {
        let ring = BufferRing::new(1);
        {
            let mut lease = ring.acquire(0).unwrap();
            let _ = lease.buffers_mut().large_slots.ensure(1000);
        }
        let lease = ring.acquire(1).unwrap();
        assert!(lease.buffers().allocated_bytes() >= 1024 * 4);
    }
}
