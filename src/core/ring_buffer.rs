//! Module implementing the per-thread ring queue of pending spike deliveries.
//!
//! The ring holds one slot per step of the window `[cursor, cursor + len)`, where `cursor`
//! is the first step not yet drained. A payload due at step `s` lives in slot `s % len`.
use super::time::Step;

/// A fixed-capacity circular buffer of payloads keyed by due step.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    slots: Vec<Vec<T>>,
    cursor: Step,
}

impl<T> RingBuffer<T> {
    /// Create a ring with `len` slots, starting at step `cursor`.
    ///
    /// # Panics
    /// If `len` is zero.
    pub fn new(len: usize, cursor: Step) -> Self {
        assert!(len > 0, "a ring buffer needs at least one slot");
        RingBuffer {
            slots: (0..len).map(|_| Vec::new()).collect(),
            cursor,
        }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns the first step which has not been drained yet.
    pub fn cursor(&self) -> Step {
        self.cursor
    }

    /// Returns the number of payloads not drained yet.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(|slot| slot.len()).sum()
    }

    /// Returns `true` if no payload is pending.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_empty())
    }

    /// Place a payload in the slot of step `due`.
    ///
    /// # Panics
    /// If `due` was already drained or lies beyond the window, which would overwrite
    /// undrained history.
    pub fn insert(&mut self, due: Step, payload: T) {
        assert!(
            due >= self.cursor && due < self.cursor + self.slots.len() as Step,
            "due step {} is outside the ring window [{}, {})",
            due,
            self.cursor,
            self.cursor + self.slots.len() as Step
        );
        let len = self.slots.len();
        self.slots[(due % len as Step) as usize].push(payload);
    }

    /// Return and clear all payloads due at `step`, then advance the cursor.
    ///
    /// # Panics
    /// If `step` is not the current cursor; slots are drained strictly in order.
    pub fn drain(&mut self, step: Step) -> Vec<T> {
        assert_eq!(
            step, self.cursor,
            "ring drained out of order: expected step {}, got {}",
            self.cursor, step
        );
        let len = self.slots.len();
        self.cursor += 1;
        std::mem::take(&mut self.slots[(step % len as Step) as usize])
    }

    /// Change the number of slots, keeping every pending payload at its due step.
    ///
    /// # Panics
    /// If the ring would shrink while payloads are pending.
    pub fn resize(&mut self, len: usize) {
        assert!(len > 0, "a ring buffer needs at least one slot");
        if len == self.slots.len() {
            return;
        }
        assert!(
            len > self.slots.len() || self.is_empty(),
            "cannot shrink a ring buffer from {} to {} slots with {} pending payloads",
            self.slots.len(),
            len,
            self.pending()
        );

        let old_len = self.slots.len() as Step;
        let old_slots = std::mem::take(&mut self.slots);
        self.slots = (0..len).map(|_| Vec::new()).collect();
        for (index, slot) in old_slots.into_iter().enumerate() {
            let offset = (index as Step + old_len - self.cursor % old_len) % old_len;
            let due = self.cursor + offset;
            for payload in slot {
                self.insert(due, payload);
            }
        }
    }
}
