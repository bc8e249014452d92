//! Fixed-slot buffer ring shared by datagram receivers.
//!
//! Producers `allocate` a slot, fill it from the socket, then `enqueue` a
//! descriptor; consumers `dequeue`, process, and `release` the slot back to
//! the free list. When every slot is taken the oldest queued-but-unread
//! descriptor is recycled and the overflow counter bumped, so a slow
//! consumer degrades to message loss instead of unbounded memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use strand_types::Endpoint;

/// Descriptor of one received datagram sitting in the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageBuffer {
    pub slot: usize,
    pub len: usize,
    pub sender: Endpoint,
}

struct RingState {
    slots: Vec<Vec<u8>>,
    free: VecDeque<usize>,
    full: VecDeque<MessageBuffer>,
    stopped: bool,
}

pub struct BufferRing {
    state: Mutex<RingState>,
    ready: Condvar,
    overflow: AtomicU64,
    slot_size: usize,
}

impl BufferRing {
    pub fn new(slot_count: usize, slot_size: usize) -> Self {
        let slots = (0..slot_count).map(|_| vec![0u8; slot_size]).collect();
        Self {
            state: Mutex::new(RingState {
                slots,
                free: (0..slot_count).collect(),
                full: VecDeque::new(),
                stopped: false,
            }),
            ready: Condvar::new(),
            overflow: AtomicU64::new(0),
            slot_size,
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Take a free slot, recycling the oldest unread descriptor when none
    /// is free. Returns `None` only after [`stop`](Self::stop).
    pub fn allocate(&self) -> Option<usize> {
        let mut state = self.lock();
        if state.stopped {
            return None;
        }
        if let Some(slot) = state.free.pop_front() {
            return Some(slot);
        }
        match state.full.pop_front() {
            Some(recycled) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                Some(recycled.slot)
            }
            // Every slot is leased by producers mid-fill.
            None => None,
        }
    }

    /// Copy a received datagram into the slot.
    pub fn fill(&self, slot: usize, data: &[u8]) -> usize {
        let mut state = self.lock();
        let len = data.len().min(self.slot_size);
        state.slots[slot][..len].copy_from_slice(&data[..len]);
        len
    }

    /// Publish a filled slot to consumers.
    pub fn enqueue(&self, buffer: MessageBuffer) {
        let mut state = self.lock();
        if state.stopped {
            state.free.push_back(buffer.slot);
            return;
        }
        state.full.push_back(buffer);
        drop(state);
        self.ready.notify_one();
    }

    /// Wait for the next descriptor; `None` means the ring was stopped.
    pub fn dequeue(&self) -> Option<MessageBuffer> {
        let mut state = self.lock();
        loop {
            if let Some(buffer) = state.full.pop_front() {
                return Some(buffer);
            }
            if state.stopped {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Copy a descriptor's payload out of its slot.
    pub fn read(&self, buffer: &MessageBuffer) -> Vec<u8> {
        let state = self.lock();
        state.slots[buffer.slot][..buffer.len].to_vec()
    }

    /// Return a slot to the free list after processing.
    pub fn release(&self, slot: usize) {
        let mut state = self.lock();
        state.free.push_back(slot);
    }

    /// Wake every consumer; subsequent `dequeue` calls return `None`.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
