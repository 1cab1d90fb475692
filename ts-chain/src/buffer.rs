//! Bounded single-producer/single-consumer link between two adjacent stages.
//!
//! The producer blocks while the ring is full and the consumer blocks while it
//! is empty. Blocking waits can be broken by `abort()` (discard everything),
//! `close_reader()` (the consumer went away) or by the caller's own
//! `interrupted` predicate, which is re-evaluated after every `wake()`.
//!
//! Whoever changes a condition that a blocked caller's predicate reads must
//! update that condition first and call `wake()` afterwards, so that the
//! predicate is always observed under the buffer lock. The predicate itself
//! must never take another lock: the buffer lock is always the innermost one.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::packet::PacketSlot;

#[derive(Debug)]
pub enum PushOutcome {
    Pushed,
    /// The consumer stopped reading or the end marker was already queued.
    Closed,
    Aborted,
    /// The caller's predicate fired; the packet is handed back untouched.
    Interrupted(PacketSlot),
}

#[derive(Debug)]
pub enum PopOutcome {
    Packet(PacketSlot),
    /// End marker reached; every packet queued before it has been returned.
    End,
    Aborted,
    Interrupted,
}

struct Ring {
    slots: VecDeque<PacketSlot>,
    end_queued: bool,
    reader_closed: bool,
    aborted: bool,
}

pub struct InterStageBuffer {
    name: String,
    capacity: usize,
    ring: Mutex<Ring>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl InterStageBuffer {
    /// A capacity of zero is raised to one.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            ring: Mutex::new(Ring {
                slots: VecDeque::with_capacity(capacity),
                end_queued: false,
                reader_closed: false,
                aborted: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_end_queued(&self) -> bool {
        self.lock().end_queued
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Queues one packet, blocking while the ring is full.
    pub fn push(&self, slot: PacketSlot, interrupted: &dyn Fn() -> bool) -> PushOutcome {
        let mut ring = self.lock();
        loop {
            if ring.aborted {
                return PushOutcome::Aborted;
            }
            if ring.reader_closed || ring.end_queued {
                return PushOutcome::Closed;
            }
            if ring.slots.len() < self.capacity {
                ring.slots.push_back(slot);
                self.not_empty.notify_one();
                return PushOutcome::Pushed;
            }
            if interrupted() {
                return PushOutcome::Interrupted(slot);
            }
            ring = self
                .not_full
                .wait(ring)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Queues the end marker. Returns false if it was already queued, the
    /// buffer was aborted or nobody reads it anymore.
    pub fn push_end(&self) -> bool {
        let mut ring = self.lock();
        if ring.end_queued || ring.aborted || ring.reader_closed {
            return false;
        }
        ring.end_queued = true;
        self.not_empty.notify_all();
        true
    }

    /// Takes the oldest packet, blocking while the ring is empty.
    pub fn pop(&self, interrupted: &dyn Fn() -> bool) -> PopOutcome {
        let mut ring = self.lock();
        loop {
            if ring.aborted {
                return PopOutcome::Aborted;
            }
            if let Some(slot) = ring.slots.pop_front() {
                self.not_full.notify_one();
                return PopOutcome::Packet(slot);
            }
            if ring.end_queued {
                return PopOutcome::End;
            }
            if interrupted() {
                return PopOutcome::Interrupted;
            }
            ring = self
                .not_empty
                .wait(ring)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking pop. Still returns queued packets after an abort so that
    /// a shutdown sweep can account for them.
    pub fn try_pop(&self) -> Option<PacketSlot> {
        let mut ring = self.lock();
        let slot = ring.slots.pop_front();
        if slot.is_some() {
            self.not_full.notify_one();
        }
        slot
    }

    /// The consumer will not read anymore; pending and future pushes return `Closed`.
    pub fn close_reader(&self) {
        let mut ring = self.lock();
        ring.reader_closed = true;
        self.not_full.notify_all();
    }

    /// Breaks every blocked call. Queued packets stay in place for `try_pop`.
    pub fn abort(&self) {
        let mut ring = self.lock();
        ring.aborted = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Makes blocked callers re-evaluate their `interrupted` predicate.
    pub fn wake(&self) {
        let _ring = self.lock();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InterStageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterStageBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "buffer_test.rs"]
mod buffer_test;
