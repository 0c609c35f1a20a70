//! Module Addresses
//!
//! A module id is a plain 32-bit value that routes on its own: the owning
//! worker is read straight out of the bits, so delivery never consults a
//! registry.
//!
//! ```text
//!  31        24 23        16 15                    0
//! ┌────────────┬────────────┬───────────────────────┐
//! │ machine id │   worker   │       sequence        │
//! └────────────┴────────────┴───────────────────────┘
//! ```
//!
//! Receiver `0` is the broadcast sentinel. Sequences start at 1 and skip 0,
//! so no live module ever has id 0.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const WORKER_SHIFT: u32 = 16;
const MACHINE_SHIFT: u32 = 24;

/// Worker index carried in bits `[23:16]` of a raw id
#[inline]
pub const fn decode_worker(id: u32) -> u8 {
    ((id >> WORKER_SHIFT) & 0xFF) as u8
}

/// Address of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(u32);

impl ModuleId {
    /// Receiver value that fans a message out to every module
    pub const BROADCAST: ModuleId = ModuleId(0);

    pub const fn encode(machine_id: u8, worker: u8, sequence: u16) -> Self {
        Self(((machine_id as u32) << MACHINE_SHIFT) | ((worker as u32) << WORKER_SHIFT) | sequence as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index of the worker that owns this module
    #[inline]
    pub const fn worker_index(self) -> u8 {
        decode_worker(self.0)
    }

    pub const fn machine_id(self) -> u8 {
        (self.0 >> MACHINE_SHIFT) as u8
    }

    pub const fn sequence(self) -> u16 {
        self.0 as u16
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module-{:08x}", self.0)
    }
}

impl From<u32> for ModuleId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<ModuleId> for u32 {
    fn from(id: ModuleId) -> Self {
        id.0
    }
}

/// Hands out module ids that are unique among live modules.
///
/// The 16-bit sequence is shared by every worker, starts at 1, and skips 0
/// when it wraps. An id still in use is never issued twice.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    machine_id: u8,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    next: u16,
    live: HashSet<ModuleId>,
}

impl IdAllocator {
    pub(crate) fn new(machine_id: u8) -> Self {
        Self {
            machine_id,
            state: Mutex::new(AllocatorState {
                next: 1,
                live: HashSet::new(),
            }),
        }
    }

    pub(crate) fn allocate(&self, worker: u8) -> Option<ModuleId> {
        let mut state = self.state.lock();
        for _ in 0..u16::MAX {
            let sequence = state.next;
            state.next = match sequence.wrapping_add(1) {
                0 => 1,
                next => next,
            };

            let id = ModuleId::encode(self.machine_id, worker, sequence);
            if state.live.insert(id) {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn release(&self, id: ModuleId) {
        self.state.lock().live.remove(&id);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let id = ModuleId::encode(1, 3, 7);
        assert_eq!(id.raw(), 0x0103_0007);
        assert_eq!(id.machine_id(), 1);
        assert_eq!(id.worker_index(), 3);
        assert_eq!(id.sequence(), 7);
        assert_eq!(id.to_string(), "module-01030007");
    }

    #[test]
    fn test_broadcast_sentinel() {
        assert!(ModuleId::BROADCAST.is_broadcast());
        assert_eq!(ModuleId::BROADCAST.worker_index(), 0);
        assert!(!ModuleId::encode(0, 0, 1).is_broadcast());
    }

    #[test]
    fn test_allocator_skips_live_ids() {
        let ids = IdAllocator::new(1);
        let first = ids.allocate(0).unwrap();
        assert_eq!(first.sequence(), 1);

        // walk the sequence all the way round; `first` is still live
        {
            let mut state = ids.state.lock();
            state.next = u16::MAX;
        }
        let wrapped = ids.allocate(0).unwrap();
        assert_eq!(wrapped.sequence(), u16::MAX);
        let after_wrap = ids.allocate(0).unwrap();
        assert_eq!(after_wrap.sequence(), 2);

        ids.release(first);
        assert_eq!(ids.live_count(), 2);
    }

    #[test]
    fn test_allocator_same_sequence_other_worker_is_distinct() {
        let ids = IdAllocator::new(1);
        let a = ids.allocate(0).unwrap();
        {
            let mut state = ids.state.lock();
            state.next = a.sequence();
        }
        let b = ids.allocate(1).unwrap();
        assert_eq!(a.sequence(), b.sequence());
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_worker_survives_encoding(machine in any::<u8>(), worker in any::<u8>(), seq in any::<u16>()) {
            let id = ModuleId::encode(machine, worker, seq);
            prop_assert_eq!(decode_worker(id.raw()), worker);
            prop_assert_eq!(id.machine_id(), machine);
            prop_assert_eq!(id.sequence(), seq);
        }
    }
}
