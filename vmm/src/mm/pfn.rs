//! Page Frame Number (PFN) Database
//!
//! One record exists for every physical frame in the pool. Each record
//! tracks:
//! - Page state (free, active, modified, standby)
//! - The PTE currently owning the frame
//! - The paging-file slot holding the written-out copy (standby pages)
//! - A reference count held by the modified writer during writeback
//! - The modified and dirtied flag bits
//! - Links for the free/modified/standby lists
//!
//! The state, flags, and reference count live in one packed word that is
//! always read and written at atomic width. Single-field peeks (the
//! trimmer's reference pre-check) may read the word without the lock;
//! every multi-field transition happens under the record's lock.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::ke::fatal_error;

/// PTE back-pointer value meaning "no owner".
pub const PTE_INDEX_NONE: u64 = u64::MAX;

/// Page states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PfnState {
    /// Frame is on the free list
    #[default]
    Free = 0,
    /// Frame backs a valid PTE and is on no list
    Active = 1,
    /// Frame was trimmed and needs writeback
    Modified = 2,
    /// Frame was written back and can be repurposed
    Standby = 3,
}

impl PfnState {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => PfnState::Free,
            1 => PfnState::Active,
            2 => PfnState::Modified,
            3 => PfnState::Standby,
            _ => fatal_error("PfnState::from_bits : impossible state bits"),
        }
    }
}

bitflags::bitflags! {
    /// Flag bits within the packed PFN word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfnFlags: u64 {
        /// Contents have been modified since the last writeback.
        const MODIFIED = 1 << 2;
        /// Contents changed while a paging-file write was in flight;
        /// the write's slot holds stale data.
        const DIRTIED = 1 << 3;
    }
}

const STATE_MASK: u64 = 0b11;
const REFERENCE_SHIFT: u64 = 16;
const REFERENCE_MASK: u64 = 0xFFFF;

/// Unpacked copy of the flags word, edited locally and written back as a
/// whole.
#[derive(Debug, Clone, Copy)]
pub struct PfnSnapshot {
    pub state: PfnState,
    pub flags: PfnFlags,
    pub reference: u16,
}

impl PfnSnapshot {
    fn unpack(word: u64) -> Self {
        Self {
            state: PfnState::from_bits(word & STATE_MASK),
            flags: PfnFlags::from_bits_truncate(word),
            reference: ((word >> REFERENCE_SHIFT) & REFERENCE_MASK) as u16,
        }
    }

    fn pack(&self) -> u64 {
        (self.state as u64) | self.flags.bits() | ((self.reference as u64) << REFERENCE_SHIFT)
    }
}

/// Page Frame Number database entry
pub struct Pfn {
    /// Protects multi-field transitions of this record.
    pub lock: spin::Mutex<()>,
    /// Packed state/flags/reference word.
    word: AtomicU64,
    /// Index of the owning PTE while state is active/modified/standby.
    pte_index: AtomicU64,
    /// Paging-file slot with the written-out copy (standby), else 0.
    disc_index: AtomicU64,
    /// Forward link: next frame on the owning list, 0 when unlinked.
    pub(crate) flink: AtomicU64,
    /// Backward link.
    pub(crate) blink: AtomicU64,
}

impl Pfn {
    pub fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
            word: AtomicU64::new(
                PfnSnapshot {
                    state: PfnState::Free,
                    flags: PfnFlags::empty(),
                    reference: 0,
                }
                .pack(),
            ),
            pte_index: AtomicU64::new(PTE_INDEX_NONE),
            disc_index: AtomicU64::new(0),
            flink: AtomicU64::new(0),
            blink: AtomicU64::new(0),
        }
    }

    /// Atomically read the packed word.
    pub fn read(&self) -> PfnSnapshot {
        PfnSnapshot::unpack(self.word.load(Ordering::Acquire))
    }

    /// Atomically write the packed word. Callers changing more than one
    /// field must hold the record's lock.
    pub fn write(&self, snapshot: PfnSnapshot) {
        self.word.store(snapshot.pack(), Ordering::Release);
    }

    /// Current state from a lock-free read of the word.
    pub fn state(&self) -> PfnState {
        self.read().state
    }

    pub fn pte_index(&self) -> u64 {
        self.pte_index.load(Ordering::Acquire)
    }

    pub fn set_pte_index(&self, index: u64) {
        self.pte_index.store(index, Ordering::Release);
    }

    pub fn disc_index(&self) -> u64 {
        self.disc_index.load(Ordering::Acquire)
    }

    pub fn set_disc_index(&self, slot: u64) {
        self.disc_index.store(slot, Ordering::Release);
    }
}

impl Default for Pfn {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip() {
        let pfn = Pfn::new();
        let snapshot = pfn.read();
        assert_eq!(snapshot.state, PfnState::Free);
        assert!(snapshot.flags.is_empty());
        assert_eq!(snapshot.reference, 0);

        let _guard = pfn.lock.lock();
        pfn.write(PfnSnapshot {
            state: PfnState::Standby,
            flags: PfnFlags::MODIFIED | PfnFlags::DIRTIED,
            reference: 3,
        });

        let snapshot = pfn.read();
        assert_eq!(snapshot.state, PfnState::Standby);
        assert!(snapshot.flags.contains(PfnFlags::MODIFIED));
        assert!(snapshot.flags.contains(PfnFlags::DIRTIED));
        assert_eq!(snapshot.reference, 3);
    }

    #[test]
    fn test_fields_do_not_alias() {
        // Every state/flag/reference combination packs into disjoint bits.
        for state in [
            PfnState::Free,
            PfnState::Active,
            PfnState::Modified,
            PfnState::Standby,
        ] {
            for flags in [PfnFlags::empty(), PfnFlags::MODIFIED, PfnFlags::DIRTIED] {
                for reference in [0u16, 1, 0xFFFF] {
                    let packed = PfnSnapshot {
                        state,
                        flags,
                        reference,
                    }
                    .pack();
                    let back = PfnSnapshot::unpack(packed);
                    assert_eq!(back.state, state);
                    assert_eq!(back.flags, flags);
                    assert_eq!(back.reference, reference);
                }
            }
        }
    }

    #[test]
    fn test_back_pointer_and_disc_index() {
        let pfn = Pfn::new();
        assert_eq!(pfn.pte_index(), PTE_INDEX_NONE);

        pfn.set_pte_index(42);
        pfn.set_disc_index(7);
        assert_eq!(pfn.pte_index(), 42);
        assert_eq!(pfn.disc_index(), 7);
    }
}
