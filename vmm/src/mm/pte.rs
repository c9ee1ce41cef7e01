//! Page Table Entry (PTE) Implementation
//!
//! Every page of the managed virtual range is described by one packed
//! 64-bit word. Exactly one of three interpretations applies at a time,
//! distinguished by the valid and on-disc bits:
//!
//! ```text
//! VALID       Bit 0:      1
//!             Bit 1:      Accessed
//!             Bits 2-41:  Frame number (40 bits)
//!             Bits 42-44: Age (3 bits)
//! TRANSITION  Bit 0:      0
//!             Bits 1-40:  Frame number (40 bits)
//!             Bit 41:     0 (not on disc)
//! DISC        Bit 0:      0
//!             Bits 1-40:  Paging-file slot (40 bits)
//!             Bit 41:     1 (on disc)
//! ```
//!
//! An all-zero word means the page has never been accessed.
//!
//! The whole word is always read and written atomically; a PTE is never
//! observed in a torn state. The table is partitioned into fixed regions
//! of [`PTE_REGION_SIZE`] entries, each carrying its own lock and an age
//! histogram, and active regions are linked onto one of the per-age region
//! lists according to the oldest age they contain.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::ke::fatal_error;

/// Entries per region; one region covers 2 MiB of user VA.
pub const PTE_REGION_SIZE: usize = 512;

/// Number of distinct ages a valid page can carry.
pub const NUMBER_OF_AGES: usize = 8;

/// Bits in the age field.
pub const BITS_PER_AGE: usize = 3;

/// Region-list link sentinel.
pub const REGION_NIL: u32 = u32::MAX;

const VALID_BIT: u64 = 1 << 0;
const ACCESSED_BIT: u64 = 1 << 1;
const VALID_FRAME_SHIFT: u64 = 2;
const AGE_SHIFT: u64 = 42;
const AGE_MASK: u64 = (1 << BITS_PER_AGE as u64) - 1;
const SOFT_FIELD_SHIFT: u64 = 1;
const ON_DISC_BIT: u64 = 1 << 41;
const FIELD_MASK: u64 = (1 << 40) - 1;

/// Decoded view of one PTE word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteView {
    /// Never accessed.
    Zero,
    /// Mapped and active.
    Valid { frame: u64, accessed: bool, age: u64 },
    /// Trimmed; the frame still holds the contents.
    Transition { frame: u64 },
    /// Contents live only in the paging file.
    OnDisc { slot: u64 },
}

/// Decode a PTE word into its current view.
#[inline]
pub fn decode(word: u64) -> PteView {
    if word == 0 {
        return PteView::Zero;
    }
    if word & VALID_BIT != 0 {
        return PteView::Valid {
            frame: (word >> VALID_FRAME_SHIFT) & FIELD_MASK,
            accessed: word & ACCESSED_BIT != 0,
            age: (word >> AGE_SHIFT) & AGE_MASK,
        };
    }
    if word & ON_DISC_BIT != 0 {
        PteView::OnDisc {
            slot: (word >> SOFT_FIELD_SHIFT) & FIELD_MASK,
        }
    } else {
        PteView::Transition {
            frame: (word >> SOFT_FIELD_SHIFT) & FIELD_MASK,
        }
    }
}

/// Build the valid view.
#[inline]
pub fn encode_valid(frame: u64, accessed: bool, age: u64) -> u64 {
    if frame == 0 || frame > FIELD_MASK || age >= NUMBER_OF_AGES as u64 {
        fatal_error("encode_valid : frame number or age out of range");
    }
    let mut word = VALID_BIT | (frame << VALID_FRAME_SHIFT) | (age << AGE_SHIFT);
    if accessed {
        word |= ACCESSED_BIT;
    }
    word
}

/// Build the transition view. The word is fully rewritten so no stale
/// bits of the prior format remain.
#[inline]
pub fn encode_transition(frame: u64) -> u64 {
    if frame == 0 || frame > FIELD_MASK {
        fatal_error("encode_transition : frame number out of range");
    }
    frame << SOFT_FIELD_SHIFT
}

/// Build the disc view.
#[inline]
pub fn encode_disc(slot: u64) -> u64 {
    if slot > FIELD_MASK {
        fatal_error("encode_disc : slot number out of range");
    }
    ON_DISC_BIT | (slot << SOFT_FIELD_SHIFT)
}

/// Atomically read a PTE word.
#[inline]
pub fn read_pte(pte: &AtomicU64) -> u64 {
    pte.load(Ordering::Acquire)
}

/// Atomically write a PTE word.
#[inline]
pub fn write_pte(pte: &AtomicU64, word: u64) {
    pte.store(word, Ordering::Release)
}

/// Compare-exchange a PTE word; true on success.
#[inline]
pub fn cas_pte(pte: &AtomicU64, expected: u64, new: u64) -> bool {
    pte.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

// ============================================================================
// PTE Regions
// ============================================================================

/// A fixed run of [`PTE_REGION_SIZE`] PTEs sharing a lock and an age
/// histogram.
///
/// The lock serializes the fault handler, the ager, and the trimmer over
/// the region's PTEs; it is always acquired before any PFN lock. The
/// histogram counts the region's valid PTEs per age, and while the region
/// is active it sits on the age list indexed by its oldest populated age.
pub struct PteRegion {
    pub lock: spin::Mutex<()>,
    active: AtomicBool,
    ages: [AtomicU16; NUMBER_OF_AGES],
    flink: AtomicU32,
    blink: AtomicU32,
}

impl PteRegion {
    pub fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
            active: AtomicBool::new(false),
            ages: core::array::from_fn(|_| AtomicU16::new(0)),
            flink: AtomicU32::new(REGION_NIL),
            blink: AtomicU32::new(REGION_NIL),
        }
    }

    /// True iff at least one PTE in the region is currently valid.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn make_active(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn make_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Snapshot the per-age population counts.
    pub fn histogram(&self) -> [u16; NUMBER_OF_AGES] {
        core::array::from_fn(|i| self.ages[i].load(Ordering::Acquire))
    }

    /// Replace the histogram with a freshly computed one, slot by slot.
    pub fn publish_histogram(&self, ages: &[u16; NUMBER_OF_AGES]) {
        for (slot, &count) in self.ages.iter().zip(ages.iter()) {
            slot.store(count, Ordering::Release);
        }
    }

    /// Count one more valid PTE at `age`.
    pub fn bump_age(&self, age: usize) {
        if age >= NUMBER_OF_AGES {
            fatal_error("PteRegion::bump_age : age out of range");
        }
        self.ages[age].fetch_add(1, Ordering::AcqRel);
    }

    /// The region's oldest populated age, if any PTE is counted at all.
    pub fn oldest_age(&self) -> Option<usize> {
        oldest_age_of(&self.histogram())
    }
}

impl Default for PteRegion {
    fn default() -> Self {
        Self::new()
    }
}

/// Oldest populated age of a histogram.
pub fn oldest_age_of(histogram: &[u16; NUMBER_OF_AGES]) -> Option<usize> {
    (0..NUMBER_OF_AGES).rev().find(|&age| histogram[age] > 0)
}

// ============================================================================
// Per-age region lists
// ============================================================================

struct RegionListInner {
    head: u32,
    tail: u32,
    num_regions: u64,
}

/// Doubly-linked list of active regions, threaded through the regions'
/// link fields by index. One list exists per age; a region lives on the
/// list matching its oldest populated age.
pub struct RegionList {
    inner: spin::Mutex<RegionListInner>,
}

impl RegionList {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(RegionListInner {
                head: REGION_NIL,
                tail: REGION_NIL,
                num_regions: 0,
            }),
        }
    }

    /// Number of regions currently linked.
    pub fn len(&self) -> u64 {
        self.inner.lock().num_regions
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Link a region at the head of the list.
    pub fn add_head(&self, regions: &[PteRegion], index: u32) {
        let mut inner = self.inner.lock();
        let region = &regions[index as usize];
        let old_head = inner.head;

        region.flink.store(old_head, Ordering::Relaxed);
        region.blink.store(REGION_NIL, Ordering::Relaxed);
        if old_head == REGION_NIL {
            inner.tail = index;
        } else {
            regions[old_head as usize].blink.store(index, Ordering::Relaxed);
        }
        inner.head = index;
        inner.num_regions += 1;
    }

    /// Unlink a region from anywhere in the list.
    pub fn remove(&self, regions: &[PteRegion], index: u32) {
        let mut inner = self.inner.lock();
        Self::unlink(&mut inner, regions, index);
    }

    fn unlink(inner: &mut RegionListInner, regions: &[PteRegion], index: u32) {
        let region = &regions[index as usize];
        let flink = region.flink.load(Ordering::Relaxed);
        let blink = region.blink.load(Ordering::Relaxed);

        if blink == REGION_NIL {
            inner.head = flink;
        } else {
            regions[blink as usize].flink.store(flink, Ordering::Relaxed);
        }
        if flink == REGION_NIL {
            inner.tail = blink;
        } else {
            regions[flink as usize].blink.store(blink, Ordering::Relaxed);
        }
        region.flink.store(REGION_NIL, Ordering::Relaxed);
        region.blink.store(REGION_NIL, Ordering::Relaxed);
        inner.num_regions -= 1;
    }

    /// Walk the list and return the first region whose lock can be taken
    /// without waiting, removed from the list and still locked.
    ///
    /// This is the one place a lock below a region lock is held while a
    /// region lock is taken; the trylock keeps the reversed order safe.
    pub fn pop_any_locked<'a>(
        &self,
        regions: &'a [PteRegion],
    ) -> Option<(u32, spin::MutexGuard<'a, ()>)> {
        let mut inner = self.inner.lock();
        let mut current = inner.head;
        while current != REGION_NIL {
            if let Some(guard) = regions[current as usize].lock.try_lock() {
                Self::unlink(&mut inner, regions, current);
                return Some((current, guard));
            }
            current = regions[current as usize].flink.load(Ordering::Relaxed);
        }
        None
    }

    /// Snapshot the linked region indices, head first.
    pub fn collect_indices(&self, regions: &[PteRegion]) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut indices = Vec::new();
        let mut current = inner.head;
        while current != REGION_NIL {
            indices.push(current);
            current = regions[current as usize].flink.load(Ordering::Relaxed);
        }
        indices
    }
}

impl Default for RegionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_zero() {
        assert_eq!(decode(0), PteView::Zero);
    }

    #[test]
    fn test_valid_round_trip() {
        let word = encode_valid(0x12_3456_789A, true, 5);
        assert_eq!(
            decode(word),
            PteView::Valid {
                frame: 0x12_3456_789A,
                accessed: true,
                age: 5
            }
        );

        let word = encode_valid(1, false, 0);
        assert_eq!(
            decode(word),
            PteView::Valid {
                frame: 1,
                accessed: false,
                age: 0
            }
        );
    }

    #[test]
    fn test_transition_round_trip() {
        let word = encode_transition(77);
        assert_eq!(decode(word), PteView::Transition { frame: 77 });
    }

    #[test]
    fn test_disc_round_trip() {
        let word = encode_disc(0);
        assert_eq!(decode(word), PteView::OnDisc { slot: 0 });
        let word = encode_disc(0xFF_FFFF_FFFF);
        assert_eq!(
            decode(word),
            PteView::OnDisc {
                slot: 0xFF_FFFF_FFFF
            }
        );
    }

    #[test]
    fn test_views_are_disjoint() {
        // The same 40-bit payload decodes differently under each format.
        let payload = 0x0BAD_CAFE;
        let valid = encode_valid(payload, false, 0);
        let transition = encode_transition(payload);
        let disc = encode_disc(payload);
        assert!(matches!(decode(valid), PteView::Valid { .. }));
        assert!(matches!(decode(transition), PteView::Transition { .. }));
        assert!(matches!(decode(disc), PteView::OnDisc { .. }));
        assert_ne!(valid, transition);
        assert_ne!(transition, disc);
    }

    #[test]
    fn test_cas_pte() {
        let pte = AtomicU64::new(0);
        let valid = encode_valid(3, false, 0);
        assert!(cas_pte(&pte, 0, valid));
        assert!(!cas_pte(&pte, 0, encode_valid(4, false, 0)));
        assert_eq!(read_pte(&pte), valid);
    }

    #[test]
    fn test_region_histogram() {
        let region = PteRegion::new();
        assert_eq!(region.oldest_age(), None);

        region.bump_age(0);
        region.bump_age(3);
        region.bump_age(3);
        assert_eq!(region.oldest_age(), Some(3));
        assert_eq!(region.histogram()[3], 2);

        let mut fresh = [0u16; NUMBER_OF_AGES];
        fresh[1] = 7;
        region.publish_histogram(&fresh);
        assert_eq!(region.histogram(), fresh);
        assert_eq!(region.oldest_age(), Some(1));
    }

    fn region_arena(count: usize) -> Vec<PteRegion> {
        (0..count).map(|_| PteRegion::new()).collect()
    }

    #[test]
    fn test_region_list_add_remove() {
        let regions = region_arena(4);
        let list = RegionList::new();

        list.add_head(&regions, 0);
        list.add_head(&regions, 1);
        list.add_head(&regions, 2);
        assert_eq!(list.collect_indices(&regions), vec![2, 1, 0]);

        list.remove(&regions, 1);
        assert_eq!(list.collect_indices(&regions), vec![2, 0]);

        list.remove(&regions, 2);
        list.remove(&regions, 0);
        assert!(list.is_empty());
    }

    #[test]
    fn test_pop_any_locked_skips_held_regions() {
        let regions = region_arena(3);
        let list = RegionList::new();
        list.add_head(&regions, 0);
        list.add_head(&regions, 1);

        // Head of the list is region 1; hold its lock so the pop must
        // fall through to region 0.
        let held = regions[1].lock.lock();
        let (index, guard) = list.pop_any_locked(&regions).unwrap();
        assert_eq!(index, 0);
        drop(guard);
        drop(held);

        assert_eq!(list.collect_indices(&regions), vec![1]);
        let (index, guard) = list.pop_any_locked(&regions).unwrap();
        assert_eq!(index, 1);
        drop(guard);

        assert!(list.pop_any_locked(&regions).is_none());
    }
}
