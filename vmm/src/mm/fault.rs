//! Page fault handling
//!
//! Every access to an unmapped user page lands here. The handler resolves
//! the fault in place or decides to defer, in which case the caller simply
//! faults again:
//!
//! - **Fake fault**: the PTE is already valid; another thread won the race.
//! - **First touch**: an all-zero PTE gets a fresh frame.
//! - **Hard fault**: a disc-format PTE gets a fresh frame filled from the
//!   paging file.
//! - **Soft fault**: a transition-format PTE reclaims its still-resident
//!   frame off the modified or standby list.
//!
//! The PTE-region lock is always acquired before any PFN lock; the soft
//! path re-reads the PTE once its PFN lock is held because a standby
//! repurpose may push the PTE to disc format under the PFN lock alone.

use core::ptr;
use core::sync::atomic::Ordering;

use crate::hal::PAGE_SIZE;
use crate::ke::fatal_error;

use super::pfn::{PfnFlags, PfnState};
use super::pte::{
    cas_pte, decode, encode_disc, encode_valid, read_pte, write_pte, PteView,
};
use super::System;

/// How one handler entry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A valid mapping was installed.
    Mapped,
    /// The PTE was already valid; nothing to do.
    FakeFault,
    /// No mapping was installed; the caller retries the access.
    Deferred,
}

/// Resolve one fault on `va`.
pub fn page_fault_handler(system: &System, va: u64) -> FaultOutcome {
    let pte_index = system.pte_index_from_va(va);
    let region_index = System::region_index_of_pte(pte_index);
    let region = system.region(region_index);

    // The PTE region lock must come before any PFN lock: the PFN is not
    // even known until the PTE can be read consistently.
    let region_guard = region.lock.lock();
    let word = read_pte(system.pte(pte_index));

    let (frame, pfn_guard, came_from_modified) = match decode(word) {
        PteView::Valid { .. } => {
            drop(region_guard);
            return FaultOutcome::FakeFault;
        }

        // Never accessed: materialize a fresh frame.
        PteView::Zero => match get_free_page(system) {
            Some((frame, guard)) => (frame, guard, false),
            None => {
                drop(region_guard);
                system
                    .events
                    .pages_available
                    .wait_timeout(system.wakeup_interval());
                return FaultOutcome::Deferred;
            }
        },

        // Trimmed, written out, and repurposed: read it back from the
        // paging file, then release the slot.
        PteView::OnDisc { slot } => {
            let Some((frame, guard)) = get_free_page(system) else {
                drop(region_guard);
                system
                    .events
                    .pages_available
                    .wait_timeout(system.wakeup_interval());
                return FaultOutcome::Deferred;
            };
            read_page_on_disc(system, slot, frame);
            system.disc_in_use.unset_bit(slot);
            (frame, guard, false)
        }

        // Trimmed but still resident: reclaim the frame from its list.
        PteView::Transition { frame } => {
            let pfn = system.pfn(frame);
            let pfn_guard = pfn.lock.lock();

            // A transition PTE's contents cannot be trusted until its PFN
            // is locked: a standby repurpose may have pushed it to disc.
            if matches!(decode(read_pte(system.pte(pte_index))), PteView::OnDisc { .. }) {
                drop(pfn_guard);
                drop(region_guard);
                return FaultOutcome::Deferred;
            }

            let snapshot = pfn.read();
            match snapshot.state {
                PfnState::Modified => {
                    if snapshot.reference > 0 {
                        // The modified writer holds this frame for an
                        // in-flight paging-file write; it is on no list.
                        // Reclaiming it makes that write stale.
                        let mut snapshot = snapshot;
                        snapshot.flags.insert(PfnFlags::DIRTIED);
                        pfn.write(snapshot);
                    } else {
                        system.modified_page_list.remove(&system.pfns, frame);
                    }
                }
                PfnState::Standby => {
                    system.standby_page_list.remove(&system.pfns, frame);
                    system.disc_in_use.unset_bit(pfn.disc_index());
                    system.sched.pages_consumed.fetch_add(1, Ordering::AcqRel);
                }
                _ => fatal_error(
                    "page_fault_handler : transition PTE frame is neither modified nor standby",
                ),
            }
            (frame, pfn_guard, snapshot.state == PfnState::Modified)
        }
    };

    // Both locks held: publish the valid PTE, rebuild the PFN, and commit
    // the mapping with the host before either lock is released.
    write_pte(system.pte(pte_index), encode_valid(frame, false, 0));

    let pfn = system.pfn(frame);
    let mut snapshot = pfn.read();
    snapshot.state = PfnState::Active;
    if came_from_modified {
        snapshot.flags.insert(PfnFlags::MODIFIED);
    } else {
        snapshot.flags.remove(PfnFlags::MODIFIED);
    }
    pfn.write(snapshot);
    pfn.set_pte_index(pte_index as u64);
    pfn.set_disc_index(0);

    system
        .vspace
        .map(system.va_from_pte_index(pte_index), 1, &[frame]);

    // The region gained a valid page at age zero.
    if !region.is_active() {
        region.make_active();
        system.age_lists[0].add_head(&system.regions, region_index as u32);
    }
    region.bump_age(0);
    system.global_age_count.increment(0);

    drop(pfn_guard);
    drop(region_guard);
    FaultOutcome::Mapped
}

/// Obtain a frame for a first touch or a hard fault, locked.
///
/// The free list is tried first, then the standby list. A repurposed
/// standby frame's previous owner keeps only its paging-file copy: that
/// PTE is pushed to disc format under the PFN lock alone, and the frame is
/// zeroed so the next owner cannot see the previous owner's contents.
pub(crate) fn get_free_page(system: &System) -> Option<(u64, spin::MutexGuard<'_, ()>)> {
    if let Some((frame, guard)) = system.free_page_list.pop_head(&system.pfns) {
        system.sched.pages_consumed.fetch_add(1, Ordering::AcqRel);
        return Some((frame, guard));
    }

    let (frame, guard) = system.standby_page_list.pop_head(&system.pfns)?;
    let pfn = system.pfn(frame);

    let other_pte_index = pfn.pte_index() as usize;
    let other_disc_index = pfn.disc_index();
    let prior = decode(read_pte(system.pte(other_pte_index)));
    if !matches!(prior, PteView::Transition { .. }) {
        fatal_error("get_free_page : standby frame's owner is not in transition format");
    }
    write_pte(system.pte(other_pte_index), encode_disc(other_disc_index));

    {
        let _zero_guard = system.staging.repurpose_zero_lock.lock();
        system
            .vspace
            .map(system.staging.repurpose_zero_va, 1, &[frame]);
        let dst = system.va_ptr(system.staging.repurpose_zero_va);
        // Safety: the frame was popped with its PFN locked; no other
        // thread can reach it until the handler publishes it.
        unsafe { ptr::write_bytes(dst, 0, PAGE_SIZE) };
        system.vspace.unmap(system.staging.repurpose_zero_va, 1);
    }

    system.sched.pages_consumed.fetch_add(1, Ordering::AcqRel);
    Some((frame, guard))
}

/// Fill a freshly acquired frame from a paging-file slot.
fn read_page_on_disc(system: &System, slot: u64, frame: u64) {
    // The frame is on no list and invisible to other threads; only the
    // staging VA needs its lock.
    let _read_guard = system.staging.modified_read_lock.lock();
    system
        .vspace
        .map(system.staging.modified_read_va, 1, &[frame]);
    let dst = system.va_ptr(system.staging.modified_read_va);
    // Safety: dst spans one exclusively-owned page; the slot is still
    // reserved to this PTE.
    unsafe { system.pagefile.read_slot(slot, dst) };
    system.vspace.unmap(system.staging.modified_read_va, 1);
}

/// Stamp the accessed bit after a successful access.
///
/// Real hardware sets the accessed bit as a side effect of translation;
/// the simulation does it with a compare-exchange loop that loses safely
/// against the ager rewriting the same word.
pub fn cpu_stamp(system: &System, va: u64) {
    let pte = system.pte(system.pte_index_from_va(va));
    loop {
        let word = read_pte(pte);
        let PteView::Valid { frame, accessed, age } = decode(word) else {
            return;
        };
        if accessed && age == 0 {
            return;
        }
        if cas_pte(pte, word, encode_valid(frame, true, 0)) {
            return;
        }
    }
}
