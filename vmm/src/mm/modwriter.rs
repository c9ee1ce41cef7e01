//! Modified page writer
//!
//! Drains the modified list: reserves paging-file slots, maps the batch
//! into a private staging window, writes each page out, and promotes the
//! survivors to the standby list where their frames become consumable.
//!
//! A page can be soft-faulted back to active while its write is in
//! flight. The fault handler marks such a frame dirtied; the writer then
//! discards the slot it wrote, because the paging-file copy is stale. The
//! writer's custody of a popped frame is its non-zero reference count plus
//! the PFN lock it re-takes from the post-write update through the standby
//! splice, so a reclaiming fault either sees the frame before the write
//! (and dirties it) or after the splice (and finds it on standby).

use core::sync::atomic::Ordering;

use crate::hal::PAGE_SIZE;

use super::pfn::{PfnFlags, PfnState};
use super::scheduler::TimeCounter;
use super::{System, MAX_MOD_BATCH};

/// Write one batch of modified pages to the paging file.
///
/// `target_writes` is decremented by the number of pages processed.
/// Returns that number; zero means no progress was possible (no slots or
/// no poppable pages).
pub(crate) fn write_pages_to_disc(system: &System, target_writes: &mut u64) -> u64 {
    let counter = TimeCounter::start();

    let target_pages = (*target_writes).min(MAX_MOD_BATCH as u64) as usize;
    if target_pages == 0 {
        return 0;
    }

    // Reserve slots first; frames are only popped once their destination
    // exists. All slots occupied stalls the writer without losing pages.
    let mut slots: Vec<u64> = Vec::with_capacity(target_pages);
    for _ in 0..target_pages {
        let slot = system.disc_in_use.find_unset_bit(0, true);
        if slot == crate::rtl::BITMAP_NOT_FOUND {
            break;
        }
        slots.push(slot);
    }
    if slots.is_empty() {
        return 0;
    }

    // Pop up to one frame per reserved slot, taking a reference on each so
    // the trimmer leaves them alone, then release the excess slots.
    let popped = system
        .modified_page_list
        .batch_pop(&system.pfns, slots.len());
    let mut frames: Vec<u64> = Vec::with_capacity(popped.len());
    for (frame, pfn_guard) in popped {
        let pfn = system.pfn(frame);
        let mut snapshot = pfn.read();
        snapshot.reference += 1;
        pfn.write(snapshot);
        frames.push(frame);
        drop(pfn_guard);
    }
    for &slot in &slots[frames.len()..] {
        system.disc_in_use.unset_bit(slot);
    }
    slots.truncate(frames.len());
    if frames.is_empty() {
        return 0;
    }

    // The write window belongs to this thread while the batch is active.
    let write_va = system.staging.modified_write_va;
    system.vspace.map(write_va, frames.len(), &frames);

    let mut survivors: Vec<(u64, spin::MutexGuard<'_, ()>)> = Vec::with_capacity(frames.len());
    for (i, &frame) in frames.iter().enumerate() {
        let src = system.va_ptr(write_va + i as u64 * PAGE_SIZE as u64);
        // Safety: the slot is exclusively reserved; the source page stays
        // mapped in the staging window for the whole batch.
        unsafe { system.pagefile.write_slot(slots[i], src) };

        let pfn = system.pfn(frame);
        let pfn_guard = pfn.lock.lock();
        let mut snapshot = pfn.read();

        if !snapshot.flags.contains(PfnFlags::DIRTIED) {
            pfn.set_disc_index(slots[i]);
            snapshot.state = PfnState::Standby;
            snapshot.reference -= 1;
            pfn.write(snapshot);
            // Keep the lock until the standby splice so a reclaiming
            // fault cannot see a standby frame that is on no list.
            survivors.push((frame, pfn_guard));
        } else {
            // Re-activated and re-written mid-write: the slot holds stale
            // contents now.
            system.disc_in_use.unset_bit(slots[i]);
            snapshot.flags.remove(PfnFlags::DIRTIED);
            snapshot.reference -= 1;
            if snapshot.state == PfnState::Active {
                // The reclaiming fault owns it again; no list change.
                pfn.write(snapshot);
                drop(pfn_guard);
            } else {
                snapshot.state = PfnState::Modified;
                pfn.write(snapshot);
                system.modified_page_list.push_tail(&system.pfns, frame);
                drop(pfn_guard);
            }
        }
    }

    system.vspace.unmap(write_va, frames.len());

    let standby_frames: Vec<u64> = survivors.iter().map(|(frame, _)| *frame).collect();
    system
        .standby_page_list
        .link_tail_chain(&system.pfns, &standby_frames);
    drop(survivors);

    system.events.pages_available.set();

    let processed = frames.len() as u64;
    system
        .sched
        .mod_write_times
        .track(counter.elapsed_seconds(), processed);
    *target_writes = target_writes.saturating_sub(processed);
    processed
}

/// Body of the modified-write thread.
pub fn modified_write_thread(system: &System) {
    system.events.system_start.wait();
    log::info!("[MM] modified write thread started");

    loop {
        let _ = system.events.mw_wake.wait_timeout(system.wakeup_interval());
        if system.events.system_exit.is_signaled() {
            break;
        }

        let mut remaining = system.sched.num_mod_writes.load(Ordering::Acquire);
        while remaining > 0 {
            if write_pages_to_disc(system, &mut remaining) == 0 {
                break;
            }
        }
    }

    log::info!("[MM] modified write thread exited");
}
