//! Trimmer
//!
//! Demotes valid PTEs to transition format, moving their frames onto the
//! modified list for the writer to push out. Candidates come from the
//! oldest-age region lists first, and within a region only pages whose
//! age has a remaining quota are taken, so recently used pages survive.
//!
//! A walked region has its age histogram rebuilt from the PTEs as a side
//! effect, which also repairs the drift the accessed-bit stamping causes
//! between passes.

use core::sync::atomic::Ordering;

use super::pfn::PfnState;
use super::pte::{
    decode, encode_transition, encode_valid, oldest_age_of, read_pte, write_pte, PteView,
    NUMBER_OF_AGES, PTE_REGION_SIZE,
};
use super::scheduler::TimeCounter;
use super::System;

/// Distribute a trim target over the ages, oldest first.
///
/// An age whose whole population falls short of the remaining target is
/// claimed entirely; otherwise the exact deficit is claimed and the walk
/// stops.
pub(crate) fn compute_trim_quotas(system: &System, target: u64) -> [u64; NUMBER_OF_AGES] {
    let tally = system.global_age_count.snapshot();
    let mut quotas = [0u64; NUMBER_OF_AGES];
    let mut remaining = target;

    for age in (0..NUMBER_OF_AGES).rev() {
        if remaining == 0 {
            break;
        }
        if tally[age] >= remaining {
            quotas[age] = remaining;
            break;
        }
        if tally[age] > 0 {
            quotas[age] = tally[age];
            remaining -= tally[age];
        }
    }
    quotas
}

/// Trim one region against the remaining quotas. Returns the number of
/// pages moved to the modified list.
pub(crate) fn trim_one_region(system: &System, quotas: &mut [u64; NUMBER_OF_AGES]) -> u64 {
    // Oldest-age list with a lockable region wins; younger lists are the
    // fallback. All empty means there is nothing active to trim.
    let mut candidate = None;
    for age in (0..NUMBER_OF_AGES).rev() {
        if let Some(popped) = system.age_lists[age].pop_any_locked(&system.regions) {
            candidate = Some(popped);
            break;
        }
    }
    let Some((region_index, region_guard)) = candidate else {
        return 0;
    };
    let region = system.region(region_index as usize);
    let prior = region.histogram();

    let first = System::first_pte_of_region(region_index as usize);
    let end = (first + PTE_REGION_SIZE).min(system.num_ptes());

    let mut new_histogram = [0u16; NUMBER_OF_AGES];
    let mut batch: Vec<(u64, usize, spin::MutexGuard<'_, ()>)> = Vec::new();
    let mut vas: Vec<u64> = Vec::new();

    for pte_index in first..end {
        let word = read_pte(system.pte(pte_index));
        let PteView::Valid { frame, accessed, age } = decode(word) else {
            continue;
        };

        // An accessed page earns a fresh age instead of a trim.
        if accessed {
            write_pte(system.pte(pte_index), encode_valid(frame, false, 0));
            new_histogram[0] += 1;
            continue;
        }

        let age = age as usize;
        if quotas[age] > 0 {
            let pfn = system.pfn(frame);
            if pfn.read().reference == 0 {
                let pfn_guard = pfn.lock.lock();
                // The writer may have taken its reference between the
                // unlocked peek and the lock.
                if pfn.read().reference != 0 {
                    drop(pfn_guard);
                    new_histogram[age] += 1;
                    continue;
                }
                vas.push(system.va_from_pte_index(pte_index));
                batch.push((frame, pte_index, pfn_guard));
                quotas[age] -= 1;
                continue;
            }
        }
        new_histogram[age] += 1;
    }

    let trimmed = batch.len() as u64;
    if trimmed > 0 {
        // Unmapping first means any user write from here on faults and
        // resolves as a soft fault instead of landing in a stale mapping.
        system.vspace.unmap_scatter(&vas);

        let frames: Vec<u64> = batch.iter().map(|(frame, _, _)| *frame).collect();
        system.modified_page_list.link_tail_chain(&system.pfns, &frames);

        for (frame, pte_index, pfn_guard) in batch {
            let pfn = system.pfn(frame);
            let mut snapshot = pfn.read();
            snapshot.state = PfnState::Modified;
            pfn.write(snapshot);
            write_pte(system.pte(pte_index), encode_transition(frame));
            drop(pfn_guard);
        }
    }

    region.publish_histogram(&new_histogram);
    system.global_age_count.apply_delta(&prior, &new_histogram);

    match oldest_age_of(&new_histogram) {
        Some(oldest) => {
            system.age_lists[oldest].add_head(&system.regions, region_index);
        }
        None => region.make_inactive(),
    }

    drop(region_guard);
    trimmed
}

/// Body of the trimming thread.
pub fn trimming_thread(system: &System) {
    system.events.system_start.wait();
    log::info!("[MM] trimming thread started");

    loop {
        let _ = system
            .events
            .trim_wake
            .wait_timeout(system.wakeup_interval());
        if system.events.system_exit.is_signaled() {
            break;
        }

        let target = system.sched.num_trims.load(Ordering::Acquire);
        if target == 0 {
            continue;
        }

        let mut quotas = compute_trim_quotas(system, target);
        let mut remaining = target;
        while remaining > 0 {
            let counter = TimeCounter::start();
            let trimmed = trim_one_region(system, &mut quotas);
            if trimmed == 0 {
                // No lockable region or nothing quota-eligible: let the
                // next tick re-derive the target.
                break;
            }
            system
                .sched
                .trim_times
                .track(counter.elapsed_seconds(), trimmed);
            remaining = remaining.saturating_sub(trimmed);
        }
    }

    log::info!("[MM] trimming thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PAGE_SIZE;
    use crate::mm::fault::page_fault_handler;
    use crate::mm::{initialize_system, SystemConfig, VA_BASE};

    fn touched_system(pages: u64) -> System {
        let system = initialize_system(SystemConfig {
            physical_pages: 16,
            virtual_pages: 48,
            disc_pages: 48,
            faulting_threads: 1,
            passthroughs: 1,
            wakeup_interval_ms: 10,
        });
        for page in 0..pages {
            page_fault_handler(&system, VA_BASE + page * PAGE_SIZE as u64);
        }
        system
    }

    #[test]
    fn test_quota_claims_oldest_first() {
        let system = touched_system(0);
        system.global_age_count.increment(7);
        system.global_age_count.increment(7);
        system.global_age_count.increment(2);
        system.global_age_count.increment(2);
        system.global_age_count.increment(2);

        let quotas = compute_trim_quotas(&system, 4);
        assert_eq!(quotas[7], 2);
        assert_eq!(quotas[2], 2);
        assert_eq!(quotas[0], 0);
    }

    #[test]
    fn test_trim_moves_pages_to_modified() {
        let system = touched_system(4);
        let mut quotas = compute_trim_quotas(&system, 4);
        let trimmed = trim_one_region(&system, &mut quotas);
        assert_eq!(trimmed, 4);
        assert_eq!(system.modified_page_list.len(), 4);

        for page in 0..4usize {
            let va = VA_BASE + page as u64 * PAGE_SIZE as u64;
            assert_eq!(system.vspace.translate(va), 0);
            let view = decode(read_pte(system.pte(page)));
            let PteView::Transition { frame } = view else {
                panic!("expected transition PTE, got {view:?}");
            };
            assert_eq!(system.pfn(frame).read().state, PfnState::Modified);
            assert_eq!(system.pfn(frame).pte_index(), page as u64);
        }

        // Everything trimmed: the region went inactive, counts went to 0.
        assert!(!system.region(0).is_active());
        assert_eq!(system.global_age_count.snapshot(), [0; NUMBER_OF_AGES]);
        assert!(system.age_lists.iter().all(|list| list.is_empty()));
    }

    #[test]
    fn test_accessed_pages_survive_a_trim() {
        let system = touched_system(3);
        // Stamp one page as accessed; the trimmer must spare it.
        crate::mm::fault::cpu_stamp(&system, VA_BASE);

        let mut quotas = compute_trim_quotas(&system, 3);
        let trimmed = trim_one_region(&system, &mut quotas);
        assert_eq!(trimmed, 2);

        let frame = system.vspace.translate(VA_BASE);
        assert_ne!(frame, 0);
        assert_eq!(
            decode(read_pte(system.pte(0))),
            PteView::Valid {
                frame,
                accessed: false,
                age: 0
            }
        );

        // The region stays active on age list 0 with the one survivor.
        assert!(system.region(0).is_active());
        assert_eq!(system.region(0).histogram()[0], 1);
        assert_eq!(
            system.age_lists[0].collect_indices(&system.regions),
            vec![0]
        );
    }

    #[test]
    fn test_referenced_pages_are_never_trimmed() {
        let system = touched_system(2);
        let frame = system.vspace.translate(VA_BASE);
        {
            let _guard = system.pfn(frame).lock.lock();
            let mut snapshot = system.pfn(frame).read();
            snapshot.reference = 1;
            system.pfn(frame).write(snapshot);
        }

        let mut quotas = compute_trim_quotas(&system, 2);
        let trimmed = trim_one_region(&system, &mut quotas);
        assert_eq!(trimmed, 1);
        assert!(matches!(
            decode(read_pte(system.pte(0))),
            PteView::Valid { .. }
        ));
    }

    #[test]
    fn test_trim_then_soft_fault_restores_same_frame() {
        let system = touched_system(1);
        let frame_before = system.vspace.translate(VA_BASE);

        let mut quotas = compute_trim_quotas(&system, 1);
        assert_eq!(trim_one_region(&system, &mut quotas), 1);

        assert_eq!(
            page_fault_handler(&system, VA_BASE),
            crate::mm::fault::FaultOutcome::Mapped
        );
        assert_eq!(system.vspace.translate(VA_BASE), frame_before);
        assert!(system.modified_page_list.is_empty());

        // Reclaimed off the modified list: the sticky modified bit is set.
        assert!(system
            .pfn(frame_before)
            .read()
            .flags
            .contains(crate::mm::pfn::PfnFlags::MODIFIED));
    }
}
