//! Ager
//!
//! Periodically rescans active regions, consuming accessed bits and
//! pushing unreferenced pages one age older, up to the maximum. The walk
//! rebuilds the region's age histogram from the PTEs and relinks the
//! region onto the age list matching its new oldest age.
//!
//! A rotating cursor spreads the passes over the whole region table so no
//! region starves. The region lock serializes aging against trimming and
//! faulting; the accessed-bit stamp races only through its own
//! compare-exchange, which loses safely against the ager's plain store.

use core::sync::atomic::Ordering;

use crate::ke::fatal_error;

use super::pte::{
    decode, encode_valid, oldest_age_of, read_pte, write_pte, PteView, NUMBER_OF_AGES,
    PTE_REGION_SIZE,
};
use super::scheduler::TimeCounter;
use super::System;

/// Age the next active region under the cursor. Returns the number of
/// valid PTEs processed; zero means no active region could be found in a
/// full rotation.
pub(crate) fn age_one_region(system: &System) -> u64 {
    let num_regions = system.regions.len();

    for _ in 0..num_regions {
        let region_index =
            system.sched.ager_cursor.fetch_add(1, Ordering::Relaxed) % num_regions;
        let region = system.region(region_index);
        if !region.is_active() {
            continue;
        }

        let region_guard = region.lock.lock();
        if !region.is_active() {
            drop(region_guard);
            continue;
        }

        let prior = region.histogram();
        let Some(prior_oldest) = oldest_age_of(&prior) else {
            fatal_error("age_one_region : active region with an empty age histogram");
        };

        let first = System::first_pte_of_region(region_index);
        let end = (first + PTE_REGION_SIZE).min(system.num_ptes());

        let mut new_histogram = [0u16; NUMBER_OF_AGES];
        let mut processed = 0u64;

        for pte_index in first..end {
            let word = read_pte(system.pte(pte_index));
            let PteView::Valid { frame, accessed, age } = decode(word) else {
                continue;
            };
            let new_age = if accessed {
                0
            } else {
                (age + 1).min(NUMBER_OF_AGES as u64 - 1)
            };
            write_pte(system.pte(pte_index), encode_valid(frame, false, new_age));
            new_histogram[new_age as usize] += 1;
            processed += 1;
        }

        region.publish_histogram(&new_histogram);
        system.global_age_count.apply_delta(&prior, &new_histogram);

        match oldest_age_of(&new_histogram) {
            Some(new_oldest) if new_oldest != prior_oldest => {
                system.age_lists[prior_oldest].remove(&system.regions, region_index as u32);
                system.age_lists[new_oldest].add_head(&system.regions, region_index as u32);
            }
            Some(_) => {}
            None => {
                system.age_lists[prior_oldest].remove(&system.regions, region_index as u32);
                region.make_inactive();
            }
        }

        drop(region_guard);
        if processed > 0 {
            return processed;
        }
    }
    0
}

/// Body of the aging thread.
pub fn aging_thread(system: &System) {
    system.events.system_start.wait();
    log::info!("[MM] aging thread started");

    loop {
        let _ = system
            .events
            .age_wake
            .wait_timeout(system.wakeup_interval());
        if system.events.system_exit.is_signaled() {
            break;
        }

        let mut remaining = system.sched.num_ages.load(Ordering::Acquire);
        while remaining > 0 {
            let counter = TimeCounter::start();
            let aged = age_one_region(system);
            if aged == 0 {
                break;
            }
            system
                .sched
                .age_times
                .track(counter.elapsed_seconds(), aged);
            remaining = remaining.saturating_sub(aged);
        }
    }

    log::info!("[MM] aging thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PAGE_SIZE;
    use crate::mm::fault::{cpu_stamp, page_fault_handler};
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
    fn test_aging_advances_unaccessed_pages() {
        let system = touched_system(3);
        assert_eq!(age_one_region(&system), 3);

        for page in 0..3usize {
            let view = decode(read_pte(system.pte(page)));
            assert!(
                matches!(view, PteView::Valid { age: 1, accessed: false, .. }),
                "unexpected view {view:?}"
            );
        }
        assert_eq!(system.region(0).histogram()[1], 3);
        assert_eq!(system.global_age_count.snapshot()[1], 3);

        // The region moved from age list 0 to age list 1.
        assert!(system.age_lists[0].is_empty());
        assert_eq!(
            system.age_lists[1].collect_indices(&system.regions),
            vec![0]
        );
    }

    #[test]
    fn test_accessed_bit_resets_age() {
        let system = touched_system(2);
        // Age everyone once, then stamp one page.
        age_one_region(&system);
        cpu_stamp(&system, VA_BASE);

        age_one_region(&system);

        let frame = system.vspace.translate(VA_BASE);
        assert_eq!(
            decode(read_pte(system.pte(0))),
            PteView::Valid {
                frame,
                accessed: false,
                age: 0
            }
        );
        // The untouched neighbor kept aging.
        assert!(matches!(
            decode(read_pte(system.pte(1))),
            PteView::Valid { age: 2, .. }
        ));
        let histogram = system.region(0).histogram();
        assert_eq!(histogram[0], 1);
        assert_eq!(histogram[2], 1);
    }

    #[test]
    fn test_age_saturates_at_maximum() {
        let system = touched_system(1);
        for _ in 0..NUMBER_OF_AGES + 3 {
            age_one_region(&system);
        }
        assert!(matches!(
            decode(read_pte(system.pte(0))),
            PteView::Valid { age, .. } if age == NUMBER_OF_AGES as u64 - 1
        ));
        assert_eq!(
            system.age_lists[NUMBER_OF_AGES - 1].collect_indices(&system.regions),
            vec![0]
        );
    }

    #[test]
    fn test_cursor_wraps_over_inactive_regions() {
        let system = touched_system(0);
        // Nothing active anywhere: a full rotation finds no work.
        assert_eq!(age_one_region(&system), 0);

        // Touch a page in the last region; the cursor must reach it.
        let last_region = system.regions.len() - 1;
        let va = system.va_from_pte_index(System::first_pte_of_region(last_region));
        page_fault_handler(&system, va);
        assert_eq!(age_one_region(&system), 1);
        assert!(system.region(last_region).is_active());
    }
}
