//! Invariant verification
//!
//! Whole-system consistency checks for a quiesced system (no worker or
//! faulting thread running). Tests call these after deterministic
//! sequences and at the end of threaded runs; debug builds also run them
//! during teardown.

use std::collections::HashSet;

use super::pfn::{PfnState, PTE_INDEX_NONE};
use super::pte::{decode, read_pte, PteView, NUMBER_OF_AGES};
use super::System;

/// Run every check.
pub fn verify_system(system: &System) {
    verify_page_lists(system);
    verify_pte_pfn_relationship(system);
    verify_regions(system);
    verify_global_age_count(system);
    verify_disc_slots(system);
}

/// Frame state and list membership agree, and the counts are honest.
pub fn verify_page_lists(system: &System) {
    let free: HashSet<u64> = system
        .free_page_list
        .collect_frames(&system.pfns)
        .into_iter()
        .collect();
    let modified: HashSet<u64> = system
        .modified_page_list
        .collect_frames(&system.pfns)
        .into_iter()
        .collect();
    let standby: HashSet<u64> = system
        .standby_page_list
        .collect_frames(&system.pfns)
        .into_iter()
        .collect();

    assert_eq!(free.len() as u64, system.free_page_list.len());
    assert_eq!(modified.len() as u64, system.modified_page_list.len());
    assert_eq!(standby.len() as u64, system.standby_page_list.len());

    for frame in 1..=system.config.physical_pages {
        let state = system.pfn(frame).state();
        let membership = (
            free.contains(&frame),
            modified.contains(&frame),
            standby.contains(&frame),
        );
        let expected = match state {
            PfnState::Free => (true, false, false),
            PfnState::Modified => (false, true, false),
            PfnState::Standby => (false, false, true),
            PfnState::Active => (false, false, false),
        };
        assert_eq!(
            membership, expected,
            "frame {frame} in state {state:?} has list membership {membership:?}"
        );
    }
}

/// Every PTE is in exactly one view, and frame-carrying views point at a
/// PFN that points back.
pub fn verify_pte_pfn_relationship(system: &System) {
    for pte_index in 0..system.num_ptes() {
        match decode(read_pte(system.pte(pte_index))) {
            PteView::Zero => {}
            PteView::Valid { frame, .. } => {
                let pfn = system.pfn(frame);
                assert_eq!(pfn.state(), PfnState::Active, "valid PTE {pte_index}");
                assert_eq!(pfn.pte_index(), pte_index as u64, "valid PTE {pte_index}");
                assert_ne!(
                    system.vspace.translate(system.va_from_pte_index(pte_index)),
                    0,
                    "valid PTE {pte_index} has no host mapping"
                );
            }
            PteView::Transition { frame } => {
                let pfn = system.pfn(frame);
                assert!(
                    matches!(pfn.state(), PfnState::Modified | PfnState::Standby),
                    "transition PTE {pte_index} frame in state {:?}",
                    pfn.state()
                );
                assert_eq!(pfn.pte_index(), pte_index as u64, "transition PTE {pte_index}");
                assert_eq!(
                    system.vspace.translate(system.va_from_pte_index(pte_index)),
                    0,
                    "transition PTE {pte_index} still mapped"
                );
            }
            PteView::OnDisc { slot } => {
                assert!(
                    system.disc_in_use.get_bit(slot),
                    "disc PTE {pte_index} references unclaimed slot {slot}"
                );
            }
        }
    }

    // Free frames own nothing.
    for frame in 1..=system.config.physical_pages {
        let pfn = system.pfn(frame);
        if pfn.state() == PfnState::Free {
            assert_eq!(pfn.pte_index(), PTE_INDEX_NONE, "free frame {frame} owns a PTE");
        }
    }
}

/// Region activity, histograms, and age-list placement agree.
pub fn verify_regions(system: &System) {
    let mut memberships: Vec<Option<usize>> = vec![None; system.regions.len()];
    for (age, list) in system.age_lists.iter().enumerate() {
        for index in list.collect_indices(&system.regions) {
            assert!(
                memberships[index as usize].is_none(),
                "region {index} on more than one age list"
            );
            memberships[index as usize] = Some(age);
        }
    }

    for (index, region) in system.regions.iter().enumerate() {
        let histogram = region.histogram();
        let population: u64 = histogram.iter().map(|&count| count as u64).sum();

        if region.is_active() {
            assert!(population > 0, "active region {index} has no counted pages");
            let oldest = region
                .oldest_age()
                .expect("active region has an oldest age");
            assert_eq!(
                memberships[index],
                Some(oldest),
                "active region {index} misplaced among the age lists"
            );
        } else {
            assert_eq!(population, 0, "inactive region {index} has counted pages");
            assert!(memberships[index].is_none(), "inactive region {index} on a list");
        }
    }
}

/// The global per-age counters equal the sum of the region histograms.
pub fn verify_global_age_count(system: &System) {
    let mut sums = [0u64; NUMBER_OF_AGES];
    for region in system.regions.iter() {
        let histogram = region.histogram();
        for age in 0..NUMBER_OF_AGES {
            sums[age] += histogram[age] as u64;
        }
    }
    assert_eq!(sums, system.global_age_count.snapshot());
}

/// No paging-file slot has two owners, the bitmap covers every owner, and
/// the free-space counter is honest.
pub fn verify_disc_slots(system: &System) {
    let mut owners: HashSet<u64> = HashSet::new();

    for pte_index in 0..system.num_ptes() {
        if let PteView::OnDisc { slot } = decode(read_pte(system.pte(pte_index))) {
            assert!(owners.insert(slot), "slot {slot} owned by two PTEs");
        }
    }
    for frame in 1..=system.config.physical_pages {
        let pfn = system.pfn(frame);
        if pfn.state() == PfnState::Standby {
            let slot = pfn.disc_index();
            assert!(owners.insert(slot), "slot {slot} owned twice (standby frame {frame})");
        }
    }
    for &slot in &owners {
        assert!(system.disc_in_use.get_bit(slot), "owned slot {slot} not claimed");
    }

    let mut set_bits = 0u64;
    let chunks = system.config.disc_pages.div_ceil(64);
    for chunk in 0..chunks {
        set_bits += system.disc_in_use.chunk_value(chunk).count_ones() as u64;
    }
    assert_eq!(
        system.disc_in_use.unset_spaces(),
        system.config.disc_pages - set_bits,
        "bitmap free-space counter out of sync"
    );
    assert_eq!(
        set_bits,
        owners.len() as u64,
        "claimed slots without an owning PTE or standby frame"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PAGE_SIZE;
    use crate::mm::fault::page_fault_handler;
    use crate::mm::trimmer::{compute_trim_quotas, trim_one_region};
    use crate::mm::{initialize_system, modwriter, SystemConfig, VA_BASE};

    #[test]
    fn test_verify_accepts_each_lifecycle_stage() {
        let system = initialize_system(SystemConfig {
            physical_pages: 8,
            virtual_pages: 24,
            disc_pages: 24,
            faulting_threads: 1,
            passthroughs: 1,
            wakeup_interval_ms: 10,
        });
        verify_system(&system);

        // Active pages.
        for page in 0..4u64 {
            page_fault_handler(&system, VA_BASE + page * PAGE_SIZE as u64);
        }
        verify_system(&system);

        // Modified pages.
        let mut quotas = compute_trim_quotas(&system, 2);
        assert_eq!(trim_one_region(&system, &mut quotas), 2);
        verify_system(&system);

        // Standby pages with claimed slots.
        let mut target = 2u64;
        assert_eq!(modwriter::write_pages_to_disc(&system, &mut target), 2);
        verify_system(&system);

        // Disc pages after repurposing.
        for page in 4..14u64 {
            page_fault_handler(&system, VA_BASE + page * PAGE_SIZE as u64);
        }
        verify_system(&system);
    }
}
