//! User access path
//!
//! The faulting threads exercise the manager the way a CPU would: read a
//! virtual address, fault if it is unmapped, retry until the access lands.
//! Each page stores its own virtual address as a checksum, so a read
//! observing anything but zero or the owning address means page contents
//! were mixed up between VAs, which is fatal.
//!
//! Translation and data access are two steps here instead of one hardware
//! load, so every access re-validates the translation after touching the
//! page; a value read across a concurrent trim is discarded and the access
//! retries as a fault, mirroring the CPU faulting on an invalidated TLB
//! entry.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::hal::PAGE_SIZE;
use crate::ke::fatal_error;

use super::fault::{cpu_stamp, page_fault_handler, FaultOutcome};
use super::{System, VA_BASE};

/// Per-thread fault accounting.
pub struct FaultStats {
    pub num_faults: AtomicU64,
    pub num_fake_faults: AtomicU64,
    pub num_first_accesses: AtomicU64,
    pub num_reaccesses: AtomicU64,
}

impl FaultStats {
    pub fn new() -> Self {
        Self {
            num_faults: AtomicU64::new(0),
            num_fake_faults: AtomicU64::new(0),
            num_first_accesses: AtomicU64::new(0),
            num_reaccesses: AtomicU64::new(0),
        }
    }

    /// (faults, fake faults, first accesses, reaccesses)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.num_faults.load(Ordering::Acquire),
            self.num_fake_faults.load(Ordering::Acquire),
            self.num_first_accesses.load(Ordering::Acquire),
            self.num_reaccesses.load(Ordering::Acquire),
        )
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Hand out the managed range. The range is fixed at initialization, so
/// this is the whole allocation story.
pub fn allocate_memory(system: &System) -> (u64, u64) {
    (VA_BASE, system.user_pages() * PAGE_SIZE as u64)
}

/// Access a virtual address, entering the fault handler as often as it
/// takes, and maintain the page's checksum.
pub fn access_va(system: &System, stats: &FaultStats, va: u64) {
    loop {
        let frame = system.vspace.translate(va);
        if frame == 0 {
            stats.num_faults.fetch_add(1, Ordering::Relaxed);
            if page_fault_handler(system, va) == FaultOutcome::FakeFault {
                stats.num_fake_faults.fetch_add(1, Ordering::Relaxed);
            }
            continue;
        }

        let offset = (va % PAGE_SIZE as u64) as usize;
        // Safety: the frame came from a live translation; the re-checks
        // below reject values carried across a concurrent unmap.
        let page = unsafe { system.phys.page_ptr(frame).add(offset) } as *mut u64;

        let local = unsafe { ptr::read_volatile(page as *const u64) };
        if system.vspace.translate(va) != frame {
            continue;
        }

        cpu_stamp(system, va);

        if local == 0 {
            unsafe { ptr::write_volatile(page, va) };
            if system.vspace.translate(va) != frame {
                // The write raced a trim; fault and redo it.
                continue;
            }
            stats.num_first_accesses.fetch_add(1, Ordering::Relaxed);
        } else if local != va {
            fatal_error("access_va : page contents do not match the owning virtual address");
        } else {
            stats.num_reaccesses.fetch_add(1, Ordering::Relaxed);
        }
        return;
    }
}

/// Sweep the whole virtual range `passthroughs` times, starting at this
/// thread's slice so the threads spread out instead of stampeding the
/// same pages.
pub fn full_virtual_memory_test(system: &System, thread_index: usize, stats: &FaultStats) {
    let (base, num_bytes) = allocate_memory(system);
    let pages = num_bytes / PAGE_SIZE as u64;
    let threads = system.config.faulting_threads.max(1) as u64;
    let start_page = (pages / threads) * thread_index as u64;

    let start_time = Instant::now();
    for _passthrough in 0..system.config.passthroughs {
        for rep in 0..pages {
            let page = (start_page + rep) % pages;
            access_va(system, stats, base + page * PAGE_SIZE as u64);
        }
    }

    let (faults, fake_faults, first_accesses, reaccesses) = stats.snapshot();
    log::info!(
        "[MM] thread {} finished {} passthroughs ({} accesses) in {:.3}s: \
         {} faults ({} fake), {} first accesses, {} reaccesses",
        thread_index,
        system.config.passthroughs,
        system.config.passthroughs * pages,
        start_time.elapsed().as_secs_f64(),
        faults,
        fake_faults,
        first_accesses,
        reaccesses
    );
}

/// Body of one faulting thread.
pub fn faulting_thread(system: &System, thread_index: usize, stats: &FaultStats) {
    system.events.system_start.wait();
    full_virtual_memory_test(system, thread_index, stats);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::verify::verify_system;
    use crate::mm::{deinitialize_system, initialize_system, SystemConfig};

    #[test]
    fn test_access_installs_checksum() {
        let system = initialize_system(SystemConfig {
            physical_pages: 8,
            virtual_pages: 24,
            disc_pages: 24,
            faulting_threads: 1,
            passthroughs: 1,
            wakeup_interval_ms: 10,
        });
        let stats = FaultStats::new();

        access_va(&system, &stats, VA_BASE);
        let value = unsafe { ptr::read_volatile(system.va_ptr(VA_BASE) as *const u64) };
        assert_eq!(value, VA_BASE);

        access_va(&system, &stats, VA_BASE);
        let (faults, fake_faults, first_accesses, reaccesses) = stats.snapshot();
        assert_eq!(faults, 1);
        assert_eq!(fake_faults, 0);
        assert_eq!(first_accesses, 1);
        assert_eq!(reaccesses, 1);
    }

    #[test]
    fn test_single_threaded_run_fits_in_memory() {
        // Every page fits in physical memory: first touches only, no
        // replacement traffic required for completion.
        let system = initialize_system(SystemConfig {
            physical_pages: 64,
            virtual_pages: 48,
            disc_pages: 16,
            faulting_threads: 1,
            passthroughs: 2,
            wakeup_interval_ms: 10,
        });
        system.run_system();

        verify_system(&system);
        deinitialize_system(system);
    }

    #[test]
    fn test_multithreaded_run_under_pressure() {
        // The range is four times physical memory, so completing the
        // sweeps forces the full trim / write / repurpose / hard-fault
        // cycle while four threads race the services.
        let system = initialize_system(SystemConfig {
            physical_pages: 64,
            virtual_pages: 256,
            disc_pages: 256,
            faulting_threads: 4,
            passthroughs: 2,
            wakeup_interval_ms: 5,
        });
        system.run_system();

        verify_system(&system);

        // Every page was first-touched exactly once across all sweeps.
        let pages = system.user_pages();
        assert!(system.global_age_count.snapshot().iter().sum::<u64>() <= pages);
        deinitialize_system(system);
    }
}
