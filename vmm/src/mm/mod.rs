//! Memory Manager (mm)
//!
//! The concurrent state machine over page-frames and page-table entries,
//! together with the four cooperating background services and the user
//! fault path:
//!
//! - **PTE table**: packed entries in lockable 512-entry regions
//! - **PFN database**: per-frame state, back-pointers, list linkage
//! - **Page lists**: free, modified, and standby frames
//! - **Fault handler**: first-touch, soft, and hard fault resolution
//! - **Ager / Trimmer / Modified writer**: page replacement services
//! - **Scheduler**: derives per-second work targets for the services
//!
//! # Lock ordering (strict)
//!
//! ```text
//! PTE-region lock ≺ PFN lock ≺ page-list lock ≺ age-list lock ≺ staging-VA lock
//! ```
//!
//! The only reversed acquisitions are trylocks that never wait: the page
//! lists taking PFN locks while walking, and `pop_any_locked` taking
//! region locks under an age-list lock.

pub mod ager;
pub mod fault;
pub mod modwriter;
pub mod page_list;
pub mod pfn;
pub mod pte;
pub mod scheduler;
pub mod trimmer;
pub mod user;
pub mod verify;

use core::sync::atomic::AtomicU64;
use std::time::Duration;

use crate::hal::{AddressSpace, PageFile, PhysicalMemory, PAGE_SIZE};
use crate::ke::{fatal_error, EventType, KEvent};
use crate::rtl::InterlockedBitmap;

use page_list::PageList;
use pfn::Pfn;
use pte::{PteRegion, RegionList, NUMBER_OF_AGES, PTE_REGION_SIZE};
use scheduler::{GlobalAgeCount, SchedulerState, WAKEUP_INTERVAL_IN_MS};

pub use pfn::{PfnFlags, PfnSnapshot, PfnState};
pub use pte::{decode, encode_disc, encode_transition, encode_valid, read_pte, write_pte, PteView};
pub use user::FaultStats;

/// Base of the managed user virtual range.
pub const VA_BASE: u64 = 0x0000_1000_0000_0000;

/// Largest batch the modified writer moves in one pass.
pub const MAX_MOD_BATCH: usize = 256;

/// System sizing and harness parameters.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Physical frames granted by the host.
    pub physical_pages: u64,
    /// Pages in the managed user range.
    pub virtual_pages: u64,
    /// Paging-file slots. Must exceed `virtual_pages - physical_pages`:
    /// standby pages hold a frame and a slot at once, so a paging file
    /// with no headroom over the overcommit can strand the writer with
    /// every slot claimed exactly when the consumable pools run dry.
    pub disc_pages: u64,
    /// User threads sweeping the virtual range.
    pub faulting_threads: usize,
    /// Full sweeps of the range per faulting thread.
    pub passthroughs: u64,
    /// Scheduler tick and worker wait bound, in milliseconds.
    pub wakeup_interval_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            physical_pages: 4096,
            virtual_pages: 16384,
            disc_pages: 13312,
            faulting_threads: 4,
            passthroughs: 2,
            wakeup_interval_ms: WAKEUP_INTERVAL_IN_MS,
        }
    }
}

/// Private staging ranges mapped and unmapped under their own locks, the
/// last level of the lock order.
pub struct StagingVas {
    /// Contiguous window the modified writer maps its batch into.
    pub modified_write_va: u64,
    /// Single page for paging-file reads during hard faults.
    pub modified_read_va: u64,
    /// Single page for zeroing repurposed standby frames.
    pub repurpose_zero_va: u64,
    pub modified_read_lock: spin::Mutex<()>,
    pub repurpose_zero_lock: spin::Mutex<()>,
}

/// The event set coordinating the threads.
pub struct SystemEvents {
    /// Gate released once all threads are spawned.
    pub system_start: KEvent,
    /// Broadcast asking every thread to finish.
    pub system_exit: KEvent,
    /// Signaled by the writer when frames become consumable.
    pub pages_available: KEvent,
    pub age_wake: KEvent,
    pub trim_wake: KEvent,
    pub mw_wake: KEvent,
}

impl SystemEvents {
    fn new() -> Self {
        Self {
            system_start: KEvent::new(EventType::Notification, false),
            system_exit: KEvent::new(EventType::Notification, false),
            pages_available: KEvent::new(EventType::Synchronization, false),
            age_wake: KEvent::new(EventType::Synchronization, false),
            trim_wake: KEvent::new(EventType::Synchronization, false),
            mw_wake: KEvent::new(EventType::Synchronization, false),
        }
    }
}

/// The one instance owning every table, list, lock, and event.
///
/// Workers and the fault handler borrow it; nothing inside is reachable
/// without going through the locking protocol.
pub struct System {
    pub config: SystemConfig,

    pub phys: PhysicalMemory,
    pub vspace: AddressSpace,
    pub pagefile: PageFile,
    /// Occupancy of the paging-file slots.
    pub disc_in_use: InterlockedBitmap,

    pub ptes: Box<[AtomicU64]>,
    pub regions: Box<[PteRegion]>,
    pub age_lists: [RegionList; NUMBER_OF_AGES],

    pub pfns: Box<[Pfn]>,
    pub free_page_list: PageList,
    pub modified_page_list: PageList,
    pub standby_page_list: PageList,

    pub global_age_count: GlobalAgeCount,
    pub events: SystemEvents,
    pub sched: SchedulerState,
    pub staging: StagingVas,
}

/// Build the system: tables sized from the config, every frame on the
/// free list, the whole user range in the never-accessed state.
pub fn initialize_system(config: SystemConfig) -> System {
    if config.physical_pages == 0 || config.virtual_pages == 0 || config.disc_pages == 0 {
        fatal_error("initialize_system : degenerate frame, virtual, or disc pool");
    }
    let overcommit = config.virtual_pages.saturating_sub(config.physical_pages);
    if config.disc_pages <= overcommit && overcommit > 0 {
        log::warn!(
            "[MM] paging file has no headroom: {} slots for {} overcommitted pages",
            config.disc_pages,
            overcommit
        );
    }

    let user_pages = config.virtual_pages;
    let num_regions = user_pages.div_ceil(PTE_REGION_SIZE as u64);
    let staging_pages = MAX_MOD_BATCH as u64 + 2;

    let modified_write_va = VA_BASE + user_pages * PAGE_SIZE as u64;
    let modified_read_va = modified_write_va + MAX_MOD_BATCH as u64 * PAGE_SIZE as u64;
    let repurpose_zero_va = modified_read_va + PAGE_SIZE as u64;

    let phys = PhysicalMemory::new(config.physical_pages);
    let vspace = AddressSpace::new(VA_BASE, user_pages + staging_pages);
    let pagefile = PageFile::new(config.disc_pages);
    let disc_in_use = InterlockedBitmap::new(config.disc_pages);

    let ptes: Box<[AtomicU64]> = (0..user_pages).map(|_| AtomicU64::new(0)).collect();
    let regions: Box<[PteRegion]> = (0..num_regions).map(|_| PteRegion::new()).collect();
    let pfns: Box<[Pfn]> = (0..=config.physical_pages).map(|_| Pfn::new()).collect();

    let free_page_list = PageList::new("free");
    for frame in 1..=config.physical_pages {
        free_page_list.push_tail(&pfns, frame);
    }

    let system = System {
        config,
        phys,
        vspace,
        pagefile,
        disc_in_use,
        ptes,
        regions,
        age_lists: core::array::from_fn(|_| RegionList::new()),
        pfns,
        free_page_list,
        modified_page_list: PageList::new("modified"),
        standby_page_list: PageList::new("standby"),
        global_age_count: GlobalAgeCount::new(),
        events: SystemEvents::new(),
        sched: SchedulerState::new(),
        staging: StagingVas {
            modified_write_va,
            modified_read_va,
            repurpose_zero_va,
            modified_read_lock: spin::Mutex::new(()),
            repurpose_zero_lock: spin::Mutex::new(()),
        },
    };

    log::info!(
        "[MM] initialized: {} frames, {} disc slots, {} PTEs in {} regions",
        system.config.physical_pages,
        system.config.disc_pages,
        system.num_ptes(),
        system.regions.len()
    );
    system
}

/// Tear the system down. The paging file and all state are discarded.
pub fn deinitialize_system(system: System) {
    if cfg!(debug_assertions) {
        verify::verify_system(&system);
    }
    log::info!("[MM] deinitialized");
    drop(system);
}

impl System {
    /// Pages in the managed user range.
    #[inline]
    pub fn user_pages(&self) -> u64 {
        self.ptes.len() as u64
    }

    #[inline]
    pub fn num_ptes(&self) -> usize {
        self.ptes.len()
    }

    #[inline]
    pub fn pte(&self, index: usize) -> &AtomicU64 {
        &self.ptes[index]
    }

    #[inline]
    pub fn pfn(&self, frame: u64) -> &Pfn {
        &self.pfns[frame as usize]
    }

    #[inline]
    pub fn region(&self, index: usize) -> &PteRegion {
        &self.regions[index]
    }

    /// PTE index of a user virtual address.
    pub fn pte_index_from_va(&self, va: u64) -> usize {
        if va < VA_BASE {
            fatal_error("pte_index_from_va : virtual address below the user range");
        }
        let index = ((va - VA_BASE) / PAGE_SIZE as u64) as usize;
        if index >= self.ptes.len() {
            fatal_error("pte_index_from_va : virtual address beyond the user range");
        }
        index
    }

    /// First address of the page a PTE describes.
    pub fn va_from_pte_index(&self, index: usize) -> u64 {
        if index >= self.ptes.len() {
            fatal_error("va_from_pte_index : PTE index out of range");
        }
        VA_BASE + index as u64 * PAGE_SIZE as u64
    }

    /// Region owning a PTE.
    #[inline]
    pub fn region_index_of_pte(index: usize) -> usize {
        index / PTE_REGION_SIZE
    }

    /// First PTE of a region.
    #[inline]
    pub fn first_pte_of_region(region_index: usize) -> usize {
        region_index * PTE_REGION_SIZE
    }

    /// Resolve a mapped virtual address to a raw byte pointer.
    ///
    /// Fatal when the address is unmapped; dereferencing follows the same
    /// ownership rules as [`PhysicalMemory::page_ptr`].
    pub fn va_ptr(&self, va: u64) -> *mut u8 {
        let frame = self.vspace.translate(va);
        if frame == 0 {
            fatal_error("va_ptr : virtual address is not mapped");
        }
        let offset = (va % PAGE_SIZE as u64) as usize;
        // Safety: frame came from a live translation.
        unsafe { self.phys.page_ptr(frame).add(offset) }
    }

    #[inline]
    pub fn wakeup_interval(&self) -> Duration {
        Duration::from_millis(self.config.wakeup_interval_ms)
    }

    /// Spawn the services and the faulting threads, gate them on the start
    /// event, and wait for the harness to finish.
    pub fn run_system(&self) {
        let thread_count = self.config.faulting_threads.max(1);
        let stats: Vec<FaultStats> = (0..thread_count).map(|_| FaultStats::new()).collect();

        log::info!(
            "[MM] running: {} faulting threads x {} passthroughs",
            thread_count,
            self.config.passthroughs
        );

        std::thread::scope(|scope| {
            scope.spawn(|| scheduler::task_scheduling_thread(self));
            scope.spawn(|| ager::aging_thread(self));
            scope.spawn(|| trimmer::trimming_thread(self));
            scope.spawn(|| modwriter::modified_write_thread(self));

            let faulters: Vec<_> = stats
                .iter()
                .enumerate()
                .map(|(index, stats)| scope.spawn(move || user::faulting_thread(self, index, stats)))
                .collect();

            self.events.system_start.set();

            for handle in faulters {
                if handle.join().is_err() {
                    fatal_error("run_system : a faulting thread panicked");
                }
            }

            // Wake everything so the exit broadcast is seen immediately.
            self.events.system_exit.set();
            self.events.age_wake.set();
            self.events.trim_wake.set();
            self.events.mw_wake.set();
            self.events.pages_available.set();
        });

        let mut totals = [0u64; 4];
        for stat in &stats {
            let snapshot = stat.snapshot();
            totals[0] += snapshot.0;
            totals[1] += snapshot.1;
            totals[2] += snapshot.2;
            totals[3] += snapshot.3;
        }
        log::info!(
            "[MM] run complete: {} faults ({} fake), {} first accesses, {} reaccesses",
            totals[0],
            totals[1],
            totals[2],
            totals[3]
        );
    }
}
