//! Task scheduler
//!
//! The background services do not pace themselves: every second the
//! scheduler measures how fast the faulting threads are consuming pages,
//! how much each service's work costs per page (from rolling timing
//! samples the services record), and derives a target work count for the
//! ager, the trimmer, and the modified writer. Targets are published
//! atomically and the wake events signaled.
//!
//! The timing rings are written only by their owning thread and read
//! lock-free here; a torn read costs one slightly wrong statistic, never
//! correctness.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use super::pte::NUMBER_OF_AGES;
use super::System;

/// Samples kept per worker timing ring.
pub const MOD_WRITE_TIMES_TO_TRACK: usize = 16;
pub const TRIM_TIMES_TO_TRACK: usize = 16;
pub const AGE_TIMES_TO_TRACK: usize = 16;

/// Seconds of page-consumption history feeding the moving average.
pub const SECONDS_OF_PAGE_CONSUMPTION_TO_TRACK: usize = 16;

/// Worker wait bound and the scheduler tick, in milliseconds.
pub const WAKEUP_INTERVAL_IN_MS: u64 = 1000;

/// Assumed per-page cost before a worker has recorded any samples.
const DEFAULT_PER_PAGE_COST: f64 = 1e-6;

const CONSUMPTION_UNINITIALIZED: u64 = u64::MAX;

/// One duration/page-count measurement of a worker pass.
#[derive(Debug, Clone, Copy)]
pub struct TimeMeasure {
    pub duration: f64,
    pub num_pages: u64,
}

/// Wall-clock stopwatch for a worker pass.
pub struct TimeCounter {
    start: Instant,
}

impl TimeCounter {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Ring buffer of [`TimeMeasure`] samples, written by one owner thread and
/// read lock-free by the scheduler.
pub struct TimeTracker {
    durations: [AtomicU64; MOD_WRITE_TIMES_TO_TRACK],
    pages: [AtomicU64; MOD_WRITE_TIMES_TO_TRACK],
    index: AtomicUsize,
}

impl TimeTracker {
    pub fn new() -> Self {
        Self {
            durations: core::array::from_fn(|_| AtomicU64::new(0)),
            pages: core::array::from_fn(|_| AtomicU64::new(0)),
            index: AtomicUsize::new(0),
        }
    }

    /// Record one pass. Owner thread only.
    pub fn track(&self, duration: f64, num_pages: u64) {
        let index = self.index.load(Ordering::Relaxed);
        self.durations[index].store(duration.to_bits(), Ordering::Relaxed);
        self.pages[index].store(num_pages, Ordering::Relaxed);
        self.index
            .store((index + 1) % self.durations.len(), Ordering::Relaxed);
    }

    /// Mean duration and page count over the initialized samples.
    pub fn average(&self) -> Option<TimeMeasure> {
        let mut total_duration = 0.0;
        let mut total_pages = 0u64;
        let mut samples = 0u64;
        for i in 0..self.durations.len() {
            let pages = self.pages[i].load(Ordering::Relaxed);
            if pages == 0 {
                continue;
            }
            total_duration += f64::from_bits(self.durations[i].load(Ordering::Relaxed));
            total_pages += pages;
            samples += 1;
        }
        if samples == 0 {
            return None;
        }
        Some(TimeMeasure {
            duration: total_duration / samples as f64,
            num_pages: (total_pages / samples).max(1),
        })
    }

    /// Rolling cost of one page of this worker's work, in seconds.
    pub fn per_page_cost(&self) -> f64 {
        match self.average() {
            Some(average) => (average.duration / average.num_pages as f64).max(1e-9),
            None => DEFAULT_PER_PAGE_COST,
        }
    }
}

impl Default for TimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global age accounting
// ============================================================================

/// System-wide copy of the per-region age histograms, maintained by delta
/// so the scheduler can snapshot it without walking every region.
pub struct GlobalAgeCount {
    pages_of_age: [AtomicU64; NUMBER_OF_AGES],
}

impl GlobalAgeCount {
    pub fn new() -> Self {
        Self {
            pages_of_age: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one more valid page at `age`.
    pub fn increment(&self, age: usize) {
        self.pages_of_age[age].fetch_add(1, Ordering::AcqRel);
    }

    /// Apply the difference between a region's republished histogram and
    /// its prior snapshot.
    pub fn apply_delta(&self, prior: &[u16; NUMBER_OF_AGES], new: &[u16; NUMBER_OF_AGES]) {
        for age in 0..NUMBER_OF_AGES {
            let delta = new[age] as i64 - prior[age] as i64;
            if delta > 0 {
                self.pages_of_age[age].fetch_add(delta as u64, Ordering::AcqRel);
            } else if delta < 0 {
                self.pages_of_age[age].fetch_sub((-delta) as u64, Ordering::AcqRel);
            }
        }
    }

    pub fn snapshot(&self) -> [u64; NUMBER_OF_AGES] {
        core::array::from_fn(|i| self.pages_of_age[i].load(Ordering::Acquire))
    }
}

impl Default for GlobalAgeCount {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Scheduler state
// ============================================================================

/// Everything the scheduler shares with the workers and the fault path.
pub struct SchedulerState {
    /// Pages taken from the free/standby pools since the last tick.
    pub pages_consumed: AtomicU64,
    consumption: [AtomicU64; SECONDS_OF_PAGE_CONSUMPTION_TO_TRACK],
    consumption_index: AtomicUsize,

    /// Published work targets, one per service.
    pub num_ages: AtomicU64,
    pub num_trims: AtomicU64,
    pub num_mod_writes: AtomicU64,

    /// Per-worker timing rings.
    pub age_times: TimeTracker,
    pub trim_times: TimeTracker,
    pub mod_write_times: TimeTracker,

    /// The ager's rotating region cursor.
    pub ager_cursor: AtomicUsize,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            pages_consumed: AtomicU64::new(0),
            consumption: core::array::from_fn(|_| AtomicU64::new(CONSUMPTION_UNINITIALIZED)),
            consumption_index: AtomicUsize::new(0),
            num_ages: AtomicU64::new(0),
            num_trims: AtomicU64::new(0),
            num_mod_writes: AtomicU64::new(0),
            age_times: TimeTracker::new(),
            trim_times: TimeTracker::new(),
            mod_write_times: TimeTracker::new(),
            ager_cursor: AtomicUsize::new(0),
        }
    }

    /// Push one tick's consumption into the history ring.
    pub fn record_consumption(&self, consumed: u64) {
        let index = self.consumption_index.load(Ordering::Relaxed);
        self.consumption[index].store(consumed, Ordering::Relaxed);
        self.consumption_index
            .store((index + 1) % self.consumption.len(), Ordering::Relaxed);
    }

    /// Mean of the initialized history entries, never below one page per
    /// second so the time-to-exhaustion division stays finite.
    pub fn average_page_consumption(&self) -> u64 {
        let mut total = 0u64;
        let mut count = 0u64;
        for slot in &self.consumption {
            let value = slot.load(Ordering::Relaxed);
            if value == CONSUMPTION_UNINITIALIZED {
                continue;
            }
            total += value;
            count += 1;
        }
        if count == 0 {
            return 1;
        }
        (total / count).max(1)
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Target derivation
// ============================================================================

/// Inputs to one tick's target computation.
pub(crate) struct TickInputs {
    pub consumable: u64,
    pub avg_consumption: u64,
    pub total_active: u64,
    pub modified_pages: u64,
    pub age_cost: f64,
    pub trim_cost: f64,
    pub mw_cost: f64,
}

/// Per-second work targets for the three services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickTargets {
    pub num_ages: u64,
    pub num_trims: u64,
    pub num_mod_writes: u64,
}

/// Derive targets from the measured rates.
///
/// The shape for the ager and the writer is the same: compare the time
/// until the consumable pools run dry against the time the service needs
/// to finish its whole backlog. With time to spare the service runs at a
/// proportional fraction of its maximum rate; without, it runs flat out.
/// The trimmer is all-or-nothing: it replenishes one second of consumption
/// when trim-plus-writeback can no longer hide inside the remaining time.
pub(crate) fn derive_targets(inputs: &TickInputs) -> TickTargets {
    let time_until_no_pages = inputs.consumable as f64 / inputs.avg_consumption as f64;

    let max_age_rate = 1.0 / inputs.age_cost;
    let time_to_age_all =
        inputs.total_active as f64 * NUMBER_OF_AGES as f64 * inputs.age_cost;
    let num_ages = if time_to_age_all <= 0.0 {
        0
    } else if time_until_no_pages >= time_to_age_all {
        (max_age_rate * (time_to_age_all / time_until_no_pages)) as u64
    } else {
        max_age_rate as u64
    };

    let max_mw_rate = 1.0 / inputs.mw_cost;
    let time_to_empty_mod = inputs.modified_pages as f64 * inputs.mw_cost;
    let num_mod_writes = if time_to_empty_mod <= 0.0 {
        0
    } else if time_until_no_pages >= time_to_empty_mod {
        (max_mw_rate * (time_to_empty_mod / time_until_no_pages)) as u64
    } else {
        max_mw_rate as u64
    };

    let time_to_trim_and_mw =
        inputs.avg_consumption as f64 * (inputs.trim_cost + inputs.mw_cost);
    let num_trims = if time_until_no_pages <= time_to_trim_and_mw {
        inputs.avg_consumption
    } else {
        0
    };

    TickTargets {
        num_ages,
        num_trims,
        num_mod_writes,
    }
}

// ============================================================================
// Scheduler thread
// ============================================================================

/// Body of the scheduler thread.
pub fn task_scheduling_thread(system: &System) {
    system.events.system_start.wait();
    log::info!("[SCHED] task scheduling thread started");

    loop {
        if system.events.system_exit.wait_timeout(system.wakeup_interval()) {
            break;
        }

        // The two counts are read at slightly different times; each is
        // trustworthy alone, their sum is a statistic.
        let consumable = system.free_page_list.len() + system.standby_page_list.len();
        let consumed = system.sched.pages_consumed.swap(0, Ordering::AcqRel);
        system.sched.record_consumption(consumed);
        let avg_consumption = system.sched.average_page_consumption();

        let tally = system.global_age_count.snapshot();
        let total_active: u64 = tally.iter().sum();

        let targets = derive_targets(&TickInputs {
            consumable,
            avg_consumption,
            total_active,
            modified_pages: system.modified_page_list.len(),
            age_cost: system.sched.age_times.per_page_cost(),
            trim_cost: system.sched.trim_times.per_page_cost(),
            mw_cost: system.sched.mod_write_times.per_page_cost(),
        });

        if total_active == 0 {
            system.sched.num_ages.store(0, Ordering::Release);
            system.sched.num_trims.store(0, Ordering::Release);
        } else {
            system
                .sched
                .num_ages
                .store(targets.num_ages, Ordering::Release);
            system
                .sched
                .num_trims
                .store(targets.num_trims, Ordering::Release);
        }
        system
            .sched
            .num_mod_writes
            .store(targets.num_mod_writes, Ordering::Release);

        log::trace!(
            "[SCHED] consumable {} avg {} active {} -> ages {} trims {} writes {}",
            consumable,
            avg_consumption,
            total_active,
            targets.num_ages,
            targets.num_trims,
            targets.num_mod_writes
        );

        system.events.mw_wake.set();
        system.events.age_wake.set();
        system.events.trim_wake.set();
    }

    log::info!("[SCHED] task scheduling thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_average_skips_uninitialized() {
        let tracker = TimeTracker::new();
        assert!(tracker.average().is_none());
        assert_eq!(tracker.per_page_cost(), DEFAULT_PER_PAGE_COST);

        tracker.track(0.2, 100);
        tracker.track(0.4, 100);
        let average = tracker.average().unwrap();
        assert!((average.duration - 0.3).abs() < 1e-9);
        assert_eq!(average.num_pages, 100);
        assert!((tracker.per_page_cost() - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_wraps() {
        let tracker = TimeTracker::new();
        for i in 0..MOD_WRITE_TIMES_TO_TRACK + 4 {
            tracker.track(1.0, i as u64 + 1);
        }
        // All slots initialized; the oldest four were overwritten.
        let average = tracker.average().unwrap();
        assert!(average.num_pages > 2);
    }

    #[test]
    fn test_consumption_average_floor() {
        let state = SchedulerState::new();
        assert_eq!(state.average_page_consumption(), 1);

        state.record_consumption(0);
        assert_eq!(state.average_page_consumption(), 1);

        state.record_consumption(30);
        state.record_consumption(10);
        // (0 + 30 + 10) / 3
        assert_eq!(state.average_page_consumption(), 13);
    }

    #[test]
    fn test_global_age_count_delta() {
        let count = GlobalAgeCount::new();
        count.increment(0);
        count.increment(0);
        count.increment(3);

        let mut prior = [0u16; NUMBER_OF_AGES];
        prior[0] = 2;
        prior[3] = 1;
        let mut new = [0u16; NUMBER_OF_AGES];
        new[1] = 2;
        count.apply_delta(&prior, &new);

        let snapshot = count.snapshot();
        assert_eq!(snapshot[0], 0);
        assert_eq!(snapshot[1], 2);
        assert_eq!(snapshot[3], 0);
    }

    #[test]
    fn test_targets_scale_down_with_spare_time() {
        // Twenty seconds of consumable pages: every service throttles to
        // a fraction of its maximum rate and trimming is skipped.
        let targets = derive_targets(&TickInputs {
            consumable: 2_000,
            avg_consumption: 100,
            total_active: 10_000,
            modified_pages: 1_000,
            age_cost: 1e-5,
            trim_cost: 1e-5,
            mw_cost: 1e-4,
        });
        // time_to_age_all = 0.8s of a 20s window: 4% of the 100k/s max.
        assert!(targets.num_ages > 3_900 && targets.num_ages < 4_100);
        // time_to_empty_mod = 0.1s of 20s: 0.5% of the 10k/s max.
        assert!(targets.num_mod_writes > 45 && targets.num_mod_writes < 55);
        assert_eq!(targets.num_trims, 0);
    }

    #[test]
    fn test_targets_saturate_under_pressure() {
        // A tenth of a second of pages left: the ager and the writer run
        // flat out, and trim-plus-writeback no longer fits in the
        // remaining time, so the trimmer replenishes a full second of
        // consumption.
        let targets = derive_targets(&TickInputs {
            consumable: 10,
            avg_consumption: 100,
            total_active: 10_000,
            modified_pages: 5_000,
            age_cost: 1e-5,
            trim_cost: 1e-3,
            mw_cost: 1e-3,
        });
        assert_eq!(targets.num_ages, (1.0f64 / 1e-5) as u64);
        assert_eq!(targets.num_mod_writes, (1.0f64 / 1e-3) as u64);
        assert_eq!(targets.num_trims, 100);
    }

    #[test]
    fn test_targets_idle_system() {
        let targets = derive_targets(&TickInputs {
            consumable: 1_000,
            avg_consumption: 1,
            total_active: 0,
            modified_pages: 0,
            age_cost: DEFAULT_PER_PAGE_COST,
            trim_cost: DEFAULT_PER_PAGE_COST,
            mw_cost: DEFAULT_PER_PAGE_COST,
        });
        assert_eq!(targets.num_ages, 0);
        assert_eq!(targets.num_mod_writes, 0);
        assert_eq!(targets.num_trims, 0);
    }
}
