//! User-mode virtual memory manager driver.
//!
//! Builds a system from the environment, runs the sweep harness against
//! it, and tears it down. Sizing knobs:
//!
//! - `VMM_PHYSICAL_PAGES`: frames granted by the host
//! - `VMM_VIRTUAL_PAGES`: pages in the managed user range
//! - `VMM_DISC_PAGES`: paging-file slots
//! - `VMM_FAULTING_THREADS`: sweeping user threads
//! - `VMM_PASSTHROUGHS`: full sweeps per thread
//!
//! `RUST_LOG` controls verbosity (default `info`).

use vmm::mm::{self, SystemConfig};

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("[MM] ignoring unparsable {name}={value}");
                default
            }
        },
        Err(_) => default,
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let defaults = SystemConfig::default();
    let config = SystemConfig {
        physical_pages: env_u64("VMM_PHYSICAL_PAGES", defaults.physical_pages),
        virtual_pages: env_u64("VMM_VIRTUAL_PAGES", defaults.virtual_pages),
        disc_pages: env_u64("VMM_DISC_PAGES", defaults.disc_pages),
        faulting_threads: env_u64("VMM_FAULTING_THREADS", defaults.faulting_threads as u64)
            as usize,
        passthroughs: env_u64("VMM_PASSTHROUGHS", defaults.passthroughs),
        wakeup_interval_ms: defaults.wakeup_interval_ms,
    };
    log::info!(
        "[MM] config: {} physical pages, {} virtual pages, {} disc slots",
        config.physical_pages,
        config.virtual_pages,
        config.disc_pages
    );

    let system = mm::initialize_system(config);
    system.run_system();
    mm::deinitialize_system(system);
}
