//! User-mode virtual memory manager.
//!
//! This crate simulates the page-management responsibilities of an
//! operating-system kernel on top of a host facility that grants raw
//! physical frames and maps them into the program's own virtual range:
//!
//! - **PTE table**: packed 64-bit entries partitioned into lockable regions
//! - **PFN database**: per-frame state, back-pointers, and list linkage
//! - **Page lists**: free, modified, and standby lists of frames
//! - **Fault handler**: first-touch, soft, and hard fault resolution
//! - **Background services**: ager, trimmer, and modified-page writer
//! - **Scheduler**: feedback loop pacing the services against consumption
//!
//! The module split mirrors the layering of a kernel memory manager:
//! `hal` stands in for the host platform, `rtl` holds the runtime support
//! structures, `ke` the synchronization objects, and `mm` the state machine.

pub mod hal;
pub mod ke;
pub mod mm;
pub mod rtl;

pub use hal::{PAGE_SHIFT, PAGE_SIZE};
pub use ke::fatal_error;
pub use mm::{System, SystemConfig};
