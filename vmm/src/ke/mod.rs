//! Kernel-executive analogue (ke)
//!
//! Synchronization objects and the fatal-error path shared by every
//! subsystem:
//!
//! - `KEvent`: notification / synchronization events with bounded waits
//! - `fatal_error`: the user-mode bugcheck

pub mod bugcheck;
pub mod event;

pub use bugcheck::fatal_error;
pub use event::{EventType, KEvent};
