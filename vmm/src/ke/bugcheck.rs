//! Fatal error handling
//!
//! The state machine has no recoverable path out of an invariant violation:
//! a frame on the wrong list or a PTE in a forbidden state means the
//! translation tables can no longer be trusted. The only safe response is
//! to stop the process, the user-mode equivalent of a bugcheck.

/// Terminate the process after logging the reason.
///
/// Recoverable conditions (benign races, resource exhaustion) never come
/// through here; they are handled locally by their callers.
pub fn fatal_error(msg: &str) -> ! {
    log::error!("[KE] fatal: {msg}");
    std::process::abort();
}
