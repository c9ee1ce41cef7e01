//! Kernel Event Implementation (KEVENT)
//!
//! Events are signaling objects used between the scheduler, the background
//! services, and faulting threads.
//!
//! Two types of events:
//! - **Notification (Manual Reset)**: Stays signaled until explicitly reset.
//!   Wakes ALL waiting threads when signaled.
//! - **Synchronization (Auto Reset)**: The signal is consumed by the first
//!   thread that waits on it. Only one waiter is released per signal.
//!
//! # Usage
//! ```
//! use vmm::ke::{EventType, KEvent};
//!
//! let event = KEvent::new(EventType::Notification, false);
//! assert!(!event.is_signaled());
//! event.set();
//! event.wait();
//! ```

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Notification event (manual reset)
    /// - Wakes ALL waiters when signaled
    /// - Stays signaled until explicitly reset
    Notification,
    /// Synchronization event (auto reset)
    /// - Releases ONE waiter per signal
    /// - Automatically resets when the signal is consumed
    Synchronization,
}

/// Kernel Event
pub struct KEvent {
    state: Mutex<bool>,
    cvar: Condvar,
    event_type: EventType,
}

impl KEvent {
    /// Create an event of the given type and initial signal state.
    pub fn new(event_type: EventType, initial_state: bool) -> Self {
        Self {
            state: Mutex::new(initial_state),
            cvar: Condvar::new(),
            event_type,
        }
    }

    /// Get the event type
    #[inline]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Check if the event is signaled without consuming the signal.
    pub fn is_signaled(&self) -> bool {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Set (signal) the event.
    ///
    /// For notification events every current and future waiter observes the
    /// signal until `reset`. For synchronization events the signal latches
    /// until one waiter consumes it.
    ///
    /// Returns the previous signal state.
    pub fn set(&self) -> bool {
        let mut state = self.lock_state();
        let was_signaled = *state;
        *state = true;
        drop(state);

        match self.event_type {
            EventType::Notification => self.cvar.notify_all(),
            EventType::Synchronization => self.cvar.notify_one(),
        }
        was_signaled
    }

    /// Reset (unsignal) the event. Returns the previous signal state.
    pub fn reset(&self) -> bool {
        let mut state = self.lock_state();
        let was_signaled = *state;
        *state = false;
        was_signaled
    }

    /// Wait until the event is signaled.
    ///
    /// For synchronization events the signal is consumed before returning.
    pub fn wait(&self) {
        let mut state = self.lock_state();
        while !*state {
            state = match self.cvar.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if self.event_type == EventType::Synchronization {
            *state = false;
        }
    }

    /// Wait until the event is signaled or the timeout elapses.
    ///
    /// Returns `true` if the event was signaled, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _result) = match self.cvar.wait_timeout(state, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
        if self.event_type == EventType::Synchronization {
            *state = false;
        }
        true
    }

    /// Consume the signal if present, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut state = self.lock_state();
        if !*state {
            return false;
        }
        if self.event_type == EventType::Synchronization {
            *state = false;
        }
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notification_stays_signaled() {
        let event = KEvent::new(EventType::Notification, false);
        assert!(!event.is_signaled());

        event.set();
        assert!(event.is_signaled());
        event.wait();
        assert!(event.is_signaled());

        event.reset();
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_synchronization_auto_resets() {
        let event = KEvent::new(EventType::Synchronization, true);
        event.wait();
        assert!(!event.is_signaled());

        event.set();
        assert!(event.try_wait());
        assert!(!event.try_wait());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = KEvent::new(EventType::Synchronization, false);
        assert!(!event.wait_timeout(Duration::from_millis(20)));

        event.set();
        assert!(event.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_notification_wakes_all_waiters() {
        let event = KEvent::new(EventType::Notification, false);
        let woken = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    event.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                });
            }
            std::thread::sleep(Duration::from_millis(50));
            event.set();
        });

        assert_eq!(woken.load(Ordering::SeqCst), 4);
    }
}
