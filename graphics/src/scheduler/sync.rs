//! CPU-side synchronization primitives.
//!
//! These types model the GPU synchronization objects the surfaces rely on:
//!
//! - [`TimelineSemaphore`]: a monotonically increasing counter. Completion of a
//!   surface slot is signaled by raising it to the value promised at submission.
//! - [`BinarySemaphore`]: a one-shot handoff between two submissions
//!   (upload → render of the same slot).
//! - [`Fence`]: CPU-waitable signal for a whole queue submission.
//!
//! The software backend uses them directly; all three are cheap to clone and
//! clones share state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Wait on `condvar` until `ready` holds or the timeout expires.
///
/// `None` waits indefinitely. Returns the final value of `ready`.
fn wait_until<T>(
    guard: &mut parking_lot::MutexGuard<'_, T>,
    condvar: &Condvar,
    timeout: Option<Duration>,
    ready: impl Fn(&T) -> bool,
) -> bool {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    while !ready(&**guard) {
        match deadline {
            Some(deadline) => {
                if condvar.wait_until(guard, deadline).timed_out() {
                    return ready(&**guard);
                }
            }
            None => condvar.wait(guard),
        }
    }
    true
}

#[derive(Debug, Default)]
struct TimelineState {
    value: Mutex<u64>,
    changed: Condvar,
}

/// Monotonically increasing counter semaphore.
#[derive(Debug, Clone, Default)]
pub struct TimelineSemaphore {
    state: Arc<TimelineState>,
}

impl TimelineSemaphore {
    /// Create a semaphore with the given initial value.
    pub fn new(initial: u64) -> Self {
        Self {
            state: Arc::new(TimelineState {
                value: Mutex::new(initial),
                changed: Condvar::new(),
            }),
        }
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        *self.state.value.lock()
    }

    /// Raise the counter to `value`.
    ///
    /// The counter never decreases: signaling a lower value is ignored.
    pub fn signal(&self, value: u64) {
        let mut current = self.state.value.lock();
        if value > *current {
            *current = value;
            self.state.changed.notify_all();
        }
    }

    /// Block until the counter reaches `value`.
    ///
    /// Returns `false` if the timeout elapsed first. `None` waits indefinitely.
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> bool {
        let mut current = self.state.value.lock();
        wait_until(&mut current, &self.state.changed, timeout, |v| *v >= value)
    }

    /// Returns true if both handles refer to the same semaphore.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

#[derive(Debug, Default)]
struct BinaryState {
    signaled: Mutex<bool>,
    changed: Condvar,
}

/// One-shot handoff semaphore.
///
/// A wait consumes the signal, so each signal satisfies exactly one waiter.
#[derive(Debug, Clone, Default)]
pub struct BinarySemaphore {
    state: Arc<BinaryState>,
}

impl BinarySemaphore {
    /// Create an unsignaled semaphore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a signal is pending (non-blocking).
    pub fn is_signaled(&self) -> bool {
        *self.state.signaled.lock()
    }

    /// Signal the semaphore.
    pub fn signal(&self) {
        *self.state.signaled.lock() = true;
        self.state.changed.notify_one();
    }

    /// Consume a pending signal without blocking.
    ///
    /// Returns `false` if no signal was pending.
    pub fn try_consume(&self) -> bool {
        std::mem::take(&mut *self.state.signaled.lock())
    }

    /// Block until signaled, then consume the signal.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.state.signaled.lock();
        let ready = wait_until(&mut signaled, &self.state.changed, timeout, |s| *s);
        if ready {
            *signaled = false;
        }
        ready
    }

    /// Returns true if both handles refer to the same semaphore.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Status of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The fence has not yet been signaled.
    Unsignaled,
    /// The fence has been signaled (submitted work complete).
    Signaled,
}

/// CPU-waitable completion signal for a queue submission.
#[derive(Debug, Clone, Default)]
pub struct Fence {
    state: Arc<BinaryState>,
}

impl Fence {
    /// Create a new fence in the unsignaled state.
    pub fn new_unsignaled() -> Self {
        Self::default()
    }

    /// Create a new fence in the signaled state.
    pub fn new_signaled() -> Self {
        let fence = Self::default();
        fence.signal();
        fence
    }

    /// Check the current status of the fence.
    pub fn status(&self) -> FenceStatus {
        if *self.state.signaled.lock() {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        }
    }

    /// Check if the fence is signaled (non-blocking).
    pub fn is_signaled(&self) -> bool {
        self.status() == FenceStatus::Signaled
    }

    /// Wait for the fence with an optional timeout.
    ///
    /// Returns `true` if the fence was signaled, `false` if the timeout elapsed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.state.signaled.lock();
        wait_until(&mut signaled, &self.state.changed, timeout, |s| *s)
    }

    /// Reset the fence to the unsignaled state.
    pub fn reset(&self) {
        *self.state.signaled.lock() = false;
    }

    /// Signal the fence.
    pub fn signal(&self) {
        *self.state.signaled.lock() = true;
        self.state.changed.notify_all();
    }
}
