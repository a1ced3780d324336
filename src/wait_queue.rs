//! Wait queue implementation.
//!
//! A [`WaitQueue`] parks threads until another thread wakes all of them. Both the decision to park
//! and the bookkeeping of a wake-up run while the queue is locked, so a waker either sees a
//! sleeper that decided to park, or the sleeper sees the state change that preceded the wake-up.

use std::fmt;
#[cfg(feature = "loom")]
use std::mem::take;
#[cfg(not(feature = "loom"))]
use std::ptr::from_ref;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::Ordering::Relaxed;
#[cfg(feature = "loom")]
use std::sync::PoisonError;

#[cfg(feature = "loom")]
use loom::sync::{Condvar, Mutex};
#[cfg(not(feature = "loom"))]
use parking_lot_core::{
    DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, FilterOp, ParkResult, UnparkResult,
};

/// Queue of parked threads.
///
/// Outside `loom`, the queue lives in the global `parking_lot_core` hash table keyed by the
/// address of the [`WaitQueue`], so the [`WaitQueue`] itself only tracks the number of sleepers.
pub(crate) struct WaitQueue {
    /// Number of parked threads.
    #[cfg(not(feature = "loom"))]
    parked: AtomicUsize,
    /// Sleepers protected by the queue lock.
    #[cfg(feature = "loom")]
    sleepers: Mutex<Sleepers>,
    /// Signalled when the epoch advances.
    #[cfg(feature = "loom")]
    condvar: Condvar,
}

/// Sleeper bookkeeping for the `loom` wait queue.
#[cfg(feature = "loom")]
#[derive(Debug, Default)]
struct Sleepers {
    /// Advances on every wake-up that found sleepers.
    epoch: usize,
    /// Number of parked threads.
    parked: usize,
}

#[cfg(not(feature = "loom"))]
impl WaitQueue {
    /// Creates a new [`WaitQueue`].
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            parked: AtomicUsize::new(0),
        }
    }

    /// Parks the current thread if `should_sleep` returns `true`.
    ///
    /// `should_sleep` runs while the queue is locked and must not block. Returns `true` if the
    /// thread was parked and then woken up.
    pub(crate) fn sleep_until<F: FnOnce() -> bool>(&self, should_sleep: F) -> bool {
        let validate = || {
            if should_sleep() {
                self.parked.fetch_add(1, Relaxed);
                true
            } else {
                false
            }
        };

        // SAFETY: the key is the address of `self`, which is unique while `self` is borrowed, and
        // neither closure panics nor calls into `parking_lot_core`.
        let result = unsafe {
            parking_lot_core::park(
                self.key(),
                validate,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                None,
            )
        };
        matches!(result, ParkResult::Unparked(_))
    }

    /// Wakes up every parked thread.
    ///
    /// `on_wake` receives the number of woken threads and runs while the queue is locked, before
    /// any of them resumes. Returns the number of woken threads.
    pub(crate) fn wake_all<F: FnOnce(usize)>(&self, on_wake: F) -> usize {
        let callback = |result: UnparkResult| {
            self.parked.fetch_sub(result.unparked_threads, Relaxed);
            on_wake(result.unparked_threads);
            DEFAULT_UNPARK_TOKEN
        };

        // SAFETY: see `sleep_until`.
        let result =
            unsafe { parking_lot_core::unpark_filter(self.key(), |_| FilterOp::Unpark, callback) };
        result.unparked_threads
    }

    /// Runs `f` with the number of parked threads while the queue is locked.
    ///
    /// No thread is woken, and no thread can park or be woken while `f` runs.
    pub(crate) fn inspect<F: FnOnce(usize)>(&self, f: F) {
        let callback = |_: UnparkResult| {
            f(self.parked.load(Relaxed));
            DEFAULT_UNPARK_TOKEN
        };

        // SAFETY: see `sleep_until`.
        unsafe {
            parking_lot_core::unpark_filter(self.key(), |_| FilterOp::Skip, callback);
        }
    }

    /// Returns the number of parked threads.
    #[inline]
    pub(crate) fn parked(&self) -> usize {
        self.parked.load(Relaxed)
    }

    /// Returns the parking key.
    #[inline]
    fn key(&self) -> usize {
        from_ref(self).addr()
    }
}

#[cfg(feature = "loom")]
impl WaitQueue {
    /// Creates a new [`WaitQueue`].
    pub(crate) fn new() -> Self {
        Self {
            sleepers: Mutex::new(Sleepers::default()),
            condvar: Condvar::new(),
        }
    }

    /// Parks the current thread if `should_sleep` returns `true`.
    pub(crate) fn sleep_until<F: FnOnce() -> bool>(&self, should_sleep: F) -> bool {
        let mut sleepers = self.sleepers.lock().unwrap_or_else(PoisonError::into_inner);
        if !should_sleep() {
            return false;
        }
        sleepers.parked += 1;
        let epoch = sleepers.epoch;
        while sleepers.epoch == epoch {
            sleepers = self
                .condvar
                .wait(sleepers)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    /// Wakes up every parked thread.
    pub(crate) fn wake_all<F: FnOnce(usize)>(&self, on_wake: F) -> usize {
        let mut sleepers = self.sleepers.lock().unwrap_or_else(PoisonError::into_inner);
        let woken = take(&mut sleepers.parked);
        on_wake(woken);
        if woken != 0 {
            sleepers.epoch = sleepers.epoch.wrapping_add(1);
            self.condvar.notify_all();
        }
        woken
    }

    /// Runs `f` with the number of parked threads while the queue is locked.
    pub(crate) fn inspect<F: FnOnce(usize)>(&self, f: F) {
        let sleepers = self.sleepers.lock().unwrap_or_else(PoisonError::into_inner);
        f(sleepers.parked);
    }

    /// Returns the number of parked threads.
    pub(crate) fn parked(&self) -> usize {
        self.sleepers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .parked
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("parked", &self.parked())
            .finish()
    }
}
