//! Implementations of locking traits from the [`lock_api`](https://crates.io/crates/lock_api)
//! crate.

use super::{Config, Lock};

/// A reader-writer lock for protecting shared data of type `T`.
///
/// Unlike the raw [`Lock`], the exclusive side of [`RwLock`] is not re-entrant: a thread that
/// already holds a write guard panics when it asks for another one, since two guards would alias
/// the same mutable data.
///
/// # Examples
///
/// ```
/// use wordlock::RwLock;
///
/// let rwlock: RwLock<usize> = RwLock::new(0);
/// ```
pub type RwLock<T> = lock_api::RwLock<Lock, T>;

/// An RAII implementation of a scoped read lock.
///
/// # Examples
///
/// ```
/// use wordlock::{RwLock, RwLockReadGuard};
///
/// let rwlock: RwLock<usize> = RwLock::new(0);
/// let guard: RwLockReadGuard<usize> = rwlock.read();
/// assert_eq!(*guard, 0);
/// ```
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, Lock, T>;

/// An RAII implementation of a scoped write lock.
///
/// # Examples
///
/// ```
/// use wordlock::{RwLock, RwLockWriteGuard};
///
/// let rwlock: RwLock<usize> = RwLock::new(0);
/// let mut guard: RwLockWriteGuard<usize> = rwlock.write();
/// *guard += 1;
/// drop(guard);
///
/// assert_eq!(*rwlock.read(), 1);
/// ```
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, Lock, T>;

unsafe impl<C: Config> lock_api::RawRwLock for Lock<C> {
    const INIT: Self = Lock::with_config();

    // Exclusive ownership is tied to the identity of the acquiring thread.
    type GuardMarker = lock_api::GuardNoSend;

    #[inline]
    fn lock_shared(&self) {
        self.read_lock();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.try_read_lock()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        let result = self.read_unlock();
        debug_assert!(result.is_ok(), "{result:?}");
    }

    #[inline]
    fn lock_exclusive(&self) {
        assert!(
            !self.is_owned_by_current(),
            "write guard requested by the thread that already holds one"
        );
        self.write_lock();
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        !self.is_owned_by_current() && self.try_write_lock()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        let result = self.write_unlock();
        debug_assert!(result.is_ok(), "{result:?}");
    }

    #[inline]
    fn is_locked(&self) -> bool {
        !self.is_free(std::sync::atomic::Ordering::Relaxed)
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        Lock::is_locked(self, std::sync::atomic::Ordering::Relaxed)
    }
}

unsafe impl<C: Config> lock_api::RawRwLockDowngrade for Lock<C> {
    #[inline]
    unsafe fn downgrade(&self) {
        let result = Lock::downgrade(self);
        debug_assert!(result.is_ok(), "{result:?}");
    }
}
