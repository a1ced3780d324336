//! [`Lock`] is a recursive, upgradeable reader-writer lock packed into a single atomic word.

#![deny(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::ptr::from_ref;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed, Release};

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;
use tracing::Level;

use crate::opcode::Opcode;
use crate::state::{MAX_READERS, READ_WAITERS, State, UNLOCKED, UPGRADING, WRITE_WAITERS};
use crate::wait_queue::WaitQueue;
use crate::{Config, DefaultConfig, Error, ThreadId};

/// [`Lock`] is a recursive, upgradeable reader-writer lock packed into a single atomic word.
///
/// The locking semantics is similar to [`RwLock`](std::sync::RwLock), however, [`Lock`] only
/// provides low-level locking and releasing methods, hence forcing the user to manage the scope of
/// acquired locks and resources to protect.
///
/// * The exclusive owner is identified by [`Config::thread_id`], and may acquire the lock again
///   any number of times; each acquisition must be matched by a
///   [`write_unlock`](Self::write_unlock).
/// * Writers take priority: once a writer is parked, new shared acquisitions wait until it has
///   run, while existing shared holders drain normally.
/// * The only shared holder may [`upgrade`](Self::upgrade) to exclusive ownership, and the
///   exclusive owner may [`downgrade`](Self::downgrade) to a shared hold.
pub struct Lock<C: Config = DefaultConfig> {
    /// Lock word.
    state: AtomicUsize,
    /// Number of nested exclusive acquisitions; only modified by the exclusive owner.
    recursion: AtomicUsize,
    /// Parked readers.
    shared: WaitQueue,
    /// Parked writers and upgraders.
    exclusive: WaitQueue,
    _config: PhantomData<fn() -> C>,
}

impl Lock {
    /// Creates a new unlocked [`Lock`] using [`DefaultConfig`].
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// static LOCK: Lock = Lock::new();
    ///
    /// assert!(LOCK.is_free(Relaxed));
    /// ```
    #[cfg(not(feature = "loom"))]
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config()
    }

    /// Creates a new unlocked [`Lock`] using [`DefaultConfig`].
    #[cfg(feature = "loom")]
    #[must_use]
    pub fn new() -> Self {
        Self::with_config()
    }
}

impl<C: Config> Lock<C> {
    /// Maximum number of shared owners.
    pub const MAX_SHARED_OWNERS: usize = MAX_READERS;

    /// Creates a new unlocked [`Lock`] identifying its owners through `C`.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::{DefaultConfig, Lock};
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock: Lock<DefaultConfig> = Lock::with_config();
    /// assert!(lock.is_free(Relaxed));
    /// ```
    #[cfg(not(feature = "loom"))]
    #[inline]
    #[must_use]
    pub const fn with_config() -> Self {
        Self {
            state: AtomicUsize::new(UNLOCKED),
            recursion: AtomicUsize::new(0),
            shared: WaitQueue::new(),
            exclusive: WaitQueue::new(),
            _config: PhantomData,
        }
    }

    /// Creates a new unlocked [`Lock`] identifying its owners through `C`.
    #[cfg(feature = "loom")]
    #[must_use]
    pub fn with_config() -> Self {
        Self {
            state: AtomicUsize::new(UNLOCKED),
            recursion: AtomicUsize::new(0),
            shared: WaitQueue::new(),
            exclusive: WaitQueue::new(),
            _config: PhantomData,
        }
    }

    /// Returns `true` if the lock is currently free.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    /// assert!(lock.is_free(Relaxed));
    ///
    /// lock.read_lock();
    /// assert!(!lock.is_free(Relaxed));
    /// ```
    #[inline]
    pub fn is_free(&self, mo: Ordering) -> bool {
        State(self.state.load(mo)).is_free()
    }

    /// Returns `true` if an exclusive lock is currently held.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    /// assert!(!lock.is_locked(Relaxed));
    ///
    /// lock.write_lock();
    /// assert!(lock.is_locked(Relaxed));
    /// assert!(!lock.is_shared(Relaxed));
    /// ```
    #[inline]
    pub fn is_locked(&self, mo: Ordering) -> bool {
        State(self.state.load(mo)).is_exclusive()
    }

    /// Returns `true` if shared locks are currently held.
    #[inline]
    pub fn is_shared(&self, mo: Ordering) -> bool {
        State(self.state.load(mo)).is_shared()
    }

    /// Returns the number of shared holders.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.read_lock();
    /// lock.read_lock();
    /// assert_eq!(lock.readers(Relaxed), 2);
    /// ```
    #[inline]
    pub fn readers(&self, mo: Ordering) -> usize {
        State(self.state.load(mo)).readers()
    }

    /// Returns the exclusive owner.
    #[inline]
    pub fn owner(&self, mo: Ordering) -> Option<ThreadId> {
        State(self.state.load(mo)).owner()
    }

    /// Returns `true` if the calling thread holds the lock exclusively.
    #[inline]
    pub fn is_owned_by_current(&self) -> bool {
        State(self.state.load(Relaxed)).is_owned_by(C::thread_id())
    }

    /// Returns the number of exclusive acquisitions the owner has yet to release.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.write_lock();
    /// lock.write_lock();
    /// assert_eq!(lock.recursion_depth(), 2);
    /// ```
    #[inline]
    pub fn recursion_depth(&self) -> usize {
        self.recursion.load(Relaxed)
    }

    /// Returns the number of parked readers.
    #[inline]
    pub fn parked_readers(&self) -> usize {
        self.shared.parked()
    }

    /// Returns the number of parked writers and upgraders.
    #[inline]
    pub fn parked_writers(&self) -> usize {
        self.exclusive.parked()
    }

    /// Acquires a shared lock.
    ///
    /// Blocks while the lock is held exclusively, or while a writer or an upgrader is waiting.
    ///
    /// # Panics
    ///
    /// Panics if the number of shared holders would exceed [`Self::MAX_SHARED_OWNERS`].
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.read_lock();
    ///
    /// assert!(lock.is_shared(Relaxed));
    /// assert!(!lock.try_write_lock());
    /// ```
    #[inline]
    pub fn read_lock(&self) {
        while !self.try_read_lock() {
            self.wait(Opcode::Shared);
        }
    }

    /// Tries to acquire a shared lock.
    ///
    /// Returns `false` if the lock is held exclusively, or a writer or an upgrader is waiting.
    ///
    /// # Panics
    ///
    /// Panics if the number of shared holders would exceed [`Self::MAX_SHARED_OWNERS`].
    #[inline]
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.load(Relaxed);
        while State(state).can_read() {
            let next_state = State(state).with_reader_added().0;
            match self
                .state
                .compare_exchange_weak(state, next_state, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(new_state) => state = new_state,
            }
        }
        false
    }

    /// Releases a shared lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSharedHolders`] if the lock is not held in shared mode.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::{Error, Lock};
    ///
    /// let lock = Lock::default();
    ///
    /// lock.read_lock();
    /// lock.read_lock();
    ///
    /// assert!(lock.read_unlock().is_ok());
    /// assert!(!lock.try_write_lock());
    ///
    /// assert!(lock.read_unlock().is_ok());
    /// assert_eq!(lock.read_unlock(), Err(Error::NoSharedHolders));
    /// assert!(lock.try_write_lock());
    /// ```
    pub fn read_unlock(&self) -> Result<(), Error> {
        let mut state = self.state.load(Relaxed);
        let next_state = loop {
            if !State(state).is_shared() {
                tracing::event!(
                    Level::TRACE,
                    lock = self.addr(),
                    state,
                    "read_unlock: no shared holders"
                );
                return Err(Error::NoSharedHolders);
            }
            let next_state = State(state).with_reader_removed();
            match self
                .state
                .compare_exchange_weak(state, next_state.0, Release, Relaxed)
            {
                Ok(_) => break next_state,
                Err(new_state) => state = new_state,
            }
        };

        // The last shared holder unblocks writers; the second to last unblocks an upgrader.
        match next_state.readers() {
            0 => self.wake_waiters(next_state),
            1 if next_state.is_upgrading() && next_state.has_write_waiters() => {
                self.wake_waiters(next_state);
            }
            _ => (),
        }
        Ok(())
    }

    /// Acquires an exclusive lock.
    ///
    /// Returns immediately if the calling thread already owns the lock, counting one more
    /// acquisition to release.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.write_lock();
    /// lock.write_lock();
    ///
    /// assert!(lock.is_locked(Relaxed));
    /// assert!(!lock.try_read_lock());
    /// ```
    #[inline]
    pub fn write_lock(&self) {
        let id = C::thread_id();
        if self.try_recurse(id) {
            return;
        }
        while !self.try_write_lock_internal(id) {
            self.wait(Opcode::Exclusive);
        }
    }

    /// Tries to acquire an exclusive lock.
    ///
    /// Returns `false` if the lock is held by other threads.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    ///
    /// let lock = Lock::default();
    ///
    /// assert!(lock.try_write_lock());
    /// assert!(lock.try_write_lock());
    /// assert!(!lock.try_read_lock());
    /// ```
    #[inline]
    pub fn try_write_lock(&self) -> bool {
        let id = C::thread_id();
        self.try_recurse(id) || self.try_write_lock_internal(id)
    }

    /// Releases an exclusive lock.
    ///
    /// The lock becomes available to other threads once every exclusive acquisition made by the
    /// owner has been released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHeldByCaller`] if the calling thread does not hold the lock
    /// exclusively.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::{Error, Lock};
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.write_lock();
    /// lock.write_lock();
    ///
    /// assert!(lock.write_unlock().is_ok());
    /// assert!(lock.is_locked(Relaxed));
    ///
    /// assert!(lock.write_unlock().is_ok());
    /// assert!(lock.is_free(Relaxed));
    ///
    /// assert_eq!(lock.write_unlock(), Err(Error::NotHeldByCaller));
    /// ```
    pub fn write_unlock(&self) -> Result<(), Error> {
        let id = C::thread_id();
        let mut state = self.state.load(Relaxed);
        if !State(state).is_owned_by(id) {
            tracing::event!(
                Level::TRACE,
                lock = self.addr(),
                state,
                "write_unlock: not the owner"
            );
            return Err(Error::NotHeldByCaller);
        }

        let depth = self.recursion.load(Relaxed);
        debug_assert_ne!(depth, 0);
        if depth > 1 {
            self.recursion.store(depth - 1, Relaxed);
            tracing::event!(
                Level::TRACE,
                lock = self.addr(),
                depth = depth - 1,
                "write_unlock: recursive"
            );
            return Ok(());
        }
        self.recursion.store(0, Relaxed);

        let next_state = loop {
            let next_state = State::unlocked(State(state));
            match self
                .state
                .compare_exchange_weak(state, next_state.0, Release, Relaxed)
            {
                Ok(_) => break next_state,
                Err(new_state) => state = new_state,
            }
        };
        self.wake_waiters(next_state);
        Ok(())
    }

    /// Converts the only shared hold into exclusive ownership.
    ///
    /// Waits for every other shared holder to release the lock; no other thread can acquire the
    /// lock in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUpgradeState`] if the lock is not held in shared mode, and
    /// [`Error::UpgradeConflict`] if another shared holder is already waiting to upgrade, in which
    /// case the caller still holds its shared lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::{Error, Lock};
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    /// assert_eq!(lock.upgrade(), Err(Error::InvalidUpgradeState));
    ///
    /// lock.read_lock();
    /// assert!(lock.upgrade().is_ok());
    /// assert!(lock.is_locked(Relaxed));
    /// assert!(lock.write_unlock().is_ok());
    /// ```
    pub fn upgrade(&self) -> Result<(), Error> {
        let id = C::thread_id();
        let mut announced = false;
        loop {
            let state = self.state.load(Relaxed);
            if self.try_upgrade_internal(id, state)? {
                return Ok(());
            }
            if !announced {
                if State(state).is_upgrading() {
                    tracing::event!(Level::TRACE, lock = self.addr(), state, "upgrade: conflict");
                    return Err(Error::UpgradeConflict);
                }
                if self
                    .state
                    .compare_exchange_weak(state, state | UPGRADING, Relaxed, Relaxed)
                    .is_err()
                {
                    continue;
                }
                announced = true;
            }
            self.wait(Opcode::Upgrade);
        }
    }

    /// Tries to convert the only shared hold into exclusive ownership.
    ///
    /// Returns `Ok(false)` if other shared holders exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUpgradeState`] if the lock is not held in shared mode.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.read_lock();
    /// lock.read_lock();
    /// assert_eq!(lock.try_upgrade(), Ok(false));
    ///
    /// assert!(lock.read_unlock().is_ok());
    /// assert_eq!(lock.try_upgrade(), Ok(true));
    /// ```
    pub fn try_upgrade(&self) -> Result<bool, Error> {
        let id = C::thread_id();
        loop {
            let state = self.state.load(Relaxed);
            match self.try_upgrade_internal(id, state) {
                Ok(false) if State(state).can_upgrade() => (),
                result => return result,
            }
        }
    }

    /// Converts exclusive ownership into a single shared hold.
    ///
    /// Pending recursive acquisitions are discarded, so any further
    /// [`write_unlock`](Self::write_unlock) by the former owner reports
    /// [`Error::NotHeldByCaller`]. Parked readers are woken up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHeldByCaller`] if the calling thread does not hold the lock
    /// exclusively.
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::Lock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = Lock::default();
    ///
    /// lock.write_lock();
    /// assert!(lock.downgrade().is_ok());
    ///
    /// assert!(lock.try_read_lock());
    /// assert_eq!(lock.readers(Relaxed), 2);
    /// ```
    pub fn downgrade(&self) -> Result<(), Error> {
        let id = C::thread_id();
        let mut state = self.state.load(Relaxed);
        if !State(state).is_owned_by(id) {
            tracing::event!(Level::TRACE, lock = self.addr(), state, "downgrade: not the owner");
            return Err(Error::NotHeldByCaller);
        }
        self.recursion.store(0, Relaxed);

        while let Err(new_state) = self.state.compare_exchange_weak(
            state,
            State::downgraded(State(state)).0,
            Release,
            Relaxed,
        ) {
            state = new_state;
        }

        // A writer that parked before this thread acquired the lock may have left
        // `WRITE_WAITERS` behind; only parked writers may keep new readers away.
        if State(state).has_write_waiters() {
            self.exclusive.inspect(|parked| {
                if parked == 0 {
                    self.state.fetch_and(!WRITE_WAITERS, AcqRel);
                }
            });
        }

        // `READ_WAITERS` was dropped from the word, so every parked reader has to re-check.
        let woken = self.shared.wake_all(|_| ());
        tracing::event!(Level::TRACE, lock = self.addr(), woken, "downgrade");
        Ok(())
    }

    /// Returns `true` if the exclusive lock is owned by `id`, after counting one more acquisition.
    #[inline]
    fn try_recurse(&self, id: ThreadId) -> bool {
        // Only the owner can install or remove its own identifier.
        if !State(self.state.load(Relaxed)).is_owned_by(id) {
            return false;
        }
        let depth = self.recursion.load(Relaxed) + 1;
        self.recursion.store(depth, Relaxed);
        tracing::event!(Level::TRACE, lock = self.addr(), depth, "write_lock: recursive");
        true
    }

    /// Tries to acquire an exclusive lock that is not owned by `id`.
    #[inline]
    fn try_write_lock_internal(&self, id: ThreadId) -> bool {
        let mut state = self.state.load(Relaxed);
        while State(state).can_write() {
            let next_state = State::exclusive(id, State(state)).0;
            match self
                .state
                .compare_exchange_weak(state, next_state, Acquire, Relaxed)
            {
                Ok(_) => {
                    self.recursion.store(1, Relaxed);
                    return true;
                }
                Err(new_state) => state = new_state,
            }
        }
        false
    }

    /// Tries to convert the only shared hold into exclusive ownership once.
    ///
    /// Returns `Ok(false)` if other shared holders exist or the word changed concurrently.
    fn try_upgrade_internal(&self, id: ThreadId, state: usize) -> Result<bool, Error> {
        let current = State(state);
        if !current.is_shared() {
            tracing::event!(
                Level::TRACE,
                lock = self.addr(),
                state,
                "upgrade: no shared holders"
            );
            return Err(Error::InvalidUpgradeState);
        }
        if !current.can_upgrade() {
            return Ok(false);
        }

        // Clears `READ` and `UPGRADING`.
        let next_state = State::exclusive(id, current).0;
        if self
            .state
            .compare_exchange(state, next_state, Acquire, Relaxed)
            .is_err()
        {
            return Ok(false);
        }
        self.recursion.store(1, Relaxed);
        Ok(true)
    }

    /// Parks the current thread until the state changes in favor of `opcode`.
    ///
    /// The waiter flag is announced and the state re-checked while the queue is locked, therefore
    /// a release that makes progress possible either sees the flag or is seen here.
    fn wait(&self, opcode: Opcode) {
        let queue = match opcode {
            Opcode::Shared => &self.shared,
            Opcode::Exclusive | Opcode::Upgrade => &self.exclusive,
        };
        let flag = opcode.waiter_flag();

        let span = tracing::span!(Level::TRACE, "Lock::wait", lock = self.addr(), ?opcode);
        let _enter = span.enter();

        let parked = queue.sleep_until(|| {
            let mut state = self.state.load(Acquire);
            if state & flag == 0 {
                state = self.state.fetch_or(flag, AcqRel) | flag;
            }
            !opcode.can_acquire(State(state))
        });
        tracing::event!(Level::TRACE, parked, "woken");
    }

    /// Wakes up threads that may be able to make progress from `state`.
    ///
    /// Writers take priority: if any writer is parked, `WRITE_WAITERS` stays set so that new
    /// readers keep deferring to the woken writers. A `WRITE_WAITERS` flag without parked writers
    /// is cleared, and readers are woken instead.
    fn wake_waiters(&self, state: State) {
        let mut state = state;
        if !state.has_write_waiters() && !state.has_read_waiters() {
            return;
        }

        let span = tracing::span!(
            Level::TRACE,
            "Lock::wake_waiters",
            lock = self.addr(),
            state = state.0
        );
        let _enter = span.enter();

        if state.has_write_waiters() {
            let woken = self.exclusive.wake_all(|woken| {
                if woken == 0 {
                    let cleared = self.state.fetch_and(!WRITE_WAITERS, AcqRel) & !WRITE_WAITERS;
                    state = State(cleared);
                }
            });
            if woken != 0 {
                tracing::event!(Level::TRACE, woken, "woke writers");
                return;
            }
        }

        if state.has_read_waiters() {
            let woken = self.shared.wake_all(|_| {
                self.state.fetch_and(!READ_WAITERS, AcqRel);
            });
            tracing::event!(Level::TRACE, woken, "woke readers");
        }
    }

    /// Returns the memory address of `self`.
    #[inline]
    fn addr(&self) -> usize {
        from_ref(self).addr()
    }
}

impl Default for Lock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> fmt::Debug for Lock<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = State(self.state.load(Relaxed));
        f.debug_struct("Lock")
            .field("state", &state)
            .field("recursion", &self.recursion.load(Relaxed))
            .field("shared", &self.shared)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}
