//! [`ThreadId`] identifies the exclusive owner of a [`Lock`](crate::Lock).

use std::num::NonZeroUsize;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use crate::state::FLAG_BITS;

/// Opaque, non-zero identifier of a thread of execution.
///
/// The identifier is stored in the owner region of the lock word, above the flag bits, therefore
/// it cannot exceed [`ThreadId::MAX`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadId(NonZeroUsize);

impl ThreadId {
    /// The largest representable identifier.
    pub const MAX: usize = usize::MAX >> FLAG_BITS;

    /// Creates a [`ThreadId`] from a raw value.
    ///
    /// Returns `None` if the value is zero or greater than [`Self::MAX`].
    ///
    /// # Examples
    ///
    /// ```
    /// use wordlock::ThreadId;
    ///
    /// assert!(ThreadId::new(0).is_none());
    /// assert!(ThreadId::new(ThreadId::MAX + 1).is_none());
    /// assert_eq!(ThreadId::new(7).map(ThreadId::get), Some(7));
    /// ```
    #[inline]
    #[must_use]
    pub const fn new(raw: usize) -> Option<Self> {
        if raw > Self::MAX {
            return None;
        }
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// Returns the identifier of the current thread.
    ///
    /// Identifiers are allocated from a process-wide counter the first time a thread asks for
    /// one, and are never reused.
    ///
    /// # Panics
    ///
    /// Panics if the identifier space is exhausted.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::thread;
    ///
    /// use wordlock::ThreadId;
    ///
    /// let id = ThreadId::current();
    /// assert_eq!(id, ThreadId::current());
    /// assert_ne!(thread::spawn(ThreadId::current).join().unwrap(), id);
    /// ```
    #[inline]
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|id| *id)
    }

    /// Converts the identifier into the owner region of a lock word.
    #[inline]
    pub(crate) const fn to_owner_bits(self) -> usize {
        self.0.get() << FLAG_BITS
    }

    /// Extracts an identifier from the owner region of a lock word.
    #[inline]
    pub(crate) const fn from_owner_bits(bits: usize) -> Option<Self> {
        Self::new(bits >> FLAG_BITS)
    }

    /// Allocates a fresh identifier.
    fn allocate() -> Self {
        // Not part of any loom model: identifiers only need to be unique.
        static NEXT: AtomicUsize = AtomicUsize::new(1);

        let raw = NEXT.fetch_add(1, Relaxed);
        match Self::new(raw) {
            Some(id) => id,
            None => panic!("failed to allocate a thread identifier: identifier space exhausted"),
        }
    }
}

#[cfg(not(feature = "loom"))]
thread_local! {
    static CURRENT: ThreadId = ThreadId::allocate();
}

#[cfg(feature = "loom")]
loom::thread_local! {
    static CURRENT: ThreadId = ThreadId::allocate();
}
