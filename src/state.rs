//! Lock word encoding.
//!
//! ```text
//! | owner or reader count | reserved | UPGRADING | WRITE_WAITERS | READ_WAITERS | READ |
//! | bits[usize::BITS-1:5] | bits[4]  | bits[3]   | bits[2]       | bits[1]      | [0]  |
//! ```
//!
//! With `READ` set, the high region counts shared holders and `READ` with zero holders is the
//! unlocked word. With `READ` clear, the high region is the [`ThreadId`] of the exclusive owner.

use std::fmt;

use crate::ThreadId;

/// Width of the flag region.
pub(crate) const FLAG_BITS: u32 = 5;

/// Flag region mask.
pub(crate) const FLAG_MASK: usize = (1_usize << FLAG_BITS) - 1;

/// The lock is in shared mode.
pub(crate) const READ: usize = 1;

/// At least one reader is parked.
pub(crate) const READ_WAITERS: usize = 1 << 1;

/// At least one writer or upgrader is parked.
pub(crate) const WRITE_WAITERS: usize = 1 << 2;

/// A shared holder waits for the other shared holders to leave.
pub(crate) const UPGRADING: usize = 1 << 3;

/// Both waiter flags.
pub(crate) const WAITERS: usize = READ_WAITERS | WRITE_WAITERS;

/// Flags that do not describe ownership.
pub(crate) const HINTS: usize = WAITERS | UPGRADING;

/// A single shared holder in the count region.
pub(crate) const ONE_READER: usize = 1 << FLAG_BITS;

/// The canonical unlocked word.
pub(crate) const UNLOCKED: usize = READ;

/// Maximum number of shared holders.
pub(crate) const MAX_READERS: usize = usize::MAX >> FLAG_BITS;

/// Tagged view of a lock word.
#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) struct State(pub(crate) usize);

impl State {
    /// Returns `true` if the word is in shared mode, with or without holders.
    #[inline]
    pub(crate) const fn is_read_mode(self) -> bool {
        self.0 & READ == READ
    }

    /// Returns `true` if nobody holds the lock.
    #[inline]
    pub(crate) const fn is_free(self) -> bool {
        self.0 & !HINTS == UNLOCKED
    }

    /// Returns `true` if at least one shared hold exists.
    #[inline]
    pub(crate) const fn is_shared(self) -> bool {
        self.is_read_mode() && self.readers() != 0
    }

    /// Returns `true` if the lock is held exclusively.
    #[inline]
    pub(crate) const fn is_exclusive(self) -> bool {
        !self.is_read_mode() && self.0 & !FLAG_MASK != 0
    }

    /// Returns the number of shared holders.
    #[inline]
    pub(crate) const fn readers(self) -> usize {
        if self.is_read_mode() {
            self.0 >> FLAG_BITS
        } else {
            0
        }
    }

    /// Returns the exclusive owner.
    #[inline]
    pub(crate) const fn owner(self) -> Option<ThreadId> {
        if self.is_read_mode() {
            None
        } else {
            ThreadId::from_owner_bits(self.0 & !FLAG_MASK)
        }
    }

    /// Returns `true` if the lock is held exclusively by `id`.
    #[inline]
    pub(crate) const fn is_owned_by(self, id: ThreadId) -> bool {
        !self.is_read_mode() && self.0 & !FLAG_MASK == id.to_owner_bits()
    }

    /// Returns `true` if a reader is parked.
    #[inline]
    pub(crate) const fn has_read_waiters(self) -> bool {
        self.0 & READ_WAITERS != 0
    }

    /// Returns `true` if a writer or an upgrader is parked.
    #[inline]
    pub(crate) const fn has_write_waiters(self) -> bool {
        self.0 & WRITE_WAITERS != 0
    }

    /// Returns `true` if a shared holder announced an upgrade.
    #[inline]
    pub(crate) const fn is_upgrading(self) -> bool {
        self.0 & UPGRADING != 0
    }

    /// Returns `true` if a new shared hold can be granted.
    ///
    /// Pending writers and upgraders block new readers.
    #[inline]
    pub(crate) const fn can_read(self) -> bool {
        self.0 & (READ | WRITE_WAITERS | UPGRADING) == READ
    }

    /// Returns `true` if an exclusive hold can be granted.
    #[inline]
    pub(crate) const fn can_write(self) -> bool {
        self.is_free()
    }

    /// Returns `true` if the only shared holder can become the exclusive owner.
    #[inline]
    pub(crate) const fn can_upgrade(self) -> bool {
        self.is_read_mode() && self.readers() == 1
    }

    /// Returns the word with one more shared holder.
    ///
    /// # Panics
    ///
    /// Panics if the number of shared holders would exceed [`MAX_READERS`].
    #[inline]
    pub(crate) const fn with_reader_added(self) -> Self {
        assert!(self.readers() < MAX_READERS, "too many shared holders");
        Self(self.0 + ONE_READER)
    }

    /// Returns the word with one shared holder less.
    #[inline]
    pub(crate) const fn with_reader_removed(self) -> Self {
        debug_assert!(self.is_shared());
        Self(self.0 - ONE_READER)
    }

    /// Returns the word owned by `id`, keeping the waiter flags.
    #[inline]
    pub(crate) const fn exclusive(id: ThreadId, flags: Self) -> Self {
        Self(id.to_owner_bits() | (flags.0 & WAITERS))
    }

    /// Returns the unlocked word, keeping the waiter flags.
    #[inline]
    pub(crate) const fn unlocked(flags: Self) -> Self {
        Self(UNLOCKED | (flags.0 & WAITERS))
    }

    /// Returns the word of a single shared holder, keeping only [`WRITE_WAITERS`].
    #[inline]
    pub(crate) const fn downgraded(flags: Self) -> Self {
        Self((UNLOCKED + ONE_READER) | (flags.0 & WRITE_WAITERS))
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("word", &self.0)
            .field("readers", &self.readers())
            .field("owner", &self.owner())
            .field("read_waiters", &self.has_read_waiters())
            .field("write_waiters", &self.has_write_waiters())
            .field("upgrading", &self.is_upgrading())
            .finish()
    }
}
