//! Misuse conditions reported by [`Lock`](crate::Lock).

use std::fmt;

/// Misuse conditions reported by [`Lock`](crate::Lock).
///
/// The lock state is left untouched whenever one of these is returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The caller does not hold the lock exclusively.
    NotHeldByCaller,
    /// The lock is not held in shared mode.
    NoSharedHolders,
    /// The lock is not held in shared mode, so there is nothing to upgrade.
    InvalidUpgradeState,
    /// Another shared holder is already waiting to upgrade.
    UpgradeConflict,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotHeldByCaller => f.write_str("lock is not held exclusively by the caller"),
            Error::NoSharedHolders => f.write_str("lock is not held in shared mode"),
            Error::InvalidUpgradeState => {
                f.write_str("lock cannot be upgraded without a shared hold")
            }
            Error::UpgradeConflict => f.write_str("another shared holder is already upgrading"),
        }
    }
}

impl std::error::Error for Error {}
