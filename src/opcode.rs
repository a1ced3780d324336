//! Acquisition operation types.

use crate::state::{READ_WAITERS, State, WRITE_WAITERS};

/// Operation types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Opcode {
    /// Acquires shared ownership.
    Shared,
    /// Acquires exclusive ownership.
    Exclusive,
    /// Converts the only shared hold into exclusive ownership.
    Upgrade,
}

impl Opcode {
    /// Checks if the operation can make progress from `state`.
    #[inline]
    pub(crate) const fn can_acquire(self, state: State) -> bool {
        match self {
            Opcode::Shared => state.can_read(),
            Opcode::Exclusive => state.can_write(),
            Opcode::Upgrade => state.can_upgrade(),
        }
    }

    /// Returns the flag announcing a parked caller of this type.
    #[inline]
    pub(crate) const fn waiter_flag(self) -> usize {
        match self {
            Opcode::Shared => READ_WAITERS,
            Opcode::Exclusive | Opcode::Upgrade => WRITE_WAITERS,
        }
    }
}
