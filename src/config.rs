//! [`Config`] supplies the platform hooks a [`Lock`](crate::Lock) depends on.

use std::fmt;

use crate::ThreadId;

/// [`Config`] supplies the platform hooks a [`Lock`](crate::Lock) depends on.
///
/// A kernel or a custom scheduler provides its own notion of the current thread of execution by
/// implementing this trait and instantiating [`Lock`](crate::Lock) with it.
///
/// # Examples
///
/// ```
/// use wordlock::{Config, Lock, ThreadId};
///
/// #[derive(Debug, Default)]
/// struct SingleContext;
///
/// impl Config for SingleContext {
///     fn thread_id() -> ThreadId {
///         ThreadId::new(1).unwrap()
///     }
/// }
///
/// let lock: Lock<SingleContext> = Lock::with_config();
/// lock.write_lock();
/// assert_eq!(lock.owner(std::sync::atomic::Ordering::Relaxed), ThreadId::new(1));
/// assert!(lock.write_unlock().is_ok());
/// ```
pub trait Config: fmt::Debug + Default {
    /// Returns the identifier of the calling thread of execution.
    ///
    /// The value must stay the same while the caller holds the lock exclusively, and no two
    /// threads that may hold the lock at the same time are allowed to share a value.
    fn thread_id() -> ThreadId;
}

/// Default configuration using [`ThreadId::current`].
#[derive(Debug, Default)]
pub struct DefaultConfig;

impl Config for DefaultConfig {
    #[inline]
    fn thread_id() -> ThreadId {
        ThreadId::current()
    }
}
