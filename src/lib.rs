#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![doc = include_str!("../README.md")]

pub mod config;
pub use config::{Config, DefaultConfig};

pub mod error;
pub use error::Error;

pub mod lock;
pub use lock::Lock;

#[cfg(not(feature = "loom"))]
mod lock_api;
#[cfg(not(feature = "loom"))]
pub use self::lock_api::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod thread_id;
pub use thread_id::ThreadId;

mod opcode;
mod state;
mod wait_queue;

#[cfg(test)]
mod tests;
