//! Client side of a proctored exam session: a persistent signaling channel,
//! per-participant WebRTC peer sessions, and the proctor/candidate roles that
//! drive negotiation between them.

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use error::{Result, SessionError};

use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
