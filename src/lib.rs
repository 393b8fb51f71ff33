pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod rejection;
pub mod source;
pub mod tasks;
pub mod web;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cache::CacheManager;
use rejection::RejectionSet;

pub type SharedCache = Arc<Mutex<CacheManager>>;
pub type SharedRejections = Arc<Mutex<RejectionSet>>;

/// Locks `mutex`, carrying on with the inner value if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
