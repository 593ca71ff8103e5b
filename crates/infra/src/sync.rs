//! Mutex helpers.
//!
//! Critical sections in this crate never hold a guard across an `.await` and
//! never leave state half-updated, so a poisoned lock is still consistent and
//! is recovered instead of propagating the panic.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
