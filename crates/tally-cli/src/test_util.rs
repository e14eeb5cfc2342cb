//! Test-only helpers.

use std::sync::{Mutex, MutexGuard, PoisonError};

// Serializes tests that mutate process environment variables.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

pub fn lock_env() -> MutexGuard<'static, ()> {
    ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner)
}
