//! Poison-tolerant locking for state shared with the background workers.
//!
//! A status poll or render tick that panics mid-update must not take the
//! telemetry snapshot down with it. The last written values stay readable.

use std::sync::{Mutex, MutexGuard};

/// Lock `shared`, taking over the data if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(shared: &'a Mutex<T>, owner: &str) -> MutexGuard<'a, T> {
    shared.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(owner, "shared state was poisoned by a panicking holder; reusing it");
        poisoned.into_inner()
    })
}
