// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The progress store and the session registry are plain `RwLock<HashMap<..>>`
//! maps shared between the fetch callback, the renderer, and the caller that
//! starts and stops sessions. A panic inside one session's callback must not
//! take every other user's download down with it, so these helpers recover
//! the guard from a poisoned lock and log the event instead of panicking.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use vidrelay::locks::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(42);
//! *resilient_write(&lock) = 7;
//! assert_eq!(*resilient_read(&lock), 7);
//! ```

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vidrelay::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering. \
                 A task panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vidrelay::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering. \
                 A task panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
