// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Latest-progress bookkeeping shared by a session's fetch callback and its
//! renderer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::fetch::FetchUpdate;
use crate::locks::{resilient_read, resilient_write};
use crate::session::UserKey;

/// Most recent progress measurement for one session.
///
/// `percentage` is derived from the byte counts and never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Bytes written so far
    pub downloaded_bytes: u64,
    /// Expected size; 0 while unknown
    pub total_bytes: u64,
    /// 0 means unknown or idle
    pub speed_bytes_per_sec: f64,
    /// `None` renders as "computing", distinct from a concrete 0
    pub eta_seconds: Option<u64>,
}

impl ProgressSnapshot {
    /// Build a snapshot, normalizing backend quirks.
    ///
    /// A backend whose size estimate was too small can report more bytes than
    /// its total; the total is raised so `downloaded <= total` holds.
    pub fn new(
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed_bytes_per_sec: Option<f64>,
        eta_seconds: Option<u64>,
    ) -> Self {
        let total = match total_bytes {
            Some(t) if t > 0 => t.max(downloaded_bytes),
            _ => 0,
        };
        let speed = match speed_bytes_per_sec {
            Some(s) if s.is_finite() && s > 0.0 => s,
            _ => 0.0,
        };

        Self {
            downloaded_bytes,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            eta_seconds,
        }
    }

    /// Snapshot for a raw backend progress event.
    pub fn from_update(update: &FetchUpdate) -> Self {
        Self::new(
            update.downloaded_bytes,
            update.total_bytes,
            update.speed_bytes_per_sec,
            update.eta_seconds,
        )
    }

    /// Percentage in `[0, 100]`; 0 while the total is unknown.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// True once a size is known and every byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes >= self.total_bytes
    }
}

/// Map from session key to its latest [`ProgressSnapshot`].
///
/// Cloning is cheap and every clone sees the same entries. Each key has one
/// writer (its session's fetch callback) and one reader (its renderer), so a
/// single coarse lock is enough at chat-bot cardinalities.
#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    entries: Arc<RwLock<HashMap<UserKey, ProgressSnapshot>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `key`; last writer wins.
    pub fn put(&self, key: &UserKey, snapshot: ProgressSnapshot) {
        resilient_write(&self.entries).insert(key.clone(), snapshot);
    }

    /// Latest snapshot, or `None` if nothing has been reported yet.
    pub fn get(&self, key: &UserKey) -> Option<ProgressSnapshot> {
        resilient_read(&self.entries).get(key).copied()
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn clear(&self, key: &UserKey) -> bool {
        resilient_write(&self.entries).remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        resilient_read(&self.entries).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_percentage_derived() {
        let s = ProgressSnapshot::new(512, Some(2048), None, None);
        assert_eq!(s.percentage(), 25.0);
        assert!(!s.is_complete());

        let done = ProgressSnapshot::new(2048, Some(2048), None, None);
        assert_eq!(done.percentage(), 100.0);
        assert!(done.is_complete());
    }

    #[test]
    fn test_snapshot_unknown_total() {
        let s = ProgressSnapshot::new(4096, None, Some(100.0), None);
        assert_eq!(s.total_bytes, 0);
        assert_eq!(s.percentage(), 0.0);
        assert!(!s.is_complete());

        let zero = ProgressSnapshot::new(4096, Some(0), None, None);
        assert_eq!(zero.total_bytes, 0);
    }

    #[test]
    fn test_snapshot_raises_underestimated_total() {
        let s = ProgressSnapshot::new(3000, Some(2000), None, None);
        assert_eq!(s.total_bytes, 3000);
        assert_eq!(s.percentage(), 100.0);
    }

    #[test]
    fn test_snapshot_sanitizes_speed() {
        assert_eq!(ProgressSnapshot::new(0, None, Some(-3.0), None).speed_bytes_per_sec, 0.0);
        assert_eq!(ProgressSnapshot::new(0, None, Some(f64::NAN), None).speed_bytes_per_sec, 0.0);
        assert_eq!(ProgressSnapshot::new(0, None, Some(8.5), None).speed_bytes_per_sec, 8.5);
    }

    #[test]
    fn test_store_put_get_clear() {
        let store = ProgressStore::new();
        let key = UserKey::from(1_i64);

        assert!(store.get(&key).is_none());

        store.put(&key, ProgressSnapshot::new(10, Some(100), None, None));
        store.put(&key, ProgressSnapshot::new(60, Some(100), None, None));
        assert_eq!(store.get(&key).map(|s| s.downloaded_bytes), Some(60));

        assert!(store.clear(&key));
        assert!(!store.clear(&key));
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_keys_are_independent() {
        let store = ProgressStore::new();
        let alice = UserKey::from("alice");
        let bob = UserKey::from("bob");

        store.put(&alice, ProgressSnapshot::new(1, Some(2), None, None));
        store.put(&bob, ProgressSnapshot::new(5, Some(10), None, None));
        store.clear(&alice);

        assert!(store.get(&alice).is_none());
        assert_eq!(store.get(&bob).map(|s| s.total_bytes), Some(10));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_clones_share_entries() {
        let store = ProgressStore::new();
        let view = store.clone();
        let key = UserKey::from(7_i64);

        store.put(&key, ProgressSnapshot::new(1, Some(1), None, None));
        assert!(view.get(&key).is_some());
    }
}
