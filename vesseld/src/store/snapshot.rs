/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Per-snapshot usage numbers collected by the stats syncer.

use std::collections::HashMap;
use std::sync::RwLock;

/// Disk usage of one snapshot at `timestamp`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub size: u64,
    pub inodes_used: u64,
    pub timestamp: i64,
}

/// Usage numbers keyed by snapshot key (the container id). Entries appear
/// and disappear as the stats syncer observes snapshots coming and going;
/// a miss only means no sample has been taken yet.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    cache: RwLock<HashMap<String, SnapshotStats>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SnapshotStats> {
        self.cache.read().expect("snapshot store lock").get(key).copied()
    }

    pub fn list(&self) -> Vec<(String, SnapshotStats)> {
        self.cache
            .read()
            .expect("snapshot store lock")
            .iter()
            .map(|(key, stats)| (key.clone(), *stats))
            .collect()
    }

    /// Replace the whole sample set with the latest sweep.
    pub fn replace(&self, entries: HashMap<String, SnapshotStats>) {
        *self.cache.write().expect("snapshot store lock") = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_and_get() {
        let store = SnapshotStore::new();
        assert!(store.get("c-1").is_none());

        let mut entries = HashMap::new();
        let _ = entries.insert(
            "c-1".to_string(),
            SnapshotStats { size: 4096, inodes_used: 12, timestamp: 1 },
        );
        store.replace(entries);

        let stats = store.get("c-1").expect("sampled");
        assert_eq!(stats.size, 4096);
        assert_eq!(stats.inodes_used, 12);
    }

    #[test]
    fn test_replace_drops_stale_entries() {
        let store = SnapshotStore::new();
        let mut entries = HashMap::new();
        let _ = entries.insert("gone".to_string(), SnapshotStats::default());
        store.replace(entries);

        store.replace(HashMap::new());
        assert!(store.get("gone").is_none());
        assert!(store.list().is_empty());
    }
}
