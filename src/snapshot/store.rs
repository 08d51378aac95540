use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Kind of a snapshot as reported by the snapshot engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Writable, mounted under a container.
    Active,
    Committed,
    View,
}

/// Usage statistics of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: String,
    pub kind: SnapshotKind,
    /// Bytes used.
    pub size: u64,
    pub inodes: u64,
    /// Percentage of the backing disk in use, only known for probed snapshots.
    pub usage_percent: u64,
    /// Last update, in nanoseconds since the unix epoch.
    pub timestamp: i64,
}

/// Latest known usage of every snapshot, keyed by snapshot key.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `snapshot.key`.
    pub fn add(&self, snapshot: Snapshot) {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.insert(snapshot.key.clone(), snapshot);
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no entry for `key`.
    pub fn get(&self, key: &str) -> Result<Snapshot> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        snapshots
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("snapshot {key}")))
    }

    /// Returns a copy of every entry, in no particular order.
    pub fn list(&self) -> Vec<Snapshot> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        snapshots.values().cloned().collect()
    }

    pub fn delete(&self, key: &str) {
        let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        snapshots.remove(key);
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
