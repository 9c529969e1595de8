//! Latest-snapshot cache, one entry per instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::model::Snapshot;

/// Keeps the most recent snapshot per instance for delta computation.
///
/// Exactly one snapshot is retained per instance; `put` drops the previous
/// entry. Readers across instances proceed in parallel; each instance has a
/// single writer (its owning scheduler task).
pub struct SnapshotStore<R> {
    inner: RwLock<HashMap<String, Arc<Snapshot<R>>>>,
}

impl<R> SnapshotStore<R> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the latest snapshot for the instance, if any.
    pub fn get(&self, instance_id: &str) -> Option<Arc<Snapshot<R>>> {
        self.inner
            .read()
            .expect("snapshot store lock poisoned")
            .get(instance_id)
            .cloned()
    }

    /// Publishes a snapshot, replacing the previous one for its instance.
    pub fn put(&self, snapshot: Arc<Snapshot<R>>) {
        self.inner
            .write()
            .expect("snapshot store lock poisoned")
            .insert(snapshot.instance_id.clone(), snapshot);
    }
}

impl<R> Default for SnapshotStore<R> {
    fn default() -> Self {
        Self::new()
    }
}
