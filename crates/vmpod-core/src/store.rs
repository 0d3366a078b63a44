//! The sandbox table.
//!
//! One [`RwLock`] guards the map. Reads go through [`RecordsView`] and
//! mutations through [`RecordsMut`], so code that needs the lock held can
//! take the guard type as proof.

use crate::client::RemoteClient;
use crate::error::{CoreError, Result};
use crate::sandbox::{SandboxId, SandboxRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
pub(crate) struct RecordStore {
    records: RwLock<HashMap<SandboxId, SandboxRecord>>,
}

impl RecordStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn read(&self) -> RecordsView<'_> {
        RecordsView {
            records: self.records.read().await,
        }
    }

    pub(crate) async fn write(&self) -> RecordsMut<'_> {
        RecordsMut {
            records: self.records.write().await,
        }
    }
}

/// Shared read access to the sandbox table.
///
/// Sandboxes cannot be added or removed while a view is alive.
pub struct RecordsView<'a> {
    records: RwLockReadGuard<'a, HashMap<SandboxId, SandboxRecord>>,
}

impl RecordsView<'_> {
    /// Client of a sandbox, for callers already holding the read lock.
    pub fn client(&self, id: SandboxId) -> Result<Arc<dyn RemoteClient>> {
        self.get(id).map(SandboxRecord::client)
    }

    /// IDs of every registered sandbox.
    pub fn ids(&self) -> Vec<SandboxId> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: SandboxId) -> bool {
        self.records.contains_key(&id)
    }

    pub(crate) fn get(&self, id: SandboxId) -> Result<&SandboxRecord> {
        self.records.get(&id).ok_or(CoreError::NotFound(id))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SandboxRecord> {
        self.records.values()
    }
}

/// Exclusive access to the sandbox table.
pub(crate) struct RecordsMut<'a> {
    records: RwLockWriteGuard<'a, HashMap<SandboxId, SandboxRecord>>,
}

impl RecordsMut<'_> {
    /// Register a record. On a key collision the record is handed back
    /// so the caller can tear it down.
    pub(crate) fn insert(
        &mut self,
        record: SandboxRecord,
    ) -> std::result::Result<(), (CoreError, SandboxRecord)> {
        if self.records.contains_key(&record.id) {
            return Err((CoreError::AlreadyExists(record.id), record));
        }
        self.records.insert(record.id, record);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: SandboxId) -> Result<SandboxRecord> {
        self.records.remove(&id).ok_or(CoreError::NotFound(id))
    }

    pub(crate) fn drain(&mut self) -> Vec<SandboxRecord> {
        std::mem::take(&mut *self.records).into_values().collect()
    }
}
