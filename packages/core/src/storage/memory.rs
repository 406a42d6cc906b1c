// In-memory KeyStore для тестов и встраивания без БД

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use super::{KeyStore, StoreKey};
use crate::error::StoreError;
use crate::ids::DeviceId;

/// In-memory key store
///
/// Records live in a `HashMap` behind an `RwLock`; consumed one-time prekey
/// ids in a separate set behind a `Mutex`, which is what makes
/// `compare_and_consume` atomic. Clones share state.
///
/// `set_available(false)` makes every call fail with
/// `StoreError::Unavailable`, for exercising error paths.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    records: Arc<RwLock<HashMap<StoreKey, Vec<u8>>>>,
    consumed: Arc<Mutex<HashSet<(DeviceId, u32)>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of consumed one-time prekey ids
    pub async fn consumed_count(&self) -> usize {
        self.consumed.lock().await.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

impl KeyStore for MemoryKeyStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_available()?;
        trace!(target: "storage", key = %key, len = value.len(), "put");
        self.records.write().await.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.check_available()?;
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn compare_and_consume(&self, device: &DeviceId, prekey_id: u32) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.consumed.lock().await.insert((device.clone(), prekey_id)))
    }
}
