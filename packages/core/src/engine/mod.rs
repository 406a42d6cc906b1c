//! E2EE Engine
//!
//! Точка входа для операций над ключами и сессиями одного процесса.
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!   caller ──────▶ │          E2eeEngine          │
//!                  │  suite   config   store      │
//!                  │  session_locks   key_locks   │
//!                  └──────────────┬───────────────┘
//!                                 │
//!          ┌──────────────────────┼───────────────────────┐
//!          ▼                      ▼                       ▼
//!   key_agreement.rs        sessions.rs               KeyStore
//!   identity / prekeys      initialize / encrypt      (bincode records)
//!   bundles / X3DH          decrypt / rotate
//! ```
//!
//! ## Concurrency
//!
//! Every mutation of a session runs under that session's lock (load, mutate,
//! save). Waiting longer than `Config::session_lock_timeout` yields
//! `SessionBusy`. Prekey records of a device are guarded by a per-device lock;
//! one-time prekey issuance additionally goes through the store's
//! `compare_and_consume`, so two engines over one store never hand out the
//! same id.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::crypto::algorithm::CapabilitySet;
use crate::crypto::keys::IdentityKey;
use crate::crypto::suites::PrimitiveSuite;
use crate::error::{E2eeError, Result};
use crate::ids::{DeviceId, SessionId};
use crate::storage::{KeyStore, StoreKey};
use crate::utils::serialization;

mod key_agreement;
mod locks;
mod sessions;

pub use key_agreement::ProvisionedDevice;

use locks::{KeyGuard, LockTable};

/// Key agreement and ratchet operations over an injected suite, config and store.
///
/// Cheap to clone; clones share the store and the lock tables.
#[derive(Clone)]
pub struct E2eeEngine<S: KeyStore> {
    suite: PrimitiveSuite,
    config: Config,
    store: S,
    session_locks: LockTable<SessionId>,
    key_locks: LockTable<DeviceId>,
}

impl<S: KeyStore> E2eeEngine<S> {
    pub fn new(suite: PrimitiveSuite, config: Config, store: S) -> Self {
        Self {
            suite,
            config,
            store,
            session_locks: LockTable::default(),
            key_locks: LockTable::default(),
        }
    }

    pub fn suite(&self) -> &PrimitiveSuite {
        &self.suite
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Algorithms the injected suite can execute
    pub fn supported_algorithms(&self) -> CapabilitySet {
        self.suite.supported_algorithms()
    }

    async fn lock_session(&self, id: &SessionId) -> Result<KeyGuard> {
        self.session_locks
            .acquire(id, self.config.session_lock_timeout)
            .await
            .map_err(|_| {
                tracing::debug!(target: "engine::sessions", session = %id, "Session lock timed out");
                E2eeError::SessionBusy(id.clone())
            })
    }

    async fn lock_keys(&self, device: &DeviceId) -> KeyGuard {
        self.key_locks.acquire_unbounded(device).await
    }

    async fn load<T: DeserializeOwned>(&self, key: &StoreKey) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(serialization::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize>(&self, key: &StoreKey, value: &T) -> Result<()> {
        let bytes = serialization::to_bytes(value)?;
        self.store.put(key, bytes).await?;
        Ok(())
    }

    async fn load_identity(&self, device: &DeviceId) -> Result<IdentityKey> {
        self.load(&StoreKey::Identity(device.clone()))
            .await?
            .ok_or_else(|| E2eeError::KeyMaterialMissing(format!("identity key of device {}", device)))
    }

    /// Whether an identity key is stored for `device`.
    pub async fn has_identity(&self, device: &DeviceId) -> Result<bool> {
        Ok(self.store.get(&StoreKey::Identity(device.clone())).await?.is_some())
    }

    /// Capabilities recorded in the identity key of `device`.
    pub async fn identity_capabilities(&self, device: &DeviceId) -> Result<CapabilitySet> {
        Ok(self.load_identity(device).await?.capabilities)
    }
}
