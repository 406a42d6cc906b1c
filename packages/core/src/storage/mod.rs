//! Хранилище ключей
//!
//! Граница персистентности движка: identity keys, prekeys, состояние
//! ratchet-сессий и записи бесед. Движок видит только [`KeyStore`];
//! конкретная БД / KV остаётся снаружи.
//!
//! ```text
//! E2eeEngine ──get/put/delete──▶ KeyStore ──▶ (KV, SQL, memory, ...)
//!            ──compare_and_consume(device, prekey_id)──▶ atomic test-and-set
//! ```
//!
//! Значения хранятся как непрозрачные байты (bincode-записи из [`models`]).
//! Ошибки адаптера пробрасываются как `StoreUnavailable` без повторов.

use std::fmt;
use std::future::Future;

use crate::error::StoreError;
use crate::ids::{ConversationId, DeviceId, SessionId};

pub mod memory;
pub mod models;

pub use memory::MemoryKeyStore;
pub use models::{ConversationRecord, OneTimePreKeyRecord, SessionPair, SignedPreKeyRecord};

/// Typed composite key of a stored record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    Identity(DeviceId),
    SignedPreKeys(DeviceId),
    OneTimePreKeys(DeviceId),
    Session(SessionId),
    Conversation(ConversationId),
}

impl StoreKey {
    pub fn key_type(&self) -> &'static str {
        match self {
            StoreKey::Identity(_) => "identity",
            StoreKey::SignedPreKeys(_) => "signed_prekeys",
            StoreKey::OneTimePreKeys(_) => "one_time_prekeys",
            StoreKey::Session(_) => "session",
            StoreKey::Conversation(_) => "conversation",
        }
    }

    /// Owner part of the key; sessions use their `conv[local -> remote]` form.
    pub fn owner_id(&self) -> String {
        match self {
            StoreKey::Identity(device)
            | StoreKey::SignedPreKeys(device)
            | StoreKey::OneTimePreKeys(device) => device.to_string(),
            StoreKey::Session(id) => id.to_string(),
            StoreKey::Conversation(id) => id.to_string(),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key_type(), self.owner_id())
    }
}

/// Key store adapter
///
/// Must be Clone (shared by the engine and the manager), Send + Sync, and
/// return `Send` futures so callers can spawn work per device pair.
/// Implementations typically share state via `Arc`, so clones see the same
/// records.
///
/// No call is retried or timed out by the engine; cancellation belongs to
/// the caller.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Returns `None` if nothing is stored under `key`.
    fn get(&self, key: &StoreKey) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Overwrites any existing value.
    fn put(&self, key: &StoreKey, value: Vec<u8>) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &StoreKey) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomic test-and-set on a one-time prekey id.
    ///
    /// Returns `true` for exactly one caller per `(device, prekey_id)`, no
    /// matter how many race.
    fn compare_and_consume(
        &self,
        device: &DeviceId,
        prekey_id: u32,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_parts() {
        let key = StoreKey::Session(SessionId::new("chat", "phone", "laptop"));
        assert_eq!(key.key_type(), "session");
        assert_eq!(key.to_string(), "session/chat[phone -> laptop]");

        let key = StoreKey::OneTimePreKeys(DeviceId::from("phone"));
        assert_eq!(key.owner_id(), "phone");
    }
}
