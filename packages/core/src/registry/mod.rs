//! Device registry
//!
//! The registry owns device records (capabilities, trust state, encryption
//! version) and conversation membership. The engine reads it to fan keys
//! out and writes back capability upgrades and revocations. Devices are never
//! hard-deleted: [`DeviceRegistry::revoke_device`] soft-revokes them.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::crypto::algorithm::{CapabilitySet, Classification};
use crate::error::Result;
use crate::ids::{ConversationId, DeviceId, UserId};

pub mod memory;

pub use memory::MemoryDeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustState {
    Unverified,
    Verified,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub user_id: UserId,
    /// Declared algorithm identifiers (unknown ones already dropped)
    pub capabilities: CapabilitySet,
    /// Protocol major version the device last negotiated; 0 before the first session
    pub encryption_version: u8,
    pub trust: TrustState,
    /// When the capability declaration was last verified
    pub capabilities_verified_at: Option<i64>,
    /// Fingerprint of the identity key the engine holds for this device
    pub identity_fingerprint: Option<String>,
    pub registered_at: i64,
    pub revoked_at: Option<i64>,
}

impl Device {
    pub fn new(device_id: impl Into<DeviceId>, user_id: impl Into<UserId>, capabilities: CapabilitySet, now: i64) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            capabilities,
            encryption_version: 0,
            trust: TrustState::Unverified,
            capabilities_verified_at: Some(now),
            identity_fingerprint: None,
            registered_at: now,
            revoked_at: None,
        }
    }

    pub fn supports_quantum(&self) -> bool {
        self.capabilities
            .iter()
            .any(|a| a.classification() == Classification::Quantum)
    }

    pub fn supports_hybrid(&self) -> bool {
        self.capabilities
            .iter()
            .any(|a| a.classification() == Classification::Hybrid)
    }

    pub fn is_revoked(&self) -> bool {
        self.trust == TrustState::Revoked
    }
}

/// Device registry collaborator
///
/// Same shape as [`crate::storage::KeyStore`]: Clone + Send + Sync with
/// `Send` futures. Unknown devices are reported as `DeviceNotFound`.
pub trait DeviceRegistry: Clone + Send + Sync + 'static {
    fn get_device(&self, device_id: &DeviceId) -> impl Future<Output = Result<Device>> + Send;

    /// Every device of every participant, revoked ones included.
    fn list_participant_devices(
        &self,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<Vec<Device>>> + Send;

    /// Conversations in which any device of `user_id` participates.
    fn list_user_conversations(&self, user_id: &UserId) -> impl Future<Output = Result<Vec<ConversationId>>> + Send;

    fn update_device(&self, device: Device) -> impl Future<Output = Result<()>> + Send;

    fn revoke_device(&self, device_id: &DeviceId, now: i64) -> impl Future<Output = Result<()>> + Send;
}
