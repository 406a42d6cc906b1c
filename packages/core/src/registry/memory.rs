// In-memory DeviceRegistry

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Device, DeviceRegistry, TrustState};
use crate::error::{E2eeError, Result};
use crate::ids::{ConversationId, DeviceId, UserId};

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<DeviceId, Device>,
    /// Conversation → participating devices
    participants: HashMap<ConversationId, BTreeSet<DeviceId>>,
    /// Device → conversations, reverse index of `participants`
    device_conversations: HashMap<DeviceId, BTreeSet<ConversationId>>,
}

/// Registry kept in memory; clones share state.
#[derive(Clone, Default)]
pub struct MemoryDeviceRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a device record.
    pub async fn register_device(&self, device: Device) {
        let mut inner = self.inner.write().await;
        inner.devices.insert(device.device_id.clone(), device);
    }

    pub async fn add_participant(&self, conversation_id: &ConversationId, device_id: &DeviceId) {
        let mut inner = self.inner.write().await;
        inner
            .participants
            .entry(conversation_id.clone())
            .or_default()
            .insert(device_id.clone());
        inner
            .device_conversations
            .entry(device_id.clone())
            .or_default()
            .insert(conversation_id.clone());
    }

    pub async fn user_devices(&self, user_id: &UserId) -> Vec<Device> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| &d.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}

impl DeviceRegistry for MemoryDeviceRegistry {
    async fn get_device(&self, device_id: &DeviceId) -> Result<Device> {
        self.inner
            .read()
            .await
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| E2eeError::DeviceNotFound(device_id.clone()))
    }

    async fn list_participant_devices(&self, conversation_id: &ConversationId) -> Result<Vec<Device>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.participants.get(conversation_id) else {
            return Ok(Vec::new());
        };
        ids.iter()
            .map(|id| {
                inner
                    .devices
                    .get(id)
                    .cloned()
                    .ok_or_else(|| E2eeError::DeviceNotFound(id.clone()))
            })
            .collect()
    }

    async fn list_user_conversations(&self, user_id: &UserId) -> Result<Vec<ConversationId>> {
        let inner = self.inner.read().await;
        let conversations: BTreeSet<ConversationId> = inner
            .devices
            .values()
            .filter(|d| &d.user_id == user_id)
            .filter_map(|d| inner.device_conversations.get(&d.device_id))
            .flatten()
            .cloned()
            .collect();
        Ok(conversations.into_iter().collect())
    }

    async fn update_device(&self, device: Device) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.devices.contains_key(&device.device_id) {
            return Err(E2eeError::DeviceNotFound(device.device_id));
        }
        inner.devices.insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn revoke_device(&self, device_id: &DeviceId, now: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| E2eeError::DeviceNotFound(device_id.clone()))?;
        device.trust = TrustState::Revoked;
        device.revoked_at.get_or_insert(now);
        Ok(())
    }
}
