//! Multi-Device Session Manager
//!
//! Разворачивает сессии по всем устройствам всех участников беседы.
//!
//! ## Fan-out
//!
//! Полная сетка: одна пара на каждую неупорядоченную пару устройств, в каждой
//! паре две endpoint-сессии (по одной на каждое устройство). N устройств дают
//! C(N,2) пар.
//!
//! ```text
//!  phone(A) ───── laptop(A)        pairs:  phone↔laptop
//!      ╲          ╱                        phone↔tablet
//!       tablet(B)                          laptop↔tablet
//! ```
//!
//! X3DH-инициатор пары: инициирующее устройство, если оно в паре, иначе
//! лексикографически меньший device id.
//!
//! ## Политика ошибок
//!
//! - Выбор алгоритма при setup: всё или ничего (`NoCommonAlgorithm`)
//! - Ошибки отдельных пар (bundle, handshake, store): собираются в
//!   `failed_*` и не прерывают остальные пары

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::algorithm::CapabilitySet;
use crate::crypto::messaging::KeyRetention;
use crate::crypto::negotiation::{negotiate_supported, NegotiationResult};
use crate::engine::E2eeEngine;
use crate::error::{CryptoError, E2eeError, Result};
use crate::ids::{ConversationId, DeviceId, SessionId, UserId};
use crate::registry::{Device, DeviceRegistry};
use crate::storage::{ConversationRecord, KeyStore, SessionPair, StoreKey};
use crate::utils::serialization;
use crate::utils::time::current_timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub device_id: DeviceId,
    pub error: E2eeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationFailure {
    pub conversation_id: ConversationId,
    pub error: E2eeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFailure {
    pub conversation_id: ConversationId,
    pub peer: DeviceId,
    pub error: E2eeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupResult {
    pub negotiation: NegotiationResult,
    /// Endpoint sessions, two per established pair
    pub created_sessions: Vec<SessionId>,
    pub failed_devices: Vec<DeviceFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareResult {
    pub shared_conversations: Vec<ConversationId>,
    pub failed_conversations: Vec<ConversationFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationResult {
    pub rotated_devices: Vec<DeviceId>,
    pub failed_devices: Vec<DeviceFailure>,
    pub new_epoch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedPair {
    pub conversation_id: ConversationId,
    pub peer: DeviceId,
    pub negotiation: NegotiationResult,
    pub epoch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    pub device_id: DeviceId,
    pub capabilities: CapabilitySet,
    pub migrated: Vec<MigratedPair>,
    /// Pairs that kept their previous sessions
    pub failed: Vec<PairFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalResult {
    pub device_id: DeviceId,
    pub removed_sessions: Vec<SessionId>,
}

/// Fan-out and consistency across the devices of every participant.
///
/// Runs both endpoints of every pair in-process: bundles come from the
/// responder's stored prekeys and the handshake is accepted directly.
#[derive(Clone)]
pub struct SessionManager<S: KeyStore, R: DeviceRegistry> {
    engine: E2eeEngine<S>,
    registry: R,
}

impl<S: KeyStore, R: DeviceRegistry> SessionManager<S, R> {
    pub fn new(engine: E2eeEngine<S>, registry: R) -> Self {
        Self { engine, registry }
    }

    pub fn engine(&self) -> &E2eeEngine<S> {
        &self.engine
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Negotiates one algorithm across every participant device and
    /// establishes the full pairwise mesh.
    ///
    /// Revoked participants are left out and reported; a revoked initiating
    /// device fails the whole call.
    pub async fn setup_conversation_encryption(
        &self,
        conversation_id: &ConversationId,
        participant_devices: &[Device],
        initiating_device: &DeviceId,
    ) -> Result<SetupResult> {
        let initiator = participant_devices
            .iter()
            .find(|d| &d.device_id == initiating_device)
            .ok_or_else(|| E2eeError::DeviceNotFound(initiating_device.clone()))?;
        if initiator.is_revoked() {
            return Err(E2eeError::DeviceRevoked(initiating_device.clone()));
        }

        let mut failed_devices = Vec::new();
        let mut active: Vec<&Device> = Vec::new();
        for device in participant_devices {
            if device.is_revoked() {
                failed_devices.push(DeviceFailure {
                    device_id: device.device_id.clone(),
                    error: E2eeError::DeviceRevoked(device.device_id.clone()),
                });
            } else if !active.iter().any(|d| d.device_id == device.device_id) {
                active.push(device);
            }
        }
        active.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let supported = self.engine.supported_algorithms();
        let negotiation = negotiate_supported(active.iter().map(|d| &d.capabilities), &supported).map_err(|err| {
            warn!(
                target: "manager",
                conversation = %conversation_id,
                devices = active.len(),
                "No algorithm common to every participant device"
            );
            err
        })?;

        info!(
            target: "manager",
            conversation = %conversation_id,
            algorithm = %negotiation.algorithm,
            classification = ?negotiation.classification,
            quantum_fallback = negotiation.quantum_fallback,
            devices = active.len(),
            "Conversation algorithm negotiated"
        );

        let mut ready: Vec<&Device> = Vec::new();
        for device in active {
            match self.prepare_device(device).await {
                Ok(()) => ready.push(device),
                Err(error) => failed_devices.push(DeviceFailure {
                    device_id: device.device_id.clone(),
                    error,
                }),
            }
        }

        let mut pairs = Vec::new();
        let mut created_sessions = Vec::new();
        for (i, a) in ready.iter().enumerate() {
            for b in &ready[i + 1..] {
                let pair = pair_for(&a.device_id, &b.device_id, initiating_device);
                match self.establish_pair(conversation_id, &pair, &negotiation, 0, None).await {
                    Ok(ids) => {
                        created_sessions.extend(ids);
                        pairs.push(pair);
                    }
                    Err(error) => {
                        warn!(
                            target: "manager",
                            conversation = %conversation_id,
                            initiator = %pair.initiator,
                            responder = %pair.responder,
                            error = %error,
                            "Pair key agreement failed"
                        );
                        failed_devices.push(DeviceFailure {
                            device_id: pair.responder.clone(),
                            error,
                        });
                    }
                }
            }
        }

        for device in &ready {
            if pairs.iter().any(|p| p.involves(&device.device_id)) {
                self.record_encryption_version(device, &negotiation).await?;
            }
        }

        let now = current_timestamp();
        let record = ConversationRecord {
            conversation_id: conversation_id.clone(),
            negotiation,
            epoch: 0,
            pairs,
            created_at: now,
            updated_at: now,
        };
        self.save_conversation(&record).await?;

        info!(
            target: "manager",
            conversation = %conversation_id,
            pairs = record.pairs.len(),
            sessions = created_sessions.len(),
            failed = failed_devices.len(),
            "Conversation encryption set up"
        );

        Ok(SetupResult {
            negotiation,
            created_sessions,
            failed_devices,
        })
    }

    /// Connects `new_device` to every participant device of every
    /// conversation its user is in, leaving existing sessions untouched.
    pub async fn share_keys_to_new_device(&self, user_id: &UserId, new_device: &DeviceId) -> Result<ShareResult> {
        let device = self.registry.get_device(new_device).await?;
        if device.is_revoked() {
            return Err(E2eeError::DeviceRevoked(new_device.clone()));
        }
        if &device.user_id != user_id {
            return Err(CryptoError::InvalidInputError(format!(
                "device {} does not belong to user {}",
                new_device, user_id
            ))
            .into());
        }
        self.prepare_device(&device).await?;

        let mut shared_conversations = Vec::new();
        let mut failed_conversations = Vec::new();
        let mut version_source = None;

        for conversation_id in self.registry.list_user_conversations(user_id).await? {
            let Some(mut record) = self.load_conversation(&conversation_id).await? else {
                debug!(
                    target: "manager",
                    conversation = %conversation_id,
                    "Conversation has no encryption set up, skipping"
                );
                continue;
            };

            let algorithm = record.negotiation.algorithm;
            if !device.capabilities.contains(&algorithm) || !self.engine.suite().supports(algorithm) {
                failed_conversations.push(ConversationFailure {
                    conversation_id,
                    error: E2eeError::NoCommonAlgorithm,
                });
                continue;
            }

            let mut failure = None;
            for peer in self.registry.list_participant_devices(&conversation_id).await? {
                if peer.device_id == device.device_id
                    || peer.is_revoked()
                    || record.has_pair(&device.device_id, &peer.device_id)
                {
                    continue;
                }

                let pair = SessionPair::new(device.device_id.clone(), peer.device_id.clone());
                let result = match self.prepare_device(&peer).await {
                    Ok(()) => {
                        self.establish_pair(&conversation_id, &pair, &record.negotiation, record.epoch, None)
                            .await
                    }
                    Err(err) => Err(err),
                };
                match result {
                    Ok(_) => record.pairs.push(pair),
                    Err(error) => {
                        warn!(
                            target: "manager",
                            conversation = %conversation_id,
                            peer = %peer.device_id,
                            error = %error,
                            "Sharing keys with peer device failed"
                        );
                        if failure.is_none() {
                            failure = Some(error);
                        }
                    }
                }
            }

            record.updated_at = current_timestamp();
            self.save_conversation(&record).await?;
            version_source = Some(record.negotiation);
            match failure {
                None => shared_conversations.push(conversation_id),
                Some(error) => failed_conversations.push(ConversationFailure { conversation_id, error }),
            }
        }

        if let Some(negotiation) = version_source {
            self.record_encryption_version(&device, &negotiation).await?;
        }

        info!(
            target: "manager",
            device = %new_device,
            shared = shared_conversations.len(),
            failed = failed_conversations.len(),
            "Keys shared to new device"
        );
        Ok(ShareResult {
            shared_conversations,
            failed_conversations,
        })
    }

    /// Rotates every pair of the conversation into a new epoch.
    ///
    /// The X3DH initiator of each pair rotates and the peer endpoint applies
    /// the notice. A failing pair is reported and the rest continue.
    pub async fn rotate_conversation_keys(
        &self,
        conversation_id: &ConversationId,
        retention: KeyRetention,
    ) -> Result<RotationResult> {
        let mut record = self.require_conversation(conversation_id).await?;

        let mut rotated_devices: Vec<DeviceId> = Vec::new();
        let mut failed_devices = Vec::new();
        let mut new_epoch = record.epoch;

        for pair in &record.pairs {
            match self.rotate_pair(conversation_id, pair, retention).await {
                Ok(epoch) => {
                    new_epoch = new_epoch.max(epoch);
                    for device in [&pair.initiator, &pair.responder] {
                        if !rotated_devices.contains(device) {
                            rotated_devices.push(device.clone());
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        target: "manager",
                        conversation = %conversation_id,
                        initiator = %pair.initiator,
                        responder = %pair.responder,
                        error = %error,
                        "Pair rotation failed"
                    );
                    failed_devices.push(DeviceFailure {
                        device_id: pair.responder.clone(),
                        error,
                    });
                }
            }
        }
        rotated_devices.sort();

        record.epoch = new_epoch;
        record.updated_at = current_timestamp();
        self.save_conversation(&record).await?;

        info!(
            target: "manager",
            conversation = %conversation_id,
            epoch = new_epoch,
            rotated = rotated_devices.len(),
            failed = failed_devices.len(),
            "Conversation keys rotated"
        );
        Ok(RotationResult {
            rotated_devices,
            failed_devices,
            new_epoch,
        })
    }

    async fn rotate_pair(&self, conversation_id: &ConversationId, pair: &SessionPair, retention: KeyRetention) -> Result<u32> {
        let notice = self
            .engine
            .rotate(&pair.initiator_session(conversation_id), retention)
            .await?;
        self.engine
            .accept_rotation(&pair.responder_session(conversation_id), &notice)
            .await
    }

    /// Moves `device_id` to `target_algorithms` and re-keys every pair it is in.
    ///
    /// Each pair is renegotiated against the counterpart's capabilities. A
    /// pair without a common algorithm keeps its old sessions and is reported
    /// as `NoCommonAlgorithm`; there is no silent downgrade. With
    /// `preserve_keys` the old sessions stay readable until
    /// [`Self::deactivate_old_keys`].
    ///
    /// The registry takes the new capabilities only when at least one pair
    /// migrated, or when the device has no pairs at all.
    pub async fn migrate_device(
        &self,
        device_id: &DeviceId,
        target_algorithms: CapabilitySet,
        preserve_keys: bool,
    ) -> Result<MigrationResult> {
        let previous = self.registry.get_device(device_id).await?;
        if previous.is_revoked() {
            return Err(E2eeError::DeviceRevoked(device_id.clone()));
        }

        let mut device = previous.clone();
        device.capabilities = target_algorithms.clone();
        device.capabilities_verified_at = Some(current_timestamp());
        self.prepare_device(&device).await?;

        let supported = self.engine.supported_algorithms();
        let retention = KeyRetention::from_preserve(preserve_keys);
        let mut migrated = Vec::new();
        let mut failed = Vec::new();

        for conversation_id in self.registry.list_user_conversations(&device.user_id).await? {
            let Some(record) = self.load_conversation(&conversation_id).await? else {
                continue;
            };

            for pair in record.pairs.iter().filter(|p| p.involves(device_id)) {
                let Some(peer_id) = pair.peer_of(device_id) else {
                    continue;
                };
                match self
                    .migrate_pair(&conversation_id, pair, &device, peer_id, &supported, retention)
                    .await
                {
                    Ok(entry) => migrated.push(entry),
                    Err(error) => {
                        warn!(
                            target: "manager",
                            conversation = %conversation_id,
                            device = %device_id,
                            peer = %peer_id,
                            error = %error,
                            "Pair migration failed, previous sessions kept"
                        );
                        failed.push(PairFailure {
                            conversation_id: conversation_id.clone(),
                            peer: peer_id.clone(),
                            error,
                        });
                    }
                }
            }
        }

        if migrated.is_empty() && !failed.is_empty() {
            // Every pair still runs on the old algorithm
            warn!(
                target: "manager",
                device = %device_id,
                failed = failed.len(),
                "No pair migrated, declared capabilities left unchanged"
            );
            self.engine
                .ensure_kem_keys(device_id, &previous.capabilities)
                .await?;
        } else {
            let mut updated = self.registry.get_device(device_id).await?;
            updated.capabilities = device.capabilities.clone();
            updated.capabilities_verified_at = device.capabilities_verified_at;
            self.registry.update_device(updated).await?;

            if let Some(best) = migrated.iter().map(|m| m.negotiation).min_by_key(|n| n.algorithm) {
                self.record_encryption_version(&device, &best).await?;
            }
        }

        info!(
            target: "manager",
            device = %device_id,
            migrated = migrated.len(),
            failed = failed.len(),
            preserve_keys,
            "Device migrated"
        );
        Ok(MigrationResult {
            device_id: device_id.clone(),
            capabilities: target_algorithms,
            migrated,
            failed,
        })
    }

    async fn migrate_pair(
        &self,
        conversation_id: &ConversationId,
        pair: &SessionPair,
        device: &Device,
        peer_id: &DeviceId,
        supported: &CapabilitySet,
        retention: KeyRetention,
    ) -> Result<MigratedPair> {
        let peer = self.registry.get_device(peer_id).await?;
        if peer.is_revoked() {
            return Err(E2eeError::DeviceRevoked(peer_id.clone()));
        }
        let negotiation = negotiate_supported([&device.capabilities, &peer.capabilities], supported)?;
        self.prepare_device(&peer).await?;

        let current = self
            .engine
            .session_snapshot(&pair.initiator_session(conversation_id))
            .await?
            .epoch
            .max(
                self.engine
                    .session_snapshot(&pair.responder_session(conversation_id))
                    .await?
                    .epoch,
            );
        let epoch = current
            .checked_add(1)
            .ok_or(E2eeError::EpochConflict { epoch: current })?;

        self.establish_pair(conversation_id, pair, &negotiation, epoch, Some(retention))
            .await?;
        Ok(MigratedPair {
            conversation_id: conversation_id.clone(),
            peer: peer_id.clone(),
            negotiation,
            epoch,
        })
    }

    /// Drops retired epochs of every session touching `device_id`, in both
    /// directions. Returns how many retired epochs were removed.
    pub async fn deactivate_old_keys(&self, device_id: &DeviceId) -> Result<usize> {
        let device = self.registry.get_device(device_id).await?;
        let mut removed = 0;
        for conversation_id in self.registry.list_user_conversations(&device.user_id).await? {
            let Some(record) = self.load_conversation(&conversation_id).await? else {
                continue;
            };
            for pair in record.pairs.iter().filter(|p| p.involves(device_id)) {
                removed += self
                    .engine
                    .deactivate_old_keys(&pair.initiator_session(&conversation_id))
                    .await?;
                removed += self
                    .engine
                    .deactivate_old_keys(&pair.responder_session(&conversation_id))
                    .await?;
            }
        }
        Ok(removed)
    }

    /// Soft-revokes the device and destroys every session and key record of it.
    pub async fn remove_device(&self, device_id: &DeviceId) -> Result<RemovalResult> {
        let device = self.registry.get_device(device_id).await?;
        self.registry.revoke_device(device_id, current_timestamp()).await?;

        let mut removed_sessions = Vec::new();
        for conversation_id in self.registry.list_user_conversations(&device.user_id).await? {
            let Some(mut record) = self.load_conversation(&conversation_id).await? else {
                continue;
            };
            let (gone, kept): (Vec<SessionPair>, Vec<SessionPair>) =
                record.pairs.drain(..).partition(|p| p.involves(device_id));
            if gone.is_empty() {
                record.pairs = kept;
                continue;
            }

            for pair in &gone {
                for id in [pair.initiator_session(&conversation_id), pair.responder_session(&conversation_id)] {
                    if self.engine.delete_session(&id).await? {
                        removed_sessions.push(id);
                    }
                }
            }
            record.pairs = kept;
            record.updated_at = current_timestamp();
            self.save_conversation(&record).await?;
        }

        for key in [
            StoreKey::Identity(device_id.clone()),
            StoreKey::SignedPreKeys(device_id.clone()),
            StoreKey::OneTimePreKeys(device_id.clone()),
        ] {
            self.engine.store().delete(&key).await?;
        }

        info!(
            target: "manager",
            device = %device_id,
            sessions = removed_sessions.len(),
            "Device removed"
        );
        Ok(RemovalResult {
            device_id: device_id.clone(),
            removed_sessions,
        })
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Result<Option<ConversationRecord>> {
        self.load_conversation(conversation_id).await
    }

    /// Runs X3DH for one pair and seeds both endpoint sessions at `epoch`.
    /// With `retention` the existing sessions are re-keyed instead of overwritten.
    async fn establish_pair(
        &self,
        conversation_id: &ConversationId,
        pair: &SessionPair,
        negotiation: &NegotiationResult,
        epoch: u32,
        retention: Option<KeyRetention>,
    ) -> Result<[SessionId; 2]> {
        let bundle = self
            .engine
            .create_prekey_bundle(&pair.responder, Some(*negotiation))
            .await?;
        let ephemeral = self.engine.generate_ephemeral()?;
        let initiator = self
            .engine
            .derive_shared_secret(&pair.initiator, ephemeral, &bundle)
            .await?
            .with_epoch(epoch);
        let handshake = initiator
            .handshake
            .clone()
            .ok_or_else(|| E2eeError::KeyMaterialMissing("handshake message".to_string()))?;
        let responder = self.engine.accept_handshake(&pair.responder, &handshake).await?;

        let initiator_id = pair.initiator_session(conversation_id);
        let responder_id = pair.responder_session(conversation_id);
        match retention {
            Some(retention) => {
                self.engine
                    .reinitialize_session(&initiator_id, &initiator, retention)
                    .await?;
                self.engine
                    .reinitialize_session(&responder_id, &responder, retention)
                    .await?;
            }
            None => {
                self.engine.initialize_session(&initiator_id, &initiator).await?;
                self.engine.initialize_session(&responder_id, &responder).await?;
            }
        }

        debug!(
            target: "manager",
            conversation = %conversation_id,
            initiator = %pair.initiator,
            responder = %pair.responder,
            algorithm = %negotiation.algorithm,
            epoch,
            forward_secrecy = ?initiator.forward_secrecy,
            "Pair established"
        );
        Ok([initiator_id, responder_id])
    }

    /// Makes sure the engine holds key material matching the device's declared capabilities.
    async fn prepare_device(&self, device: &Device) -> Result<()> {
        if self.engine.has_identity(&device.device_id).await? {
            self.engine
                .ensure_kem_keys(&device.device_id, &device.capabilities)
                .await?;
        } else {
            let provisioned = self
                .engine
                .provision_device(&device.device_id, device.capabilities.clone())
                .await?;
            let mut updated = device.clone();
            updated.identity_fingerprint = Some(provisioned.fingerprint);
            self.registry.update_device(updated).await?;
        }
        Ok(())
    }

    async fn record_encryption_version(&self, device: &Device, negotiation: &NegotiationResult) -> Result<()> {
        let mut updated = self.registry.get_device(&device.device_id).await?;
        updated.encryption_version = negotiation.algorithm.protocol_version();
        self.registry.update_device(updated).await
    }

    async fn load_conversation(&self, conversation_id: &ConversationId) -> Result<Option<ConversationRecord>> {
        match self
            .engine
            .store()
            .get(&StoreKey::Conversation(conversation_id.clone()))
            .await?
        {
            Some(bytes) => Ok(Some(serialization::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn require_conversation(&self, conversation_id: &ConversationId) -> Result<ConversationRecord> {
        self.load_conversation(conversation_id).await?.ok_or_else(|| {
            E2eeError::KeyMaterialMissing(format!("encryption record of conversation {}", conversation_id))
        })
    }

    async fn save_conversation(&self, record: &ConversationRecord) -> Result<()> {
        let bytes = serialization::to_bytes(record)?;
        self.engine
            .store()
            .put(&StoreKey::Conversation(record.conversation_id.clone()), bytes)
            .await?;
        Ok(())
    }
}

/// Initiating device first, otherwise the smaller id initiates.
fn pair_for(a: &DeviceId, b: &DeviceId, initiating: &DeviceId) -> SessionPair {
    let (initiator, responder) = if b == initiating || (a != initiating && b < a) {
        (b, a)
    } else {
        (a, b)
    };
    SessionPair::new(initiator.clone(), responder.clone())
}
