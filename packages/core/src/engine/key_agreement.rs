//! Key agreement operations
//!
//! Долгосрочные ключи устройства и X3DH поверх хранилища.
//!
//! ## Процесс
//!
//! ```text
//! provision_device()        identity + signed prekey + batch of one-time prekeys
//! create_prekey_bundle()    current SPK (rotated if stale) + one OPK via compare_and_consume
//! derive_shared_secret()    initiator side of X3DH against a bundle
//! accept_handshake()        responder side; the OPK private half is taken out of the pool
//!
//! Issued OPKs whose handshake never arrives are dropped after
//! one_time_prekey_retention_seconds.
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::E2eeEngine;
use crate::crypto::algorithm::{CapabilitySet, KemLevel};
use crate::crypto::handshake::{
    HandshakeMessage, OneTimePreKeyPublic, PreKeyBundle, SharedSecretMaterial, SignedPreKeyPublic, X3DHProtocol,
};
use crate::crypto::keys::{self, EphemeralKey, IdentityKey, SignedPreKey};
use crate::crypto::negotiation::NegotiationResult;
use crate::error::{E2eeError, Result};
use crate::ids::DeviceId;
use crate::storage::{KeyStore, OneTimePreKeyRecord, SignedPreKeyRecord, StoreKey};
use crate::utils::time::{current_timestamp, is_older_than};

/// Key material created by [`E2eeEngine::provision_device`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedDevice {
    pub device_id: DeviceId,
    pub fingerprint: String,
    pub signed_prekey_id: u32,
    pub one_time_prekeys: usize,
    pub kem_levels: Vec<KemLevel>,
}

impl<S: KeyStore> E2eeEngine<S> {
    /// Creates (or replaces) the identity key of `device`.
    ///
    /// Replacing an identity invalidates every session derived from the old
    /// one; callers re-key those sessions.
    pub async fn generate_identity_key(&self, device: &DeviceId, capabilities: CapabilitySet) -> Result<IdentityKey> {
        let _guard = self.lock_keys(device).await;
        let identity = IdentityKey::generate(&self.suite, device.clone(), capabilities)?;

        let key = StoreKey::Identity(device.clone());
        if self.store.get(&key).await?.is_some() {
            warn!(
                target: "engine::keys",
                device_id = %device,
                "Replacing existing identity key, dependent sessions must be re-keyed"
            );
        }
        self.save(&key, &identity).await?;
        Ok(identity)
    }

    /// Publishes a new signed prekey; the previous one stays acceptable for
    /// `signed_prekey_retention_seconds`.
    pub async fn generate_signed_prekey(&self, device: &DeviceId) -> Result<SignedPreKeyPublic> {
        let _guard = self.lock_keys(device).await;
        let identity = self.load_identity(device).await?;
        self.publish_signed_prekey(&identity, current_timestamp()).await
    }

    /// Publishes a new signed prekey and drops superseded ones past retention.
    /// Returns the new prekey and how many old ones were dropped.
    pub async fn rotate_signed_prekey(&self, device: &DeviceId) -> Result<(SignedPreKeyPublic, usize)> {
        let _guard = self.lock_keys(device).await;
        let now = current_timestamp();
        let identity = self.load_identity(device).await?;
        let published = self.publish_signed_prekey(&identity, now).await?;

        let key = StoreKey::SignedPreKeys(device.clone());
        let mut record = self
            .load::<SignedPreKeyRecord>(&key)
            .await?
            .ok_or_else(|| E2eeError::KeyMaterialMissing(format!("signed prekey of device {}", device)))?;
        let pruned = record.prune(now, self.config.signed_prekey_retention_seconds);
        if pruned > 0 {
            self.save(&key, &record).await?;
            debug!(
                target: "engine::keys",
                device_id = %device,
                pruned,
                "Dropped superseded signed prekeys"
            );
        }
        Ok((published, pruned))
    }

    async fn publish_signed_prekey(&self, identity: &IdentityKey, now: i64) -> Result<SignedPreKeyPublic> {
        let key = StoreKey::SignedPreKeys(identity.device_id.clone());
        let record = match self.load::<SignedPreKeyRecord>(&key).await? {
            Some(mut record) => {
                let prekey = SignedPreKey::generate(&self.suite, identity, record.next_id)?;
                record.supersede(prekey, now);
                record
            }
            None => SignedPreKeyRecord::new(SignedPreKey::generate(&self.suite, identity, 1)?),
        };
        self.save(&key, &record).await?;

        info!(
            target: "engine::keys",
            device_id = %identity.device_id,
            prekey_id = record.current.id,
            "Signed prekey published"
        );
        Ok(record.current.to_public())
    }

    /// Adds `count` one-time prekeys to the pool of `device`.
    pub async fn generate_one_time_prekeys(&self, device: &DeviceId, count: u32) -> Result<Vec<OneTimePreKeyPublic>> {
        let _guard = self.lock_keys(device).await;
        let key = StoreKey::OneTimePreKeys(device.clone());
        let mut record = self.load::<OneTimePreKeyRecord>(&key).await?.unwrap_or_default();
        self.prune_one_time_prekeys(device, &mut record, current_timestamp());

        let batch = keys::generate_one_time_prekeys(&self.suite, record.next_id.max(1), count)?;
        let published: Vec<OneTimePreKeyPublic> = batch.iter().map(|k| k.to_public()).collect();
        record.extend(batch);
        self.save(&key, &record).await?;

        debug!(
            target: "engine::keys",
            device_id = %device,
            added = published.len(),
            available = record.available(),
            "One-time prekeys generated"
        );
        Ok(published)
    }

    /// One-time prekeys of `device` not yet issued in a bundle
    pub async fn one_time_prekey_count(&self, device: &DeviceId) -> Result<usize> {
        Ok(self
            .load::<OneTimePreKeyRecord>(&StoreKey::OneTimePreKeys(device.clone()))
            .await?
            .map(|r| r.available())
            .unwrap_or(0))
    }

    /// Identity, signed prekey and one batch of one-time prekeys for a new device.
    pub async fn provision_device(&self, device: &DeviceId, capabilities: CapabilitySet) -> Result<ProvisionedDevice> {
        let identity = self.generate_identity_key(device, capabilities).await?;
        let signed_prekey = self.generate_signed_prekey(device).await?;
        let one_time = self
            .generate_one_time_prekeys(device, self.config.one_time_prekey_batch)
            .await?;

        Ok(ProvisionedDevice {
            device_id: device.clone(),
            fingerprint: identity.fingerprint(),
            signed_prekey_id: signed_prekey.id,
            one_time_prekeys: one_time.len(),
            kem_levels: identity.kem_levels(),
        })
    }

    /// Brings the identity of `device` in line with newly declared
    /// capabilities, creating KEM keys for new levels. The signed prekey is
    /// re-published when KEM levels were added so it carries KEM prekeys for
    /// them too. Returns the added levels.
    pub async fn ensure_kem_keys(&self, device: &DeviceId, capabilities: &CapabilitySet) -> Result<Vec<KemLevel>> {
        let _guard = self.lock_keys(device).await;
        let mut identity = self.load_identity(device).await?;
        let added = identity.extend_capabilities(&self.suite, capabilities)?;
        self.save(&StoreKey::Identity(device.clone()), &identity).await?;

        if !added.is_empty() {
            info!(
                target: "engine::keys",
                device_id = %device,
                added = ?added,
                "KEM keys added for upgraded capabilities"
            );
            self.publish_signed_prekey(&identity, current_timestamp()).await?;
        }
        Ok(added)
    }

    /// Assembles a bundle for one initiator.
    ///
    /// A one-time prekey is included when one is left; its id is claimed
    /// through `compare_and_consume` and never appears in another bundle.
    /// Without one the bundle is still valid and the agreement has reduced
    /// forward secrecy.
    pub async fn create_prekey_bundle(
        &self,
        device: &DeviceId,
        negotiated: Option<NegotiationResult>,
    ) -> Result<PreKeyBundle> {
        let _guard = self.lock_keys(device).await;
        let now = current_timestamp();
        let identity = self.load_identity(device).await?;

        let spk_key = StoreKey::SignedPreKeys(device.clone());
        let mut signed = match self.load::<SignedPreKeyRecord>(&spk_key).await? {
            Some(record) => record.current.to_public(),
            None => {
                return Err(E2eeError::KeyMaterialMissing(format!(
                    "signed prekey of device {}",
                    device
                )))
            }
        };
        if is_older_than(signed.created_at, now, self.config.signed_prekey_max_age_seconds) {
            info!(
                target: "engine::keys",
                device_id = %device,
                prekey_id = signed.id,
                "Signed prekey expired, publishing a fresh one"
            );
            signed = self.publish_signed_prekey(&identity, now).await?;
        }
        let record = self
            .load::<SignedPreKeyRecord>(&spk_key)
            .await?
            .ok_or_else(|| E2eeError::KeyMaterialMissing(format!("signed prekey of device {}", device)))?;

        let one_time_prekey = self.claim_one_time_prekey(device, now).await?;
        if one_time_prekey.is_none() {
            warn!(
                target: "engine::keys",
                device_id = %device,
                "One-time prekeys exhausted, bundle issued without one"
            );
        }

        Ok(PreKeyBundle {
            device_id: device.clone(),
            registration_id: identity.registration_id,
            identity_key: identity.dh_public.clone(),
            signing_key: identity.signing_public.clone(),
            signed_prekey: signed,
            one_time_prekey,
            quantum_identity_keys: identity.kem_keys.iter().map(|k| k.to_public()).collect(),
            quantum_signed_prekeys: record.current.kem_prekeys.iter().map(|k| k.to_public()).collect(),
            capabilities: identity.capabilities.clone(),
            negotiated,
        })
    }

    async fn claim_one_time_prekey(&self, device: &DeviceId, now: i64) -> Result<Option<OneTimePreKeyPublic>> {
        let key = StoreKey::OneTimePreKeys(device.clone());
        let Some(mut record) = self.load::<OneTimePreKeyRecord>(&key).await? else {
            return Ok(None);
        };

        let mut claimed = None;
        for id in record.candidates() {
            let won = self.store.compare_and_consume(device, id).await?;
            record.mark_used(id, now);
            if won {
                claimed = record.keys.get(&id).map(|k| k.to_public());
                break;
            }
        }
        self.save(&key, &record).await?;
        Ok(claimed)
    }

    fn prune_one_time_prekeys(&self, device: &DeviceId, record: &mut OneTimePreKeyRecord, now: i64) -> usize {
        let pruned = record.prune_issued(now, self.config.one_time_prekey_retention_seconds);
        if pruned > 0 {
            debug!(
                target: "engine::keys",
                device_id = %device,
                pruned,
                "Dropped one-time prekeys whose handshake never arrived"
            );
        }
        pruned
    }

    pub fn generate_ephemeral(&self) -> Result<EphemeralKey> {
        Ok(EphemeralKey::generate(&self.suite)?)
    }

    /// Initiator side of X3DH for `local_device` against `bundle`.
    pub async fn derive_shared_secret(
        &self,
        local_device: &DeviceId,
        ephemeral: EphemeralKey,
        bundle: &PreKeyBundle,
    ) -> Result<SharedSecretMaterial> {
        let identity = self.load_identity(local_device).await?;
        X3DHProtocol::new(&self.suite, &self.config).perform_as_initiator(
            &identity,
            ephemeral,
            bundle,
            current_timestamp(),
        )
    }

    /// Responder side of X3DH.
    ///
    /// Looks up the signed prekey (current or superseded within retention)
    /// and takes the one-time prekey out of the pool; a second handshake
    /// naming the same one-time prekey fails with `BundleExhausted`, as does
    /// one arriving after `one_time_prekey_retention_seconds`.
    pub async fn accept_handshake(&self, device: &DeviceId, handshake: &HandshakeMessage) -> Result<SharedSecretMaterial> {
        if &handshake.responder_device != device {
            return Err(E2eeError::InvalidEnvelope(format!(
                "handshake addressed to {} delivered to {}",
                handshake.responder_device, device
            )));
        }

        let _guard = self.lock_keys(device).await;
        let now = current_timestamp();
        let identity = self.load_identity(device).await?;

        let mut signed = self
            .load::<SignedPreKeyRecord>(&StoreKey::SignedPreKeys(device.clone()))
            .await?
            .ok_or_else(|| E2eeError::KeyMaterialMissing(format!("signed prekey of device {}", device)))?;
        signed.prune(now, self.config.signed_prekey_retention_seconds);
        let signed_prekey = signed.find(handshake.signed_prekey_id).ok_or_else(|| {
            E2eeError::KeyMaterialMissing(format!(
                "signed prekey {} of device {}",
                handshake.signed_prekey_id, device
            ))
        })?;

        let otk_key = StoreKey::OneTimePreKeys(device.clone());
        let mut pool = self.load::<OneTimePreKeyRecord>(&otk_key).await?.unwrap_or_default();
        let pruned = self.prune_one_time_prekeys(device, &mut pool, now);
        let one_time_prekey = match handshake.one_time_prekey_id {
            Some(id) => Some(pool.take(id).ok_or_else(|| {
                E2eeError::BundleExhausted(format!("one-time prekey {} of device {}", id, device))
            })?),
            None => None,
        };

        let material = X3DHProtocol::new(&self.suite, &self.config).perform_as_responder(
            &identity,
            signed_prekey,
            one_time_prekey.as_ref(),
            handshake,
        )?;

        if one_time_prekey.is_some() || pruned > 0 {
            self.save(&otk_key, &pool).await?;
        }
        Ok(material)
    }
}
