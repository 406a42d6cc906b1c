//! Session operations
//!
//! Каждая операция: lock(session_id) → load → mutate → save → unlock.
//! Сессия сохраняется только если состояние изменилось так, как описано в
//! [`RatchetSession::decrypt`].

use tracing::{debug, info, warn};

use super::E2eeEngine;
use crate::crypto::handshake::SharedSecretMaterial;
use crate::crypto::messaging::{EncryptedEnvelope, KeyRetention, RatchetSession, RotationNotice, SessionSnapshot};
use crate::error::{E2eeError, Result};
use crate::ids::SessionId;
use crate::storage::{KeyStore, StoreKey};
use crate::utils::time::current_timestamp;

impl<S: KeyStore> E2eeEngine<S> {
    /// Seeds session `id` from a completed key agreement.
    ///
    /// An existing session under the same id is overwritten; use
    /// [`Self::reinitialize_session`] to carry its retired keys over.
    pub async fn initialize_session(&self, id: &SessionId, material: &SharedSecretMaterial) -> Result<SessionSnapshot> {
        let _guard = self.lock_session(id).await?;
        let identity = self.load_identity(&id.local_device).await?;
        let session = RatchetSession::initialize(
            &self.suite,
            &self.config,
            id.clone(),
            material,
            &identity,
            current_timestamp(),
        )?;

        let key = StoreKey::Session(id.clone());
        if self.store.get(&key).await?.is_some() {
            warn!(target: "engine::sessions", session = %id, "Overwriting existing session");
        }
        self.save_session(&session).await?;

        info!(
            target: "engine::sessions",
            session = %id,
            algorithm = %session.algorithm(),
            forward_secrecy = ?session.forward_secrecy(),
            "Session initialized"
        );
        Ok(session.snapshot())
    }

    /// Replaces session `id` with one seeded from `material`.
    ///
    /// `material` must start at a later epoch than the session it replaces.
    /// With [`KeyRetention::Preserve`] the old session's receiving state
    /// stays readable until [`Self::deactivate_old_keys`].
    pub async fn reinitialize_session(
        &self,
        id: &SessionId,
        material: &SharedSecretMaterial,
        retention: KeyRetention,
    ) -> Result<SessionSnapshot> {
        let _guard = self.lock_session(id).await?;
        let now = current_timestamp();
        let identity = self.load_identity(&id.local_device).await?;
        let mut session =
            RatchetSession::initialize(&self.suite, &self.config, id.clone(), material, &identity, now)?;

        if let Some(previous) = self.load::<RatchetSession>(&StoreKey::Session(id.clone())).await? {
            session.inherit_from(&previous, retention, now)?;
            debug!(
                target: "engine::sessions",
                session = %id,
                previous_epoch = previous.epoch(),
                epoch = session.epoch(),
                retention = ?retention,
                "Session re-keyed"
            );
        }
        self.save_session(&session).await?;
        Ok(session.snapshot())
    }

    pub async fn encrypt(&self, id: &SessionId, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let _guard = self.lock_session(id).await?;
        let mut session = self.load_session(id).await?;
        let envelope = session.encrypt(&self.suite, &self.config, plaintext, current_timestamp())?;
        self.save_session(&session).await?;
        Ok(envelope)
    }

    /// Decrypts `envelope` on session `id`.
    ///
    /// An `AuthenticationFailed` result still persists the session: the
    /// message key is burned.
    pub async fn decrypt(&self, id: &SessionId, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let _guard = self.lock_session(id).await?;
        let mut session = self.load_session(id).await?;
        let identity = self.load_identity(&id.local_device).await?;

        let result = session.decrypt(&self.suite, &self.config, &identity, envelope, current_timestamp());
        match &result {
            Ok(_) | Err(E2eeError::AuthenticationFailed { .. }) | Err(E2eeError::KeysDeactivated { .. }) => {
                self.save_session(&session).await?;
            }
            Err(_) => {}
        }
        result
    }

    /// Opens a new epoch on session `id`. The notice goes to the peer endpoint.
    pub async fn rotate(&self, id: &SessionId, retention: KeyRetention) -> Result<RotationNotice> {
        let _guard = self.lock_session(id).await?;
        let mut session = self.load_session(id).await?;
        let notice = session.rotate(&self.suite, &self.config, retention, current_timestamp())?;
        self.save_session(&session).await?;

        info!(
            target: "engine::sessions",
            session = %id,
            epoch = notice.epoch,
            retention = ?retention,
            "Session rotated"
        );
        Ok(notice)
    }

    /// Applies a peer's rotation notice. Returns the session's epoch afterwards.
    pub async fn accept_rotation(&self, id: &SessionId, notice: &RotationNotice) -> Result<u32> {
        let _guard = self.lock_session(id).await?;
        let mut session = self.load_session(id).await?;
        let identity = self.load_identity(&id.local_device).await?;
        session.accept_rotation(&self.suite, &self.config, &identity, notice, current_timestamp())?;
        self.save_session(&session).await?;
        Ok(session.epoch())
    }

    /// Drops retired epochs of session `id`. Returns how many were dropped.
    pub async fn deactivate_old_keys(&self, id: &SessionId) -> Result<usize> {
        let _guard = self.lock_session(id).await?;
        let mut session = self.load_session(id).await?;
        let removed = session.deactivate_retired();
        self.save_session(&session).await?;

        if removed > 0 {
            info!(target: "engine::sessions", session = %id, removed, "Old epoch keys deactivated");
        }
        Ok(removed)
    }

    /// Removes skipped message keys older than `max_skipped_message_age_seconds`.
    pub async fn cleanup_skipped_keys(&self, id: &SessionId) -> Result<usize> {
        let _guard = self.lock_session(id).await?;
        let mut session = self.load_session(id).await?;
        let removed =
            session.cleanup_old_skipped_keys(self.config.max_skipped_message_age_seconds, current_timestamp());
        if removed > 0 {
            self.save_session(&session).await?;
        }
        Ok(removed)
    }

    /// Destroys session `id`. Returns whether it existed.
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let guard = self.lock_session(id).await?;
        let key = StoreKey::Session(id.clone());
        let existed = self.store.get(&key).await?.is_some();
        self.store.delete(&key).await?;
        drop(guard);
        self.session_locks.forget(id).await;

        if existed {
            debug!(target: "engine::sessions", session = %id, "Session deleted");
        }
        Ok(existed)
    }

    pub async fn session_snapshot(&self, id: &SessionId) -> Result<SessionSnapshot> {
        Ok(self.load_session(id).await?.snapshot())
    }

    pub async fn has_session(&self, id: &SessionId) -> Result<bool> {
        Ok(self.store.get(&StoreKey::Session(id.clone())).await?.is_some())
    }

    async fn load_session(&self, id: &SessionId) -> Result<RatchetSession> {
        self.load(&StoreKey::Session(id.clone()))
            .await?
            .ok_or_else(|| E2eeError::SessionNotFound(id.clone()))
    }

    async fn save_session(&self, session: &RatchetSession) -> Result<()> {
        self.save(&StoreKey::Session(session.id().clone()), session).await
    }
}
