//! Double Ratchet Protocol Implementation
//!
//! Реализация протокола Double Ratchet (Signal Protocol) с эпохами ротации.
//!
//! ## Архитектура
//!
//! 1. **DH Ratchet**: новая DH пара на каждом "turn" в диалоге
//! 2. **Symmetric Ratchet**: chain key → (message key, next chain key) на каждое сообщение
//! 3. **Epochs**: `rotate()` открывает новую эпоху независимо от потока сообщений
//!
//! ## Инициализация
//!
//! ```text
//! Initiator                                  Responder
//! ---------                                  ---------
//! base = HKDF(SK)                            base = HKDF(SK)
//! (RK, CKs) = KDF_RK(base, DH(EK, IK_B))     (RK, CKr) = KDF_RK(base, DH(IK_B, EK))
//! ratchet key = EK                           new pair M
//!                                            (RK, CKs) = KDF_RK(RK, DH(M, EK))
//! ```
//!
//! Обе стороны могут отправлять сразу после инициализации.
//!
//! ## Эпохи
//!
//! ```text
//! rotate():         N = new pair
//!                   root_e = HKDF(salt = base, DH(N, IK_remote) || KEM(IK_remote_kem) || quantum_secret,
//!                                 "Double-Ratchet-Epoch-Root" || e || algorithm)
//!                   ratchet re-seeded as initiator with N
//! accept_rotation(): same root_e from DH(IK_local, N) and KEM decapsulation,
//!                   ratchet re-seeded as responder
//! ```
//!
//! Ключи предыдущей эпохи либо сохраняются как receive-only цепочка
//! ([`KeyRetention::Preserve`]) до явного `deactivate_retired()`, либо
//! удаляются сразу ([`KeyRetention::Discard`]).
//!
//! ## Политика ошибок
//!
//! `decrypt` работает на копии сессии. При ошибке аутентификации копия
//! отбрасывается целиком: счётчик цепочки и кэш пропущенных ключей не
//! меняются. Сохраняется только "сожжённый" ключ (ratchet key, counter):
//! запись удаляется из кэша, либо помечается в ограниченном списке
//! `burned`, если ключ был бы выведен продвижением цепочки. Если конверт
//! потребовал DH ratchet step или смену эпохи, не сохраняется ничего.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Deref;
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::Config;
use crate::crypto::algorithm::AlgorithmId;
use crate::crypto::handshake::{ForwardSecrecy, RatchetSeed, Role, SharedSecretMaterial};
use crate::crypto::keys::IdentityKey;
use crate::crypto::messaging::{
    associated_data, EncryptedEnvelope, KeyRetention, MessageHeader, RotationAnnouncement,
    RotationNotice,
};
use crate::crypto::provider::SecretBytes;
use crate::crypto::suites::classic::TAG_LENGTH;
use crate::crypto::suites::PrimitiveSuite;
use crate::error::{CryptoError, E2eeError, Result};
use crate::ids::SessionId;
use crate::utils::serialization;
use crate::utils::time::is_older_than;
use crate::utils::validation::KEY_LENGTH;

const INITIAL_ROOT_INFO: &[u8] = b"Double-Ratchet-Initial-Root";
const EPOCH_ROOT_INFO: &[u8] = b"Double-Ratchet-Epoch-Root";

/// Persisted secret, wiped on drop
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
struct KeyBytes(Vec<u8>);

impl KeyBytes {
    fn new(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Deref for KeyBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// DH ratchet with its receiving chain
#[derive(Clone, Serialize, Deserialize)]
struct DhRatchet {
    root_key: KeyBytes,
    dh_private: KeyBytes,
    dh_public: Vec<u8>,
    remote_ratchet_key: Option<Vec<u8>>,
    receiving_chain_key: Option<KeyBytes>,
    receiving_counter: u32,
    /// Superseded remote ratchet keys, newest last
    previous_remote_keys: VecDeque<Vec<u8>>,
}

struct Resolved {
    message_key: KeyBytes,
    /// A DH ratchet step was needed
    stepped: bool,
}

impl DhRatchet {
    fn seed_initiator(
        suite: &PrimitiveSuite,
        root: &[u8],
        first_dh: &[u8],
        dh_private: &[u8],
        dh_public: Vec<u8>,
    ) -> Result<(Self, SecretBytes)> {
        let (root_key, sending_chain) = suite.classic.kdf_rk(root, first_dh)?;
        let ratchet = Self {
            root_key: KeyBytes::new(&root_key),
            dh_private: KeyBytes::new(dh_private),
            dh_public,
            remote_ratchet_key: None,
            receiving_chain_key: None,
            receiving_counter: 0,
            previous_remote_keys: VecDeque::new(),
        };
        Ok((ratchet, sending_chain))
    }

    fn seed_responder(
        suite: &PrimitiveSuite,
        root: &[u8],
        first_dh: &[u8],
        remote_ratchet_key: &[u8],
    ) -> Result<(Self, SecretBytes)> {
        let (root_key, receiving_chain) = suite.classic.kdf_rk(root, first_dh)?;
        let mut ratchet = Self {
            root_key: KeyBytes::new(&root_key),
            dh_private: KeyBytes(Vec::new()),
            dh_public: Vec::new(),
            remote_ratchet_key: Some(remote_ratchet_key.to_vec()),
            receiving_chain_key: Some(KeyBytes::new(&receiving_chain)),
            receiving_counter: 0,
            previous_remote_keys: VecDeque::new(),
        };
        let sending_chain = ratchet.sending_step(suite)?;
        Ok((ratchet, sending_chain))
    }

    /// Sending half of a DH ratchet step: fresh key pair, new sending chain.
    fn sending_step(&mut self, suite: &PrimitiveSuite) -> Result<SecretBytes> {
        let remote = self
            .remote_ratchet_key
            .as_deref()
            .ok_or_else(|| E2eeError::KeyMaterialMissing("remote ratchet key".to_string()))?;
        let (dh_private, dh_public) = suite.classic.generate_dh_keys()?;
        let dh = suite.classic.dh(&dh_private, remote)?;
        let (root_key, sending_chain) = suite.classic.kdf_rk(&self.root_key, &dh)?;

        self.root_key = KeyBytes::new(&root_key);
        self.dh_private = KeyBytes::new(&dh_private);
        self.dh_public = dh_public;
        Ok(sending_chain)
    }

    /// Receiving half of a DH ratchet step for a new remote key.
    fn receiving_step(&mut self, suite: &PrimitiveSuite, config: &Config, remote_key: &[u8]) -> Result<()> {
        let dh = suite.classic.dh(&self.dh_private, remote_key)?;
        let (root_key, receiving_chain) = suite.classic.kdf_rk(&self.root_key, &dh)?;

        self.root_key = KeyBytes::new(&root_key);
        if let Some(previous) = self.remote_ratchet_key.replace(remote_key.to_vec()) {
            self.previous_remote_keys.push_back(previous);
            while self.previous_remote_keys.len() > config.previous_chain_memory {
                self.previous_remote_keys.pop_front();
            }
        }
        self.receiving_chain_key = Some(KeyBytes::new(&receiving_chain));
        self.receiving_counter = 0;

        debug!(target: "crypto::double_ratchet", "DH ratchet step completed");
        Ok(())
    }

    /// Finds the message key for `header`, caching every key it skips over.
    fn resolve(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        header: &MessageHeader,
        skipped: &mut SkippedKeys,
        now: i64,
    ) -> Result<Resolved> {
        let counter = header.message_counter;
        let remote_key = header.ratchet_public_key.as_slice();

        if skipped.is_burned(remote_key, counter) {
            debug!(target: "crypto::double_ratchet", counter, "Message key was burned by a failed attempt");
            return Err(E2eeError::AlreadyDecrypted { counter });
        }

        if let Some(message_key) = skipped.take(remote_key, counter) {
            trace!(target: "crypto::double_ratchet", counter, "Found skipped message key");
            return Ok(Resolved {
                message_key,
                stepped: false,
            });
        }

        if self.remote_ratchet_key.as_deref() == Some(remote_key) {
            let message_key = self.advance_receiving(suite, config, counter, header.epoch, skipped, now)?;
            return Ok(Resolved {
                message_key,
                stepped: false,
            });
        }

        if self.previous_remote_keys.iter().any(|k| k.as_slice() == remote_key) {
            debug!(target: "crypto::double_ratchet", counter, "Message on a superseded chain was already consumed");
            return Err(E2eeError::AlreadyDecrypted { counter });
        }

        if self.receiving_chain_key.is_some() {
            self.skip_to(suite, config, header.previous_chain_length, header.epoch, skipped, now)?;
        }
        self.receiving_step(suite, config, remote_key)?;
        let message_key = self.advance_receiving(suite, config, counter, header.epoch, skipped, now)?;
        Ok(Resolved {
            message_key,
            stepped: true,
        })
    }

    fn advance_receiving(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        counter: u32,
        epoch: u32,
        skipped: &mut SkippedKeys,
        now: i64,
    ) -> Result<KeyBytes> {
        if counter < self.receiving_counter {
            debug!(
                target: "crypto::double_ratchet",
                counter,
                position = self.receiving_counter,
                "Replay rejected"
            );
            return Err(E2eeError::AlreadyDecrypted { counter });
        }
        self.skip_to(suite, config, counter, epoch, skipped, now)?;

        let chain = self
            .receiving_chain_key
            .as_ref()
            .ok_or_else(|| E2eeError::KeyMaterialMissing("receiving chain key".to_string()))?;
        let (message_key, next_chain) = suite.classic.kdf_ck(chain)?;
        self.receiving_chain_key = Some(KeyBytes::new(&next_chain));
        self.receiving_counter = counter
            .checked_add(1)
            .ok_or_else(|| E2eeError::InvalidEnvelope("message counter overflow".to_string()))?;
        Ok(KeyBytes::new(&message_key))
    }

    /// Advances the receiving chain to `until`, caching the keys in between.
    fn skip_to(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        until: u32,
        epoch: u32,
        skipped: &mut SkippedKeys,
        now: i64,
    ) -> Result<()> {
        let position = self.receiving_counter;
        if until <= position {
            return Ok(());
        }

        let window = config.max_skipped_messages;
        if until - position > window {
            warn!(
                target: "crypto::double_ratchet",
                counter = until,
                position,
                window,
                "Skip window exceeded"
            );
            return Err(E2eeError::SkippedTooMany {
                counter: until,
                position,
                window,
            });
        }

        let remote_key = self
            .remote_ratchet_key
            .clone()
            .ok_or_else(|| E2eeError::KeyMaterialMissing("remote ratchet key".to_string()))?;
        let mut chain = self
            .receiving_chain_key
            .clone()
            .ok_or_else(|| E2eeError::KeyMaterialMissing("receiving chain key".to_string()))?;

        while self.receiving_counter < until {
            let (message_key, next_chain) = suite.classic.kdf_ck(&chain)?;
            skipped.insert(
                &remote_key,
                self.receiving_counter,
                epoch,
                KeyBytes::new(&message_key),
                now,
                config.skipped_cache_capacity(),
            );
            chain = KeyBytes::new(&next_chain);
            self.receiving_counter += 1;
        }
        self.receiving_chain_key = Some(chain);

        trace!(
            target: "crypto::double_ratchet",
            skipped = until - position,
            cached = skipped.len(),
            "Cached skipped message keys"
        );
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    epoch: u32,
    message_key: KeyBytes,
    stored_at: i64,
    seq: u64,
}

/// Skipped message keys of every epoch, keyed by (ratchet public key, counter)
#[derive(Clone, Default, Serialize, Deserialize)]
struct SkippedKeys {
    entries: BTreeMap<(Vec<u8>, u32), SkippedKey>,
    next_seq: u64,
    /// Positions not yet reached by their chain whose key failed authentication
    #[serde(default)]
    burned: VecDeque<(Vec<u8>, u32)>,
}

impl SkippedKeys {
    fn insert(
        &mut self,
        ratchet_key: &[u8],
        counter: u32,
        epoch: u32,
        message_key: KeyBytes,
        now: i64,
        capacity: usize,
    ) {
        if let Some(index) = self.burned_index(ratchet_key, counter) {
            // The chain moved past it; a missing key now reads as consumed
            self.burned.remove(index);
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            (ratchet_key.to_vec(), counter),
            SkippedKey {
                epoch,
                message_key,
                stored_at: now,
                seq,
            },
        );

        // Oldest first
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn take(&mut self, ratchet_key: &[u8], counter: u32) -> Option<KeyBytes> {
        self.entries
            .remove(&(ratchet_key.to_vec(), counter))
            .map(|entry| entry.message_key)
    }

    /// Consumes the key at (ratchet_key, counter) without touching the chain.
    fn burn(&mut self, ratchet_key: &[u8], counter: u32, capacity: usize) {
        if self.take(ratchet_key, counter).is_some() || self.is_burned(ratchet_key, counter) {
            return;
        }
        self.burned.push_back((ratchet_key.to_vec(), counter));
        while self.burned.len() > capacity {
            self.burned.pop_front();
        }
    }

    fn is_burned(&self, ratchet_key: &[u8], counter: u32) -> bool {
        self.burned_index(ratchet_key, counter).is_some()
    }

    fn burned_index(&self, ratchet_key: &[u8], counter: u32) -> Option<usize> {
        self.burned
            .iter()
            .position(|(key, c)| *c == counter && key.as_slice() == ratchet_key)
    }

    fn retain_epochs(&mut self, keep: impl Fn(u32) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(entry.epoch));
        before - self.entries.len()
    }

    fn cleanup(&mut self, now: i64, max_age_seconds: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !is_older_than(entry.stored_at, now, max_age_seconds));
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Receive-only state of an epoch left behind by a rotation
#[derive(Clone, Serialize, Deserialize)]
struct RetiredEpoch {
    epoch: u32,
    /// Differs from the session's algorithm after a migration re-key
    algorithm: AlgorithmId,
    ratchet: DhRatchet,
    retired_at: i64,
}

/// Our rotation the peer has not answered yet
#[derive(Clone, Serialize, Deserialize)]
struct PendingRotation {
    announcement: RotationAnnouncement,
    quantum_ciphertext: Option<Vec<u8>>,
}

/// Live state of one endpoint of a pairwise channel.
///
/// All mutating methods take `&mut self`; the engine serializes access per
/// [`SessionId`]. The negotiated algorithm never changes for the lifetime of
/// a session.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    id: SessionId,
    role: Role,
    algorithm: AlgorithmId,
    forward_secrecy: ForwardSecrecy,
    epoch: u32,
    base_secret: KeyBytes,
    quantum_secret: Option<KeyBytes>,
    remote_identity_key: Vec<u8>,
    remote_kem_identity_key: Option<Vec<u8>>,
    ratchet: DhRatchet,
    sending_chain_key: KeyBytes,
    sending_counter: u32,
    previous_chain_length: u32,
    skipped: SkippedKeys,
    pending_rotation: Option<PendingRotation>,
    /// Ratchet key that opened the current epoch
    epoch_origin_key: Option<Vec<u8>>,
    retired: Vec<RetiredEpoch>,
    /// Every epoch up to and including this one is unreadable
    deactivated_through: Option<u32>,
    created_at: i64,
    updated_at: i64,
}

/// Read-only view of a session, free of key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub role: Role,
    pub algorithm: AlgorithmId,
    pub forward_secrecy: ForwardSecrecy,
    pub epoch: u32,
    pub sending_counter: u32,
    pub receiving_counter: u32,
    pub skipped_keys: usize,
    pub retired_epochs: Vec<u32>,
    pub deactivated_through: Option<u32>,
    pub rotation_pending: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RatchetSession {
    /// Seeds a session from a completed key agreement.
    pub fn initialize(
        suite: &PrimitiveSuite,
        config: &Config,
        id: SessionId,
        material: &SharedSecretMaterial,
        identity: &IdentityKey,
        now: i64,
    ) -> Result<Self> {
        if id.local_device != material.local_device || id.remote_device != material.remote_device {
            return Err(CryptoError::InvalidInputError(format!(
                "agreement between {} and {} cannot seed session {}",
                material.local_device, material.remote_device, id
            ))
            .into());
        }
        if identity.device_id != material.local_device {
            return Err(E2eeError::KeyMaterialMissing(format!(
                "identity key of device {}",
                material.local_device
            )));
        }

        let algorithm = material.negotiation.algorithm;
        let base_secret = suite.classic.hkdf_derive_key(
            b"",
            &material.root_key,
            &info(INITIAL_ROOT_INFO, algorithm),
            config.key_length,
        )?;

        let (ratchet, sending_chain) = match &material.seed {
            RatchetSeed::Initiator {
                ephemeral_private,
                ephemeral_public,
            } => {
                let dh = suite.classic.dh(ephemeral_private, &material.remote_identity_key)?;
                DhRatchet::seed_initiator(suite, &base_secret, &dh, ephemeral_private, ephemeral_public.clone())?
            }
            RatchetSeed::Responder { remote_ephemeral } => {
                let dh = suite.classic.dh(&identity.dh_private, remote_ephemeral)?;
                DhRatchet::seed_responder(suite, &base_secret, &dh, remote_ephemeral)?
            }
        };

        debug!(
            target: "crypto::double_ratchet",
            session = %id,
            role = ?material.role,
            algorithm = %algorithm,
            epoch = material.epoch,
            "Session initialized"
        );

        Ok(Self {
            id,
            role: material.role,
            algorithm,
            forward_secrecy: material.forward_secrecy,
            epoch: material.epoch,
            base_secret: KeyBytes::new(&base_secret),
            quantum_secret: material.quantum_secret.as_ref().map(|s| KeyBytes::new(s)),
            remote_identity_key: material.remote_identity_key.clone(),
            remote_kem_identity_key: material.remote_kem_identity_key.clone(),
            ratchet,
            sending_chain_key: KeyBytes::new(&sending_chain),
            sending_counter: 0,
            previous_chain_length: 0,
            skipped: SkippedKeys::default(),
            pending_rotation: None,
            epoch_origin_key: None,
            retired: Vec::new(),
            deactivated_through: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Зашифровать сообщение
    ///
    /// 1. (message_key, chain_key') = KDF_CK(chain_key)
    /// 2. ciphertext, tag = AEAD(message_key, random nonce, plaintext, AAD = header)
    /// 3. state is committed only after the AEAD succeeded
    pub fn encrypt(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        plaintext: &[u8],
        now: i64,
    ) -> Result<EncryptedEnvelope> {
        if plaintext.len() > config.max_payload_size {
            return Err(E2eeError::InvalidEnvelope(format!(
                "payload of {} bytes exceeds {}",
                plaintext.len(),
                config.max_payload_size
            )));
        }

        let (message_key, next_chain) = suite.classic.kdf_ck(&self.sending_chain_key)?;
        let next_counter = self
            .sending_counter
            .checked_add(1)
            .ok_or_else(|| E2eeError::InvalidEnvelope("sending chain exhausted".to_string()))?;

        let header = MessageHeader {
            ratchet_public_key: self.ratchet.dh_public.clone(),
            previous_chain_length: self.previous_chain_length,
            message_counter: self.sending_counter,
            epoch: self.epoch,
        };
        let (rotation, quantum_ciphertext) = match &self.pending_rotation {
            Some(pending) => (Some(pending.announcement.clone()), pending.quantum_ciphertext.clone()),
            None => (None, None),
        };

        let nonce = suite.classic.generate_nonce(config.chacha_nonce_length)?;
        let aad = associated_data(&header, self.algorithm, &quantum_ciphertext, &rotation)?;
        let (ciphertext, auth_tag) = suite.classic.aead_encrypt(&message_key, &nonce, plaintext, &aad)?;

        self.sending_chain_key = KeyBytes::new(&next_chain);
        self.sending_counter = next_counter;
        self.updated_at = now;

        trace!(
            target: "crypto::double_ratchet",
            session = %self.id,
            counter = header.message_counter,
            epoch = header.epoch,
            ciphertext_len = ciphertext.len(),
            "Message encrypted"
        );

        Ok(EncryptedEnvelope {
            header,
            nonce,
            ciphertext,
            auth_tag,
            algorithm_id: self.algorithm,
            quantum_ciphertext,
            rotation,
        })
    }

    /// Расшифровать сообщение
    ///
    /// Follows a DH ratchet step or an announced epoch when the header
    /// requires one. See the module docs for what is kept when
    /// authentication fails.
    pub fn decrypt(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        identity: &IdentityKey,
        envelope: &EncryptedEnvelope,
        now: i64,
    ) -> Result<Vec<u8>> {
        self.check_identity(identity)?;
        self.validate_envelope(config, envelope)?;
        self.expire_retired(config, now);

        debug!(
            target: "crypto::double_ratchet",
            session = %self.id,
            counter = envelope.header.message_counter,
            epoch = envelope.header.epoch,
            skipped_keys = self.skipped.len(),
            "Decrypting message"
        );

        let mut working = self.clone();
        let mut structural = false;
        match working.open(suite, config, identity, envelope, now, &mut structural) {
            Ok(plaintext) => {
                working.updated_at = now;
                *self = working;
                Ok(plaintext)
            }
            Err(E2eeError::AuthenticationFailed { counter }) if !structural => {
                warn!(
                    target: "crypto::double_ratchet",
                    session = %self.id,
                    counter,
                    "Authentication failed, message key consumed"
                );
                self.skipped.burn(
                    &envelope.header.ratchet_public_key,
                    counter,
                    config.skipped_cache_capacity(),
                );
                self.updated_at = now;
                Err(E2eeError::AuthenticationFailed { counter })
            }
            Err(err) => Err(err),
        }
    }

    fn open(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        identity: &IdentityKey,
        envelope: &EncryptedEnvelope,
        now: i64,
        structural: &mut bool,
    ) -> Result<Vec<u8>> {
        let header = &envelope.header;
        let counter = header.message_counter;

        let message_key = if header.epoch < self.epoch {
            self.resolve_retired(suite, config, header, now, structural)?
        } else {
            if header.epoch > self.epoch {
                let notice = envelope.rotation_notice().ok_or_else(|| {
                    E2eeError::InvalidEnvelope(format!(
                        "envelope from epoch {} carries no rotation notice",
                        header.epoch
                    ))
                })?;
                *structural = true;
                self.apply_rotation(suite, config, identity, &notice, now)?;
            } else if let Some(announcement) = &envelope.rotation {
                if self.epoch_origin_key.as_deref() != Some(announcement.ratchet_public_key.as_slice()) {
                    warn!(
                        target: "crypto::double_ratchet",
                        session = %self.id,
                        epoch = header.epoch,
                        "Both endpoints rotated into the same epoch"
                    );
                    return Err(E2eeError::EpochConflict { epoch: header.epoch });
                }
            }

            let resolved = self.ratchet.resolve(suite, config, header, &mut self.skipped, now)?;
            if resolved.stepped {
                *structural = true;
                let sending_chain = self.ratchet.sending_step(suite)?;
                self.sending_chain_key = KeyBytes::new(&sending_chain);
                self.previous_chain_length = self.sending_counter;
                self.sending_counter = 0;
            }
            resolved.message_key
        };

        let aad = envelope.associated_data()?;
        let plaintext = suite
            .classic
            .aead_decrypt(&message_key, &envelope.nonce, &envelope.ciphertext, &envelope.auth_tag, &aad)
            .map_err(|_| E2eeError::AuthenticationFailed { counter })?;

        if header.epoch == self.epoch {
            self.pending_rotation = None;
        }
        Ok(plaintext)
    }

    fn resolve_retired(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        header: &MessageHeader,
        now: i64,
        structural: &mut bool,
    ) -> Result<KeyBytes> {
        let epoch = header.epoch;
        if self.deactivated_through.map_or(false, |through| epoch <= through) {
            return Err(E2eeError::KeysDeactivated { epoch });
        }

        let retired = self
            .retired
            .iter_mut()
            .find(|r| r.epoch == epoch)
            .ok_or(E2eeError::KeysDeactivated { epoch })?;
        let resolved = retired.ratchet.resolve(suite, config, header, &mut self.skipped, now)?;
        *structural |= resolved.stepped;
        Ok(resolved.message_key)
    }

    /// Opens a new epoch with a fresh ratchet key, independent of message flow.
    ///
    /// The returned notice must reach the peer, either through
    /// [`Self::accept_rotation`] or implicitly with the next envelope.
    pub fn rotate(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        retention: KeyRetention,
        now: i64,
    ) -> Result<RotationNotice> {
        let new_epoch = self
            .epoch
            .checked_add(1)
            .ok_or(E2eeError::EpochConflict { epoch: self.epoch })?;

        let (dh_private, dh_public) = suite.classic.generate_dh_keys()?;
        let dh = suite.classic.dh(&dh_private, &self.remote_identity_key)?;
        let (quantum_ciphertext, kem_secret) = match self.algorithm.kem_level() {
            Some(level) => {
                let remote = self.remote_kem_identity_key.as_deref().ok_or_else(|| {
                    E2eeError::KeyMaterialMissing(format!(
                        "{} identity key of device {}",
                        level, self.id.remote_device
                    ))
                })?;
                let (ciphertext, secret) = suite.kem.encapsulate(level, remote)?;
                (Some(ciphertext), Some(secret))
            }
            None => (None, None),
        };

        let epoch_root = self.epoch_root(
            suite,
            config,
            new_epoch,
            &dh,
            kem_secret.as_ref().map(|s| s.as_slice()),
        )?;
        let (ratchet, sending_chain) =
            DhRatchet::seed_initiator(suite, &epoch_root, &dh, &dh_private, dh_public.clone())?;
        self.enter_epoch(new_epoch, ratchet, &sending_chain, retention, now);

        let retain_previous = retention == KeyRetention::Preserve;
        self.pending_rotation = Some(PendingRotation {
            announcement: RotationAnnouncement {
                ratchet_public_key: dh_public.clone(),
                retain_previous,
            },
            quantum_ciphertext: quantum_ciphertext.clone(),
        });
        self.epoch_origin_key = Some(dh_public.clone());
        self.updated_at = now;

        debug!(
            target: "crypto::double_ratchet",
            session = %self.id,
            epoch = new_epoch,
            retention = ?retention,
            "Session rotated"
        );

        Ok(RotationNotice {
            epoch: new_epoch,
            ratchet_public_key: dh_public,
            quantum_ciphertext,
            retain_previous,
        })
    }

    /// Follows the peer into the epoch announced by `notice`.
    ///
    /// A notice for an older epoch, or a repeat of the one that opened the
    /// current epoch, is a no-op.
    pub fn accept_rotation(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        identity: &IdentityKey,
        notice: &RotationNotice,
        now: i64,
    ) -> Result<()> {
        self.check_identity(identity)?;

        if notice.epoch < self.epoch {
            debug!(
                target: "crypto::double_ratchet",
                session = %self.id,
                notice_epoch = notice.epoch,
                epoch = self.epoch,
                "Ignoring stale rotation notice"
            );
            return Ok(());
        }
        if notice.epoch == self.epoch {
            return if self.epoch_origin_key.as_deref() == Some(notice.ratchet_public_key.as_slice()) {
                Ok(())
            } else {
                Err(E2eeError::EpochConflict { epoch: notice.epoch })
            };
        }

        let mut working = self.clone();
        working.apply_rotation(suite, config, identity, notice, now)?;
        working.updated_at = now;
        *self = working;
        Ok(())
    }

    fn apply_rotation(
        &mut self,
        suite: &PrimitiveSuite,
        config: &Config,
        identity: &IdentityKey,
        notice: &RotationNotice,
        now: i64,
    ) -> Result<()> {
        if notice.ratchet_public_key.len() != KEY_LENGTH {
            return Err(E2eeError::InvalidEnvelope(format!(
                "rotation key has {} bytes",
                notice.ratchet_public_key.len()
            )));
        }

        let dh = suite.classic.dh(&identity.dh_private, &notice.ratchet_public_key)?;
        let kem_secret = match self.algorithm.kem_level() {
            Some(level) => {
                let ciphertext = notice.quantum_ciphertext.as_deref().ok_or_else(|| {
                    E2eeError::InvalidEnvelope("rotation notice lacks the KEM ciphertext".to_string())
                })?;
                let key = identity.kem_key(level).ok_or_else(|| {
                    E2eeError::KeyMaterialMissing(format!(
                        "{} identity key of device {}",
                        level, identity.device_id
                    ))
                })?;
                Some(suite.kem.decapsulate(level, &key.private_key, ciphertext)?)
            }
            None => None,
        };

        let epoch_root = self.epoch_root(
            suite,
            config,
            notice.epoch,
            &dh,
            kem_secret.as_ref().map(|s| s.as_slice()),
        )?;
        let (ratchet, sending_chain) =
            DhRatchet::seed_responder(suite, &epoch_root, &dh, &notice.ratchet_public_key)?;
        self.enter_epoch(
            notice.epoch,
            ratchet,
            &sending_chain,
            KeyRetention::from_preserve(notice.retain_previous),
            now,
        );
        self.epoch_origin_key = Some(notice.ratchet_public_key.clone());
        self.pending_rotation = None;

        debug!(
            target: "crypto::double_ratchet",
            session = %self.id,
            epoch = notice.epoch,
            retain_previous = notice.retain_previous,
            "Rotation accepted"
        );
        Ok(())
    }

    fn epoch_root(
        &self,
        suite: &PrimitiveSuite,
        config: &Config,
        epoch: u32,
        dh: &[u8],
        kem_secret: Option<&[u8]>,
    ) -> Result<SecretBytes> {
        let mut ikm = Zeroizing::new(dh.to_vec());
        if let Some(kem_secret) = kem_secret {
            ikm.extend_from_slice(kem_secret);
        }
        if let Some(quantum_secret) = &self.quantum_secret {
            ikm.extend_from_slice(quantum_secret);
        }

        let mut info = EPOCH_ROOT_INFO.to_vec();
        info.extend_from_slice(&epoch.to_be_bytes());
        info.extend_from_slice(self.algorithm.as_str().as_bytes());

        Ok(suite
            .classic
            .hkdf_derive_key(&self.base_secret, &ikm, &info, config.key_length)?)
    }

    fn enter_epoch(
        &mut self,
        epoch: u32,
        ratchet: DhRatchet,
        sending_chain: &[u8],
        retention: KeyRetention,
        now: i64,
    ) {
        let old_epoch = self.epoch;
        let old_ratchet = std::mem::replace(&mut self.ratchet, ratchet);
        match retention {
            KeyRetention::Preserve => self.retired.push(RetiredEpoch {
                epoch: old_epoch,
                algorithm: self.algorithm,
                ratchet: old_ratchet,
                retired_at: now,
            }),
            KeyRetention::Discard => self.discard_through(old_epoch),
        }

        self.epoch = epoch;
        self.sending_chain_key = KeyBytes::new(sending_chain);
        self.sending_counter = 0;
        self.previous_chain_length = 0;
    }

    fn discard_through(&mut self, epoch: u32) {
        self.retired.retain(|r| r.epoch > epoch);
        let removed = self.skipped.retain_epochs(|e| e > epoch);
        self.deactivated_through = Some(self.deactivated_through.map_or(epoch, |d| d.max(epoch)));

        debug!(
            target: "crypto::double_ratchet",
            session = %self.id,
            through_epoch = epoch,
            skipped_removed = removed,
            "Old epoch keys deactivated"
        );
    }

    /// Takes over the receiving state of the session this one replaces.
    ///
    /// `self` must start at a later epoch than `previous`.
    pub fn inherit_from(&mut self, previous: &RatchetSession, retention: KeyRetention, now: i64) -> Result<()> {
        if self.epoch <= previous.epoch {
            return Err(E2eeError::EpochConflict { epoch: self.epoch });
        }

        match retention {
            KeyRetention::Preserve => {
                self.retired = previous.retired.clone();
                self.retired.push(RetiredEpoch {
                    epoch: previous.epoch,
                    algorithm: previous.algorithm,
                    ratchet: previous.ratchet.clone(),
                    retired_at: now,
                });
                self.skipped = previous.skipped.clone();
                self.deactivated_through = previous.deactivated_through;
            }
            KeyRetention::Discard => {
                self.deactivated_through = Some(previous.epoch);
            }
        }
        Ok(())
    }

    /// Drops every retired epoch. Returns how many were removed.
    pub fn deactivate_retired(&mut self) -> usize {
        let count = self.retired.len();
        if self.epoch > 0 {
            self.discard_through(self.epoch - 1);
        }
        count
    }

    fn expire_retired(&mut self, config: &Config, now: i64) {
        let Some(grace) = config.retired_key_grace else {
            return;
        };
        let grace = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        let expired = self
            .retired
            .iter()
            .filter(|r| is_older_than(r.retired_at, now, grace))
            .map(|r| r.epoch)
            .max();
        if let Some(epoch) = expired {
            self.discard_through(epoch);
        }
    }

    /// Removes skipped message keys older than `max_age_seconds`.
    pub fn cleanup_old_skipped_keys(&mut self, max_age_seconds: i64, now: i64) -> usize {
        let removed = self.skipped.cleanup(now, max_age_seconds);
        if removed > 0 {
            debug!(
                target: "crypto::double_ratchet",
                session = %self.id,
                removed,
                remaining = self.skipped.len(),
                "Cleaned up old skipped message keys"
            );
        }
        removed
    }

    fn check_identity(&self, identity: &IdentityKey) -> Result<()> {
        if identity.device_id != self.id.local_device {
            return Err(E2eeError::KeyMaterialMissing(format!(
                "identity key of device {}",
                self.id.local_device
            )));
        }
        Ok(())
    }

    fn validate_envelope(&self, config: &Config, envelope: &EncryptedEnvelope) -> Result<()> {
        // Epochs without a retired chain are reported as deactivated later
        let expected = if envelope.header.epoch < self.epoch {
            self.retired
                .iter()
                .find(|r| r.epoch == envelope.header.epoch)
                .map(|r| r.algorithm)
        } else {
            Some(self.algorithm)
        };
        if let Some(expected) = expected {
            if envelope.algorithm_id != expected {
                return Err(E2eeError::InvalidEnvelope(format!(
                    "envelope uses {}, session {} is bound to {}",
                    envelope.algorithm_id, self.id, expected
                )));
            }
        }
        if envelope.header.ratchet_public_key.len() != KEY_LENGTH {
            return Err(E2eeError::InvalidEnvelope("malformed ratchet key".to_string()));
        }
        if envelope.nonce.len() != config.chacha_nonce_length {
            return Err(E2eeError::InvalidEnvelope("malformed nonce".to_string()));
        }
        if envelope.auth_tag.len() != TAG_LENGTH {
            return Err(E2eeError::InvalidEnvelope("malformed authentication tag".to_string()));
        }
        if envelope.ciphertext.len() > config.max_payload_size {
            return Err(E2eeError::InvalidEnvelope("ciphertext exceeds the payload limit".to_string()));
        }
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn algorithm(&self) -> AlgorithmId {
        self.algorithm
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn forward_secrecy(&self) -> ForwardSecrecy {
        self.forward_secrecy
    }

    pub fn remote_identity_key(&self) -> &[u8] {
        &self.remote_identity_key
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            role: self.role,
            algorithm: self.algorithm,
            forward_secrecy: self.forward_secrecy,
            epoch: self.epoch,
            sending_counter: self.sending_counter,
            receiving_counter: self.ratchet.receiving_counter,
            skipped_keys: self.skipped.len(),
            retired_epochs: self.retired.iter().map(|r| r.epoch).collect(),
            deactivated_through: self.deactivated_through,
            rotation_pending: self.pending_rotation.is_some(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialization::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serialization::from_bytes(bytes)
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("epoch", &self.epoch)
            .field("sending_counter", &self.sending_counter)
            .finish_non_exhaustive()
    }
}

fn info(label: &[u8], algorithm: AlgorithmId) -> Vec<u8> {
    let mut info = label.to_vec();
    info.extend_from_slice(algorithm.as_str().as_bytes());
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::algorithm::parse_capabilities;
    use crate::crypto::handshake::{PreKeyBundle, X3DHProtocol};
    use crate::crypto::keys::{generate_one_time_prekeys, EphemeralKey, SignedPreKey};
    use crate::ids::DeviceId;

    const NOW: i64 = 1_700_000_000;

    struct Endpoint {
        identity: IdentityKey,
        session: RatchetSession,
    }

    fn pair(suite: &PrimitiveSuite, config: &Config, caps: &[&str]) -> (Endpoint, Endpoint) {
        let alice = IdentityKey::generate(suite, DeviceId::from("alice"), parse_capabilities(caps.iter().copied())).unwrap();
        let bob = IdentityKey::generate(suite, DeviceId::from("bob"), parse_capabilities(caps.iter().copied())).unwrap();
        let spk = SignedPreKey::generate(suite, &bob, 1).unwrap();
        let opk = generate_one_time_prekeys(suite, 1, 1).unwrap().remove(0);

        let bundle = PreKeyBundle {
            device_id: bob.device_id.clone(),
            registration_id: bob.registration_id,
            identity_key: bob.dh_public.clone(),
            signing_key: bob.signing_public.clone(),
            signed_prekey: spk.to_public(),
            one_time_prekey: Some(opk.to_public()),
            quantum_identity_keys: bob.kem_keys.iter().map(|k| k.to_public()).collect(),
            quantum_signed_prekeys: spk.kem_prekeys.iter().map(|k| k.to_public()).collect(),
            capabilities: bob.capabilities.clone(),
            negotiated: None,
        };

        let x3dh = X3DHProtocol::new(suite, config);
        let initiator = x3dh
            .perform_as_initiator(&alice, EphemeralKey::generate(suite).unwrap(), &bundle, spk.created_at)
            .unwrap();
        let handshake = initiator.handshake.clone().unwrap();
        let responder = x3dh
            .perform_as_responder(&bob, &spk, Some(&opk), &handshake)
            .unwrap();

        let alice_session =
            RatchetSession::initialize(suite, config, SessionId::new("conv", "alice", "bob"), &initiator, &alice, NOW)
                .unwrap();
        let bob_session =
            RatchetSession::initialize(suite, config, SessionId::new("conv", "bob", "alice"), &responder, &bob, NOW)
                .unwrap();

        (
            Endpoint {
                identity: alice,
                session: alice_session,
            },
            Endpoint {
                identity: bob,
                session: bob_session,
            },
        )
    }

    fn send(suite: &PrimitiveSuite, config: &Config, from: &mut Endpoint, text: &[u8]) -> EncryptedEnvelope {
        from.session.encrypt(suite, config, text, NOW).unwrap()
    }

    fn receive(suite: &PrimitiveSuite, config: &Config, to: &mut Endpoint, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        to.session.decrypt(suite, config, &to.identity, envelope, NOW)
    }

    #[test]
    fn test_both_sides_can_send_first() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let from_bob = send(&suite, &config, &mut bob, b"bob speaks first");
        let from_alice = send(&suite, &config, &mut alice, b"alice too");

        assert_eq!(receive(&suite, &config, &mut alice, &from_bob).unwrap(), b"bob speaks first");
        assert_eq!(receive(&suite, &config, &mut bob, &from_alice).unwrap(), b"alice too");
    }

    #[test]
    fn test_conversation_with_ratchet_steps() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        for round in 0..4u8 {
            let msg = [round; 3];
            let envelope = send(&suite, &config, &mut alice, &msg);
            assert_eq!(receive(&suite, &config, &mut bob, &envelope).unwrap(), msg);

            let reply = [round + 100; 5];
            let envelope = send(&suite, &config, &mut bob, &reply);
            assert_eq!(receive(&suite, &config, &mut alice, &envelope).unwrap(), reply);
        }
    }

    #[test]
    fn test_late_message_from_previous_chain() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let first = send(&suite, &config, &mut alice, b"one");
        let delayed = send(&suite, &config, &mut alice, b"two");
        receive(&suite, &config, &mut bob, &first).unwrap();

        let reply = send(&suite, &config, &mut bob, b"reply");
        receive(&suite, &config, &mut alice, &reply).unwrap();
        let after_step = send(&suite, &config, &mut alice, b"three");

        // Bob steps to Alice's new chain and caches the tail of the old one
        assert_eq!(receive(&suite, &config, &mut bob, &after_step).unwrap(), b"three");
        assert_eq!(receive(&suite, &config, &mut bob, &delayed).unwrap(), b"two");
        assert_eq!(
            receive(&suite, &config, &mut bob, &delayed),
            Err(E2eeError::AlreadyDecrypted { counter: 1 })
        );
    }

    #[test]
    fn test_tampered_tag_burns_key_without_step() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let envelope = send(&suite, &config, &mut alice, b"hello");
        let mut tampered = envelope.clone();
        tampered.ciphertext[0] ^= 0xff;

        assert_eq!(
            receive(&suite, &config, &mut bob, &tampered),
            Err(E2eeError::AuthenticationFailed { counter: 0 })
        );
        assert_eq!(
            receive(&suite, &config, &mut bob, &envelope),
            Err(E2eeError::AlreadyDecrypted { counter: 0 })
        );
    }

    #[test]
    fn test_forged_counters_leave_chain_untouched() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config {
            max_skipped_messages: 3,
            ..Config::default()
        };
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let envelopes: Vec<_> = (0..4u8).map(|i| send(&suite, &config, &mut alice, &[i])).collect();
        let before = bob.session.snapshot();
        for counter in [1u32, 3] {
            let mut forged = envelopes[0].clone();
            forged.header.message_counter = counter;
            assert_eq!(
                receive(&suite, &config, &mut bob, &forged),
                Err(E2eeError::AuthenticationFailed { counter })
            );
        }
        let after = bob.session.snapshot();
        assert_eq!(after.receiving_counter, before.receiving_counter);
        assert_eq!(after.skipped_keys, 0);

        assert_eq!(receive(&suite, &config, &mut bob, &envelopes[0]).unwrap(), vec![0]);
        assert_eq!(receive(&suite, &config, &mut bob, &envelopes[2]).unwrap(), vec![2]);
        // Only the exact positions named by the forgeries are lost
        assert_eq!(
            receive(&suite, &config, &mut bob, &envelopes[1]),
            Err(E2eeError::AlreadyDecrypted { counter: 1 })
        );
        assert_eq!(
            receive(&suite, &config, &mut bob, &envelopes[3]),
            Err(E2eeError::AlreadyDecrypted { counter: 3 })
        );
        assert_eq!(bob.session.snapshot().skipped_keys, 0);
    }

    #[test]
    fn test_tampered_message_on_new_chain_commits_nothing() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let reply = send(&suite, &config, &mut bob, b"reply");
        let mut tampered = reply.clone();
        tampered.auth_tag[0] ^= 0x01;

        let before = alice.session.snapshot();
        assert_eq!(
            receive(&suite, &config, &mut alice, &tampered),
            Err(E2eeError::AuthenticationFailed { counter: 0 })
        );
        assert_eq!(alice.session.snapshot(), before);
        assert_eq!(receive(&suite, &config, &mut alice, &reply).unwrap(), b"reply");
    }

    #[test]
    fn test_skipped_cache_is_bounded() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config {
            max_skipped_messages: 3,
            ..Config::default()
        };
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let envelopes: Vec<_> = (0..12u8).map(|i| send(&suite, &config, &mut alice, &[i])).collect();
        // Each jump of 3 stays inside the window; the cache keeps at most 6 keys
        for index in [3usize, 7, 11] {
            receive(&suite, &config, &mut bob, &envelopes[index]).unwrap();
        }
        assert_eq!(bob.session.snapshot().skipped_keys, 6);
        assert_eq!(
            receive(&suite, &config, &mut bob, &envelopes[0]),
            Err(E2eeError::AlreadyDecrypted { counter: 0 })
        );
        assert_eq!(receive(&suite, &config, &mut bob, &envelopes[10]).unwrap(), vec![10]);
    }

    #[test]
    fn test_rotation_discard_deactivates_old_epoch() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let old = send(&suite, &config, &mut alice, b"before rotation");
        let notice = alice.session.rotate(&suite, &config, KeyRetention::Discard, NOW).unwrap();
        assert_eq!(notice.epoch, 1);
        assert!(!notice.retain_previous);

        let fresh = send(&suite, &config, &mut alice, b"after rotation");
        assert!(fresh.rotation.is_some());
        assert_eq!(receive(&suite, &config, &mut bob, &fresh).unwrap(), b"after rotation");
        assert_eq!(bob.session.epoch(), 1);
        assert_eq!(
            receive(&suite, &config, &mut bob, &old),
            Err(E2eeError::KeysDeactivated { epoch: 0 })
        );

        let reply = send(&suite, &config, &mut bob, b"ack");
        assert_eq!(receive(&suite, &config, &mut alice, &reply).unwrap(), b"ack");
        assert!(!alice.session.snapshot().rotation_pending);
        assert!(send(&suite, &config, &mut alice, b"quiet").rotation.is_none());
    }

    #[test]
    fn test_rotation_preserve_keeps_old_epoch_until_deactivated() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let old_first = send(&suite, &config, &mut alice, b"old 1");
        let old_second = send(&suite, &config, &mut alice, b"old 2");
        let notice = alice.session.rotate(&suite, &config, KeyRetention::Preserve, NOW).unwrap();
        bob.session
            .accept_rotation(&suite, &config, &bob.identity, &notice, NOW)
            .unwrap();
        assert_eq!(bob.session.snapshot().retired_epochs, vec![0]);

        assert_eq!(receive(&suite, &config, &mut bob, &old_first).unwrap(), b"old 1");
        assert_eq!(bob.session.deactivate_retired(), 1);
        assert_eq!(
            receive(&suite, &config, &mut bob, &old_second),
            Err(E2eeError::KeysDeactivated { epoch: 0 })
        );
    }

    #[test]
    fn test_retired_keys_expire_after_grace() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config {
            retired_key_grace: Some(std::time::Duration::from_secs(60)),
            ..Config::default()
        };
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let old = send(&suite, &config, &mut alice, b"old");
        let notice = alice.session.rotate(&suite, &config, KeyRetention::Preserve, NOW).unwrap();
        bob.session
            .accept_rotation(&suite, &config, &bob.identity, &notice, NOW)
            .unwrap();

        let result = bob.session.decrypt(&suite, &config, &bob.identity, &old, NOW + 61);
        assert_eq!(result, Err(E2eeError::KeysDeactivated { epoch: 0 }));
    }

    #[test]
    fn test_crossing_rotations_conflict() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        alice.session.rotate(&suite, &config, KeyRetention::Discard, NOW).unwrap();
        let bob_notice = bob.session.rotate(&suite, &config, KeyRetention::Discard, NOW).unwrap();
        let from_bob = send(&suite, &config, &mut bob, b"crossing");

        assert_eq!(
            receive(&suite, &config, &mut alice, &from_bob),
            Err(E2eeError::EpochConflict { epoch: 1 })
        );
        assert_eq!(
            alice
                .session
                .accept_rotation(&suite, &config, &alice.identity, &bob_notice, NOW),
            Err(E2eeError::EpochConflict { epoch: 1 })
        );
    }

    #[test]
    fn test_session_survives_serialization() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let envelope = send(&suite, &config, &mut alice, b"persisted");
        bob.session = RatchetSession::from_bytes(&bob.session.to_bytes().unwrap()).unwrap();
        assert_eq!(receive(&suite, &config, &mut bob, &envelope).unwrap(), b"persisted");
    }

    #[test]
    fn test_envelope_for_other_algorithm_is_rejected() {
        let suite = PrimitiveSuite::classical_only();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["Curve25519"]);

        let mut envelope = send(&suite, &config, &mut alice, b"x");
        envelope.algorithm_id = AlgorithmId::MlKem768;
        assert!(matches!(
            receive(&suite, &config, &mut bob, &envelope),
            Err(E2eeError::InvalidEnvelope(_))
        ));
    }

    #[cfg(feature = "post-quantum")]
    #[test]
    fn test_quantum_session_rotation() {
        let suite = PrimitiveSuite::default();
        let config = Config::default();
        let (mut alice, mut bob) = pair(&suite, &config, &["ML-KEM-768"]);
        assert_eq!(alice.session.algorithm(), AlgorithmId::MlKem768);

        let notice = bob.session.rotate(&suite, &config, KeyRetention::Discard, NOW).unwrap();
        assert!(notice.quantum_ciphertext.is_some());

        let envelope = send(&suite, &config, &mut bob, b"post-quantum epoch");
        assert_eq!(receive(&suite, &config, &mut alice, &envelope).unwrap(), b"post-quantum epoch");
        assert_eq!(alice.session.epoch(), 1);
    }
}
