//! Key Agreement Protocols
//!
//! Протоколы установки ключей (key agreement) между двумя устройствами.
//!
//! ## Dataflow
//! ```text
//! Initiator device                           Responder device
//! ================                           ================
//!
//! 1. Генерирует ephemeral key
//! 2. Получает PreKeyBundle (через engine)
//! 3. X3DHProtocol::perform_as_initiator()
//!    → SharedSecretMaterial + HandshakeMessage
//!
//!                  HandshakeMessage →
//!
//!                                            1. Находит SPK / OPK по id
//!                                            2. X3DHProtocol::perform_as_responder()
//!                                               → SharedSecretMaterial (тот же root key)
//! ```
//!
//! Ephemeral key инициатора не выбрасывается: он становится первым
//! ratchet key в Double Ratchet.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::algorithm::{CapabilitySet, KemLevel};
use crate::crypto::negotiation::NegotiationResult;
use crate::crypto::provider::SecretBytes;
use crate::ids::DeviceId;

pub mod x3dh;

pub use x3dh::X3DHProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPreKeyPublic {
    pub level: KemLevel,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// Snapshot of a device's public key material, issued once to one initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub device_id: DeviceId,
    pub registration_id: u32,
    /// X25519 identity public key
    pub identity_key: Vec<u8>,
    /// Ed25519 key that signed every prekey below
    pub signing_key: Vec<u8>,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
    pub quantum_identity_keys: Vec<KemPreKeyPublic>,
    pub quantum_signed_prekeys: Vec<KemPreKeyPublic>,
    pub capabilities: CapabilitySet,
    /// Conversation-wide negotiation result, when the bundle was issued for one
    pub negotiated: Option<NegotiationResult>,
}

impl PreKeyBundle {
    pub fn quantum_identity_key(&self, level: KemLevel) -> Option<&KemPreKeyPublic> {
        self.quantum_identity_keys.iter().find(|k| k.level == level)
    }

    pub fn quantum_signed_prekey(&self, level: KemLevel) -> Option<&KemPreKeyPublic> {
        self.quantum_signed_prekeys.iter().find(|k| k.level == level)
    }
}

/// First flight from initiator to responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub initiator_device: DeviceId,
    pub responder_device: DeviceId,
    pub negotiation: NegotiationResult,
    pub initiator_identity_key: Vec<u8>,
    pub initiator_kem_identity_key: Option<Vec<u8>>,
    pub ephemeral_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    /// Encapsulation to the responder's KEM identity key
    pub identity_ciphertext: Option<Vec<u8>>,
    /// Encapsulation to the responder's KEM signed prekey
    pub signed_prekey_ciphertext: Option<Vec<u8>>,
    pub epoch: u32,
}

/// Whether a one-time prekey took part in the agreement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardSecrecy {
    Full,
    /// Identity and signed prekey only
    Reduced,
}

pub(crate) enum RatchetSeed {
    Initiator {
        ephemeral_private: SecretBytes,
        ephemeral_public: Vec<u8>,
    },
    Responder {
        remote_ephemeral: Vec<u8>,
    },
}

/// Output of a completed key agreement, consumed by the ratchet.
pub struct SharedSecretMaterial {
    pub role: Role,
    pub local_device: DeviceId,
    pub remote_device: DeviceId,
    pub(crate) root_key: SecretBytes,
    /// KEM component alone, kept for epoch derivation
    pub(crate) quantum_secret: Option<SecretBytes>,
    pub negotiation: NegotiationResult,
    pub one_time_prekey_used: bool,
    pub forward_secrecy: ForwardSecrecy,
    pub remote_identity_key: Vec<u8>,
    pub remote_kem_identity_key: Option<Vec<u8>>,
    /// Present on the initiator side; to be delivered to the responder
    pub handshake: Option<HandshakeMessage>,
    pub epoch: u32,
    pub(crate) seed: RatchetSeed,
}

impl SharedSecretMaterial {
    /// Starts the session at `epoch` instead of 0; used when pairs are re-established.
    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        if let Some(handshake) = self.handshake.as_mut() {
            handshake.epoch = epoch;
        }
        self
    }
}

impl fmt::Debug for SharedSecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecretMaterial")
            .field("role", &self.role)
            .field("local_device", &self.local_device)
            .field("remote_device", &self.remote_device)
            .field("negotiation", &self.negotiation)
            .field("forward_secrecy", &self.forward_secrecy)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
