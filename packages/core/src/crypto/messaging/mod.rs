//! Secure Messaging
//!
//! Double Ratchet поверх результата key agreement, и формат конверта,
//! которым обмениваются устройства.
//!
//! ## Dataflow
//! ```text
//! SharedSecretMaterial (X3DH)
//!         ↓
//! RatchetSession::initialize()
//!         ↓
//! encrypt(plaintext) → EncryptedEnvelope → transport → decrypt(envelope)
//!         ↓
//! rotate() → RotationNotice → accept_rotation() (или неявно при decrypt)
//! ```
//!
//! ## Security Properties
//!
//! - **Forward Secrecy**: message key удаляется сразу после использования
//! - **Break-in Recovery**: каждый DH ratchet step и каждая эпоха дают новый root key
//! - **Out-of-Order**: skipped message keys в ограниченном окне
//! - **Replay**: повторная расшифровка того же сообщения даёт `AlreadyDecrypted`

use serde::{Deserialize, Serialize};

use crate::crypto::algorithm::AlgorithmId;
use crate::error::Result;
use crate::utils::serialization;

pub mod double_ratchet;

pub use double_ratchet::{RatchetSession, SessionSnapshot};

/// Authenticated (AAD) part of every envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(with = "serde_bytes")]
    pub ratchet_public_key: Vec<u8>,
    pub previous_chain_length: u32,
    pub message_counter: u32,
    pub epoch: u32,
}

/// Announcement of a new epoch, carried by envelopes until the peer replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationAnnouncement {
    /// Fresh ratchet key that opened the epoch
    #[serde(with = "serde_bytes")]
    pub ratchet_public_key: Vec<u8>,
    pub retain_previous: bool,
}

/// Everything a peer needs to follow a rotation into a new epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationNotice {
    pub epoch: u32,
    pub ratchet_public_key: Vec<u8>,
    /// Encapsulation to the peer's KEM identity key (hybrid and quantum sessions)
    pub quantum_ciphertext: Option<Vec<u8>>,
    /// Whether the previous epoch stays decryptable on the sender's side
    pub retain_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub header: MessageHeader,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub auth_tag: Vec<u8>,
    pub algorithm_id: AlgorithmId,
    pub quantum_ciphertext: Option<Vec<u8>>,
    pub rotation: Option<RotationAnnouncement>,
}

impl EncryptedEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialization::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serialization::from_bytes(bytes)
    }

    /// The rotation this envelope announces, if any.
    pub fn rotation_notice(&self) -> Option<RotationNotice> {
        self.rotation.as_ref().map(|announcement| RotationNotice {
            epoch: self.header.epoch,
            ratchet_public_key: announcement.ratchet_public_key.clone(),
            quantum_ciphertext: self.quantum_ciphertext.clone(),
            retain_previous: announcement.retain_previous,
        })
    }

    /// AAD: every field except the nonce, ciphertext and tag.
    pub(crate) fn associated_data(&self) -> Result<Vec<u8>> {
        associated_data(
            &self.header,
            self.algorithm_id,
            &self.quantum_ciphertext,
            &self.rotation,
        )
    }
}

pub(crate) fn associated_data(
    header: &MessageHeader,
    algorithm_id: AlgorithmId,
    quantum_ciphertext: &Option<Vec<u8>>,
    rotation: &Option<RotationAnnouncement>,
) -> Result<Vec<u8>> {
    serialization::to_bytes(&(header, algorithm_id, quantum_ciphertext, rotation))
}

/// What happens to the previous epoch's receiving keys on rotation or re-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRetention {
    /// Kept as a receive-only chain until `deactivate_old_keys` (or the grace period)
    Preserve,
    /// Deleted immediately
    Discard,
}

impl KeyRetention {
    pub fn from_preserve(preserve_keys: bool) -> Self {
        if preserve_keys {
            KeyRetention::Preserve
        } else {
            KeyRetention::Discard
        }
    }
}
