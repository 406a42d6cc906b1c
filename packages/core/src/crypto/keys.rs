// Долгосрочные ключи устройства: identity, signed prekeys, one-time prekeys

use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};

use crate::crypto::algorithm::{CapabilitySet, KemLevel};
use crate::crypto::handshake::{KemPreKeyPublic, OneTimePreKeyPublic, SignedPreKeyPublic};
use crate::crypto::provider::SecretBytes;
use crate::crypto::suites::PrimitiveSuite;
use crate::error::CryptoError;
use crate::ids::DeviceId;
use crate::utils::time::current_timestamp;

/// Signed post-quantum key pair of one ML-KEM parameter set
#[derive(Clone, Serialize, Deserialize)]
pub struct KemKeyPair {
    pub level: KemLevel,
    pub public_key: Vec<u8>,
    pub(crate) private_key: Vec<u8>,
    /// Ed25519 signature over `public_key`
    pub signature: Vec<u8>,
}

impl KemKeyPair {
    fn generate(suite: &PrimitiveSuite, level: KemLevel, signing_key: &[u8]) -> Result<Self, CryptoError> {
        let (private_key, public_key) = suite.kem.generate_kem_keys(level)?;
        let signature = suite.classic.sign(signing_key, &public_key)?;
        Ok(Self {
            level,
            public_key,
            private_key: private_key.to_vec(),
            signature,
        })
    }

    pub fn to_public(&self) -> KemPreKeyPublic {
        KemPreKeyPublic {
            level: self.level,
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// Identity key of a single device
///
/// Holds the X25519 key used in the DH triple, the Ed25519 key that signs
/// every prekey, and one KEM key pair per ML-KEM level the device declared.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKey {
    pub device_id: DeviceId,
    /// 14-bit registration id, as published in bundles
    pub registration_id: u32,
    pub dh_public: Vec<u8>,
    pub(crate) dh_private: Vec<u8>,
    pub signing_public: Vec<u8>,
    pub(crate) signing_private: Vec<u8>,
    pub kem_keys: Vec<KemKeyPair>,
    pub capabilities: CapabilitySet,
    pub created_at: i64,
}

impl IdentityKey {
    pub fn generate(
        suite: &PrimitiveSuite,
        device_id: DeviceId,
        capabilities: CapabilitySet,
    ) -> Result<Self, CryptoError> {
        let (dh_private, dh_public) = suite.classic.generate_dh_keys()?;
        let (signing_private, signing_public) = suite.classic.generate_signature_keys()?;

        let mut identity = Self {
            device_id,
            registration_id: OsRng.next_u32() & 0x3fff,
            dh_public,
            dh_private: dh_private.to_vec(),
            signing_public,
            signing_private: signing_private.to_vec(),
            kem_keys: Vec::new(),
            capabilities: CapabilitySet::new(),
            created_at: current_timestamp(),
        };
        identity.extend_capabilities(suite, &capabilities)?;

        debug!(
            target: "engine::keys",
            device_id = %identity.device_id,
            fingerprint = %identity.fingerprint(),
            kem_levels = identity.kem_keys.len(),
            "Generated identity key"
        );
        Ok(identity)
    }

    /// Declares `capabilities` and creates KEM key pairs for levels not held yet.
    /// The X25519 and Ed25519 keys stay untouched. Returns the added levels.
    pub fn extend_capabilities(
        &mut self,
        suite: &PrimitiveSuite,
        capabilities: &CapabilitySet,
    ) -> Result<Vec<KemLevel>, CryptoError> {
        let mut added = Vec::new();
        for level in required_kem_levels(capabilities) {
            if self.kem_key(level).is_some() {
                continue;
            }
            if !suite.kem.supports(level) {
                warn!(
                    target: "engine::keys",
                    device_id = %self.device_id,
                    level = %level,
                    "Declared KEM level is not supported by this build, skipping key generation"
                );
                continue;
            }
            self.kem_keys
                .push(KemKeyPair::generate(suite, level, &self.signing_private)?);
            added.push(level);
        }
        self.capabilities = capabilities.clone();
        Ok(added)
    }

    pub fn kem_key(&self, level: KemLevel) -> Option<&KemKeyPair> {
        self.kem_keys.iter().find(|k| k.level == level)
    }

    pub fn kem_levels(&self) -> Vec<KemLevel> {
        self.kem_keys.iter().map(|k| k.level).collect()
    }

    /// Short hex fingerprint of the public identity
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.dh_public, &self.signing_public)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("device_id", &self.device_id)
            .field("registration_id", &self.registration_id)
            .field("fingerprint", &self.fingerprint())
            .field("kem_levels", &self.kem_levels())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub fn fingerprint(dh_public: &[u8], signing_public: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dh_public);
    hasher.update(signing_public);
    hex::encode(&hasher.finalize()[..16])
}

fn required_kem_levels(capabilities: &CapabilitySet) -> Vec<KemLevel> {
    let mut levels: Vec<KemLevel> = capabilities.iter().filter_map(|a| a.kem_level()).collect();
    levels.sort();
    levels.dedup();
    levels
}

/// Medium-term X25519 prekey plus KEM prekeys, all signed by the identity key.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub(crate) private_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: i64,
    /// Set when a newer signed prekey replaced this one
    pub superseded_at: Option<i64>,
    pub kem_prekeys: Vec<KemKeyPair>,
}

impl SignedPreKey {
    pub fn generate(suite: &PrimitiveSuite, identity: &IdentityKey, id: u32) -> Result<Self, CryptoError> {
        let (private_key, public_key) = suite.classic.generate_dh_keys()?;
        let signature = suite.classic.sign(&identity.signing_private, &public_key)?;

        let kem_prekeys = identity
            .kem_levels()
            .into_iter()
            .map(|level| KemKeyPair::generate(suite, level, &identity.signing_private))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            target: "engine::keys",
            device_id = %identity.device_id,
            prekey_id = id,
            kem_prekeys = kem_prekeys.len(),
            "Generated signed prekey"
        );

        Ok(Self {
            id,
            public_key,
            private_key: private_key.to_vec(),
            signature,
            created_at: current_timestamp(),
            superseded_at: None,
            kem_prekeys,
        })
    }

    pub fn kem_prekey(&self, level: KemLevel) -> Option<&KemKeyPair> {
        self.kem_prekeys.iter().find(|k| k.level == level)
    }

    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
            created_at: self.created_at,
        }
    }
}

/// Single-use X25519 prekey
#[derive(Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub(crate) private_key: Vec<u8>,
    /// Issued in a bundle; the private half stays until the handshake arrives
    pub used: bool,
    #[serde(default)]
    pub issued_at: Option<i64>,
}

impl OneTimePreKey {
    pub fn to_public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            public_key: self.public_key.clone(),
        }
    }
}

/// Creates `count` one-time prekeys with consecutive ids starting at `first_id`.
pub fn generate_one_time_prekeys(
    suite: &PrimitiveSuite,
    first_id: u32,
    count: u32,
) -> Result<Vec<OneTimePreKey>, CryptoError> {
    (0..count)
        .map(|offset| {
            let id = first_id.checked_add(offset).ok_or_else(|| {
                CryptoError::KeyGenerationError("one-time prekey id space exhausted".to_string())
            })?;
            let (private_key, public_key) = suite.classic.generate_dh_keys()?;
            Ok(OneTimePreKey {
                id,
                public_key,
                private_key: private_key.to_vec(),
                used: false,
                issued_at: None,
            })
        })
        .collect()
}

/// Per-handshake X25519 key of an initiator
pub struct EphemeralKey {
    pub public_key: Vec<u8>,
    pub(crate) private_key: SecretBytes,
}

impl EphemeralKey {
    pub fn generate(suite: &PrimitiveSuite) -> Result<Self, CryptoError> {
        let (private_key, public_key) = suite.classic.generate_dh_keys()?;
        Ok(Self {
            public_key,
            private_key,
        })
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}
