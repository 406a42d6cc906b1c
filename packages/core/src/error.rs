//! Error types for the E2EE engine.
//!
//! Three layers:
//! - [`CryptoError`]: failures of a primitive provider (ECDH, AEAD, KDF, KEM, signatures)
//! - [`StoreError`]: failures of the key store adapter
//! - [`E2eeError`]: the engine taxonomy surfaced to callers

use thiserror::Error;

use crate::crypto::algorithm::AlgorithmId;
use crate::ids::{DeviceId, SessionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Failed to generate keys: {0}")]
    KeyGenerationError(String),
    #[error("Signing failed: {0}")]
    SigningError(String),
    #[error("Signature verification failed: {0}")]
    SignatureVerificationError(String),
    #[error("KEM encapsulation failed: {0}")]
    KemEncapsulationError(String),
    #[error("KEM decapsulation failed: {0}")]
    KemDecapsulationError(String),
    #[error("AEAD encryption failed: {0}")]
    AeadEncryptionError(String),
    #[error("AEAD decryption failed: {0}")]
    AeadDecryptionError(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error("Algorithm not supported by this provider: {0}")]
    UnsupportedAlgorithm(String),
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        CryptoError::SignatureVerificationError(err.to_string())
    }
}

/// Failure reported by a [`crate::storage::KeyStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or the I/O failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A record was present but could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Engine error taxonomy.
///
/// Cryptographic and protocol errors (`InvalidBundle`, `AuthenticationFailed`,
/// `AlreadyDecrypted`) are never retried by the engine. `StoreUnavailable` and
/// `SessionBusy` are transient; see [`E2eeError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum E2eeError {
    #[error("no common algorithm between capability sets")]
    NoCommonAlgorithm,

    #[error("invalid prekey bundle: {0}")]
    InvalidBundle(String),

    #[error("no usable key material left for {0}")]
    BundleExhausted(String),

    #[error("message {counter} is beyond the skip window of {window} (chain at {position})")]
    SkippedTooMany { counter: u32, position: u32, window: u32 },

    #[error("message {counter} was already decrypted")]
    AlreadyDecrypted { counter: u32 },

    #[error("authentication failed for message {counter}")]
    AuthenticationFailed { counter: u32 },

    #[error("session {0} is busy")]
    SessionBusy(SessionId),

    #[error("key store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("device {0} is revoked")]
    DeviceRevoked(DeviceId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("key material missing: {0}")]
    KeyMaterialMissing(String),

    #[error("keys for epoch {epoch} have been deactivated")]
    KeysDeactivated { epoch: u32 },

    #[error("both endpoints rotated into epoch {epoch} independently")]
    EpochConflict { epoch: u32 },

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("algorithm {0} cannot be used by this engine")]
    UnsupportedAlgorithm(AlgorithmId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl E2eeError {
    /// Transient errors may be retried by the caller with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, E2eeError::StoreUnavailable(_) | E2eeError::SessionBusy(_))
    }
}

impl From<StoreError> for E2eeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => E2eeError::StoreUnavailable(msg),
            StoreError::Corrupt(msg) => E2eeError::Serialization(msg),
        }
    }
}

impl From<bincode::Error> for E2eeError {
    fn from(err: bincode::Error) -> Self {
        E2eeError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, E2eeError>;
