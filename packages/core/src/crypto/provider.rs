//! Primitive provider traits for crypto-agility.
//!
//! The protocol layers never touch a concrete primitive. They call through
//! [`CryptoProvider`] (ECDH, signatures, AEAD, KDF) and [`KemProvider`]
//! (post-quantum key encapsulation), both object safe so a
//! [`crate::crypto::suites::PrimitiveSuite`] can be assembled at process start
//! and injected into the engine.

use crate::crypto::algorithm::KemLevel;
use crate::error::CryptoError;
use zeroize::Zeroizing;

/// Secret byte buffer wiped on drop
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Classical primitives: X25519-style DH, signatures, AEAD with a detached tag, HKDF.
pub trait CryptoProvider: Send + Sync + 'static {
    /// Generates a new DH key pair `(private, public)`.
    fn generate_dh_keys(&self) -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    /// Derives the DH public key from a private key.
    fn dh_public_from_private(&self, private_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Diffie-Hellman between a local private key and a remote public key.
    fn dh(&self, private_key: &[u8], public_key: &[u8]) -> Result<SecretBytes, CryptoError>;

    /// Generates a new signature key pair `(signing, verifying)`.
    fn generate_signature_keys(&self) -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    fn sign(&self, signing_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn verify(&self, verifying_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError>;

    /// AEAD encryption. Returns `(ciphertext, tag)`.
    fn aead_encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError>;

    /// AEAD decryption with a detached tag.
    fn aead_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// HKDF extract-and-expand.
    fn hkdf_derive_key(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<SecretBytes, CryptoError>;

    /// Derives `(root_key, chain_key)` from the current root key and a DH output.
    fn kdf_rk(&self, root_key: &[u8], dh_output: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError>;

    /// Derives `(message_key, next_chain_key)` from a chain key.
    fn kdf_ck(&self, chain_key: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError>;

    fn generate_nonce(&self, len: usize) -> Result<Vec<u8>, CryptoError>;
}

/// Post-quantum key encapsulation, one implementation covering every parameter set it supports.
pub trait KemProvider: Send + Sync + 'static {
    fn supports(&self, level: KemLevel) -> bool;

    /// Generates a KEM key pair `(private, public)`.
    fn generate_kem_keys(&self, level: KemLevel) -> Result<(SecretBytes, Vec<u8>), CryptoError>;

    /// Returns `(ciphertext, shared_secret)`.
    fn encapsulate(&self, level: KemLevel, public_key: &[u8]) -> Result<(Vec<u8>, SecretBytes), CryptoError>;

    fn decapsulate(
        &self,
        level: KemLevel,
        private_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError>;
}
