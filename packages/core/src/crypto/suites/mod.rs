//! Crypto suites
//!
//! A [`PrimitiveSuite`] bundles the classical provider with a KEM provider.
//! It is built once by the embedding process and handed to the engine.
//!
//! ## Providers
//!
//! ### Classic
//! - **DH**: X25519
//! - **Signatures**: Ed25519
//! - **AEAD**: ChaCha20-Poly1305 (detached tag)
//! - **KDF**: HKDF-SHA256
//!
//! ### Kyber (`post-quantum` feature)
//! - **KEM**: ML-KEM-512 / ML-KEM-768 / ML-KEM-1024
//!
//! Without the `post-quantum` feature the default suite is classical only and
//! negotiation never selects a hybrid or quantum algorithm.

use std::sync::Arc;

use crate::crypto::algorithm::{AlgorithmId, CapabilitySet, KemLevel};
use crate::crypto::provider::{CryptoProvider, KemProvider, SecretBytes};
use crate::error::CryptoError;

pub mod classic;
#[cfg(feature = "post-quantum")]
pub mod kyber;

/// KEM provider of a classical-only build.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKemProvider;

impl KemProvider for NoKemProvider {
    fn supports(&self, _level: KemLevel) -> bool {
        false
    }

    fn generate_kem_keys(&self, level: KemLevel) -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        Err(CryptoError::UnsupportedAlgorithm(level.to_string()))
    }

    fn encapsulate(&self, level: KemLevel, _public_key: &[u8]) -> Result<(Vec<u8>, SecretBytes), CryptoError> {
        Err(CryptoError::UnsupportedAlgorithm(level.to_string()))
    }

    fn decapsulate(
        &self,
        level: KemLevel,
        _private_key: &[u8],
        _ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        Err(CryptoError::UnsupportedAlgorithm(level.to_string()))
    }
}

#[derive(Clone)]
pub struct PrimitiveSuite {
    pub classic: Arc<dyn CryptoProvider>,
    pub kem: Arc<dyn KemProvider>,
}

impl PrimitiveSuite {
    pub fn new(classic: Arc<dyn CryptoProvider>, kem: Arc<dyn KemProvider>) -> Self {
        Self { classic, kem }
    }

    /// X25519 only; hybrid and quantum algorithms are reported unsupported.
    pub fn classical_only() -> Self {
        Self::new(Arc::new(classic::ClassicSuiteProvider), Arc::new(NoKemProvider))
    }

    pub fn supports(&self, algorithm: AlgorithmId) -> bool {
        match algorithm.kem_level() {
            None => true,
            Some(level) => self.kem.supports(level),
        }
    }

    /// Algorithms this suite can execute, highest priority first
    pub fn supported_algorithms(&self) -> CapabilitySet {
        AlgorithmId::ALL
            .iter()
            .copied()
            .filter(|algorithm| self.supports(*algorithm))
            .collect()
    }
}

impl Default for PrimitiveSuite {
    #[cfg(feature = "post-quantum")]
    fn default() -> Self {
        Self::new(Arc::new(classic::ClassicSuiteProvider), Arc::new(kyber::KyberKemProvider))
    }

    #[cfg(not(feature = "post-quantum"))]
    fn default() -> Self {
        Self::classical_only()
    }
}

impl std::fmt::Debug for PrimitiveSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveSuite")
            .field("supported", &self.supported_algorithms())
            .finish()
    }
}
