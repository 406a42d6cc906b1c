//! ML-KEM (Kyber) parameter sets via `pqcrypto-kyber`.

use crate::crypto::algorithm::KemLevel;
use crate::crypto::provider::{KemProvider, SecretBytes};
use crate::error::CryptoError;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use zeroize::Zeroizing;

/// Dispatches to the pqcrypto module of the requested parameter set.
macro_rules! with_kyber {
    ($level:expr, $kyber:ident => $body:block) => {
        match $level {
            KemLevel::MlKem512 => {
                use pqcrypto_kyber::kyber512 as $kyber;
                $body
            }
            KemLevel::MlKem768 => {
                use pqcrypto_kyber::kyber768 as $kyber;
                $body
            }
            KemLevel::MlKem1024 => {
                use pqcrypto_kyber::kyber1024 as $kyber;
                $body
            }
        }
    };
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KyberKemProvider;

impl KemProvider for KyberKemProvider {
    fn supports(&self, _level: KemLevel) -> bool {
        true
    }

    fn generate_kem_keys(&self, level: KemLevel) -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        with_kyber!(level, kyber => {
            let (public_key, secret_key) = kyber::keypair();
            Ok((
                Zeroizing::new(secret_key.as_bytes().to_vec()),
                public_key.as_bytes().to_vec(),
            ))
        })
    }

    fn encapsulate(&self, level: KemLevel, public_key: &[u8]) -> Result<(Vec<u8>, SecretBytes), CryptoError> {
        with_kyber!(level, kyber => {
            let public_key = kyber::PublicKey::from_bytes(public_key).map_err(|e| {
                CryptoError::KemEncapsulationError(format!("Invalid {} public key: {:?}", level, e))
            })?;
            let (shared_secret, ciphertext) = kyber::encapsulate(&public_key);
            Ok((
                ciphertext.as_bytes().to_vec(),
                Zeroizing::new(shared_secret.as_bytes().to_vec()),
            ))
        })
    }

    fn decapsulate(
        &self,
        level: KemLevel,
        private_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        with_kyber!(level, kyber => {
            let secret_key = kyber::SecretKey::from_bytes(private_key).map_err(|e| {
                CryptoError::KemDecapsulationError(format!("Invalid {} secret key: {:?}", level, e))
            })?;
            let ciphertext = kyber::Ciphertext::from_bytes(ciphertext).map_err(|e| {
                CryptoError::KemDecapsulationError(format!("Invalid {} ciphertext: {:?}", level, e))
            })?;
            let shared_secret = kyber::decapsulate(&ciphertext, &secret_key);
            Ok(Zeroizing::new(shared_secret.as_bytes().to_vec()))
        })
    }
}
