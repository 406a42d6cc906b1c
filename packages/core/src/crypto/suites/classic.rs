use crate::crypto::provider::{CryptoProvider, SecretBytes};
use crate::error::CryptoError;
use crate::utils::validation::{validate_public_key, validate_signature, KEY_LENGTH};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key as AeadKeyChacha, Nonce, Tag,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const TAG_LENGTH: usize = 16;

/// X25519 + Ed25519 + ChaCha20-Poly1305 + HKDF-SHA256.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassicSuiteProvider;

fn key_array(bytes: &[u8], what: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidInputError(format!("Invalid {} length: {}", what, bytes.len())))
}

impl CryptoProvider for ClassicSuiteProvider {
    fn generate_dh_keys(&self) -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = DhPublicKey::from(&private_key);
        Ok((
            Zeroizing::new(private_key.to_bytes().to_vec()),
            public_key.to_bytes().to_vec(),
        ))
    }

    fn dh_public_from_private(&self, private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = StaticSecret::from(key_array(private_key, "DH private key")?);
        Ok(DhPublicKey::from(&secret).to_bytes().to_vec())
    }

    fn dh(&self, private_key: &[u8], public_key: &[u8]) -> Result<SecretBytes, CryptoError> {
        validate_public_key(public_key)?;
        let secret = StaticSecret::from(key_array(private_key, "DH private key")?);
        let remote = DhPublicKey::from(key_array(public_key, "DH public key")?);
        let shared = secret.diffie_hellman(&remote);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidInputError(
                "DH produced a non-contributory shared secret".to_string(),
            ));
        }
        Ok(Zeroizing::new(shared.to_bytes().to_vec()))
    }

    fn generate_signature_keys(&self) -> Result<(SecretBytes, Vec<u8>), CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Ok((
            Zeroizing::new(signing_key.to_bytes().to_vec()),
            verifying_key.to_bytes().to_vec(),
        ))
    }

    fn sign(&self, signing_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signing_key = SigningKey::from_bytes(&key_array(signing_key, "signing key")?);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, verifying_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        validate_signature(signature)?;
        let verifying_key = VerifyingKey::from_bytes(&key_array(verifying_key, "verifying key")?)
            .map_err(|e| CryptoError::InvalidInputError(format!("Invalid verifying key: {}", e)))?;

        let sig_bytes: &[u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidInputError("Invalid signature length".to_string()))?;
        let signature = Signature::from_bytes(sig_bytes);

        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::SignatureVerificationError(e.to_string()))
    }

    fn aead_encrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let cipher = ChaCha20Poly1305::new(AeadKeyChacha::from_slice(&key_array(key, "AEAD key")?));
        if nonce.len() != 12 {
            return Err(CryptoError::InvalidInputError(format!("Invalid nonce length: {}", nonce.len())));
        }

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), associated_data, &mut buffer)
            .map_err(|e| CryptoError::AeadEncryptionError(e.to_string()))?;
        Ok((buffer, tag.to_vec()))
    }

    fn aead_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(AeadKeyChacha::from_slice(&key_array(key, "AEAD key")?));
        if nonce.len() != 12 {
            return Err(CryptoError::InvalidInputError(format!("Invalid nonce length: {}", nonce.len())));
        }
        if tag.len() != TAG_LENGTH {
            return Err(CryptoError::InvalidInputError(format!("Invalid tag length: {}", tag.len())));
        }

        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                associated_data,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|e| CryptoError::AeadDecryptionError(e.to_string()))?;
        Ok(buffer)
    }

    fn hkdf_derive_key(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<SecretBytes, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = Zeroizing::new(vec![0u8; len]);
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
        Ok(okm)
    }

    fn kdf_rk(&self, root_key: &[u8], dh_output: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output);
        let mut output = Zeroizing::new(vec![0u8; 64]);
        hkdf.expand(b"Double-Ratchet-Root-Key-Expansion", &mut output)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;

        let new_root_key = Zeroizing::new(output[..32].to_vec());
        let chain_key = Zeroizing::new(output[32..].to_vec());

        Ok((new_root_key, chain_key))
    }

    fn kdf_ck(&self, chain_key: &[u8]) -> Result<(SecretBytes, SecretBytes), CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(chain_key), b"");
        let mut output = Zeroizing::new(vec![0u8; 64]);
        hkdf.expand(b"Double-Ratchet-Chain-Key-Expansion", &mut output)
            .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;

        let message_key = Zeroizing::new(output[..32].to_vec());
        let next_chain = Zeroizing::new(output[32..].to_vec());

        Ok((message_key, next_chain))
    }

    fn generate_nonce(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut nonce_bytes);
        Ok(nonce_bytes)
    }
}
