use crate::error::CryptoError;

/// X25519 public keys, Ed25519 verifying keys and chain keys share this length
pub const KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

pub fn validate_public_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidInputError(format!(
            "Public key must be {} bytes, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(())
}

pub fn validate_signature(sig: &[u8]) -> Result<(), CryptoError> {
    if sig.len() != SIGNATURE_LENGTH {
        return Err(CryptoError::InvalidInputError(format!(
            "Signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            sig.len()
        )));
    }
    Ok(())
}
