use crate::error::{E2eeError, Result};
use serde::{de::DeserializeOwned, Serialize};

pub fn to_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    bincode::serialize(data).map_err(|e| E2eeError::Serialization(format!("Serialization failed: {}", e)))
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| E2eeError::Serialization(format!("Deserialization failed: {}", e)))
}
