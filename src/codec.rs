//! # Serialization Codec
//!
//! Typed values to compact binary blobs and back. Uses MessagePack with named fields
//! so stored payloads survive struct field reordering. The blob is opaque to the store.

use crate::error::{CacheError, CacheResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value into a binary blob
pub fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| CacheError::Serialization(format!("Failed to encode value: {}", e)))
}

/// Decode a binary blob produced by [`encode`]
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CacheResult<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| CacheError::Serialization(format!("Failed to decode value: {}", e)))
}
