use serde::Serialize;
use sha2::{Digest, Sha256};
use crate::error::Result;

/// Computes a SHA-256 hash over the JSON form of `value`.
/// Maps in the shared types are ordered, so equal content hashes equally.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let hash = Sha256::digest(json.as_bytes());
    Ok(hex::encode(hash))
}
