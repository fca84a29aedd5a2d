//! Chain checksum over audit entries.
//!
//! Digest input, in order:
//!   1. previous checksum (64 ASCII hex chars, or `CHAIN_SEED`)
//!   2. every payload field in the fixed order below, each as a tag byte
//!      (0 = absent, 1 = present) followed by an 8-byte little-endian length
//!      and the UTF-8 bytes
//!
//! Length prefixes keep `("ab", "c")` and `("a", "bc")` distinct, and the tag
//! keeps an absent optional field distinct from an empty one.

use sha2::{Digest, Sha256};

/// "Previous checksum" of the very first entry in a store
pub const CHAIN_SEED: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Canonical view of an entry without its checksum
#[derive(Debug, Clone, Copy)]
pub struct ChecksumPayload<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub actor_id: Option<&'a str>,
    pub action: &'a str,
    pub entity_type: &'a str,
    pub entity_id: Option<&'a str>,
    pub category: &'a str,
    pub severity: &'a str,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    /// Canonical JSON (sorted keys, no whitespace)
    pub metadata: &'a str,
}

pub fn chain_checksum(prev_checksum: &str, payload: &ChecksumPayload<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_checksum.as_bytes());

    let fields = [
        Some(payload.id),
        Some(payload.timestamp),
        payload.actor_id,
        Some(payload.action),
        Some(payload.entity_type),
        payload.entity_id,
        Some(payload.category),
        Some(payload.severity),
        payload.ip_address,
        payload.user_agent,
        Some(payload.metadata),
    ];
    for field in fields {
        match field {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }

    hex::encode(hasher.finalize())
}
