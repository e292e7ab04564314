//! DHT content keys derived from agent addresses.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic DHT key under which an agent address is provided.
///
/// Rendered as a CIDv0 string: base58 of the sha2-256 multihash of the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn for_address(address: &str) -> Self {
        let digest = Sha256::digest(address.as_bytes());
        let mut multihash = Vec::with_capacity(34);
        multihash.push(0x12);
        multihash.push(0x20);
        multihash.extend_from_slice(&digest);
        ContentKey(bs58::encode(multihash).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_is_deterministic() {
        let a = ContentKey::for_address("fetch1abc");
        let b = ContentKey::for_address("fetch1abc");
        assert_eq!(a, b);
        assert_ne!(a, ContentKey::for_address("fetch1abd"));
    }

    #[test]
    fn test_content_key_is_cid_v0() {
        let key = ContentKey::for_address("fetch1abc");
        assert!(key.as_str().starts_with("Qm"));
        assert_eq!(key.as_str().len(), 46);
    }
}
