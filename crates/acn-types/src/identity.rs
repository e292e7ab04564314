//! Network identity of an ACN node.
//!
//! Every node owns a secp256k1 key. Its public half, hex-encoded in compressed
//! form, is the `peer_public_key` agents sign in their records. The [`PeerId`]
//! is the base58 identity multihash of the protobuf-encoded key, so the public
//! key can always be recovered from the id.

use crate::error::{AcnError, AcnResult};
use crate::ledger::{compressed_hex, parse_hex_public_key};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Multihash code + length, then protobuf `PublicKey { Type = Secp256k1, Data = 33 bytes }`.
const SECP256K1_ID_PREFIX: [u8; 6] = [0x00, 0x25, 0x08, 0x02, 0x12, 0x21];

/// Identifier of a node on the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Derive the peer id from a hex-encoded secp256k1 public key.
    pub fn from_public_key(public_key: &str) -> AcnResult<Self> {
        let key = parse_hex_public_key(public_key)?;
        let mut bytes = SECP256K1_ID_PREFIX.to_vec();
        bytes.extend_from_slice(key.to_encoded_point(true).as_bytes());
        Ok(PeerId(bs58::encode(bytes).into_string()))
    }

    /// Recover the compressed hex public key embedded in this id.
    pub fn public_key(&self) -> AcnResult<String> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| AcnError::PeerAddress(e.to_string()))?;
        if bytes.len() != SECP256K1_ID_PREFIX.len() + 33 || !bytes.starts_with(&SECP256K1_ID_PREFIX)
        {
            return Err(AcnError::PeerAddress(format!(
                "peer id {} does not embed a secp256k1 key",
                self.0
            )));
        }
        Ok(hex::encode(&bytes[SECP256K1_ID_PREFIX.len()..]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = AcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AcnError::PeerAddress(format!("{s}: {e}")))?;
        if bytes.len() < 2 {
            return Err(AcnError::PeerAddress(format!("{s}: multihash too short")));
        }
        Ok(PeerId(s.to_string()))
    }
}

impl TryFrom<String> for PeerId {
    type Error = AcnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> String {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node's long-lived secp256k1 identity key.
#[derive(Clone)]
pub struct NodeKey {
    signing_key: SigningKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Load from a hex-encoded 32-byte secret.
    pub fn from_hex(secret: &str) -> AcnResult<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| AcnError::InvalidPrivateKey(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| AcnError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Hex-encoded secret (for writing config files).
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Compressed hex public key, the `peer_public_key` encoding.
    pub fn public_key(&self) -> String {
        compressed_hex(self.signing_key.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        let mut bytes = SECP256K1_ID_PREFIX.to_vec();
        bytes.extend_from_slice(
            self.signing_key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        );
        PeerId(bs58::encode(bytes).into_string())
    }

    /// ECDSA signature (SHA-256, DER encoded) over `message`.
    pub fn sign_der(&self, message: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(message);
        sig.to_der().as_bytes().to_vec()
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Verify a DER signature produced by [`NodeKey::sign_der`].
pub fn verify_der(public_key: &str, message: &[u8], der: &[u8]) -> AcnResult<bool> {
    let key = parse_hex_public_key(public_key)?;
    let sig = Signature::from_der(der).map_err(|e| AcnError::Signature(e.to_string()))?;
    let sig = sig.normalize_s().unwrap_or(sig);
    Ok(key.verify(message, &sig).is_ok())
}
