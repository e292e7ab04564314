//! Ledger capability: address derivation, signing and signature verification.
//!
//! Three ledgers are supported, all on secp256k1:
//!
//! - `fetchai` / `cosmos`: hex compressed public keys, bech32 addresses
//!   (`fetch1…` / `cosmos1…`) and base64 `r||s` signatures over SHA-256.
//! - `ethereum`: `0x`-prefixed uncompressed public keys, EIP-55 checksummed
//!   addresses and 65-byte recoverable signatures over the personal-sign
//!   keccak digest.

use crate::error::{AcnError, AcnResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bech32::{Bech32, Hrp};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;
use std::str::FromStr;

/// A supported ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerId {
    Fetchai,
    Cosmos,
    Ethereum,
}

impl LedgerId {
    /// Every supported ledger.
    pub const ALL: [LedgerId; 3] = [LedgerId::Fetchai, LedgerId::Cosmos, LedgerId::Ethereum];

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerId::Fetchai => "fetchai",
            LedgerId::Cosmos => "cosmos",
            LedgerId::Ethereum => "ethereum",
        }
    }

    /// Derive the agent address for a public key in this ledger's encoding.
    pub fn derive_address(self, public_key: &str) -> AcnResult<String> {
        match self {
            LedgerId::Fetchai => cosmos_style_address("fetch", public_key),
            LedgerId::Cosmos => cosmos_style_address("cosmos", public_key),
            LedgerId::Ethereum => ethereum_address(public_key),
        }
    }

    /// Verify `signature` over `message` under `public_key`.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not verify
    /// and `Err` when an input cannot be parsed at all.
    pub fn verify(self, message: &[u8], signature: &str, public_key: &str) -> AcnResult<bool> {
        match self {
            LedgerId::Fetchai | LedgerId::Cosmos => {
                verify_cosmos_style(message, signature, public_key)
            }
            LedgerId::Ethereum => verify_ethereum(message, signature, public_key),
        }
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerId {
    type Err = AcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetchai" => Ok(LedgerId::Fetchai),
            "cosmos" => Ok(LedgerId::Cosmos),
            "ethereum" => Ok(LedgerId::Ethereum),
            other => Err(AcnError::UnsupportedLedger(other.to_string())),
        }
    }
}

/// Whether `ledger_id` names a supported ledger.
pub fn is_supported(ledger_id: &str) -> bool {
    LedgerId::from_str(ledger_id).is_ok()
}

/// Derive an agent address from a public key for the given ledger id.
pub fn derive_address(ledger_id: &str, public_key: &str) -> AcnResult<String> {
    LedgerId::from_str(ledger_id)?.derive_address(public_key)
}

/// Verify a ledger signature over `message`.
pub fn verify_signature(
    ledger_id: &str,
    message: &[u8],
    signature: &str,
    public_key: &str,
) -> AcnResult<bool> {
    LedgerId::from_str(ledger_id)?.verify(message, signature, public_key)
}

/// Parse a hex-encoded compressed (or uncompressed) SEC1 public key.
pub fn parse_hex_public_key(public_key: &str) -> AcnResult<VerifyingKey> {
    let bytes = hex::decode(public_key).map_err(|e| AcnError::InvalidPublicKey(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| AcnError::InvalidPublicKey(e.to_string()))
}

/// Hex of the 33-byte compressed SEC1 encoding.
pub fn compressed_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(true).as_bytes())
}

fn cosmos_style_address(prefix: &str, public_key: &str) -> AcnResult<String> {
    let bytes = hex::decode(public_key).map_err(|e| AcnError::InvalidPublicKey(e.to_string()))?;
    let sha = Sha256::digest(&bytes);
    let ripe = Ripemd160::digest(sha);
    let hrp = Hrp::parse(prefix).map_err(|e| AcnError::Address(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, ripe.as_slice()).map_err(|e| AcnError::Address(e.to_string()))
}

fn ethereum_public_key(public_key: &str) -> AcnResult<VerifyingKey> {
    let raw = public_key.strip_prefix("0x").unwrap_or(public_key);
    let bytes = hex::decode(raw).map_err(|e| AcnError::InvalidPublicKey(e.to_string()))?;
    if bytes.len() != 64 {
        return Err(AcnError::InvalidPublicKey(format!(
            "ethereum public key must be 64 bytes, got {}",
            bytes.len()
        )));
    }
    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(&bytes);
    VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| AcnError::InvalidPublicKey(e.to_string()))
}

fn ethereum_public_key_string(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    format!("0x{}", hex::encode(&point.as_bytes()[1..]))
}

fn ethereum_address(public_key: &str) -> AcnResult<String> {
    let key = ethereum_public_key(public_key)?;
    Ok(ethereum_address_of(&key))
}

fn ethereum_address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    eip55_checksum(&hash[12..])
}

/// EIP-55 mixed-case checksum encoding of a 20-byte address.
fn eip55_checksum(address: &[u8]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble > 7 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn personal_sign_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

fn verify_cosmos_style(message: &[u8], signature: &str, public_key: &str) -> AcnResult<bool> {
    let key = parse_hex_public_key(public_key)?;
    let raw = STANDARD
        .decode(signature)
        .map_err(|e| AcnError::Signature(e.to_string()))?;
    let sig = Signature::from_slice(&raw).map_err(|e| AcnError::Signature(e.to_string()))?;
    // k256 only accepts low-S signatures; other signers may emit high-S ones.
    let sig = sig.normalize_s().unwrap_or(sig);
    Ok(key.verify(message, &sig).is_ok())
}

fn verify_ethereum(message: &[u8], signature: &str, public_key: &str) -> AcnResult<bool> {
    let expected = ethereum_address(public_key)?;
    let raw = hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|e| AcnError::Signature(e.to_string()))?;
    if raw.len() != 65 {
        return Err(AcnError::Signature(format!(
            "ethereum signature must be 65 bytes, got {}",
            raw.len()
        )));
    }
    let v = raw[64];
    if v != 27 && v != 28 {
        return Err(AcnError::Signature(
            "invalid Ethereum signature (V is not 27 or 28)".to_string(),
        ));
    }
    let recovery_id = RecoveryId::from_byte(v - 27)
        .ok_or_else(|| AcnError::Signature("invalid recovery id".to_string()))?;
    let sig = Signature::from_slice(&raw[..64]).map_err(|e| AcnError::Signature(e.to_string()))?;
    let digest = personal_sign_digest(message);
    match VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id) {
        Ok(recovered) => Ok(ethereum_address_of(&recovered) == expected),
        Err(_) => Ok(false),
    }
}

/// A ledger key pair. Used by agent owners to produce agent records.
#[derive(Clone)]
pub struct LedgerKey {
    ledger: LedgerId,
    signing_key: SigningKey,
}

impl LedgerKey {
    /// Generate a fresh random key for `ledger`.
    pub fn generate(ledger: LedgerId) -> Self {
        Self {
            ledger,
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Load a key from a hex-encoded 32-byte secret.
    pub fn from_hex(ledger: LedgerId, secret: &str) -> AcnResult<Self> {
        let bytes = hex::decode(secret.strip_prefix("0x").unwrap_or(secret))
            .map_err(|e| AcnError::InvalidPrivateKey(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| AcnError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            ledger,
            signing_key,
        })
    }

    pub fn ledger(&self) -> LedgerId {
        self.ledger
    }

    /// Public key in this ledger's encoding.
    pub fn public_key(&self) -> String {
        let key = self.signing_key.verifying_key();
        match self.ledger {
            LedgerId::Fetchai | LedgerId::Cosmos => compressed_hex(key),
            LedgerId::Ethereum => ethereum_public_key_string(key),
        }
    }

    /// Agent address of this key.
    pub fn address(&self) -> AcnResult<String> {
        self.ledger.derive_address(&self.public_key())
    }

    /// Sign `message` in this ledger's signature format.
    pub fn sign(&self, message: &[u8]) -> AcnResult<String> {
        match self.ledger {
            LedgerId::Fetchai | LedgerId::Cosmos => {
                let sig: Signature = self.signing_key.sign(message);
                Ok(STANDARD.encode(sig.to_bytes()))
            }
            LedgerId::Ethereum => {
                let digest = personal_sign_digest(message);
                let (sig, recovery_id) = self
                    .signing_key
                    .sign_prehash_recoverable(&digest)
                    .map_err(|e| AcnError::Signature(e.to_string()))?;
                let mut raw = sig.to_bytes().to_vec();
                raw.push(recovery_id.to_byte() + 27);
                Ok(format!("0x{}", hex::encode(raw)))
            }
        }
    }
}

impl fmt::Debug for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerKey")
            .field("ledger", &self.ledger)
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
