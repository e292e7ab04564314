//! Proof-of-Representation validation.
//!
//! An [`AgentRecord`] is accepted only if it names the expected address, is
//! bound to the expected network identity, derives its address from its own
//! public key, and carries a valid ledger signature over `peer_public_key`.

use acn_types::ledger::{derive_address, is_supported, verify_signature};
use acn_types::{AgentRecord, Status, StatusCode};

/// Validate `record` for `expected_address`, held by the node whose public key
/// is `expected_peer_public_key`.
///
/// Checks run in a fixed order and stop at the first failure.
pub fn validate(
    record: &AgentRecord,
    expected_address: &str,
    expected_peer_public_key: &str,
) -> Status {
    if record.address != expected_address {
        return Status::error(
            StatusCode::ErrorWrongAgentAddress,
            format!(
                "agent address {} does not match expected {}",
                record.address, expected_address
            ),
        );
    }

    if !is_supported(&record.ledger_id) {
        return Status::error(
            StatusCode::ErrorUnsupportedLedger,
            format!("unsupported ledger {}", record.ledger_id),
        );
    }

    if record.peer_public_key != expected_peer_public_key {
        return Status::error(
            StatusCode::ErrorWrongPublicKey,
            format!(
                "peer public key {} does not match the presenting peer {}",
                record.peer_public_key, expected_peer_public_key
            ),
        );
    }

    match derive_address(&record.ledger_id, &record.public_key) {
        Ok(derived) if derived == record.address => {}
        Ok(derived) => {
            return Status::error(
                StatusCode::ErrorWrongAgentAddress,
                format!(
                    "agent address {} is not derived from its public key ({})",
                    record.address, derived
                ),
            );
        }
        Err(e) => {
            return Status::error(
                StatusCode::ErrorWrongAgentAddress,
                format!("cannot derive address from public key: {e}"),
            );
        }
    }

    match verify_signature(
        &record.ledger_id,
        record.peer_public_key.as_bytes(),
        &record.signature,
        &record.public_key,
    ) {
        Ok(true) => Status::success(),
        Ok(false) => Status::error(
            StatusCode::ErrorInvalidProof,
            "signature does not verify against the agent public key",
        ),
        Err(e) => Status::error(StatusCode::ErrorInvalidProof, format!("invalid proof: {e}")),
    }
}

/// [`validate`] as a `Result`, for `?` chains.
pub fn check(
    record: &AgentRecord,
    expected_address: &str,
    expected_peer_public_key: &str,
) -> Result<(), Status> {
    let status = validate(record, expected_address, expected_peer_public_key);
    if status.is_success() {
        Ok(())
    } else {
        Err(status)
    }
}
