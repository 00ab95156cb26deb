//! Signature recovery and address derivation.
//!
//! Proofs are signed with secp256k1 keys under the EIP-191 personal-message
//! convention; the miner's account address is the last 20 bytes of the
//! keccak-256 hash of the recovered public key.

use once_cell::sync::Lazy;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, Secp256k1};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Expected signature wire size: `r || s || v`.
pub const SIGNATURE_LEN: usize = 65;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature must be {SIGNATURE_LEN} bytes, got {0}")]
    BadLength(usize),
    #[error("recovery id must be 27 or 28, got {0}")]
    BadRecoveryId(u8),
    #[error("public key recovery failed")]
    RecoveryFailed,
    #[error("recovered signer {recovered} does not match account {expected}")]
    AddressMismatch { expected: String, recovered: String },
    #[error("signature is not valid hex")]
    BadEncoding,
}

/// keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// EIP-191 personal-message digest:
/// `keccak256("\x19Ethereum Signed Message:\n" + len(message) + message)`.
pub fn eip191_digest(message: &[u8]) -> [u8; 32] {
    let mut prefixed =
        Vec::with_capacity(26 + 20 + message.len());
    prefixed.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    prefixed.extend_from_slice(message.len().to_string().as_bytes());
    prefixed.extend_from_slice(message);
    keccak256(&prefixed)
}

/// Lowercase `0x`-prefixed address for a recovered public key.
fn address_of(pubkey: &secp256k1::PublicKey) -> String {
    let uncompressed = pubkey.serialize_uncompressed();
    // Skip the 0x04 SEC-1 tag; the address is the last 20 hash bytes.
    let digest = keccak256(&uncompressed[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Decodes a hex signature (optional `0x` prefix) into raw bytes.
pub fn parse_signature_hex(s: &str) -> Result<Vec<u8>, SignatureError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(trimmed).map_err(|_| SignatureError::BadEncoding)
}

/// Recovers the signer address from an EIP-191-signed message and a 65-byte
/// `r || s || v` signature with `v` in {27, 28}.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<String, SignatureError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(SignatureError::BadLength(signature.len()));
    }
    let v = signature[64];
    if v != 27 && v != 28 {
        return Err(SignatureError::BadRecoveryId(v));
    }
    let recovery_id =
        RecoveryId::from_i32(i32::from(v) - 27).map_err(|_| SignatureError::BadRecoveryId(v))?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| SignatureError::RecoveryFailed)?;

    let digest = eip191_digest(message);
    let pubkey = SECP
        .recover_ecdsa(&Message::from_digest(digest), &recoverable)
        .map_err(|_| SignatureError::RecoveryFailed)?;
    Ok(address_of(&pubkey))
}

/// Recovers the signer and checks it against the claimed account
/// (case-insensitive). Returns the normalized lowercase address.
pub fn verify_account(
    message: &[u8],
    signature: &[u8],
    account: &str,
) -> Result<String, SignatureError> {
    let recovered = recover_address(message, signature)?;
    if !recovered.eq_ignore_ascii_case(account) {
        return Err(SignatureError::AddressMismatch {
            expected: account.to_string(),
            recovered,
        });
    }
    Ok(recovered)
}

/// Signs a message under EIP-191, producing the 65-byte wire signature.
/// Used by tests and tooling; the service itself only verifies.
pub fn sign_message(message: &[u8], secret_key: &secp256k1::SecretKey) -> [u8; SIGNATURE_LEN] {
    let digest = eip191_digest(message);
    let sig = SECP.sign_ecdsa_recoverable(&Message::from_digest(digest), secret_key);
    let (recovery_id, compact) = sig.serialize_compact();
    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8 + 27;
    out
}

/// Address for a secret key, matching what recovery would return.
pub fn address_for_secret(secret_key: &secp256k1::SecretKey) -> String {
    let pubkey = secp256k1::PublicKey::from_secret_key(&SECP, secret_key);
    address_of(&pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn test_key() -> SecretKey {
        // Deterministic non-trivial scalar.
        let mut bytes = [0u8; 32];
        bytes[31] = 42;
        bytes[0] = 7;
        SecretKey::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_keccak_empty_vector() {
        // keccak-256 of the empty string, a fixed known value.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_eip191_digest_includes_length() {
        assert_ne!(eip191_digest(b"ab"), eip191_digest(b"abc"));
        assert_eq!(eip191_digest(b"ab"), eip191_digest(b"ab"));
    }

    #[test]
    fn test_sign_and_recover_round_trip() {
        let sk = test_key();
        let message = b"STEP-PROOF-v1|account:0xabc|nonce:1";
        let sig = sign_message(message, &sk);
        let recovered = recover_address(message, &sig).unwrap();
        assert_eq!(recovered, address_for_secret(&sk));
    }

    #[test]
    fn test_verify_account_case_insensitive() {
        let sk = test_key();
        let message = b"hello";
        let sig = sign_message(message, &sk);
        let addr = address_for_secret(&sk);
        assert!(verify_account(message, &sig, &addr.to_uppercase().replace("0X", "0x")).is_ok());
    }

    #[test]
    fn test_tampered_message_mismatches() {
        let sk = test_key();
        let sig = sign_message(b"original", &sk);
        let addr = address_for_secret(&sk);
        match verify_account(b"tampered", &sig, &addr) {
            Err(SignatureError::AddressMismatch { .. }) => {}
            other => panic!("expected AddressMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_length_rejected() {
        assert_eq!(
            recover_address(b"m", &[0u8; 64]),
            Err(SignatureError::BadLength(64))
        );
    }

    #[test]
    fn test_bad_recovery_id_rejected() {
        let mut sig = [0u8; SIGNATURE_LEN];
        sig[64] = 31;
        assert_eq!(recover_address(b"m", &sig), Err(SignatureError::BadRecoveryId(31)));
    }

    #[test]
    fn test_zero_signature_fails_recovery() {
        let mut sig = [0u8; SIGNATURE_LEN];
        sig[64] = 27;
        assert_eq!(recover_address(b"m", &sig), Err(SignatureError::RecoveryFailed));
    }

    #[test]
    fn test_parse_signature_hex() {
        assert_eq!(parse_signature_hex("0xdead").unwrap(), vec![0xde, 0xad]);
        assert_eq!(parse_signature_hex("dead").unwrap(), vec![0xde, 0xad]);
        assert_eq!(parse_signature_hex("0xzz"), Err(SignatureError::BadEncoding));
    }
}
