//! Self-signed announce payload (§3 `flags` bit 1 "has_signature").
//!
//! An ANNOUNCE packet's payload bundles the sender's Ed25519 verifying key
//! with its nickname so the packet's optional signature can be checked
//! against a key carried in the very same packet. A valid signature proves
//! only that whoever sent the packet holds the private key matching the
//! embedded public key — it says nothing about whether that key should be
//! trusted, which is why this stays out of `relay`/dedup and the mesh core
//! carries no key-pinning or anti-Sybil logic on top of it.

use ed25519_dalek::VerifyingKey;

use crate::error::{Error, Result};

const VERIFYING_KEY_LEN: usize = 32;

/// Serialize `{verifying_key, nickname}` into an ANNOUNCE payload.
pub fn encode(verifying_key: &VerifyingKey, nickname: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERIFYING_KEY_LEN + nickname.len());
    out.extend_from_slice(verifying_key.as_bytes());
    out.extend_from_slice(nickname.as_bytes());
    out
}

/// Split a decoded ANNOUNCE payload back into its verifying key and nickname.
pub fn decode(payload: &[u8]) -> Result<(VerifyingKey, String)> {
    if payload.len() < VERIFYING_KEY_LEN {
        return Err(Error::WireMalformed("announce payload shorter than a verifying key".into()));
    }
    let (key_bytes, nickname_bytes) = payload.split_at(VERIFYING_KEY_LEN);
    let verifying_key = VerifyingKey::from_bytes(key_bytes.try_into().expect("split_at guarantees 32 bytes"))
        .map_err(|_| Error::WireMalformed("announce payload carries an invalid verifying key".into()))?;
    let nickname = String::from_utf8(nickname_bytes.to_vec())
        .map_err(|_| Error::WireMalformed("announce nickname is not valid utf-8".into()))?;
    Ok((verifying_key, nickname))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn round_trips_key_and_nickname() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let payload = encode(&verifying_key, "trinity");
        let (decoded_key, nickname) = decode(&payload).unwrap();
        assert_eq!(decoded_key, verifying_key);
        assert_eq!(nickname, "trinity");
    }

    #[test]
    fn rejects_payload_shorter_than_a_key() {
        assert!(decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn empty_nickname_is_allowed() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let payload = encode(&verifying_key, "");
        let (_, nickname) = decode(&payload).unwrap();
        assert!(nickname.is_empty());
    }
}
