//! Long-lived peer identity (§3 "Peer identity (long-lived)").
//!
//! A node's identity never changes for the life of the identity file: a
//! signing keypair (Ed25519, used for the optional packet signature), a
//! Noise static keypair (X25519, used as the Noise XX static key), and the
//! `static_fingerprint` derived from the Noise static public key. Ephemeral
//! rotation (§3 "Peer identity (rotating)") builds on top of this and lives
//! in [`super::rotation`].

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Static};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// 32-byte digest of the Noise static public key. Stable across ephemeral
/// peer ID rotation; this is the key Noise sessions are indexed by (§4.3).
pub type StaticFingerprint = [u8; 32];

/// Long-lived Noise static keypair (X25519).
#[derive(ZeroizeOnDrop)]
pub struct NoiseStaticKeypair {
    #[zeroize(skip)]
    public: X25519Public,
    private: [u8; 32],
}

impl NoiseStaticKeypair {
    pub fn generate() -> Self {
        let secret = X25519Static::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            public,
            private: secret.to_bytes(),
        }
    }

    pub fn from_private_bytes(private: [u8; 32]) -> Self {
        let secret = X25519Static::from(private);
        let public = X25519Public::from(&secret);
        Self { public, private }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn private_bytes(&self) -> &[u8; 32] {
        &self.private
    }
}

impl Clone for NoiseStaticKeypair {
    fn clone(&self) -> Self {
        Self::from_private_bytes(self.private)
    }
}

impl std::fmt::Debug for NoiseStaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseStaticKeypair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// Signing keypair used for the optional `has_signature` packet field (§3).
#[derive(Clone)]
pub struct SigningKeypair {
    signing_key: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(verifying_key: &VerifyingKey, message: &[u8], signature: &Signature) -> Result<()> {
        verifying_key
            .verify(message, signature)
            .map_err(|_| Error::CryptoDecryptFailed)
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("verifying_key", &hex::encode(self.verifying_key().to_bytes()))
            .finish_non_exhaustive()
    }
}

/// The node's long-lived identity (§3). Held for the life of the process;
/// loaded from / persisted to the identity file (§6, §12) by
/// [`crate::storage`].
#[derive(Debug, Clone)]
pub struct Identity {
    pub signing_key: SigningKeypair,
    pub noise_static_key: NoiseStaticKeypair,
    pub static_fingerprint: StaticFingerprint,
}

impl Identity {
    pub fn generate() -> Self {
        let noise_static_key = NoiseStaticKeypair::generate();
        let signing_key = SigningKeypair::generate();
        let static_fingerprint = fingerprint_of(&noise_static_key.public_bytes());
        Self {
            signing_key,
            noise_static_key,
            static_fingerprint,
        }
    }

    /// Rebuild an identity from persisted raw key material (§12). The
    /// fingerprint is always recomputed, never trusted from storage.
    pub fn from_raw_parts(signing_key_bytes: [u8; 32], noise_private_bytes: [u8; 32]) -> Self {
        let noise_static_key = NoiseStaticKeypair::from_private_bytes(noise_private_bytes);
        let signing_key = SigningKeypair::from_bytes(signing_key_bytes);
        let static_fingerprint = fingerprint_of(&noise_static_key.public_bytes());
        Self {
            signing_key,
            noise_static_key,
            static_fingerprint,
        }
    }
}

/// `static_fingerprint = SHA-256(noise_static_public_key)` (§3).
pub fn fingerprint_of(noise_static_public: &[u8; 32]) -> StaticFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(noise_static_public);
    hasher.finalize().into()
}

/// Fill `out` with cryptographically secure random bytes.
pub fn fill_random(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Erase a secret-key-shaped buffer in place once it's no longer needed.
pub fn zeroize_bytes(bytes: &mut [u8]) {
    bytes.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_the_same_public_key() {
        let keypair = NoiseStaticKeypair::generate();
        let a = fingerprint_of(&keypair.public_bytes());
        let b = fingerprint_of(&keypair.public_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn identity_round_trips_through_raw_parts() {
        let identity = Identity::generate();
        let signing_bytes = identity.signing_key.to_bytes();
        let noise_bytes = *identity.noise_static_key.private_bytes();

        let restored = Identity::from_raw_parts(signing_bytes, noise_bytes);
        assert_eq!(restored.static_fingerprint, identity.static_fingerprint);
        assert_eq!(
            restored.noise_static_key.public_bytes(),
            identity.noise_static_key.public_bytes()
        );
    }

    #[test]
    fn signature_round_trips() {
        let identity = Identity::generate();
        let message = b"encode_for_signing preimage";
        let signature = identity.signing_key.sign(message);
        assert!(SigningKeypair::verify(&identity.signing_key.verifying_key(), message, &signature).is_ok());
    }
}
