//! Identity and key material (§3, §4.7 Identity manager).
//!
//! [`identity`] owns the long-lived signing/static keys and the
//! `static_fingerprint` derived from them. [`rotation`] derives the rotating
//! ephemeral peer ID and BLE service UUID on top of that identity. Noise
//! session crypto (handshake state, transport ciphers) lives in
//! [`crate::session`], which is keyed by `static_fingerprint`.

pub mod identity;
pub mod manager;
pub mod rotation;

pub use identity::{fill_random, fingerprint_of, Identity, NoiseStaticKeypair, SigningKeypair, StaticFingerprint};
pub use manager::IdentityManager;
pub use rotation::{bucket_index, current_service_uuid, derive_service_uuid, ephemeral_peer_id, static_peer_id, valid_uuid_set};
