//! Ephemeral peer ID and BLE service UUID rotation (§3 "Peer identity
//! (rotating)", §8 Rotation).
//!
//! Both rotate on the same bucket clock (`rotation_bucket`, default 1 hour)
//! but serve different purposes: the ephemeral peer ID is the wire-level
//! sender identity, while the service UUID is what two nodes must agree on
//! *without* having exchanged anything yet, so its derivation is public and
//! symmetric — any node configured with the same `service_uuid_prefix` can
//! compute the same valid set.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::identity::StaticFingerprint;

type HmacSha256 = Hmac<Sha256>;

/// The bucket index for `now`, counting whole `bucket_duration` windows
/// since the Unix epoch.
pub fn bucket_index(now: SystemTime, bucket_duration: Duration) -> u64 {
    let elapsed = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    elapsed.as_secs() / bucket_duration.as_secs().max(1)
}

/// How far into the current bucket `now` falls.
fn position_in_bucket(now: SystemTime, bucket_duration: Duration) -> Duration {
    let elapsed = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let bucket_secs = bucket_duration.as_secs().max(1);
    Duration::from_secs(elapsed.as_secs() % bucket_secs)
}

/// Derive the 8-byte rotating sender ID for bucket `bucket_index`, keyed by
/// the node's own `static_fingerprint` (§3). Deterministic per-node so a
/// node's own ephemeral ID is stable across the bucket, but unrelated nodes
/// never collide (keyed by fingerprint, not a shared secret).
pub fn ephemeral_peer_id(fingerprint: &StaticFingerprint, bucket_index: u64) -> [u8; 8] {
    let mut mac = HmacSha256::new_from_slice(fingerprint).expect("HMAC accepts any key length");
    mac.update(b"ephemeral-");
    mac.update(&bucket_index.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Ephemeral peer ID used when rotation is disabled: the first 8 bytes of
/// the static fingerprint (§3).
pub fn static_peer_id(fingerprint: &StaticFingerprint) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&fingerprint[..8]);
    out
}

/// Rotation secret shared by every node configured with the same
/// `service_uuid_prefix` — this is *not* peer-specific; it lets any two
/// nodes in the same mesh community compute the same valid UUID set without
/// having exchanged keys (§3, §8 Rotation).
fn rotation_secret(prefix: &str) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(b"meshcore-rotation-secret-");
    hasher.update(prefix.as_bytes());
    hasher.finalize().into()
}

/// Derive the service UUID for one bucket: `HMAC-SHA256(shared_secret,
/// "<prefix>-" || bucket_index)`, truncated to 16 bytes with the UUID v4
/// variant/version bits forced (§3).
pub fn derive_service_uuid(prefix: &str, bucket_index: u64) -> Uuid {
    let secret = rotation_secret(prefix);
    let mut mac = HmacSha256::new_from_slice(&secret).expect("HMAC accepts any key length");
    mac.update(format!("{prefix}-").as_bytes());
    mac.update(&bucket_index.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // Force UUID v4 variant/version bits so the derived value is a
    // well-formed (if not verifiably random) v4 UUID.
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

/// The set of service UUIDs this node currently accepts as valid from a peer
/// (§3 invariant: "a peer advertising any UUID in the valid set is
/// accepted"): current bucket, previous bucket (unconditionally, to absorb
/// clock skew and in-flight rotations), next bucket only inside the overlap
/// window at the tail of the current bucket, plus the fixed legacy UUID.
pub fn valid_uuid_set(
    prefix: &str,
    legacy_uuid: Uuid,
    now: SystemTime,
    bucket_duration: Duration,
    overlap: Duration,
) -> HashSet<Uuid> {
    let current = bucket_index(now, bucket_duration);
    let mut set = HashSet::with_capacity(4);
    set.insert(derive_service_uuid(prefix, current));
    set.insert(derive_service_uuid(prefix, current.saturating_sub(1)));

    let position = position_in_bucket(now, bucket_duration);
    if position + overlap >= bucket_duration {
        set.insert(derive_service_uuid(prefix, current + 1));
    }

    set.insert(legacy_uuid);
    set
}

/// Which service UUID this node should currently advertise: always the
/// current bucket's derived UUID.
pub fn current_service_uuid(prefix: &str, now: SystemTime, bucket_duration: Duration) -> Uuid {
    derive_service_uuid(prefix, bucket_index(now, bucket_duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_id_is_stable_within_a_bucket() {
        let fp = [7u8; 32];
        let a = ephemeral_peer_id(&fp, 100);
        let b = ephemeral_peer_id(&fp, 100);
        assert_eq!(a, b);
        let c = ephemeral_peer_id(&fp, 101);
        assert_ne!(a, c);
    }

    #[test]
    fn shared_rotation_secret_yields_intersecting_valid_sets() {
        let prefix = "meshcore";
        let legacy = Uuid::from_u128(1);
        let bucket = Duration::from_secs(3600);
        let overlap = Duration::from_secs(300);

        // Two "nodes" computing independently at the same instant must
        // agree because the rotation secret is derived from the shared
        // prefix, not any per-node material.
        let now = UNIX_EPOCH + Duration::from_secs(3600 * 10 + 10);
        let a = valid_uuid_set(prefix, legacy, now, bucket, overlap);
        let b = valid_uuid_set(prefix, legacy, now, bucket, overlap);
        assert_eq!(a, b);

        // Near a bucket boundary, the overlap window's next-bucket UUID
        // must be in the advertiser's own valid set (self-consistency) and
        // both sides' currently-advertised UUIDs intersect with each set.
        let near_boundary = UNIX_EPOCH + Duration::from_secs(3600 * 10 + 3590);
        let advertised_before = current_service_uuid(prefix, near_boundary, bucket);
        let set_before = valid_uuid_set(prefix, legacy, near_boundary, bucket, overlap);
        assert!(set_before.contains(&advertised_before));

        let after_boundary = UNIX_EPOCH + Duration::from_secs(3600 * 11 + 5);
        let advertised_after = current_service_uuid(prefix, after_boundary, bucket);
        let set_after = valid_uuid_set(prefix, legacy, after_boundary, bucket, overlap);
        assert!(set_after.contains(&advertised_after));
        // The side that hasn't rotated yet must still accept the new UUID
        // during the overlap window.
        assert!(set_before.contains(&advertised_after));
    }

    #[test]
    fn legacy_uuid_is_always_in_the_valid_set() {
        let legacy = Uuid::from_u128(0xDEAD);
        let set = valid_uuid_set(
            "meshcore",
            legacy,
            SystemTime::now(),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        assert!(set.contains(&legacy));
    }
}
