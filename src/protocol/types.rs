//! Wire-level types: peer identifiers and the `Packet` struct (§3).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::constants::*;

/// 8-byte rotating sender identifier carried on the wire. Distinct from the
/// peer's long-lived `StaticFingerprint` (crate::crypto::identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; SENDER_ID_LEN]);

impl PeerId {
    pub fn new(bytes: [u8; SENDER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn broadcast() -> Self {
        Self(RECIPIENT_ID_BROADCAST)
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == RECIPIENT_ID_BROADCAST
    }

    pub fn is_reserved(&self) -> bool {
        self.0 == SENDER_ID_RESERVED
    }

    pub fn as_bytes(&self) -> &[u8; SENDER_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// An optional source-routing path: a list of 8-byte hop peer IDs.
pub type Route = Vec<PeerId>;

/// The core wire entity (§3). `Packet` is the decoded, in-memory
/// representation; `binary::encode`/`binary::decode` convert to/from bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub route: Option<Route>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Packet {
    /// Build a new packet with sane defaults (current timestamp, default TTL,
    /// v1 version pending a length check at encode time).
    pub fn new(packet_type: u8, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION_V1,
            packet_type,
            ttl: DEFAULT_TTL,
            timestamp: now_millis(),
            sender_id,
            recipient_id: None,
            route: None,
            payload,
            signature: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_signature(mut self, signature: [u8; SIGNATURE_LEN]) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn has_recipient(&self) -> bool {
        self.recipient_id.is_some()
    }

    pub fn has_route(&self) -> bool {
        self.route.is_some()
    }

    pub fn has_signature(&self) -> bool {
        self.signature.is_some()
    }

    /// Decrement TTL for relay. Caller must check `ttl > 0` first (§4.6).
    pub fn decrement_ttl(&mut self) {
        self.ttl = self.ttl.saturating_sub(1);
    }
}

/// Milliseconds since the Unix epoch, matching the wire timestamp's unit.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a random 16-bit fragment identifier (§4.2).
pub fn random_fragment_id() -> u16 {
    rand::thread_rng().gen_range(0..=u16::MAX)
}

use rand::Rng;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_sentinel_round_trips() {
        let id = PeerId::broadcast();
        assert!(id.is_broadcast());
        assert_eq!(id.0, [0xFF; 8]);
    }

    #[test]
    fn reserved_sender_id_is_distinguishable() {
        let reserved = PeerId::new(SENDER_ID_RESERVED);
        assert!(reserved.is_reserved());
        let normal = PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!normal.is_reserved());
    }
}
