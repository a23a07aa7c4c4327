//! Identity manager (§2 "Identity manager"): wires the long-lived
//! [`Identity`] to the rotation rules in [`super::rotation`] and exposes the
//! values the rest of the core actually needs on the wire.

use std::time::{Duration, SystemTime};

use uuid::Uuid;

use super::identity::Identity;
use super::rotation;
use crate::protocol::PeerId;

/// Owns the long-lived identity and answers "what do I advertise/sign as
/// right now" questions. Stateless beyond the identity itself: ephemeral
/// values are recomputed from the wall clock on every call, so there's
/// nothing to desynchronize on restart.
pub struct IdentityManager {
    identity: Identity,
    rotation_enabled: bool,
    service_uuid_prefix: String,
    legacy_service_uuid: Uuid,
    rotation_bucket: Duration,
    rotation_overlap: Duration,
}

impl IdentityManager {
    pub fn new(
        identity: Identity,
        rotation_enabled: bool,
        service_uuid_prefix: String,
        legacy_service_uuid: Uuid,
        rotation_bucket: Duration,
        rotation_overlap: Duration,
    ) -> Self {
        Self {
            identity,
            rotation_enabled,
            service_uuid_prefix,
            legacy_service_uuid,
            rotation_bucket,
            rotation_overlap,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The sender ID to stamp on outgoing packets (§3).
    pub fn current_ephemeral_peer_id(&self) -> PeerId {
        let bytes = if self.rotation_enabled {
            let bucket = rotation::bucket_index(SystemTime::now(), self.rotation_bucket);
            rotation::ephemeral_peer_id(&self.identity.static_fingerprint, bucket)
        } else {
            rotation::static_peer_id(&self.identity.static_fingerprint)
        };
        PeerId::new(bytes)
    }

    /// The service UUID this node should currently advertise (§4.5).
    pub fn current_service_uuid(&self) -> Uuid {
        if self.rotation_enabled {
            rotation::current_service_uuid(&self.service_uuid_prefix, SystemTime::now(), self.rotation_bucket)
        } else {
            self.legacy_service_uuid
        }
    }

    /// The set of UUIDs a scan filter should accept from peers right now
    /// (§3 invariant, §8 Rotation).
    pub fn valid_service_uuid_set(&self) -> std::collections::HashSet<Uuid> {
        if self.rotation_enabled {
            rotation::valid_uuid_set(
                &self.service_uuid_prefix,
                self.legacy_service_uuid,
                SystemTime::now(),
                self.rotation_bucket,
                self.rotation_overlap,
            )
        } else {
            std::collections::HashSet::from([self.legacy_service_uuid])
        }
    }

    /// True if `id` equals either the current rotating peer ID or the
    /// fixed static-derived peer ID (§4.6 step 3: "this node's current or
    /// static peer ID").
    pub fn owns_peer_id(&self, id: &PeerId) -> bool {
        *id == self.current_ephemeral_peer_id()
            || *id.as_bytes() == rotation::static_peer_id(&self.identity.static_fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(rotation_enabled: bool) -> IdentityManager {
        IdentityManager::new(
            Identity::generate(),
            rotation_enabled,
            "meshcore".into(),
            Uuid::from_u128(1),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn disabled_rotation_uses_static_fingerprint_prefix() {
        let mgr = manager(false);
        let expected = PeerId::new(rotation::static_peer_id(&mgr.identity().static_fingerprint));
        assert_eq!(mgr.current_ephemeral_peer_id(), expected);
        assert!(mgr.owns_peer_id(&expected));
    }

    #[test]
    fn enabled_rotation_recognizes_its_own_current_id() {
        let mgr = manager(true);
        let id = mgr.current_ephemeral_peer_id();
        assert!(mgr.owns_peer_id(&id));
    }
}
