//! TTL-bounded flood relay decision (§4.6 "Relay & dedup").
//!
//! Pure decision logic, deliberately free of any I/O: given an inbound
//! packet and this node's own identity, decides whether to deliver it
//! locally, forward it, both, or drop it. The router (§4.7) owns the seen
//! cache and actually performs the forwarding this module recommends.

use crate::crypto::IdentityManager;
use crate::protocol::{constants, Packet};

/// What the router should do with an inbound packet, per the five-step
/// algorithm in §4.6:
///  1. dedup check (handled by the caller, before this function runs)
///  2. decrement TTL; drop if it reaches zero
///  3. if addressed to us (unicast or broadcast), deliver locally
///  4. if not addressed to us, or broadcast, also relay
///  5. for packets carrying an explicit route, the router forwards only
///     along the prescribed path instead of flooding (source routing);
///     this module never mutates the route, it only passes it through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    /// Deliver to the local application only; do not forward.
    DeliverLocal,
    /// Forward to other links only; not addressed to this node.
    ForwardOnly,
    /// Broadcast or otherwise addressed to both this node and others.
    DeliverAndForward,
    /// TTL exhausted or some other reason to silently discard.
    Drop,
}

/// Decide what to do with a packet that has already passed the seen-cache
/// dedup check. Returns the action and, when forwarding, the packet with
/// its TTL decremented. Any `route` the sender attached is passed through
/// untouched — it is a sender-pinned source route, not a breadcrumb trail
/// relays append to, and the router (not this module) is what restricts
/// forwarding to its prescribed path.
pub fn decide(mut packet: Packet, identity: &IdentityManager) -> (RelayAction, Option<Packet>) {
    if packet.ttl == 0 {
        return (RelayAction::Drop, None);
    }

    let is_broadcast = match &packet.recipient_id {
        None => true,
        Some(id) => id.is_broadcast(),
    };
    let addressed_to_us = match &packet.recipient_id {
        Some(id) => identity.owns_peer_id(id),
        None => false,
    };

    packet.ttl = packet.ttl.saturating_sub(1);

    if packet.ttl == 0 {
        // Still deliver locally if addressed to us — only forwarding stops
        // at TTL zero, not local delivery of the last hop.
        let action = if addressed_to_us || is_broadcast {
            RelayAction::DeliverLocal
        } else {
            RelayAction::Drop
        };
        return (action, None);
    }

    let should_forward = packet.packet_type != constants::PACKET_TYPE_NOISE_HANDSHAKE || is_broadcast;
    if !should_forward {
        // Unicast handshake/session traffic addressed to us is never
        // relayed further once it reaches its recipient, even mid-TTL.
        return (
            if addressed_to_us { RelayAction::DeliverLocal } else { RelayAction::Drop },
            None,
        );
    }

    match (addressed_to_us, is_broadcast) {
        (_, true) => (RelayAction::DeliverAndForward, Some(packet)),
        (true, false) => (RelayAction::DeliverLocal, None),
        (false, false) => (RelayAction::ForwardOnly, Some(packet)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::protocol::PeerId;
    use std::time::Duration;
    use uuid::Uuid;

    fn identity() -> IdentityManager {
        IdentityManager::new(
            Identity::generate(),
            false,
            "meshcore".into(),
            Uuid::from_u128(1),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    fn unicast_packet(recipient: PeerId, ttl: u8) -> Packet {
        Packet::new(constants::PACKET_TYPE_MESSAGE, PeerId::new([9; 8]), b"hi".to_vec())
            .with_recipient(recipient)
            .with_ttl(ttl)
    }

    fn broadcast_packet(ttl: u8) -> Packet {
        Packet::new(constants::PACKET_TYPE_MESSAGE, PeerId::new([9; 8]), b"hi".to_vec()).with_ttl(ttl)
    }

    #[test]
    fn ttl_zero_is_dropped_outright() {
        let mgr = identity();
        let pkt = broadcast_packet(0);
        let (action, _) = decide(pkt, &mgr);
        assert_eq!(action, RelayAction::Drop);
    }

    #[test]
    fn broadcast_is_delivered_and_forwarded() {
        let mgr = identity();
        let pkt = broadcast_packet(5);
        let (action, forwarded) = decide(pkt, &mgr);
        assert_eq!(action, RelayAction::DeliverAndForward);
        let forwarded = forwarded.unwrap();
        assert_eq!(forwarded.ttl, 4);
        assert!(forwarded.route.is_none());
    }

    #[test]
    fn explicit_route_passes_through_untouched() {
        let mgr = identity();
        let hops = vec![PeerId::new([1; 8]), PeerId::new([2; 8])];
        let pkt = unicast_packet(PeerId::new([77; 8]), 5).with_route(hops.clone());
        let (action, forwarded) = decide(pkt, &mgr);
        assert_eq!(action, RelayAction::ForwardOnly);
        assert_eq!(forwarded.unwrap().route, Some(hops));
    }

    #[test]
    fn unicast_to_self_is_delivered_only() {
        let mgr = identity();
        let pkt = unicast_packet(mgr.current_ephemeral_peer_id(), 5);
        let (action, forwarded) = decide(pkt, &mgr);
        assert_eq!(action, RelayAction::DeliverLocal);
        assert!(forwarded.is_none());
    }

    #[test]
    fn unicast_to_someone_else_is_forwarded_only() {
        let mgr = identity();
        let pkt = unicast_packet(PeerId::new([77; 8]), 5);
        let (action, forwarded) = decide(pkt, &mgr);
        assert_eq!(action, RelayAction::ForwardOnly);
        assert!(forwarded.is_some());
    }

    #[test]
    fn last_hop_still_delivers_locally_at_ttl_floor() {
        let mgr = identity();
        let pkt = unicast_packet(mgr.current_ephemeral_peer_id(), 1);
        let (action, forwarded) = decide(pkt, &mgr);
        assert_eq!(action, RelayAction::DeliverLocal);
        assert!(forwarded.is_none());
    }
}
