//! Router facade (§4.7): the mesh core's single public entry point, wiring
//! the codec, fragment engine, Noise session manager, relay/dedup, the
//! connection tracker and the BLE engine into one send/receive pipeline.
//!
//! Implements [`RouterSink`] to consume events from the BLE engine directly
//! (§9 "the engine calls up through an abstract `RouterSink`"); external
//! collaborators instead go through [`Router::subscribe`] /
//! [`Router::on_receive`] and the `send_private`/`broadcast` operations.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::{Identity, IdentityManager, StaticFingerprint};
use crate::error::{Error, Result};
use crate::fragment::ReassemblyTable;
use crate::protocol::{self, constants, EncodeOptions, Packet, PeerId};
use crate::session::{HandshakeStep, NoiseSessionManager, SessionState};
use crate::transport::{BleEngine, BleEngineHandle, DeviceId, RouterSink, TransportEvent};

use super::connection_tracker::{ConnectionTracker, LinkId, LinkRole};
use super::relay::{self, RelayAction};
use super::seen_cache::{seen_key, SeenCache};

/// Bytes of fragmentation-decision overhead subtracted from the MTU target
/// (§4.2 "a complete encoded packet exceeds `mtu - framing_overhead`").
const FRAGMENTATION_TRIGGER_OVERHEAD: usize = 24;

/// Opaque handle returned by `send_private`/`broadcast`, usable with
/// [`Router::cancel`] to abort any fragments not yet handed to the BLE
/// engine (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

/// A fully decoded, (if applicable) decrypted application-level payload
/// (§4.7 `on_receive`, §9 "`on_packet(PacketEvent)`").
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub packet_type: u8,
    pub sender_peer_id: PeerId,
    pub sender_fingerprint: Option<StaticFingerprint>,
    pub plaintext: Vec<u8>,
}

/// Peer lifecycle/session events delivered alongside packet events (§9
/// "`on_peer(PeerEvent)` variants").
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LinkConnected { device_id: DeviceId, role: LinkRole },
    LinkDisconnected { device_id: DeviceId, role: LinkRole },
    SessionEstablished { fingerprint: StaticFingerprint },
    SessionFailed { fingerprint: StaticFingerprint },
}

type MessageCallback = dyn Fn(PacketEvent) + Send + Sync;
type PeerEventCallback = dyn Fn(PeerEvent) + Send + Sync;

/// The `Core` context (§9 "a single `Core` context object that owns all
/// long-lived state; no process-wide mutable globals"). One instance per
/// running node.
pub struct Router {
    config: Config,
    nickname: RwLock<String>,
    identity: IdentityManager,
    noise: NoiseSessionManager,
    tracker: Arc<ConnectionTracker>,
    seen: Mutex<SeenCache>,
    reassembly: ReassemblyTable,
    ble: Arc<BleEngine>,
    valid_uuids: Arc<RwLock<HashSet<Uuid>>>,
    /// Learned only from completed Noise handshakes (§4.3): the mesh core
    /// has no identity-verified announce, so `send_private` can only reach
    /// peers whose current ephemeral ID a handshake has already resolved.
    known_peers: DashMap<StaticFingerprint, PeerId>,
    peer_fingerprints: DashMap<PeerId, StaticFingerprint>,
    pending_initiations: DashMap<PeerId, StaticFingerprint>,
    /// Most recent link a given peer ID's traffic arrived over. Used to
    /// resolve the next hop of a source-routed packet to an actual link;
    /// an approximation (the route's neighbor could have reconnected on a
    /// different link since), good enough for best-effort source routing.
    neighbor_links: DashMap<PeerId, LinkId>,
    cancelled_transfers: DashSet<u64>,
    next_transfer: AtomicU64,
    on_message: ArcSwapOption<MessageCallback>,
    on_peer_event: ArcSwapOption<PeerEventCallback>,
    self_weak: OnceCell<Weak<Router>>,
}

impl Router {
    pub fn new(identity: Identity, config: Config, tracker: Arc<ConnectionTracker>, ble: Arc<BleEngine>) -> Self {
        let identity_manager = IdentityManager::new(
            identity.clone(),
            config.rotation_enabled,
            config.service_uuid_prefix.clone(),
            config.legacy_service_uuid,
            config.rotation_bucket,
            config.rotation_overlap,
        );
        let valid_uuids = Arc::new(RwLock::new(identity_manager.valid_service_uuid_set()));
        let seen = SeenCache::new(config.seen_cache_capacity, config.seen_cache_ttl);
        let reassembly = ReassemblyTable::new(config.reassembly_timeout);
        let nickname = config.nickname.clone();
        let noise = NoiseSessionManager::new(identity, config.handshake_timeout);

        Self {
            nickname: RwLock::new(nickname),
            identity: identity_manager,
            noise,
            tracker,
            seen: Mutex::new(seen),
            reassembly,
            ble,
            valid_uuids,
            known_peers: DashMap::new(),
            peer_fingerprints: DashMap::new(),
            pending_initiations: DashMap::new(),
            neighbor_links: DashMap::new(),
            cancelled_transfers: DashSet::new(),
            next_transfer: AtomicU64::new(0),
            on_message: ArcSwapOption::empty(),
            on_peer_event: ArcSwapOption::empty(),
            self_weak: OnceCell::new(),
            config,
        }
    }

    /// Wrap in an `Arc` and wire up the weak self-reference the BLE engine
    /// needs handed back as a [`RouterSink`] (§9 "Cyclic references ... are
    /// broken by making the delegate a weak back-reference interface").
    pub fn into_shared(self) -> Arc<Self> {
        let router = Arc::new(self);
        let _ = router.self_weak.set(Arc::downgrade(&router));
        router
    }

    fn as_sink(&self) -> Option<Arc<dyn RouterSink>> {
        self.self_weak.get()?.upgrade().map(|router| router as Arc<dyn RouterSink>)
    }

    /// Register the callbacks invoked for received packets and peer events
    /// (§6 `subscribe(on_message_fn, on_peer_event_fn)`). Replaces any
    /// previously registered callbacks.
    pub fn subscribe(
        &self,
        on_message: impl Fn(PacketEvent) + Send + Sync + 'static,
        on_peer_event: impl Fn(PeerEvent) + Send + Sync + 'static,
    ) {
        self.on_message.store(Some(Arc::new(on_message) as Arc<MessageCallback>));
        self.on_peer_event.store(Some(Arc::new(on_peer_event) as Arc<PeerEventCallback>));
    }

    /// Convenience form matching §4.7's `on_receive(callback)`, invoked with
    /// `(packet_type, sender_fingerprint, plaintext_bytes)`. Shares the same
    /// underlying dispatch as [`Self::subscribe`]; peer events are dropped
    /// for callers that only want this narrower signature.
    pub fn on_receive(&self, callback: impl Fn(u8, Option<StaticFingerprint>, Vec<u8>) + Send + Sync + 'static) {
        self.on_message.store(Some(Arc::new(move |event: PacketEvent| {
            callback(event.packet_type, event.sender_fingerprint, event.plaintext);
        }) as Arc<MessageCallback>));
    }

    /// Begin scan + advertise loops and the background maintenance tasks
    /// (handshake/reassembly reapers, rotation) (§6 `start(config)`).
    pub async fn start(self: &Arc<Self>) -> Result<BleEngineHandle> {
        let initial_service_uuid = self.identity.current_service_uuid();
        let sink = self.as_sink().ok_or_else(|| Error::InvalidState("router must be shared via into_shared before start".into()))?;
        let handle = self.ble.start(&self.config, initial_service_uuid, self.valid_uuids.clone(), sink).await?;
        self.spawn_maintenance_tasks();
        info!(nickname = %self.config.nickname, "router started");
        Ok(handle)
    }

    /// Drain and close all links (§6 `stop()`).
    pub async fn stop(&self) {
        self.ble.stop().await;
    }

    fn spawn_maintenance_tasks(self: &Arc<Self>) {
        let reaper = self.clone();
        tokio::spawn(
            async move {
                let mut ticker = interval(Duration::from_secs(5));
                loop {
                    ticker.tick().await;
                    reaper.noise.reap_expired_handshakes();
                    reaper.reassembly.reap_expired().await;
                    reaper.tracker.prune_stale_discoveries(Duration::from_secs(120));
                }
            }
            .instrument(info_span!("maintenance_reaper")),
        );

        let rotation = self.clone();
        tokio::spawn(
            async move {
                let mut ticker = interval(Duration::from_secs(60));
                let mut last_uuid = rotation.identity.current_service_uuid();
                loop {
                    ticker.tick().await;
                    *rotation.valid_uuids.write().await = rotation.identity.valid_service_uuid_set();
                    let current = rotation.identity.current_service_uuid();
                    if current != last_uuid {
                        if let Err(err) = rotation.ble.rotate_advertised_uuid(current).await {
                            warn!(?err, "service uuid rotation failed");
                        }
                        last_uuid = current;
                    }
                }
            }
            .instrument(info_span!("rotation")),
        );
    }

    /// Obtain/establish a Noise session and send an encrypted payload (§4.7
    /// `send_private`). If no session exists yet, this initiates a
    /// handshake and returns an error asking the caller to retry once
    /// [`PeerEvent::SessionEstablished`] fires — payload bytes are never
    /// buffered past the handshake, consistent with best-effort delivery.
    pub async fn send_private(&self, fingerprint: StaticFingerprint, payload: Vec<u8>) -> Result<TransferHandle> {
        match self.noise.state_of(&fingerprint) {
            SessionState::Established => {
                let peer_id = self.peer_id_for(&fingerprint)?;
                let ciphertext = self.noise.encrypt(&fingerprint, &payload)?;
                let packet = Packet::new(constants::PACKET_TYPE_NOISE_ENCRYPTED, self.identity.current_ephemeral_peer_id(), ciphertext)
                    .with_recipient(peer_id)
                    .with_ttl(self.config.default_ttl);
                self.dispatch_outbound(packet, None).await
            }
            SessionState::Handshaking => Err(Error::InvalidState("noise handshake in progress, retry after SessionEstablished".into())),
            SessionState::Failed => {
                self.noise.drop_session(&fingerprint);
                self.begin_handshake(fingerprint).await
            }
            SessionState::None => self.begin_handshake(fingerprint).await,
        }
    }

    async fn begin_handshake(&self, fingerprint: StaticFingerprint) -> Result<TransferHandle> {
        let peer_id = self.peer_id_for(&fingerprint)?;
        let message = self.noise.initiate(fingerprint, peer_id)?;
        self.pending_initiations.insert(peer_id, fingerprint);
        let packet = Packet::new(constants::PACKET_TYPE_NOISE_HANDSHAKE, self.identity.current_ephemeral_peer_id(), message)
            .with_recipient(peer_id)
            .with_ttl(self.config.default_ttl);
        self.dispatch_outbound(packet, None).await?;
        Err(Error::InvalidState("noise handshake initiated, retry send after session established".into()))
    }

    fn peer_id_for(&self, fingerprint: &StaticFingerprint) -> Result<PeerId> {
        self.known_peers.get(fingerprint).map(|entry| *entry).ok_or(Error::SessionNotFound)
    }

    /// Broadcast a plaintext payload to every reachable link (§4.7
    /// `broadcast`).
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<TransferHandle> {
        let packet = Packet::new(constants::PACKET_TYPE_MESSAGE, self.identity.current_ephemeral_peer_id(), payload)
            .with_ttl(self.config.default_ttl);
        self.dispatch_outbound(packet, None).await
    }

    /// Trigger a fresh, self-signed `announce` packet carrying the new
    /// nickname and the node's verifying key (§6 `set_nickname`, §3
    /// `has_signature`). The signature proves possession of the signing
    /// key embedded in the same payload; it is not a claim anyone else has
    /// to trust (see [`crate::protocol::announce`]).
    pub async fn set_nickname(&self, nickname: impl Into<String>) -> Result<TransferHandle> {
        let nickname = nickname.into();
        if nickname.len() > 64 {
            return Err(Error::InvalidData("nickname exceeds 64 bytes".into()));
        }
        *self.nickname.write().await = nickname.clone();

        let signing_key = &self.identity.identity().signing_key;
        let payload = protocol::announce::encode(&signing_key.verifying_key(), &nickname);
        let mut packet = Packet::new(constants::PACKET_TYPE_ANNOUNCE, self.identity.current_ephemeral_peer_id(), payload)
            .with_ttl(self.config.default_ttl);
        let preimage = protocol::encode_for_signing(&packet)?;
        packet = packet.with_signature(signing_key.sign(&preimage).to_bytes());

        self.dispatch_outbound(packet, None).await
    }

    /// Abort any fragments of `handle` not yet handed to the BLE engine
    /// (§6 `cancel`).
    pub fn cancel(&self, handle: TransferHandle) {
        self.cancelled_transfers.insert(handle.0);
    }

    async fn dispatch_outbound(&self, packet: Packet, exclude: Option<LinkId>) -> Result<TransferHandle> {
        let handle = TransferHandle(self.next_transfer.fetch_add(1, Ordering::Relaxed));
        let encoded = protocol::encode(&packet, EncodeOptions::default())?;

        let frames: Vec<Vec<u8>> = if encoded.len() > (self.config.mtu_target as usize).saturating_sub(FRAGMENTATION_TRIGGER_OVERHEAD) {
            crate::fragment::split(&encoded, packet.packet_type, self.config.mtu_target, packet.sender_id, packet.ttl)
                .into_iter()
                .map(|fragment| protocol::encode(&fragment, EncodeOptions::default()))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![encoded]
        };

        let links = self.tracker.best_links(usize::MAX);
        'links: for (link_id, _rssi) in links {
            if Some(link_id) == exclude {
                continue;
            }
            for frame in &frames {
                if self.cancelled_transfers.remove(&handle.0).is_some() {
                    break 'links;
                }
                self.ble.enqueue(DeviceId(link_id.device_id), link_id.role, frame.clone());
                tokio::task::yield_now().await;
            }
        }
        Ok(handle)
    }

    /// Resolve the next hop of a source-routed packet to a link to send on.
    /// Finds this node's own position in the route and returns the link
    /// last known for whichever peer ID follows it — the final recipient's
    /// link if this node is the last listed hop. `None` if this node isn't
    /// on the prescribed path or the next hop's link isn't known.
    fn next_hop_link(&self, packet: &Packet) -> Option<LinkId> {
        let route = packet.route.as_ref()?;
        let position = route.iter().position(|hop| self.identity.owns_peer_id(hop))?;
        let next_id = match route.get(position + 1) {
            Some(next) => *next,
            None => packet.recipient_id?,
        };
        self.neighbor_links.get(&next_id).map(|entry| *entry)
    }

    fn relay_forward<'a>(&'a self, packet: Packet, source: LinkId) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let encoded = match protocol::encode(&packet, EncodeOptions::default()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(?err, "re-encode for relay failed");
                    return;
                }
            };

            if packet.has_route() {
                // Source-route mode: forward only along the prescribed
                // path, never flood (§4.6).
                match self.next_hop_link(&packet) {
                    Some(link_id) if link_id != source => {
                        self.ble.enqueue(DeviceId(link_id.device_id), link_id.role, encoded);
                    }
                    Some(_) => debug!("next hop on source route is the link the packet arrived on, dropping"),
                    None => debug!(sender = %packet.sender_id, "next hop on source route is unknown, dropping"),
                }
                return;
            }

            for (link_id, _rssi) in self.tracker.best_links(usize::MAX) {
                if link_id == source {
                    continue;
                }
                self.ble.enqueue(DeviceId(link_id.device_id), link_id.role, encoded.clone());
            }
        })
    }

    /// Dedup, decrement-TTL, deliver-and/or-forward pipeline shared by
    /// every inbound packet type (§4.6). Boxed because fragment reassembly
    /// re-feeds the reconstructed inner frame back through this same
    /// pipeline (§4.2), which would otherwise make the future infinitely
    /// sized.
    fn process_inbound<'a>(&'a self, packet: Packet, source: LinkId) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.neighbor_links.insert(packet.sender_id, source);

            let key = seen_key(&packet.sender_id, packet.timestamp, &packet.payload);
            if self.seen.lock().check_and_insert(key) {
                return;
            }

            let (action, forward) = relay::decide(packet.clone(), &self.identity);

            if matches!(action, RelayAction::DeliverLocal | RelayAction::DeliverAndForward) {
                self.deliver_local(packet, source).await;
            } else if matches!(action, RelayAction::Drop) {
                return;
            }

            if let Some(forward_packet) = forward {
                self.relay_forward(forward_packet, source).await;
            }
        })
    }

    async fn deliver_local(&self, packet: Packet, source: LinkId) {
        match packet.packet_type {
            constants::PACKET_TYPE_NOISE_HANDSHAKE => self.handle_handshake_message(packet).await,
            constants::PACKET_TYPE_NOISE_ENCRYPTED => self.handle_encrypted_message(packet),
            constants::PACKET_TYPE_FRAGMENT => self.handle_fragment(packet, source).await,
            constants::PACKET_TYPE_ANNOUNCE => self.handle_announce(packet),
            _ => self.emit_message(PacketEvent {
                packet_type: packet.packet_type,
                sender_peer_id: packet.sender_id,
                sender_fingerprint: self.peer_fingerprints.get(&packet.sender_id).map(|entry| *entry),
                plaintext: packet.payload,
            }),
        }
    }

    async fn handle_fragment(&self, packet: Packet, source: LinkId) {
        match self.reassembly.on_fragment(packet.sender_id, &packet.payload).await {
            Ok(Some(reassembled)) => match protocol::decode(&reassembled.bytes) {
                Ok(inner) => self.process_inbound(inner, source).await,
                Err(err) => debug!(?err, "reassembled frame failed to decode"),
            },
            Ok(None) => {}
            Err(err) => debug!(?err, "fragment rejected"),
        }
    }

    async fn handle_handshake_message(&self, packet: Packet) {
        let peer_ephemeral_id = packet.sender_id;
        let own_id = self.identity.current_ephemeral_peer_id();
        let expected_fingerprint = self.pending_initiations.get(&peer_ephemeral_id).map(|entry| *entry);

        let step = match self.noise.handle_message(peer_ephemeral_id, expected_fingerprint, &packet.payload) {
            Ok(step) => Some(step),
            Err(Error::SessionNotFound) => match self.noise.accept_first_message(own_id, peer_ephemeral_id, &packet.payload) {
                Ok(Some(reply)) => Some(HandshakeStep::Reply(reply)),
                Ok(None) => None,
                Err(err) => {
                    warn!(?err, "handshake accept failed");
                    None
                }
            },
            Err(err) => {
                warn!(?err, "handshake advance failed");
                None
            }
        };

        match step {
            Some(HandshakeStep::Reply(message)) => {
                let out = Packet::new(constants::PACKET_TYPE_NOISE_HANDSHAKE, own_id, message)
                    .with_recipient(peer_ephemeral_id)
                    .with_ttl(self.config.default_ttl);
                let _ = self.dispatch_outbound(out, None).await;
            }
            Some(HandshakeStep::Established { fingerprint, final_message }) => {
                self.known_peers.insert(fingerprint, peer_ephemeral_id);
                self.peer_fingerprints.insert(peer_ephemeral_id, fingerprint);
                self.pending_initiations.remove(&peer_ephemeral_id);
                if let Some(message) = final_message {
                    let out = Packet::new(constants::PACKET_TYPE_NOISE_HANDSHAKE, own_id, message)
                        .with_recipient(peer_ephemeral_id)
                        .with_ttl(self.config.default_ttl);
                    let _ = self.dispatch_outbound(out, None).await;
                }
                info!(?fingerprint, "noise session established");
                self.emit_peer_event(PeerEvent::SessionEstablished { fingerprint });
            }
            None => {}
        }
    }

    fn handle_encrypted_message(&self, packet: Packet) {
        let Some(fingerprint) = self.peer_fingerprints.get(&packet.sender_id).map(|entry| *entry) else {
            debug!(sender = %packet.sender_id, "noise_encrypted packet from unknown peer, dropping");
            return;
        };
        match self.noise.decrypt(&fingerprint, &packet.payload) {
            Ok(plaintext) => self.emit_message(PacketEvent {
                packet_type: constants::PACKET_TYPE_NOISE_ENCRYPTED,
                sender_peer_id: packet.sender_id,
                sender_fingerprint: Some(fingerprint),
                plaintext,
            }),
            Err(err) => {
                warn!(?err, sender = %packet.sender_id, "decrypt failed");
                if self.noise.state_of(&fingerprint) == SessionState::Failed {
                    self.emit_peer_event(PeerEvent::SessionFailed { fingerprint });
                }
            }
        }
    }

    fn handle_announce(&self, packet: Packet) {
        let (verifying_key, nickname) = match protocol::announce::decode(&packet.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(?err, sender = %packet.sender_id, "malformed announce payload, dropping");
                return;
            }
        };

        if let Some(signature) = packet.signature {
            let signature = ed25519_dalek::Signature::from_bytes(&signature);
            let preimage = match protocol::encode_for_signing(&packet) {
                Ok(preimage) => preimage,
                Err(err) => {
                    debug!(?err, sender = %packet.sender_id, "could not rebuild announce preimage");
                    return;
                }
            };
            if crate::crypto::SigningKeypair::verify(&verifying_key, &preimage, &signature).is_err() {
                warn!(sender = %packet.sender_id, "announce signature did not verify, dropping");
                return;
            }
        }

        self.emit_message(PacketEvent {
            packet_type: packet.packet_type,
            sender_peer_id: packet.sender_id,
            sender_fingerprint: self.peer_fingerprints.get(&packet.sender_id).map(|entry| *entry),
            plaintext: nickname.into_bytes(),
        });
    }

    fn emit_message(&self, event: PacketEvent) {
        if let Some(callback) = self.on_message.load_full() {
            callback(event);
        }
    }

    fn emit_peer_event(&self, event: PeerEvent) {
        if let Some(callback) = self.on_peer_event.load_full() {
            callback(event);
        }
    }
}

#[async_trait]
impl RouterSink for Router {
    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ScanResult { device_id, rssi } => {
                self.tracker.register_scan_result(device_id.0, rssi);
                if self.tracker.is_connect_allowed(device_id.0, self.config.power_profile) {
                    self.tracker.begin_attempt(device_id.0);
                    if let Some(sink) = self.as_sink() {
                        let ble = self.ble.clone();
                        tokio::spawn(async move {
                            if let Err(err) = ble.connect_known_device(device_id, sink).await {
                                warn!(?device_id, ?err, "admission-approved connect failed");
                            }
                        });
                    }
                }
            }
            TransportEvent::LinkConnected { device_id, role, mtu } => {
                self.tracker.mark_connected(LinkId { device_id: device_id.0, role });
                info!(?device_id, ?role, mtu, "link connected");
                self.emit_peer_event(PeerEvent::LinkConnected { device_id, role });
            }
            TransportEvent::LinkSubscribed { device_id } => {
                self.tracker.mark_subscribed(LinkId { device_id: device_id.0, role: LinkRole::Central });
            }
            TransportEvent::LinkDisconnected { device_id, role, immediate } => {
                self.tracker.mark_disconnected(LinkId { device_id: device_id.0, role }, immediate);
                self.emit_peer_event(PeerEvent::LinkDisconnected { device_id, role });
            }
            TransportEvent::RssiUpdated { device_id, rssi } => {
                self.tracker.register_scan_result(device_id.0, rssi);
            }
            TransportEvent::FrameReceived { device_id, role, bytes } => {
                let source = LinkId { device_id: device_id.0, role };
                match protocol::decode(&bytes) {
                    Ok(packet) => self.process_inbound(packet, source).await,
                    Err(err) => debug!(?err, ?device_id, "dropping malformed frame"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PowerProfile;

    fn test_config() -> Config {
        Config {
            nickname: "tester".into(),
            power_profile: PowerProfile::Balanced,
            ..Config::default()
        }
    }

    fn test_router() -> Arc<Router> {
        let identity = Identity::generate();
        let config = test_config();
        let tracker = Arc::new(ConnectionTracker::new());
        let ble = Arc::new(BleEngine::new(Arc::new(crate::transport::peripheral::UnsupportedPeripheral), config.mtu_target));
        Router::new(identity, config, tracker, ble).into_shared()
    }

    #[tokio::test]
    async fn broadcast_without_links_still_returns_a_handle() {
        let router = test_router();
        let handle = router.broadcast(b"hello mesh".to_vec()).await.unwrap();
        router.cancel(handle);
    }

    #[tokio::test]
    async fn send_private_to_unknown_peer_is_rejected() {
        let router = test_router();
        let fingerprint = [7u8; 32];
        let err = router.send_private(fingerprint, b"hi".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound));
    }

    #[tokio::test]
    async fn nickname_over_64_bytes_is_rejected() {
        let router = test_router();
        let long = "x".repeat(65);
        let err = router.set_nickname(long).await.unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[tokio::test]
    async fn set_nickname_produces_a_self_consistent_signed_announce() {
        let router = test_router();
        let handle = router.set_nickname("trinity").await.unwrap();
        router.cancel(handle);

        let signing_key = &router.identity.identity().signing_key;
        let payload = protocol::announce::encode(&signing_key.verifying_key(), "trinity");
        let packet = Packet::new(constants::PACKET_TYPE_ANNOUNCE, router.identity.current_ephemeral_peer_id(), payload)
            .with_ttl(router.config.default_ttl);
        let preimage = protocol::encode_for_signing(&packet).unwrap();
        let signature = signing_key.sign(&preimage);

        let (verifying_key, nickname) = protocol::announce::decode(&packet.payload).unwrap();
        assert_eq!(nickname, "trinity");
        assert!(crate::crypto::SigningKeypair::verify(&verifying_key, &preimage, &signature).is_ok());
    }

    #[test]
    fn next_hop_link_resolves_via_last_seen_neighbor() {
        let router = test_router();
        let next_hop = PeerId::new([42; 8]);
        let link = LinkId { device_id: 9, role: LinkRole::Central };
        router.neighbor_links.insert(next_hop, link);

        let packet = Packet::new(constants::PACKET_TYPE_MESSAGE, PeerId::new([1; 8]), b"hi".to_vec())
            .with_recipient(PeerId::new([2; 8]))
            .with_route(vec![router.identity.current_ephemeral_peer_id(), next_hop]);

        assert_eq!(router.next_hop_link(&packet), Some(link));
    }

    #[test]
    fn next_hop_link_is_none_when_self_not_on_route() {
        let router = test_router();
        let packet = Packet::new(constants::PACKET_TYPE_MESSAGE, PeerId::new([1; 8]), b"hi".to_vec())
            .with_recipient(PeerId::new([2; 8]))
            .with_route(vec![PeerId::new([5; 8]), PeerId::new([6; 8])]);

        assert!(router.next_hop_link(&packet).is_none());
    }

    #[test]
    fn next_hop_link_is_none_when_neighbor_unknown() {
        let router = test_router();
        let packet = Packet::new(constants::PACKET_TYPE_MESSAGE, PeerId::new([1; 8]), b"hi".to_vec())
            .with_recipient(PeerId::new([2; 8]))
            .with_route(vec![router.identity.current_ephemeral_peer_id(), PeerId::new([42; 8])]);

        assert!(router.next_hop_link(&packet).is_none());
    }
}
