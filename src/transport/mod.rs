//! BLE engine (§2 "BLE engine", §4.5): scanner, advertiser, and the
//! paired central/peripheral GATT state machines.
//!
//! This module owns every direct interaction with the host BLE stack.
//! Everything above it — codec, dedup, fragmentation, Noise — only ever
//! sees [`TransportEvent`]s and hands back encoded frames to send; nothing
//! in [`crate::mesh`] or [`crate::session`] references btleplug types
//! directly.

pub mod central;
pub mod peripheral;
pub mod queue;

mod engine;

pub use engine::{BleEngine, BleEngineHandle};
pub use queue::BoundedDropOldestQueue;

use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::mesh::LinkRole;

/// Stable identifier for one physical device, derived from its platform
/// address. Distinct from [`crate::protocol::PeerId`], which is the
/// *wire-level* sender identity a device claims — `DeviceId` is what the
/// local BLE stack calls it, and is never sent over the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Derive a `DeviceId` from a platform address string (e.g. a MAC
    /// address or a platform-opaque peripheral identifier). Stable for the
    /// life of the process; btleplug's own `PeripheralId` is not `Copy` and
    /// doesn't fit the connection tracker's map key, so it is hashed down
    /// to a `u64` here once at the transport boundary.
    pub fn from_address(address: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        address.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Events the BLE engine delivers upward, toward the router (§4.7,
/// §9 "Dynamic callbacks and lambdas").
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A scan sighting; the connection tracker should weigh this for
    /// admission (§4.4 `register_scan_result`).
    ScanResult { device_id: DeviceId, rssi: i16 },
    /// A link finished connecting in the given role, with the negotiated MTU
    /// (central role only negotiates; peripheral role reports the link MTU
    /// once the central has requested one).
    LinkConnected { device_id: DeviceId, role: LinkRole, mtu: u16 },
    /// Central-role only: CCCD subscription acknowledged, link now usable.
    LinkSubscribed { device_id: DeviceId },
    /// A link went away. `immediate` distinguishes an abrupt loss (BLE
    /// status 147-equivalent) from a clean disconnect, which callers delay
    /// briefly before applying (§4.5 failure policy).
    LinkDisconnected { device_id: DeviceId, role: LinkRole, immediate: bool },
    /// Raw bytes arrived on a link — a central-role notification or a
    /// peripheral-role write. Handed to `codec::decode` by the router.
    FrameReceived { device_id: DeviceId, role: LinkRole, bytes: Vec<u8> },
    /// An RSSI refresh for an already-connected link (§4.5 "RSSI refresh is
    /// issued to every peer every N seconds").
    RssiUpdated { device_id: DeviceId, rssi: i16 },
}

/// The abstract upward interface the BLE engine calls through. Registered
/// once at router startup and held as a weak back-reference so the
/// engine→router→engine cycle never becomes an ownership cycle (§9 "Cyclic
/// references").
#[async_trait]
pub trait RouterSink: Send + Sync {
    async fn on_transport_event(&self, event: TransportEvent);
}
