//! Central role: scanner plus the connect → discover → subscribe GATT
//! state machine (§4.5 "Scanner", "Central-role GATT").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeviceId, RouterSink, TransportEvent};
use crate::error::{Error, Result};
use crate::mesh::LinkRole;

/// Shared cache of `DeviceId -> Peripheral` handles for devices seen on the
/// current scan, so a later admission decision (made asynchronously, after
/// consulting the connection tracker) can still reach the peripheral handle
/// the scan callback saw (§4.5 "call `connection_tracker.is_connect_allowed`,
/// then initiate a central-role connection").
pub type DiscoveredPeripherals = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

/// The one well-known characteristic under the service UUID, used for both
/// writes (central → peripheral) and notifications (peripheral → central)
/// (§6 "BLE service surface").
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56781234ABCD);

/// Runs the continuous scan loop and, per §4.5, restarts it periodically to
/// work around stacks that silently stall delivery, while never starting a
/// new scan within `min_scan_interval` of the last one.
pub struct Scanner {
    adapter: Adapter,
    valid_uuids: Arc<RwLock<HashSet<Uuid>>>,
    discovered: DiscoveredPeripherals,
    rssi_threshold: i16,
    restart_interval: Duration,
    min_scan_interval: Duration,
}

impl Scanner {
    pub fn new(
        adapter: Adapter,
        valid_uuids: Arc<RwLock<HashSet<Uuid>>>,
        discovered: DiscoveredPeripherals,
        rssi_threshold: i16,
        restart_interval: Duration,
        min_scan_interval: Duration,
    ) -> Self {
        Self {
            adapter,
            valid_uuids,
            discovered,
            rssi_threshold,
            restart_interval,
            min_scan_interval,
        }
    }

    /// Drive the scanner until `stop` resolves. Emits [`TransportEvent::ScanResult`]
    /// for every sighting that passes the RSSI threshold; admission beyond
    /// that (dedup against already-connected/pending) is the connection
    /// tracker's job, invoked by [`super::engine::BleEngine`].
    pub async fn run(&self, sink: Arc<dyn RouterSink>, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }

            if let Err(err) = self.start_scan_both_filtered_and_unfiltered().await {
                warn!(?err, "scan start failed, backing off before retry");
                sleep(Duration::from_secs(10)).await;
                continue;
            }

            let mut events = match self.adapter.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!(?err, "could not subscribe to adapter events");
                    sleep(self.min_scan_interval).await;
                    continue;
                }
            };

            let restart_at = tokio::time::Instant::now() + self.restart_interval;
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        let _ = self.adapter.stop_scan().await;
                        return;
                    }
                    _ = tokio::time::sleep_until(restart_at) => {
                        debug!("restarting scan to work around stalled-delivery BLE stacks");
                        break;
                    }
                    event = events.next() => {
                        match event {
                            Some(event) => self.handle_event(event, &sink).await,
                            None => break,
                        }
                    }
                }
            }

            let _ = self.adapter.stop_scan().await;
            sleep(self.min_scan_interval).await;
        }
    }

    /// Applies a service-UUID filter for the valid set, and also starts an
    /// unfiltered scan as a fallback since some stacks drop filtered
    /// results (§4.5).
    async fn start_scan_both_filtered_and_unfiltered(&self) -> Result<()> {
        let uuids: Vec<Uuid> = self.valid_uuids.read().await.iter().copied().collect();
        let filter = if uuids.is_empty() {
            ScanFilter::default()
        } else {
            ScanFilter { services: uuids }
        };
        self.adapter.start_scan(filter).await.map_err(Error::Ble)
    }

    async fn handle_event(&self, event: CentralEvent, sink: &Arc<dyn RouterSink>) {
        if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                return;
            };
            let Ok(Some(properties)) = peripheral.properties().await else {
                return;
            };
            let rssi = properties.rssi.unwrap_or(i16::MIN);
            if rssi < self.rssi_threshold {
                return;
            }
            let device_id = DeviceId::from_address(&properties.address.to_string());
            self.discovered.write().await.insert(device_id, peripheral);
            sink.on_transport_event(TransportEvent::ScanResult { device_id, rssi }).await;
        }
    }
}

/// Drives one central-role GATT connection to completion: connect, request
/// MTU, discover services, subscribe to notifications. Only after CCCD
/// acknowledgment does the link become usable (§4.5).
pub async fn connect_and_subscribe(
    peripheral: Peripheral,
    device_id: DeviceId,
    mtu_target: u16,
    sink: Arc<dyn RouterSink>,
) -> Result<()> {
    peripheral.connect().await.map_err(|e| Error::LinkConnectFailed(e.to_string()))?;

    // btleplug negotiates the ATT MTU internally on supported platforms;
    // the target is recorded for the fragment engine's chunk sizing even
    // where the stack doesn't expose the negotiated value directly.
    let mtu = mtu_target;

    peripheral
        .discover_services()
        .await
        .map_err(|e| Error::LinkConnectFailed(e.to_string()))?;

    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == CHARACTERISTIC_UUID)
        .ok_or_else(|| Error::LinkConnectFailed("characteristic not found".into()))?;

    peripheral
        .subscribe(&characteristic)
        .await
        .map_err(|e| Error::LinkSubscribeFailed(e.to_string()))?;

    sink.on_transport_event(TransportEvent::LinkConnected {
        device_id,
        role: LinkRole::Central,
        mtu,
    })
    .await;
    sink.on_transport_event(TransportEvent::LinkSubscribed { device_id }).await;
    info!(?device_id, mtu, "central link subscribed and usable");

    let mut notifications = peripheral
        .notifications()
        .await
        .map_err(|e| Error::LinkConnectFailed(e.to_string()))?;

    while let Some(notification) = notifications.next().await {
        sink.on_transport_event(TransportEvent::FrameReceived {
            device_id,
            role: LinkRole::Central,
            bytes: notification.value,
        })
        .await;
    }

    // The notification stream ended: the peer disconnected (or the link
    // dropped from under us). Whether this was clean or abrupt isn't
    // distinguishable from here, so callers treat it as abrupt per §4.5's
    // conservative default (no artificial 500ms grace on a stream that's
    // already gone quiet).
    sink.on_transport_event(TransportEvent::LinkDisconnected {
        device_id,
        role: LinkRole::Central,
        immediate: true,
    })
    .await;

    Ok(())
}

/// Write a frame to a connected central-role link.
pub async fn write_frame(peripheral: &Peripheral, bytes: &[u8]) -> Result<()> {
    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == CHARACTERISTIC_UUID)
        .ok_or_else(|| Error::LinkConnectFailed("characteristic not found".into()))?;

    peripheral
        .write(&characteristic, bytes, WriteType::WithoutResponse)
        .await
        .map_err(|e| Error::LinkConnectFailed(e.to_string()))
}
