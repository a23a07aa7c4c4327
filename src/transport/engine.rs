//! BLE engine orchestration (§2 "BLE engine", §4.5, §5 concurrency model).
//!
//! Owns one dedicated task per long-lived loop (scanner, advertiser
//! rotation, RSSI poller) plus one task per active central-role link, all
//! observing a single stop signal. BLE callbacks are already serialized by
//! `btleplug`'s own event stream, so nothing here calls back into the BLE
//! stack from inside an event handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _};
use btleplug::platform::{Manager, Peripheral};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::central::{self, DiscoveredPeripherals, Scanner};
use super::peripheral::PeripheralBackend;
use super::queue::BoundedDropOldestQueue;
use super::{DeviceId, RouterSink, TransportEvent};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mesh::LinkRole;

const OUTBOUND_QUEUE_CAPACITY: usize = 64;
const RSSI_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Handle returned by [`BleEngine::start`]; dropping it does not stop the
/// engine — call [`BleEngine::stop`] explicitly so the stop signal reaches
/// every task (§5 "a single stop signal").
pub struct BleEngineHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl BleEngineHandle {
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Runs the scanner, advertiser, and per-link GATT state machines for one
/// node. Constructed once at `Core::start` and held for the life of the
/// process (§9 "Global state" maps to a single owning context, not
/// singletons).
pub struct BleEngine {
    stop_tx: watch::Sender<bool>,
    central_peripherals: RwLock<HashMap<DeviceId, Peripheral>>,
    discovered: DiscoveredPeripherals,
    outbound_queues: SyncRwLock<HashMap<DeviceId, Arc<BoundedDropOldestQueue<Vec<u8>>>>>,
    peripheral_backend: Arc<dyn PeripheralBackend>,
    mtu_target: u16,
}

impl BleEngine {
    fn drain_queue_for(self: &Arc<Self>, device_id: DeviceId, role: LinkRole, queue: Arc<BoundedDropOldestQueue<Vec<u8>>>) {
        let engine = self.clone();
        let mut stop = engine.stop_tx.subscribe();
        let span = info_span!("outbound_drain", ?device_id, ?role);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => return,
                        bytes = queue.recv() => {
                            if let Err(err) = engine.send(device_id, role, bytes).await {
                                warn!(?err, "outbound frame delivery failed, link likely gone");
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
    }
}

impl BleEngine {
    /// Construct the engine without starting any background task; callers
    /// invoke [`Self::start`] once the router sink is ready to receive
    /// events, breaking the engine→router init-order cycle (§9).
    pub fn new(peripheral_backend: Arc<dyn PeripheralBackend>, mtu_target: u16) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            stop_tx,
            central_peripherals: RwLock::new(HashMap::new()),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            outbound_queues: SyncRwLock::new(HashMap::new()),
            peripheral_backend,
            mtu_target,
        }
    }

    /// Begin scan + advertise loops (§6 `start(config)`).
    pub async fn start(
        &self,
        config: &Config,
        initial_service_uuid: Uuid,
        valid_uuids: Arc<RwLock<std::collections::HashSet<Uuid>>>,
        sink: Arc<dyn RouterSink>,
    ) -> Result<BleEngineHandle> {
        let manager = Manager::new().await.map_err(Error::Ble)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Ble)?
            .into_iter()
            .next()
            .ok_or(Error::BleUnavailable)?;

        let mut tasks = Vec::new();

        let scanner = Scanner::new(
            adapter.clone(),
            valid_uuids,
            self.discovered.clone(),
            config.power_profile.rssi_threshold(),
            config.scan_restart_interval,
            config.min_scan_interval,
        );
        let scan_sink = sink.clone();
        let scan_stop = self.stop_tx.subscribe();
        tasks.push(tokio::spawn(
            async move {
                scanner.run(scan_sink, scan_stop).await;
            }
            .instrument(info_span!("scanner")),
        ));

        self.peripheral_backend.start(initial_service_uuid, sink.clone()).await?;

        let rssi_sink = sink.clone();
        let rssi_adapter = adapter.clone();
        let mut rssi_stop = self.stop_tx.subscribe();
        tasks.push(tokio::spawn(
            async move {
                let mut ticker = interval(RSSI_REFRESH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = rssi_stop.changed() => return,
                        _ = ticker.tick() => {
                            refresh_rssi(&rssi_adapter, &rssi_sink).await;
                        }
                    }
                }
            }
            .instrument(info_span!("rssi_poller")),
        ));

        info!("BLE engine started: scanner, advertiser and RSSI poller running");
        Ok(BleEngineHandle { tasks })
    }

    /// Look up a device the scanner has seen and, if still known, connect to
    /// it (§4.5 "check address not already connected/pending, call
    /// `connection_tracker.is_connect_allowed`, then initiate a central-role
    /// connection"). The admission decision itself is the caller's
    /// responsibility — this only resolves the scanned `DeviceId` back to a
    /// connectable handle.
    pub async fn connect_known_device(self: &Arc<Self>, device_id: DeviceId, sink: Arc<dyn RouterSink>) -> Result<()> {
        let peripheral = self
            .discovered
            .read()
            .await
            .get(&device_id)
            .cloned()
            .ok_or(Error::LinkConnectFailed("device no longer in scan cache".into()))?;
        self.connect_central(peripheral, device_id, sink).await;
        Ok(())
    }

    /// Initiate a central-role connection to a newly scanned device, run
    /// its GATT state machine to completion on a dedicated task, and
    /// register its outbound queue, draining it on a second dedicated task
    /// for the life of the link (§4.5 "Central-role GATT", §9 backpressure).
    pub async fn connect_central(
        self: &Arc<Self>,
        peripheral: Peripheral,
        device_id: DeviceId,
        sink: Arc<dyn RouterSink>,
    ) {
        self.central_peripherals.write().await.insert(device_id, peripheral.clone());
        let queue = Arc::new(BoundedDropOldestQueue::new(OUTBOUND_QUEUE_CAPACITY));
        self.outbound_queues.write().insert(device_id, queue.clone());
        self.drain_queue_for(device_id, LinkRole::Central, queue);

        let mtu_target = self.mtu_target;
        let engine = self.clone();
        let span = info_span!("central_link", ?device_id);
        tokio::spawn(
            async move {
                if let Err(err) = central::connect_and_subscribe(peripheral, device_id, mtu_target, sink.clone()).await {
                    warn!(?err, "central connection attempt failed");
                    sink.on_transport_event(TransportEvent::LinkDisconnected {
                        device_id,
                        role: LinkRole::Central,
                        immediate: true,
                    })
                    .await;
                }
                engine.central_peripherals.write().await.remove(&device_id);
                engine.outbound_queues.write().remove(&device_id);
            }
            .instrument(span),
        );
    }

    /// Send an already-encoded frame to one link, queuing with drop-oldest
    /// backpressure if the link is momentarily busy.
    pub async fn send(&self, device_id: DeviceId, role: LinkRole, bytes: Vec<u8>) -> Result<()> {
        match role {
            LinkRole::Central => {
                let peripherals = self.central_peripherals.read().await;
                let peripheral = peripherals.get(&device_id).ok_or(Error::SessionNotFound)?;
                central::write_frame(peripheral, &bytes).await
            }
            LinkRole::Peripheral => self.peripheral_backend.notify_all(&bytes).await,
        }
    }

    /// Queue a frame for best-effort delivery without blocking the caller
    /// (§9). Central-role frames go through the per-device drop-oldest
    /// queue set up by [`Self::connect_central`]; peripheral-role frames go
    /// straight to the GATT notify broadcast, which has no per-device
    /// connection to queue against in the first place.
    pub fn enqueue(self: &Arc<Self>, device_id: DeviceId, role: LinkRole, bytes: Vec<u8>) {
        match role {
            LinkRole::Central => {
                let queue = {
                    let mut queues = self.outbound_queues.write();
                    queues
                        .entry(device_id)
                        .or_insert_with(|| Arc::new(BoundedDropOldestQueue::new(OUTBOUND_QUEUE_CAPACITY)))
                        .clone()
                };
                queue.push(bytes);
            }
            LinkRole::Peripheral => {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = engine.send(device_id, LinkRole::Peripheral, bytes).await {
                        warn!(?device_id, ?err, "peripheral-role notify failed");
                    }
                });
            }
        }
    }

    /// Re-advertise under the current bucket's service UUID (called by the
    /// rotation reaper on bucket boundaries, §4.5 "Advertiser").
    pub async fn rotate_advertised_uuid(&self, service_uuid: Uuid) -> Result<()> {
        self.peripheral_backend.update_advertised_uuid(service_uuid).await
    }

    /// Drain and close every link, cancel scan/advertise, and signal every
    /// background task to stop (§5 "on stop, all GATT handles are closed").
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let peripherals = self.central_peripherals.write().await;
        for peripheral in peripherals.values() {
            let _ = peripheral.disconnect().await;
        }
        let _ = self.peripheral_backend.stop().await;
    }
}

async fn refresh_rssi(adapter: &btleplug::platform::Adapter, sink: &Arc<dyn RouterSink>) {
    let Ok(peripherals) = adapter.peripherals().await else {
        return;
    };
    for peripheral in peripherals {
        if !peripheral.is_connected().await.unwrap_or(false) {
            continue;
        }
        let Ok(Some(properties)) = peripheral.properties().await else {
            continue;
        };
        if let Some(rssi) = properties.rssi {
            let device_id = DeviceId::from_address(&properties.address.to_string());
            sink.on_transport_event(TransportEvent::RssiUpdated { device_id, rssi }).await;
        }
    }
}
