//! Core configuration surface.
//!
//! Every tunable named by the component specs lives here instead of being
//! scattered as magic numbers through the engine. `Config` is loaded once at
//! `Core::start` and treated as immutable for the life of the core.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Power/performance tradeoff. Governs scan/advertise duty cycle, RSSI
/// threshold and the maximum number of simultaneous connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum PowerProfile {
    Max,
    Balanced,
    PowerSaver,
    UltraLowPower,
}

impl Default for PowerProfile {
    fn default() -> Self {
        PowerProfile::Balanced
    }
}

impl PowerProfile {
    /// Maximum number of simultaneous active connections for this profile.
    pub fn max_connections(&self) -> usize {
        match self {
            PowerProfile::Max => 20,
            PowerProfile::Balanced => 10,
            PowerProfile::PowerSaver => 5,
            PowerProfile::UltraLowPower => 2,
        }
    }

    /// Minimum RSSI (dBm) required before a discovered peer is worth connecting to.
    pub fn rssi_threshold(&self) -> i16 {
        match self {
            PowerProfile::Max => -100,
            PowerProfile::Balanced => -95,
            PowerProfile::PowerSaver => -85,
            PowerProfile::UltraLowPower => -75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub nickname: String,
    pub rotation_enabled: bool,
    pub tor_disabled: bool,
    pub power_profile: PowerProfile,

    #[serde(default = "default_mtu_target")]
    pub mtu_target: u16,
    pub default_ttl: u8,
    pub seen_cache_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub seen_cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub reassembly_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub scan_restart_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub advertise_restart_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub min_scan_interval: Duration,

    pub service_uuid_prefix: String,
    pub legacy_service_uuid: Uuid,
    #[serde(with = "humantime_serde")]
    pub rotation_bucket: Duration,
    #[serde(with = "humantime_serde")]
    pub rotation_overlap: Duration,

    pub identity_path: PathBuf,
    pub settings_path: PathBuf,
}

fn default_mtu_target() -> u16 {
    517
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshcore");

        Self {
            nickname: String::new(),
            rotation_enabled: true,
            tor_disabled: true,
            power_profile: PowerProfile::default(),

            mtu_target: default_mtu_target(),
            default_ttl: 7,
            seen_cache_capacity: 10_000,
            seen_cache_ttl: Duration::from_secs(300),
            reassembly_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            scan_restart_interval: Duration::from_secs(25),
            advertise_restart_interval: Duration::from_secs(30),
            min_scan_interval: Duration::from_secs(5),

            service_uuid_prefix: "meshcore".to_string(),
            legacy_service_uuid: Uuid::from_u128(0x12345678_1234_5678_1234_567812345678),
            rotation_bucket: Duration::from_secs(3600),
            rotation_overlap: Duration::from_secs(300),

            identity_path: data_dir.join("identity.bin"),
            settings_path: data_dir.join("settings.bin"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// anything the file doesn't specify.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    pub fn with_power_profile(mut self, profile: PowerProfile) -> Self {
        self.power_profile = profile;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_v1_friendly_ttl_and_cache_sizes() {
        let cfg = Config::default();
        assert_eq!(cfg.default_ttl, 7);
        assert_eq!(cfg.seen_cache_capacity, 10_000);
        assert_eq!(cfg.mtu_target, 517);
    }

    #[test]
    fn power_profile_governs_connection_ceiling() {
        assert!(PowerProfile::Max.max_connections() > PowerProfile::UltraLowPower.max_connections());
        assert!(PowerProfile::Max.rssi_threshold() < PowerProfile::UltraLowPower.rssi_threshold());
    }
}
