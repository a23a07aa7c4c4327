//! meshcore node binary.
//!
//! Wires storage, identity, rotation, the connection tracker, the BLE
//! engine and the router together in that order and runs until
//! interrupted. A `panic-wipe` subcommand exists independent of the normal
//! startup path so an operator can destroy persisted key material without
//! the node ever coming up.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use meshcore::config::{Config, PowerProfile};
use meshcore::mesh::{ConnectionTracker, PeerEvent, Router};
use meshcore::storage::{MasterKey, Store};
use meshcore::transport::BleEngine;
use meshcore::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value = "info", env = "MESHCORE_LOG")]
    log_filter: String,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node (default if no subcommand is given).
    Start {
        #[arg(long, default_value = "")]
        nickname: String,

        #[arg(long, value_enum, default_value_t = PowerProfile::Balanced)]
        power_profile: PowerProfile,

        #[arg(long, default_value_t = true)]
        rotation_enabled: bool,

        /// Passphrase deriving the master key for sealed storage. Without
        /// one, a fresh ephemeral key is used and sealed state will not
        /// survive past this process (see `storage::MasterKey`).
        #[arg(long, env = "MESHCORE_PASSPHRASE")]
        passphrase: Option<String>,
    },
    /// Atomically delete the identity and settings files, then exit.
    PanicWipe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_filter))
        .init();

    let mut config = Config::default();
    if let Some(data_dir) = &cli.data_dir {
        config.identity_path = data_dir.join("identity.bin");
        config.settings_path = data_dir.join("settings.bin");
    }

    match cli.command.unwrap_or(Command::Start {
        nickname: String::new(),
        power_profile: PowerProfile::Balanced,
        rotation_enabled: true,
        passphrase: None,
    }) {
        Command::PanicWipe => panic_wipe(&config),
        Command::Start {
            nickname,
            power_profile,
            rotation_enabled,
            passphrase,
        } => {
            config.nickname = nickname;
            config.power_profile = power_profile;
            config.rotation_enabled = rotation_enabled;
            run(config, passphrase).await
        }
    }
}

fn panic_wipe(config: &Config) -> Result<()> {
    // The salt file is never secret and the master key is irrelevant to a
    // wipe; an ephemeral key merely satisfies the constructor.
    let store = Store::new(&config.identity_path, &config.settings_path, MasterKey::generate_ephemeral());
    store.panic_wipe()?;
    tracing::warn!("identity and settings files wiped");
    Ok(())
}

/// Canonical startup order: storage, then identity, then rotation
/// (folded into the router's `IdentityManager`), then the connection
/// tracker, then the BLE engine, then the router itself.
async fn run(config: Config, passphrase: Option<String>) -> Result<()> {
    let master_key = match passphrase {
        Some(passphrase) => {
            let salt = meshcore::storage::generate_salt();
            MasterKey::from_passphrase(&passphrase, &salt)?
        }
        None => {
            tracing::warn!("no passphrase configured; sealed storage uses an ephemeral key and will not survive a restart");
            MasterKey::generate_ephemeral()
        }
    };
    let store = Store::new(&config.identity_path, &config.settings_path, master_key);
    let identity = store.load_or_generate_identity()?;

    let tracker = Arc::new(ConnectionTracker::new());
    let peripheral_backend = meshcore::transport::peripheral::platform_backend().await;
    let ble = Arc::new(BleEngine::new(peripheral_backend, config.mtu_target));

    let nickname = config.nickname.clone();
    let router = Router::new(identity, config, tracker, ble).into_shared();
    router.subscribe(
        |packet| {
            tracing::info!(packet_type = packet.packet_type, len = packet.plaintext.len(), "received packet");
        },
        |event| match event {
            PeerEvent::LinkConnected { device_id, role } => tracing::info!(?device_id, ?role, "peer connected"),
            PeerEvent::LinkDisconnected { device_id, role } => tracing::info!(?device_id, ?role, "peer disconnected"),
            PeerEvent::SessionEstablished { fingerprint } => {
                tracing::info!(fingerprint = %hex::encode(fingerprint), "session established")
            }
            PeerEvent::SessionFailed { fingerprint } => {
                tracing::warn!(fingerprint = %hex::encode(fingerprint), "session failed")
            }
        },
    );

    if !nickname.is_empty() {
        router.set_nickname(nickname).await?;
    }

    let handle = router.start().await?;
    tracing::info!("meshcore node running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.map_err(meshcore::Error::Io)?;
    tracing::info!("shutting down");
    router.stop().await;
    handle.join().await;
    Ok(())
}
