//! At-rest persistence for the identity and settings files (§6, §12).
//!
//! Both files are serialized with `bincode` and then sealed with
//! ChaCha20Poly1305 under a master key, mirroring the approach this
//! lineage's keystore module uses for its own key-at-rest encryption. The
//! master key itself is supplied by the host OS keystore where one is
//! wired in; this crate carries no keychain integration of its own, so
//! [`MasterKey::from_passphrase`] derives it from an operator passphrase
//! via Argon2id instead, held only in memory and zeroized on drop (§12).
//! Loading either file verifies the AEAD tag before trusting any field — a
//! tag mismatch is indistinguishable from a missing file, so callers
//! always fall back to generating fresh state rather than partially
//! trusting what's on disk.

use std::path::{Path, PathBuf};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::config::PowerProfile;
use crate::crypto::Identity;
use crate::error::{Error, Result};
use crate::protocol::PeerId;

const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

/// The key sealing both persisted files. Never serialized itself; it lives
/// only for the life of the owning [`Store`] and is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Derive a master key from an operator-supplied passphrase and a
    /// stored (non-secret) salt (§12 fallback path).
    pub fn from_passphrase(passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<Self> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| Error::Keystore(format!("argon2 key derivation failed: {e}")))?;
        Ok(Self(key))
    }

    /// A fresh random master key. Used when no passphrase is configured and
    /// no host keystore integration is wired in for this platform; state
    /// sealed under it does not survive past this process (documented
    /// trade-off, see `DESIGN.md`).
    pub fn generate_ephemeral() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new_from_slice(&self.0).expect("key is exactly 32 bytes")
    }
}

/// Generate a fresh random salt suitable for [`MasterKey::from_passphrase`],
/// meant to be persisted alongside (not inside) the sealed files — the salt
/// is not secret, only the passphrase and the derived key are.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Raw key material persisted for the long-lived identity (§3, §6). The
/// `static_fingerprint` is deliberately not a field here: it is always
/// recomputed from `noise_private_bytes` on load, never trusted verbatim
/// from a file that could in principle have been tampered with upstream of
/// the AEAD check (defense in depth, not a distrust of the AEAD itself).
#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    signing_key_bytes: [u8; 32],
    noise_private_bytes: [u8; 32],
}

/// Settings persisted across restarts (§6 settings file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub nickname: String,
    pub last_ephemeral_id: [u8; 8],
    pub last_rotation_time_millis: u64,
    pub power_profile: PowerProfile,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nickname: String::new(),
            last_ephemeral_id: [0u8; 8],
            last_rotation_time_millis: 0,
            power_profile: PowerProfile::default(),
        }
    }
}

impl Settings {
    pub fn last_ephemeral_peer_id(&self) -> PeerId {
        PeerId::new(self.last_ephemeral_id)
    }
}

/// Owns the two persisted files and the master key sealing them (§6, §12).
pub struct Store {
    identity_path: PathBuf,
    settings_path: PathBuf,
    master_key: MasterKey,
}

impl Store {
    pub fn new(identity_path: impl Into<PathBuf>, settings_path: impl Into<PathBuf>, master_key: MasterKey) -> Self {
        Self {
            identity_path: identity_path.into(),
            settings_path: settings_path.into(),
            master_key,
        }
    }

    /// Load the identity file, or generate and persist a fresh identity if
    /// it is missing, unreadable, or fails AEAD verification (§12: a tag
    /// mismatch is treated identically to a missing file).
    pub fn load_or_generate_identity(&self) -> Result<Identity> {
        match self.load_identity() {
            Ok(identity) => Ok(identity),
            Err(_) => {
                let identity = Identity::generate();
                self.save_identity(&identity)?;
                Ok(identity)
            }
        }
    }

    fn load_identity(&self) -> Result<Identity> {
        let sealed = std::fs::read(&self.identity_path)?;
        let plaintext = open(&self.master_key, &sealed)?;
        let record: IdentityRecord =
            bincode::deserialize(&plaintext).map_err(|e| Error::Keystore(format!("identity record corrupt: {e}")))?;
        Ok(Identity::from_raw_parts(record.signing_key_bytes, record.noise_private_bytes))
    }

    pub fn save_identity(&self, identity: &Identity) -> Result<()> {
        let record = IdentityRecord {
            signing_key_bytes: identity.signing_key.to_bytes(),
            noise_private_bytes: *identity.noise_static_key.private_bytes(),
        };
        let plaintext =
            bincode::serialize(&record).map_err(|e| Error::Keystore(format!("identity serialization failed: {e}")))?;
        let sealed = seal(&self.master_key, &plaintext)?;
        write_private_file(&self.identity_path, &sealed)
    }

    /// Load settings, falling back to defaults on any read/decrypt failure
    /// rather than refusing to start (settings, unlike identity, are not
    /// fatal to lose).
    pub fn load_settings(&self) -> Settings {
        self.try_load_settings().unwrap_or_default()
    }

    fn try_load_settings(&self) -> Result<Settings> {
        let sealed = std::fs::read(&self.settings_path)?;
        let plaintext = open(&self.master_key, &sealed)?;
        bincode::deserialize(&plaintext).map_err(|e| Error::Keystore(format!("settings record corrupt: {e}")))
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let plaintext =
            bincode::serialize(settings).map_err(|e| Error::Keystore(format!("settings serialization failed: {e}")))?;
        let sealed = seal(&self.master_key, &plaintext)?;
        write_private_file(&self.settings_path, &sealed)
    }

    /// Atomically delete both files and leave the store ready to
    /// re-initialize with a fresh identity on the next
    /// `load_or_generate_identity` call (§6 "panic wipe").
    pub fn panic_wipe(&self) -> Result<()> {
        remove_if_present(&self.identity_path)?;
        remove_if_present(&self.settings_path)?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

fn seal(key: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| Error::Keystore("seal failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(key: &MasterKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::Keystore("sealed file too short".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::Keystore("AEAD tag verification failed".into()))
}

fn write_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, master_key: MasterKey) -> Store {
        Store::new(dir.path().join("identity.bin"), dir.path().join("settings.bin"), master_key)
    }

    #[test]
    fn identity_round_trips_through_sealed_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, MasterKey::generate_ephemeral());

        let identity = Identity::generate();
        store.save_identity(&identity).unwrap();
        let loaded = store.load_identity().unwrap();
        assert_eq!(loaded.static_fingerprint, identity.static_fingerprint);
    }

    #[test]
    fn missing_identity_file_yields_a_fresh_generated_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, MasterKey::generate_ephemeral());

        let identity = store.load_or_generate_identity().unwrap();
        let reloaded = store.load_or_generate_identity().unwrap();
        // Second call loads what the first call persisted, not a new one.
        assert_eq!(identity.static_fingerprint, reloaded.static_fingerprint);
    }

    #[test]
    fn tampered_ciphertext_is_treated_like_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, MasterKey::generate_ephemeral());
        store.save_identity(&Identity::generate()).unwrap();

        let mut bytes = std::fs::read(&store.identity_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&store.identity_path, &bytes).unwrap();

        assert!(store.load_identity().is_err());
    }

    #[test]
    fn wrong_master_key_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = store(&dir, MasterKey::generate_ephemeral());
        store_a.save_identity(&Identity::generate()).unwrap();

        let store_b = Store::new(store_a.identity_path.clone(), store_a.settings_path.clone(), MasterKey::generate_ephemeral());
        assert!(store_b.load_identity().is_err());
    }

    #[test]
    fn passphrase_derivation_is_deterministic_for_the_same_salt() {
        let salt = generate_salt();
        let a = MasterKey::from_passphrase("correct horse battery staple", &salt).unwrap();
        let b = MasterKey::from_passphrase("correct horse battery staple", &salt).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, MasterKey::generate_ephemeral());

        let settings = Settings {
            nickname: "trinity".into(),
            last_ephemeral_id: [9; 8],
            last_rotation_time_millis: 1_700_000_000_000,
            power_profile: PowerProfile::PowerSaver,
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings(), settings);
    }

    #[test]
    fn panic_wipe_removes_both_files_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, MasterKey::generate_ephemeral());
        store.save_identity(&Identity::generate()).unwrap();
        store.save_settings(&Settings::default()).unwrap();

        store.panic_wipe().unwrap();
        assert!(!store.identity_path.exists());
        assert!(!store.settings_path.exists());
        // Calling it again on an already-clean store must not error.
        store.panic_wipe().unwrap();
    }
}
