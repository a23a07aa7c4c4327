//! Error types for meshcore.
//!
//! One flat enum covers every fallible surface in the crate: wire decoding,
//! Noise handshakes, link management, fragmentation and identity/keystore
//! access. Wire and fragment errors are expected to happen routinely (BLE
//! noise, lossy links) and are handled by logging + drop; link and crypto
//! errors are surfaced to callers as typed peer events (see `mesh::router`).

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Severity used to decide whether an error is logged, surfaced, or fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Routine, expected noise (malformed frames from the air). Logged at debug.
    Debug,
    /// Affects a single peer; surfaced as a peer event.
    Peer,
    /// Refuses to start the core.
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    // --- wire / codec (§7: wire_*) ---
    #[error("malformed packet: {0}")]
    WireMalformed(String),

    #[error("unsupported protocol version: {0}")]
    WireBadVersion(u8),

    #[error("encoded frame exceeds maximum block size")]
    WireOversize,

    #[error("compression/decompression failed: {0}")]
    WireCompressionFailed(String),

    #[error("payload_length exceeds v1 16-bit limit")]
    PayloadTooLarge,

    #[error("route hop count exceeds 255")]
    RouteTooLong,

    // --- crypto / noise (§7: crypto_*) ---
    #[error("noise handshake timed out")]
    CryptoHandshakeTimeout,

    #[error("decryption failed")]
    CryptoDecryptFailed,

    #[error("nonce space exhausted, rekey required")]
    CryptoNonceExhausted,

    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    // --- link / BLE (§7: link_*) ---
    #[error("connection attempt failed: {0}")]
    LinkConnectFailed(String),

    #[error("notification subscription failed: {0}")]
    LinkSubscribeFailed(String),

    #[error("connection attempt rate limited, retry after backoff")]
    LinkRateLimited,

    #[error("MTU negotiation failed")]
    LinkMtuFailed,

    #[error("BLE adapter unavailable")]
    BleUnavailable,

    #[error("BLE stack error: {0}")]
    Ble(#[from] btleplug::Error),

    // --- fragmentation ---
    #[error("fragment reassembly timed out")]
    FragmentTimeout,

    #[error("fragmented payload exceeds maximum reassembled size")]
    FragmentOversized,

    // --- identity / persistence ---
    #[error("identity key material unavailable")]
    IdentityKeyUnavailable,

    #[error("peer session not found")]
    SessionNotFound,

    #[error("invalid session state transition: {0}")]
    InvalidState(String),

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidData(String),
}

impl Error {
    /// How this error should be handled per the crate's propagation policy (§7).
    pub fn severity(&self) -> Severity {
        match self {
            Error::WireMalformed(_)
            | Error::WireBadVersion(_)
            | Error::WireOversize
            | Error::WireCompressionFailed(_)
            | Error::PayloadTooLarge
            | Error::RouteTooLong
            | Error::FragmentTimeout
            | Error::FragmentOversized => Severity::Debug,

            Error::IdentityKeyUnavailable => Severity::Fatal,

            _ => Severity::Peer,
        }
    }

    /// Whether the connection tracker should retry this with backoff (§7 iii).
    pub fn is_retryable_link_error(&self) -> bool {
        matches!(
            self,
            Error::LinkConnectFailed(_)
                | Error::LinkSubscribeFailed(_)
                | Error::LinkMtuFailed
                | Error::LinkRateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_errors_are_debug_severity() {
        assert_eq!(Error::WireMalformed("x".into()).severity(), Severity::Debug);
        assert_eq!(Error::FragmentTimeout.severity(), Severity::Debug);
    }

    #[test]
    fn identity_unavailable_is_fatal() {
        assert_eq!(Error::IdentityKeyUnavailable.severity(), Severity::Fatal);
    }

    #[test]
    fn link_errors_are_retryable() {
        assert!(Error::LinkConnectFailed("timeout".into()).is_retryable_link_error());
        assert!(!Error::CryptoDecryptFailed.is_retryable_link_error());
    }
}
