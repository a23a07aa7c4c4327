//! Wire protocol: binary codec, constants, and the TLV file-transfer format.
//!
//! This module owns everything needed to turn a [`types::Packet`] into bytes
//! and back (§3, §4.1) plus the optional `file_transfer` sub-payload format.
//! Fragmentation lives in [`crate::fragment`]; Noise wrapping lives in
//! [`crate::session`].

pub mod announce;
pub mod binary;
pub mod compression;
pub mod constants;
pub mod file_transfer;
pub mod types;

pub use binary::{decode, encode, encode_for_signing, EncodeOptions};
pub use constants::*;
pub use types::{now_millis, random_fragment_id, Packet, PeerId, Route};
