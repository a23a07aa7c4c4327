//! Mesh-layer components (§2): connection tracking, TTL-bounded relay and
//! dedup, and the router facade that wires them to the codec, fragment
//! engine and Noise session manager.
//!
//! Submodules are deliberately narrow: [`connection_tracker`] only tracks
//! link lifecycle and admission control, [`relay`] is pure TTL/dedup
//! decision logic with no I/O, [`seen_cache`] is the bounded dedup set
//! those decisions consult, and [`router`] is the one component that
//! actually owns and wires all of the above together (§4.7, §9 `Core`).

pub mod connection_tracker;
pub mod relay;
pub mod router;
pub mod seen_cache;

pub use connection_tracker::{ConnectionTracker, LinkId, LinkRole, LinkState};
pub use relay::RelayAction;
pub use router::{PacketEvent, PeerEvent, Router, TransferHandle};
pub use seen_cache::{seen_key, SeenCache};
