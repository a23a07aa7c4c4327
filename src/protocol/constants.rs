//! Wire-format constants (§3).

/// Frame version using a 2-byte payload length.
pub const VERSION_V1: u8 = 1;
/// Frame version using a 4-byte payload length, emitted when payload_length
/// would overflow v1's 16-bit field.
pub const VERSION_V2: u8 = 2;

pub const PACKET_TYPE_ANNOUNCE: u8 = 0x01;
pub const PACKET_TYPE_MESSAGE: u8 = 0x02;
pub const PACKET_TYPE_LEAVE: u8 = 0x03;
pub const PACKET_TYPE_NOISE_HANDSHAKE: u8 = 0x10;
pub const PACKET_TYPE_NOISE_ENCRYPTED: u8 = 0x11;
pub const PACKET_TYPE_FRAGMENT: u8 = 0x20;
pub const PACKET_TYPE_SYNC_REQUEST: u8 = 0x21;
pub const PACKET_TYPE_FILE_TRANSFER: u8 = 0x22;

pub const FLAG_HAS_RECIPIENT: u8 = 1 << 0;
pub const FLAG_HAS_SIGNATURE: u8 = 1 << 1;
pub const FLAG_IS_COMPRESSED: u8 = 1 << 2;
pub const FLAG_HAS_ROUTE: u8 = 1 << 3;

/// Header size preceding `sender_id`, excluding the version-dependent length field.
pub const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 8 + 1; // version, type, ttl, timestamp, flags
pub const V1_LENGTH_FIELD_LEN: usize = 2;
pub const V2_LENGTH_FIELD_LEN: usize = 4;

pub const SENDER_ID_LEN: usize = 8;
pub const RECIPIENT_ID_LEN: usize = 8;
pub const SIGNATURE_LEN: usize = 64;
pub const ROUTE_HOP_LEN: usize = 8;
pub const ORIGINAL_SIZE_LEN: usize = 2;

/// Reserved sender ID, never produced by an honest node.
pub const SENDER_ID_RESERVED: [u8; SENDER_ID_LEN] = [0xFF; SENDER_ID_LEN];
/// Recipient ID sentinel meaning "broadcast".
pub const RECIPIENT_ID_BROADCAST: [u8; RECIPIENT_ID_LEN] = [0xFF; RECIPIENT_ID_LEN];

/// PKCS#7 padding block sizes, smallest-first.
pub const PADDING_BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Minimum raw payload size worth attempting compression on.
pub const COMPRESSION_MIN_SIZE: usize = 100;

pub const DEFAULT_TTL: u8 = 7;

/// v1's payload_length field is 16 bits.
pub const V1_MAX_PAYLOAD_LENGTH: usize = u16::MAX as usize;
