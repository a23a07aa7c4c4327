//! Binary wire codec: `Packet` <-> bytes (§4.1).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::compression::{compress_if_smaller, decompress};
use super::constants::*;
use super::types::{Packet, PeerId};
use crate::error::{Error, Result};

/// Encode/compress/pad knobs. `encode_for_signing` always uses
/// `{padding: false, compression: false}` on a TTL=0, unsigned copy.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub padding: bool,
    pub compression: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            padding: true,
            compression: true,
        }
    }
}

/// Encode a packet to its wire representation (§4.1, §3).
pub fn encode(packet: &Packet, opts: EncodeOptions) -> Result<Vec<u8>> {
    if let Some(route) = &packet.route {
        if route.len() > 255 {
            return Err(Error::RouteTooLong);
        }
    }

    let (payload_bytes, original_size, is_compressed) =
        if opts.compression && packet.payload.len() >= COMPRESSION_MIN_SIZE {
            match compress_if_smaller(&packet.payload)? {
                Some(compressed) => (compressed, Some(packet.payload.len() as u16), true),
                None => (packet.payload.clone(), None, false),
            }
        } else {
            (packet.payload.clone(), None, false)
        };

    let mut flags = 0u8;
    if packet.has_recipient() {
        flags |= FLAG_HAS_RECIPIENT;
    }
    if packet.has_signature() {
        flags |= FLAG_HAS_SIGNATURE;
    }
    if is_compressed {
        flags |= FLAG_IS_COMPRESSED;
    }
    if packet.has_route() {
        flags |= FLAG_HAS_ROUTE;
    }

    // Variable section covered by payload_length: route, original_size, payload.
    let mut variable = Vec::new();
    if let Some(route) = &packet.route {
        variable.push(route.len() as u8);
        for hop in route {
            variable.extend_from_slice(hop.as_bytes());
        }
    }
    if let Some(size) = original_size {
        variable.write_u16::<BigEndian>(size)?;
    }
    variable.extend_from_slice(&payload_bytes);

    let payload_length = variable.len();
    if payload_length > u32::MAX as usize {
        return Err(Error::PayloadTooLarge);
    }
    let version = if payload_length <= V1_MAX_PAYLOAD_LENGTH {
        VERSION_V1
    } else {
        VERSION_V2
    };

    let mut frame = Vec::with_capacity(
        FIXED_HEADER_LEN + V2_LENGTH_FIELD_LEN + SENDER_ID_LEN + RECIPIENT_ID_LEN + payload_length + SIGNATURE_LEN,
    );
    frame.write_u8(version)?;
    frame.write_u8(packet.packet_type)?;
    frame.write_u8(packet.ttl)?;
    frame.write_u64::<BigEndian>(packet.timestamp)?;
    frame.write_u8(flags)?;
    if version == VERSION_V1 {
        frame.write_u16::<BigEndian>(payload_length as u16)?;
    } else {
        frame.write_u32::<BigEndian>(payload_length as u32)?;
    }

    frame.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        frame.extend_from_slice(recipient.as_bytes());
    }
    frame.extend_from_slice(&variable);
    if let Some(signature) = &packet.signature {
        frame.extend_from_slice(signature);
    }

    if opts.padding {
        pad_pkcs7(&mut frame)?;
    }

    Ok(frame)
}

/// Decode wire bytes back into a `Packet` (§4.1). Tries the bytes as-is
/// first; on failure, strips one layer of PKCS#7 padding and retries.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    match decode_exact(bytes) {
        Ok(packet) => Ok(packet),
        Err(_) => {
            let unpadded = strip_pkcs7(bytes)?;
            decode_exact(&unpadded)
        }
    }
}

/// Produce the deterministic pre-image that gets Ed25519-signed: TTL
/// forced to 0, no signature, no padding, no compression (§4.1).
pub fn encode_for_signing(packet: &Packet) -> Result<Vec<u8>> {
    let mut preimage = packet.clone();
    preimage.ttl = 0;
    preimage.signature = None;
    encode(
        &preimage,
        EncodeOptions {
            padding: false,
            compression: false,
        },
    )
}

fn decode_exact(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < FIXED_HEADER_LEN + V1_LENGTH_FIELD_LEN {
        return Err(Error::WireMalformed("short_frame".into()));
    }

    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8()?;
    if version != VERSION_V1 && version != VERSION_V2 {
        return Err(Error::WireBadVersion(version));
    }
    let packet_type = cursor.read_u8()?;
    let ttl = cursor.read_u8()?;
    let timestamp = cursor.read_u64::<BigEndian>()?;
    let flags = cursor.read_u8()?;

    let payload_length = if version == VERSION_V1 {
        cursor.read_u16::<BigEndian>()? as usize
    } else {
        cursor.read_u32::<BigEndian>()? as usize
    };

    let has_recipient = flags & FLAG_HAS_RECIPIENT != 0;
    let has_signature = flags & FLAG_HAS_SIGNATURE != 0;
    let is_compressed = flags & FLAG_IS_COMPRESSED != 0;
    let has_route = flags & FLAG_HAS_ROUTE != 0;

    let header_len = FIXED_HEADER_LEN
        + if version == VERSION_V1 {
            V1_LENGTH_FIELD_LEN
        } else {
            V2_LENGTH_FIELD_LEN
        };
    let expected_len = header_len
        + SENDER_ID_LEN
        + if has_recipient { RECIPIENT_ID_LEN } else { 0 }
        + payload_length
        + if has_signature { SIGNATURE_LEN } else { 0 };

    if bytes.len() != expected_len {
        return Err(Error::WireMalformed("short_frame".into()));
    }

    let mut sender_id_bytes = [0u8; SENDER_ID_LEN];
    cursor
        .read_exact(&mut sender_id_bytes)
        .map_err(|_| Error::WireMalformed("short_frame".into()))?;
    let sender_id = PeerId::new(sender_id_bytes);

    let recipient_id = if has_recipient {
        let mut bytes = [0u8; RECIPIENT_ID_LEN];
        cursor
            .read_exact(&mut bytes)
            .map_err(|_| Error::WireMalformed("short_frame".into()))?;
        Some(PeerId::new(bytes))
    } else {
        None
    };

    let variable_start = cursor.position() as usize;
    let variable_end = variable_start + payload_length;
    let variable = &bytes[variable_start..variable_end];
    let mut variable_cursor = Cursor::new(variable);

    let route = if has_route {
        let count = variable_cursor.read_u8()? as usize;
        let mut hops = Vec::with_capacity(count);
        for _ in 0..count {
            let mut hop = [0u8; ROUTE_HOP_LEN];
            variable_cursor
                .read_exact(&mut hop)
                .map_err(|_| Error::WireMalformed("bad_route".into()))?;
            hops.push(PeerId::new(hop));
        }
        Some(hops)
    } else {
        None
    };

    let original_size = if is_compressed {
        Some(variable_cursor.read_u16::<BigEndian>()? as usize)
    } else {
        None
    };

    let payload_start = variable_cursor.position() as usize;
    let raw_payload = &variable[payload_start..];

    let payload = if is_compressed {
        let original_size = original_size.ok_or_else(|| Error::WireMalformed("bad_compression".into()))?;
        decompress(raw_payload, original_size).map_err(|_| Error::WireCompressionFailed("bad_compression".into()))?
    } else {
        raw_payload.to_vec()
    };

    cursor.set_position(variable_end as u64);

    let signature = if has_signature {
        let mut sig = [0u8; SIGNATURE_LEN];
        cursor
            .read_exact(&mut sig)
            .map_err(|_| Error::WireMalformed("short_frame".into()))?;
        Some(sig)
    } else {
        None
    };

    Ok(Packet {
        version,
        packet_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        route,
        payload,
        signature,
    })
}

/// Pad `frame` in place to the smallest block size in {256, 512, 1024, 2048}
/// that strictly exceeds its current length (PKCS#7 always adds at least one
/// byte of padding).
fn pad_pkcs7(frame: &mut Vec<u8>) -> Result<()> {
    let block = PADDING_BLOCK_SIZES
        .iter()
        .find(|&&size| frame.len() < size)
        .copied()
        .ok_or(Error::WireOversize)?;

    let pad_len = block - frame.len();
    frame.resize(block, pad_len as u8);
    Ok(())
}

fn strip_pkcs7(bytes: &[u8]) -> Result<Vec<u8>> {
    let pad_len = *bytes.last().ok_or_else(|| Error::WireMalformed("empty_frame".into()))? as usize;
    if pad_len == 0 || pad_len > bytes.len() {
        return Err(Error::WireMalformed("bad_padding".into()));
    }
    let split = bytes.len() - pad_len;
    if bytes[split..].iter().any(|&b| b as usize != pad_len) {
        return Err(Error::WireMalformed("bad_padding".into()));
    }
    Ok(bytes[..split].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::new(PACKET_TYPE_MESSAGE, PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]), b"hi".to_vec())
            .with_ttl(7)
    }

    #[test]
    fn round_trip_without_padding_or_compression() {
        let packet = sample_packet();
        let bytes = encode(
            &packet,
            EncodeOptions {
                padding: false,
                compression: false,
            },
        )
        .unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trip_with_padding_strips_exactly_once() {
        let packet = sample_packet();
        let bytes = encode(
            &packet,
            EncodeOptions {
                padding: true,
                compression: false,
            },
        )
        .unwrap();
        assert_eq!(bytes.len(), 256);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn scenario_broadcast_text_encodes_to_256_byte_frame() {
        let mut packet = Packet::new(
            PACKET_TYPE_MESSAGE,
            PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]),
            b"hi".to_vec(),
        );
        packet.ttl = 7;
        packet.timestamp = 1_700_000_000_000;

        let bytes = encode(&packet, EncodeOptions::default()).unwrap();
        assert_eq!(bytes.len(), 256);
        assert_eq!(bytes[0], VERSION_V1);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.sender_id, packet.sender_id);
        assert_eq!(decoded.payload, packet.payload);
        assert_eq!(decoded.ttl, 7);
        assert_eq!(decoded.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn compression_threshold_at_100_bytes() {
        let small_payload = vec![0x41u8; 99];
        let small_packet = Packet::new(PACKET_TYPE_MESSAGE, PeerId::new([0; 8]), small_payload.clone());
        let small_bytes = encode(&small_packet, EncodeOptions::default()).unwrap();
        let small_decoded_flags = small_bytes[11];
        assert_eq!(small_decoded_flags & FLAG_IS_COMPRESSED, 0);

        let large_payload = vec![0x41u8; 500];
        let large_packet = Packet::new(PACKET_TYPE_MESSAGE, PeerId::new([0; 8]), large_payload.clone());
        let large_bytes = encode(&large_packet, EncodeOptions::default()).unwrap();
        let large_decoded_flags = large_bytes[11];
        assert_eq!(large_decoded_flags & FLAG_IS_COMPRESSED, FLAG_IS_COMPRESSED);

        let decoded = decode(&large_bytes).unwrap();
        assert_eq!(decoded.payload, large_payload);
    }

    #[test]
    fn encode_for_signing_is_invariant_under_ttl_and_signature() {
        let mut a = sample_packet();
        a.ttl = 3;
        let mut b = sample_packet();
        b.ttl = 9;
        b.signature = Some([7u8; SIGNATURE_LEN]);

        assert_eq!(encode_for_signing(&a).unwrap(), encode_for_signing(&b).unwrap());
    }

    #[test]
    fn route_too_long_is_rejected() {
        let route: Vec<PeerId> = (0..=255u16).map(|i| PeerId::new([(i % 256) as u8; 8])).collect();
        let packet = sample_packet().with_route(route);
        let result = encode(&packet, EncodeOptions::default());
        assert!(matches!(result, Err(Error::RouteTooLong)));
    }
}
