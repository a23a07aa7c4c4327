//! Fragment engine (§4.2): splits oversized encoded frames into ordered
//! `fragment` packets and reassembles them index-based on the receiving side.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::protocol::{self, Packet, PeerId, PACKET_TYPE_FRAGMENT};

/// Bytes of fragmentation-header overhead per chunk (fragment_id + index +
/// total_count + original_type).
const FRAGMENT_HEADER_LEN: usize = 2 + 2 + 2 + 1;

/// Split `inner_frame` (an already-encoded packet) into a sequence of
/// `fragment`-type packets, each under `mtu - 24` bytes of chunk payload.
pub fn split(
    inner_frame: &[u8],
    original_type: u8,
    mtu: u16,
    sender_id: PeerId,
    ttl: u8,
) -> Vec<Packet> {
    let chunk_size = (mtu as usize).saturating_sub(24).max(1);
    let fragment_id = protocol::random_fragment_id();
    let total_count = inner_frame.len().div_ceil(chunk_size) as u16;

    inner_frame
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
            payload.extend_from_slice(&fragment_id.to_be_bytes());
            payload.extend_from_slice(&(index as u16).to_be_bytes());
            payload.extend_from_slice(&total_count.to_be_bytes());
            payload.push(original_type);
            payload.extend_from_slice(chunk);

            Packet::new(PACKET_TYPE_FRAGMENT, sender_id, payload).with_ttl(ttl)
        })
        .collect()
}

struct ParsedFragment {
    fragment_id: u16,
    index: u16,
    total_count: u16,
    original_type: u8,
    chunk: Vec<u8>,
}

fn parse_fragment(payload: &[u8]) -> Result<ParsedFragment> {
    if payload.len() < FRAGMENT_HEADER_LEN {
        return Err(Error::WireMalformed("fragment_header_short".into()));
    }
    let fragment_id = u16::from_be_bytes([payload[0], payload[1]]);
    let index = u16::from_be_bytes([payload[2], payload[3]]);
    let total_count = u16::from_be_bytes([payload[4], payload[5]]);
    let original_type = payload[6];
    let chunk = payload[7..].to_vec();
    Ok(ParsedFragment {
        fragment_id,
        index,
        total_count,
        original_type,
        chunk,
    })
}

struct ReassemblyEntry {
    total_count: u16,
    received: HashMap<u16, Vec<u8>>,
    first_seen_at: Instant,
    inner_type: u8,
}

/// A completed, reassembled inner frame ready to be re-fed into the codec.
pub struct Reassembled {
    pub original_type: u8,
    pub bytes: Vec<u8>,
}

/// Keyed by `(sender_id, fragment_id)` (§3). Owns its own lock, consistent
/// with the crate's lock-nesting discipline (§5): callers never hold this
/// lock alongside the connection tracker or session map.
pub struct ReassemblyTable {
    entries: RwLock<HashMap<(PeerId, u16), ReassemblyEntry>>,
    timeout: Duration,
}

impl ReassemblyTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Feed one received `fragment` packet. Returns `Some` once every chunk
    /// for its `(sender_id, fragment_id)` has arrived, in which case the
    /// entry is removed and the concatenated inner frame is returned.
    pub async fn on_fragment(&self, sender_id: PeerId, payload: &[u8]) -> Result<Option<Reassembled>> {
        let parsed = parse_fragment(payload)?;
        let key = (sender_id, parsed.fragment_id);

        let mut entries = self.entries.write().await;
        let entry = entries.entry(key).or_insert_with(|| ReassemblyEntry {
            total_count: parsed.total_count,
            received: HashMap::new(),
            first_seen_at: Instant::now(),
            inner_type: parsed.original_type,
        });

        entry.received.insert(parsed.index, parsed.chunk);

        if entry.received.len() == entry.total_count as usize {
            let entry = entries.remove(&key).expect("entry present");
            let mut bytes = Vec::new();
            for index in 0..entry.total_count {
                let chunk = entry
                    .received
                    .get(&index)
                    .ok_or_else(|| Error::WireMalformed("fragment_gap".into()))?;
                bytes.extend_from_slice(chunk);
            }
            return Ok(Some(Reassembled {
                original_type: entry.inner_type,
                bytes,
            }));
        }

        Ok(None)
    }

    /// Drop reassembly entries older than the configured timeout (30s
    /// default), silently — the sender may retransmit at a higher layer.
    pub async fn reap_expired(&self) {
        let mut entries = self.entries.write().await;
        let timeout = self.timeout;
        entries.retain(|_, entry| entry.first_seen_at.elapsed() < timeout);
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn out_of_order_fragments_reassemble_byte_identical() {
        let original: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let sender = PeerId::new([9; 8]);
        let fragments = split(&original, 0x02, 517, sender, 7);
        assert_eq!(fragments.len(), original.len().div_ceil(517 - 24));

        let table = ReassemblyTable::new(Duration::from_secs(30));
        let order = [4usize, 2, 0, 3, 1];
        assert_eq!(fragments.len(), 5);

        let mut result = None;
        for &i in &order {
            result = table.on_fragment(sender, &fragments[i].payload).await.unwrap();
        }

        let reassembled = result.expect("should complete on the last fragment");
        assert_eq!(reassembled.bytes, original);
        assert_eq!(reassembled.original_type, 0x02);
        assert_eq!(table.pending_count().await, 0);
    }

    #[tokio::test]
    async fn missing_one_fragment_never_completes() {
        let original = vec![7u8; 2000];
        let sender = PeerId::new([1; 8]);
        let fragments = split(&original, 0x02, 517, sender, 7);

        let table = ReassemblyTable::new(Duration::from_secs(30));
        let mut completed = false;
        for fragment in &fragments[..fragments.len() - 1] {
            if table.on_fragment(sender, &fragment.payload).await.unwrap().is_some() {
                completed = true;
            }
        }
        assert!(!completed);
        assert_eq!(table.pending_count().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_reaped_silently() {
        let original = vec![1u8; 2000];
        let sender = PeerId::new([2; 8]);
        let fragments = split(&original, 0x02, 517, sender, 7);

        let table = ReassemblyTable::new(Duration::from_millis(1));
        table.on_fragment(sender, &fragments[0].payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        table.reap_expired().await;
        assert_eq!(table.pending_count().await, 0);
    }
}
