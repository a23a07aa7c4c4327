//! TLV sub-payload format for `file_transfer` packets (§3, Open Question #2).
//!
//! All TLV records use a 1-byte tag and a 2-byte big-endian length prefix,
//! except `CONTENT`, which uses a 4-byte big-endian length prefix to
//! accommodate large files. A trailing `CHECKSUM` record carries the SHA-256
//! of `CONTENT`; a mismatch causes the whole sub-payload to be dropped.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

const TAG_FILENAME: u8 = 0x01;
const TAG_MIME_TYPE: u8 = 0x02;
const TAG_CONTENT: u8 = 0x03;
const TAG_CHECKSUM: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl FileTransfer {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            content,
        }
    }

    /// Encode to the TLV sub-payload, appending a trailing CHECKSUM record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content.len() + self.filename.len() + 64);

        write_short_tlv(&mut out, TAG_FILENAME, self.filename.as_bytes());
        write_short_tlv(&mut out, TAG_MIME_TYPE, self.mime_type.as_bytes());

        out.push(TAG_CONTENT);
        out.write_u32::<BigEndian>(self.content.len() as u32).unwrap();
        out.extend_from_slice(&self.content);

        let checksum = Sha256::digest(&self.content);
        write_short_tlv(&mut out, TAG_CHECKSUM, &checksum);

        out
    }

    /// Decode the TLV sub-payload, verifying the trailing CHECKSUM against
    /// CONTENT. Any mismatch (missing fields, bad checksum) is a drop.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut filename: Option<String> = None;
        let mut mime_type: Option<String> = None;
        let mut content: Option<Vec<u8>> = None;
        let mut checksum: Option<[u8; 32]> = None;

        while (cursor.position() as usize) < bytes.len() {
            let tag = cursor
                .read_u8()
                .map_err(|_| Error::WireMalformed("tlv_truncated".into()))?;

            let value = if tag == TAG_CONTENT {
                let len = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::WireMalformed("tlv_truncated".into()))? as usize;
                read_n(&mut cursor, len)?
            } else {
                let len = cursor
                    .read_u16::<BigEndian>()
                    .map_err(|_| Error::WireMalformed("tlv_truncated".into()))? as usize;
                read_n(&mut cursor, len)?
            };

            match tag {
                TAG_FILENAME => {
                    filename = Some(
                        String::from_utf8(value).map_err(|_| Error::WireMalformed("bad_filename".into()))?,
                    )
                }
                TAG_MIME_TYPE => {
                    mime_type = Some(
                        String::from_utf8(value).map_err(|_| Error::WireMalformed("bad_mime".into()))?,
                    )
                }
                TAG_CONTENT => content = Some(value),
                TAG_CHECKSUM => {
                    if value.len() != 32 {
                        return Err(Error::WireMalformed("bad_checksum_len".into()));
                    }
                    let mut arr = [0u8; 32];
                    arr.copy_from_slice(&value);
                    checksum = Some(arr);
                }
                _ => {} // unknown tags are skipped, not fatal
            }
        }

        let filename = filename.ok_or_else(|| Error::WireMalformed("missing_filename".into()))?;
        let mime_type = mime_type.unwrap_or_default();
        let content = content.ok_or_else(|| Error::WireMalformed("missing_content".into()))?;
        let checksum = checksum.ok_or_else(|| Error::WireMalformed("missing_checksum".into()))?;

        let computed: [u8; 32] = Sha256::digest(&content).into();
        if computed != checksum {
            return Err(Error::WireMalformed("checksum_mismatch".into()));
        }

        Ok(Self {
            filename,
            mime_type,
            content,
        })
    }
}

fn write_short_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.write_u16::<BigEndian>(value.len() as u16).unwrap();
    out.extend_from_slice(value);
}

fn read_n(cursor: &mut Cursor<&[u8]>, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::WireMalformed("tlv_truncated".into()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_file() {
        let file = FileTransfer::new("note.txt", "text/plain", b"hello file transfer".to_vec());
        let bytes = file.encode();
        let decoded = FileTransfer::decode(&bytes).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn corrupted_content_fails_checksum() {
        let file = FileTransfer::new("note.txt", "text/plain", b"original bytes".to_vec());
        let mut bytes = file.encode();
        // Flip a byte inside the CONTENT value.
        let flip_index = bytes.len() - 40;
        bytes[flip_index] ^= 0xFF;
        assert!(FileTransfer::decode(&bytes).is_err());
    }
}
