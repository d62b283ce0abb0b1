//! # Pagination Token Codec
//!
//! Listing cursors are wire-compatible with the real service: a protobuf
//! message with a single `lastFile` string field (field 1, length-delimited),
//! base64-encoded. A request carrying a token returns only objects whose
//! name is strictly greater than the token's `lastFile` in byte order.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use nimbus_core::{Error, Result};

const LAST_FILE_TAG: u64 = (1 << 3) | 2; // field 1, wire type 2

/// Encode a cursor meaning "return names greater than this".
pub fn encode_page_token(last_file: &str) -> String {
    let mut buf = Vec::with_capacity(last_file.len() + 3);
    if !last_file.is_empty() {
        write_varint(&mut buf, LAST_FILE_TAG);
        write_varint(&mut buf, last_file.len() as u64);
        buf.extend_from_slice(last_file.as_bytes());
    }
    URL_SAFE.encode(buf)
}

/// Decode a cursor back to the last emitted name. Rejects malformed base64,
/// unknown field tags, and truncated payloads.
pub fn decode_page_token(token: &str) -> Result<String> {
    let buf = URL_SAFE
        .decode(token)
        .or_else(|_| STANDARD.decode(token))
        .map_err(|e| Error::invalid(format!("could not base64 decode page token: {e}")))?;

    let mut last_file = String::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let tag = read_varint(&buf, &mut pos)?;
        if tag != LAST_FILE_TAG {
            return Err(Error::invalid(format!("unknown page token field tag {tag}")));
        }
        let len = read_varint(&buf, &mut pos)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| Error::invalid("truncated page token"))?;
        last_file = String::from_utf8(buf[pos..end].to_vec())
            .map_err(|_| Error::invalid("page token is not valid UTF-8"))?;
        pos = end;
    }
    Ok(last_file)
}

fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut out: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or_else(|| Error::invalid("truncated page token"))?;
        *pos += 1;
        out |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::invalid("varint overflow in page token"));
        }
    }
}
