//! # Multipart Parsing
//!
//! Two flavors: `multipart/related` upload bodies (a JSON metadata part
//! followed by the payload part) and `multipart/mixed` batch bodies (each
//! part wrapping one HTTP sub-request).

use crate::meta::Object;
use bytes::Bytes;
use nimbus_core::{Error, Result};

/// One part of a multipart body: headers plus raw content.
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Part {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extract the boundary parameter from a Content-Type header value.
pub fn boundary_of(content_type: &str) -> Result<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Ok(value.to_string());
            }
        }
    }
    Err(Error::invalid(format!(
        "Content-Type header is missing boundary: {content_type:?}"
    )))
}

/// Split a multipart body into its parts.
pub fn parse_parts(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delim = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut rest = body;

    // Skip the preamble up to the first delimiter.
    let Some(idx) = find(rest, delim.as_bytes()) else {
        return Err(Error::invalid("multipart body has no boundary delimiter"));
    };
    rest = &rest[idx + delim.len()..];

    loop {
        // After a delimiter: "--" closes the body, otherwise a CRLF starts
        // the next part.
        if rest.starts_with(b"--") {
            break;
        }
        rest = strip_crlf(rest);

        let Some(end) = find(rest, delim.as_bytes()) else {
            return Err(Error::invalid("multipart body is missing its closing boundary"));
        };
        let raw_part = &rest[..end];
        rest = &rest[end + delim.len()..];

        parts.push(split_part(trim_trailing_crlf(raw_part))?);
    }

    if parts.is_empty() {
        return Err(Error::invalid("multipart body contains no parts"));
    }
    Ok(parts)
}

/// Parse a `multipart/related` insert body: JSON object metadata first, then
/// the payload.
pub fn read_multipart_insert(content_type: &str, body: &[u8]) -> Result<(Object, Bytes)> {
    let lowered = content_type.to_ascii_lowercase();
    if !lowered.starts_with("multipart/related") {
        return Err(Error::invalid(format!(
            "failed to parse Content-Type header: {content_type:?}"
        )));
    }
    let boundary = boundary_of(content_type)?;
    let parts = parse_parts(body, &boundary)?;
    if parts.len() < 2 {
        return Err(Error::invalid("multipart upload requires metadata and payload parts"));
    }

    let meta: Object = serde_json::from_slice(&parts[0].body)
        .map_err(|e| Error::invalid(format!("failed to parse metadata part as json: {e}")))?;
    Ok((meta, parts[1].body.clone()))
}

fn split_part(raw: &[u8]) -> Result<Part> {
    let (header_bytes, body) = match find(raw, b"\r\n\r\n") {
        Some(idx) => (&raw[..idx], &raw[idx + 4..]),
        None => match find(raw, b"\n\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 2..]),
            None => (&[][..], raw),
        },
    };

    let mut headers = Vec::new();
    for line in String::from_utf8_lossy(header_bytes).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::invalid(format!("malformed part header {line:?}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Part { headers, body: Bytes::copy_from_slice(body) })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn strip_crlf(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_prefix(b"\r\n").unwrap_or(buf);
    buf.strip_prefix(b"\n").unwrap_or(buf)
}

fn trim_trailing_crlf(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\r\n").unwrap_or(buf);
    buf.strip_suffix(b"\n").unwrap_or(buf)
}
