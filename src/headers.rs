//! Helpers for classifying and parsing HTTP/1.1 headers.
//!
//! The parser keeps two header tables per response: connection-control
//! headers, which govern framing and connection reuse and are consumed by the
//! protocol layer, and ordinary entity headers, which are handed to the
//! application untouched.

use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, Method};

/// Headers that describe the connection or the message framing rather than
/// the entity being transferred.
///
/// `proxy-connection` is not a standard header, but some servers emit it and
/// it must not leak through as an entity header.
const CONNECTION_CONTROL_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Returns whether `name` is a connection-control header for a response to
/// `method`.
///
/// Content-Length in the response to a HEAD request is an entity header, not
/// a connection-control header: HEAD responses never carry a body, so the
/// declared length describes the entity, not the framing.
pub(crate) fn is_connection_control(name: &HeaderName, method: &Method) -> bool {
    if *method == Method::HEAD && *name == CONTENT_LENGTH {
        return false;
    }
    CONNECTION_CONTROL_HEADERS.contains(&name.as_str())
}

pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    for value in headers.get_all(CONNECTION) {
        if connection_has(value, "close") {
            return true;
        }
    }
    false
}

pub(crate) fn connection_keep_alive(headers: &HeaderMap) -> bool {
    for value in headers.get_all(CONNECTION) {
        if connection_has(value, "keep-alive") {
            return true;
        }
    }
    false
}

fn connection_has(value: &HeaderValue, needle: &str) -> bool {
    if let Ok(s) = value.to_str() {
        for val in s.split(',') {
            if val.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

/// Parses every content-length value in `headers` into a single length.
///
/// Returns `Ok(None)` if no content-length header is present. Repeated
/// headers (or comma-joined values) are accepted only when every value parses
/// and all values agree; two distinct values are indistinguishable from
/// response smuggling and are an error.
pub(crate) fn content_length_parse_all(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut content_length: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let line = value
            .to_str()
            .map_err(|_| crate::Error::new_content_length())?;
        for v in line.split(',') {
            let n = from_digits(v.trim().as_bytes()).ok_or_else(crate::Error::new_content_length)?;
            match content_length {
                None => content_length = Some(n),
                Some(prev) if prev == n => (),
                Some(_) => return Err(crate::Error::new_content_length()),
            }
        }
    }
    Ok(content_length)
}

/// Checks a chunked transfer-encoding. Any other coding is unsupported.
pub(crate) fn transfer_encoding_is_chunked(value: &HeaderValue) -> bool {
    value
        .to_str()
        .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Parse a buffer of bytes as a base-10 integer.
///
/// `str::parse::<u64>` isn't used because it allows a leading sign, which a
/// content-length value must not have, and the input may not be UTF-8.
fn from_digits(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result = 0u64;
    const RADIX: u64 = 10;

    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(RADIX)?;
                result = result.checked_add((b - b'0') as u64)?;
            }
            _ => {
                // Not a DIGIT, get outta here!
                return None;
            }
        }
    }

    Some(result)
}
