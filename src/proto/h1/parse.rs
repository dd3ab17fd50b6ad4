//! A line-oriented parser for one HTTP/1.1 response head.
//!
//! The parser consumes complete lines out of the connection's read buffer as
//! they become available, so a head split across any number of reads parses
//! identically to one delivered whole. Two interoperability allowances are
//! made for non-conforming servers: a bare LF is accepted wherever CRLF is
//! expected, and obsolete header folding (a continuation line starting with
//! space or tab) is unfolded into the preceding header's value.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tracing::{debug, trace};

use crate::body::DecodedLength;
use crate::ext::ReasonPhrase;
use crate::headers;
use crate::proto::{MessageHead, ResponseHead};

/// Maximum number of headers accepted in one response head, unless
/// reconfigured through the connection builder.
pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;

/// Status codes whose responses never carry a body.
const NO_BODY_CODES: &[u16] = &[204, 304];

#[derive(Debug)]
enum State {
    /// Expecting the status line.
    Status,
    /// Looping over header lines until the blank terminator.
    Header,
    /// The head is complete; no further lines belong to it.
    Done,
}

/// A successfully parsed response head, plus what the connection needs to
/// know about the bytes that follow it.
#[derive(Debug)]
pub(crate) struct ParsedMessage {
    pub(crate) head: ResponseHead,
    pub(crate) decode: DecodedLength,
    /// Whether the peer left the connection reusable after this message.
    pub(crate) keep_alive: bool,
}

pub(crate) struct Parser {
    state: State,
    /// Method of the request this response answers. HEAD changes both the
    /// framing rules and the classification of content-length.
    method: Method,
    max_headers: usize,
    version: Version,
    status: StatusCode,
    reason: Option<Bytes>,
    /// Entity headers, handed to the application.
    headers: HeaderMap,
    /// Connection-control headers, consumed here and never exposed.
    conn_headers: HeaderMap,
    /// A header line (possibly folded) not yet committed to a table.
    partial_header: Option<Vec<u8>>,
    header_count: usize,
}

impl Parser {
    pub(crate) fn new(method: Method, max_headers: usize) -> Parser {
        Parser {
            state: State::Status,
            method,
            max_headers,
            version: Version::HTTP_11,
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            conn_headers: HeaderMap::new(),
            partial_header: None,
            header_count: 0,
        }
    }

    /// Consumes as many complete lines from `buf` as are available.
    ///
    /// Returns `Ok(None)` when more bytes are needed; the partial line (if
    /// any) is left in `buf`.
    pub(crate) fn parse(&mut self, buf: &mut BytesMut) -> crate::Result<Option<ParsedMessage>> {
        loop {
            let line = match take_line(buf) {
                Some(line) => line,
                None => return Ok(None),
            };

            match self.state {
                State::Status => {
                    self.parse_status_line(&line)?;
                    self.state = State::Header;
                }
                State::Header => {
                    if !line.is_empty() && (line[0] == b' ' || line[0] == b'\t') {
                        // A continuation of a header begun on a previous
                        // line (obsolete folding).
                        match self.partial_header {
                            Some(ref mut partial) => {
                                partial.extend_from_slice(&line);
                                continue;
                            }
                            None => {
                                debug!("continuation line before any header");
                                return Err(crate::Error::new_header());
                            }
                        }
                    }

                    // A non-continuation line commits whatever came before.
                    if let Some(partial) = self.partial_header.take() {
                        self.commit_header(&partial)?;
                    }

                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(Some(self.finish()?));
                    }

                    self.partial_header = Some(line.to_vec());
                }
                State::Done => unreachable!("parse called after Done"),
            }
        }
    }

    fn parse_status_line(&mut self, line: &[u8]) -> crate::Result<()> {
        let mut parts = line.splitn(3, |&b| b == b' ');

        self.version = match parts.next() {
            Some(b"HTTP/1.1") => Version::HTTP_11,
            Some(b"HTTP/1.0") => Version::HTTP_10,
            Some(other) => {
                debug!("unsupported HTTP version: {:?}", Bytes::copy_from_slice(other));
                return Err(crate::Error::new_version());
            }
            None => return Err(crate::Error::new_status()),
        };

        let code = parts.next().ok_or_else(crate::Error::new_status)?;
        self.status = StatusCode::from_bytes(code).map_err(|_| crate::Error::new_status())?;

        // The reason phrase may be empty or missing entirely; only keep it
        // when it isn't the canonical one for the code.
        if let Some(reason) = parts.next() {
            let canonical = self
                .status
                .canonical_reason()
                .map_or(false, |canon| canon.as_bytes() == reason);
            if !reason.is_empty() && !canonical {
                self.reason = Some(Bytes::copy_from_slice(reason));
            }
        }

        trace!("status line parsed: {:?} {}", self.version, self.status);
        Ok(())
    }

    fn commit_header(&mut self, raw: &[u8]) -> crate::Result<()> {
        self.header_count += 1;
        if self.header_count > self.max_headers {
            return Err(crate::Error::new_too_large());
        }

        let colon = raw
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(crate::Error::new_header)?;
        let name = HeaderName::from_bytes(&raw[..colon]).map_err(|_| crate::Error::new_header())?;
        let value = HeaderValue::from_bytes(trim_ows(&raw[colon + 1..]))
            .map_err(|_| crate::Error::new_header())?;

        if headers::is_connection_control(&name, &self.method) {
            self.conn_headers.append(name, value);
        } else {
            self.headers.append(name, value);
        }
        Ok(())
    }

    fn finish(&mut self) -> crate::Result<ParsedMessage> {
        let decode = self.decide_length()?;

        let keep_alive = match self.version {
            // An HTTP/1.0 peer only keeps the connection open when asked to.
            Version::HTTP_10 => headers::connection_keep_alive(&self.conn_headers),
            _ => !headers::connection_close(&self.conn_headers),
        };

        let mut head = MessageHead {
            version: self.version,
            subject: self.status,
            headers: std::mem::take(&mut self.headers),
            extensions: http::Extensions::default(),
        };
        if let Some(reason) = self.reason.take() {
            head.extensions.insert(ReasonPhrase::from_bytes(reason));
        }

        debug!("incoming body is {}", decode);

        Ok(ParsedMessage {
            head,
            decode,
            keep_alive,
        })
    }

    /// Decides the body framing, in order of precedence: no-body responses,
    /// then chunked transfer-encoding, then content-length, then
    /// read-until-close.
    fn decide_length(&mut self) -> crate::Result<DecodedLength> {
        if self.method == Method::HEAD || NO_BODY_CODES.contains(&self.status.as_u16()) {
            return Ok(DecodedLength::ZERO);
        }

        if let Some(te) = self.conn_headers.get(TRANSFER_ENCODING) {
            if headers::transfer_encoding_is_chunked(te) {
                return Ok(DecodedLength::CHUNKED);
            }
            // A transfer-encoding we can't decode means the body can't be
            // located; failing the exchange is the only safe option.
            debug!("unsupported transfer-encoding: {:?}", te);
            return Err(crate::Error::new_transfer_encoding());
        }

        match headers::content_length_parse_all(&self.conn_headers)? {
            Some(len) => DecodedLength::checked_new(len),
            None => Ok(DecodedLength::CLOSE_DELIMITED),
        }
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("state", &self.state)
            .field("headers", &self.header_count)
            .finish()
    }
}

/// Splits one line off the front of `buf`, tolerating a bare LF terminator.
///
/// Returns `None` when no full line is buffered yet.
fn take_line(buf: &mut BytesMut) -> Option<BytesMut> {
    let idx = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(idx + 1);
    line.truncate(idx);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    Some(line)
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |i| i + 1);
    &value[start..end]
}
