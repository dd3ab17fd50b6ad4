use std::fmt;
use std::io::IoSlice;

use bytes::buf::Chain;
use bytes::Buf;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use tracing::{debug, trace};

use crate::proto::{BodyLength, RequestHead};

type StaticBuf = &'static [u8];

/// Encoders to handle different Transfer-Encodings.
///
/// A content-length encoder counts writes strictly: writing past the
/// declared length fails immediately, and finishing short of it fails at
/// `end`. A chunked encoder wraps every write in `<hex-size>\r\n…\r\n` and
/// terminates with the zero chunk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    /// An Encoder for when Content-Length is set.
    ///
    /// Enforces that the body is not longer than the Content-Length header.
    Length(u64),
    /// An Encoder for when Transfer-Encoding includes `chunked`.
    Chunked,
}

/// The encoded output of one body write: either the bytes as given, or the
/// bytes wrapped in chunked framing. Kept as chained buffers so the io layer
/// can hand them to a vectored write without flattening.
pub(crate) struct EncodedBuf<B> {
    kind: BufKind<B>,
}

enum BufKind<B> {
    Exact(B),
    Chunked(Chain<Chain<ChunkSize, B>, StaticBuf>),
    End(StaticBuf),
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    /// A content-length body is complete once its declared bytes have been
    /// written; a chunked body is only complete via `end`.
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self.kind, Kind::Length(0))
    }

    /// Encodes one body write.
    ///
    /// Fails with an excess-write error if `msg` would push a
    /// content-length body past its declared length; the caller must stop
    /// the body producer.
    pub(crate) fn encode<B: Buf>(&mut self, msg: B) -> crate::Result<EncodedBuf<B>> {
        let len = msg.remaining() as u64;
        debug_assert!(len > 0, "encode() called with empty buf");

        let kind = match self.kind {
            Kind::Chunked => {
                trace!("encoding chunked {}B", len);
                let buf = ChunkSize::new(len).chain(msg).chain(b"\r\n" as StaticBuf);
                BufKind::Chunked(buf)
            }
            Kind::Length(ref mut remaining) => {
                trace!("sized write, len = {}", len);
                if len > *remaining {
                    return Err(crate::Error::new_excess_write());
                }
                *remaining -= len;
                BufKind::Exact(msg)
            }
        };
        Ok(EncodedBuf { kind })
    }

    /// Signals the body producer finished.
    ///
    /// Returns the terminating chunk for a chunked body, and verifies a
    /// content-length body wrote exactly as many bytes as declared.
    pub(crate) fn end<B>(&mut self) -> crate::Result<Option<EncodedBuf<B>>> {
        match self.kind {
            Kind::Length(0) => Ok(None),
            Kind::Chunked => {
                self.kind = Kind::Length(0);
                Ok(Some(EncodedBuf {
                    kind: BufKind::End(b"0\r\n\r\n"),
                }))
            }
            Kind::Length(remaining) => {
                debug!("sized write ended {} bytes short", remaining);
                Err(crate::Error::new_wrong_body_length())
            }
        }
    }
}

/// Writes a request head into `dst` and returns the body encoder to use.
///
/// The head is always written as HTTP/1.1: request line, then the framing
/// header derived from the declared body length, then `connection: close`
/// when the request is not persistent, then the caller's headers in order.
pub(crate) fn encode_headers(
    head: &RequestHead,
    body: Option<BodyLength>,
    persistent: bool,
    dst: &mut Vec<u8>,
) -> crate::Result<Encoder> {
    const AVERAGE_HEADER_SIZE: usize = 30;

    let init_cursor = dst.len();
    dst.reserve(50 + head.headers.len() * AVERAGE_HEADER_SIZE);

    dst.extend_from_slice(head.subject.0.as_str().as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(
        head.subject
            .1
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .as_bytes(),
    );
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    let encoder = match body {
        Some(BodyLength::Known(len)) => {
            dst.extend_from_slice(b"content-length: ");
            let mut int_buf = itoa::Buffer::new();
            dst.extend_from_slice(int_buf.format(len).as_bytes());
            dst.extend_from_slice(b"\r\n");
            Encoder::length(len)
        }
        Some(BodyLength::Unknown) => {
            dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
            Encoder::chunked()
        }
        None => Encoder::length(0),
    };

    if !persistent && !head.headers.contains_key(CONNECTION) {
        dst.extend_from_slice(b"connection: close\r\n");
    }

    for (name, value) in head.headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            // body framing belongs to the connection, not the caller
            debug!("user-provided {} header is ignored", name);
            continue;
        }
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");

    trace!(
        "encoded request head, {} bytes, body = {:?}",
        dst.len() - init_cursor,
        body,
    );

    Ok(encoder)
}

impl<B: Buf> Buf for EncodedBuf<B> {
    #[inline]
    fn remaining(&self) -> usize {
        match self.kind {
            BufKind::Exact(ref b) => b.remaining(),
            BufKind::Chunked(ref b) => b.remaining(),
            BufKind::End(ref b) => b.remaining(),
        }
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        match self.kind {
            BufKind::Exact(ref b) => b.chunk(),
            BufKind::Chunked(ref b) => b.chunk(),
            BufKind::End(ref b) => b.chunk(),
        }
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        match self.kind {
            BufKind::Exact(ref mut b) => b.advance(cnt),
            BufKind::Chunked(ref mut b) => b.advance(cnt),
            BufKind::End(ref mut b) => b.advance(cnt),
        }
    }

    #[inline]
    fn chunks_vectored<'t>(&'t self, dst: &mut [IoSlice<'t>]) -> usize {
        match self.kind {
            BufKind::Exact(ref b) => b.chunks_vectored(dst),
            BufKind::Chunked(ref b) => b.chunks_vectored(dst),
            BufKind::End(ref b) => b.chunks_vectored(dst),
        }
    }
}

impl<B: Buf> fmt::Debug for EncodedBuf<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BufKind::Exact(..) => "Exact",
            BufKind::Chunked(..) => "Chunked",
            BufKind::End(..) => "End",
        };
        f.debug_struct("EncodedBuf").field("kind", &kind).finish()
    }
}

/// A chunk-size line, `<hex>\r\n`, formatted into a fixed inline buffer.
#[derive(Clone, Copy)]
struct ChunkSize {
    bytes: [u8; CHUNK_SIZE_MAX_BYTES],
    pos: u8,
    len: u8,
}

// u64 in hex is at most 16 characters, plus the CRLF.
const CHUNK_SIZE_MAX_BYTES: usize = 18;

impl ChunkSize {
    fn new(len: u64) -> ChunkSize {
        use std::fmt::Write;
        let mut size = ChunkSize {
            bytes: [0; CHUNK_SIZE_MAX_BYTES],
            pos: 0,
            len: 0,
        };
        write!(&mut size, "{:X}\r\n", len).expect("CHUNK_SIZE_MAX_BYTES fits any u64");
        size
    }
}

impl Buf for ChunkSize {
    #[inline]
    fn remaining(&self) -> usize {
        (self.len - self.pos).into()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.bytes[self.pos.into()..self.len.into()]
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining());
        self.pos += cnt as u8;
    }
}

impl fmt::Debug for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSize")
            .field("bytes", &&self.bytes[..self.len.into()])
            .field("pos", &self.pos)
            .finish()
    }
}

impl fmt::Write for ChunkSize {
    fn write_str(&mut self, num: &str) -> fmt::Result {
        use std::io::Write;
        (&mut self.bytes[self.len.into()..])
            .write_all(num.as_bytes())
            .expect("&mut [u8].write() cannot error");
        self.len += num.len() as u8;
        Ok(())
    }
}
