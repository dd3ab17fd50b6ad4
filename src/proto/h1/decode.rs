use std::fmt;
use std::io;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::ready;
use tracing::{debug, trace};

use super::io::MemRead;
use crate::body::DecodedLength;

/// Decoders to handle different Transfer-Encodings.
///
/// A decoder turns the raw bytes following a response head into discrete
/// body chunks and a definite completion signal, detecting truncation.
#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    /// A Reader used when a Content-Length header is passed with a positive
    /// integer.
    Length(u64),
    /// A Reader used when Transfer-Encoding is `chunked`.
    Chunked(ChunkedState, u64),
    /// A Reader used for responses that don't indicate a length or chunked.
    ///
    /// Note: This should only used for `Response`s. The bool tracks when EOF
    /// is seen on the transport: the body is done, but whether it arrived
    /// whole is unknowable.
    Eof(bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    // constructors

    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked(ChunkedState::Size, 0),
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    pub(crate) fn new(len: DecodedLength) -> Self {
        match len {
            DecodedLength::CHUNKED => Decoder::chunked(),
            DecodedLength::CLOSE_DELIMITED => Decoder::eof(),
            length => Decoder::length(length.danger_len()),
        }
    }

    // methods

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Kind::Length(0) | Kind::Chunked(ChunkedState::End, _) | Kind::Eof(true)
        )
    }

    /// Whether this body has no end marker of its own, only the connection
    /// closing. A clean end of such a body is a potential data loss.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Kind::Eof(..))
    }

    /// Decodes the next body chunk.
    ///
    /// An empty `Bytes` signals the end of the body; callers check `is_eof`
    /// afterwards. Truncation surfaces as `UnexpectedEof`, malformed chunk
    /// framing as `InvalidData`.
    pub(crate) fn decode<R: MemRead>(
        &mut self,
        cx: &mut Context<'_>,
        body: &mut R,
    ) -> Poll<Result<Bytes, io::Error>> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    Poll::Ready(Ok(Bytes::new()))
                } else {
                    let to_read = *remaining as usize;
                    let buf = ready!(body.read_mem(cx, to_read))?;
                    let num = buf.as_ref().len() as u64;
                    if num > *remaining {
                        // the mem read only takes what was asked for, this
                        // should not be possible
                        unreachable!("read more bytes than expected")
                    } else if num == 0 {
                        self.kind = Kind::Length(0);
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            IncompleteBody,
                        )));
                    } else {
                        *remaining -= num;
                    }
                    Poll::Ready(Ok(buf))
                }
            }
            Kind::Chunked(ref mut state, ref mut size) => {
                loop {
                    let mut buf = None;
                    // advances the chunked state
                    *state = ready!(state.step(cx, body, size, &mut buf))?;
                    if *state == ChunkedState::End {
                        trace!("end of chunked");
                        return Poll::Ready(Ok(Bytes::new()));
                    }
                    if let Some(buf) = buf {
                        return Poll::Ready(Ok(buf));
                    }
                }
            }
            Kind::Eof(ref mut is_eof) => {
                if *is_eof {
                    Poll::Ready(Ok(Bytes::new()))
                } else {
                    // 8192 chosen because its about 2 packets, there's no
                    // real deal about it.
                    let buf = ready!(body.read_mem(cx, 8192))?;
                    *is_eof = buf.is_empty();
                    Poll::Ready(Ok(buf))
                }
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

macro_rules! byte (
    ($rdr:ident, $cx:expr) => ({
        let buf = ready!($rdr.read_mem($cx, 1))?;
        if !buf.is_empty() {
            buf[0]
        } else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF during chunked framing",
            )));
        }
    })
);

impl ChunkedState {
    fn step<R: MemRead>(
        &self,
        cx: &mut Context<'_>,
        body: &mut R,
        size: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        use self::ChunkedState::*;
        match *self {
            Size => ChunkedState::read_size(cx, body, size),
            SizeLws => ChunkedState::read_size_lws(cx, body, *size),
            Extension => ChunkedState::read_extension(cx, body, *size),
            SizeLf => ChunkedState::read_size_lf(cx, body, *size),
            Body => ChunkedState::read_body(cx, body, size, buf),
            BodyCr => ChunkedState::read_body_cr(cx, body),
            BodyLf => ChunkedState::read_body_lf(cx, body),
            EndCr => ChunkedState::read_end_cr(cx, body),
            EndLf => ChunkedState::read_end_lf(cx, body),
            End => Poll::Ready(Ok(ChunkedState::End)),
        }
    }

    fn read_size<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
        size: &mut u64,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        macro_rules! or_overflow {
            ($e:expr) => (
                match $e {
                    Some(val) => val,
                    None => return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid chunk size: overflow",
                    ))),
                }
            )
        }

        let radix = 16;
        match byte!(rdr, cx) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Poll::Ready(Ok(ChunkedState::SizeLws)),
            b';' => return Poll::Ready(Ok(ChunkedState::Extension)),
            b'\r' => return Poll::Ready(Ok(ChunkedState::SizeLf)),
            // tolerate a bare LF ending the size line
            b'\n' => return Poll::Ready(Ok(ChunkedState::after_size_line(*size))),
            _ => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Invalid chunk size line: Invalid Size",
                )));
            }
        }
        Poll::Ready(Ok(ChunkedState::Size))
    }

    fn read_size_lws<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
        size: u64,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match byte!(rdr, cx) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Poll::Ready(Ok(ChunkedState::SizeLws)),
            b';' => Poll::Ready(Ok(ChunkedState::Extension)),
            b'\r' => Poll::Ready(Ok(ChunkedState::SizeLf)),
            b'\n' => Poll::Ready(Ok(ChunkedState::after_size_line(size))),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid chunk size linear white space",
            ))),
        }
    }

    fn read_extension<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
        size: u64,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        // Extensions are skipped without being interpreted.
        match byte!(rdr, cx) {
            b'\r' => Poll::Ready(Ok(ChunkedState::SizeLf)),
            b'\n' => Poll::Ready(Ok(ChunkedState::after_size_line(size))),
            _ => Poll::Ready(Ok(ChunkedState::Extension)), // no supported extensions
        }
    }

    fn read_size_lf<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
        size: u64,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match byte!(rdr, cx) {
            b'\n' => Poll::Ready(Ok(ChunkedState::after_size_line(size))),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid chunk size LF",
            ))),
        }
    }

    /// The zero-size chunk is the end marker; anything else is body bytes.
    fn after_size_line(size: u64) -> ChunkedState {
        if size == 0 {
            ChunkedState::EndCr
        } else {
            debug!("incoming chunked header: {0:#x} ({0} bytes)", size);
            ChunkedState::Body
        }
    }

    fn read_body<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
        rem: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        trace!("Chunked read, remaining={:?}", rem);

        // cap remaining bytes at the max capacity of usize
        let rem_cap = match *rem {
            r if r > usize::MAX as u64 => usize::MAX,
            r => r as usize,
        };

        let slice = ready!(rdr.read_mem(cx, rem_cap))?;
        let count = slice.len();

        if count == 0 {
            *rem = 0;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                IncompleteBody,
            )));
        }
        *buf = Some(slice);
        *rem -= count as u64;

        if *rem > 0 {
            Poll::Ready(Ok(ChunkedState::Body))
        } else {
            Poll::Ready(Ok(ChunkedState::BodyCr))
        }
    }

    fn read_body_cr<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match byte!(rdr, cx) {
            b'\r' => Poll::Ready(Ok(ChunkedState::BodyLf)),
            b'\n' => Poll::Ready(Ok(ChunkedState::Size)),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid chunk body CR",
            ))),
        }
    }

    fn read_body_lf<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match byte!(rdr, cx) {
            b'\n' => Poll::Ready(Ok(ChunkedState::Size)),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid chunk body LF",
            ))),
        }
    }

    fn read_end_cr<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match byte!(rdr, cx) {
            b'\r' => Poll::Ready(Ok(ChunkedState::EndLf)),
            b'\n' => Poll::Ready(Ok(ChunkedState::End)),
            // The zero chunk must be followed immediately by the final CRLF;
            // a trailer section is not decodable here.
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk trailers are not supported",
            ))),
        }
    }

    fn read_end_lf<R: MemRead>(
        cx: &mut Context<'_>,
        rdr: &mut R,
    ) -> Poll<Result<ChunkedState, io::Error>> {
        match byte!(rdr, cx) {
            b'\n' => Poll::Ready(Ok(ChunkedState::End)),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid chunk end LF",
            ))),
        }
    }
}

#[derive(Debug)]
struct IncompleteBody;

impl fmt::Display for IncompleteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "end of file before message length reached")
    }
}

impl std::error::Error for IncompleteBody {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::poll_fn;

    /// Scripted reads: each call to `read_mem` serves at most one script
    /// entry, so chunk boundaries in the script become read boundaries.
    struct Script {
        parts: VecDeque<Bytes>,
    }

    impl Script {
        fn new<const N: usize>(parts: [&[u8]; N]) -> Script {
            Script {
                parts: parts.iter().map(|p| Bytes::copy_from_slice(p)).collect(),
            }
        }
    }

    impl MemRead for Script {
        fn read_mem(&mut self, _cx: &mut Context<'_>, len: usize) -> Poll<io::Result<Bytes>> {
            match self.parts.front_mut() {
                Some(part) => {
                    let n = std::cmp::min(len, part.len());
                    let out = part.split_to(n);
                    if part.is_empty() {
                        self.parts.pop_front();
                    }
                    Poll::Ready(Ok(out))
                }
                None => Poll::Ready(Ok(Bytes::new())),
            }
        }
    }

    async fn decode_all(decoder: &mut Decoder, rdr: &mut Script) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = poll_fn(|cx| decoder.decode(cx, rdr)).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    #[tokio::test]
    async fn length_decoder_exact() {
        let mut decoder = Decoder::length(5);
        let mut rdr = Script::new([b"helloextra"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"hello");
        assert!(decoder.is_eof());
        // the extra bytes were not consumed
        assert_eq!(rdr.parts[0], "extra"[..]);
    }

    #[tokio::test]
    async fn length_decoder_split_reads() {
        let mut decoder = Decoder::length(5);
        let mut rdr = Script::new([b"he", b"l", b"lo"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn length_decoder_truncated() {
        let mut decoder = Decoder::length(5);
        let mut rdr = Script::new([b"hel"]);
        let err = decode_all(&mut decoder, &mut rdr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_decoder_simple() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"5\r\nhello\r\n0\r\n\r\n"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"hello");
        assert!(decoder.is_eof());
        assert!(!decoder.is_close_delimited());
    }

    #[tokio::test]
    async fn chunked_decoder_multiple_chunks() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"2\r\nhe\r\n3\r\nllo\r\n0\r\n\r\n"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn chunked_decoder_arbitrary_splits() {
        // 0xE == 14 bytes, with CRLFs inside the chunk data
        let raw: &[u8] = b"4\r\nwiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
        for split in 1..raw.len() - 1 {
            let mut decoder = Decoder::chunked();
            let mut rdr = Script::new([&raw[..split], &raw[split..]]);
            let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
            assert_eq!(body, b"wikipedia in\r\n\r\nchunks.", "split at {}", split);
        }
    }

    #[tokio::test]
    async fn chunked_decoder_hex_sizes_and_extensions() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"A; ext=\"yes\"\r\n0123456789\r\n0\r\n\r\n"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn chunked_decoder_bare_lf() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"5\nhello\n0\n\n"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn chunked_decoder_invalid_size() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"whoops\r\n"]);
        let err = decode_all(&mut decoder, &mut rdr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn chunked_decoder_size_overflow() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"fffffffffffffffff\r\n"]);
        let err = decode_all(&mut decoder, &mut rdr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn chunked_decoder_truncated_before_zero_chunk() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"5\r\nhello\r\n"]);
        let err = decode_all(&mut decoder, &mut rdr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_decoder_rejects_trailers() {
        let mut decoder = Decoder::chunked();
        let mut rdr = Script::new([b"5\r\nhello\r\n0\r\nx-trailer: nope\r\n\r\n"]);
        let err = decode_all(&mut decoder, &mut rdr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_decoder_reads_until_close() {
        let mut decoder = Decoder::eof();
        let mut rdr = Script::new([b"any", b"thing at all"]);
        let body = decode_all(&mut decoder, &mut rdr).await.unwrap();
        assert_eq!(body, b"anything at all");
        assert!(decoder.is_eof());
        assert!(decoder.is_close_delimited());
    }
}
