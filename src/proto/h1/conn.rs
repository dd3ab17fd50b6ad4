use std::fmt;
use std::io;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_core::ready;
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace};

use super::io::Buffered;
use super::parse::Parser;
use super::{Decoder, EncodedBuf, Encoder};
use crate::body::DecodedLength;
use crate::headers;
use crate::proto::{BodyLength, RequestHead, ResponseHead};

/// The state machine for one HTTP/1.1 client connection.
///
/// A `Conn` sits over a `Read + Write` transport and runs request/response
/// exchanges on it, one at a time: it detects message boundaries, tracks
/// whether the connection can be kept alive for reuse, and keeps the read
/// and write halves honest about which phase of an exchange they are in.
///
/// The connection is quiescent when both halves are `Init` and keep-alive is
/// idle; it is in the transmitting-while-receiving overlap when reading has
/// finished a message while writing is still in `Body`.
pub(crate) struct Conn<T, B> {
    io: Buffered<T, EncodedBuf<B>>,
    state: State,
}

impl<T, B> Conn<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Buf,
{
    pub(crate) fn new(io: T) -> Conn<T, B> {
        Conn {
            io: Buffered::new(io),
            state: State {
                error: None,
                keep_alive: KA::Busy,
                max_headers: super::DEFAULT_MAX_HEADERS,
                method: None,
                notify_read: false,
                parser: None,
                persistent: true,
                reading: Reading::Init,
                seen_response_bytes: false,
                // We assume a modern world where the remote speaks HTTP/1.1.
                // If they tell us otherwise, we'll downgrade in `read_head`.
                version: Version::HTTP_11,
                writing: Writing::Init,
            },
        }
    }

    pub(crate) fn set_max_buf_size(&mut self, max: usize) {
        self.io.set_max_buf_size(max);
    }

    pub(crate) fn set_max_headers(&mut self, max: usize) {
        self.state.max_headers = max;
    }

    pub(crate) fn set_persistent(&mut self, persistent: bool) {
        self.state.persistent = persistent;
    }

    pub(crate) fn set_write_strategy_flatten(&mut self) {
        self.io.set_write_strategy_flatten();
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.state.is_read_closed()
    }

    pub(crate) fn is_write_closed(&self) -> bool {
        self.state.is_write_closed()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    /// A new response head can only be read once a request has started
    /// writing; a server must not speak first.
    pub(crate) fn can_read_head(&self) -> bool {
        if !matches!(self.state.reading, Reading::Init) {
            return false;
        }
        !matches!(self.state.writing, Writing::Init)
    }

    pub(crate) fn can_read_body(&self) -> bool {
        matches!(self.state.reading, Reading::Body(..))
    }

    pub(crate) fn poll_read_head(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<crate::Result<(ResponseHead, DecodedLength)>> {
        debug_assert!(self.can_read_head());
        trace!("Conn::read_head");

        loop {
            if self.state.parser.is_none() {
                let method = self
                    .state
                    .method
                    .clone()
                    .unwrap_or(Method::GET);
                self.state.parser = Some(Parser::new(method, self.state.max_headers));
            }

            let msg = match self
                .state
                .parser
                .as_mut()
                .expect("parser was just installed")
                .parse(self.io.read_buf_mut())
            {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    if self.io.read_buf().len() > self.io.max_buf_size() {
                        debug!("max_buf_size ({}) reached, closing", self.io.max_buf_size());
                        self.state.close();
                        return Poll::Ready(Err(crate::Error::new_too_large()));
                    }
                    match ready!(self.io.poll_read_from_io(cx)) {
                        Ok(0) => {
                            trace!("parse eof");
                            let err = if self.state.seen_response_bytes {
                                crate::Error::new_response_failed()
                            } else {
                                crate::Error::new_never_received()
                            };
                            self.state.close();
                            return Poll::Ready(Err(err));
                        }
                        Ok(_) => {
                            self.state.seen_response_bytes = true;
                            continue;
                        }
                        Err(e) => {
                            self.state.close();
                            return Poll::Ready(Err(crate::Error::new_io(e)));
                        }
                    }
                }
                Err(e) => {
                    debug!("parse error ({})", e);
                    self.state.close();
                    return Poll::Ready(Err(e));
                }
            };

            self.state.parser = None;

            self.state.busy();
            self.state.keep_alive &= msg.keep_alive;
            self.state.version = msg.head.version;

            let decode = msg.decode;
            if decode == DecodedLength::ZERO {
                self.state.reading = Reading::KeepAlive;
                self.try_keep_alive(cx);
            } else {
                self.state.reading = Reading::Body(Decoder::new(decode));
            }

            return Poll::Ready(Ok((msg.head, decode)));
        }
    }

    pub(crate) fn poll_read_body(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Bytes>>> {
        debug_assert!(self.can_read_body());

        let (reading, ret) = match self.state.reading {
            Reading::Body(ref mut decoder) => match ready!(decoder.decode(cx, &mut self.io)) {
                Ok(slice) => {
                    let (reading, chunk) = if decoder.is_eof() {
                        debug!("incoming body completed");
                        let reading = if decoder.is_close_delimited() {
                            // the peer hung up, nothing more to read
                            Reading::Closed
                        } else {
                            Reading::KeepAlive
                        };
                        let chunk = if !slice.is_empty() {
                            Some(Ok(slice))
                        } else {
                            None
                        };
                        (reading, chunk)
                    } else if slice.is_empty() {
                        error!("incoming body unexpectedly ended");
                        // This should be unreachable, since all the decoders
                        // either set eof=true or return an Err when reading
                        // an empty slice...
                        (Reading::Closed, None)
                    } else {
                        return Poll::Ready(Some(Ok(slice)));
                    };
                    (reading, Poll::Ready(chunk))
                }
                Err(e) => {
                    debug!("incoming body decode error: {}", e);
                    (Reading::Closed, Poll::Ready(Some(Err(e))))
                }
            },
            _ => unreachable!("poll_read_body invalid state: {:?}", self.state.reading),
        };

        self.state.reading = reading;
        self.try_keep_alive(cx);
        ret
    }

    /// Returns, and resets, whether the dispatcher should run the read poll
    /// again before parking.
    pub(crate) fn wants_read_again(&mut self) -> bool {
        let ret = self.state.notify_read;
        self.state.notify_read = false;
        ret
    }

    /// Keeps an eye on the transport when there is no message to read:
    /// detects the peer hanging up, and rejects bytes arriving outside any
    /// exchange.
    pub(crate) fn poll_read_keep_alive(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        debug_assert!(!self.can_read_head() && !self.can_read_body());

        if self.is_read_closed() {
            Poll::Pending
        } else if self.is_mid_message() {
            self.mid_message_detect_eof(cx)
        } else {
            self.require_empty_read(cx)
        }
    }

    fn is_mid_message(&self) -> bool {
        !matches!(
            (&self.state.reading, &self.state.writing),
            (&Reading::Init, &Writing::Init)
        )
    }

    // This will check to make sure the io object read is empty.
    //
    // This should only be called for an idle connection, wanting to verify
    // the peer stays silent until the next request.
    fn require_empty_read(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        debug_assert!(!self.can_read_head() && !self.can_read_body() && !self.is_read_closed());
        debug_assert!(!self.is_mid_message());

        if !self.io.read_buf().is_empty() {
            debug!("received an unexpected {} bytes", self.io.read_buf().len());
            return Poll::Ready(Err(crate::Error::new_unexpected_message()));
        }

        let num_read = ready!(self.force_io_read(cx)).map_err(crate::Error::new_io)?;

        if num_read == 0 {
            trace!("found EOF on idle connection, closing");
            self.state.close();
            return Poll::Ready(Ok(()));
        }

        debug!(
            "received unexpected {} bytes on an idle connection",
            num_read
        );
        Poll::Ready(Err(crate::Error::new_unexpected_message()))
    }

    fn mid_message_detect_eof(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        debug_assert!(!self.can_read_head() && !self.can_read_body() && !self.is_read_closed());
        debug_assert!(self.is_mid_message());

        if !self.io.read_buf().is_empty() {
            return Poll::Pending;
        }

        let num_read = ready!(self.force_io_read(cx)).map_err(crate::Error::new_io)?;

        if num_read == 0 {
            trace!("found unexpected EOF on busy connection: {:?}", self.state);
            self.state.close_read();
            Poll::Ready(Err(crate::Error::new_response_failed()))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn force_io_read(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        debug_assert!(!self.state.is_read_closed());

        let result = ready!(self.io.poll_read_from_io(cx));
        Poll::Ready(result.map_err(|e| {
            trace!("force_io_read; io error: {}", e);
            self.state.close();
            e
        }))
    }

    fn maybe_notify(&mut self, cx: &mut Context<'_>) {
        // its possible that we returned Pending from poll() without having
        // exhausted the underlying IO. We would have done this when we
        // determined we couldn't keep reading until we knew how writing
        // would finish.

        match self.state.reading {
            Reading::Body(..) | Reading::KeepAlive | Reading::Closed => return,
            Reading::Init => (),
        };

        match self.state.writing {
            Writing::Body(..) => return,
            Writing::Init | Writing::KeepAlive | Writing::Closed => (),
        }

        if !self.io.is_read_blocked() {
            if self.io.read_buf().is_empty() {
                match self.io.poll_read_from_io(cx) {
                    Poll::Ready(Ok(n)) => {
                        if n == 0 {
                            trace!("maybe_notify; read eof");
                            if self.state.is_idle() {
                                self.state.close();
                            } else {
                                self.close_read()
                            }
                            return;
                        }
                    }
                    Poll::Pending => {
                        trace!("maybe_notify; read_from_io blocked");
                        return;
                    }
                    Poll::Ready(Err(e)) => {
                        trace!("maybe_notify; read_from_io error: {}", e);
                        self.state.close();
                        self.state.error = Some(crate::Error::new_io(e));
                    }
                }
            }
            self.state.notify_read = true;
        }
    }

    fn try_keep_alive(&mut self, cx: &mut Context<'_>) {
        // A framed message that left surplus bytes in the read buffer is not
        // safely reusable: without pipelining support there is no consumer
        // for them.
        if matches!(
            (&self.state.reading, &self.state.writing),
            (&Reading::KeepAlive, &Writing::KeepAlive)
        ) && !self.io.read_buf().is_empty()
        {
            debug!(
                "{} leftover bytes after response, connection cannot be reused",
                self.io.read_buf().len()
            );
            self.state.close();
        }
        self.state.try_keep_alive();
        self.maybe_notify(cx);
    }

    pub(crate) fn can_write_head(&self) -> bool {
        if matches!(self.state.reading, Reading::Closed) {
            return false;
        }
        matches!(self.state.writing, Writing::Init)
    }

    pub(crate) fn can_write_body(&self) -> bool {
        match self.state.writing {
            Writing::Body(..) => true,
            Writing::Init | Writing::KeepAlive | Writing::Closed => false,
        }
    }

    pub(crate) fn can_buffer_body(&self) -> bool {
        self.io.can_buffer()
    }

    pub(crate) fn write_head(&mut self, head: RequestHead, body: Option<BodyLength>) {
        debug_assert!(self.can_write_head());

        self.state.busy();
        self.state.method = Some(head.subject.0.clone());
        self.state.seen_response_bytes = false;

        // A request that asks for the connection to close gets its wish.
        if headers::connection_close(&head.headers) {
            self.state.disable_keep_alive();
        }

        let persistent = self.state.persistent;
        let buf = self.io.headers_buf();
        match super::encode::encode_headers(&head, body, persistent, buf) {
            Ok(encoder) => {
                self.state.writing = if !encoder.is_eof() {
                    Writing::Body(encoder)
                } else {
                    Writing::KeepAlive
                };
            }
            Err(err) => {
                self.state.error = Some(err);
                self.state.writing = Writing::Closed;
            }
        }
    }

    pub(crate) fn write_body(&mut self, chunk: B) -> crate::Result<()> {
        debug_assert!(self.can_write_body() && self.can_buffer_body());
        // empty chunks should be discarded at Dispatcher level
        debug_assert!(chunk.remaining() != 0);

        let state = match self.state.writing {
            Writing::Body(ref mut encoder) => match encoder.encode(chunk) {
                Ok(encoded) => {
                    self.io.buffer(encoded);
                    if !encoder.is_eof() {
                        return Ok(());
                    }
                    Ok(Writing::KeepAlive)
                }
                Err(err) => Err(err),
            },
            _ => unreachable!("write_body invalid state: {:?}", self.state.writing),
        };

        match state {
            Ok(state) => {
                self.state.writing = state;
                Ok(())
            }
            Err(err) => {
                // an excess write pollutes the framing; the exchange is over
                self.state.writing = Writing::Closed;
                Err(err)
            }
        }
    }

    pub(crate) fn end_body(&mut self) -> crate::Result<()> {
        debug_assert!(self.can_write_body());

        let finished = match self.state.writing {
            Writing::Body(ref mut encoder) => encoder.end(),
            _ => return Ok(()),
        };

        match finished {
            Ok(end) => {
                if let Some(end) = end {
                    self.io.buffer(end);
                }
                self.state.writing = Writing::KeepAlive;
                Ok(())
            }
            Err(not_eof) => {
                // fewer bytes than declared were written; the peer would
                // wait forever for the rest
                self.state.writing = Writing::Closed;
                Err(not_eof)
            }
        }
    }

    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.io.poll_flush(cx))?;
        self.try_keep_alive(cx);
        trace!("flushed {:?}", self.state);
        Poll::Ready(Ok(()))
    }

    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.io.poll_shutdown(cx)) {
            Ok(()) => {
                trace!("shut down IO complete");
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                debug!("error shutting down IO: {}", e);
                Poll::Ready(Err(e))
            }
        }
    }

    /// If the read side can be cheaply drained, do so. Otherwise, close.
    pub(crate) fn poll_drain_or_close_read(&mut self, cx: &mut Context<'_>) {
        let _ = self.poll_read_body(cx);

        // If still in Reading::Body, just give up
        match self.state.reading {
            Reading::Init | Reading::KeepAlive => trace!("body drained"),
            _ => self.close_read(),
        }
    }

    pub(crate) fn close_read(&mut self) {
        self.state.close_read();
    }

    pub(crate) fn close_write(&mut self) {
        self.state.close_write();
    }

    pub(crate) fn close(&mut self) {
        self.state.close();
    }

    pub(crate) fn take_error(&mut self) -> crate::Result<()> {
        if let Some(err) = self.state.error.take() {
            Err(err)
        } else {
            Ok(())
        }
    }
}

impl<T, B: Buf> fmt::Debug for Conn<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("state", &self.state)
            .field("io", &self.io)
            .finish()
    }
}

struct State {
    /// If an error occurs when there wasn't a direct way to return it
    /// back to the user, this is set.
    error: Option<crate::Error>,
    /// Current keep-alive status.
    keep_alive: KA,
    max_headers: usize,
    /// If mid-message, the HTTP Method that started it.
    ///
    /// HEAD changes the body framing rules of the response.
    method: Option<Method>,
    /// Set to true when the Dispatcher should poll read operations
    /// again. See the `maybe_notify` method for more.
    notify_read: bool,
    /// The head parser for the in-flight exchange, if reading one.
    parser: Option<Parser>,
    /// Whether requests on this connection declare themselves persistent.
    persistent: bool,
    /// State of allowed reads
    reading: Reading,
    /// Whether any response bytes have arrived for the in-flight exchange.
    ///
    /// Losing the connection before any arrive is a different failure than
    /// losing it halfway through a response.
    seen_response_bytes: bool,
    /// Either HTTP/1.0 or 1.1 connection
    #[allow(unused)]
    version: Version,
    /// State of allowed writes
    writing: Writing,
}

#[derive(Debug)]
enum Reading {
    Init,
    Body(Decoder),
    KeepAlive,
    Closed,
}

enum Writing {
    Init,
    Body(Encoder),
    KeepAlive,
    Closed,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("State");
        builder
            .field("reading", &self.reading)
            .field("writing", &self.writing)
            .field("keep_alive", &self.keep_alive);

        // Only show error field if it's interesting...
        if let Some(ref error) = self.error {
            builder.field("error", error);
        }

        // Purposefully leaving off other fields..

        builder.finish()
    }
}

impl fmt::Debug for Writing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Writing::Init => f.write_str("Init"),
            Writing::Body(ref enc) => f.debug_tuple("Body").field(enc).finish(),
            Writing::KeepAlive => f.write_str("KeepAlive"),
            Writing::Closed => f.write_str("Closed"),
        }
    }
}

impl std::ops::BitAndAssign<bool> for KA {
    fn bitand_assign(&mut self, enabled: bool) {
        if !enabled {
            trace!("remote disabling keep-alive");
            *self = KA::Disabled;
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
enum KA {
    Idle,
    #[default]
    Busy,
    Disabled,
}

impl KA {
    fn idle(&mut self) {
        *self = KA::Idle;
    }

    fn busy(&mut self) {
        *self = KA::Busy;
    }

    fn disable(&mut self) {
        *self = KA::Disabled;
    }

    fn status(&self) -> KA {
        *self
    }
}

impl State {
    fn close(&mut self) {
        trace!("State::close()");
        self.reading = Reading::Closed;
        self.writing = Writing::Closed;
        self.keep_alive.disable();
    }

    fn close_read(&mut self) {
        trace!("State::close_read()");
        self.reading = Reading::Closed;
        self.keep_alive.disable();
    }

    fn close_write(&mut self) {
        trace!("State::close_write()");
        self.writing = Writing::Closed;
        self.keep_alive.disable();
    }

    fn try_keep_alive(&mut self) {
        match (&self.reading, &self.writing) {
            (&Reading::KeepAlive, &Writing::KeepAlive) => {
                if let KA::Busy = self.keep_alive.status() {
                    self.idle();
                } else {
                    trace!(
                        "try_keep_alive: could keep-alive, but status = {:?}",
                        self.keep_alive
                    );
                    self.close();
                }
            }
            (&Reading::Closed, &Writing::KeepAlive) | (&Reading::KeepAlive, &Writing::Closed) => {
                self.close()
            }
            _ => (),
        }
    }

    fn disable_keep_alive(&mut self) {
        self.keep_alive.disable()
    }

    fn busy(&mut self) {
        if let KA::Disabled = self.keep_alive.status() {
            return;
        }
        self.keep_alive.busy();
    }

    fn idle(&mut self) {
        debug_assert!(!self.is_idle(), "State::idle() called while idle");

        self.method = None;
        self.parser = None;
        self.keep_alive.idle();

        self.reading = Reading::Init;
        self.writing = Writing::Init;

        // When a client connection has just gone idle, the Dispatcher
        // should try the poll loop one more time, so as to poll the
        // pending requests stream.
        self.notify_read = true;
    }

    fn is_idle(&self) -> bool {
        matches!(self.keep_alive.status(), KA::Idle)
    }

    fn is_read_closed(&self) -> bool {
        matches!(self.reading, Reading::Closed)
    }

    fn is_write_closed(&self) -> bool {
        matches!(self.writing, Writing::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use http::Uri;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::proto::RequestLine;

    fn get_head(path: &str) -> RequestHead {
        let mut head = RequestHead::default();
        head.subject = RequestLine(Method::GET, path.parse::<Uri>().unwrap());
        head
    }

    async fn flush<T, B>(conn: &mut Conn<T, B>)
    where
        T: AsyncRead + AsyncWrite + Unpin,
        B: Buf,
    {
        poll_fn(|cx| conn.poll_flush(cx)).await.expect("flush")
    }

    /// A conn talking to an in-memory peer, like a live socket: reads block
    /// until the peer writes, and EOF only happens when the peer is dropped.
    fn conn_pair() -> (Conn<DuplexStream, Bytes>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (Conn::new(client), server)
    }

    async fn expect_request(server: &mut DuplexStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.expect("request bytes");
        assert_eq!(std::str::from_utf8(&buf).unwrap(), expected);
    }

    #[tokio::test]
    async fn exchange_returns_to_idle() {
        let (mut conn, mut server) = conn_pair();

        assert!(conn.can_write_head());
        conn.write_head(get_head("/"), None);
        assert!(!conn.can_write_head());
        flush(&mut conn).await;

        expect_request(&mut server, "GET / HTTP/1.1\r\n\r\n").await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let (head, decode) = poll_fn(|cx| conn.poll_read_head(cx)).await.expect("head");
        assert_eq!(head.subject, http::StatusCode::OK);
        assert_eq!(decode, DecodedLength::new(5));

        let chunk = poll_fn(|cx| conn.poll_read_body(cx))
            .await
            .expect("some")
            .expect("not an error");
        assert_eq!(chunk, "hello");
        assert!(!conn.can_read_body());

        assert!(conn.is_idle());
        assert!(conn.can_write_head());
    }

    #[tokio::test]
    async fn empty_body_statuses_are_immediately_complete() {
        let (mut conn, mut server) = conn_pair();

        conn.write_head(get_head("/"), None);
        flush(&mut conn).await;
        expect_request(&mut server, "GET / HTTP/1.1\r\n\r\n").await;
        server
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();

        let (head, decode) = poll_fn(|cx| conn.poll_read_head(cx)).await.expect("head");
        assert_eq!(head.subject, http::StatusCode::NO_CONTENT);
        assert_eq!(decode, DecodedLength::ZERO);
        assert!(conn.is_idle());
    }

    #[tokio::test]
    async fn eof_before_any_bytes_is_never_received() {
        let (mut conn, mut server) = conn_pair();

        conn.write_head(get_head("/"), None);
        flush(&mut conn).await;
        expect_request(&mut server, "GET / HTTP/1.1\r\n\r\n").await;
        drop(server);

        let err = poll_fn(|cx| conn.poll_read_head(cx))
            .await
            .expect_err("should fail");
        assert!(err.is_never_received());
        assert!(conn.is_read_closed());
        assert!(conn.is_write_closed());
    }

    #[tokio::test]
    async fn eof_after_partial_head_is_response_failed() {
        let (mut conn, mut server) = conn_pair();

        conn.write_head(get_head("/"), None);
        flush(&mut conn).await;
        expect_request(&mut server, "GET / HTTP/1.1\r\n\r\n").await;
        server.write_all(b"HTTP/1.1 200 OK\r\nx-part").await.unwrap();
        drop(server);

        let err = poll_fn(|cx| conn.poll_read_head(cx))
            .await
            .expect_err("should fail");
        assert!(err.is_response_failed());
    }

    #[tokio::test]
    async fn connection_close_response_is_not_reusable() {
        let (mut conn, mut server) = conn_pair();

        conn.write_head(get_head("/"), None);
        flush(&mut conn).await;
        expect_request(&mut server, "GET / HTTP/1.1\r\n\r\n").await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        poll_fn(|cx| conn.poll_read_head(cx)).await.expect("head");
        assert!(!conn.is_idle());
        assert!(conn.is_read_closed());
        assert!(!conn.can_write_head());
    }

    #[tokio::test]
    async fn leftover_bytes_prevent_reuse() {
        let (mut conn, mut server) = conn_pair();

        conn.write_head(get_head("/"), None);
        flush(&mut conn).await;
        expect_request(&mut server, "GET / HTTP/1.1\r\n\r\n").await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA")
            .await
            .unwrap();

        poll_fn(|cx| conn.poll_read_head(cx)).await.expect("head");
        let chunk = poll_fn(|cx| conn.poll_read_body(cx))
            .await
            .expect("some")
            .expect("data");
        assert_eq!(chunk, "ok");
        assert!(!conn.can_read_body());

        assert!(!conn.is_idle());
        assert!(!conn.can_write_head());
    }

    #[tokio::test]
    async fn non_persistent_conn_sends_close_and_closes() {
        let (mut conn, mut server) = conn_pair();
        conn.set_persistent(false);

        conn.write_head(get_head("/"), None);
        flush(&mut conn).await;
        expect_request(&mut server, "GET / HTTP/1.1\r\nconnection: close\r\n\r\n").await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        poll_fn(|cx| conn.poll_read_head(cx)).await.expect("head");
        assert!(!conn.is_idle());
    }

    #[tokio::test]
    async fn content_length_write_accounting() {
        let io = tokio_test::io::Builder::new()
            .write(b"PUT /up HTTP/1.1\r\ncontent-length: 5\r\n\r\n")
            .write(b"hel")
            .build();
        let mut conn = Conn::<_, Bytes>::new(io);

        let mut head = RequestHead::default();
        head.subject = RequestLine(Method::PUT, "/up".parse().unwrap());
        conn.write_head(head, Some(BodyLength::Known(5)));

        conn.write_body(Bytes::from_static(b"hel")).expect("write");
        flush(&mut conn).await;

        // ending early is a wrong body length error
        let err = conn.end_body().expect_err("short body");
        assert!(err.is_wrong_body_length());
        assert!(conn.is_write_closed());
    }

    #[tokio::test]
    async fn excess_write_is_rejected() {
        let io = tokio_test::io::Builder::new()
            .write(b"PUT /up HTTP/1.1\r\ncontent-length: 2\r\n\r\n")
            .build();
        let mut conn = Conn::<_, Bytes>::new(io);

        let mut head = RequestHead::default();
        head.subject = RequestLine(Method::PUT, "/up".parse().unwrap());
        conn.write_head(head, Some(BodyLength::Known(2)));
        flush(&mut conn).await;

        let err = conn
            .write_body(Bytes::from_static(b"way too long"))
            .expect_err("excess");
        assert!(err.is_excess_write());
        assert!(conn.is_write_closed());
    }
}
