use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Buf;
use futures_core::ready;
use http::{Request, Response};
use http_body::Body;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::Conn;
use crate::body::{DecodedLength, Incoming};
use crate::client::dispatch::{self, Callback, TrySendError};
use crate::proto::{BodyLength, Dispatched, MessageHead, RequestLine};

/// Drives one connection: pulls requests off the dispatch channel, writes
/// them through the `Conn` state machine, and resolves each request's
/// promise with the response (or the reason there is none).
///
/// This is the future a `Connection` polls. Exactly one request is in
/// flight at a time; the channel's readiness gating refuses a second one
/// until the connection observably returns to the quiescent state.
pub(crate) struct Dispatcher<T, B>
where
    B: Body,
{
    conn: Conn<T, B::Data>,
    dispatch_rx: dispatch::Receiver<Request<B>, Response<Incoming>>,
    rx_closed: bool,
    /// The promise for the in-flight request's response.
    callback: Option<Callback<Request<B>, Response<Incoming>>>,
    /// The sender half of the response body being streamed to the caller.
    body_tx: Option<BodyTx>,
    /// The caller's request body, while it is being written out.
    body_rx: Option<Pin<Box<B>>>,
    is_closing: bool,
}

struct BodyTx {
    sender: crate::body::Sender,
    /// A close-delimited body's clean end still can't be verified; it is
    /// reported as potential data loss rather than a normal end.
    close_delimited: bool,
}

impl<T, B> Dispatcher<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Body + 'static,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    pub(crate) fn new(
        conn: Conn<T, B::Data>,
        dispatch_rx: dispatch::Receiver<Request<B>, Response<Incoming>>,
    ) -> Self {
        Dispatcher {
            conn,
            dispatch_rx,
            rx_closed: false,
            callback: None,
            body_tx: None,
            body_rx: None,
            is_closing: false,
        }
    }

    fn poll_catch(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<Dispatched>> {
        Poll::Ready(ready!(self.poll_inner(cx)).or_else(|e| {
            // Route the error to whoever is still listening: the pending
            // response promise first, then a streaming response body. With
            // neither, the connection's owner gets it.
            if let Some(cb) = self.callback.take() {
                cb.send(Err(TrySendError {
                    error: e,
                    message: None,
                }));
                Ok(Dispatched::Shutdown)
            } else if let Some(mut body_tx) = self.body_tx.take() {
                body_tx.sender.send_error(e);
                Ok(Dispatched::Shutdown)
            } else {
                Err(e)
            }
        }))
    }

    fn poll_inner(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<Dispatched>> {
        self.poll_loop(cx)?;

        if self.is_done() {
            ready!(self.conn.poll_shutdown(cx)).map_err(crate::Error::new_shutdown)?;
            self.conn.take_error()?;
            Poll::Ready(Ok(Dispatched::Shutdown))
        } else {
            Poll::Pending
        }
    }

    fn poll_loop(&mut self, cx: &mut Context<'_>) -> crate::Result<()> {
        // Limit the looping on this connection, in case it is ready far too
        // often, so that other futures don't starve.
        for _ in 0..16 {
            let _ = self.poll_read(cx)?;
            let _ = self.poll_write(cx)?;
            let _ = self.poll_flush(cx)?;

            // This could happen if reading paused while writing continued,
            // and then writing finished, or the connection just went idle.
            if !self.conn.wants_read_again() {
                return Ok(());
            }
        }

        trace!("poll_loop yielding");
        cx.waker().wake_by_ref();
        Ok(())
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        loop {
            // A dropped promise is the caller canceling the exchange: the
            // transport is aborted outright, there is no graceful path that
            // leaves the peer a consistent half-request.
            if let Some(mut cb) = self.callback.take() {
                match cb.poll_canceled(cx) {
                    Poll::Ready(()) => {
                        // An abort, not a graceful close: the peer is mid
                        // request and there is no way to retract it.
                        trace!("request canceled, aborting connection");
                        self.body_rx = None;
                        self.conn.close();
                        self.is_closing = true;
                        return Poll::Ready(Err(crate::Error::new_canceled()));
                    }
                    Poll::Pending => {
                        self.callback = Some(cb);
                    }
                }
            }

            if self.body_tx.is_some() {
                if self.conn.can_read_body() {
                    match self.body_tx.as_mut().unwrap().sender.poll_ready(cx) {
                        Poll::Ready(Ok(())) => (),
                        Poll::Ready(Err(_closed)) => {
                            // The caller dropped the body: drain if that is
                            // cheap so the connection may still be reused.
                            trace!("response body receiver dropped");
                            self.body_tx = None;
                            self.conn.poll_drain_or_close_read(cx);
                            continue;
                        }
                        // Until a sink is attached (the body is polled), no
                        // more bytes are pulled off the transport.
                        Poll::Pending => return Poll::Pending,
                    }

                    match self.conn.poll_read_body(cx) {
                        Poll::Ready(Some(Ok(chunk))) => {
                            match self.body_tx.as_mut().unwrap().sender.try_send_data(chunk) {
                                Ok(()) => continue,
                                Err(_chunk) => {
                                    trace!("response body receiver dropped mid-send");
                                    self.body_tx = None;
                                    self.conn.close_read();
                                    continue;
                                }
                            }
                        }
                        Poll::Ready(Some(Err(err))) => {
                            let err = Self::map_body_read_error(err);
                            self.body_tx.take().unwrap().sender.send_error(err);
                            continue;
                        }
                        Poll::Ready(None) => continue,
                        Poll::Pending => return Poll::Pending,
                    }
                } else {
                    // The decoder reported completion; deliver the terminal.
                    let mut body_tx = self.body_tx.take().unwrap();
                    if body_tx.close_delimited {
                        body_tx
                            .sender
                            .send_error(crate::Error::new_potential_data_loss());
                    }
                    // dropping the sender is the clean end-of-body signal
                    continue;
                }
            } else if self.callback.is_some() {
                if self.conn.can_read_head() {
                    match ready!(self.conn.poll_read_head(cx)) {
                        Ok((head, decode)) => {
                            let body = if decode == DecodedLength::ZERO {
                                Incoming::empty()
                            } else {
                                let (tx, rx) = Incoming::channel(decode);
                                self.body_tx = Some(BodyTx {
                                    sender: tx,
                                    close_delimited: decode == DecodedLength::CLOSE_DELIMITED,
                                });
                                rx
                            };

                            let mut res = Response::new(body);
                            *res.status_mut() = head.subject;
                            *res.version_mut() = head.version;
                            *res.headers_mut() = head.headers;
                            *res.extensions_mut() = head.extensions;

                            let cb = self.callback.take().expect("callback is some");
                            cb.send(Ok(res));
                            continue;
                        }
                        Err(err) => return Poll::Ready(Err(err)),
                    }
                } else {
                    return self.conn.poll_read_keep_alive(cx);
                }
            } else {
                return self.conn.poll_read_keep_alive(cx);
            }
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        loop {
            if self.body_rx.is_none() && !self.rx_closed && self.conn.can_write_head() {
                match self.dispatch_rx.poll_recv(cx) {
                    Poll::Ready(Some((req, cb))) => {
                        let (parts, body) = req.into_parts();

                        let body_len = match body.size_hint().exact() {
                            Some(0) if !method_expects_body(&parts.method) => None,
                            Some(len) => Some(BodyLength::Known(len)),
                            None => Some(BodyLength::Unknown),
                        };

                        let head = MessageHead {
                            version: parts.version,
                            subject: RequestLine(parts.method, parts.uri),
                            headers: parts.headers,
                            extensions: http::Extensions::default(),
                        };

                        self.conn.write_head(head, body_len);
                        self.callback = Some(cb);

                        if self.conn.can_write_body() {
                            self.body_rx = Some(Box::pin(body));
                        }
                        continue;
                    }
                    Poll::Ready(None) => {
                        trace!("client tx closed");
                        self.rx_closed = true;
                        continue;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            } else if self.body_rx.is_some() {
                if !self.conn.can_write_body() {
                    // the declared framing is already satisfied (or the
                    // write side is gone); whatever the body has left is
                    // not wanted
                    trace!("body finished at framing level, dropping producer");
                    self.body_rx = None;
                    continue;
                }
                if !self.conn.can_buffer_body() {
                    ready!(self.poll_flush(cx))?;
                    continue;
                }

                let frame = ready!(self
                    .body_rx
                    .as_mut()
                    .expect("body_rx is some")
                    .as_mut()
                    .poll_frame(cx));

                match frame {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => {
                            if data.remaining() == 0 {
                                continue;
                            }
                            if let Err(err) = self.conn.write_body(data) {
                                // over-long writes corrupt the framing; the
                                // producer is dropped and the connection
                                // abandoned
                                self.body_rx = None;
                                self.conn.close();
                                return Poll::Ready(Err(err));
                            }
                            continue;
                        }
                        Err(_frame) => {
                            trace!("discarding unsupported frame");
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        // A local failure producing the request body. The
                        // peer has seen half a request; abort the transport.
                        self.body_rx = None;
                        self.conn.close();
                        return Poll::Ready(Err(crate::Error::new_user_body(e)));
                    }
                    None => {
                        self.body_rx = None;
                        if let Err(err) = self.conn.end_body() {
                            self.conn.close();
                            return Poll::Ready(Err(err));
                        }
                        continue;
                    }
                }
            } else {
                return Poll::Pending;
            }
        }
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        self.conn.poll_flush(cx).map_err(|err| {
            debug!("error writing: {}", err);
            if self.callback.is_some() || self.body_rx.is_some() {
                // the request was still in flight on the wire
                crate::Error::new_transmission(err)
            } else {
                crate::Error::new_io(err)
            }
        })
    }

    fn is_done(&self) -> bool {
        if self.is_closing {
            return true;
        }

        if self.conn.is_read_closed()
            && self.callback.is_none()
            && self.body_tx.is_none()
            && self.body_rx.is_none()
        {
            return true;
        }

        if self.rx_closed && self.conn.is_idle() && self.callback.is_none() {
            return true;
        }

        false
    }

    fn map_body_read_error(err: io::Error) -> crate::Error {
        if err.kind() == io::ErrorKind::InvalidData {
            // unintelligible framing, not a lost connection
            crate::Error::new_chunk().with(err)
        } else {
            crate::Error::new_response_failed().with(err)
        }
    }
}

impl<T, B> Drop for Dispatcher<T, B>
where
    B: Body,
{
    fn drop(&mut self) {
        // The task driving this connection was dropped out from under an
        // exchange (a pool shutdown, usually). Anyone still waiting gets an
        // aborted error rather than silence.
        if let Some(cb) = self.callback.take() {
            cb.send(Err(TrySendError {
                error: crate::Error::new_aborted(),
                message: None,
            }));
        }
        if let Some(mut body_tx) = self.body_tx.take() {
            body_tx.sender.send_error(crate::Error::new_aborted());
        }
    }
}

impl<T, B> Future for Dispatcher<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Body + 'static,
    B::Data: Buf + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = crate::Result<Dispatched>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_catch(cx)
    }
}

fn method_expects_body(method: &http::Method) -> bool {
    !matches!(
        *method,
        http::Method::GET
            | http::Method::HEAD
            | http::Method::OPTIONS
            | http::Method::DELETE
            | http::Method::TRACE
            | http::Method::CONNECT
    )
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::task::Poll;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn spawn_dispatcher<B>(
        io: tokio::io::DuplexStream,
    ) -> (
        dispatch::Sender<Request<B>, Response<Incoming>>,
        tokio::task::JoinHandle<crate::Result<Dispatched>>,
    )
    where
        B: Body + Send + 'static,
        B::Data: Buf + Send + Unpin,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let conn = Conn::<_, B::Data>::new(io);
        let (tx, rx) = dispatch::channel();
        let dispatcher = Dispatcher::new(conn, rx);
        (tx, tokio::spawn(dispatcher))
    }

    async fn read_some(server: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.expect("server read");
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn full_exchange_resolves_promise() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        let req = Request::get("/hello").body(Empty::new()).unwrap();
        let promise = tx.try_send(req).expect("send");

        let read = read_some(&mut server).await;
        assert_eq!(read, b"GET /hello HTTP/1.1\r\n\r\n");
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let res = promise.await.expect("promise").expect("response");
        assert_eq!(res.status(), http::StatusCode::OK);
        let body = res.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, "hello");

        // dropping the sender lets the connection task wind down
        drop(tx);
        let dispatched = conn_task.await.expect("task").expect("clean shutdown");
        assert!(matches!(dispatched, Dispatched::Shutdown));
    }

    #[tokio::test]
    async fn early_eof_fails_promise_with_never_received() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        let req = Request::get("/").body(Empty::new()).unwrap();
        let promise = tx.try_send(req).expect("send");

        let _ = read_some(&mut server).await;
        drop(server);

        let err = promise
            .await
            .expect("promise")
            .expect_err("should have failed");
        assert!(err.error().is_never_received());
    }

    #[tokio::test]
    async fn request_body_streams_with_content_length() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<Full<Bytes>>(client_io);

        let req = Request::post("/up")
            .body(Full::new(Bytes::from_static(b"ping!")))
            .unwrap();
        let promise = tx.try_send(req).expect("send");

        let mut read = Vec::new();
        while !read.ends_with(b"ping!") {
            read.extend_from_slice(&read_some(&mut server).await);
        }
        assert_eq!(
            std::str::from_utf8(&read).unwrap(),
            "POST /up HTTP/1.1\r\ncontent-length: 5\r\n\r\nping!"
        );

        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let res = promise.await.expect("promise").expect("response");
        assert_eq!(res.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn mid_body_disconnect_fails_body_not_promise() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        let req = Request::get("/").body(Empty::new()).unwrap();
        let promise = tx.try_send(req).expect("send");

        let _ = read_some(&mut server).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
            .await
            .unwrap();

        // The promise resolves as soon as the head is in...
        let res = promise.await.expect("promise").expect("response");
        assert_eq!(res.status(), http::StatusCode::OK);

        // ...then the connection dies before any body byte.
        drop(server);
        let err = res
            .into_body()
            .collect()
            .await
            .expect_err("body should fail");
        assert!(err.is_response_failed());
        assert!(!err.is_potential_data_loss());
    }

    #[tokio::test]
    async fn close_delimited_body_reports_potential_data_loss() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        let req = Request::get("/").body(Empty::new()).unwrap();
        let promise = tx.try_send(req).expect("send");

        let _ = read_some(&mut server).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nsome old body")
            .await
            .unwrap();
        drop(server);

        let res = promise.await.expect("promise").expect("response");
        let err = res
            .into_body()
            .collect()
            .await
            .expect_err("clean close of an unframed body is not verifiable");
        assert!(err.is_potential_data_loss());
    }

    #[tokio::test]
    async fn second_request_while_busy_is_rejected() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        let req = Request::get("/one").body(Empty::new()).unwrap();
        let _promise = tx.try_send(req).expect("first send");

        // The connection hasn't finished the first exchange, so the channel
        // refuses to even queue a second request.
        let second = Request::get("/two").body(Empty::new()).unwrap();
        assert!(tx.try_send(second).is_err());

        let _ = read_some(&mut server).await;
    }

    #[tokio::test]
    async fn canceled_promise_aborts_connection() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        let req = Request::get("/").body(Empty::new()).unwrap();
        let promise = tx.try_send(req).expect("send");

        let _ = read_some(&mut server).await;
        drop(promise);

        // The dispatcher notices the dropped promise and aborts; the
        // connection task reports the cancellation and the server sees EOF
        // rather than a response wait.
        let err = conn_task
            .await
            .expect("task")
            .expect_err("aborted by cancellation");
        assert!(err.is_canceled());

        let mut rest = Vec::new();
        let n = server.read_to_end(&mut rest).await.expect("eof");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn generation_failure_aborts_and_reports() {
        #[derive(Debug)]
        struct FailingBody;

        impl Body for FailingBody {
            type Data = Bytes;
            type Error = io::Error;

            fn poll_frame(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Option<Result<http_body::Frame<Bytes>, io::Error>>> {
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "local source exploded",
                ))))
            }

            fn size_hint(&self) -> http_body::SizeHint {
                // unknown length, forces chunked framing
                http_body::SizeHint::default()
            }
        }

        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<FailingBody>(client_io);

        let req = Request::post("/up").body(FailingBody).unwrap();
        let promise = tx.try_send(req).expect("send");

        let _ = read_some(&mut server).await;

        let err = promise
            .await
            .expect("promise")
            .expect_err("generation failed");
        assert!(err.error().is_generation_failed());
    }

    #[tokio::test]
    async fn keep_alive_connection_reused_for_sequential_requests() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut tx, _conn_task) = spawn_dispatcher::<Empty<Bytes>>(client_io);

        for i in 0..2 {
            let req = Request::get("/seq").body(Empty::new()).unwrap();

            // wait until the connection is ready before the second send
            if i > 0 {
                poll_fn(|cx| tx.poll_ready(cx)).await.expect("ready again");
            }
            let promise = tx.try_send(req).expect("send");

            let read = read_some(&mut server).await;
            assert_eq!(read, b"GET /seq HTTP/1.1\r\n\r\n");
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();

            let res = promise.await.expect("promise").expect("response");
            let body = res.into_body().collect().await.expect("body").to_bytes();
            assert_eq!(body, "ok");
        }
    }
}
