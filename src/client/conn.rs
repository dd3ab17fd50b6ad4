//! Lower-level client connection API.
//!
//! The types in this module are to provide a lower-level API based around a
//! single connection. Connecting to a host, pooling connections, and the
//! like are out of scope for these types, and live in the
//! [`pool`](super::pool) and [`agent`](super::agent) modules.
//!
//! ## Example
//!
//! A simple example that uses the `SendRequest` struct to talk HTTP over
//! some IO object.
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, StatusCode};
//! use http_body_util::Empty;
//! use tokio::net::TcpStream;
//! use wirepool::client::conn;
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let io = TcpStream::connect("example.com:80").await?;
//!
//!     let (mut send_request, connection) = conn::handshake(io).await?;
//!
//!     // spawn a task to poll the connection and drive the HTTP state
//!     tokio::spawn(async move {
//!         let _ = connection.await;
//!     });
//!
//!     let request = Request::builder()
//!         .uri("/")
//!         .header("Host", "example.com")
//!         .body(Empty::<Bytes>::new())?;
//!     let response = send_request.send_request(request).await?;
//!     assert!(response.status() == StatusCode::OK);
//!     Ok(())
//! }
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::ready;
use http::{Request, Response};
use http_body::Body;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::dispatch::{self, TrySendError};
use crate::body::Incoming;
use crate::proto;

type Dispatcher<T, B> = proto::h1::Dispatcher<T, B>;

/// The sender side of an established connection.
///
/// Requests are issued one at a time; a request submitted while the
/// connection is not quiescent is refused without touching the transport.
pub struct SendRequest<B> {
    dispatch: dispatch::Sender<Request<B>, Response<Incoming>>,
}

/// A future that processes all HTTP state for the IO object.
///
/// In most cases, this should just be spawned into an executor, so that it
/// can process incoming and outgoing messages, notice hangups, and the like.
#[must_use = "futures do nothing unless polled"]
pub struct Connection<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Body + 'static,
{
    inner: Dispatcher<T, B>,
}

/// A builder to configure an HTTP connection.
///
/// After setting options, the builder is used to create a handshake future.
///
/// **Note**: The default values of options are not considered stable. They
/// are subject to change at any time.
#[derive(Clone, Debug)]
pub struct Builder {
    max_headers: Option<usize>,
    max_buf_size: Option<usize>,
    persistent: bool,
    writev: bool,
}

/// Returns a handshake future over some IO.
///
/// This is a shortcut for `Builder::new().handshake(io)`.
pub async fn handshake<T, B>(io: T) -> crate::Result<(SendRequest<B>, Connection<T, B>)>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Body + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    Builder::new().handshake(io).await
}

// ===== impl SendRequest

impl<B> SendRequest<B> {
    /// Polls to determine whether this sender can be used yet for a request.
    ///
    /// If the associated connection is closed, this returns an Error.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        self.dispatch.poll_ready(cx)
    }

    /// Waits until the dispatcher is ready
    ///
    /// If the associated connection is closed, this returns an Error.
    pub async fn ready(&mut self) -> crate::Result<()> {
        std::future::poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// Checks if the connection is currently ready to send a request.
    ///
    /// # Note
    ///
    /// This is mostly a hint. Due to inherent latency of networks, it is
    /// possible that even after checking this is ready, sending a request
    /// may still fail because the connection was closed in the meantime.
    pub fn is_ready(&self) -> bool {
        self.dispatch.is_ready()
    }

    /// Checks if the connection side has been closed.
    pub fn is_closed(&self) -> bool {
        self.dispatch.is_closed()
    }
}

impl<B> SendRequest<B>
where
    B: Body + 'static,
{
    /// Sends a `Request` on the associated connection.
    ///
    /// Returns a future that if successful, yields the `Response`.
    ///
    /// `req` must have a `Host` header (or be sent to a server that does not
    /// need one). The request's URI is serialized in origin-form, so
    /// everything other than its path and query is ignored.
    ///
    /// The future resolves as soon as the response head has been parsed;
    /// the body of the returned response streams afterwards, and failures
    /// during that streaming surface on the body, not here.
    pub fn send_request(&mut self, req: Request<B>) -> ResponseFuture {
        match self.dispatch.send(req) {
            Ok(rx) => ResponseFuture {
                inner: ResponseFutureState::Waiting { rx },
            },
            Err(_req) => {
                debug!("connection was not ready, request not sent");
                ResponseFuture {
                    inner: ResponseFutureState::Error {
                        error: Some(crate::Error::new_request_not_sent()),
                    },
                }
            }
        }
    }

    /// Sends a `Request` on the associated connection.
    ///
    /// Returns a future that if successful, yields the `Response`.
    ///
    /// Unlike [`send_request`](Self::send_request), if the connection turns
    /// out to be unusable before the request could be dispatched, the
    /// request is handed back inside the error so a caller may try it again
    /// on another connection.
    pub fn try_send_request(
        &mut self,
        req: Request<B>,
    ) -> impl Future<Output = Result<Response<Incoming>, TrySendError<Request<B>>>> {
        let sent = self.dispatch.try_send(req);
        async move {
            match sent {
                Ok(rx) => match rx.await {
                    Ok(Ok(res)) => Ok(res),
                    Ok(Err(err)) => Err(err),
                    // this is definitely an error if it ever happens, the
                    // dispatcher is responsible for always resolving
                    Err(_) => panic!("dispatch dropped without returning error"),
                },
                Err(req) => {
                    debug!("connection was not ready, request not sent");
                    Err(TrySendError {
                        error: crate::Error::new_request_not_sent(),
                        message: Some(req),
                    })
                }
            }
        }
    }
}

impl<B> fmt::Debug for SendRequest<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest").finish()
    }
}

// ===== impl Connection

impl<T, B> Future for Connection<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Body + 'static,
    B::Data: Unpin,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.inner).poll(cx))? {
            proto::Dispatched::Shutdown => Poll::Ready(Ok(())),
        }
    }
}

impl<T, B> fmt::Debug for Connection<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug,
    B: Body + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

// ===== impl Builder

impl Builder {
    /// Creates a new connection builder.
    #[inline]
    pub fn new() -> Builder {
        Builder {
            max_headers: None,
            max_buf_size: None,
            persistent: true,
            writev: true,
        }
    }

    /// Sets the maximum number of headers.
    ///
    /// When a response is received, the parser will return an error if there
    /// are more headers than this.
    ///
    /// Default is 100.
    pub fn max_headers(&mut self, val: usize) -> &mut Self {
        self.max_headers = Some(val);
        self
    }

    /// Sets the maximum buffer size for the connection.
    ///
    /// A response head must fit inside this before its terminating blank
    /// line is seen, or parsing fails.
    ///
    /// Default is ~400kb.
    ///
    /// # Panics
    ///
    /// The minimum value allowed is 8192. This method panics if the passed
    /// `max` is less than the minimum.
    pub fn max_buf_size(&mut self, max: usize) -> &mut Self {
        assert!(
            max >= proto::h1::MINIMUM_MAX_BUFFER_SIZE,
            "the max_buf_size cannot be smaller than the minimum that h1 specifies."
        );
        self.max_buf_size = Some(max);
        self
    }

    /// Sets whether to use vectored writes.
    ///
    /// When disabled, body buffers are flattened into the write buffer
    /// instead of being queued for a vectored write. Useful for transports
    /// that translate every write into a record of its own (TLS, most
    /// commonly), where many small writes are worse than one copy.
    ///
    /// Default is true.
    pub fn writev(&mut self, enabled: bool) -> &mut Self {
        self.writev = enabled;
        self
    }

    /// Sets whether requests on this connection declare the connection
    /// persistent.
    ///
    /// When false, every request is written with `connection: close` and the
    /// connection shuts down after one exchange instead of going quiescent.
    ///
    /// Default is true.
    pub fn persistent(&mut self, enabled: bool) -> &mut Self {
        self.persistent = enabled;
        self
    }

    /// Constructs a connection with the configured options and IO.
    pub async fn handshake<T, B>(&self, io: T) -> crate::Result<(SendRequest<B>, Connection<T, B>)>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        B: Body + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        tracing::trace!("client handshake HTTP/1");

        let (tx, rx) = dispatch::channel();
        let mut conn = proto::Conn::new(io);
        if let Some(max) = self.max_headers {
            conn.set_max_headers(max);
        }
        if let Some(max) = self.max_buf_size {
            conn.set_max_buf_size(max);
        }
        if !self.writev {
            conn.set_write_strategy_flatten();
        }
        conn.set_persistent(self.persistent);

        let dispatcher = Dispatcher::new(conn, rx);
        Ok((SendRequest { dispatch: tx }, Connection { inner: dispatcher }))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// ===== impl ResponseFuture

pin_project! {
    /// A future returned from [`SendRequest::send_request`].
    ///
    /// Yields a `Response` once the response head has arrived. Dropping this
    /// future before it resolves cancels the exchange: the transport is
    /// aborted, since HTTP/1.1 has no way to retract a request in flight.
    #[must_use = "futures do nothing unless polled"]
    pub struct ResponseFuture {
        #[pin]
        inner: ResponseFutureState,
    }
}

pin_project! {
    #[project = ResponseFutureStateProj]
    enum ResponseFutureState {
        Waiting {
            #[pin]
            rx: dispatch::Promise<Response<Incoming>>,
        },
        // Option is to be able to `take()` it in `poll`
        Error {
            error: Option<crate::Error>,
        },
    }
}

impl Future for ResponseFuture {
    type Output = crate::Result<Response<Incoming>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().inner.project() {
            ResponseFutureStateProj::Waiting { rx } => match ready!(rx.poll(cx)) {
                Ok(result) => Poll::Ready(result),
                // this is definitely an error if it ever happens, the
                // dispatcher is responsible for always resolving
                Err(_canceled) => panic!("dispatch dropped without returning error"),
            },
            ResponseFutureStateProj::Error { error } => {
                Poll::Ready(Err(error.take().expect("polled after complete")))
            }
        }
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn handshake_roundtrip() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut send_request, connection) =
            handshake::<_, Empty<Bytes>>(client_io).await.expect("handshake");
        tokio::spawn(connection);

        let res = send_request.send_request(
            Request::builder()
                .uri("/ping")
                .header("host", "test")
                .body(Empty::new())
                .unwrap(),
        );

        let mut read = [0u8; 64];
        let n = server.read(&mut read).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&read[..n]).unwrap(),
            "GET /ping HTTP/1.1\r\nhost: test\r\n\r\n"
        );
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
            .await
            .unwrap();

        let res = res.await.expect("response");
        assert_eq!(res.status(), http::StatusCode::OK);
        let body = res.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn second_request_while_busy_is_request_not_sent() {
        let (client_io, mut server) = tokio::io::duplex(4096);
        let (mut send_request, connection) =
            handshake::<_, Empty<Bytes>>(client_io).await.expect("handshake");
        tokio::spawn(connection);

        let _first = send_request.send_request(
            Request::builder().uri("/a").body(Empty::new()).unwrap(),
        );

        let second = send_request
            .send_request(Request::builder().uri("/b").body(Empty::new()).unwrap())
            .await
            .expect_err("busy connection must refuse");
        assert!(second.is_request_not_sent());

        // the transport never saw the second request
        let mut read = [0u8; 64];
        let n = server.read(&mut read).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&read[..n]).unwrap(),
            "GET /a HTTP/1.1\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn try_send_returns_request_on_refusal() {
        let (client_io, _server) = tokio::io::duplex(4096);
        let (mut send_request, connection) =
            handshake::<_, Empty<Bytes>>(client_io).await.expect("handshake");
        tokio::spawn(connection);

        let _first = send_request.send_request(
            Request::builder().uri("/a").body(Empty::new()).unwrap(),
        );

        let mut err = send_request
            .try_send_request(Request::builder().uri("/b").body(Empty::new()).unwrap())
            .await
            .expect_err("busy connection must refuse");
        assert!(err.error().is_request_not_sent());
        let recovered = err.take_message().expect("request comes back");
        assert_eq!(recovered.uri(), "/b");
    }
}
