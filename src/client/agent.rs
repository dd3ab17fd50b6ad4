//! The public façade: URI in, pooled connection out, response back.

use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::header::HOST;
use http::{HeaderValue, Method, Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tracing::{debug, trace};

use super::conn::Builder;
use super::connect::{Connect, HttpConnector};
use super::pool::{Config, Key, Pool, Pooled};
use crate::body::Incoming;

/// An HTTP/1.1 client tying the pieces together.
///
/// For each request, the agent resolves the URI to a pool key, reuses a
/// cached quiescent connection for that key if one exists (or asks its
/// connector for a new transport), injects a `Host` header when the caller
/// didn't supply one, and issues the request. Completed persistent
/// connections return to the pool by themselves.
///
/// When a *reused* connection turns out to be dead — the request was never
/// sent, failed while being written, or the connection closed before any
/// response byte — an idempotent, bodyless request is transparently retried
/// exactly once on a fresh connection.
pub struct Agent<C, B>
where
    B: Body,
{
    connector: C,
    pool: Pool<AgentBody<B>>,
}

impl<B> Agent<HttpConnector, B>
where
    B: Body + Send + 'static,
    B::Data: Send + Unpin,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    /// An agent without connection reuse: every request opens a fresh
    /// plain-TCP connection, closed once the exchange completes.
    pub fn new() -> Self {
        Agent::with_config(
            HttpConnector::new(),
            Config {
                persistent: false,
                ..Config::default()
            },
        )
    }
}

impl<B> Default for Agent<HttpConnector, B>
where
    B: Body + Send + 'static,
    B::Data: Send + Unpin,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    fn default() -> Self {
        Agent::new()
    }
}

impl<C, B> Agent<C, B>
where
    C: Connect,
    B: Body + Send + 'static,
    B::Data: Send + Unpin,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    /// An agent using `connector` for new transports and a pool configured
    /// by `config`.
    pub fn with_config(connector: C, config: Config) -> Self {
        Agent {
            connector,
            pool: Pool::new(config),
        }
    }

    /// Issues a request, reusing or opening a connection as needed.
    ///
    /// The returned future resolves once the response head has arrived; the
    /// response body streams afterwards. Dropping the future before it
    /// resolves aborts the underlying exchange.
    pub async fn request(&self, req: Request<B>) -> crate::Result<Response<Incoming>> {
        let key = Key::from_uri(req.uri())?;

        let (mut parts, body) = req.into_parts();

        if !parts.headers.contains_key(HOST) {
            parts.headers.insert(HOST, host_header(&key)?);
        }

        // A request without a body producer is the only shape that is safe
        // to retry; remember enough to rebuild one.
        let no_body = body.size_hint().exact() == Some(0);
        let retry_parts = if self.pool.config().retry && no_body && is_idempotent(&parts.method) {
            Some((
                parts.method.clone(),
                parts.uri.clone(),
                parts.headers.clone(),
                parts.version,
            ))
        } else {
            None
        };

        let body = if no_body {
            AgentBody::Empty
        } else {
            AgentBody::User { body }
        };
        let req = Request::from_parts(parts, body);

        let (mut pooled, reused) = match self.pool.checkout(&key) {
            Some(pooled) => (pooled, true),
            None => (self.connect(&key).await?, false),
        };

        match pooled.sender.try_send_request(req).await {
            Ok(res) => {
                self.repool(key, pooled);
                Ok(res)
            }
            Err(mut err) => {
                if reused && retry_parts.is_some() && should_retry(err.error()) {
                    debug!("retrying request on a new connection: {}", err.error());

                    let req = match err.take_message() {
                        Some(req) => req,
                        None => {
                            let (method, uri, headers, version) =
                                retry_parts.expect("retry_parts was checked");
                            let mut req = Request::new(AgentBody::Empty);
                            *req.method_mut() = method;
                            *req.uri_mut() = uri;
                            *req.headers_mut() = headers;
                            *req.version_mut() = version;
                            req
                        }
                    };

                    // Only ever one retry, and only on a brand-new
                    // connection; a second failure is the caller's.
                    let mut fresh = self.connect(&key).await?;
                    match fresh.sender.try_send_request(req).await {
                        Ok(res) => {
                            self.repool(key, fresh);
                            Ok(res)
                        }
                        Err(retry_err) => Err(retry_err.into_error()),
                    }
                } else {
                    Err(err.into_error())
                }
            }
        }
    }

    /// Closes every cached connection and waits for their tasks to finish.
    pub async fn close(&self) {
        self.pool.close().await
    }

    async fn connect(&self, key: &Key) -> crate::Result<Pooled<AgentBody<B>>> {
        trace!("opening a new connection for {}", key);
        let io = self
            .connector
            .connect(key)
            .await
            .map_err(crate::Error::new_connect)?;
        let (sender, connection) = Builder::new()
            .persistent(self.pool.config().persistent)
            .handshake(io)
            .await?;
        let conn_task = tokio::spawn(connection);
        Ok(Pooled { sender, conn_task })
    }

    /// Arranges for the session to re-enter the pool once it observably
    /// returns to the quiescent state.
    fn repool(&self, key: Key, mut pooled: Pooled<AgentBody<B>>) {
        if !self.pool.config().persistent {
            return;
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            // quiescence is observable as the connection asking for its
            // next request; a connection that closes instead just drops
            match pooled.sender.ready().await {
                Ok(()) => pool.put(key, pooled.sender, pooled.conn_task),
                Err(_) => trace!("connection closed instead of returning to pool"),
            }
        });
    }
}

impl<C: fmt::Debug, B: Body> fmt::Debug for Agent<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("connector", &self.connector)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Methods whose repetition has no additional effect, by convention.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE | Method::TRACE
    )
}

/// Whether a failure proves the peer never meaningfully processed the
/// request. Anything else (a partial response, a mid-body failure, a
/// protocol error, a cancellation) must not be replayed.
fn should_retry(err: &crate::Error) -> bool {
    if err.is_canceled() || err.is_aborted() {
        return false;
    }
    err.is_request_not_sent() || err.is_transmission_failed() || err.is_never_received()
}

fn host_header(key: &Key) -> crate::Result<HeaderValue> {
    let host = key.host();
    let value = if key.is_default_port() {
        if host.contains(':') {
            format!("[{}]", host)
        } else {
            return HeaderValue::from_str(host).map_err(|_| crate::Error::new_header());
        }
    } else if host.contains(':') {
        format!("[{}]:{}", host, key.port())
    } else {
        format!("{}:{}", host, key.port())
    };
    HeaderValue::from_str(&value).map_err(|_| crate::Error::new_header())
}

pin_project! {
    /// The body actually sent over a connection: the caller's body, or the
    /// re-creatable empty body a retried request is rebuilt with.
    #[project = AgentBodyProj]
    enum AgentBody<B> {
        Empty,
        User { #[pin] body: B },
    }
}

impl<B: Body> Body for AgentBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            AgentBodyProj::Empty => Poll::Ready(None),
            AgentBodyProj::User { body } => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            AgentBody::Empty => true,
            AgentBody::User { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            AgentBody::Empty => SizeHint::with_exact(0),
            AgentBody::User { body } => body.size_hint(),
        }
    }
}
