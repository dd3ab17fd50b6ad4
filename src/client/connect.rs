//! The endpoint seam: how an [`Agent`](super::agent::Agent) obtains a
//! transport for a destination.
//!
//! The default [`HttpConnector`] opens a plain TCP stream. Anything needing
//! TLS, unix sockets, or a test double implements [`Connect`] and hands the
//! agent whatever `Read + Write` transport it likes.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use super::pool::Key;

/// Establishes transports for destinations.
pub trait Connect {
    /// The established transport.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// The future resolving to the transport.
    type Future: Future<Output = io::Result<Self::Io>> + Send;

    /// Opens a new transport to the destination.
    fn connect(&self, dst: &Key) -> Self::Future;
}

/// A plain-TCP connector for `http` destinations.
///
/// Names are resolved through the system resolver. Destinations with any
/// other scheme (notably `https`) need a connector that wraps the stream
/// accordingly.
#[derive(Clone, Debug, Default)]
pub struct HttpConnector {
    _private: (),
}

impl HttpConnector {
    /// Creates a plain-TCP connector.
    pub fn new() -> HttpConnector {
        HttpConnector::default()
    }
}

impl Connect for HttpConnector {
    type Io = TcpStream;
    type Future = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

    fn connect(&self, dst: &Key) -> Self::Future {
        if dst.scheme() != "http" {
            let err = io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "scheme {} requires a connector that can establish it",
                    dst.scheme()
                ),
            );
            return Box::pin(async move { Err(err) });
        }

        let host = dst.host().to_owned();
        let port = dst.port();
        Box::pin(async move {
            trace!("connecting to {}:{}", host, port);
            TcpStream::connect((host.as_str(), port)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_non_http_schemes() {
        let connector = HttpConnector::new();
        let key = Key::from_uri(&"https://example.com/".parse().unwrap()).unwrap();
        let err = connector.connect(&key).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn connects_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = HttpConnector::new();
        let uri = format!("http://127.0.0.1:{}/", addr.port()).parse().unwrap();
        let key = Key::from_uri(&uri).unwrap();

        let (io, accepted) = tokio::join!(connector.connect(&key), listener.accept());
        assert!(io.is_ok());
        assert!(accepted.is_ok());
    }
}
