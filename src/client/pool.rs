//! A pool of persistent HTTP/1.1 connections.
//!
//! Connections are stored under a key of `(scheme, host, port)`; any
//! connection stored under a given key can be used interchangeably. A
//! connection enters the pool only after observably returning to the
//! quiescent state, and leaves it when checked out, when its idle timer
//! expires, or when it is evicted to make room for a fresher one.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Uri;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, trace};

use super::conn::SendRequest;

/// Configuration for a [`Pool`].
///
/// Passed explicitly to the constructor; there is no process-global pool
/// state.
#[derive(Clone, Debug)]
pub struct Config {
    /// The maximum number of quiescent connections cached per key.
    ///
    /// Inserting past the cap evicts and closes the oldest cached entry.
    pub max_idle_per_key: usize,
    /// How long a cached connection may sit idle before it is closed.
    pub idle_timeout: Duration,
    /// Whether idempotent requests that fail on a reused connection before
    /// any response arrived should be retried, once, on a fresh connection.
    pub retry: bool,
    /// Whether connections are persistent at all.
    ///
    /// A non-persistent pool never caches anything: every request gets a
    /// fresh connection which is closed after one exchange.
    pub persistent: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_idle_per_key: 2,
            idle_timeout: Duration::from_secs(240),
            retry: true,
            persistent: true,
        }
    }
}

/// The destination a connection is interchangeable for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    scheme: String,
    host: String,
    port: u16,
}

impl Key {
    /// Derives a pool key from a request URI.
    ///
    /// The URI must be absolute; the port falls back to the scheme default
    /// (80 for `http`, 443 for `https`).
    pub fn from_uri(uri: &Uri) -> crate::Result<Key> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| crate::Error::new_connect("URI has no scheme"))?
            .to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => 443,
            other => {
                return Err(crate::Error::new_connect(format!(
                    "unsupported URI scheme: {}",
                    other
                )))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| crate::Error::new_connect("URI has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = uri.port_u16().unwrap_or(default_port);

        Ok(Key { scheme, host, port })
    }

    /// The lowercased URI scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, already defaulted from the scheme if the URI had none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the port is the default one for the scheme, and so may be
    /// omitted from a Host header.
    pub(crate) fn is_default_port(&self) -> bool {
        matches!(
            (self.scheme.as_str(), self.port),
            ("http", 80) | ("https", 443)
        )
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A pool of quiescent connections, keyed by destination.
pub struct Pool<B> {
    inner: Arc<PoolInner<B>>,
}

impl<B> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<B> {
    config: Config,
    connections: Mutex<Connections<B>>,
}

struct Connections<B> {
    /// Oldest-returned connections first; checkout pops from the front.
    idle: HashMap<Key, VecDeque<Idle<B>>>,
    next_id: u64,
    is_closed: bool,
}

struct Idle<B> {
    id: u64,
    sender: SendRequest<B>,
    conn_task: JoinHandle<crate::Result<()>>,
    expiry: AbortHandle,
}

/// A connection checked out of (or destined for) the pool: the request
/// sender plus the handle of the task driving its transport.
pub(crate) struct Pooled<B> {
    pub(crate) sender: SendRequest<B>,
    pub(crate) conn_task: JoinHandle<crate::Result<()>>,
}

impl<B> Pool<B>
where
    B: Send + 'static,
{
    /// Creates an empty pool with the given configuration.
    pub fn new(config: Config) -> Pool<B> {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                connections: Mutex::new(Connections {
                    idle: HashMap::new(),
                    next_id: 0,
                    is_closed: false,
                }),
            }),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Pops the oldest cached connection for `key` that is still alive.
    ///
    /// A cached connection may have silently died (the peer timed it out);
    /// dead entries found on the way are discarded.
    pub(crate) fn checkout(&self, key: &Key) -> Option<Pooled<B>> {
        let mut connections = self.inner.connections.lock().unwrap();
        let list = connections.idle.get_mut(key)?;

        let mut reuse = None;
        while let Some(idle) = list.pop_front() {
            idle.expiry.abort();
            if idle.sender.is_ready() && !idle.sender.is_closed() {
                trace!("reusing idle connection for {}", key);
                reuse = Some(Pooled {
                    sender: idle.sender,
                    conn_task: idle.conn_task,
                });
                break;
            }
            trace!("discarding dead idle connection for {}", key);
        }

        if list.is_empty() {
            connections.idle.remove(key);
        }
        reuse
    }

    /// Returns a quiescent connection to the pool.
    ///
    /// A connection that is not observably quiescent is a programming error
    /// on the caller's part; it is rejected and dropped, never cached.
    pub(crate) fn put(&self, key: Key, sender: SendRequest<B>, conn_task: JoinHandle<crate::Result<()>>) {
        if !self.inner.config.persistent {
            return;
        }

        let mut connections = self.inner.connections.lock().unwrap();
        if connections.is_closed {
            trace!("pool is closed, dropping connection for {}", key);
            return;
        }

        if sender.is_closed() || !sender.is_ready() {
            error!("BUG: non-quiescent connection returned to pool");
            return;
        }

        let id = connections.next_id;
        connections.next_id += 1;

        let list = connections.idle.entry(key.clone()).or_default();
        if list.len() >= self.inner.config.max_idle_per_key {
            // the oldest entry makes room; dropping its sender lets the
            // connection task shut the transport down
            if let Some(evicted) = list.pop_front() {
                debug!("max idle per key reached, closing oldest connection for {}", key);
                evicted.expiry.abort();
            }
        }

        let expiry = {
            let pool = self.clone();
            let key = key.clone();
            let timeout = self.inner.config.idle_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                pool.expire(&key, id);
            })
            .abort_handle()
        };

        list.push_back(Idle {
            id,
            sender,
            conn_task,
            expiry,
        });
        trace!("pooled idle connection for {}", key);
    }

    fn expire(&self, key: &Key, id: u64) {
        let mut connections = self.inner.connections.lock().unwrap();
        if let Some(list) = connections.idle.get_mut(key) {
            if let Some(pos) = list.iter().position(|idle| idle.id == id) {
                debug!("idle connection for {} expired", key);
                // dropping the entry closes the connection gracefully
                list.remove(pos);
            }
            if list.is_empty() {
                connections.idle.remove(key);
            }
        }
    }

    /// Closes every cached connection and waits for their tasks to finish.
    ///
    /// Cached transports are aborted rather than gracefully closed; the pool
    /// refuses new entries afterwards.
    pub async fn close(&self) {
        let drained: Vec<Idle<B>> = {
            let mut connections = self.inner.connections.lock().unwrap();
            connections.is_closed = true;
            connections
                .idle
                .drain()
                .flat_map(|(_, list)| list)
                .collect()
        };

        let mut tasks = Vec::with_capacity(drained.len());
        for idle in drained {
            idle.expiry.abort();
            idle.conn_task.abort();
            tasks.push(idle.conn_task);
        }

        for task in tasks {
            // aborted tasks resolve with a cancellation; either way the
            // transport is gone by the time this returns
            let _ = task.await;
        }
        debug!("pool closed");
    }

    #[cfg(test)]
    fn idle_count(&self, key: &Key) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap()
            .idle
            .get(key)
            .map_or(0, VecDeque::len)
    }
}

impl<B> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::Empty;

    use super::super::conn;
    use super::*;

    type TestBody = Empty<Bytes>;

    fn key() -> Key {
        Key::from_uri(&"http://pool.test/".parse().unwrap()).unwrap()
    }

    fn config(idle_timeout: Duration) -> Config {
        Config {
            max_idle_per_key: 2,
            idle_timeout,
            retry: true,
            persistent: true,
        }
    }

    /// A live session over an in-memory transport, its connection task
    /// spawned and given a chance to reach the quiescent state.
    async fn quiescent_session() -> (Pooled<TestBody>, tokio::io::DuplexStream) {
        let (client_io, server) = tokio::io::duplex(4096);
        let (sender, connection) = conn::handshake::<_, TestBody>(client_io)
            .await
            .expect("handshake");
        let conn_task = tokio::spawn(connection);
        // let the connection task poll its channel, arming readiness
        tokio::task::yield_now().await;
        (Pooled { sender, conn_task }, server)
    }

    async fn assert_eof(mut server: tokio::io::DuplexStream) {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .expect("read");
        assert_eq!(n, 0, "expected the pool to have closed this connection");
    }

    #[tokio::test]
    async fn checkout_returns_cached_connection() {
        let pool = Pool::<TestBody>::new(config(Duration::from_secs(60)));
        let (pooled, _server) = quiescent_session().await;

        pool.put(key(), pooled.sender, pooled.conn_task);
        assert_eq!(pool.idle_count(&key()), 1);

        let reused = pool.checkout(&key()).expect("a cached connection");
        assert!(reused.sender.is_ready());
        assert_eq!(pool.idle_count(&key()), 0);

        // nothing else cached
        assert!(pool.checkout(&key()).is_none());
    }

    #[tokio::test]
    async fn repeated_cycles_never_duplicate_entries() {
        let pool = Pool::<TestBody>::new(config(Duration::from_secs(60)));
        let (mut pooled, _server) = quiescent_session().await;

        for _ in 0..3 {
            pool.put(key(), pooled.sender, pooled.conn_task);
            assert_eq!(pool.idle_count(&key()), 1);
            pooled = pool.checkout(&key()).expect("still cached");
        }
        assert_eq!(pool.idle_count(&key()), 0);
    }

    #[tokio::test]
    async fn non_quiescent_connection_is_rejected() {
        let pool = Pool::<TestBody>::new(config(Duration::from_secs(60)));

        // never spawn the connection task: the session can't have
        // observably reached quiescence
        let (client_io, _server) = tokio::io::duplex(4096);
        let (sender, connection) = conn::handshake::<_, TestBody>(client_io)
            .await
            .expect("handshake");
        assert!(!sender.is_ready());

        let conn_task = tokio::spawn(async move {
            drop(connection);
            Ok::<(), crate::Error>(())
        });
        pool.put(key(), sender, conn_task);
        assert_eq!(pool.idle_count(&key()), 0);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let pool = Pool::<TestBody>::new(config(Duration::from_secs(60)));

        let (first, server1) = quiescent_session().await;
        let (second, _server2) = quiescent_session().await;
        let (third, _server3) = quiescent_session().await;

        pool.put(key(), first.sender, first.conn_task);
        pool.put(key(), second.sender, second.conn_task);
        assert_eq!(pool.idle_count(&key()), 2);

        // the third return exceeds the cap of 2: the oldest is closed
        pool.put(key(), third.sender, third.conn_task);
        assert_eq!(pool.idle_count(&key()), 2);
        assert_eof(server1).await;
    }

    #[tokio::test]
    async fn idle_connections_expire() {
        let pool = Pool::<TestBody>::new(config(Duration::from_millis(20)));
        let (pooled, server) = quiescent_session().await;

        pool.put(key(), pooled.sender, pooled.conn_task);
        assert_eq!(pool.idle_count(&key()), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.idle_count(&key()), 0);
        assert!(pool.checkout(&key()).is_none());
        assert_eof(server).await;
    }

    #[tokio::test]
    async fn checkout_cancels_expiry() {
        let pool = Pool::<TestBody>::new(config(Duration::from_millis(20)));
        let (pooled, mut server) = quiescent_session().await;

        pool.put(key(), pooled.sender, pooled.conn_task);
        let reused = pool.checkout(&key()).expect("cached");

        // long after the timer would have fired, the connection is alive
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!reused.sender.is_closed());

        // and the transport is still open: a read would block, not EOF
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(50), server.read(&mut buf)).await;
        assert!(read.is_err(), "transport should still be open");
    }

    #[tokio::test]
    async fn dead_cached_connection_is_skipped() {
        let pool = Pool::<TestBody>::new(config(Duration::from_secs(60)));
        let (pooled, server) = quiescent_session().await;

        pool.put(key(), pooled.sender, pooled.conn_task);

        // the peer closes the cached connection behind the pool's back
        drop(server);
        tokio::task::yield_now().await;

        assert!(pool.checkout(&key()).is_none());
    }

    #[tokio::test]
    async fn close_aborts_cached_connections() {
        let pool = Pool::<TestBody>::new(config(Duration::from_secs(60)));
        let (first, server1) = quiescent_session().await;
        let (second, server2) = quiescent_session().await;

        pool.put(key(), first.sender, first.conn_task);
        pool.put(key(), second.sender, second.conn_task);

        pool.close().await;
        assert_eq!(pool.idle_count(&key()), 0);
        assert_eof(server1).await;
        assert_eof(server2).await;

        // returns after close are dropped, not cached
        let (late, _server3) = quiescent_session().await;
        pool.put(key(), late.sender, late.conn_task);
        assert_eq!(pool.idle_count(&key()), 0);
    }

    #[test]
    fn key_from_uri() {
        let key = Key::from_uri(&"http://example.com/path".parse().unwrap()).unwrap();
        assert_eq!(key.scheme(), "http");
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.port(), 80);
        assert!(key.is_default_port());

        let key = Key::from_uri(&"https://example.com:8443/".parse().unwrap()).unwrap();
        assert_eq!(key.port(), 8443);
        assert!(!key.is_default_port());

        let key = Key::from_uri(&"http://[::1]:8080/".parse().unwrap()).unwrap();
        assert_eq!(key.host(), "::1");
        assert_eq!(key.port(), 8080);

        assert!(Key::from_uri(&"/relative".parse().unwrap()).is_err());
        assert!(Key::from_uri(&"ftp://example.com/".parse().unwrap()).is_err());
    }
}
