//! HTTP/1.1 client.
//!
//! The client side of this crate is layered:
//!
//! - [`conn`] holds the lower-level, per-connection API: `handshake` an IO
//!   object into a `SendRequest`/`Connection` pair and drive exchanges on
//!   it yourself.
//! - [`pool`] caches quiescent connections per destination, with idle
//!   expiry and capacity limits.
//! - [`agent`] ties both to a [`connect::Connect`] transport factory behind
//!   one `request()` call, including the one-shot retry of idempotent
//!   requests that hit a dead pooled connection.

pub mod agent;
pub mod conn;
pub mod connect;
pub(crate) mod dispatch;
pub mod pool;

pub use self::agent::Agent;
pub use self::connect::{Connect, HttpConnector};
pub use self::dispatch::TrySendError;
pub use self::pool::Pool;
