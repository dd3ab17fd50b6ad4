//! Streaming bodies for Responses
//!
//! For both request bodies and response bodies, the gist of `http_body` is:
//!
//! - The `Body` trait describes a streaming producer of byte chunks: request
//!   bodies are anything implementing it, and the framing a request is sent
//!   with is chosen from its [`SizeHint`](http_body::Body::size_hint) — an
//!   exact hint becomes a `Content-Length`, anything else becomes chunked
//!   transfer-encoding.
//! - The [`Incoming`] concrete type is what a response arrives with: it
//!   streams the decoded body off the connection as it is polled, and
//!   surfaces mid-body failures as typed [`Error`](crate::Error)s
//!   (`is_response_failed`, `is_potential_data_loss`) without disturbing the
//!   already-delivered response head.

pub use self::incoming::Incoming;

pub(crate) use self::incoming::Sender;
pub(crate) use self::length::DecodedLength;

mod incoming;
mod length;

fn _assert_send_sync() {
    fn _assert_send<T: Send>() {}
    fn _assert_sync<T: Sync>() {}

    _assert_send::<Incoming>();
    _assert_sync::<Incoming>();
}
