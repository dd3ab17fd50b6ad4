//! Pieces pertaining to the HTTP message protocol.

use http::{HeaderMap, Method, StatusCode, Uri, Version};

pub(crate) mod h1;

pub(crate) use self::h1::Conn;

/// An incoming response head, or an outgoing request head.
#[derive(Debug, Default)]
pub(crate) struct MessageHead<S> {
    /// HTTP version of the message.
    pub(crate) version: Version,
    /// Subject (request line or status code) of the message.
    pub(crate) subject: S,
    /// Headers of the message.
    pub(crate) headers: HeaderMap,
    /// Extensions, used to carry the reason phrase when it isn't canonical.
    pub(crate) extensions: http::Extensions,
}

/// An outgoing request head.
pub(crate) type RequestHead = MessageHead<RequestLine>;

#[derive(Debug, Default, PartialEq)]
pub(crate) struct RequestLine(pub(crate) Method, pub(crate) Uri);

/// An incoming response head.
pub(crate) type ResponseHead = MessageHead<StatusCode>;

/// The length the caller declared for an outgoing body.
#[derive(Debug)]
pub(crate) enum BodyLength {
    /// Content-Length
    Known(u64),
    /// Transfer-Encoding: chunked (HTTP/1.1)
    Unknown,
}

/// Status of when a Dispatcher future completes.
#[derive(Debug)]
pub(crate) enum Dispatched {
    /// Dispatcher completely shutdown connection.
    Shutdown,
}
