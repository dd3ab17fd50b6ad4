//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can fail with `wirepool::Error`.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling an HTTP/1.1 exchange.
///
/// # Formatting
///
/// The `Display` implementation of this type will only print the details of
/// this level of error, even though it may have been caused by another error
/// and contain that error in its source. To print all the relevant
/// information, including the source chain, use something like
/// `std::error::Report`, or an equivalent 3rd-party type.
///
/// # Source
///
/// An `Error` may be caused by another error. To aid debugging, those are
/// exposed in `Error::source()` as erased types. While it is possible to
/// check the exact type of the sources, they **can not be depended on**. They
/// may come from private internal dependencies, and are subject to change at
/// any moment.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    Parse(Parse),
    User(User),
    /// A request was submitted while the connection was not idle.
    RequestNotSent,
    /// A network-level error occurred while the request was still being
    /// written to the transport.
    RequestTransmission,
    /// The connection was lost before any byte of a response arrived.
    ResponseNeverReceived,
    /// The connection was lost after some, but not all, of the response had
    /// been received.
    ResponseFailed,
    /// The response body was framed by connection close, and the connection
    /// closed without a way to verify the body arrived whole.
    PotentialDataLoss,
    /// The connection was aborted while an exchange was in flight.
    Aborted,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// Indicates a channel (between two internal tasks) is closed.
    ChannelClosed,
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream, outside of request transmission.
    Io,
    /// Error occurred while connecting to an endpoint.
    Connect,
    /// The connection received bytes when none were expected.
    UnexpectedMessage,
    /// Error calling AsyncWrite::shutdown().
    Shutdown,
}

#[derive(Debug)]
pub(super) enum Parse {
    Status,
    Version,
    Header,
    /// A content-length header was malformed or declared more than one
    /// distinct value.
    ContentLength,
    TransferEncoding,
    Chunk,
    TooLarge,
}

#[derive(Debug)]
pub(super) enum User {
    /// The caller's request body stream errored while it was being written.
    Body,
    /// The caller's request body wrote more bytes than its declared length.
    ExcessWrite,
    /// The caller's request body completed with fewer bytes than its
    /// declared length.
    WrongBodyLength,
    /// The connection task was dropped while a request was pending on it.
    DispatchGone,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if a request was submitted while the connection was not
    /// idle and was therefore never written to the transport.
    pub fn is_request_not_sent(&self) -> bool {
        matches!(self.inner.kind, Kind::RequestNotSent)
    }

    /// Returns true if the caller's request body failed while being read,
    /// before any network-level error occurred.
    pub fn is_generation_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::Body))
    }

    /// Returns true if a network-level error occurred while the request was
    /// still being written.
    pub fn is_transmission_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::RequestTransmission)
    }

    /// Returns true if the connection closed before any byte of a response
    /// arrived.
    pub fn is_never_received(&self) -> bool {
        matches!(self.inner.kind, Kind::ResponseNeverReceived)
    }

    /// Returns true if the connection closed after some, but not all, of the
    /// response had been received.
    pub fn is_response_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::ResponseFailed)
    }

    /// Returns true if a close-delimited response body ended with the
    /// connection closing, leaving it unknowable whether the body arrived
    /// whole.
    pub fn is_potential_data_loss(&self) -> bool {
        matches!(self.inner.kind, Kind::PotentialDataLoss)
    }

    /// Returns true if the connection was aborted mid-exchange.
    pub fn is_aborted(&self) -> bool {
        matches!(self.inner.kind, Kind::Aborted)
    }

    /// Returns true if this was about a `Request` that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if a sender's channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if this was an error while connecting to an endpoint.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the request body wrote more bytes than its declared
    /// length.
    pub fn is_excess_write(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::ExcessWrite))
    }

    /// Returns true if the request body completed with fewer bytes than its
    /// declared length.
    pub fn is_wrong_body_length(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::WrongBodyLength))
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    #[allow(unused)]
    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    pub(super) fn new_request_not_sent() -> Error {
        Error::new(Kind::RequestNotSent)
    }

    pub(super) fn new_transmission(cause: std::io::Error) -> Error {
        Error::new(Kind::RequestTransmission).with(cause)
    }

    pub(super) fn new_never_received() -> Error {
        Error::new(Kind::ResponseNeverReceived)
    }

    pub(super) fn new_response_failed() -> Error {
        Error::new(Kind::ResponseFailed)
    }

    pub(super) fn new_potential_data_loss() -> Error {
        Error::new(Kind::PotentialDataLoss)
    }

    pub(super) fn new_aborted() -> Error {
        Error::new(Kind::Aborted)
    }

    pub(super) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(super) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(super) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(super) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(super) fn new_unexpected_message() -> Error {
        Error::new(Kind::UnexpectedMessage)
    }

    pub(super) fn new_shutdown(cause: std::io::Error) -> Error {
        Error::new(Kind::Shutdown).with(cause)
    }

    fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(super) fn new_user_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new_user(User::Body).with(cause)
    }

    pub(super) fn new_excess_write() -> Error {
        Error::new_user(User::ExcessWrite)
    }

    pub(super) fn new_wrong_body_length() -> Error {
        Error::new_user(User::WrongBodyLength)
    }

    pub(super) fn new_user_dispatch_gone() -> Error {
        Error::new_user(User::DispatchGone)
    }

    pub(super) fn new_status() -> Error {
        Error::new(Kind::Parse(Parse::Status))
    }

    pub(super) fn new_version() -> Error {
        Error::new(Kind::Parse(Parse::Version))
    }

    pub(super) fn new_header() -> Error {
        Error::new(Kind::Parse(Parse::Header))
    }

    pub(super) fn new_content_length() -> Error {
        Error::new(Kind::Parse(Parse::ContentLength))
    }

    pub(super) fn new_transfer_encoding() -> Error {
        Error::new(Kind::Parse(Parse::TransferEncoding))
    }

    pub(super) fn new_chunk() -> Error {
        Error::new(Kind::Parse(Parse::Chunk))
    }

    pub(super) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Status) => "invalid HTTP status line parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncoding) => "unsupported transfer-encoding parsed",
            Kind::Parse(Parse::Chunk) => "invalid chunk framing parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::User(User::Body) => "error while reading the request body",
            Kind::User(User::ExcessWrite) => {
                "request body wrote more bytes than its declared length"
            }
            Kind::User(User::WrongBodyLength) => {
                "request body completed with fewer bytes than its declared length"
            }
            Kind::User(User::DispatchGone) => "dispatch task is gone",
            Kind::RequestNotSent => "connection was not ready, request was never sent",
            Kind::RequestTransmission => "connection error while writing the request",
            Kind::ResponseNeverReceived => "connection closed before a response was received",
            Kind::ResponseFailed => "connection closed before the response completed",
            Kind::PotentialDataLoss => "response body end could not be verified, connection closed",
            Kind::Aborted => "connection was aborted",
            Kind::Canceled => "operation was canceled",
            Kind::ChannelClosed => "channel closed",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            Kind::UnexpectedMessage => "received unexpected message from connection",
            Kind::Shutdown => "error shutting down connection",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("wirepool::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn error_satisfies_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>()
    }

    #[test]
    fn predicates_match_kinds() {
        assert!(Error::new_request_not_sent().is_request_not_sent());
        assert!(Error::new_never_received().is_never_received());
        assert!(Error::new_response_failed().is_response_failed());
        assert!(Error::new_potential_data_loss().is_potential_data_loss());
        assert!(Error::new_canceled().is_canceled());
        assert!(Error::new_content_length().is_parse());
        assert!(Error::new_user_body("boom").is_generation_failed());
        assert!(!Error::new_canceled().is_never_received());
    }

    #[test]
    fn source_chain_is_walkable() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = Error::new_transmission(io);
        assert!(err.is_transmission_failed());
        assert!(err.find_source::<std::io::Error>().is_some());
    }
}
