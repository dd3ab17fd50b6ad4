//! The HTTP/1.1 client protocol: head parsing, body codecs, the connection
//! state machine, and the dispatcher that drives a connection from a request
//! channel.

pub(crate) use self::conn::Conn;
pub(crate) use self::decode::Decoder;
pub(crate) use self::dispatch::Dispatcher;
pub(crate) use self::encode::{EncodedBuf, Encoder};
pub(crate) use self::io::MINIMUM_MAX_BUFFER_SIZE;
pub(crate) use self::parse::DEFAULT_MAX_HEADERS;

mod conn;
mod decode;
pub(crate) mod dispatch;
mod encode;
mod io;
mod parse;
