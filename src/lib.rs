#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # wirepool
//!
//! A pooled HTTP/1.1 client connection library.
//!
//! wirepool implements the client side of one HTTP/1.1 connection — the
//! request/response state machine, streaming body encoders and decoders —
//! plus the machinery that makes persistent connections worth having: a
//! per-destination pool of quiescent connections with idle expiry, and
//! transparent one-shot retry of idempotent requests that land on a
//! connection the server already gave up on.
//!
//! ## Layers
//!
//! - [`client::conn`]: one connection at a time. You bring the IO object
//!   (anything `AsyncRead + AsyncWrite`), `handshake` splits it into a
//!   request sender and a connection future to spawn.
//! - [`client::Pool`]: caches quiescent senders per `(scheme, host, port)`.
//! - [`client::Agent`]: the front door. Resolves URIs, borrows from the
//!   pool or dials through a [`client::Connect`]or, fills in the `Host`
//!   header, and hands back an `http::Response<`[`body::Incoming`]`>`.
//!
//! ## Bodies
//!
//! Request bodies are anything implementing [`http_body::Body`]; the framing
//! is chosen from the body's size hint (an exact hint becomes a
//! `Content-Length`, an unbounded one becomes chunked transfer-encoding).
//! Response bodies arrive as [`body::Incoming`], which pulls bytes off the
//! connection only as it is polled.
//!
//! ## Errors
//!
//! Every failure surfaces as an [`Error`] whose predicates mirror the
//! lifecycle: a request refused on a busy connection
//! (`is_request_not_sent`), a failure while writing (`is_transmission_failed`),
//! a connection that died before any response byte (`is_never_received`) or
//! partway through one (`is_response_failed`), and the close-delimited
//! special case where a body's end simply cannot be verified
//! (`is_potential_data_loss`). Failures after the response head has been
//! delivered are reported on the response *body*, never on the already
//! resolved request future.

pub use crate::error::{Error, Result};

pub mod body;
pub mod client;
mod common;
mod error;
pub mod ext;
mod headers;
mod proto;
