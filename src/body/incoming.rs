use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::mpsc;
use futures_core::ready;
use futures_core::Stream; // for mpsc::Receiver
use http_body::{Body, Frame, SizeHint};

use super::DecodedLength;
use crate::common::watch;

type BodySender = mpsc::Sender<Result<Bytes, crate::Error>>;

/// A stream of `Bytes`, used when receiving a response body.
///
/// A good default [`Body`](http_body::Body) to use in many applications.
///
/// Bytes are only pulled off the connection while this body is polled, so a
/// response whose body is never read does not buffer unboundedly; the read
/// side of the connection stays paused instead. Any bytes that arrived
/// alongside the head are kept buffered and delivered in order once polling
/// begins.
#[must_use = "streams do nothing unless polled"]
pub struct Incoming {
    kind: Kind,
}

enum Kind {
    Empty,
    Chan {
        content_length: DecodedLength,
        want_tx: watch::Sender,
        data_rx: mpsc::Receiver<Result<Bytes, crate::Error>>,
    },
}

/// The connection-side sender half of an `Incoming` body channel.
///
/// The dispatcher decodes body bytes only when `poll_ready` reports the
/// receiving body has been polled, which is what keeps a slow or absent
/// consumer from forcing unbounded buffering.
#[must_use = "Sender does nothing unless sent on"]
pub(crate) struct Sender {
    want_rx: watch::Receiver,
    data_tx: BodySender,
}

const WANT_PENDING: usize = 1;
const WANT_READY: usize = 2;

impl Incoming {
    /// A body with no bytes: 204/304 responses, and responses to HEAD.
    pub(crate) fn empty() -> Incoming {
        Incoming { kind: Kind::Empty }
    }

    pub(crate) fn channel(content_length: DecodedLength) -> (Sender, Incoming) {
        let (data_tx, data_rx) = mpsc::channel(0);
        let (want_tx, want_rx) = watch::channel(WANT_PENDING);

        let tx = Sender { want_rx, data_tx };
        let rx = Incoming {
            kind: Kind::Chan {
                content_length,
                want_tx,
                data_rx,
            },
        };

        (tx, rx)
    }
}

impl Body for Incoming {
    type Data = Bytes;
    type Error = crate::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Chan {
                ref mut content_length,
                ref mut want_tx,
                ref mut data_rx,
            } => {
                want_tx.send(WANT_READY);

                match ready!(Pin::new(data_rx).poll_next(cx)) {
                    Some(Ok(chunk)) => {
                        content_length.sub_if(chunk.len() as u64);
                        Poll::Ready(Some(Ok(Frame::data(chunk))))
                    }
                    Some(Err(err)) => Poll::Ready(Some(Err(err))),
                    None => {
                        // The sender should always deliver an explicit
                        // terminal before hanging up; a missing one means the
                        // connection task died mid-body.
                        if content_length.into_opt().map_or(false, |rem| rem > 0) {
                            return Poll::Ready(Some(Err(crate::Error::new_response_failed())));
                        }
                        Poll::Ready(None)
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.kind {
            Kind::Empty => true,
            Kind::Chan { content_length, .. } => content_length == DecodedLength::ZERO,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.kind {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Chan { content_length, .. } => match content_length.into_opt() {
                Some(known) => SizeHint::with_exact(known),
                None => SizeHint::default(),
            },
        }
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[derive(Debug)]
        struct Streaming;
        #[derive(Debug)]
        struct Empty;

        let mut builder = f.debug_tuple("Incoming");
        match self.kind {
            Kind::Empty => builder.field(&Empty),
            Kind::Chan { .. } => builder.field(&Streaming),
        };

        builder.finish()
    }
}

impl Sender {
    /// Checks that the consumer has polled the body and the channel has a
    /// free slot.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        match self.want_rx.load(cx) {
            WANT_READY => (),
            WANT_PENDING => return Poll::Pending,
            watch::CLOSED => return Poll::Ready(Err(crate::Error::new_closed())),
            unexpected => unreachable!("want_rx value: {}", unexpected),
        }

        self.data_tx
            .poll_ready(cx)
            .map_err(|_| crate::Error::new_closed())
    }

    /// Sends data on this channel; only valid after `poll_ready` succeeded.
    pub(crate) fn try_send_data(&mut self, chunk: Bytes) -> Result<(), Bytes> {
        self.data_tx
            .try_send(Ok(chunk))
            .map_err(|err| err.into_inner().expect("just sent Ok"))
    }

    /// Terminates the body with an error. Best-effort: if the consumer is
    /// gone the error has nowhere to go anyway.
    pub(crate) fn send_error(&mut self, err: crate::Error) {
        let _ = self.data_tx.try_send(Err(err));
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[derive(Debug)]
        struct Open;
        #[derive(Debug)]
        struct Closed;

        let mut builder = f.debug_tuple("Sender");
        match self.want_rx.peek() {
            watch::CLOSED => builder.field(&Closed),
            _ => builder.field(&Open),
        };

        builder.finish()
    }
}
