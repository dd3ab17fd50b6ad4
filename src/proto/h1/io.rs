use std::cmp;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_core::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::common::buf::BufList;

/// The initial read buffer capacity, and the growth step once it fills.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// The default maximum read buffer size. A response head must fit within
/// this before the blank line is seen, or parsing fails as too large.
pub(crate) const DEFAULT_MAX_BUFFER_SIZE: usize = 8192 + 4096 * 100;

/// The minimum value that can be set to max buffer size.
pub(crate) const MINIMUM_MAX_BUFFER_SIZE: usize = INIT_BUFFER_SIZE;

/// The maximum number of distinct `Buf`s to hold in a list before requiring
/// a flush. Only affects when the write strategy is to queue buffers.
const MAX_BUF_LIST_BUFFERS: usize = 16;

/// A source of `Bytes` served from an in-memory buffer before touching the
/// underlying io. Decoders read through this so that bytes which arrived
/// early (in the same read as the head, say) are consumed in order, never
/// discarded.
pub(crate) trait MemRead {
    fn read_mem(&mut self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<Bytes>>;
}

/// The read buffer and write buffer around one transport.
pub(crate) struct Buffered<T, B> {
    io: T,
    read_buf: BytesMut,
    read_blocked: bool,
    max_buf_size: usize,
    write_buf: WriteBuf<B>,
}

impl<T, B> std::fmt::Debug for Buffered<T, B>
where
    B: Buf,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffered")
            .field("read_buf", &self.read_buf.len())
            .field("write_buf", &self.write_buf.remaining())
            .finish()
    }
}

impl<T, B> Buffered<T, B>
where
    T: AsyncRead + AsyncWrite + Unpin,
    B: Buf,
{
    pub(crate) fn new(io: T) -> Buffered<T, B> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(0),
            read_blocked: false,
            max_buf_size: DEFAULT_MAX_BUFFER_SIZE,
            write_buf: WriteBuf::new(),
        }
    }

    pub(crate) fn set_max_buf_size(&mut self, max: usize) {
        assert!(
            max >= MINIMUM_MAX_BUFFER_SIZE,
            "The max_buf_size cannot be smaller than {}.",
            MINIMUM_MAX_BUFFER_SIZE,
        );
        self.max_buf_size = max;
        self.write_buf.max_buf_size = max;
    }

    pub(crate) fn set_write_strategy_flatten(&mut self) {
        // this should always be called only at construction time,
        // so this assert is here to catch myself
        debug_assert!(self.write_buf.queue.bufs_cnt() == 0);
        self.write_buf.set_strategy(WriteStrategy::Flatten);
    }

    pub(crate) fn max_buf_size(&self) -> usize {
        self.max_buf_size
    }

    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        self.read_buf.as_ref()
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Return the "allocated" available space, not the potential space
    /// that could be allocated in the future.
    fn read_buf_remaining_mut(&self) -> usize {
        self.read_buf.capacity() - self.read_buf.len()
    }

    pub(crate) fn headers_buf(&mut self) -> &mut Vec<u8> {
        let buf = self.write_buf.headers_mut();
        &mut buf.bytes
    }

    pub(crate) fn buffer(&mut self, buf: B) {
        self.write_buf.buffer(buf)
    }

    pub(crate) fn can_buffer(&self) -> bool {
        self.write_buf.can_buffer()
    }

    pub(crate) fn is_read_blocked(&self) -> bool {
        self.read_blocked
    }

    pub(crate) fn poll_read_from_io(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.read_blocked = false;
        if self.read_buf_remaining_mut() < INIT_BUFFER_SIZE {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }

        let dst = self.read_buf.spare_capacity_mut();
        let mut buf = ReadBuf::uninit(dst);
        match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(_)) => {
                let n = buf.filled().len();
                trace!("received {} bytes", n);
                unsafe {
                    // Safety: the `n` bytes were initialized by poll_read.
                    let len = self.read_buf.len();
                    self.read_buf.set_len(len + n);
                }
                Poll::Ready(Ok(n))
            }
            Poll::Pending => {
                self.read_blocked = true;
                Poll::Pending
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        }
    }

    /// Flushes the write buffers to the transport, then flushes the
    /// transport itself.
    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_buf.remaining() > 0 {
            let n = if self.io.is_write_vectored() && self.write_buf.chunks_count() > 1 {
                let mut iovs = [IoSlice::new(&[]); MAX_BUF_LIST_BUFFERS];
                let cnt = self.write_buf.chunks_vectored(&mut iovs);
                ready!(Pin::new(&mut self.io).poll_write_vectored(cx, &iovs[..cnt]))?
            } else {
                ready!(Pin::new(&mut self.io).poll_write(cx, self.write_buf.chunk()))?
            };
            if n == 0 {
                trace!("write returned zero, but {} bytes remaining", self.write_buf.remaining());
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
            trace!("flushed {} bytes", n);
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin, B: Buf> MemRead for Buffered<T, B> {
    fn read_mem(&mut self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<Bytes>> {
        if !self.read_buf.is_empty() {
            let n = cmp::min(len, self.read_buf.len());
            Poll::Ready(Ok(self.read_buf.split_to(n).freeze()))
        } else {
            let n = ready!(self.poll_read_from_io(cx))?;
            Poll::Ready(Ok(self.read_buf.split_to(cmp::min(len, n)).freeze()))
        }
    }
}

/// A write buffer of a serialized head plus queued body buffers.
struct WriteBuf<B> {
    /// Re-usable buffer for serializing message heads into.
    headers: Cursor<Vec<u8>>,
    max_buf_size: usize,
    /// Deque of user buffers if strategy is Queue
    queue: BufList<B>,
    strategy: WriteStrategy,
}

impl<B: Buf> WriteBuf<B> {
    fn new() -> WriteBuf<B> {
        WriteBuf {
            headers: Cursor::new(Vec::with_capacity(INIT_BUFFER_SIZE)),
            max_buf_size: DEFAULT_MAX_BUFFER_SIZE,
            queue: BufList::new(),
            strategy: WriteStrategy::Queue,
        }
    }

    fn set_strategy(&mut self, strategy: WriteStrategy) {
        self.strategy = strategy;
    }

    fn buffer(&mut self, mut buf: B) {
        debug_assert!(buf.has_remaining());
        match self.strategy {
            WriteStrategy::Flatten => {
                let head = self.headers_mut();
                while buf.has_remaining() {
                    let chunk = buf.chunk();
                    head.bytes.extend_from_slice(chunk);
                    let n = chunk.len();
                    buf.advance(n);
                }
            }
            WriteStrategy::Queue => {
                self.queue.push(buf);
            }
        }
    }

    fn can_buffer(&self) -> bool {
        match self.strategy {
            WriteStrategy::Flatten => self.remaining() < self.max_buf_size,
            WriteStrategy::Queue => {
                self.queue.bufs_cnt() < MAX_BUF_LIST_BUFFERS && self.remaining() < self.max_buf_size
            }
        }
    }

    fn headers_mut(&mut self) -> &mut Cursor<Vec<u8>> {
        debug_assert!(!self.queue.has_remaining());
        &mut self.headers
    }

    fn chunks_count(&self) -> usize {
        let mut count = self.queue.bufs_cnt();
        if self.headers.has_remaining() {
            count += 1;
        }
        count
    }
}

impl<B: Buf> Buf for WriteBuf<B> {
    #[inline]
    fn remaining(&self) -> usize {
        self.headers.remaining() + self.queue.remaining()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        let headers = self.headers.chunk();
        if !headers.is_empty() {
            headers
        } else {
            self.queue.chunk()
        }
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        let hrem = self.headers.remaining();

        match hrem.cmp(&cnt) {
            cmp::Ordering::Equal => self.headers.reset(),
            cmp::Ordering::Greater => self.headers.advance(cnt),
            cmp::Ordering::Less => {
                let qcnt = cnt - hrem;
                self.headers.reset();
                self.queue.advance(qcnt);
            }
        }
    }

    #[inline]
    fn chunks_vectored<'t>(&'t self, dst: &mut [IoSlice<'t>]) -> usize {
        let n = self.headers.chunks_vectored(dst);
        self.queue.chunks_vectored(&mut dst[n..]) + n
    }
}

/// A cursor over a reusable `Vec<u8>`; resetting clears the vec so the
/// allocation is reused for the next head.
struct Cursor<T> {
    bytes: T,
    pos: usize,
}

impl Cursor<Vec<u8>> {
    #[inline]
    fn new(bytes: Vec<u8>) -> Cursor<Vec<u8>> {
        Cursor { bytes, pos: 0 }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.bytes.clear();
    }
}

impl Buf for Cursor<Vec<u8>> {
    #[inline]
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        debug_assert!(self.pos + cnt <= self.bytes.len());
        self.pos += cnt;
    }
}

#[derive(Clone, Copy, Debug)]
enum WriteStrategy {
    Flatten,
    Queue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    #[tokio::test]
    async fn read_mem_serves_buffer_before_io() {
        let io = tokio_test::io::Builder::new().read(b"world").build();
        let mut buffered = Buffered::<_, Bytes>::new(io);
        buffered.read_buf_mut().extend_from_slice(b"hello ");

        let first = poll_fn(|cx| buffered.read_mem(cx, 100)).await.unwrap();
        assert_eq!(first, "hello ");

        let second = poll_fn(|cx| buffered.read_mem(cx, 100)).await.unwrap();
        assert_eq!(second, "world");
    }

    #[tokio::test]
    async fn read_mem_respects_len() {
        let mut buffered = Buffered::<_, Bytes>::new(tokio_test::io::Builder::new().build());
        buffered.read_buf_mut().extend_from_slice(b"hello");

        let first = poll_fn(|cx| buffered.read_mem(cx, 2)).await.unwrap();
        assert_eq!(first, "he");
        assert_eq!(buffered.read_buf(), b"llo");
    }

    #[tokio::test]
    async fn flush_queue_strategy_writes_everything() {
        let io = tokio_test::io::Builder::new()
            .write(b"headers")
            .write(b"body one")
            .write(b"body two")
            .build();
        let mut buffered = Buffered::<_, Bytes>::new(io);

        buffered.headers_buf().extend_from_slice(b"headers");
        buffered.buffer(Bytes::from_static(b"body one"));
        buffered.buffer(Bytes::from_static(b"body two"));

        poll_fn(|cx| buffered.poll_flush(cx)).await.unwrap();
        assert_eq!(buffered.write_buf.remaining(), 0);
    }

    #[tokio::test]
    async fn flush_flatten_strategy_writes_everything() {
        let io = tokio_test::io::Builder::new()
            .write(b"headersbody onebody two")
            .build();
        let mut buffered = Buffered::<_, Bytes>::new(io);
        buffered.set_write_strategy_flatten();

        buffered.headers_buf().extend_from_slice(b"headers");
        buffered.buffer(Bytes::from_static(b"body one"));
        buffered.buffer(Bytes::from_static(b"body two"));

        poll_fn(|cx| buffered.poll_flush(cx)).await.unwrap();
        assert_eq!(buffered.write_buf.remaining(), 0);
    }

    #[test]
    fn write_buf_flatten_reuses_allocation() {
        let mut write_buf = WriteBuf::<Bytes>::new();
        write_buf.set_strategy(WriteStrategy::Flatten);

        write_buf.headers_mut().bytes.extend_from_slice(b"head");
        write_buf.buffer(Bytes::from_static(b"+body"));
        assert_eq!(write_buf.chunk(), b"head+body");

        let n = write_buf.remaining();
        write_buf.advance(n);
        assert_eq!(write_buf.remaining(), 0);
        assert!(write_buf.headers.bytes.is_empty());
    }
}
