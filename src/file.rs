use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{ready, Stream};
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::ByteSource;

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Implements [`ByteSource`] for any [`AsyncRead`], constructed with a fixed byte size.
///
/// Reads front to back and never yields more than `byte_size` bytes in total,
/// even if the underlying reader has grown since its size was taken.
#[pin_project]
pub struct KnownSize<R: AsyncRead> {
    byte_size: u64,
    remaining: u64,
    chunk_size: usize,
    // kept across polls, so a pending read does not lose the allocation
    buffer: BytesMut,
    #[pin]
    reader: R,
}

impl<R: AsyncRead> std::fmt::Debug for KnownSize<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownSize")
            .field("byte_size", &self.byte_size)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl KnownSize<tokio::fs::File> {
    /// Calls [`tokio::fs::File::metadata`] to determine file size.
    pub async fn file(file: tokio::fs::File) -> io::Result<KnownSize<tokio::fs::File>> {
        let byte_size = file.metadata().await?.len();
        Ok(KnownSize::sized(file, byte_size))
    }
}

impl<R: AsyncRead> KnownSize<R> {
    /// Construct a [`KnownSize`] instance with a byte size supplied manually.
    pub fn sized(reader: R, byte_size: u64) -> Self {
        KnownSize::sized_chunks(reader, byte_size, IO_BUFFER_SIZE)
    }

    /// Like [`KnownSize::sized`], reading at most `chunk_size` bytes per chunk.
    pub fn sized_chunks(reader: R, byte_size: u64, chunk_size: usize) -> Self {
        KnownSize {
            byte_size,
            remaining: byte_size,
            chunk_size: chunk_size.max(1),
            buffer: BytesMut::new(),
            reader,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<R: AsyncRead> Stream for KnownSize<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.project();
        if *this.remaining == 0 {
            return Poll::Ready(None);
        }

        // the smaller of the chunk size and the number of bytes remaining
        let nbytes = std::cmp::min(*this.chunk_size, usize::try_from(*this.remaining).unwrap_or(usize::MAX));
        if this.buffer.len() != nbytes {
            this.buffer.resize(nbytes, 0);
        }
        let mut read_buf = ReadBuf::new(&mut this.buffer[..]);

        let filled = match ready!(this.reader.poll_read(cx, &mut read_buf)) {
            Ok(()) => read_buf.filled().len(),
            Err(e) => return Poll::Ready(Some(Err(e))),
        };

        match filled {
            // short source, the consumer decides whether that is an error
            0 => Poll::Ready(None),
            n => {
                let mut chunk = mem::take(this.buffer);
                chunk.truncate(n);
                *this.remaining -= n as u64;
                Poll::Ready(Some(Ok(chunk.freeze())))
            }
        }
    }
}

impl<R: AsyncRead> ByteSource for KnownSize<R> {
    fn byte_size(&self) -> u64 {
        self.byte_size
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::fs::File;

    use super::*;
    use crate::ByteSource;

    #[tokio::test]
    async fn test_file_size() {
        let file = File::open("test/fixture.txt").await.unwrap();
        let known_size = KnownSize::file(file).await.unwrap();
        assert_eq!(54, known_size.byte_size());
    }

    #[tokio::test]
    async fn test_chunks() {
        let source = KnownSize::sized_chunks(&b"123456789"[..], 9, 4);
        let chunks: Vec<_> = source.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(vec!["1234", "5678", "9"], chunks.iter().map(|c| std::str::from_utf8(c).unwrap()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stops_at_declared_size() {
        let source = KnownSize::sized(&b"123456789"[..], 5);
        let chunks: Vec<_> = source.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(b"12345".as_slice(), chunks.concat().as_slice());
    }

    /// Reader that is not ready on its first poll.
    struct Stalling {
        stalled: bool,
        data: &'static [u8],
    }

    impl AsyncRead for Stalling {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if !self.stalled {
                self.stalled = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let n = std::cmp::min(buf.remaining(), self.data.len());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_pending_read_keeps_buffer() {
        let reader = Stalling { stalled: false, data: b"123456789" };
        let mut source = KnownSize::sized_chunks(reader, 9, 4);

        let first = futures::future::poll_fn(|cx| Poll::Ready(source.poll_next_unpin(cx))).await;
        assert!(first.is_pending());
        assert_eq!(4, source.buffer.len());
        let allocation = source.buffer.as_ptr();

        let chunk = source.next().await.unwrap().unwrap();
        assert_eq!(b"1234".as_slice(), &chunk[..]);
        assert_eq!(allocation, chunk.as_ptr());
    }

    #[tokio::test]
    async fn test_short_reader_ends() {
        let source = KnownSize::sized(&b"123"[..], 9);
        let chunks: Vec<_> = source.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(b"123".as_slice(), chunks.concat().as_slice());
    }
}
