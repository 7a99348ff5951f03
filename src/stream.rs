use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{ready, Stream, StreamExt};

use crate::error::{Result, SendError};
use crate::range::{ByteWindow, Multipart};

/// Forward-only slice of a byte source. Implements [`Stream`].
///
/// Emits the bytes of each window in order, framed as `multipart/byteranges`
/// when built with [`slice_multipart`]. The source is read strictly front to
/// back and dropped as soon as the last window is complete, on error, or when
/// the stream itself is dropped.
pub struct SlicedStream<S> {
    state: SliceState,
    windows: Vec<ByteWindow>,
    multipart: Option<Multipart>,
    current: usize,
    // offset of the first byte of `pending`, or of the next chunk pulled
    pos: u64,
    pending: Option<Bytes>,
    source: Option<S>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceState {
    PartHeader,
    Body,
    Closing,
    Finished,
}

/// Slices `source` to `windows`, concatenating them without framing.
///
/// Fails with [`SendError::NoWindows`] if `windows` is empty.
pub fn slice<S>(source: S, windows: Vec<ByteWindow>) -> Result<SlicedStream<S>> {
    SlicedStream::new(source, windows, None)
}

/// Slices `source` to the windows of `multipart`, emitting part headers and
/// the closing delimiter around them.
pub fn slice_multipart<S>(source: S, multipart: Multipart) -> Result<SlicedStream<S>> {
    let windows = multipart.windows().to_vec();
    SlicedStream::new(source, windows, Some(multipart))
}

impl<S> SlicedStream<S> {
    fn new(source: S, windows: Vec<ByteWindow>, multipart: Option<Multipart>) -> Result<Self> {
        if windows.is_empty() {
            return Err(SendError::NoWindows);
        }
        debug_assert!(windows.windows(2).all(|pair| pair[0].end < pair[1].start));
        Ok(SlicedStream {
            state: SliceState::PartHeader,
            windows,
            multipart,
            current: 0,
            pos: 0,
            pending: None,
            source: Some(source),
        })
    }

    fn release(&mut self) {
        if self.source.take().is_some() {
            tracing::trace!(pos = self.pos, "byte source released");
        }
        self.pending = None;
    }
}

impl<S: Stream<Item = io::Result<Bytes>> + Unpin> SlicedStream<S> {
    fn poll_source(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        match self.source.as_mut() {
            Some(source) => source.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl<S: Stream<Item = io::Result<Bytes>> + Unpin> Stream for SlicedStream<S> {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let this = &mut *self;

        loop {
            match this.state {
                SliceState::PartHeader => {
                    let Some(window) = this.windows.get(this.current).copied() else {
                        this.state = match this.multipart {
                            Some(_) => SliceState::Closing,
                            None => SliceState::Finished,
                        };
                        continue;
                    };

                    this.state = SliceState::Body;
                    if let Some(multipart) = &this.multipart {
                        return Poll::Ready(Some(Ok(Bytes::from(multipart.part_header(&window)))));
                    }
                }

                SliceState::Body => {
                    let window = this.windows[this.current];
                    let chunk = match this.pending.take() {
                        Some(chunk) => chunk,
                        None => match ready!(this.poll_source(cx)) {
                            Some(Ok(chunk)) => chunk,
                            Some(Err(e)) => {
                                this.state = SliceState::Finished;
                                this.release();
                                return Poll::Ready(Some(Err(e)));
                            }
                            None => {
                                let err = SendError::SourceExhausted {
                                    expected: window.end + 1,
                                    received: this.pos,
                                };
                                tracing::warn!(error = %err, "byte source shorter than declared");
                                this.state = SliceState::Finished;
                                this.release();
                                return Poll::Ready(Some(Err(err.into_io())));
                            }
                        },
                    };

                    let chunk_start = this.pos;
                    let chunk_end = chunk_start + chunk.len() as u64;

                    // fast forward to the window start
                    if chunk_end <= window.start {
                        this.pos = chunk_end;
                        continue;
                    }

                    let from = window.start.saturating_sub(chunk_start) as usize;
                    let to = (chunk_end.min(window.end + 1) - chunk_start) as usize;
                    let out = chunk.slice(from..to);

                    // keep the rest of the chunk for the next window
                    if to < chunk.len() {
                        this.pending = Some(chunk.slice(to..));
                    }
                    this.pos = chunk_start + to as u64;

                    if this.pos > window.end {
                        this.current += 1;
                        this.state = SliceState::PartHeader;
                    }

                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(out)));
                    }
                }

                SliceState::Closing => {
                    this.state = SliceState::Finished;
                    // the last window is done, nothing more will be pulled
                    this.release();
                    if let Some(multipart) = &this.multipart {
                        return Poll::Ready(Some(Ok(Bytes::from(multipart.closing()))));
                    }
                }

                SliceState::Finished => {
                    this.release();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<S> std::fmt::Debug for SlicedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlicedStream")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("pos", &self.pos)
            .field("released", &self.source.is_none())
            .finish()
    }
}
