use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::ReadBuf;
use tracing::{info, warn, Span};

use crate::tracker::{now_ns, Delivered, RangeSlot, TransferTracker};
use crate::RangeBody;

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Reports the outcome of one range transfer to the [`TransferTracker`].
///
/// The report is made exactly once: when the interval has been read in full,
/// when reading fails, or when the body is dropped before either happened,
/// which is how the transport signals that the client went away.
#[derive(Debug)]
pub struct Delivery {
    tracker: TransferTracker,
    id: String,
    slot: RangeSlot,
    expected: u64,
    sent: u64,
    settled: bool,
    body_expected: bool,
    span: Span,
}

impl Delivery {
    pub fn new(
        tracker: TransferTracker,
        id: String,
        slot: RangeSlot,
        expected: u64,
        span: Span,
    ) -> Self {
        Delivery { tracker, id, slot, expected, sent: 0, settled: false, body_expected: true, span }
    }

    /// The response carries headers only (`HEAD`), so dropping the body
    /// unread is not a cancellation.
    pub fn without_body(mut self) -> Self {
        self.body_expected = false;
        self
    }

    fn settle(&mut self, client_cancelled: bool) {
        if mem::replace(&mut self.settled, true) {
            return;
        }
        let _enter = self.span.enter();

        let (expected, sent) = (self.expected, self.sent);
        if sent == expected {
            info!("[END: ok] expected bytes to return={expected}, actual copied={sent}");
        } else {
            info!(
                "[END: partial/cancel] expected bytes to return={expected}, actual copied={sent}"
            );
        }
        if client_cancelled {
            info!("client cancelled");
        }

        self.tracker.finalize(&self.id, self.slot, Delivered {
            returned_bytes: self.sent,
            end_time_ns: now_ns(),
            client_cancelled,
        });
    }

    fn fail(&mut self, err: &io::Error) {
        self.span.in_scope(|| warn!("copy error: {err}"));
        self.settle(false);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let cancelled = self.body_expected && self.sent < self.expected;
        self.settle(cancelled);
    }
}

/// Response body stream over an interval of a [`RangeBody`] whose read
/// cursor is already positioned at the start of the interval.
/// Implements [`Stream`], [`Body`], and [`IntoResponse`].
#[pin_project]
pub struct RangedStream<B> {
    state: StreamState,
    remaining: u64,
    delivery: Delivery,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub fn new(body: B, length: u64, delivery: Delivery) -> Self {
        RangedStream {
            state: StreamState::Reading { buffer: allocate_buffer() },
            remaining: length,
            delivery,
            body,
        }
    }
}

#[derive(Debug)]
enum StreamState {
    Reading { buffer: BytesMut },
    Done,
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.project();

        let StreamState::Reading { buffer } = this.state else {
            return Poll::Ready(None);
        };

        if *this.remaining == 0 {
            *this.state = StreamState::Done;
            this.delivery.settle(false);
            return Poll::Ready(None);
        }

        let uninit = buffer.spare_capacity_mut();

        // calculate max number of bytes to read in this iteration, the
        // smaller of the buffer size and the number of bytes remaining
        let nbytes = std::cmp::min(
            uninit.len(),
            usize::try_from(*this.remaining).unwrap_or(usize::MAX),
        );

        let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

        match this.body.poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                *this.state = StreamState::Done;
                this.delivery.fail(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Ok(())) => {
                match read_buf.filled().len() {
                    0 => {
                        // file shrank underneath us, deliver what we have
                        *this.state = StreamState::Done;
                        this.delivery.settle(false);
                        Poll::Ready(None)
                    }
                    n => {
                        // SAFETY: poll_read has filled the buffer with `n`
                        // additional bytes. `buffer.len` should always be
                        // 0 here, but include it for rigorous correctness
                        unsafe { buffer.set_len(buffer.len() + n); }

                        // replace state buffer and take this one to return
                        let chunk = mem::replace(buffer, allocate_buffer());

                        // n cannot be larger than remaining due to the
                        // cmp::min above
                        let n = n as u64;
                        *this.remaining -= n;
                        this.delivery.sent += n;

                        if *this.remaining == 0 {
                            this.delivery.settle(false);
                        }

                        Poll::Ready(Some(Ok(chunk.freeze())))
                    }
                }
            }
        }
    }
}

fn allocate_buffer() -> BytesMut {
    BytesMut::with_capacity(IO_BUFFER_SIZE)
}
