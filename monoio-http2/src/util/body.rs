//! Buffer between a body pump and the readers of a stream.
//!
//! Received bytes hold on to their flow-control window until a reader takes
//! them, so a stream nobody reads stalls the peer instead of growing the
//! buffer.
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::poll_fn,
    task::{Poll, Waker},
};

use bytes::{Bytes, BytesMut};
use monoio_http::h2::FlowControl;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct BodyBuffer {
    inner: RefCell<BodyInner>,
}

#[derive(Debug, Default)]
struct BodyInner {
    eof: bool,
    error: Option<Error>,
    items: VecDeque<Bytes>,
    received: usize,
    /// Received bytes whose window was not handed back yet.
    unreleased: usize,
    flow: Option<FlowControl>,
    task: Option<Waker>,
}

impl BodyInner {
    fn wake(&mut self) {
        if let Some(waker) = self.task.take() {
            waker.wake();
        }
    }

    fn release(&mut self, len: usize) {
        let len = len.min(self.unreleased);
        if len == 0 {
            return;
        }
        self.unreleased -= len;
        if let Some(flow) = self.flow.as_mut() {
            let _ = flow.release_capacity(len);
        }
    }
}

impl BodyBuffer {
    pub(crate) fn ended() -> Self {
        let buffer = Self::default();
        buffer.feed_eof();
        buffer
    }

    /// Window of incoming chunks is handed back through `flow` as they
    /// are read.
    pub(crate) fn attach(&self, flow: FlowControl) {
        let mut inner = self.inner.borrow_mut();
        if !inner.eof {
            inner.flow = Some(flow);
        }
    }

    pub(crate) fn feed_data(&self, data: Bytes) {
        let mut inner = self.inner.borrow_mut();
        if inner.eof {
            return;
        }
        inner.received += data.len();
        inner.unreleased += data.len();
        inner.items.push_back(data);
        inner.wake();
    }

    /// Hands back the window of `len` bytes without waiting for a reader.
    pub(crate) fn release(&self, len: usize) {
        self.inner.borrow_mut().release(len);
    }

    /// The peer cannot send more, so whatever is still buffered gives its
    /// window back to the connection.
    pub(crate) fn feed_eof(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.eof = true;
        let unreleased = inner.unreleased;
        inner.release(unreleased);
        inner.flow = None;
        inner.wake();
    }

    /// Ends the body with an error; buffered chunks stay readable first.
    pub(crate) fn feed_error(&self, err: Error) {
        let mut inner = self.inner.borrow_mut();
        if inner.eof {
            return;
        }
        inner.eof = true;
        inner.error = Some(err);
        inner.flow = None;
        inner.wake();
    }

    pub(crate) fn received(&self) -> usize {
        self.inner.borrow().received
    }

    /// Bytes received but not read yet.
    pub(crate) fn buffered(&self) -> usize {
        self.inner.borrow().items.iter().map(Bytes::len).sum()
    }

    /// Next chunk; `None` once the body ended and was drained. An error is
    /// reported once, after the chunks received before it.
    pub(crate) async fn next(&self) -> Option<Result<Bytes>> {
        poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if let Some(data) = inner.items.pop_front() {
                inner.release(data.len());
                return Poll::Ready(Some(Ok(data)));
            }
            if inner.eof {
                return Poll::Ready(inner.error.take().map(Err));
            }
            if !matches!(inner.task, Some(ref waker) if waker.will_wake(cx.waker())) {
                inner.task = Some(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }

    pub(crate) async fn collect(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}
