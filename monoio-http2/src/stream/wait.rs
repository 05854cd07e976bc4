//! Awaitable forms of the stream's one-shot events.
//!
//! Every wait listens for its target event together with `Error`, `End` and
//! `Close`, so it settles even when the target never comes. Whatever settles
//! first detaches the rest.
use std::rc::Rc;

use super::{Stream, StreamEvent, StreamEventKind, StreamInner, StreamRole};
use crate::{
    adapter::{completion, ready, Completion, Wait},
    error::Error,
    headers::Headers,
};

impl Stream {
    /// Waits for the response headers. On a pushed client stream these are
    /// the pushed response headers.
    ///
    /// Cancelling (or dropping) the wait only stops listening.
    pub fn wait_response(&self) -> Wait<Headers> {
        let (done, wait) = completion();
        self.settle_headers(&done, self.response_kind(), |headers| headers);
        wait
    }

    /// Like [`Stream::wait_response`], but cancelling the wait also
    /// destroys the stream.
    pub fn wait_response_abortable(&self) -> Wait<Headers> {
        let stream = self.clone();
        self.wait_response().on_cancel(move || stream.destroy())
    }

    /// Waits for the next informational header block.
    pub fn wait_headers_additional(&self) -> Wait<Headers> {
        let (done, wait) = completion();
        self.settle_headers(&done, StreamEventKind::Headers, |headers| headers);
        wait
    }

    pub fn wait_trailers(&self) -> Wait<Headers> {
        let (done, wait) = completion();
        self.settle_headers(&done, StreamEventKind::Trailers, |headers| headers);
        wait
    }

    /// Waits until the incoming body has ended. Resolves at once if it
    /// already has.
    pub fn wait_end(&self) -> Wait<()> {
        if self.inner.recv_done.get() && self.inner.error.borrow().is_none() {
            return ready(Ok(()));
        }
        if let Some(err) = self.terminal_error() {
            return ready(Err(err));
        }
        let (done, wait) = completion();
        let events = &self.inner.events;
        done.settle_on(events, StreamEventKind::End, |_| Ok(()));
        self.settle_on_failure(&done);
        wait
    }

    pub(crate) fn response_kind(&self) -> StreamEventKind {
        if self.inner.role == StreamRole::Pushed {
            StreamEventKind::Push
        } else {
            StreamEventKind::Response
        }
    }

    /// Settles `done` with `map(headers)` on the next header event of `kind`,
    /// or right away when the headers are cached or can no longer arrive.
    pub(crate) fn settle_headers<T, F>(&self, done: &Completion<T>, kind: StreamEventKind, map: F)
    where
        T: 'static,
        F: FnOnce(Headers) -> T + 'static,
    {
        let cached = match kind {
            StreamEventKind::Response | StreamEventKind::Push => self.response_headers(),
            StreamEventKind::Trailers => self.trailers(),
            _ => None,
        };
        if let Some(headers) = cached {
            done.complete(Ok(map(headers)));
            return;
        }
        if let Some(err) = self.terminal_error() {
            done.complete(Err(err));
            return;
        }
        if self.inner.recv_done.get() {
            done.complete(Err(Error::Ended));
            return;
        }

        done.settle_on(&self.inner.events, kind, move |event| match event {
            StreamEvent::Response(headers)
            | StreamEvent::Push(headers)
            | StreamEvent::Headers(headers)
            | StreamEvent::Trailers(headers) => Ok(map(headers.clone())),
            _ => Err(Error::Ended),
        });
        done.settle_on(&self.inner.events, StreamEventKind::End, |_| {
            Err(Error::Ended)
        });
        self.settle_on_failure(done);
    }

    fn settle_on_failure<T: 'static>(&self, done: &Completion<T>) {
        let events = &self.inner.events;
        done.settle_on(events, StreamEventKind::Error, |event| match event {
            StreamEvent::Error(e) => Err(e.clone()),
            _ => Err(Error::StreamClosed),
        });
        let inner = Rc::downgrade(&self.inner);
        done.settle_on(events, StreamEventKind::Close, move |_| {
            Err(inner
                .upgrade()
                .map(|inner: Rc<StreamInner>| inner.closed_reason())
                .unwrap_or(Error::StreamClosed))
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::session::SessionKind;

    fn client_stream() -> Stream {
        Stream::detached(StreamRole::Requested, SessionKind::Client)
    }

    fn status(code: &str) -> Headers {
        Headers::from_record([(":status", code)])
    }

    #[monoio::test]
    async fn response_resolves_and_detaches() {
        let stream = client_stream();
        let wait = stream.wait_response();
        assert_eq!(stream.listener_count(StreamEventKind::Response), 1);
        assert_eq!(stream.listener_count(StreamEventKind::Close), 1);
        stream.on_response(status("204"));
        assert_eq!(wait.await.unwrap().status(), Some(204));
        for kind in [
            StreamEventKind::Response,
            StreamEventKind::Error,
            StreamEventKind::End,
            StreamEventKind::Close,
        ] {
            assert_eq!(stream.listener_count(kind), 0);
        }
    }

    #[monoio::test]
    async fn response_already_received() {
        let stream = client_stream();
        stream.on_response(status("200"));
        let headers = stream.wait_response().await.unwrap();
        assert_eq!(headers.status(), Some(200));
        assert_eq!(stream.listener_count(StreamEventKind::Response), 0);
    }

    #[monoio::test]
    async fn pushed_stream_waits_for_push_event() {
        let stream = Stream::detached(StreamRole::Pushed, SessionKind::Client);
        let wait = stream.wait_response();
        assert_eq!(stream.listener_count(StreamEventKind::Push), 1);
        stream.on_response(status("200"));
        assert_eq!(wait.await.unwrap().status(), Some(200));
    }

    #[monoio::test]
    async fn error_fails_pending_wait() {
        let stream = client_stream();
        let wait = stream.wait_response();
        stream.fail(Error::SessionClosed);
        assert!(matches!(wait.await, Err(Error::SessionClosed)));
        assert!(matches!(
            stream.wait_response().await,
            Err(Error::SessionClosed)
        ));
    }

    #[monoio::test(enable_timer = true)]
    async fn timeout_leaves_no_listener_behind() {
        let stream = client_stream();
        let result = stream
            .wait_response()
            .timeout(Duration::from_millis(5))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(stream.listener_count(StreamEventKind::Response), 0);
        assert_eq!(stream.listener_count(StreamEventKind::Close), 0);

        // A late response is delivered to nobody and does not panic.
        stream.on_response(status("200"));
        assert!(!stream.is_closed());
    }

    #[monoio::test(enable_timer = true)]
    async fn abortable_destroys_on_timeout() {
        let stream = client_stream();
        let result = stream
            .wait_response_abortable()
            .timeout(Duration::from_millis(5))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(stream.is_closed());
        assert!(matches!(
            stream.wait_response().await,
            Err(Error::Destroyed)
        ));
    }

    #[monoio::test]
    async fn abortable_does_not_destroy_on_success() {
        let stream = client_stream();
        let wait = stream.wait_response_abortable();
        stream.on_response(status("200"));
        wait.await.unwrap();
        assert!(!stream.is_closed());
    }

    #[monoio::test]
    async fn additional_headers() {
        let stream = client_stream();
        let wait = stream.wait_headers_additional();
        stream.on_informational(status("103"));
        assert_eq!(wait.await.unwrap().status(), Some(103));

        let wait = stream.wait_headers_additional();
        stream.on_response(status("200"));
        stream.on_end();
        assert!(matches!(wait.await, Err(Error::Ended)));
    }

    #[monoio::test]
    async fn trailers_or_end() {
        let stream = client_stream();
        let wait = stream.wait_trailers();
        stream.on_response(status("200"));
        stream.on_trailers(Headers::from_record([("x-checksum", "abc")]));
        assert_eq!(
            wait.await.unwrap().value_string("x-checksum"),
            Some("abc")
        );

        let stream = client_stream();
        let wait = stream.wait_trailers();
        stream.on_response(status("200"));
        stream.on_end();
        assert!(matches!(wait.await, Err(Error::Ended)));
    }

    #[monoio::test]
    async fn end_short_circuits_once_ended() {
        let stream = client_stream();
        stream.on_response(status("200"));
        stream.on_data(Bytes::from_static(b"x"));
        let pending = stream.wait_end();
        stream.on_end();
        pending.await.unwrap();

        stream.wait_end().await.unwrap();
        assert_eq!(stream.listener_count(StreamEventKind::End), 0);
    }

    #[monoio::test]
    async fn end_fails_after_destroy() {
        let stream = client_stream();
        let wait = stream.wait_end();
        stream.destroy();
        assert!(matches!(wait.await, Err(Error::Destroyed)));
        assert!(matches!(stream.wait_end().await, Err(Error::Destroyed)));
    }

    #[monoio::test]
    async fn concurrent_waits_are_independent() {
        let stream = client_stream();
        let a = stream.wait_response();
        let b = stream.wait_response();
        assert!(a.cancel());
        assert_eq!(stream.listener_count(StreamEventKind::Response), 1);
        stream.on_response(status("200"));
        assert!(matches!(a.await, Err(Error::Cancelled)));
        assert_eq!(b.await.unwrap().status(), Some(200));
    }
}
