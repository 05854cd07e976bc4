mod send;
mod wait;

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::{poll_fn, Future},
    pin::pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use bytes::Bytes;
use monoio_http::h2::{
    server::{SendPushedResponse, SendResponse},
    Reason, RecvStream, SendStream,
};

use crate::{
    adapter::{Emitter, Event, ListenerToken},
    error::{Error, Result},
    headers::Headers,
    session::{Session, SessionInner, SessionKind},
    util::{
        body::BodyBuffer,
        signal::{LocalWaker, Signal},
    },
};

/// How a stream came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Opened by this side with [`Session::request`].
    Requested,
    /// Opened by the peer and handed to a server.
    Accepted,
    /// Opened by a server push. On the server it is the stream being pushed,
    /// on the client the promised stream.
    Pushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Request sent, response headers not received yet.
    Requested,
    /// Push promised, pushed response headers not received yet.
    Pushed,
    HeadersReceived,
    TrailersReceived,
    /// The incoming body ended.
    Ended,
    Closed,
}

pub enum StreamEvent {
    /// Final response headers of a requested stream.
    Response(Headers),
    /// An additional (informational) header block.
    Headers(Headers),
    /// Response headers of a pushed stream, on the client.
    Push(Headers),
    Data(Bytes),
    Trailers(Headers),
    /// The body is finished and trailers were negotiated; call
    /// [`Stream::send_trailers`].
    WantTrailers,
    End,
    Error(Error),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    Response,
    Headers,
    Push,
    Data,
    Trailers,
    WantTrailers,
    End,
    Error,
    Close,
}

impl Event for StreamEvent {
    type Kind = StreamEventKind;

    fn kind(&self) -> StreamEventKind {
        match self {
            Self::Response(_) => StreamEventKind::Response,
            Self::Headers(_) => StreamEventKind::Headers,
            Self::Push(_) => StreamEventKind::Push,
            Self::Data(_) => StreamEventKind::Data,
            Self::Trailers(_) => StreamEventKind::Trailers,
            Self::WantTrailers => StreamEventKind::WantTrailers,
            Self::End => StreamEventKind::End,
            Self::Error(_) => StreamEventKind::Error,
            Self::Close => StreamEventKind::Close,
        }
    }
}

/// Engine handles a stream may hold, depending on its role and side.
#[derive(Default)]
pub(crate) struct Native {
    pub(crate) send: Option<SendStream<Bytes>>,
    pub(crate) respond: Option<SendResponse<Bytes>>,
    pub(crate) push_respond: Option<SendPushedResponse<Bytes>>,
}

impl Native {
    fn reset(&mut self) {
        let reason = Reason::CANCEL;
        if let Some(send) = self.send.as_mut() {
            send.send_reset(reason);
        } else if let Some(respond) = self.respond.as_mut() {
            respond.send_reset(reason);
        } else if let Some(respond) = self.push_respond.as_mut() {
            respond.send_reset(reason);
        }
    }

    /// Polls for a RST_STREAM from the peer through whichever handle is
    /// current.
    fn poll_reset(&mut self, cx: &mut Context<'_>) -> Poll<Result<Reason>> {
        let polled = if let Some(send) = self.send.as_mut() {
            send.poll_reset(cx)
        } else if let Some(respond) = self.respond.as_mut() {
            respond.poll_reset(cx)
        } else if let Some(respond) = self.push_respond.as_mut() {
            respond.poll_reset(cx)
        } else {
            return Poll::Pending;
        };
        polled.map_err(Into::into)
    }
}

/// Progress of the sending half.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SendState {
    pub(crate) wait_for_trailers: bool,
    pub(crate) responded: bool,
    /// The final body chunk was written.
    pub(crate) finished: bool,
    /// END_STREAM went out, with the last chunk or the trailers.
    pub(crate) closed: bool,
}

pub(crate) struct StreamInit {
    pub(crate) role: StreamRole,
    pub(crate) side: SessionKind,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) request: Headers,
    pub(crate) native: Native,
    pub(crate) send: SendState,
    /// No incoming body is expected.
    pub(crate) recv_done: bool,
}

pub(crate) struct StreamInner {
    role: StreamRole,
    side: SessionKind,
    session: Weak<SessionInner>,
    key: Cell<Option<usize>>,
    events: Emitter<StreamEvent>,
    state: Cell<StreamState>,
    request: Headers,
    response: RefCell<Option<Headers>>,
    trailers: RefCell<Option<Headers>>,
    body: BodyBuffer,
    error: RefCell<Option<Error>>,
    destroyed: Cell<bool>,
    abort: Rc<Signal>,
    native: RefCell<Native>,
    send: Cell<SendState>,
    recv_done: Cell<bool>,
    /// Writers waiting for send capacity. The engine keeps one send waker
    /// per stream, so the reset watcher steps aside while this is non-zero.
    sending: Cell<usize>,
    send_idle: LocalWaker,
}

impl StreamInner {
    /// Why waits on a closed stream fail.
    fn closed_reason(&self) -> Error {
        if let Some(e) = self.error.borrow().as_ref() {
            return e.clone();
        }
        if self.destroyed.get() {
            Error::Destroyed
        } else {
            Error::StreamClosed
        }
    }
}

/// One HTTP/2 stream. Clones share the same stream.
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Rc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(init: StreamInit) -> Self {
        let state = match init.role {
            StreamRole::Requested => StreamState::Requested,
            StreamRole::Pushed if init.side == SessionKind::Client => StreamState::Pushed,
            _ => StreamState::HeadersReceived,
        };
        let body = if init.recv_done {
            BodyBuffer::ended()
        } else {
            BodyBuffer::default()
        };
        let stream = Self {
            inner: Rc::new(StreamInner {
                role: init.role,
                side: init.side,
                session: init.session,
                key: Cell::new(None),
                events: Emitter::new(),
                state: Cell::new(state),
                request: init.request,
                response: RefCell::new(None),
                trailers: RefCell::new(None),
                body,
                error: RefCell::new(None),
                destroyed: Cell::new(false),
                abort: Rc::new(Signal::new()),
                native: RefCell::new(init.native),
                send: Cell::new(init.send),
                recv_done: Cell::new(init.recv_done),
                sending: Cell::new(0),
                send_idle: LocalWaker::new(),
            }),
        };
        if let Some(session) = stream.session() {
            let key = session.register(&stream.inner);
            stream.inner.key.set(Some(key));
        }
        stream
    }

    pub(crate) fn from_inner(inner: Rc<StreamInner>) -> Self {
        Self { inner }
    }

    pub fn role(&self) -> StreamRole {
        self.inner.role
    }

    /// Whether the stream lives on a client or a server session.
    pub fn side(&self) -> SessionKind {
        self.inner.side
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.get()
    }

    /// Headers of the request; synthetic for a pushed stream.
    pub fn request_headers(&self) -> &Headers {
        &self.inner.request
    }

    /// Response headers received (client) or sent (server), if any yet.
    pub fn response_headers(&self) -> Option<Headers> {
        self.inner.response.borrow().clone()
    }

    pub fn trailers(&self) -> Option<Headers> {
        self.inner.trailers.borrow().clone()
    }

    /// The incoming body has fully arrived.
    pub fn is_ended(&self) -> bool {
        self.inner.recv_done.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.error.borrow().clone()
    }

    pub fn bytes_received(&self) -> usize {
        self.inner.body.received()
    }

    /// Bytes received but not read yet. Their flow-control window is handed
    /// back to the peer once read.
    pub fn bytes_buffered(&self) -> usize {
        self.inner.body.buffered()
    }

    /// The owning session, while it is alive.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.upgrade().map(Session::from_inner)
    }

    pub fn on<F>(&self, kind: StreamEventKind, f: F) -> ListenerToken
    where
        F: FnMut(&StreamEvent) + 'static,
    {
        self.inner.events.on(kind, f)
    }

    pub fn once<F>(&self, kind: StreamEventKind, f: F) -> ListenerToken
    where
        F: FnOnce(&StreamEvent) + 'static,
    {
        self.inner.events.once(kind, f)
    }

    pub fn listener_count(&self, kind: StreamEventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    /// Next chunk of the incoming body. `None` once it ended.
    pub async fn read_chunk(&self) -> Option<Result<Bytes>> {
        self.inner.body.next().await
    }

    /// Reads the rest of the incoming body.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        self.inner.body.collect().await
    }

    /// The error a wait should resolve with, if the stream can no longer
    /// produce events.
    pub(crate) fn terminal_error(&self) -> Option<Error> {
        if let Some(e) = self.inner.error.borrow().as_ref() {
            return Some(e.clone());
        }
        if self.is_closed() {
            return Some(self.inner.closed_reason());
        }
        None
    }

    fn emit(&self, event: StreamEvent) {
        self.inner.events.emit(&event);
    }

    pub(crate) fn on_response(&self, headers: Headers) {
        if self.is_closed() {
            return;
        }
        self.inner.state.set(StreamState::HeadersReceived);
        self.inner.response.replace(Some(headers.clone()));
        if self.inner.role == StreamRole::Pushed {
            self.emit(StreamEvent::Push(headers));
        } else {
            self.emit(StreamEvent::Response(headers));
        }
    }

    /// The engine answers 1xx responses itself and never hands them over, so
    /// only tests feed informational blocks.
    #[cfg(test)]
    pub(crate) fn on_informational(&self, headers: Headers) {
        if !self.is_closed() {
            self.emit(StreamEvent::Headers(headers));
        }
    }

    /// Buffers a chunk for the readers. A `Data` listener consumes it on the
    /// spot, so its window goes back to the peer right away.
    pub(crate) fn on_data(&self, data: Bytes) {
        if self.is_closed() {
            return;
        }
        let len = data.len();
        let consumed = self.listener_count(StreamEventKind::Data) > 0;
        self.inner.body.feed_data(data.clone());
        self.emit(StreamEvent::Data(data));
        if consumed {
            self.inner.body.release(len);
        }
    }

    pub(crate) fn on_trailers(&self, headers: Headers) {
        if self.is_closed() {
            return;
        }
        self.inner.state.set(StreamState::TrailersReceived);
        self.inner.trailers.replace(Some(headers.clone()));
        self.emit(StreamEvent::Trailers(headers));
    }

    pub(crate) fn on_end(&self) {
        if self.is_closed() || self.inner.recv_done.get() {
            return;
        }
        self.inner.recv_done.set(true);
        self.inner.body.feed_eof();
        self.inner.state.set(StreamState::Ended);
        self.emit(StreamEvent::End);
        self.maybe_close();
    }

    /// Terminates the stream with `err`. Every pending wait observes it.
    pub(crate) fn fail(&self, err: Error) {
        if self.is_closed() {
            return;
        }
        #[cfg(feature = "logging")]
        tracing::debug!("stream {:?} failed: {err}", self.inner.role);
        self.inner.error.replace(Some(err.clone()));
        self.inner.body.feed_error(err.clone());
        self.close_now(Some(err));
    }

    /// Emits `WantTrailers` if the body is finished and the stream now waits
    /// for [`Stream::send_trailers`].
    pub(crate) fn announce_trailers(&self) {
        let send = self.inner.send.get();
        if !self.is_closed() && send.wait_for_trailers && send.finished && !send.closed {
            self.emit(StreamEvent::WantTrailers);
        }
    }

    pub(crate) fn update_send<F: FnOnce(&mut SendState)>(&self, f: F) -> SendState {
        let mut send = self.inner.send.get();
        f(&mut send);
        self.inner.send.set(send);
        send
    }

    /// Closes the stream once both directions are done.
    pub(crate) fn maybe_close(&self) {
        if self.inner.recv_done.get() && self.inner.send.get().closed {
            self.close_now(None);
        }
    }

    fn close_now(&self, err: Option<Error>) {
        if self.is_closed() {
            return;
        }
        self.inner.state.set(StreamState::Closed);
        drop(std::mem::take(&mut *self.inner.native.borrow_mut()));
        self.inner.abort.raise();
        if let (Some(session), Some(key)) = (self.session(), self.inner.key.take()) {
            session.unregister(key);
        }
        if let Some(err) = err {
            self.emit(StreamEvent::Error(err));
        }
        self.emit(StreamEvent::Close);
        // Nothing fires after close; drop listeners and what they capture.
        self.inner.events.clear();
    }

    /// Runs `pump` until it finishes or the stream closes.
    pub(crate) fn spawn_pump<F>(&self, pump: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let abort = self.inner.abort.clone();
        monoio::spawn(async move {
            let mut pump = pin!(pump);
            poll_fn(|cx| {
                if abort.poll_raised(cx).is_ready() {
                    return Poll::Ready(());
                }
                pump.as_mut().poll(cx)
            })
            .await
        });
    }

    /// Awaits the engine's response future, then pumps the body.
    pub(crate) async fn pump_response<F>(self, response: F)
    where
        F: Future<
            Output = std::result::Result<http::Response<RecvStream>, monoio_http::h2::Error>,
        >,
    {
        match response.await {
            Ok(response) => {
                self.on_response(Headers::from_response(&response));
                self.pump_body(response.into_body()).await
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Moves body chunks and trailers from the engine into the stream.
    /// Their window is released as the chunks are read.
    pub(crate) async fn pump_body(self, mut body: RecvStream) {
        self.inner.body.attach(body.flow_control().clone());
        while let Some(next) = body.data().await {
            match next {
                Ok(chunk) => self.on_data(chunk),
                Err(e) => return self.fail(e.into()),
            }
        }
        match body.trailers().await {
            Ok(Some(trailers)) => self.on_trailers(Headers::from_header_map(&trailers)),
            Ok(None) => {}
            Err(e) => return self.fail(e.into()),
        }
        self.on_end();
    }

    /// Fails the stream when the peer resets it. Server streams need this
    /// once their request body ended, as nothing else polls the engine then.
    pub(crate) async fn watch_reset(self) {
        let outcome = poll_fn(|cx| {
            if self.inner.sending.get() > 0 {
                self.inner.send_idle.register(cx.waker());
                return Poll::Pending;
            }
            self.inner.native.borrow_mut().poll_reset(cx)
        })
        .await;
        match outcome {
            Ok(reason) => {
                #[cfg(feature = "logging")]
                tracing::debug!("{:?} stream reset by peer: {reason}", self.inner.role);
                self.fail(Error::Reset(reason))
            }
            Err(e) => self.fail(e),
        }
    }

    /// Marks a writer as waiting for capacity until the guard drops.
    pub(crate) fn begin_sending(&self) -> Sending<'_> {
        self.inner.sending.set(self.inner.sending.get() + 1);
        Sending(&self.inner)
    }

    #[cfg(test)]
    pub(crate) fn detached(role: StreamRole, side: SessionKind) -> Self {
        let pushed_server = role == StreamRole::Pushed && side == SessionKind::Server;
        Self::new(StreamInit {
            role,
            side,
            session: Weak::new(),
            request: Headers::new(),
            native: Native::default(),
            send: SendState {
                closed: side == SessionKind::Client,
                finished: side == SessionKind::Client,
                ..Default::default()
            },
            recv_done: pushed_server,
        })
    }
}

pub(crate) struct Sending<'a>(&'a StreamInner);

impl Drop for Sending<'_> {
    fn drop(&mut self) {
        let left = self.0.sending.get() - 1;
        self.0.sending.set(left);
        if left == 0 {
            self.0.send_idle.wake();
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("role", &self.inner.role)
            .field("side", &self.inner.side)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_states() {
        let s = Stream::detached(StreamRole::Requested, SessionKind::Client);
        assert_eq!(s.state(), StreamState::Requested);
        let s = Stream::detached(StreamRole::Pushed, SessionKind::Client);
        assert_eq!(s.state(), StreamState::Pushed);
        let s = Stream::detached(StreamRole::Accepted, SessionKind::Server);
        assert_eq!(s.state(), StreamState::HeadersReceived);
        let s = Stream::detached(StreamRole::Pushed, SessionKind::Server);
        assert!(s.is_ended());
    }

    #[monoio::test]
    async fn lifecycle_events_in_order() {
        let stream = Stream::detached(StreamRole::Requested, SessionKind::Client);
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [
            StreamEventKind::Response,
            StreamEventKind::Data,
            StreamEventKind::Trailers,
            StreamEventKind::End,
            StreamEventKind::Close,
        ] {
            let seen = seen.clone();
            let _token = stream.on(kind, move |e| seen.borrow_mut().push(e.kind()));
        }

        stream.on_response(Headers::from_record([(":status", "200")]));
        assert_eq!(stream.state(), StreamState::HeadersReceived);
        stream.on_data(Bytes::from_static(b"body"));
        stream.on_trailers(Headers::from_record([("grpc-status", "0")]));
        assert_eq!(stream.state(), StreamState::TrailersReceived);
        stream.on_end();

        assert_eq!(
            *seen.borrow(),
            vec![
                StreamEventKind::Response,
                StreamEventKind::Data,
                StreamEventKind::Trailers,
                StreamEventKind::End,
                StreamEventKind::Close,
            ]
        );
        assert!(stream.is_closed());
        assert_eq!(stream.read_to_end().await.unwrap(), Bytes::from_static(b"body"));
        assert_eq!(
            stream.trailers().unwrap().value_string("grpc-status"),
            Some("0")
        );
    }

    #[test]
    fn fail_is_idempotent() {
        let stream = Stream::detached(StreamRole::Requested, SessionKind::Client);
        let errors = Rc::new(Cell::new(0));
        let e = errors.clone();
        let _token = stream.on(StreamEventKind::Error, move |_| e.set(e.get() + 1));
        stream.fail(Error::StreamClosed);
        stream.fail(Error::Ended);
        assert_eq!(errors.get(), 1);
        assert!(matches!(stream.error(), Some(Error::StreamClosed)));
        assert!(stream.is_closed());
    }

    #[test]
    fn error_then_close_delivered() {
        let stream = Stream::detached(StreamRole::Requested, SessionKind::Client);
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [StreamEventKind::Error, StreamEventKind::Close] {
            let seen = seen.clone();
            let _token = stream.on(kind, move |e| seen.borrow_mut().push(e.kind()));
        }
        stream.fail(Error::SessionClosed);
        assert_eq!(
            *seen.borrow(),
            vec![StreamEventKind::Error, StreamEventKind::Close]
        );
    }
}
