mod client;
mod server;

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use bytes::Bytes;
use monoio_http::h2::client::SendRequest;
use slab::Slab;
use smol_str::SmolStr;

pub use self::server::{Server, ServerEvent, ServerEventKind};
use crate::{
    adapter::{completion, ready, Completion, Emitter, Event, ListenerToken, Wait},
    error::Error,
    headers::Headers,
    stream::{Stream, StreamInner, StreamRole},
    util::signal::Signal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    /// Only used by [`Server`].
    Listening,
    Closing,
    Closed,
}

pub enum SessionEvent {
    Connect,
    /// A stream opened by the peer: a pushed stream on a client session, an
    /// incoming request on a server session. Carries its request headers.
    Stream(Stream, Headers),
    Error(Error),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Connect,
    Stream,
    Error,
    Close,
}

impl Event for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            Self::Connect => SessionEventKind::Connect,
            Self::Stream(..) => SessionEventKind::Stream,
            Self::Error(_) => SessionEventKind::Error,
            Self::Close => SessionEventKind::Close,
        }
    }
}

/// A pushed stream together with its promised request and its response
/// headers.
#[derive(Debug, Clone)]
pub struct Push {
    pub request: Headers,
    pub response: Headers,
    pub stream: Stream,
}

pub(crate) struct SessionInner {
    kind: SessionKind,
    scheme: SmolStr,
    authority: SmolStr,
    state: Cell<SessionState>,
    events: Emitter<SessionEvent>,
    sender: RefCell<Option<SendRequest<Bytes>>>,
    enable_push: bool,
    max_unclaimed_pushes: usize,
    streams: RefCell<Slab<Weak<StreamInner>>>,
    unclaimed_pushes: RefCell<VecDeque<(Stream, Headers)>>,
    error: RefCell<Option<Error>>,
    /// Graceful close: stop accepting streams, finish the open ones.
    shutdown: Rc<Signal>,
    /// Abrupt close: drop the connection.
    kill: Rc<Signal>,
}

/// One HTTP/2 connection, client or server side. Clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        kind: SessionKind,
        scheme: &str,
        authority: &str,
        sender: Option<SendRequest<Bytes>>,
        enable_push: bool,
        max_unclaimed_pushes: usize,
    ) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                kind,
                scheme: SmolStr::new(scheme),
                authority: SmolStr::new(authority),
                state: Cell::new(SessionState::Connected),
                events: Emitter::new(),
                sender: RefCell::new(sender),
                enable_push,
                max_unclaimed_pushes,
                streams: RefCell::new(Slab::new()),
                unclaimed_pushes: RefCell::new(VecDeque::new()),
                error: RefCell::new(None),
                shutdown: Rc::new(Signal::new()),
                kill: Rc::new(Signal::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Authority requests default to.
    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// The first connection-level error, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.borrow().clone()
    }

    /// Number of streams still open on this session.
    pub fn stream_count(&self) -> usize {
        self.inner.streams.borrow().len()
    }

    /// Pushes received while nobody waited, not claimed by
    /// [`Session::wait_push`] yet.
    pub fn unclaimed_push_count(&self) -> usize {
        self.inner.unclaimed_pushes.borrow().len()
    }

    pub fn on<F>(&self, kind: SessionEventKind, f: F) -> ListenerToken
    where
        F: FnMut(&SessionEvent) + 'static,
    {
        self.inner.events.on(kind, f)
    }

    pub fn once<F>(&self, kind: SessionEventKind, f: F) -> ListenerToken
    where
        F: FnOnce(&SessionEvent) + 'static,
    {
        self.inner.events.once(kind, f)
    }

    /// Shorthand for an `Error` listener.
    pub fn on_error<F>(&self, mut f: F) -> ListenerToken
    where
        F: FnMut(&Error) + 'static,
    {
        self.on(SessionEventKind::Error, move |event| {
            if let SessionEvent::Error(e) = event {
                f(e)
            }
        })
    }

    pub fn once_error<F>(&self, f: F) -> ListenerToken
    where
        F: FnOnce(&Error) + 'static,
    {
        self.once(SessionEventKind::Error, move |event| {
            if let SessionEvent::Error(e) = event {
                f(e)
            }
        })
    }

    pub fn listener_count(&self, kind: SessionEventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    /// Starts a graceful close and waits until the session is closed.
    /// Open streams run to completion; no new ones are accepted.
    pub fn close(&self) -> Wait<()> {
        if self.is_closed() {
            return ready(Ok(()));
        }
        let (done, wait) = completion();
        done.settle_on(&self.inner.events, SessionEventKind::Close, |_| Ok(()));
        self.begin_close();
        wait
    }

    pub(crate) fn begin_close(&self) {
        if self.state() != SessionState::Connected {
            return;
        }
        #[cfg(feature = "logging")]
        tracing::debug!("closing {:?} session to {}", self.inner.kind, self.inner.authority);
        self.inner.state.set(SessionState::Closing);
        match self.inner.kind {
            SessionKind::Client => drop(self.inner.sender.borrow_mut().take()),
            SessionKind::Server => {
                self.inner.shutdown.raise();
            }
        }
    }

    /// Drops the connection at once. Open streams fail with
    /// [`Error::Destroyed`].
    pub fn destroy(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.state.set(SessionState::Closing);
        self.inner.sender.borrow_mut().take();
        self.inner.kill.raise();
    }

    /// Waits for the next pushed stream together with its pushed response
    /// headers. A push that arrived while nobody listened is returned first.
    pub fn wait_push(&self) -> Wait<Push> {
        if self.inner.kind == SessionKind::Server {
            return ready(Err(Error::Unsupported {
                op: "wait_push",
                role: StreamRole::Accepted,
            }));
        }
        let (done, wait) = completion();
        let queued = self.inner.unclaimed_pushes.borrow_mut().pop_front();
        if let Some((stream, request)) = queued {
            chain_pushed(&done, stream, request);
            return wait;
        }
        if self.is_closed() {
            done.complete(Err(self.closed_error()));
            return wait;
        }

        let chained = done.clone();
        let token = self.inner.events.once(SessionEventKind::Stream, move |event| {
            if let SessionEvent::Stream(stream, request) = event {
                chain_pushed(&chained, stream.clone(), request.clone());
            }
        });
        done.hold(token);
        done.settle_on(&self.inner.events, SessionEventKind::Error, |event| {
            match event {
                SessionEvent::Error(e) => Err(e.clone()),
                _ => Err(Error::SessionClosed),
            }
        });
        done.settle_on(&self.inner.events, SessionEventKind::Close, |_| {
            Err(Error::SessionClosed)
        });
        wait
    }

    fn closed_error(&self) -> Error {
        self.error().unwrap_or(Error::SessionClosed)
    }

    pub(crate) fn register(&self, stream: &Rc<StreamInner>) -> usize {
        self.inner.streams.borrow_mut().insert(Rc::downgrade(stream))
    }

    pub(crate) fn unregister(&self, key: usize) {
        self.inner.streams.borrow_mut().try_remove(key);
    }

    fn live_streams(&self) -> Vec<Stream> {
        self.inner
            .streams
            .borrow()
            .iter()
            .filter_map(|(_, stream)| stream.upgrade())
            .map(Stream::from_inner)
            .collect()
    }

    /// Hands a pushed stream to whoever waits for it, or queues it. A push
    /// arriving while the queue is full is reset.
    pub(crate) fn announce_push(&self, stream: Stream, request: Headers) {
        let event = SessionEvent::Stream(stream, request);
        if self.inner.events.emit(&event) > 0 {
            return;
        }
        let SessionEvent::Stream(stream, request) = event else {
            return;
        };
        let mut queue = self.inner.unclaimed_pushes.borrow_mut();
        if queue.len() < self.inner.max_unclaimed_pushes {
            queue.push_back((stream, request));
            return;
        }
        drop(queue);
        #[cfg(feature = "logging")]
        tracing::warn!(
            "refusing push {:?}: {} unclaimed pushes queued",
            request.value_string(crate::headers::PATH),
            self.inner.max_unclaimed_pushes
        );
        stream.destroy();
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.inner.events.emit(&event);
    }

    /// Records a connection error and forwards it to every open stream.
    pub(crate) fn fail(&self, err: Error) {
        #[cfg(feature = "logging")]
        tracing::error!("session to {} failed: {err}", self.inner.authority);
        {
            let mut slot = self.inner.error.borrow_mut();
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        self.emit(SessionEvent::Error(err.clone()));
        for stream in self.live_streams() {
            stream.fail(err.clone());
        }
    }

    /// Called by the connection driver when the connection is gone.
    pub(crate) fn finish(&self, error: Option<Error>) {
        if self.is_closed() {
            return;
        }
        if let Some(err) = error {
            self.fail(err);
        }
        self.inner.state.set(SessionState::Closed);
        self.inner.sender.borrow_mut().take();
        let reason = match self.error() {
            Some(err) => err,
            None if self.inner.kill.is_raised() => Error::Destroyed,
            None => Error::SessionClosed,
        };
        for stream in self.live_streams() {
            stream.fail(reason.clone());
        }
        self.inner.unclaimed_pushes.borrow_mut().clear();
        #[cfg(feature = "logging")]
        tracing::debug!("session to {} closed", self.inner.authority);
        self.emit(SessionEvent::Close);
        self.inner.events.clear();
    }
}

/// Settles `done` once the pushed stream's response headers are known.
fn chain_pushed(done: &Completion<Push>, stream: Stream, request: Headers) {
    let pushed = stream.clone();
    stream.settle_headers(done, stream.response_kind(), move |response| Push {
        request,
        response,
        stream: pushed,
    });
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.inner.kind)
            .field("authority", &self.inner.authority)
            .field("state", &self.inner.state.get())
            .finish()
    }
}
