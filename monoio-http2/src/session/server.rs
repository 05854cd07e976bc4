use std::{
    cell::{Cell, RefCell},
    fmt,
    future::{poll_fn, Future},
    net::SocketAddr,
    pin::pin,
    rc::Rc,
    task::Poll,
};

use bytes::Bytes;
use monoio::net::{TcpListener, TcpStream};
use monoio_http::h2::{
    server::{Connection, SendResponse},
    RecvStream,
};
use slab::Slab;

use super::{Session, SessionEvent, SessionKind, SessionState};
use crate::{
    adapter::{completion, from_callback, ready, Emitter, Event, ListenerToken, Wait},
    error::Error,
    headers::Headers,
    options::ListenOptions,
    stream::{Native, SendState, Stream, StreamInit, StreamRole},
    util::signal::Signal,
};

pub enum ServerEvent {
    Listening(SocketAddr),
    /// A client connected and completed the handshake.
    Session(Session),
    /// An incoming request on any session.
    Stream(Stream, Headers),
    Error(Error),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEventKind {
    Listening,
    Session,
    Stream,
    Error,
    Close,
}

impl Event for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Listening(_) => ServerEventKind::Listening,
            Self::Session(_) => ServerEventKind::Session,
            Self::Stream(..) => ServerEventKind::Stream,
            Self::Error(_) => ServerEventKind::Error,
            Self::Close => ServerEventKind::Close,
        }
    }
}

struct ServerInner {
    options: ListenOptions,
    state: Cell<SessionState>,
    events: Emitter<ServerEvent>,
    local_addr: Cell<Option<SocketAddr>>,
    sessions: RefCell<Slab<Session>>,
    /// Accepted connections still in the handshake.
    handshaking: Cell<usize>,
    accepting: Cell<bool>,
    shutdown: Rc<Signal>,
}

/// Listens for HTTP/2 connections and reports their streams.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

enum Step {
    Incoming(http::Request<RecvStream>, SendResponse<Bytes>),
    Done(Option<Error>),
}

impl Server {
    pub fn new(options: ListenOptions) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                options,
                state: Cell::new(SessionState::Created),
                events: Emitter::new(),
                local_addr: Cell::new(None),
                sessions: RefCell::new(Slab::new()),
                handshaking: Cell::new(0),
                accepting: Cell::new(false),
                shutdown: Rc::new(Signal::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    pub fn on<F>(&self, kind: ServerEventKind, f: F) -> ListenerToken
    where
        F: FnMut(&ServerEvent) + 'static,
    {
        self.inner.events.on(kind, f)
    }

    pub fn once<F>(&self, kind: ServerEventKind, f: F) -> ListenerToken
    where
        F: FnOnce(&ServerEvent) + 'static,
    {
        self.inner.events.once(kind, f)
    }

    /// Calls `f` with every incoming stream and its request headers.
    pub fn on_stream<F>(&self, mut f: F) -> ListenerToken
    where
        F: FnMut(&Stream, &Headers) + 'static,
    {
        self.on(ServerEventKind::Stream, move |event| {
            if let ServerEvent::Stream(stream, headers) = event {
                f(stream, headers)
            }
        })
    }

    pub fn listener_count(&self, kind: ServerEventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    /// Binds and starts accepting connections. Resolves with the bound
    /// address.
    pub fn listen(&self) -> Wait<SocketAddr> {
        if self.state() != SessionState::Created {
            return ready(Err(Error::AlreadyListening));
        }
        let server = self.clone();
        from_callback(move |done| {
            let options = &server.inner.options;
            let bound = TcpListener::bind((options.hostname.as_str(), options.port))
                .and_then(|listener| Ok((listener.local_addr()?, listener)));
            match bound {
                Ok((addr, listener)) => {
                    #[cfg(feature = "logging")]
                    tracing::info!("listening on {addr}");
                    server.inner.state.set(SessionState::Listening);
                    server.inner.local_addr.set(Some(addr));
                    server.inner.accepting.set(true);
                    server.inner.events.emit(&ServerEvent::Listening(addr));
                    monoio::spawn(server.clone().accept_loop(listener));
                    done.complete(Ok(addr));
                }
                Err(e) => {
                    done.complete(Err(e.into()));
                }
            }
        })
    }

    /// Stops accepting connections, closes every session gracefully and
    /// waits until all of them are gone. Connections still in the handshake
    /// are closed as soon as it completes.
    pub fn close(&self) -> Wait<()> {
        match self.state() {
            SessionState::Closed => return ready(Ok(())),
            SessionState::Created => {
                self.inner.state.set(SessionState::Closed);
                self.inner.events.emit(&ServerEvent::Close);
                return ready(Ok(()));
            }
            _ => {}
        }
        let (done, wait) = completion();
        done.settle_on(&self.inner.events, ServerEventKind::Close, |_| Ok(()));
        if self.state() == SessionState::Listening {
            #[cfg(feature = "logging")]
            tracing::info!("server closing");
            self.inner.state.set(SessionState::Closing);
            self.inner.shutdown.raise();
            let sessions: Vec<Session> = self
                .inner
                .sessions
                .borrow()
                .iter()
                .map(|(_, session)| session.clone())
                .collect();
            for session in sessions {
                session.begin_close();
            }
            self.maybe_finish();
        }
        wait
    }

    fn maybe_finish(&self) {
        if self.state() == SessionState::Closing
            && !self.inner.accepting.get()
            && self.inner.handshaking.get() == 0
            && self.inner.sessions.borrow().is_empty()
        {
            self.inner.state.set(SessionState::Closed);
            self.inner.events.emit(&ServerEvent::Close);
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let accepted = {
                let mut accept = pin!(listener.accept());
                poll_fn(|cx| {
                    if shutdown.poll_raised(cx).is_ready() {
                        return Poll::Ready(None);
                    }
                    accept.as_mut().poll(cx).map(Some)
                })
                .await
            };
            match accepted {
                Some(Ok((io, _peer))) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!("accepted connection from {_peer}");
                    self.inner.handshaking.set(self.inner.handshaking.get() + 1);
                    monoio::spawn(self.clone().serve(io));
                }
                Some(Err(e)) => {
                    #[cfg(feature = "logging")]
                    tracing::warn!("accept failed: {e}");
                    self.inner.events.emit(&ServerEvent::Error(e.into()));
                }
                None => break,
            }
        }
        drop(listener);
        self.inner.accepting.set(false);
        self.maybe_finish();
    }

    async fn serve(self, io: TcpStream) {
        let _ = io.set_nodelay(true);
        let builder = self.inner.options.settings.server_builder();
        let handshake = builder.handshake(io).await;
        self.inner.handshaking.set(self.inner.handshaking.get() - 1);
        let connection = match handshake {
            Ok(connection) => connection,
            Err(e) => {
                #[cfg(feature = "logging")]
                tracing::warn!("handshake failed: {e}");
                self.inner.events.emit(&ServerEvent::Error(e.into()));
                self.maybe_finish();
                return;
            }
        };

        let authority = match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.inner.options.hostname.clone(),
        };
        let session = Session::new(SessionKind::Server, "http", &authority, None, false, 0);
        let key = self.inner.sessions.borrow_mut().insert(session.clone());
        if self.state() != SessionState::Listening {
            session.begin_close();
        }
        self.inner.events.emit(&ServerEvent::Session(session.clone()));
        session.emit(SessionEvent::Connect);

        self.drive(&session, connection).await;

        self.inner.sessions.borrow_mut().try_remove(key);
        self.maybe_finish();
    }

    /// Accepts streams on one connection until it ends.
    async fn drive(&self, session: &Session, mut connection: Connection<TcpStream, Bytes>) {
        let shutdown = session.inner.shutdown.clone();
        let kill = session.inner.kill.clone();
        let mut going_away = false;
        let error = loop {
            let step = poll_fn(|cx| {
                if kill.poll_raised(cx).is_ready() {
                    return Poll::Ready(Step::Done(None));
                }
                if !going_away && shutdown.poll_raised(cx).is_ready() {
                    connection.graceful_shutdown();
                    going_away = true;
                }
                match connection.poll_accept(cx) {
                    Poll::Ready(Some(Ok((request, respond)))) => {
                        Poll::Ready(Step::Incoming(request, respond))
                    }
                    Poll::Ready(Some(Err(e))) => Poll::Ready(Step::Done(Some(e.into()))),
                    Poll::Ready(None) => Poll::Ready(Step::Done(None)),
                    Poll::Pending => Poll::Pending,
                }
            })
            .await;
            match step {
                Step::Incoming(request, respond) => self.accept_stream(session, request, respond),
                Step::Done(error) => break error,
            }
        };
        drop(connection);
        session.finish(error);
    }

    fn accept_stream(
        &self,
        session: &Session,
        request: http::Request<RecvStream>,
        respond: SendResponse<Bytes>,
    ) {
        let headers = Headers::from_request(&request);
        let stream = Stream::new(StreamInit {
            role: StreamRole::Accepted,
            side: SessionKind::Server,
            session: session.downgrade(),
            request: headers.clone(),
            native: Native {
                respond: Some(respond),
                ..Default::default()
            },
            send: SendState::default(),
            recv_done: false,
        });
        stream.spawn_pump(stream.clone().pump_body(request.into_body()));
        stream.spawn_pump(stream.clone().watch_reset());
        session.emit(SessionEvent::Stream(stream.clone(), headers.clone()));
        self.inner.events.emit(&ServerEvent::Stream(stream, headers));
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr.get())
            .field("state", &self.inner.state.get())
            .finish()
    }
}
