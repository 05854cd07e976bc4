use std::{
    future::{poll_fn, Future},
    pin::pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use bytes::Bytes;
use http::Uri;
use monoio::net::TcpStream;
use monoio_http::h2::client::{Connection, PushPromise, PushPromises, ResponseFuture};

use super::{Session, SessionEvent, SessionInner, SessionKind, SessionState};
use crate::{
    adapter::{from_callback, Wait},
    error::{Error, Result},
    headers::Headers,
    options::{ConnectOptions, RequestOptions},
    stream::{Native, SendState, Stream, StreamInit, StreamRole},
    util::signal::Signal,
};

const DEFAULT_PORT: u16 = 80;

impl Session {
    /// Opens a client session to `url` (`http://host[:port]`).
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<Session> {
        establish(url, &options).await
    }

    /// Like [`Session::connect`], as a cancellable wait. Cancelling stops
    /// waiting; the connection attempt itself runs to its end and its
    /// session is dropped.
    pub fn connecting(url: &str, options: ConnectOptions) -> Wait<Session> {
        let url = url.to_owned();
        from_callback(move |done| {
            monoio::spawn(async move {
                done.complete(establish(&url, &options).await);
            });
        })
    }

    /// Opens a request stream.
    ///
    /// With `end_stream` (the default) the request has no body. Otherwise
    /// write one with [`Stream::send_data`]. With both `end_stream` and
    /// `wait_for_trailers`, the stream emits `WantTrailers` once the caller
    /// gets it back and waits for [`Stream::send_trailers`].
    pub async fn request(&self, headers: Headers, options: RequestOptions) -> Result<Stream> {
        if self.inner.kind != SessionKind::Client {
            return Err(Error::Unsupported {
                op: "request",
                role: StreamRole::Accepted,
            });
        }
        let sender = match (self.state(), self.inner.sender.borrow().as_ref()) {
            (SessionState::Connected, Some(sender)) => sender.clone(),
            _ => return Err(self.closed_error()),
        };
        let request = headers.to_request(&self.inner.scheme, &self.inner.authority)?;
        let request_headers = Headers::from_request(&request);

        let mut sender = sender.ready().await?;
        if self.state() != SessionState::Connected {
            return Err(self.closed_error());
        }
        let eos = options.end_stream && !options.wait_for_trailers;
        let (mut response, send) = sender.send_request(request, eos)?;
        let pushes = self.inner.enable_push.then(|| response.push_promises());

        let stream = Stream::new(StreamInit {
            role: StreamRole::Requested,
            side: SessionKind::Client,
            session: self.downgrade(),
            request: request_headers,
            native: Native {
                send: Some(send),
                ..Default::default()
            },
            send: SendState {
                wait_for_trailers: options.wait_for_trailers,
                responded: true,
                finished: options.end_stream,
                closed: eos,
            },
            recv_done: false,
        });
        stream.spawn_pump(pump_request(
            stream.clone(),
            self.downgrade(),
            response,
            pushes,
        ));
        #[cfg(feature = "logging")]
        tracing::debug!(
            "request {:?} sent to {}",
            stream.request_headers().value_string(crate::headers::PATH),
            self.inner.authority
        );
        Ok(stream)
    }
}

async fn establish(url: &str, options: &ConnectOptions) -> Result<Session> {
    let uri: Uri = url.parse()?;
    let scheme = uri.scheme_str().unwrap_or("http");
    if scheme != "http" {
        return Err(Error::UnsupportedScheme(scheme.to_owned()));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| Error::InvalidUri(url.to_owned()))?;
    let host = authority.host();
    let port = authority.port_u16().unwrap_or(DEFAULT_PORT);

    let io = TcpStream::connect((host, port))
        .await
        .map_err(Error::connect)?;
    let _ = io.set_nodelay(true);

    let mut builder = options.settings.client_builder();
    builder.enable_push(options.enable_push);
    let (sender, connection) = builder.handshake(io).await?;
    #[cfg(feature = "logging")]
    tracing::debug!("HTTP/2 session established with {authority}");

    let session = Session::new(
        SessionKind::Client,
        scheme,
        authority.as_str(),
        Some(sender),
        options.enable_push,
        options.max_unclaimed_pushes,
    );
    monoio::spawn(drive(
        session.downgrade(),
        session.inner.kill.clone(),
        connection,
    ));
    session.emit(SessionEvent::Connect);
    Ok(session)
}

/// Polls the engine connection until it ends or the session is destroyed.
async fn drive(
    session: Weak<SessionInner>,
    kill: Rc<Signal>,
    connection: Connection<TcpStream, Bytes>,
) {
    let outcome = {
        let mut connection = pin!(connection);
        poll_fn(|cx| {
            if kill.poll_raised(cx).is_ready() {
                return Poll::Ready(None);
            }
            connection.as_mut().poll(cx).map(Some)
        })
        .await
    };
    let Some(session) = session.upgrade() else {
        return;
    };
    let session = Session::from_inner(session);
    match outcome {
        Some(Err(e)) => session.finish(Some(e.into())),
        Some(Ok(())) | None => session.finish(None),
    }
}

/// Receives the response, body and push promises of a request stream.
///
/// The engine wakes a single task per stream for everything it receives,
/// so push promises are polled by the same task as the response.
async fn pump_request(
    stream: Stream,
    session: Weak<SessionInner>,
    response: ResponseFuture,
    mut pushes: Option<PushPromises>,
) {
    // Runs before any engine event, after the caller got the stream back.
    stream.announce_trailers();
    let mut pump = pin!(stream.clone().pump_response(response));
    poll_fn(|cx| {
        if let Some(promises) = pushes.as_mut() {
            if poll_pushes(&stream, &session, promises, cx).is_ready() {
                pushes = None;
            }
        }
        let done = pump.as_mut().poll(cx);
        if done.is_ready() {
            // Promises queued alongside the final frames.
            if let Some(promises) = pushes.as_mut() {
                let _ = poll_pushes(&stream, &session, promises, cx);
            }
        }
        done
    })
    .await
}

/// Turns the pending push promises into pushed streams. Ready once no more
/// can arrive.
fn poll_pushes(
    parent: &Stream,
    session: &Weak<SessionInner>,
    promises: &mut PushPromises,
    cx: &mut Context<'_>,
) -> Poll<()> {
    loop {
        match promises.poll_push_promise(cx) {
            Poll::Ready(Some(Ok(promise))) => {
                let Some(inner) = session.upgrade() else {
                    return Poll::Ready(());
                };
                accept_push(&Session::from_inner(inner), promise);
            }
            Poll::Ready(Some(Err(e))) => {
                #[cfg(feature = "logging")]
                tracing::warn!("push promise rejected: {e}");
                parent.fail(e.into());
                return Poll::Ready(());
            }
            Poll::Ready(None) => return Poll::Ready(()),
            Poll::Pending => return Poll::Pending,
        }
    }
}

fn accept_push(session: &Session, promise: PushPromise) {
    let (request, response) = promise.into_parts();
    let headers = Headers::from_request(&request);
    let stream = Stream::new(StreamInit {
        role: StreamRole::Pushed,
        side: SessionKind::Client,
        session: session.downgrade(),
        request: headers.clone(),
        native: Native::default(),
        send: SendState {
            finished: true,
            closed: true,
            ..Default::default()
        },
        recv_done: false,
    });
    stream.spawn_pump(stream.clone().pump_response(response));
    session.announce_push(stream, headers);
}
