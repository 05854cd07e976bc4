use std::{future::poll_fn, task::Poll};

use bytes::Bytes;

use super::{Native, SendState, Stream, StreamInit, StreamRole};
use crate::{
    error::{Error, Result},
    headers::{Headers, AUTHORITY, SCHEME},
    options::RespondOptions,
    session::SessionKind,
};

impl Stream {
    /// Sends the response headers of an accepted or pushed server stream.
    pub fn respond(&self, headers: Headers, options: RespondOptions) -> Result<()> {
        if self.inner.side != SessionKind::Server {
            return Err(self.unsupported("respond"));
        }
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let response = headers.to_response()?;
        let sent = Headers::from_response(&response);
        let eos = options.end_stream && !options.wait_for_trailers;

        let send = {
            let mut native = self.inner.native.borrow_mut();
            let Native {
                respond,
                push_respond,
                ..
            } = &mut *native;
            match (self.inner.role, respond, push_respond) {
                (StreamRole::Accepted, Some(respond), _) => respond.send_response(response, eos)?,
                (StreamRole::Pushed, _, Some(respond)) => respond.send_response(response, eos)?,
                _ => return Err(Error::StreamClosed),
            }
        };
        self.inner.native.borrow_mut().send = Some(send);
        self.inner.response.replace(Some(sent));
        self.update_send(|state| {
            state.responded = true;
            state.wait_for_trailers = options.wait_for_trailers;
            state.finished = options.end_stream;
            state.closed = eos;
        });
        #[cfg(feature = "logging")]
        tracing::debug!("responded on {:?} stream, end_stream={eos}", self.inner.role);

        self.announce_trailers();
        self.maybe_close();
        Ok(())
    }

    /// Promises a pushed stream with the given request headers. The returned
    /// stream is then answered with [`Stream::respond`].
    pub fn push_stream(&self, headers: Headers) -> Result<Stream> {
        match (self.inner.side, self.inner.role) {
            (SessionKind::Server, StreamRole::Accepted) => {}
            (SessionKind::Server, StreamRole::Pushed) => return Err(Error::NestedPush),
            _ => return Err(self.unsupported("push_stream")),
        }
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let session = self.session().ok_or(Error::SessionClosed)?;

        let parent = self.request_headers();
        let scheme = parent.value_string(SCHEME).unwrap_or("http");
        let authority = parent
            .value_string(AUTHORITY)
            .map(str::to_owned)
            .unwrap_or_else(|| session.authority().to_owned());
        let request = headers.to_request(scheme, &authority)?;
        let synthetic = Headers::from_request(&request);

        let pushed = self
            .inner
            .native
            .borrow_mut()
            .respond
            .as_mut()
            .ok_or(Error::StreamClosed)?
            .push_request(request)?;
        #[cfg(feature = "logging")]
        tracing::debug!("pushed {:?}", synthetic.value_string(crate::headers::PATH));

        let stream = Stream::new(StreamInit {
            role: StreamRole::Pushed,
            side: SessionKind::Server,
            session: session.downgrade(),
            request: synthetic,
            native: Native {
                push_respond: Some(pushed),
                ..Default::default()
            },
            send: SendState::default(),
            recv_done: true,
        });
        stream.spawn_pump(stream.clone().watch_reset());
        Ok(stream)
    }

    /// Writes a body chunk, waiting for flow-control capacity as needed.
    ///
    /// With `end_of_stream` the body is finished. If trailers were
    /// negotiated, the stream then stays open and emits `WantTrailers`.
    pub async fn send_data(&self, data: Bytes, end_of_stream: bool) -> Result<()> {
        let state = self.writable("send_data")?;
        let eos = end_of_stream && !state.wait_for_trailers;

        let mut data = data;
        if data.is_empty() && eos {
            self.with_send_stream(|send| send.send_data(Bytes::new(), true))?;
        }
        {
            let _sending = self.begin_sending();
            while !data.is_empty() {
                let capacity = self.reserve_capacity(data.len()).await?;
                let chunk = data.split_to(capacity.min(data.len()));
                let last = eos && data.is_empty();
                self.with_send_stream(|send| send.send_data(chunk, last))?;
            }
        }

        if end_of_stream {
            self.update_send(|state| {
                state.finished = true;
                state.closed = eos;
            });
            self.announce_trailers();
            self.maybe_close();
        }
        Ok(())
    }

    /// Finishes the body with an empty final chunk.
    pub async fn end(&self) -> Result<()> {
        self.send_data(Bytes::new(), true).await
    }

    /// Sends trailers, closing the sending side. Only valid after the body
    /// finished on a stream opened with `wait_for_trailers`.
    pub fn send_trailers(&self, headers: Headers) -> Result<()> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let state = self.inner.send.get();
        if !state.wait_for_trailers {
            return Err(Error::TrailersNotNegotiated);
        }
        if !state.finished {
            return Err(Error::BodyNotFinished);
        }
        if state.closed {
            return Err(Error::StreamClosed);
        }
        let trailers = headers.to_header_map()?;
        self.with_send_stream(|send| send.send_trailers(trailers))?;
        self.update_send(|state| state.closed = true);
        self.maybe_close();
        Ok(())
    }

    /// Resets the stream with CANCEL and closes it. Pending waits fail with
    /// [`Error::Destroyed`]. Does nothing on a closed stream.
    pub fn destroy(&self) {
        if self.is_closed() {
            return;
        }
        #[cfg(feature = "logging")]
        tracing::debug!("destroying {:?} stream", self.inner.role);
        self.inner.destroyed.set(true);
        self.inner.native.borrow_mut().reset();
        self.inner.body.feed_error(Error::Destroyed);
        self.close_now(None);
    }

    fn unsupported(&self, op: &'static str) -> Error {
        Error::Unsupported {
            op,
            role: self.inner.role,
        }
    }

    fn writable(&self, op: &'static str) -> Result<SendState> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let state = self.inner.send.get();
        if state.finished {
            return Err(Error::BodyFinished);
        }
        if self.inner.native.borrow().send.is_none() {
            if self.inner.side == SessionKind::Server && !state.responded {
                return Err(Error::NotResponded);
            }
            return Err(self.unsupported(op));
        }
        Ok(state)
    }

    fn with_send_stream<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(
            &mut monoio_http::h2::SendStream<Bytes>,
        ) -> std::result::Result<(), monoio_http::h2::Error>,
    {
        let mut native = self.inner.native.borrow_mut();
        let send = native.send.as_mut().ok_or(Error::StreamClosed)?;
        f(send).map_err(Into::into)
    }

    /// Reserves room for `want` bytes and waits until some of it is granted.
    async fn reserve_capacity(&self, want: usize) -> Result<usize> {
        poll_fn(|cx| {
            let mut native = self.inner.native.borrow_mut();
            let Some(send) = native.send.as_mut() else {
                return Poll::Ready(Err(self.inner.closed_reason()));
            };
            send.reserve_capacity(want);
            let available = send.capacity();
            if available > 0 {
                return Poll::Ready(Ok(available));
            }
            loop {
                match send.poll_capacity(cx) {
                    Poll::Ready(Some(Ok(0))) => continue,
                    Poll::Ready(Some(Ok(n))) => return Poll::Ready(Ok(n)),
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e.into())),
                    Poll::Ready(None) => {
                        let err = match send.poll_reset(cx) {
                            Poll::Ready(Ok(reason)) => Error::Reset(reason),
                            _ => Error::StreamClosed,
                        };
                        return Poll::Ready(Err(err));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use crate::{session::SessionKind, stream::StreamEventKind};

    #[test]
    fn client_cannot_respond_or_push() {
        let stream = Stream::detached(StreamRole::Requested, SessionKind::Client);
        assert!(matches!(
            stream.respond(Headers::new(), RespondOptions::default()),
            Err(Error::Unsupported { op: "respond", .. })
        ));
        assert!(matches!(
            stream.push_stream(Headers::new()),
            Err(Error::Unsupported { op: "push_stream", .. })
        ));
    }

    #[test]
    fn pushed_stream_cannot_push() {
        let stream = Stream::detached(StreamRole::Pushed, SessionKind::Server);
        assert!(matches!(
            stream.push_stream(Headers::new()),
            Err(Error::NestedPush)
        ));
    }

    #[monoio::test]
    async fn data_before_respond() {
        let stream = Stream::detached(StreamRole::Accepted, SessionKind::Server);
        assert!(matches!(
            stream.send_data(Bytes::from_static(b"x"), false).await,
            Err(Error::NotResponded)
        ));
    }

    #[monoio::test]
    async fn finished_body_rejects_data() {
        let stream = Stream::detached(StreamRole::Requested, SessionKind::Client);
        assert!(matches!(stream.end().await, Err(Error::BodyFinished)));
        assert!(matches!(
            stream.send_trailers(Headers::new()),
            Err(Error::TrailersNotNegotiated)
        ));
    }

    #[monoio::test]
    async fn closed_stream_rejects_writes() {
        let stream = Stream::detached(StreamRole::Accepted, SessionKind::Server);
        stream.destroy();
        assert!(matches!(
            stream.respond(Headers::new(), RespondOptions::default()),
            Err(Error::Destroyed)
        ));
        assert!(matches!(stream.end().await, Err(Error::Destroyed)));
        // Destroying twice is a no-op.
        stream.destroy();
    }

    #[test]
    fn trailers_announced_once_body_finished() {
        let stream = Stream::detached(StreamRole::Requested, SessionKind::Client);
        let announced = Rc::new(Cell::new(0));
        let count = announced.clone();
        let _token = stream.on(StreamEventKind::WantTrailers, move |_| count.set(count.get() + 1));

        stream.update_send(|state| {
            state.wait_for_trailers = true;
            state.finished = false;
            state.closed = false;
        });
        stream.announce_trailers();
        assert_eq!(announced.get(), 0);

        stream.update_send(|state| state.finished = true);
        stream.announce_trailers();
        assert_eq!(announced.get(), 1);

        stream.update_send(|state| state.closed = true);
        stream.announce_trailers();
        assert_eq!(announced.get(), 1);
    }
}
