use std::{io, sync::Arc};

use thiserror::Error as ThisError;

use crate::stream::StreamRole;

/// Errors surfaced by sessions, streams and waits.
///
/// One error is often delivered to several waiters (every pending wait on a
/// stream observes the same failure), so the type is `Clone` and wraps
/// non-cloneable sources in `Arc`.
#[derive(ThisError, Debug, Clone)]
pub enum Error {
    #[error("connect error {0}")]
    Connect(#[source] Arc<io::Error>),
    #[error("io error {0}")]
    Io(#[source] Arc<io::Error>),
    #[error("H2 error {0}")]
    H2(#[source] Arc<monoio_http::h2::Error>),
    #[error("http error {0}")]
    Http(#[source] Arc<http::Error>),
    #[error("invalid uri {0}")]
    InvalidUri(String),
    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("session is closed")]
    SessionClosed,
    #[error("stream is closed")]
    StreamClosed,
    #[error("stream ended before the awaited event")]
    Ended,
    #[error("stream was destroyed")]
    Destroyed,
    #[error("stream reset by peer: {0}")]
    Reset(monoio_http::h2::Reason),
    #[error("wait was cancelled")]
    Cancelled,
    #[error("wait timed out")]
    Timeout,
    #[error("{op} is not supported on a {role:?} stream")]
    Unsupported { op: &'static str, role: StreamRole },
    #[error("trailers were not negotiated for this stream")]
    TrailersNotNegotiated,
    #[error("trailers must follow the final body chunk")]
    BodyNotFinished,
    #[error("body is already finished")]
    BodyFinished,
    #[error("response headers have not been sent")]
    NotResponded,
    #[error("cannot push from a pushed stream")]
    NestedPush,
    #[error("server is already listening")]
    AlreadyListening,
}

impl Error {
    pub(crate) fn connect(e: io::Error) -> Self {
        Self::Connect(Arc::new(e))
    }

    /// Returns `true` if the wait gave up rather than the peer failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<monoio_http::h2::Error> for Error {
    fn from(e: monoio_http::h2::Error) -> Self {
        Self::H2(Arc::new(e))
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Self::Http(Arc::new(e))
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(e: http::uri::InvalidUri) -> Self {
        Self::InvalidUri(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
