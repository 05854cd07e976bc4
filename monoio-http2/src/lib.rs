//! HTTP/2 sessions and streams for monoio, exposed both as events and as
//! cancellable futures.
//!
//! A [`Session`] wraps one connection. Client sessions open [`Stream`]s with
//! [`Session::request`]; a [`Server`] reports incoming streams. Every one-shot
//! event (response headers, trailers, end of body, pushes) can also be
//! awaited as a [`Wait`], which detaches its listeners when it settles or is
//! cancelled.

pub mod adapter;
mod error;
pub mod headers;
pub mod options;
mod session;
mod stream;
mod util;

pub use adapter::{Canceller, Completion, Emitter, Event, ListenerToken, Wait};
pub use error::{Error, Result};
pub use headers::{FieldValue, Headers};
pub use options::{ConnectOptions, ListenOptions, RequestOptions, RespondOptions, SettingsOptions};
pub use session::{
    Push, Server, ServerEvent, ServerEventKind, Session, SessionEvent, SessionEventKind,
    SessionKind, SessionState,
};
pub use stream::{Stream, StreamEvent, StreamEventKind, StreamRole, StreamState};
