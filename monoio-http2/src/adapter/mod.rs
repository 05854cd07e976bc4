//! Bridges between event listeners and futures.
//!
//! Native handles report progress through events ([`Emitter`]); callers
//! suspend on [`Wait`]s that settle on the first relevant event and detach
//! every listener they registered when they settle or get cancelled.
mod completion;
mod event;

pub use self::{
    completion::{completion, from_callback, ready, Canceller, Completion, Wait},
    event::{Emitter, Event, ListenerToken},
};
