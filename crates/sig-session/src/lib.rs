//! The per-connection session coordinator (spec.md §4.1-4.4): owns one
//! session's audio buffer, batch flusher, and outbound event ordering.

mod actor;
mod outbound;
mod snapshot;
mod supervisor;

pub use actor::{SessionActor, SessionArgs, SessionDefaults, SessionMsg};
pub use supervisor::{RootActor, RootArgs, RootMsg};
