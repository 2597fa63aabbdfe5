//! Peer-side core of a full-mesh call.
//!
//! Presence updates from mesh-road flow through the [`reconciler`] into
//! connect/disconnect decisions, the [`tiebreak`] picks which side dials,
//! and the [`lifecycle`] manager keeps exactly one live connection per
//! remote peer. [`session`] runs all of it on a single event loop and
//! [`teardown`] unwinds it.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod media;
pub mod presence;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod teardown;
pub mod tiebreak;
pub mod transport;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{MeshSession, SessionDeps, SessionHandle, SessionOutcome, SessionView};
