//! Connection registry and handshake state machine for Switchyard.
//!
//! The broker keeps one [`Session`] per accepted connection. A session
//! starts `Pending`, becomes `Authenticated` once its handshake claims a
//! free name, and is removed when the socket closes:
//!
//! ```text
//!   Pending ──(handshake, name free)──→ Authenticated ──(close)──→ Closed
//!      │                                     │
//!      └──(timeout / violation)──→ Closed    └──(second handshake)──→ violation
//! ```
//!
//! The [`Registry`] owns every session plus the name index, and answers
//! the routing question "who should receive this envelope?".
//!
//! # How it fits in the stack
//!
//! ```text
//! Broker (above)            ← drives the state machine per connection
//!     ↕
//! Session Layer (this crate)
//!     ↕
//! Protocol Layer (below)    ← provides Member, Envelope targets
//! ```

mod error;
mod registry;
mod session;

pub use error::SessionError;
pub use registry::Registry;
pub use session::{Outbound, Session, SessionState};
