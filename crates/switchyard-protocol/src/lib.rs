//! Wire protocol for Switchyard.
//!
//! This crate defines what travels between broker and clients:
//!
//! - **Types** ([`Member`], [`Envelope`], the [`Message`] trait): the
//!   routed unit and the identities it is addressed to.
//! - **Field codec** ([`encode_message`], [`decode_message`]): how an
//!   application message becomes payload text.
//! - **System messages** ([`Handshake`], [`Roster`], [`MemberUpdate`],
//!   [`ErrorNotice`], [`Fragment`]): what the bus itself says.
//! - **Fragmentation** ([`FragmentConfig`], [`FragmentAssembler`]):
//!   splitting oversized payloads and putting them back together.
//! - **Record codec** ([`Codec`], [`JsonCodec`]): envelopes to wire
//!   records and back.
//!
//! # Architecture
//!
//! ```text
//! Transport (records) → Protocol (Envelope) → Session / Dispatch
//! ```
//!
//! The protocol layer knows nothing about sockets or who is connected.

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod error;
mod fields;
mod fragment;
mod messages;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{Codec, JsonCodec};
pub use error::{CodecError, ProtocolError};
pub use fields::{EncodedMessage, decode_message, encode_message};
pub use fragment::{FragmentAssembler, FragmentConfig};
pub use messages::{ErrorNotice, Fragment, Handshake, MemberUpdate, Roster, SYSTEM_TYPES};
pub use types::{Envelope, Member, Message};
