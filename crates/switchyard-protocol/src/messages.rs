//! System messages: the handful of types the bus itself speaks.
//!
//! These ride in ordinary envelopes and go through the same field codec
//! as application messages. Applications may listen for [`Roster`] and
//! [`MemberUpdate`] like any other type.
//!
//! Only the broker speaks them. Apart from [`Handshake`] and [`Fragment`]
//! carriers, a client-authored system message is dropped by the broker,
//! and a client ignores any system message not sourced from the broker.

use serde::{Deserialize, Serialize};

use crate::{Member, Message};

/// First message on every client connection: the name to claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub name: String,
}

impl Message for Handshake {
    const TYPE_NAME: &'static str = "switchyard.Handshake";
}

/// Sent once to a newly authenticated member: who the broker is and who
/// else is connected (including the new member).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub broker: String,
    pub members: Vec<String>,
}

impl Message for Roster {
    const TYPE_NAME: &'static str = "switchyard.Roster";
}

impl Roster {
    pub fn members(&self) -> impl Iterator<Item = Member> + '_ {
        self.members.iter().map(|name| Member::new(name.as_str()))
    }
}

/// Broadcast to the other members when someone joins or leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub name: String,
    pub connected: bool,
}

impl Message for MemberUpdate {
    const TYPE_NAME: &'static str = "switchyard.MemberUpdate";
}

/// Sent by the broker right before it closes a connection for cause.
///
/// Codes follow HTTP conventions; see the associated constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: u16,
    pub message: String,
}

impl ErrorNotice {
    pub const PROTOCOL_VIOLATION: u16 = 400;
    pub const HANDSHAKE_TIMEOUT: u16 = 408;
    pub const NAME_CONFLICT: u16 = 409;

    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Message for ErrorNotice {
    const TYPE_NAME: &'static str = "switchyard.ErrorNotice";
}

/// Carrier for one slice of an oversized payload.
///
/// `sequence` is 1-based. `type_name` is the type of the message being
/// carried, not of the carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub group_id: u64,
    pub sequence: u32,
    pub total: u32,
    pub type_name: String,
    pub chunk: String,
}

impl Message for Fragment {
    const TYPE_NAME: &'static str = "switchyard.Fragment";
}

/// Type names reserved for the bus's own messages.
pub const SYSTEM_TYPES: [&str; 5] = [
    Handshake::TYPE_NAME,
    Roster::TYPE_NAME,
    MemberUpdate::TYPE_NAME,
    ErrorNotice::TYPE_NAME,
    Fragment::TYPE_NAME,
];
