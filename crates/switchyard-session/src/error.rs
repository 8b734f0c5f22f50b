//! Error types for the session layer.

use switchyard_protocol::Member;
use switchyard_transport::ConnectionId;

/// Errors raised while driving a session through its handshake.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Another live session already holds this name.
    #[error("name already in use: {0}")]
    NameConflict(Member),

    /// The name is reserved for the broker.
    #[error("name is reserved: {0}")]
    ReservedName(String),

    /// The name is empty, too long, or contains whitespace or control
    /// characters.
    #[error("invalid member name: {0:?}")]
    InvalidName(String),

    /// The session did something its current state does not allow, such
    /// as a second handshake.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No session is registered for the connection.
    #[error("no session for {0}")]
    NotFound(ConnectionId),
}
