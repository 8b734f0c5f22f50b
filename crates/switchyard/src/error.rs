//! Unified error type for Switchyard.

use switchyard_dispatch::DispatchError;
use switchyard_protocol::{CodecError, ProtocolError};
use switchyard_session::SessionError;
use switchyard_transport::TransportError;

/// Top-level error that wraps every layer's error.
///
/// Using the `switchyard` crate you only deal with this one type; `?`
/// converts the layer errors through the `#[from]` impls.
#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    /// Connect, send, or receive failed at the socket level.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An envelope or fragment was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A message payload failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The broker refused a handshake.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Listener registration or delivery failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The client is not connected (never was, or has disconnected).
    #[error("not connected")]
    Disconnected,

    /// No member of that name is in the client's directory.
    #[error("member not found: {0}")]
    MemberNotFound(String),

    /// The broker did not answer the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The broker sent an error notice instead of a roster.
    #[error("handshake denied ({code}): {reason}")]
    Denied { code: u16, reason: String },

    /// The requested name is taken or reserved.
    #[error("name conflict: {0}")]
    NameConflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_protocol::Member;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let err: SwitchyardError = err.into();
        assert!(matches!(err, SwitchyardError::Transport(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: SwitchyardError = ProtocolError::InvalidMessage("bad".into()).into();
        assert!(matches!(err, SwitchyardError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err: SwitchyardError = SessionError::NameConflict(Member::from("a")).into();
        assert!(matches!(err, SwitchyardError::Session(_)));
        assert!(err.to_string().contains("a"));
    }

    #[test]
    fn test_from_dispatch_error() {
        let err: SwitchyardError = DispatchError::Unbound("t".into()).into();
        assert!(matches!(err, SwitchyardError::Dispatch(_)));
    }

    #[test]
    fn test_denied_display_includes_code() {
        let err = SwitchyardError::Denied {
            code: 400,
            reason: "nope".into(),
        };
        assert_eq!(err.to_string(), "handshake denied (400): nope");
    }
}
