//! Error types for listener dispatch.

use switchyard_protocol::CodecError;

/// Errors that stop an envelope from reaching any listener.
///
/// A listener that panics is not an error here: it is caught, logged and
/// counted in the [`DispatchReport`](crate::DispatchReport) while the
/// remaining listeners still run.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The payload could not be decoded; nothing was delivered.
    #[error("decode failed: {0}")]
    Codec(#[from] CodecError),

    /// No listener is bound to this message type.
    #[error("no listener bound for {0}")]
    Unbound(String),

    /// A binding table lock was poisoned by a panic while held.
    #[error("listener table lock poisoned")]
    LockPoisoned,
}
