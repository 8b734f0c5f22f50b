//! Per-connection session state.

use std::time::Instant;

use bytes::Bytes;
use switchyard_protocol::Member;
use switchyard_transport::{ConnectionId, TransportError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// What a connection's writer task is asked to do next.
///
/// Records are queued as [`Bytes`] so one encoded relay can be handed to
/// many recipients without copying.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Write one encoded envelope record.
    Record(Bytes),
    /// Flush what is queued, then close the connection.
    Close,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Where a connection is in the handshake lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no successful handshake yet. Nothing is routed to or
    /// from a pending session.
    Pending,

    /// Handshake accepted; the connection speaks for this member.
    Authenticated(Member),

    /// The connection is gone (or was never registered).
    Closed,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The broker's record of one connection.
///
/// The outbound queue is bounded. Queuing never waits: a record that does
/// not fit marks the member as a slow consumer and cancels the session's
/// `closing` token, which tears the connection down without draining.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    state: SessionState,
    outbound: mpsc::Sender<Outbound>,
    closing: CancellationToken,
    opened: Instant,
}

impl Session {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            state: SessionState::Pending,
            outbound,
            closing: CancellationToken::new(),
            opened: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn member(&self) -> Option<&Member> {
        match &self.state {
            SessionState::Authenticated(member) => Some(member),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated(_))
    }

    /// When the connection was accepted.
    pub fn opened(&self) -> Instant {
        self.opened
    }

    /// Cancelled once the connection must stop: the writer has finished,
    /// or the peer fell too far behind.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Queues a record for the writer task.
    ///
    /// # Errors
    /// - [`TransportError::QueueFull`]: the queue is at capacity; the
    ///   session is cancelled as a slow consumer
    /// - [`TransportError::ConnectionClosed`]: the writer has gone away
    pub fn send(&self, record: Bytes) -> Result<(), TransportError> {
        match self.outbound.try_send(Outbound::Record(record)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.closing.cancel();
                Err(TransportError::QueueFull {
                    capacity: self.outbound.max_capacity(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::ConnectionClosed(format!(
                "writer for {} has stopped",
                self.id
            ))),
        }
    }

    /// Asks the writer task to close the connection after draining. With
    /// no room left to queue the request, the session is cancelled
    /// instead. Returns `false` if the writer has already gone away.
    pub fn close(&self) -> bool {
        match self.outbound.try_send(Outbound::Close) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.closing.cancel();
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(capacity: usize) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Session::new(ConnectionId::new(1), tx), rx)
    }

    #[test]
    fn test_send_within_capacity_queues_record() {
        let (session, mut rx) = session(2);

        session.send(Bytes::from_static(b"{}")).unwrap();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Record(r)) if r == "{}"));
        assert!(!session.closing().is_cancelled());
    }

    #[test]
    fn test_send_full_queue_fails_and_cancels() {
        let (session, _rx) = session(1);
        session.send(Bytes::from_static(b"{}")).unwrap();

        let result = session.send(Bytes::from_static(b"{}"));

        assert!(matches!(result, Err(TransportError::QueueFull { capacity: 1 })));
        assert!(session.closing().is_cancelled());
    }

    #[test]
    fn test_send_after_writer_gone_is_closed() {
        let (session, rx) = session(1);
        drop(rx);

        assert!(matches!(
            session.send(Bytes::from_static(b"{}")),
            Err(TransportError::ConnectionClosed(_))
        ));
        assert!(!session.closing().is_cancelled());
    }

    #[test]
    fn test_close_full_queue_cancels_instead() {
        let (session, _rx) = session(1);
        session.send(Bytes::from_static(b"{}")).unwrap();

        assert!(session.close());
        assert!(session.closing().is_cancelled());
    }
}
