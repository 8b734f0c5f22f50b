//! The registry: every live connection plus the name index.
//!
//! # Concurrency note
//!
//! `Registry` is a plain struct with `&mut self` methods. The broker wraps
//! it in a `std::sync::Mutex` and holds the lock across "check name,
//! register, notify" so joins and leaves are observed in one order by
//! everyone. Nothing here awaits: queuing is `try_send`, so the lock is
//! never held across a suspension point.

use std::collections::HashMap;

use bytes::Bytes;
use switchyard_protocol::Member;
use switchyard_transport::{ConnectionId, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Outbound, Session, SessionError, SessionState};

/// All sessions known to the broker.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<ConnectionId, Session>,

    /// Authenticated names only. Kept in sync with `sessions`.
    names: HashMap<Member, ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection in the `Pending` state.
    /// Returns the session's `closing` token.
    pub fn open(&mut self, id: ConnectionId, outbound: mpsc::Sender<Outbound>) -> CancellationToken {
        let session = Session::new(id, outbound);
        let closing = session.closing();
        self.sessions.insert(id, session);
        tracing::debug!(conn_id = %id, "session opened");
        closing
    }

    /// Binds `name` to a pending session and marks it authenticated.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`]: the connection is not registered
    /// - [`SessionError::ProtocolViolation`]: the session already completed
    ///   its handshake
    /// - [`SessionError::InvalidName`] / [`SessionError::ReservedName`] /
    ///   [`SessionError::NameConflict`]: the name cannot be claimed
    pub fn authenticate(
        &mut self,
        id: ConnectionId,
        name: &str,
    ) -> Result<Member, SessionError> {
        let session = self.sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        if let Some(current) = session.member() {
            return Err(SessionError::ProtocolViolation(format!(
                "second handshake on a session already authenticated as {current}"
            )));
        }

        if !Member::is_valid_name(name) {
            return Err(SessionError::InvalidName(name.to_owned()));
        }
        if name == Member::BROKER_NAME {
            return Err(SessionError::ReservedName(name.to_owned()));
        }
        if let Some((held, _)) = self.names.get_key_value(name) {
            return Err(SessionError::NameConflict(held.clone()));
        }

        let member = Member::new(name);
        self.names.insert(member.clone(), id);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_state(SessionState::Authenticated(member.clone()));
        }

        tracing::info!(conn_id = %id, %member, "member authenticated");
        Ok(member)
    }

    /// Removes a session. Returns the member it was authenticated as, if
    /// any, so the caller can announce the departure.
    pub fn close(&mut self, id: ConnectionId) -> Option<Member> {
        let session = self.sessions.remove(&id)?;
        let member = session.member().cloned();
        if let Some(member) = &member {
            self.names.remove(member);
        }
        tracing::debug!(conn_id = %id, member = ?member, "session closed");
        member
    }

    pub fn state(&self, id: ConnectionId) -> SessionState {
        self.sessions
            .get(&id)
            .map_or(SessionState::Closed, |s| s.state().clone())
    }

    pub fn session(&self, id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn member(&self, id: ConnectionId) -> Option<&Member> {
        self.sessions.get(&id).and_then(Session::member)
    }

    pub fn connection_of(&self, member: &str) -> Option<ConnectionId> {
        self.names.get(member).copied()
    }

    /// Names of every authenticated member, sorted.
    pub fn roster(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.names.keys().cloned().collect();
        members.sort();
        members
    }

    /// Number of registered connections, pending ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Resolves who receives an envelope from `sender`.
    ///
    /// Empty `targets` means every authenticated session except the
    /// sender. Otherwise each named member that is connected, again never
    /// the sender itself, even when it names itself. The broker's reserved
    /// name and unknown names resolve to nobody.
    pub fn recipients(&self, sender: Option<ConnectionId>, targets: &[Member]) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = if targets.is_empty() {
            self.names.values().copied().collect()
        } else {
            targets
                .iter()
                .filter(|t| !t.is_broker())
                .filter_map(|t| self.names.get(t).copied())
                .collect()
        };
        ids.retain(|id| Some(*id) != sender);
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Queues `record` on one session, pending or not. Returns `false` if
    /// the session is unknown, its writer is gone, or its queue is full.
    /// A full queue also cuts the session off.
    pub fn send_to(&self, id: ConnectionId, record: Bytes) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        match session.send(record) {
            Ok(()) => true,
            Err(e @ TransportError::QueueFull { .. }) => {
                tracing::warn!(conn_id = %id, member = ?session.member(), error = %e, "disconnecting slow consumer");
                false
            }
            Err(e) => {
                tracing::trace!(conn_id = %id, error = %e, "record not queued");
                false
            }
        }
    }

    /// Queues `record` on each of `ids`. Returns how many accepted it.
    pub fn deliver(&self, ids: &[ConnectionId], record: &Bytes) -> usize {
        ids.iter()
            .filter(|id| self.send_to(**id, record.clone()))
            .count()
    }

    /// Queues `record` on every authenticated session except `except`.
    pub fn broadcast_except(&self, except: Option<ConnectionId>, record: &Bytes) -> usize {
        let ids = self.recipients(except, &[]);
        self.deliver(&ids, record)
    }

    /// Asks a session's writer to close the connection.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.sessions.get(&id).is_some_and(Session::close)
    }

    /// Asks every session to close, pending ones included. Returns how
    /// many accepted the request.
    pub fn disconnect_all(&self) -> usize {
        self.sessions.values().filter(|s| s.close()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    fn open(registry: &mut Registry, n: u64) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        registry.open(conn(n), tx);
        rx
    }

    fn record_count(rx: &mut mpsc::Receiver<Outbound>) -> usize {
        let mut n = 0;
        while let Ok(item) = rx.try_recv() {
            if matches!(item, Outbound::Record(_)) {
                n += 1;
            }
        }
        n
    }

    #[test]
    fn test_open_starts_pending() {
        let mut registry = Registry::new();
        let _rx = open(&mut registry, 1);

        assert_eq!(registry.state(conn(1)), SessionState::Pending);
        assert!(registry.member(conn(1)).is_none());
        assert!(registry.roster().is_empty());
    }

    #[test]
    fn test_authenticate_free_name_succeeds() {
        let mut registry = Registry::new();
        let _rx = open(&mut registry, 1);

        let member = registry.authenticate(conn(1), "alice").unwrap();

        assert_eq!(member, Member::from("alice"));
        assert_eq!(registry.state(conn(1)), SessionState::Authenticated(member.clone()));
        assert_eq!(registry.connection_of("alice"), Some(conn(1)));
        assert_eq!(registry.roster(), vec![member]);
    }

    #[test]
    fn test_authenticate_taken_name_conflicts_and_keeps_original() {
        let mut registry = Registry::new();
        let _a = open(&mut registry, 1);
        let _b = open(&mut registry, 2);
        registry.authenticate(conn(1), "alice").unwrap();

        let result = registry.authenticate(conn(2), "alice");

        assert!(matches!(result, Err(SessionError::NameConflict(m)) if m.name() == "alice"));
        assert_eq!(registry.state(conn(2)), SessionState::Pending);
        assert_eq!(registry.connection_of("alice"), Some(conn(1)));
    }

    #[test]
    fn test_authenticate_broker_name_is_reserved() {
        let mut registry = Registry::new();
        let _rx = open(&mut registry, 1);

        assert!(matches!(
            registry.authenticate(conn(1), Member::BROKER_NAME),
            Err(SessionError::ReservedName(_))
        ));
    }

    #[test]
    fn test_authenticate_blank_name_is_invalid() {
        let mut registry = Registry::new();
        let _rx = open(&mut registry, 1);

        assert!(matches!(
            registry.authenticate(conn(1), ""),
            Err(SessionError::InvalidName(_))
        ));
    }

    #[test]
    fn test_authenticate_twice_is_violation() {
        let mut registry = Registry::new();
        let _rx = open(&mut registry, 1);
        registry.authenticate(conn(1), "alice").unwrap();

        assert!(matches!(
            registry.authenticate(conn(1), "alice2"),
            Err(SessionError::ProtocolViolation(_))
        ));
        assert_eq!(registry.connection_of("alice2"), None);
    }

    #[test]
    fn test_authenticate_unknown_connection_not_found() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.authenticate(conn(9), "x"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_close_frees_name() {
        let mut registry = Registry::new();
        let _a = open(&mut registry, 1);
        let _b = open(&mut registry, 2);
        registry.authenticate(conn(1), "alice").unwrap();

        assert_eq!(registry.close(conn(1)), Some(Member::from("alice")));
        assert_eq!(registry.state(conn(1)), SessionState::Closed);
        assert!(registry.authenticate(conn(2), "alice").is_ok());
    }

    #[test]
    fn test_close_pending_returns_none() {
        let mut registry = Registry::new();
        let _rx = open(&mut registry, 1);

        assert_eq!(registry.close(conn(1)), None);
        assert!(registry.is_empty());
    }

    fn three_members() -> (Registry, Vec<mpsc::Receiver<Outbound>>) {
        let mut registry = Registry::new();
        let rxs = (1..=4).map(|n| open(&mut registry, n)).collect();
        registry.authenticate(conn(1), "a").unwrap();
        registry.authenticate(conn(2), "b").unwrap();
        registry.authenticate(conn(3), "c").unwrap();
        // conn 4 stays pending
        (registry, rxs)
    }

    #[test]
    fn test_recipients_broadcast_skips_sender_and_pending() {
        let (registry, _rxs) = three_members();

        assert_eq!(registry.recipients(Some(conn(1)), &[]), vec![conn(2), conn(3)]);
    }

    #[test]
    fn test_recipients_targeted_never_includes_sender() {
        let (registry, _rxs) = three_members();
        let targets = [Member::from("a"), Member::from("b")];

        assert_eq!(registry.recipients(Some(conn(1)), &targets), vec![conn(2)]);
    }

    #[test]
    fn test_recipients_unknown_and_broker_targets_resolve_to_nobody() {
        let (registry, _rxs) = three_members();
        let targets = [Member::broker(), Member::from("zed")];

        assert!(registry.recipients(Some(conn(1)), &targets).is_empty());
    }

    #[test]
    fn test_recipients_without_sender_reaches_everyone() {
        let (registry, _rxs) = three_members();

        assert_eq!(registry.recipients(None, &[]).len(), 3);
    }

    #[test]
    fn test_broadcast_except_queues_once_per_member() {
        let (registry, mut rxs) = three_members();

        let sent = registry.broadcast_except(Some(conn(2)), &Bytes::from_static(b"{}"));

        assert_eq!(sent, 2);
        let counts: Vec<usize> = rxs.iter_mut().map(record_count).collect();
        assert_eq!(counts, vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_send_to_dropped_writer_returns_false() {
        let mut registry = Registry::new();
        let rx = open(&mut registry, 1);
        drop(rx);

        assert!(!registry.send_to(conn(1), Bytes::from_static(b"{}")));
    }

    #[test]
    fn test_disconnect_queues_close() {
        let mut registry = Registry::new();
        let mut rx = open(&mut registry, 1);

        assert!(registry.disconnect(conn(1)));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_deliver_to_full_queue_cuts_off_slow_member() {
        let mut registry = Registry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let closing = registry.open(conn(1), tx);
        registry.authenticate(conn(1), "slow").unwrap();
        let record = Bytes::from_static(b"{}");

        assert_eq!(registry.deliver(&[conn(1)], &record), 1);
        assert_eq!(registry.deliver(&[conn(1)], &record), 0);
        assert!(closing.is_cancelled());
        assert_eq!(record_count(&mut rx), 1);
    }

    #[test]
    fn test_disconnect_all_includes_pending() {
        let (registry, mut rxs) = three_members();

        assert_eq!(registry.disconnect_all(), 4);
        for rx in &mut rxs {
            assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        }
    }
}
