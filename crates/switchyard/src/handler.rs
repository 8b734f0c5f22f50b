//! Per-connection handler: handshake, routing, and cleanup.
//!
//! Each accepted connection gets two Tokio tasks:
//!   - a writer that drains the session's bounded outbound queue onto the
//!     socket;
//!   - this handler, which reads records and drives the state machine:
//!     1. Pending: wait (with a deadline) for a Handshake → authenticate
//!     2. Authenticated: reassemble fragments → route or dispatch locally.
//!        Members may not author system messages; those are dropped.
//!     3. On exit: deregister, announce the departure, drop fragments

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use switchyard_protocol::{
    Codec, Envelope, ErrorNotice, Handshake, Member, MemberUpdate, Message, Roster,
};
use switchyard_session::{Outbound, SessionError};
use switchyard_transport::{Connection, ConnectionId, TcpConnection};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{BrokerHandle, PreHandshakePolicy, SwitchyardError};

/// Drop guard that deregisters a session when the handler exits, however
/// it exits.
struct SessionGuard {
    conn_id: ConnectionId,
    broker: BrokerHandle,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let conn_id = self.conn_id;
        let left = {
            let mut registry = self.broker.registry();
            let left = registry.close(conn_id);
            if let Some(member) = &left {
                let update = MemberUpdate {
                    name: member.name().to_owned(),
                    connected: false,
                };
                broadcast_system(&self.broker, &registry, None, &update);
            }
            left
        };
        self.broker.state.fragments.discard_origin(conn_id);
        if let Some(member) = left {
            tracing::info!(%conn_id, %member, "member left");
        }
    }
}

/// How long a writer waits for the socket to flush and close once its
/// queue is done.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(
    conn: TcpConnection,
    broker: BrokerHandle,
) -> Result<(), SwitchyardError> {
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, peer = %conn.peer_addr(), "handling new connection");

    let (tx, rx) = mpsc::channel(broker.config().outbound_capacity.max(1));
    let closing = broker.registry().open(conn_id, tx);
    let guard = SessionGuard {
        conn_id,
        broker: broker.clone(),
    };
    let writer = tokio::spawn(write_loop(Arc::clone(&conn), rx, closing.clone()));

    let result = tokio::select! {
        result = read_loop(&conn, &broker) => result,
        () = closing.cancelled() => {
            tracing::debug!(%conn_id, "connection closing, reader stopped");
            Ok(())
        }
    };

    // Deregistering drops the session's sender, which lets the writer
    // drain what is queued and close the socket.
    drop(guard);
    let _ = writer.await;
    result
}

/// Drains the outbound queue onto the socket.
///
/// A cancelled `closing` token is a hard stop: nothing more is written and
/// the socket is released once the handler lets go of it. Otherwise the
/// write half is shut down after `Close` or when the queue is dropped, and
/// the token is cancelled so the reader stops too.
async fn write_loop(
    conn: Arc<TcpConnection>,
    mut rx: mpsc::Receiver<Outbound>,
    closing: CancellationToken,
) {
    let conn_id = conn.id();
    loop {
        let item = tokio::select! {
            biased;
            () = closing.cancelled() => {
                tracing::debug!(%conn_id, "writer cancelled");
                return;
            }
            item = rx.recv() => item,
        };
        let Some(Outbound::Record(record)) = item else {
            break;
        };
        let sent = tokio::select! {
            biased;
            () = closing.cancelled() => {
                tracing::debug!(%conn_id, "writer cancelled mid-write");
                return;
            }
            sent = conn.send(&record) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(%conn_id, error = %e, "write failed");
            break;
        }
    }
    match tokio::time::timeout(CLOSE_GRACE, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!(%conn_id, error = %e, "close failed"),
        Err(_) => tracing::debug!(%conn_id, "close timed out"),
    }
    closing.cancel();
}

async fn read_loop(conn: &TcpConnection, broker: &BrokerHandle) -> Result<(), SwitchyardError> {
    let conn_id = conn.id();

    // --- Pending ---
    let Some(member) = await_handshake(conn, broker).await? else {
        return Ok(());
    };

    // --- Authenticated ---
    loop {
        let Some(data) = conn.recv().await? else {
            tracing::debug!(%conn_id, %member, "connection closed cleanly");
            return Ok(());
        };

        let envelope = match broker.state.codec.decode(&data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(%conn_id, %member, error = %e, "failed to decode envelope");
                continue;
            }
        };

        if envelope.is::<Handshake>() {
            tracing::warn!(%conn_id, %member, "handshake on authenticated session");
            let violation = SessionError::ProtocolViolation(format!(
                "already authenticated as {member}"
            ));
            reject(broker, conn_id, ErrorNotice::PROTOCOL_VIOLATION, &violation.to_string());
            return Ok(());
        }

        let envelope = match broker.state.fragments.handle(conn_id, &envelope) {
            Ok(Some(env)) => env,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(%conn_id, %member, error = %e, "dropping fragment");
                continue;
            }
        };

        if envelope.is_system() {
            tracing::warn!(
                %conn_id,
                %member,
                message_type = envelope.message_type_name(),
                "dropping system message sent by a member"
            );
            continue;
        }

        route(broker, conn_id, &member, &envelope);
    }
}

/// Waits for an acceptable handshake. `Ok(None)` means the connection was
/// refused or went away before authenticating; any notice has already
/// been queued.
async fn await_handshake(
    conn: &TcpConnection,
    broker: &BrokerHandle,
) -> Result<Option<Member>, SwitchyardError> {
    let conn_id = conn.id();
    let deadline = tokio::time::Instant::now() + broker.config().handshake_timeout;

    loop {
        let data = match tokio::time::timeout_at(deadline, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::debug!(%conn_id, "connection closed before handshake");
                return Ok(None);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::info!(%conn_id, "handshake timed out");
                reject(broker, conn_id, ErrorNotice::HANDSHAKE_TIMEOUT, "handshake timed out");
                return Ok(None);
            }
        };

        let envelope = match broker.state.codec.decode(&data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode envelope");
                continue;
            }
        };

        if !envelope.is::<Handshake>() {
            match broker.config().pre_handshake {
                PreHandshakePolicy::Drop => {
                    tracing::debug!(
                        %conn_id,
                        message_type = envelope.message_type_name(),
                        "dropping traffic before handshake"
                    );
                    continue;
                }
                PreHandshakePolicy::Disconnect => {
                    tracing::warn!(
                        %conn_id,
                        message_type = envelope.message_type_name(),
                        "traffic before handshake"
                    );
                    reject(
                        broker,
                        conn_id,
                        ErrorNotice::PROTOCOL_VIOLATION,
                        "first message must be a handshake",
                    );
                    return Ok(None);
                }
            }
        }

        let handshake: Handshake = match envelope.decode() {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "malformed handshake");
                reject(broker, conn_id, ErrorNotice::PROTOCOL_VIOLATION, "malformed handshake");
                return Ok(None);
            }
        };

        return match admit(broker, conn_id, &handshake.name) {
            Ok(member) => Ok(Some(member)),
            Err(e) => {
                let code = match e {
                    SessionError::NameConflict(_) | SessionError::ReservedName(_) => {
                        ErrorNotice::NAME_CONFLICT
                    }
                    _ => ErrorNotice::PROTOCOL_VIOLATION,
                };
                tracing::info!(%conn_id, name = %handshake.name, error = %e, "handshake denied");
                reject(broker, conn_id, code, &e.to_string());
                Ok(None)
            }
        };
    }
}

/// Authenticates under the registry lock, then announces the newcomer
/// and sends it the roster before anyone else can join or leave.
fn admit(broker: &BrokerHandle, conn_id: ConnectionId, name: &str) -> Result<Member, SessionError> {
    let mut registry = broker.registry();
    let member = registry.authenticate(conn_id, name)?;

    let joined = MemberUpdate {
        name: member.name().to_owned(),
        connected: true,
    };
    broadcast_system(broker, &registry, Some(conn_id), &joined);

    let roster = Roster {
        broker: Member::BROKER_NAME.to_owned(),
        members: registry.roster().iter().map(|m| m.name().to_owned()).collect(),
    };
    for record in system_records(broker, &roster, [member.clone()]) {
        registry.send_to(conn_id, record);
    }

    tracing::info!(%conn_id, %member, "member joined");
    Ok(member)
}

/// Relays an authenticated envelope and/or hands it to broker listeners.
fn route(broker: &BrokerHandle, conn_id: ConnectionId, sender: &Member, envelope: &Envelope) {
    let relayed = envelope.resourced(sender.clone());

    if relayed.targets_broker() {
        broker.deliver_local(conn_id, &relayed);
        if relayed.member_targets().next().is_none() {
            return;
        }
    }

    let records = match relayed
        .clone()
        .split(&broker.config().fragment)
        .map_err(SwitchyardError::from)
        .and_then(|envs| broker.records(&envs))
    {
        Ok(records) => records,
        Err(e) => {
            tracing::debug!(%conn_id, %sender, error = %e, "cannot relay envelope");
            return;
        }
    };

    let registry = broker.registry();
    let ids = registry.recipients(Some(conn_id), relayed.targets());
    for record in &records {
        registry.deliver(&ids, record);
    }
    tracing::trace!(
        %conn_id,
        %sender,
        message_type = relayed.message_type_name(),
        recipients = ids.len(),
        "relayed"
    );
}

/// Queues an error notice for a connection, then asks for it to be closed.
fn reject(broker: &BrokerHandle, conn_id: ConnectionId, code: u16, message: &str) {
    let notice = ErrorNotice::new(code, message);
    let registry = broker.registry();
    for record in system_records(broker, &notice, []) {
        registry.send_to(conn_id, record);
    }
    registry.disconnect(conn_id);
}

fn system_records<M: Message>(
    broker: &BrokerHandle,
    message: &M,
    targets: impl IntoIterator<Item = Member>,
) -> Vec<Bytes> {
    let encoded = Envelope::create(message, Some(Member::broker()), targets, &broker.config().fragment)
        .map_err(SwitchyardError::from)
        .and_then(|envs| broker.records(&envs));
    match encoded {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(message_type = M::TYPE_NAME, error = %e, "failed to encode system message");
            Vec::new()
        }
    }
}

fn broadcast_system<M: Message>(
    broker: &BrokerHandle,
    registry: &switchyard_session::Registry,
    except: Option<ConnectionId>,
    message: &M,
) {
    for record in system_records(broker, message, []) {
        registry.broadcast_except(except, &record);
    }
}
