//! Client session: one outbound connection to a broker.
//!
//! `connect` opens the socket, sends the handshake, and waits for the
//! broker's roster before returning. From then on a background task reads
//! records, reassembles fragments, keeps the member directory current,
//! and feeds everything else to the registered listeners.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use switchyard_dispatch::{DispatchError, Dispatcher, ListenerBindings, PacketListener};
use switchyard_protocol::{
    Codec, Envelope, ErrorNotice, FragmentAssembler, Handshake, JsonCodec, Member, MemberUpdate,
    Message, Roster,
};
use switchyard_transport::{Connection, ConnectionId, TcpConnection};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{ClientConfig, SwitchyardError};

type Registration = Box<dyn FnOnce(&Dispatcher<Client>) -> Result<usize, SwitchyardError> + Send>;
type HandshakeResult = Result<(), SwitchyardError>;

/// How long `disconnect` waits for the write half to flush and close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

struct ClientInner {
    member: Member,
    conn_id: ConnectionId,
    /// Taken on disconnect so the socket is released.
    conn: Mutex<Option<Arc<TcpConnection>>>,
    directory: RwLock<BTreeSet<Member>>,
    dispatcher: Dispatcher<Client>,
    fragments: FragmentAssembler,
    codec: JsonCodec,
    config: ClientConfig,
    connected: AtomicBool,
    handshake: Mutex<Option<oneshot::Sender<HandshakeResult>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn resolve_handshake(&self, result: HandshakeResult) -> bool {
        let sender = self
            .handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = reader.take() {
            task.abort();
        }
    }
}

/// A connected participant.
///
/// Cheap to clone; every clone shares the one connection. Listeners get
/// a `Client` as their first callback argument.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(name)
    }

    /// The name this client authenticated as.
    pub fn member(&self) -> &Member {
        &self.inner.member
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Sends `message` to `targets`, or to every other member if `targets`
    /// is empty. Oversized messages go out as fragments.
    ///
    /// Each envelope is written in turn and the next one only once the
    /// previous write has completed, so a slow link slows the sender down
    /// instead of queueing without bound.
    ///
    /// # Errors
    /// [`SwitchyardError::Disconnected`] after [`disconnect`](Self::disconnect)
    /// or once the connection has dropped; encode and write failures
    /// otherwise.
    pub async fn send_packet<M: Message>(
        &self,
        message: &M,
        targets: impl IntoIterator<Item = Member>,
    ) -> Result<(), SwitchyardError> {
        if !self.is_connected() {
            return Err(SwitchyardError::Disconnected);
        }
        let envelopes = Envelope::create(message, None, targets, &self.inner.config.fragment)?;
        for envelope in &envelopes {
            self.write(envelope).await?;
        }
        Ok(())
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), SwitchyardError> {
        let record = self.inner.codec.encode(envelope)?;
        let Some(conn) = self.inner.connection() else {
            return Err(SwitchyardError::Disconnected);
        };
        if let Err(e) = conn.send(&record).await {
            self.inner.connected.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Looks a member up in the local directory.
    ///
    /// The directory is filled from the broker's roster and join/leave
    /// updates, so a name the broker knows may not resolve yet.
    ///
    /// # Errors
    /// [`SwitchyardError::MemberNotFound`] if the name is not listed.
    pub fn get_member(&self, name: &str) -> Result<Member, SwitchyardError> {
        self.inner
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| SwitchyardError::MemberNotFound(name.to_owned()))
    }

    /// Every member in the local directory, this client and the broker
    /// included, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        self.inner
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn register_packet_listener<L: PacketListener<Client>>(
        &self,
        listener: Arc<L>,
    ) -> Result<usize, SwitchyardError> {
        Ok(self.inner.dispatcher.register_listener(listener)?)
    }

    /// Removes every binding made by listeners of type `L`.
    pub fn unregister_packet_listener<L: 'static>(&self) -> Result<usize, SwitchyardError> {
        Ok(self.inner.dispatcher.unregister_listener::<L>()?)
    }

    /// Closes the connection and releases the socket. Later sends fail
    /// with [`SwitchyardError::Disconnected`]. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            self.close_connection().await;
            tracing::info!(member = %self.inner.member, "disconnected");
        }
    }

    /// Stops the reader, then shuts the write half down and drops the last
    /// handle on the socket.
    async fn close_connection(&self) {
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = reader {
            task.abort();
            let _ = task.await;
        }

        let conn = self
            .inner
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(conn) = conn else {
            return;
        };
        let member = &self.inner.member;
        match tokio::time::timeout(CLOSE_GRACE, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(%member, error = %e, "close failed"),
            Err(_) => tracing::debug!(%member, "close timed out"),
        }
    }

    fn directory(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<Member>> {
        self.inner
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(&self, data: &[u8]) {
        let conn_id = self.inner.conn_id;
        let envelope = match self.inner.codec.decode(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode envelope");
                return;
            }
        };
        let envelope = match self.inner.fragments.handle(conn_id, &envelope) {
            Ok(Some(env)) => env,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "dropping fragment");
                return;
            }
        };

        match self.inner.dispatcher.deliver(self, &envelope) {
            Ok(_) => {}
            Err(DispatchError::Unbound(message_type)) => {
                tracing::trace!(%conn_id, %message_type, "no listener bound");
            }
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "envelope not delivered");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

async fn read_loop(client: Weak<ClientInner>, conn: Arc<TcpConnection>, sweep_every: std::time::Duration) {
    let conn_id = conn.id();
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.tick().await;

    loop {
        tokio::select! {
            received = conn.recv() => {
                let data = match received {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::debug!(%conn_id, "broker closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%conn_id, error = %e, "receive failed");
                        break;
                    }
                };
                let Some(inner) = client.upgrade() else {
                    return;
                };
                Client { inner }.receive(&data);
            }
            _ = sweep.tick() => {
                if let Some(inner) = client.upgrade() {
                    inner.fragments.sweep_expired();
                }
            }
        }
    }

    if let Some(inner) = client.upgrade() {
        inner.connected.store(false, Ordering::Release);
        inner.resolve_handshake(Err(SwitchyardError::Disconnected));
    }
}

// ---------------------------------------------------------------------------
// Membership listener
// ---------------------------------------------------------------------------

/// Keeps the directory in sync and completes `connect`.
struct Membership;

impl PacketListener<Client> for Membership {
    fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<Client>) {
        bindings.on::<Roster>(|client, source, roster| {
            if !client.from_broker(source, Roster::TYPE_NAME) {
                return;
            }
            if roster.broker == client.member().name() {
                tracing::warn!(member = %client.member(), "name collides with the broker's");
                client.inner.connected.store(false, Ordering::Release);
                client.resolve(Err(SwitchyardError::NameConflict(roster.broker.clone())));
                return;
            }
            {
                let mut directory = client.directory();
                directory.clear();
                directory.insert(Member::new(roster.broker.as_str()));
                directory.extend(roster.members());
            }
            client.resolve(Ok(()));
        });

        bindings.on::<MemberUpdate>(|client, source, update| {
            if !client.from_broker(source, MemberUpdate::TYPE_NAME) {
                return;
            }
            let member = Member::new(update.name.as_str());
            if update.connected {
                client.directory().insert(member);
            } else {
                client.directory().remove(&member);
            }
        });

        bindings.on::<ErrorNotice>(|client, source, notice| {
            if !client.from_broker(source, ErrorNotice::TYPE_NAME) {
                return;
            }
            let error = if notice.code == ErrorNotice::NAME_CONFLICT {
                SwitchyardError::NameConflict(client.member().name().to_owned())
            } else {
                SwitchyardError::Denied {
                    code: notice.code,
                    reason: notice.message.clone(),
                }
            };
            if !client.resolve(Err(error)) {
                tracing::warn!(
                    member = %client.member(),
                    code = notice.code,
                    message = %notice.message,
                    "broker reported an error"
                );
            }
        });
    }
}

impl Client {
    fn resolve(&self, result: HandshakeResult) -> bool {
        self.inner.resolve_handshake(result)
    }

    /// Only the broker may speak membership and error messages.
    fn from_broker(&self, source: &Member, message_type: &str) -> bool {
        if source.is_broker() {
            return true;
        }
        tracing::warn!(
            conn_id = %self.inner.conn_id,
            %source,
            message_type,
            "ignoring system message not sent by the broker"
        );
        false
    }
}

// ---------------------------------------------------------------------------
// ClientBuilder
// ---------------------------------------------------------------------------

/// Builder for connecting a client.
///
/// # Example
///
/// ```rust,no_run
/// use switchyard::prelude::*;
///
/// # async fn start() -> Result<(), SwitchyardError> {
/// let client = ClientBuilder::new("lobby-1")
///     .connect("127.0.0.1:7700")
///     .await?;
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    name: String,
    config: ClientConfig,
    listeners: Vec<Registration>,
}

impl ClientBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ClientConfig::default(),
            listeners: Vec::new(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a listener before the connection opens, so it sees
    /// everything from the first record on.
    pub fn listener<L: PacketListener<Client>>(mut self, listener: Arc<L>) -> Self {
        self.listeners.push(Box::new(
            move |dispatcher: &Dispatcher<Client>| -> Result<usize, SwitchyardError> {
                Ok(dispatcher.register_listener(listener)?)
            },
        ));
        self
    }

    /// Connects to the broker at `addr` and completes the handshake.
    ///
    /// # Errors
    /// - [`SwitchyardError::NameConflict`]: the name is taken or reserved
    /// - [`SwitchyardError::Denied`]: the broker refused for another reason
    /// - [`SwitchyardError::HandshakeTimeout`]: no roster within
    ///   `handshake_timeout`
    /// - [`SwitchyardError::Disconnected`]: the broker closed the
    ///   connection without a reason
    pub async fn connect(self, addr: &str) -> Result<Client, SwitchyardError> {
        let conn = Arc::new(TcpConnection::connect(addr).await?);
        let (ready_tx, ready_rx) = oneshot::channel();

        let client = Client {
            inner: Arc::new(ClientInner {
                member: Member::new(self.name),
                conn_id: conn.id(),
                conn: Mutex::new(Some(Arc::clone(&conn))),
                directory: RwLock::new(BTreeSet::new()),
                dispatcher: Dispatcher::new(),
                fragments: FragmentAssembler::new(self.config.fragment.clone()),
                codec: JsonCodec,
                config: self.config,
                connected: AtomicBool::new(true),
                handshake: Mutex::new(Some(ready_tx)),
                reader: Mutex::new(None),
            }),
        };

        client.inner.dispatcher.register_listener(Arc::new(Membership))?;
        for register in self.listeners {
            register(&client.inner.dispatcher)?;
        }

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&client.inner),
            conn,
            client.inner.config.fragment.group_ttl.max(std::time::Duration::from_millis(100)),
        ));
        *client
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader);

        let handshake = Handshake {
            name: client.member().name().to_owned(),
        };
        for envelope in Envelope::create(&handshake, None, [], &client.inner.config.fragment)? {
            client.write(&envelope).await?;
        }

        let timeout = client.inner.config.handshake_timeout;
        let outcome = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SwitchyardError::Disconnected),
            Err(_) => Err(SwitchyardError::HandshakeTimeout),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(member = %client.member(), addr, "connected to broker");
                Ok(client)
            }
            Err(e) => {
                client.inner.connected.store(false, Ordering::Release);
                client.close_connection().await;
                Err(e)
            }
        }
    }
}
