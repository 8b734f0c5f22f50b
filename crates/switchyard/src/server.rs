//! Broker builder, accept loop, and the shared broker handle.
//!
//! This is the entry point for running a Switchyard broker. It ties the
//! layers together: transport → protocol → session registry → dispatch.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use switchyard_dispatch::{Dispatcher, PacketListener};
use switchyard_protocol::{Codec, Envelope, FragmentAssembler, JsonCodec, Member, Message};
use switchyard_session::Registry;
use switchyard_transport::{ConnectionId, TcpTransport, Transport};

use crate::handler::handle_connection;
use crate::{BrokerConfig, SwitchyardError};

type Registration = Box<dyn FnOnce(&Dispatcher<BrokerHandle>) -> Result<usize, SwitchyardError> + Send>;

/// State shared by the accept loop, every connection task, and every
/// [`BrokerHandle`].
pub(crate) struct BrokerState {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) fragments: FragmentAssembler,
    pub(crate) dispatcher: Dispatcher<BrokerHandle>,
    pub(crate) codec: JsonCodec,
    pub(crate) config: BrokerConfig,
}

// ---------------------------------------------------------------------------
// BrokerHandle
// ---------------------------------------------------------------------------

/// A cheap, cloneable handle to a running broker.
///
/// Broker-side listeners receive one as their first callback argument,
/// so they can answer through it. All methods are synchronous: sends are
/// queued on the recipients' writer tasks and never wait on the network.
#[derive(Clone)]
pub struct BrokerHandle {
    pub(crate) state: Arc<BrokerState>,
}

impl BrokerHandle {
    // Registry operations never leave it half-updated, so a poisoned lock
    // is still consistent.
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.state.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.state.config
    }

    /// Encodes every envelope once so the bytes can be shared between
    /// recipients.
    pub(crate) fn records(&self, envelopes: &[Envelope]) -> Result<Vec<Bytes>, SwitchyardError> {
        envelopes
            .iter()
            .map(|env| -> Result<Bytes, SwitchyardError> {
                Ok(Bytes::from(self.state.codec.encode(env)?))
            })
            .collect()
    }

    /// Sends `message` from the broker itself. Empty `targets` reaches every
    /// authenticated member; otherwise only the named, connected ones.
    /// Returns how many members it was queued for.
    ///
    /// # Errors
    /// Fails only if the message cannot be encoded.
    pub fn send_packet<M: Message>(
        &self,
        message: &M,
        targets: impl IntoIterator<Item = Member>,
    ) -> Result<usize, SwitchyardError> {
        let envelopes = Envelope::create(
            message,
            Some(Member::broker()),
            targets,
            &self.config().fragment,
        )?;
        let records = self.records(&envelopes)?;
        let Some(first) = envelopes.first() else {
            return Ok(0);
        };

        let registry = self.registry();
        let ids = registry.recipients(None, first.targets());
        for record in &records {
            registry.deliver(&ids, record);
        }
        Ok(ids.len())
    }

    /// Registers a broker-side listener for messages targeted at
    /// [`Member::BROKER_NAME`].
    pub fn register_packet_listener<L: PacketListener<BrokerHandle>>(
        &self,
        listener: Arc<L>,
    ) -> Result<usize, SwitchyardError> {
        Ok(self.state.dispatcher.register_listener(listener)?)
    }

    /// Removes every binding made by listeners of type `L`.
    pub fn unregister_packet_listener<L: 'static>(&self) -> Result<usize, SwitchyardError> {
        Ok(self.state.dispatcher.unregister_listener::<L>()?)
    }

    /// Authenticated members, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        self.registry().roster()
    }

    /// Asks every connection to close once its queue drains, including
    /// ones that have not finished their handshake.
    pub(crate) fn close_all(&self) -> usize {
        self.registry().disconnect_all()
    }

    pub(crate) fn deliver_local(&self, conn_id: ConnectionId, envelope: &Envelope) {
        match self.state.dispatcher.deliver(self, envelope) {
            Ok(report) => {
                tracing::trace!(
                    %conn_id,
                    message_type = envelope.message_type_name(),
                    delivered = report.delivered,
                    failed = report.failed,
                    "dispatched to broker listeners"
                );
            }
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "broker-targeted envelope not delivered");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BrokerBuilder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a broker.
///
/// # Example
///
/// ```rust,no_run
/// use switchyard::prelude::*;
///
/// # async fn start() -> Result<(), SwitchyardError> {
/// let broker = BrokerBuilder::new()
///     .bind("0.0.0.0:7700")
///     .build()
///     .await?;
/// broker.run().await
/// # }
/// ```
pub struct BrokerBuilder {
    bind_addr: String,
    config: BrokerConfig,
    listeners: Vec<Registration>,
}

impl BrokerBuilder {
    /// Creates a builder with default settings, bound to `127.0.0.1:7700`.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:7700".to_string(),
            config: BrokerConfig::default(),
            listeners: Vec::new(),
        }
    }

    /// Sets the address to listen on.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a broker-side listener before the first connection is
    /// accepted.
    pub fn listener<L: PacketListener<BrokerHandle>>(mut self, listener: Arc<L>) -> Self {
        self.listeners.push(Box::new(
            move |dispatcher: &Dispatcher<BrokerHandle>| -> Result<usize, SwitchyardError> {
                Ok(dispatcher.register_listener(listener)?)
            },
        ));
        self
    }

    /// Binds the listening socket.
    pub async fn build(self) -> Result<Broker, SwitchyardError> {
        let transport = TcpTransport::bind(&self.bind_addr)
            .await?
            .max_record(self.config.max_record);

        let handle = BrokerHandle {
            state: Arc::new(BrokerState {
                registry: Mutex::new(Registry::new()),
                fragments: FragmentAssembler::new(self.config.fragment.clone()),
                dispatcher: Dispatcher::new(),
                codec: JsonCodec,
                config: self.config,
            }),
        };
        for register in self.listeners {
            register(&handle.state.dispatcher)?;
        }

        Ok(Broker { transport, handle })
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A bound broker. Call [`run`](Self::run) or [`run_until`](Self::run_until)
/// to start accepting connections.
pub struct Broker {
    transport: TcpTransport,
    handle: BrokerHandle,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Returns the local address the broker is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// A handle that stays valid while the broker runs.
    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Runs the accept loop until the process ends.
    pub async fn run(self) -> Result<(), SwitchyardError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` resolves, then stops listening
    /// and asks every open connection to close.
    ///
    /// Each accepted connection gets its own task; see the handler module
    /// for the per-connection state machine.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<(), SwitchyardError> {
        tracing::info!(addr = ?self.local_addr().ok(), "switchyard broker running");

        let sweeper = tokio::spawn(sweep_fragments(self.handle.clone()));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("broker shutting down");
                    break;
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let handle = self.handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, handle).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        sweeper.abort();
        self.transport.shutdown().await?;
        let closing = self.handle.close_all();
        tracing::debug!(connections = closing, "asked open connections to close");
        Ok(())
    }
}

async fn sweep_fragments(handle: BrokerHandle) {
    let mut interval = tokio::time::interval(handle.config().sweep_interval);
    loop {
        interval.tick().await;
        handle.state.fragments.sweep_expired();
    }
}
