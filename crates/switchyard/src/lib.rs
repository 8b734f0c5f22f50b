//! # Switchyard
//!
//! A named-endpoint message bus. A central broker accepts TCP connections
//! from uniquely named members and relays typed messages between them,
//! either to named targets or to everyone.
//!
//! Applications define messages as serde structs implementing
//! [`Message`], send them with [`Client::send_packet`], and receive them
//! through a [`PacketListener`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use switchyard::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Message for Chat {
//!     const TYPE_NAME: &'static str = "demo.Chat";
//! }
//!
//! struct Printer;
//!
//! impl PacketListener<Client> for Printer {
//!     fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<Client>) {
//!         bindings.on::<Chat>(|_, source, chat| println!("{source}: {}", chat.text));
//!     }
//! }
//!
//! # async fn run() -> Result<(), SwitchyardError> {
//! let client = ClientBuilder::new("alice")
//!     .listener(Arc::new(Printer))
//!     .connect("127.0.0.1:7700")
//!     .await?;
//! client.send_packet(&Chat { text: "hi".into() }, []).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod handler;
pub mod logging;
mod server;

pub use client::{Client, ClientBuilder};
pub use config::{BrokerConfig, ClientConfig, PreHandshakePolicy};
pub use error::SwitchyardError;
pub use server::{Broker, BrokerBuilder, BrokerHandle};

pub use switchyard_dispatch::{DispatchReport, ListenerBindings, PacketListener};
pub use switchyard_protocol::{
    ErrorNotice, FragmentConfig, Member, MemberUpdate, Message, Roster,
};

/// Everything an application usually needs, in one import.
pub mod prelude {
    pub use crate::{
        Broker, BrokerBuilder, BrokerConfig, BrokerHandle, Client, ClientBuilder,
        ClientConfig, FragmentConfig, ListenerBindings, Member, MemberUpdate, Message,
        PacketListener, PreHandshakePolicy, Roster, SwitchyardError,
    };
}
