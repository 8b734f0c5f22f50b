//! Listener dispatch for Switchyard.
//!
//! Applications receive messages by registering a [`PacketListener`]. At
//! registration the listener declares, through [`ListenerBindings::on`],
//! one typed callback per message type it cares about. The [`Dispatcher`]
//! then decodes each incoming envelope once and hands it to every
//! callback bound to its type.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use serde::{Deserialize, Serialize};
//! use switchyard_dispatch::{Dispatcher, ListenerBindings, PacketListener};
//! use switchyard_protocol::{Envelope, FragmentConfig, Member, Message};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping {
//!     n: u32,
//! }
//!
//! impl Message for Ping {
//!     const TYPE_NAME: &'static str = "demo.Ping";
//! }
//!
//! #[derive(Default)]
//! struct Counter(AtomicUsize);
//!
//! impl PacketListener<()> for Counter {
//!     fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<()>) {
//!         bindings.on::<Ping>(move |_, _, ping| {
//!             self.0.fetch_add(ping.n as usize, Ordering::SeqCst);
//!         });
//!     }
//! }
//!
//! let dispatcher = Dispatcher::new();
//! let counter = Arc::new(Counter::default());
//! dispatcher.register_listener(Arc::clone(&counter)).unwrap();
//!
//! let env = Envelope::create(&Ping { n: 3 }, Some(Member::from("a")), [], &FragmentConfig::default())
//!     .unwrap()
//!     .remove(0);
//! dispatcher.deliver(&(), &env).unwrap();
//! assert_eq!(counter.0.load(Ordering::SeqCst), 3);
//! ```

mod dispatcher;
mod error;
mod registry;

pub use dispatcher::{DispatchReport, Dispatcher, ListenerBindings, PacketListener};
pub use error::DispatchError;
pub use registry::TypeRegistry;
