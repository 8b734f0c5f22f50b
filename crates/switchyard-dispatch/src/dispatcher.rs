//! The dispatcher: message type → bound callbacks.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use switchyard_protocol::{Envelope, Member, Message};

use crate::registry::{DecodeFn, decoder_for};
use crate::{DispatchError, TypeRegistry};

type Callback<H> = Arc<dyn Fn(&H, &Member, &dyn Any) + Send + Sync>;

// ---------------------------------------------------------------------------
// PacketListener / ListenerBindings
// ---------------------------------------------------------------------------

/// An application object that receives messages.
///
/// `H` is the handle passed back to every callback: a
/// `switchyard::Client` on the client side, a `switchyard::BrokerHandle`
/// on the broker. Callbacks can use it to reply.
///
/// `bind` runs once per registration and declares the callbacks:
///
/// ```rust,ignore
/// impl PacketListener<Client> for ChatLog {
///     fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<Client>) {
///         bindings.on::<Chat>(move |_client, source, chat| {
///             self.push(source, &chat.text);
///         });
///     }
/// }
/// ```
pub trait PacketListener<H>: Send + Sync + 'static {
    fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<H>);
}

struct Binding<H> {
    type_name: &'static str,
    decode: DecodeFn,
    callback: Callback<H>,
}

/// Collects the typed callbacks of one listener during [`PacketListener::bind`].
pub struct ListenerBindings<H> {
    entries: Vec<Binding<H>>,
}

impl<H: 'static> ListenerBindings<H> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Binds `callback` to messages of type `M`. The callback receives the
    /// handle, the sending member, and the decoded message.
    ///
    /// Binding the same type more than once from one listener is allowed;
    /// each callback runs.
    pub fn on<M: Message>(
        &mut self,
        callback: impl Fn(&H, &Member, &M) + Send + Sync + 'static,
    ) -> &mut Self {
        let callback: Callback<H> = Arc::new(move |handle: &H, source: &Member, message: &dyn Any| {
            if let Some(message) = message.downcast_ref::<M>() {
                callback(handle, source, message);
            }
        });
        self.entries.push(Binding {
            type_name: M::TYPE_NAME,
            decode: decoder_for::<M>(),
            callback,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DispatchReport
// ---------------------------------------------------------------------------

/// What happened to one delivered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Callbacks that ran to completion.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Table<H> {
    types: TypeRegistry,
    handlers: HashMap<&'static str, Vec<(TypeId, Callback<H>)>>,
}

/// Routes decoded messages to the callbacks bound to their type.
///
/// Safe to share: registration takes a write lock, delivery only a brief
/// read lock to copy out the callbacks, which then run unlocked. A
/// callback may therefore register or unregister listeners itself.
pub struct Dispatcher<H> {
    table: RwLock<Table<H>>,
}

impl<H: 'static> Default for Dispatcher<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: 'static> Dispatcher<H> {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table {
                types: TypeRegistry::new(),
                handlers: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table<H>>, DispatchError> {
        self.table.read().map_err(|_| DispatchError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table<H>>, DispatchError> {
        self.table.write().map_err(|_| DispatchError::LockPoisoned)
    }

    /// Registers every callback `listener` binds. Returns how many were
    /// bound.
    ///
    /// Bindings are keyed by the listener's concrete type, which is what
    /// [`unregister_listener`](Self::unregister_listener) removes by.
    pub fn register_listener<L: PacketListener<H>>(
        &self,
        listener: Arc<L>,
    ) -> Result<usize, DispatchError> {
        let owner = TypeId::of::<L>();
        let mut bindings = ListenerBindings::new();
        listener.bind(&mut bindings);
        let count = bindings.len();

        let mut table = self.write()?;
        for binding in bindings.entries {
            table.types.insert(binding.type_name, binding.decode);
            table
                .handlers
                .entry(binding.type_name)
                .or_default()
                .push((owner, binding.callback));
        }
        drop(table);

        tracing::debug!(listener = std::any::type_name::<L>(), count, "listener registered");
        Ok(count)
    }

    /// Removes every binding registered by listeners of type `L`. Returns
    /// how many were removed.
    pub fn unregister_listener<L: 'static>(&self) -> Result<usize, DispatchError> {
        let owner = TypeId::of::<L>();
        let mut table = self.write()?;
        let mut removed = 0;
        table.handlers.retain(|_, callbacks| {
            let before = callbacks.len();
            callbacks.retain(|(id, _)| *id != owner);
            removed += before - callbacks.len();
            !callbacks.is_empty()
        });
        drop(table);

        tracing::debug!(listener = std::any::type_name::<L>(), removed, "listener unregistered");
        Ok(removed)
    }

    /// Whether any callback is bound to `type_name`.
    pub fn is_bound(&self, type_name: &str) -> bool {
        self.read()
            .map(|t| t.handlers.contains_key(type_name))
            .unwrap_or(false)
    }

    /// Decodes `envelope` once and runs every callback bound to its type.
    ///
    /// The source handed to callbacks is the envelope's source, or the
    /// broker's pseudo-member when none was set. Each callback is isolated:
    /// a panic is logged and counted, and the others still run.
    ///
    /// # Errors
    /// [`DispatchError::Unbound`] if nothing listens for the type, and
    /// [`DispatchError::Codec`] if the payload does not decode. In both
    /// cases no callback runs.
    pub fn deliver(&self, handle: &H, envelope: &Envelope) -> Result<DispatchReport, DispatchError> {
        let type_name = envelope.message_type_name();
        let (decode, callbacks) = {
            let table = self.read()?;
            let Some(callbacks) = table.handlers.get(type_name) else {
                return Err(DispatchError::Unbound(type_name.to_owned()));
            };
            let decode = table
                .types
                .decoder(type_name)
                .ok_or_else(|| DispatchError::Unbound(type_name.to_owned()))?;
            let callbacks: Vec<Callback<H>> = callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (decode, callbacks)
        };

        let message = decode(envelope.payload())?;
        let source = envelope.source().cloned().unwrap_or_else(Member::broker);

        let mut report = DispatchReport::default();
        for callback in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(handle, &source, &*message)));
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.failed += 1;
                    tracing::warn!(
                        message_type = type_name,
                        %source,
                        panic = panic_message(&*panic),
                        "listener panicked"
                    );
                }
            }
        }
        Ok(report)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};
    use switchyard_protocol::{FragmentConfig, encode_message};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    impl Message for Chat {
        const TYPE_NAME: &'static str = "test.Chat";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
    }

    impl Message for Move {
        const TYPE_NAME: &'static str = "test.Move";
    }

    /// Records everything it sees; the handle is a plain tag string.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String, String)>>,
    }

    impl PacketListener<&'static str> for Recorder {
        fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<&'static str>) {
            let me = Arc::clone(&self);
            bindings.on::<Chat>(move |handle, source, chat| {
                me.seen
                    .lock()
                    .unwrap()
                    .push((handle.to_string(), source.to_string(), chat.text.clone()));
            });
            bindings.on::<Move>(move |_, source, mv| {
                self.seen
                    .lock()
                    .unwrap()
                    .push(("move".into(), source.to_string(), mv.x.to_string()));
            });
        }
    }

    struct Panicker;

    impl PacketListener<&'static str> for Panicker {
        fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<&'static str>) {
            bindings.on::<Chat>(|_, _, _| panic!("listener blew up"));
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl PacketListener<&'static str> for Counter {
        fn bind(self: Arc<Self>, bindings: &mut ListenerBindings<&'static str>) {
            bindings.on::<Chat>(move |_, _, _| {
                self.0.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    fn chat_from(source: &str, text: &str) -> Envelope {
        Envelope::create(
            &Chat { text: text.into() },
            Some(Member::from(source)),
            [],
            &FragmentConfig::default(),
        )
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_register_listener_counts_bindings() {
        let dispatcher = Dispatcher::new();

        let count = dispatcher.register_listener(Arc::new(Recorder::default())).unwrap();

        assert_eq!(count, 2);
        assert!(dispatcher.is_bound(Chat::TYPE_NAME));
        assert!(dispatcher.is_bound(Move::TYPE_NAME));
    }

    #[test]
    fn test_deliver_passes_handle_source_and_message() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register_listener(Arc::clone(&recorder)).unwrap();

        let report = dispatcher.deliver(&"h1", &chat_from("alice", "hi")).unwrap();

        assert_eq!(report, DispatchReport { delivered: 1, failed: 0 });
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![("h1".into(), "alice".into(), "hi".into())]
        );
    }

    #[test]
    fn test_deliver_reaches_every_listener_of_the_type() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(Counter::default());
        let recorder = Arc::new(Recorder::default());
        dispatcher.register_listener(Arc::clone(&counter)).unwrap();
        dispatcher.register_listener(Arc::clone(&recorder)).unwrap();

        let report = dispatcher.deliver(&"h", &chat_from("a", "x")).unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_deliver_panicking_listener_does_not_stop_others() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(Counter::default());
        dispatcher.register_listener(Arc::new(Panicker)).unwrap();
        dispatcher.register_listener(Arc::clone(&counter)).unwrap();

        let report = dispatcher.deliver(&"h", &chat_from("a", "x")).unwrap();

        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // The dispatcher keeps working afterwards.
        dispatcher.deliver(&"h", &chat_from("a", "y")).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deliver_unbound_type_fails() {
        let dispatcher: Dispatcher<&'static str> = Dispatcher::new();

        assert!(matches!(
            dispatcher.deliver(&"h", &chat_from("a", "x")),
            Err(DispatchError::Unbound(name)) if name == Chat::TYPE_NAME
        ));
    }

    #[test]
    fn test_deliver_undecodable_payload_runs_nothing() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(Counter::default());
        dispatcher.register_listener(Arc::clone(&counter)).unwrap();
        // A Move payload labelled as Chat.
        let bogus = Envelope::new(
            Chat::TYPE_NAME,
            encode_message(&Move { x: 1 }).unwrap().payload,
            Some(Member::from("a")),
            [],
        );

        let result = dispatcher.deliver(&"h", &bogus);

        assert!(matches!(result, Err(DispatchError::Codec(_))));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_listener_removes_only_that_type() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(Counter::default());
        let recorder = Arc::new(Recorder::default());
        dispatcher.register_listener(Arc::clone(&counter)).unwrap();
        dispatcher.register_listener(Arc::clone(&recorder)).unwrap();

        assert_eq!(dispatcher.unregister_listener::<Recorder>().unwrap(), 2);
        assert!(!dispatcher.is_bound(Move::TYPE_NAME));

        let report = dispatcher.deliver(&"h", &chat_from("a", "x")).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_deliver_without_source_uses_broker() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register_listener(Arc::clone(&recorder)).unwrap();
        let env = Envelope::create(&Move { x: 4 }, None, [], &FragmentConfig::default())
            .unwrap()
            .remove(0);

        dispatcher.deliver(&"h", &env).unwrap();

        assert_eq!(
            recorder.seen.lock().unwrap()[0],
            ("move".into(), Member::BROKER_NAME.into(), "4".into())
        );
    }
}
