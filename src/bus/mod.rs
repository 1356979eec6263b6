//! The message bus core: one logical connection to a D-Bus daemon or peer.

#[cfg(test)]
mod tests;

pub use self::match_rule::MatchRule;
mod match_rule;

mod dispatch;

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::address::{self, parse_address_list};
use crate::connection::{authenticate, Transport};
use crate::error::{DBusError, Error, ErrorKind, Result};
use crate::introspect;
use crate::marshal::{marshal_message, Unmarshaller};
use crate::message::Message;
use crate::org_freedesktop_dbus as fdo;
use crate::org_freedesktop_dbus::{NameFlag, NameReply, ReleaseNameReply};
use crate::protocol::{Flags, MessageType};
use crate::proxy::ProxyObject;
use crate::sasl::AuthMechanism;
use crate::service::ServiceInterface;
use crate::validators;
use crate::value::Value;

/// What a message handler did with a message.
#[derive(Debug)]
pub enum HandlerAction {
    /// The message was not for this handler, keep dispatching.
    Continue,
    /// The message has been taken care of, stop dispatching.
    Handled,
    /// The message has been taken care of and this reply should be sent.
    Reply(Message),
}

/// Identifies a handler registered with
/// [`MessageBus::add_message_handler`], for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

pub(crate) type MessageHandler = Arc<dyn Fn(&Message) -> HandlerAction + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: MessageHandler,
}

pub(crate) struct PendingReply {
    tx: oneshot::Sender<Result<Message>>,
    destination: Option<String>,
}

pub(crate) enum Outbound {
    Message { bytes: Vec<u8>, fds: Vec<RawFd> },
    Shutdown,
}

#[derive(Debug, Clone)]
enum DisconnectReason {
    Requested,
    Error(Box<str>),
}

pub(crate) struct BusState {
    hello_pending: bool,
    unique_name: Option<String>,
    machine_id: Option<String>,
    disconnected: bool,
    pub(crate) replies: HashMap<u32, PendingReply>,
    pub(crate) exports: BTreeMap<String, Vec<Arc<ServiceInterface>>>,
    handlers: Vec<HandlerEntry>,
    rules: HashMap<String, usize>,
    pub(crate) name_owners: HashMap<String, String>,
    buffered: Vec<(Vec<u8>, Vec<RawFd>)>,
}

pub(crate) struct BusInner {
    serial: AtomicU32,
    next_handler_id: AtomicU64,
    negotiated_unix_fd: bool,
    writer: mpsc::UnboundedSender<Outbound>,
    pub(crate) state: Mutex<BusState>,
    disconnect: watch::Sender<Option<DisconnectReason>>,
}

/// A connection to a D-Bus message bus daemon, or directly to a peer.
///
/// The bus owns its transport, assigns serials, tracks replies to
/// outstanding calls, dispatches incoming messages to exported
/// [`ServiceInterface`]s and registered handlers, and manages match rules.
/// Handles are cheap to clone and share one connection.
///
/// # Examples
///
/// ```no_run
/// use minibus::{Message, MessageBus};
///
/// # #[tokio::main] async fn main() -> minibus::Result<()> {
/// let bus = MessageBus::session().await?;
///
/// let reply = bus
///     .call(
///         Message::method_call("/org/freedesktop/DBus", "ListNames")
///             .with_interface("org.freedesktop.DBus")
///             .with_destination("org.freedesktop.DBus"),
///     )
///     .await?;
///
/// println!("{:?}", reply.unwrap().body());
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus").finish_non_exhaustive()
    }
}

/// Builder configuring how a [`MessageBus`] connects.
///
/// # Examples
///
/// ```no_run
/// use minibus::MessageBusBuilder;
///
/// # #[tokio::main] async fn main() -> minibus::Result<()> {
/// let bus = MessageBusBuilder::new()
///     .session_bus()
///     .negotiate_unix_fd(true)
///     .connect()
///     .await?;
/// # Ok(()) }
/// ```
pub struct MessageBusBuilder {
    address: Option<String>,
    system: bool,
    negotiate_unix_fd: bool,
    mechanisms: Vec<AuthMechanism>,
}

impl MessageBusBuilder {
    /// Construct a new builder targeting the session bus.
    pub fn new() -> Self {
        Self {
            address: None,
            system: false,
            negotiate_unix_fd: false,
            mechanisms: vec![AuthMechanism::External],
        }
    }

    /// Connect to the session bus (default).
    pub fn session_bus(mut self) -> Self {
        self.system = false;
        self
    }

    /// Connect to the system bus.
    pub fn system_bus(mut self) -> Self {
        self.system = true;
        self
    }

    /// Connect to an explicit address instead of a well-known bus.
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Negotiate file descriptor passing during authentication.
    pub fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Replace the SASL mechanisms offered to the server.
    pub fn mechanisms(mut self, mechanisms: Vec<AuthMechanism>) -> Self {
        debug_assert!(!mechanisms.is_empty());
        self.mechanisms = mechanisms;
        self
    }

    /// Open the transport, authenticate, say `Hello` and return the
    /// connected bus.
    pub async fn connect(self) -> Result<MessageBus> {
        let address = match &self.address {
            Some(address) => address.clone(),
            None if self.system => address::system_bus_address(),
            None => address::session_bus_address()?,
        };

        let list = parse_address_list(&address)?;
        let (mut transport, address_guid) = Transport::connect(&list)?;

        let auth = authenticate(&mut transport, self.mechanisms, self.negotiate_unix_fd).await?;

        if let (Some(expected), Some(actual)) = (&address_guid, auth.guid()) {
            if !expected.is_empty() && expected != actual {
                return Err(Error::new(ErrorKind::AuthFailed(
                    format!("server guid `{actual}` does not match address guid `{expected}`")
                        .into(),
                )));
            }
        }

        let negotiated_unix_fd = auth.unix_fd_agreed() && transport.supports_fd_passing();
        let bus = MessageBus::start(transport, negotiated_unix_fd, true);

        let hello = Message::method_call(fdo::PATH, "Hello")
            .with_interface(fdo::INTERFACE)
            .with_destination(fdo::DESTINATION);

        let reply = bus.call_inner(hello, true).await?;

        let unique_name = reply
            .as_ref()
            .and_then(|m| m.body().first())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidMessage("Hello reply carried no name".into()))
            })?
            .to_owned();

        tracing::debug!(name = %unique_name, "connected to message bus");

        {
            let mut state = bus.inner.lock_state();
            state.unique_name = Some(unique_name);
            state.hello_pending = false;

            for (bytes, fds) in std::mem::take(&mut state.buffered) {
                let _ = bus.inner.writer.send(Outbound::Message { bytes, fds });
            }
        }

        // Keep the owner map current for proxies matching signal senders.
        let rule = MatchRule::signal()
            .with_sender(fdo::DESTINATION)
            .with_interface(fdo::INTERFACE)
            .with_path(fdo::PATH)
            .with_member("NameOwnerChanged");
        bus.inner.daemon_send_no_reply("AddMatch", "s", vec![Value::String(rule.canonical())])?;

        Ok(bus)
    }
}

impl Default for MessageBusBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Connect to the session bus, per `DBUS_SESSION_BUS_ADDRESS`.
    pub async fn session() -> Result<Self> {
        MessageBusBuilder::new().session_bus().connect().await
    }

    /// Connect to the system bus, per `DBUS_SYSTEM_BUS_ADDRESS` or its
    /// well-known default address.
    pub async fn system() -> Result<Self> {
        MessageBusBuilder::new().system_bus().connect().await
    }

    /// Speak D-Bus directly over an already connected socket, without a
    /// daemon in between.
    ///
    /// No authentication is performed and no `Hello` is sent: there is no
    /// unique name and broadcast signals only reach the peer itself. File
    /// descriptor passing is available. Must be called within a tokio
    /// runtime.
    pub fn peer(stream: UnixStream) -> Result<Self> {
        let transport = Transport::from_unix_stream(stream)?;
        Ok(Self::start(transport, true, false))
    }

    fn start(mut transport: Transport, negotiated_unix_fd: bool, hello_pending: bool) -> Self {
        let (writer, rx) = mpsc::unbounded_channel();
        let (disconnect, _) = watch::channel(None);

        let inner = Arc::new(BusInner {
            serial: AtomicU32::new(1),
            next_handler_id: AtomicU64::new(1),
            negotiated_unix_fd,
            writer,
            state: Mutex::new(BusState {
                hello_pending,
                unique_name: None,
                machine_id: None,
                disconnected: false,
                replies: HashMap::new(),
                exports: BTreeMap::new(),
                handlers: Vec::new(),
                rules: HashMap::new(),
                name_owners: HashMap::new(),
                buffered: Vec::new(),
            }),
            disconnect,
        });

        let leftover = transport.take_leftover();
        tokio::spawn(io_task(inner.clone(), transport, rx, leftover));

        Self { inner }
    }

    /// The unique name assigned by the daemon at `Hello` time, absent on
    /// peer-to-peer connections.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.lock_state().unique_name.clone()
    }

    /// Allocate the next outgoing serial.
    ///
    /// Serials are also assigned automatically when an unserialied message
    /// is sent; this is for managing them manually.
    pub fn next_serial(&self) -> NonZeroU32 {
        self.inner.next_serial()
    }

    /// Queue a message for sending, assigning a serial if it has none.
    ///
    /// Validation and marshalling errors surface here without touching the
    /// transport. Messages queued before the connection handshake finished
    /// are buffered and flushed once it has.
    pub fn send(&self, mut message: Message) -> Result<NonZeroU32> {
        self.inner.queue_message(&mut message, false)
    }

    /// Send a method call and await its reply.
    ///
    /// Returns `None` when the message has `NO_REPLY_EXPECTED` set, in
    /// which case no reply is tracked at all. An `ERROR` reply is raised as
    /// an [`Error`] carrying the remote error name, see
    /// [`Error::remote_error`].
    pub async fn call(&self, message: Message) -> Result<Option<Message>> {
        self.call_inner(message, false).await
    }

    /// [`call`] with a deadline; on expiry the pending reply is abandoned
    /// and a late reply will be dropped.
    ///
    /// [`call`]: Self::call
    pub async fn call_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.call(message)).await {
            Ok(result) => result,
            Err(..) => Err(Error::new(ErrorKind::TimedOut)),
        }
    }

    async fn call_inner(&self, mut message: Message, bypass_buffer: bool) -> Result<Option<Message>> {
        if message.message_type() != MessageType::METHOD_CALL
            || message.flags() & Flags::NO_REPLY_EXPECTED
        {
            self.inner.queue_message(&mut message, bypass_buffer)?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let destination = message.destination().map(str::to_owned);

        let serial = {
            let mut state = self.inner.lock_state();

            if state.disconnected {
                return Err(Error::new(ErrorKind::Disconnected));
            }

            let serial = self.inner.assign_serial(&mut message);
            let bytes = marshal_message(&message)?;
            self.inner.check_fds(&message)?;

            state.replies.insert(serial.get(), PendingReply { tx, destination });
            self.inner
                .enqueue_locked(&mut state, bytes, message.unix_fds().to_vec(), bypass_buffer);
            serial
        };

        let guard = PendingGuard {
            inner: &self.inner,
            serial: serial.get(),
        };

        let reply = match rx.await {
            Ok(reply) => reply?,
            Err(..) => return Err(Error::new(ErrorKind::Disconnected)),
        };

        drop(guard);

        if reply.message_type() == MessageType::ERROR {
            let name = reply.error_name().unwrap_or(fdo::error_name::FAILED);
            let text = reply
                .body()
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default();

            return Err(Error::from(DBusError::raw(name, text.to_owned())));
        }

        Ok(Some(reply))
    }

    /// Ask the daemon for ownership of a well-known name.
    pub async fn request_name(&self, name: &str, flags: NameFlag) -> Result<NameReply> {
        validators::assert_bus_name_valid(name)?;

        let m = Message::method_call(fdo::PATH, "RequestName")
            .with_interface(fdo::INTERFACE)
            .with_destination(fdo::DESTINATION)
            .with_body(
                "su",
                vec![Value::String(name.into()), Value::Uint32(flags.value())],
            )?;

        let reply = self.call(m).await?.expect("a reply was requested");

        match reply.body().first().and_then(Value::as_u32) {
            Some(code) => Ok(NameReply(code)),
            None => Err(Error::new(ErrorKind::InvalidMessage(
                "RequestName reply carried no status".into(),
            ))),
        }
    }

    /// Give up ownership of a well-known name.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        validators::assert_bus_name_valid(name)?;

        let m = Message::method_call(fdo::PATH, "ReleaseName")
            .with_interface(fdo::INTERFACE)
            .with_destination(fdo::DESTINATION)
            .with_body("s", vec![Value::String(name.into())])?;

        let reply = self.call(m).await?.expect("a reply was requested");

        match reply.body().first().and_then(Value::as_u32) {
            Some(code) => Ok(ReleaseNameReply(code)),
            None => Err(Error::new(ErrorKind::InvalidMessage(
                "ReleaseName reply carried no status".into(),
            ))),
        }
    }

    /// Export a service interface at an object path, making its methods,
    /// properties and signals available to other connections.
    ///
    /// The standard `Introspectable`, `Properties`, `Peer` and
    /// `ObjectManager` interfaces are served automatically on every
    /// exported path. The same interface instance may be exported at any
    /// number of paths.
    pub fn export(&self, path: &str, interface: Arc<ServiceInterface>) -> Result<()> {
        validators::assert_object_path_valid(path)?;

        {
            let mut state = self.inner.lock_state();
            let exports = state.exports.entry(path.to_owned()).or_default();

            if exports.iter().any(|i| i.name() == interface.name()) {
                return Err(Error::new(ErrorKind::AlreadyExported(
                    interface.name().into(),
                )));
            }

            exports.push(interface.clone());
        }

        self.inner.emit_interfaces_added(path, &interface);
        Ok(())
    }

    /// Remove every interface exported at the given path.
    pub fn unexport(&self, path: &str) -> Result<()> {
        validators::assert_object_path_valid(path)?;

        let removed = {
            let mut state = self.inner.lock_state();
            state.exports.remove(path).unwrap_or_default()
        };

        if !removed.is_empty() {
            let names = removed.iter().map(|i| i.name().to_owned()).collect();
            self.inner.emit_interfaces_removed(path, names);
        }

        Ok(())
    }

    /// Remove a single interface, by name, from the given path.
    pub fn unexport_interface(&self, path: &str, interface_name: &str) -> Result<()> {
        validators::assert_object_path_valid(path)?;

        let removed = {
            let mut state = self.inner.lock_state();

            let (removed, now_empty) = {
                let Some(exports) = state.exports.get_mut(path) else {
                    return Ok(());
                };

                let Some(index) = exports.iter().position(|i| i.name() == interface_name)
                else {
                    return Ok(());
                };

                (exports.remove(index), exports.is_empty())
            };

            if now_empty {
                state.exports.remove(path);
            }

            removed
        };

        self.inner
            .emit_interfaces_removed(path, vec![removed.name().to_owned()]);
        Ok(())
    }

    /// Emit a signal declared on an exported interface, at every path the
    /// interface is exported on.
    ///
    /// The body is checked against the declared signal signature. Emitting
    /// a disabled signal fails.
    pub fn emit_signal(
        &self,
        interface: &Arc<ServiceInterface>,
        member: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        let Some(descriptor) = interface.find_signal(member) else {
            return Err(Error::new(ErrorKind::MemberNotFound(member.into())));
        };

        if descriptor.disabled {
            return Err(Error::new(ErrorKind::SignalDisabled(member.into())));
        }

        descriptor.signature.verify(&body)?;

        let paths: Vec<String> = {
            let state = self.inner.lock_state();
            state
                .exports
                .iter()
                .filter(|(_, exports)| exports.iter().any(|i| Arc::ptr_eq(i, interface)))
                .map(|(path, _)| path.clone())
                .collect()
        };

        for path in paths {
            let mut m = Message::signal(&path, interface.name(), member).with_body(
                descriptor.signature.signature(),
                body.clone(),
            )?;

            self.inner.queue_message(&mut m, false)?;
        }

        Ok(())
    }

    /// Call `org.freedesktop.DBus.Introspectable.Introspect` on the remote
    /// object and return the XML document.
    pub async fn introspect(&self, bus_name: &str, path: &str) -> Result<String> {
        self.introspect_with_timeout(bus_name, path, Duration::from_secs(30))
            .await
    }

    /// [`introspect`] with an explicit deadline.
    ///
    /// [`introspect`]: Self::introspect
    pub async fn introspect_with_timeout(
        &self,
        bus_name: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<String> {
        validators::assert_bus_name_valid(bus_name)?;
        validators::assert_object_path_valid(path)?;

        let m = Message::method_call(path, "Introspect")
            .with_interface(fdo::INTROSPECTABLE)
            .with_destination(bus_name);

        let reply = self
            .call_with_timeout(m, timeout)
            .await?
            .expect("a reply was requested");

        match reply.body().first().and_then(Value::as_str) {
            Some(xml) if reply.signature() == "s" => Ok(xml.to_owned()),
            _ => Err(Error::new(ErrorKind::InvalidMessage(
                "Introspect reply was not a single string".into(),
            ))),
        }
    }

    /// Build a proxy for the object at `path` on the connection owning
    /// `bus_name`, from already obtained introspection data. Performs no
    /// I/O.
    pub fn get_proxy_object(
        &self,
        bus_name: &str,
        path: &str,
        introspection: introspect::Node,
    ) -> Result<ProxyObject> {
        ProxyObject::new(self.clone(), bus_name, path, introspection)
    }

    /// Register a match rule with the daemon.
    ///
    /// Registrations are refcounted by the rule's canonical form: the
    /// daemon sees `AddMatch` only on the first registration of a given
    /// rule.
    pub fn add_match(&self, rule: &MatchRule) -> Result<()> {
        let canonical = rule.canonical();

        let first = {
            let mut state = self.inner.lock_state();

            if state.disconnected {
                return Err(Error::new(ErrorKind::Disconnected));
            }

            let count = state.rules.entry(canonical.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            self.inner
                .daemon_send_no_reply("AddMatch", "s", vec![Value::String(canonical)])?;
        }

        Ok(())
    }

    /// Drop one registration of a match rule, telling the daemon
    /// `RemoveMatch` when the last one goes away.
    pub fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        let canonical = rule.canonical();

        let last = {
            let mut state = self.inner.lock_state();

            let Some(count) = state.rules.get_mut(&canonical) else {
                return Ok(());
            };

            *count -= 1;

            if *count == 0 {
                state.rules.remove(&canonical);
                !state.disconnected
            } else {
                false
            }
        };

        if last {
            self.inner
                .daemon_send_no_reply("RemoveMatch", "s", vec![Value::String(canonical)])?;
        }

        Ok(())
    }

    /// Register a handler that sees every incoming message before regular
    /// dispatch.
    ///
    /// Handlers run in registration order; a handler may claim a message,
    /// or claim it and provide the reply to a method call.
    pub fn add_message_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Message) -> HandlerAction + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);

        self.inner.lock_state().handlers.push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });

        HandlerId(id)
    }

    /// Remove a previously registered message handler.
    pub fn remove_message_handler(&self, id: HandlerId) {
        self.inner.lock_state().handlers.retain(|e| e.id != id.0);
    }

    /// Tear the connection down.
    ///
    /// Idempotent: every outstanding call fails with a disconnect error,
    /// the transport is closed once, and later sends and calls fail without
    /// touching it.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.lock_state();

            if state.disconnected {
                return;
            }

            state.disconnected = true;
            state.buffered.clear();
            self.inner.fail_pending_locked(&mut state);
        }

        let _ = self.inner.writer.send(Outbound::Shutdown);
    }

    /// Wait until the connection has gone away.
    ///
    /// Resolves with `Ok` after a local [`disconnect`], and with the
    /// transport error when the connection was lost.
    ///
    /// [`disconnect`]: Self::disconnect
    pub async fn wait_for_disconnect(&self) -> Result<()> {
        let mut rx = self.inner.disconnect.subscribe();

        loop {
            {
                let value = rx.borrow_and_update();

                match &*value {
                    Some(DisconnectReason::Requested) => return Ok(()),
                    Some(DisconnectReason::Error(text)) => {
                        return Err(Error::new(ErrorKind::Transport(text.clone())))
                    }
                    None => {}
                }
            }

            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub(crate) fn inner(&self) -> &Arc<BusInner> {
        &self.inner
    }
}

impl BusInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn next_serial(&self) -> NonZeroU32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);

            if let Some(serial) = NonZeroU32::new(serial) {
                return serial;
            }
        }
    }

    fn assign_serial(&self, message: &mut Message) -> NonZeroU32 {
        match message.serial {
            Some(serial) => serial,
            None => {
                let serial = self.next_serial();
                message.serial = Some(serial);
                serial
            }
        }
    }

    fn check_fds(&self, message: &Message) -> Result<()> {
        if !message.unix_fds().is_empty() && !self.negotiated_unix_fd {
            return Err(Error::new(ErrorKind::FdPassingDisabled));
        }

        if message.unix_fds().len() > crate::connection::MAX_FDS_PER_MESSAGE {
            return Err(Error::new(ErrorKind::InvalidMessage(
                format!(
                    "message carries {} descriptors (max is {})",
                    message.unix_fds().len(),
                    crate::connection::MAX_FDS_PER_MESSAGE,
                )
                .into(),
            )));
        }

        Ok(())
    }

    /// Marshal and queue a message, assigning a serial when needed.
    ///
    /// Fails synchronously on validation and marshalling errors and after
    /// disconnect.
    pub(crate) fn queue_message(
        &self,
        message: &mut Message,
        bypass_buffer: bool,
    ) -> Result<NonZeroU32> {
        let mut state = self.lock_state();

        if state.disconnected {
            return Err(Error::new(ErrorKind::Disconnected));
        }

        let serial = self.assign_serial(message);
        let bytes = marshal_message(message)?;
        self.check_fds(message)?;

        self.enqueue_locked(&mut state, bytes, message.unix_fds().to_vec(), bypass_buffer);
        Ok(serial)
    }

    fn enqueue_locked(
        &self,
        state: &mut BusState,
        bytes: Vec<u8>,
        fds: Vec<RawFd>,
        bypass_buffer: bool,
    ) {
        if state.hello_pending && !bypass_buffer {
            state.buffered.push((bytes, fds));
            return;
        }

        let _ = self.writer.send(Outbound::Message { bytes, fds });
    }

    /// Queue a reply produced by dispatch, logging failures instead of
    /// surfacing them.
    pub(crate) fn queue_reply(&self, mut message: Message) {
        if let Err(error) = self.queue_message(&mut message, false) {
            tracing::warn!(%error, "failed to queue reply");
        }
    }

    fn daemon_send_no_reply(&self, member: &str, signature: &str, body: Vec<Value>) -> Result<()> {
        let mut m = Message::method_call(fdo::PATH, member)
            .with_interface(fdo::INTERFACE)
            .with_destination(fdo::DESTINATION)
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_body(signature, body)?;

        self.queue_message(&mut m, false)?;
        Ok(())
    }

    fn fail_pending_locked(&self, state: &mut BusState) {
        for (_, pending) in state.replies.drain() {
            let _ = pending.tx.send(Err(Error::new(ErrorKind::Disconnected)));
        }
    }

    /// Put the bus into its terminal state after the I/O task has stopped.
    fn finalize(&self, result: Result<()>) {
        let reason = match &result {
            Ok(()) => DisconnectReason::Requested,
            Err(error) => {
                tracing::debug!(%error, "connection lost");
                DisconnectReason::Error(error.to_string().into())
            }
        };

        {
            let mut state = self.lock_state();
            state.disconnected = true;
            state.buffered.clear();
            state.exports.clear();
            self.fail_pending_locked(&mut state);
        }

        let _ = self.disconnect.send(Some(reason));
    }
}

/// Removes the pending-reply entry of a cancelled or abandoned call, so a
/// late reply is dropped instead of leaking the slot. Removal after a
/// resolved call is a no-op, dispatch already claimed the entry.
struct PendingGuard<'a> {
    inner: &'a Arc<BusInner>,
    serial: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock_state().replies.remove(&self.serial);
    }
}

async fn io_task(
    inner: Arc<BusInner>,
    mut transport: Transport,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    leftover: Vec<u8>,
) {
    use crate::connection::IoEvent;
    use tokio::sync::mpsc::error::TryRecvError;

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&leftover);

    let mut buf = vec![0u8; 8192];
    let mut current: Option<(Vec<u8>, Vec<RawFd>, usize)> = None;

    let result = 'outer: loop {
        if current.is_none() {
            match rx.try_recv() {
                Ok(Outbound::Message { bytes, fds }) => current = Some((bytes, fds, 0)),
                Ok(Outbound::Shutdown) => break Ok(()),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break Ok(()),
            }
        }

        let event = match &mut current {
            Some((bytes, fds, offset)) => {
                transport
                    .read_or_write(Some((&bytes[*offset..], fds.as_slice())), &mut buf)
                    .await
            }
            None => {
                tokio::select! {
                    item = rx.recv() => {
                        match item {
                            Some(Outbound::Message { bytes, fds }) => {
                                current = Some((bytes, fds, 0));
                            }
                            Some(Outbound::Shutdown) | None => break Ok(()),
                        }

                        continue;
                    }
                    event = transport.read_or_write(None, &mut buf) => event,
                }
            }
        };

        match event {
            Ok(IoEvent::Read(0)) => break Err(Error::new(ErrorKind::Disconnected)),
            Ok(IoEvent::Read(n)) => {
                unmarshaller.feed(&buf[..n]);

                loop {
                    match unmarshaller.take_message(transport.fds_mut()) {
                        Ok(Some(message)) => inner.dispatch(message),
                        Ok(None) => break,
                        Err(error) => break 'outer Err(error),
                    }
                }
            }
            Ok(IoEvent::Wrote(n)) => {
                if let Some((bytes, fds, offset)) = &mut current {
                    fds.clear();
                    *offset += n;

                    if *offset == bytes.len() {
                        current = None;
                    }
                }
            }
            Err(error) => break Err(error),
        }
    };

    inner.finalize(result);
}
