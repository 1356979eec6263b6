use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bus::{HandlerAction, HandlerId, MatchRule, MessageBus};
use crate::error::{Error, ErrorKind, Result};
use crate::introspect;
use crate::message::Message;
use crate::org_freedesktop_dbus as fdo;
use crate::protocol::MessageType;
use crate::validators;
use crate::value::Value;
use crate::variant::Variant;

/// A client-side handle to an object exported by another connection.
///
/// Built from introspection data by [`MessageBus::get_proxy_object`];
/// construction performs no I/O. The proxy's [`interface`] handles are
/// where calls, property access and signal subscriptions happen.
///
/// [`interface`]: ProxyObject::interface
pub struct ProxyObject {
    bus: MessageBus,
    bus_name: String,
    path: String,
    node: introspect::Node,
    interfaces: Mutex<HashMap<String, Arc<ProxyInterface>>>,
}

impl ProxyObject {
    pub(crate) fn new(
        bus: MessageBus,
        bus_name: &str,
        path: &str,
        node: introspect::Node,
    ) -> Result<Self> {
        validators::assert_bus_name_valid(bus_name)?;
        validators::assert_object_path_valid(path)?;

        Ok(Self {
            bus,
            bus_name: bus_name.into(),
            path: path.into(),
            node,
            interfaces: Mutex::new(HashMap::new()),
        })
    }

    /// The bus name the proxied object lives on.
    #[inline]
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// The path of the proxied object.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The introspection data the proxy was built from.
    #[inline]
    pub fn introspection(&self) -> &introspect::Node {
        &self.node
    }

    /// The absolute paths of the child nodes of this object.
    pub fn child_paths(&self) -> Vec<String> {
        self.node
            .nodes()
            .iter()
            .filter_map(|child| child.name())
            .map(|name| join_path(&self.path, name))
            .collect()
    }

    /// Proxies for the child nodes of this object.
    pub fn children(&self) -> Result<Vec<ProxyObject>> {
        self.node
            .nodes()
            .iter()
            .filter(|child| child.name().is_some())
            .map(|child| {
                let path = join_path(&self.path, child.name().unwrap_or_default());
                ProxyObject::new(self.bus.clone(), &self.bus_name, &path, child.clone())
            })
            .collect()
    }

    /// Get a handle for one of the object's interfaces.
    ///
    /// The first handle for a well-known destination also asks the daemon
    /// for the name's current owner, so that broadcast signals from it can
    /// be attributed.
    pub fn interface(&self, name: &str) -> Result<Arc<ProxyInterface>> {
        if let Some(interface) = self.interfaces.lock().unwrap().get(name) {
            return Ok(interface.clone());
        }

        let Some(description) = self.node.interface(name) else {
            return Err(Error::new(ErrorKind::InterfaceNotFound(name.into())));
        };

        let interface = Arc::new(ProxyInterface {
            bus: self.bus.clone(),
            bus_name: self.bus_name.clone(),
            path: self.path.clone(),
            description: description.clone(),
            rule: MatchRule::signal()
                .with_sender(&self.bus_name)
                .with_interface(name)
                .with_path(&self.path),
            handlers: Arc::new(Mutex::new(SignalHandlers::default())),
        });

        self.interfaces
            .lock()
            .unwrap()
            .insert(name.to_owned(), interface.clone());

        if !self.bus_name.starts_with(':') {
            self.resolve_name_owner();
        }

        Ok(interface)
    }

    /// Ask the daemon which unique name currently owns our well-known
    /// destination, priming the owner map used to attribute signals.
    fn resolve_name_owner(&self) {
        let bus = self.bus.clone();
        let bus_name = self.bus_name.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            let known = {
                let state = bus.inner().lock_state();
                state.name_owners.contains_key(&bus_name)
            };

            if known {
                return;
            }

            let m = Message::method_call(fdo::PATH, "GetNameOwner")
                .with_interface(fdo::INTERFACE)
                .with_destination(fdo::DESTINATION)
                .with_body("s", vec![Value::String(bus_name.clone())])
                .expect("a single string body");

            match bus.call(m).await {
                Ok(Some(reply)) => {
                    if let Some(owner) = reply.body().first().and_then(Value::as_str) {
                        let mut state = bus.inner().lock_state();
                        state.name_owners.insert(bus_name, owner.to_owned());
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    let expected = error
                        .remote_error()
                        .is_some_and(|e| e.name() == fdo::error_name::NAME_HAS_NO_OWNER);

                    if !expected {
                        tracing::debug!(%error, name = %bus_name, "GetNameOwner failed");
                    }
                }
            }
        });
    }
}

/// Identifies one signal subscription on a [`ProxyInterface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalToken(u64);

type SignalCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Default)]
struct SignalHandlers {
    bus_handler: Option<HandlerId>,
    next_token: u64,
    callbacks: Vec<(u64, String, SignalCallback)>,
}

impl SignalHandlers {
    fn subscribed(&self, signal: &str) -> bool {
        self.callbacks.iter().any(|(_, name, _)| name == signal)
    }
}

/// A typed handle to a single interface of a proxied object.
///
/// Methods, properties and signals resolve against the introspection data
/// the proxy was built from, with input signatures checked locally before
/// anything touches the transport.
pub struct ProxyInterface {
    bus: MessageBus,
    bus_name: String,
    path: String,
    description: introspect::Interface,
    rule: MatchRule,
    handlers: Arc<Mutex<SignalHandlers>>,
}

impl ProxyInterface {
    /// The name of the proxied interface.
    #[inline]
    pub fn name(&self) -> &str {
        self.description.name()
    }

    /// The introspection data of the proxied interface.
    #[inline]
    pub fn description(&self) -> &introspect::Interface {
        &self.description
    }

    /// Call a method on the remote interface.
    ///
    /// The arguments are checked against the declared input signature
    /// before sending; a mismatch fails locally. The reply body is checked
    /// against the declared output signature.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let Some(description) = self.description.method(method) else {
            return Err(Error::new(ErrorKind::MemberNotFound(method.into())));
        };

        let m = Message::method_call(&self.path, method)
            .with_interface(self.description.name())
            .with_destination(&self.bus_name)
            .with_body(description.in_signature(), args)?;

        let reply = self.bus.call(m).await?.expect("a reply was requested");

        if reply.signature() != description.out_signature() {
            return Err(Error::new(ErrorKind::SignatureBodyMismatch(
                format!(
                    "{method} replied with signature `{}`, expected `{}`",
                    reply.signature(),
                    description.out_signature(),
                )
                .into(),
            )));
        }

        Ok(reply.body)
    }

    /// Read a property through `org.freedesktop.DBus.Properties.Get`.
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        let Some(property) = self.description.property(name) else {
            return Err(Error::new(ErrorKind::MemberNotFound(name.into())));
        };

        let m = Message::method_call(&self.path, "Get")
            .with_interface(fdo::PROPERTIES)
            .with_destination(&self.bus_name)
            .with_body(
                "ss",
                vec![
                    Value::String(self.description.name().to_owned()),
                    Value::String(name.to_owned()),
                ],
            )?;

        let mut reply = self.bus.call(m).await?.expect("a reply was requested");

        match reply.body.pop() {
            Some(Value::Variant(variant)) if reply.body.is_empty() => {
                if variant.signature() != property.signature() {
                    return Err(Error::new(ErrorKind::SignatureBodyMismatch(
                        format!(
                            "property {name} has signature `{}`, got `{}`",
                            property.signature(),
                            variant.signature(),
                        )
                        .into(),
                    )));
                }

                Ok(variant.into_value())
            }
            _ => Err(Error::new(ErrorKind::InvalidMessage(
                "Properties.Get reply was not a single variant".into(),
            ))),
        }
    }

    /// Write a property through `org.freedesktop.DBus.Properties.Set`.
    ///
    /// The value is checked against the declared property signature before
    /// sending.
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let Some(property) = self.description.property(name) else {
            return Err(Error::new(ErrorKind::MemberNotFound(name.into())));
        };

        let variant = Variant::new(property.signature(), value)?;

        let m = Message::method_call(&self.path, "Set")
            .with_interface(fdo::PROPERTIES)
            .with_destination(&self.bus_name)
            .with_body(
                "ssv",
                vec![
                    Value::String(self.description.name().to_owned()),
                    Value::String(name.to_owned()),
                    Value::Variant(Box::new(variant)),
                ],
            )?;

        self.bus.call(m).await?;
        Ok(())
    }

    /// Subscribe to a signal of the remote interface.
    ///
    /// The first subscription to a signal registers a match rule for it
    /// with the daemon; registrations are reference counted, so `AddMatch`
    /// and `RemoveMatch` are each sent exactly once per signal however many
    /// subscriptions come and go.
    ///
    /// Callbacks run on the connection's dispatch task in subscription
    /// order and receive the signal body.
    pub fn on_signal<F>(self: &Arc<Self>, signal: &str, callback: F) -> Result<SignalToken>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        if self.description.signal(signal).is_none() {
            return Err(Error::new(ErrorKind::MemberNotFound(signal.into())));
        }

        let mut handlers = self.handlers.lock().unwrap();

        if !handlers.subscribed(signal) {
            self.bus.add_match(&self.rule.clone().with_member(signal))?;
        }

        if handlers.callbacks.is_empty() {
            handlers.bus_handler = Some(self.bus.add_message_handler(self.message_handler()));
        }

        handlers.next_token += 1;
        let token = handlers.next_token;
        handlers
            .callbacks
            .push((token, signal.to_owned(), Arc::new(callback)));

        Ok(SignalToken(token))
    }

    /// Drop one signal subscription.
    ///
    /// Removing the last subscription to a signal drops its match rule
    /// registration as well.
    pub fn off_signal(&self, token: SignalToken) -> Result<()> {
        let mut handlers = self.handlers.lock().unwrap();

        let Some(index) = handlers.callbacks.iter().position(|(t, ..)| *t == token.0) else {
            return Ok(());
        };

        let (_, signal, _) = handlers.callbacks.remove(index);

        if !handlers.subscribed(&signal) {
            self.bus
                .remove_match(&self.rule.clone().with_member(&signal))?;
        }

        if handlers.callbacks.is_empty() {
            if let Some(id) = handlers.bus_handler.take() {
                self.bus.remove_message_handler(id);
            }
        }

        Ok(())
    }

    /// The message handler fanning matching signals out to the
    /// subscriptions of this interface.
    fn message_handler(self: &Arc<Self>) -> impl Fn(&Message) -> HandlerAction {
        let this = self.clone();

        move |message: &Message| {
            if message.message_type() != MessageType::SIGNAL {
                return HandlerAction::Continue;
            }

            {
                let state = this.bus.inner().lock_state();

                // Broadcasts carry the unique name of their origin; accept
                // them when it matches the destination we proxy, directly
                // or through the owner map. Messages without a sender come
                // off daemonless peer connections.
                if message.sender().is_some() {
                    if !this.rule.matches(message, &state.name_owners) {
                        return HandlerAction::Continue;
                    }
                } else if message.interface() != Some(this.description.name())
                    || message.path() != Some(this.path.as_str())
                {
                    return HandlerAction::Continue;
                }
            }

            let Some(member) = message.member() else {
                return HandlerAction::Continue;
            };

            let Some(description) = this.description.signal(member) else {
                return HandlerAction::Continue;
            };

            if message.signature() != description.signature() {
                tracing::warn!(
                    member,
                    signature = message.signature(),
                    "signal arrived with an unexpected signature",
                );
                return HandlerAction::Continue;
            }

            let callbacks: Vec<SignalCallback> = {
                let handlers = this.handlers.lock().unwrap();
                handlers
                    .callbacks
                    .iter()
                    .filter(|(_, name, _)| name == member)
                    .map(|(.., callback)| callback.clone())
                    .collect()
            };

            for callback in callbacks {
                callback(message.body());
            }

            HandlerAction::Continue
        }
    }
}

fn join_path(base: &str, child: &str) -> String {
    if base == "/" {
        format!("/{child}")
    } else {
        format!("{base}/{child}")
    }
}
