//! Incoming message dispatch and the standard interfaces every exported
//! path serves.

use std::collections::BTreeSet;
use std::fs;
use std::sync::{Arc, OnceLock};

use crate::bus::{BusInner, HandlerAction, MessageHandler};
use crate::error::DBusError;
use crate::introspect::{self, Arg, ArgDirection, Node};
use crate::message::Message;
use crate::org_freedesktop_dbus as fdo;
use crate::protocol::{Flags, MessageType};
use crate::service::ServiceInterface;
use crate::value::Value;
use crate::variant::Variant;

impl BusInner {
    /// Dispatch one message produced by the unmarshaller, in transport
    /// order.
    pub(crate) fn dispatch(self: &Arc<Self>, message: Message) {
        tracing::trace!(
            message_type = ?message.message_type(),
            serial = ?message.serial(),
            member = message.member().unwrap_or_default(),
            "dispatching message",
        );

        match message.message_type() {
            MessageType::METHOD_RETURN | MessageType::ERROR => {
                let serial = match message.reply_serial() {
                    Some(serial) => serial.get(),
                    None => return,
                };

                let pending = {
                    let mut state = self.lock_state();

                    let pending = state.replies.remove(&serial);

                    // A reply from the owner of a well-known destination
                    // reveals that name's unique owner.
                    if let Some(pending) = &pending {
                        if let (Some(destination), Some(sender)) =
                            (&pending.destination, message.sender())
                        {
                            if !destination.starts_with(':') {
                                state
                                    .name_owners
                                    .insert(destination.clone(), sender.to_owned());
                            }
                        }
                    }

                    pending
                };

                if let Some(pending) = pending {
                    let _ = pending.tx.send(Ok(message));
                    return;
                }

                // An unclaimed reply, from a cancelled or timed-out call,
                // is offered to message handlers and otherwise dropped.
                self.run_handlers(&message);
            }
            MessageType::METHOD_CALL => {
                if self.run_handlers(&message) {
                    return;
                }

                self.serve_method_call(message);
            }
            MessageType::SIGNAL => {
                self.track_name_owners(&message);
                self.run_handlers(&message);
            }
            _ => {}
        }
    }

    /// Run user message handlers in registration order, returning whether
    /// one of them claimed the message.
    fn run_handlers(self: &Arc<Self>, message: &Message) -> bool {
        let handlers: Vec<MessageHandler> = {
            let state = self.lock_state();
            state.handlers.iter().map(|e| e.handler.clone()).collect()
        };

        for handler in handlers {
            match handler(message) {
                HandlerAction::Continue => {}
                HandlerAction::Handled => return true,
                HandlerAction::Reply(reply) => {
                    if message.message_type() == MessageType::METHOD_CALL
                        && !(message.flags() & Flags::NO_REPLY_EXPECTED)
                    {
                        self.queue_reply(reply);
                    }

                    return true;
                }
            }
        }

        false
    }

    fn track_name_owners(&self, message: &Message) {
        let from_daemon = message.sender() == Some(fdo::DESTINATION)
            && message.path() == Some(fdo::PATH)
            && message.interface() == Some(fdo::INTERFACE)
            && message.member() == Some("NameOwnerChanged")
            && message.signature() == "sss";

        if !from_daemon {
            return;
        }

        let [Value::String(name), Value::String(_), Value::String(new_owner)] = message.body()
        else {
            return;
        };

        let mut state = self.lock_state();

        if new_owner.is_empty() {
            state.name_owners.remove(name);
        } else {
            state.name_owners.insert(name.clone(), new_owner.clone());
        }
    }

    /// Serve an unclaimed incoming method call.
    fn serve_method_call(self: &Arc<Self>, message: Message) {
        let no_reply = message.flags() & Flags::NO_REPLY_EXPECTED;

        match self.route_call(&message) {
            Ok(Some(reply)) => {
                if !no_reply {
                    self.queue_reply(reply);
                }
            }
            // The reply is produced by a spawned handler task.
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(
                    member = message.member().unwrap_or_default(),
                    name = error.name(),
                    "method call failed",
                );

                if !no_reply {
                    self.queue_reply(Message::error(&message, error.name(), error.text()));
                }
            }
        }
    }

    fn route_call(
        self: &Arc<Self>,
        message: &Message,
    ) -> Result<Option<Message>, DBusError> {
        let member = message.member().unwrap_or_default();
        let signature = message.signature();

        match message.interface() {
            Some(fdo::INTROSPECTABLE) if member == "Introspect" && signature.is_empty() => {
                let xml = self.introspect_path(message.path().unwrap_or("/"));
                let reply =
                    Message::method_return(message).with_body("s", vec![Value::String(xml)])?;
                Ok(Some(reply))
            }
            Some(fdo::PEER) if member == "Ping" && signature.is_empty() => {
                Ok(Some(Message::method_return(message)))
            }
            Some(fdo::PEER) if member == "GetMachineId" && signature.is_empty() => {
                let id = self.machine_id()?;
                let reply =
                    Message::method_return(message).with_body("s", vec![Value::String(id)])?;
                Ok(Some(reply))
            }
            Some(fdo::OBJECT_MANAGER)
                if member == "GetManagedObjects" && signature.is_empty() =>
            {
                let objects = self.managed_objects(message.path().unwrap_or("/"));
                let reply = Message::method_return(message)
                    .with_body("a{oa{sa{sv}}}", vec![objects])?;
                Ok(Some(reply))
            }
            Some(fdo::PROPERTIES) => self.properties_call(message),
            Some(fdo::INTROSPECTABLE) | Some(fdo::PEER) | Some(fdo::OBJECT_MANAGER) => {
                Err(unknown_method(message))
            }
            _ => self.exported_call(message),
        }
    }

    /// The lookup ladder over the exported object tree: unknown path, then
    /// unknown interface, then unknown member, then argument mismatch.
    fn exported_call(
        self: &Arc<Self>,
        message: &Message,
    ) -> Result<Option<Message>, DBusError> {
        let path = message.path().unwrap_or_default();
        let member = message.member().unwrap_or_default();
        let signature = message.signature();

        let candidates: Vec<Arc<ServiceInterface>> = {
            let state = self.lock_state();

            let Some(exports) = state.exports.get(path) else {
                return Err(DBusError::raw(
                    fdo::error_name::UNKNOWN_OBJECT,
                    format!("no object exported at path {path:?}"),
                ));
            };

            match message.interface() {
                Some(name) => {
                    let Some(interface) = exports.iter().find(|i| i.name() == name) else {
                        return Err(DBusError::raw(
                            fdo::error_name::UNKNOWN_INTERFACE,
                            format!("no interface {name:?} at path {path:?}"),
                        ));
                    };

                    vec![interface.clone()]
                }
                // With no interface given, the member is looked up across
                // every interface at the path.
                None => exports.to_vec(),
            }
        };

        let Some(method) = candidates
            .iter()
            .find_map(|i| i.find_method(member, signature))
        else {
            if candidates.iter().any(|i| i.find_method_named(member).is_some()) {
                return Err(DBusError::raw(
                    fdo::error_name::INVALID_ARGS,
                    format!("signature {signature:?} does not match method {member:?}"),
                ));
            }

            return Err(unknown_method(message));
        };

        let future = (method.handler)(message.body().to_vec());
        let out_signature = method.out_signature.clone();

        let inner = self.clone();
        let request = message.clone();

        tokio::spawn(async move {
            let reply = match future.await {
                Ok(body) => {
                    match Message::method_return(&request)
                        .with_body(out_signature.signature(), body)
                    {
                        Ok(reply) => reply,
                        Err(error) => Message::error(
                            &request,
                            fdo::error_name::FAILED,
                            &error.to_string(),
                        ),
                    }
                }
                Err(error) => Message::error(&request, error.name(), error.text()),
            };

            if !(request.flags() & Flags::NO_REPLY_EXPECTED) {
                inner.queue_reply(reply);
            }
        });

        Ok(None)
    }

    /// `org.freedesktop.DBus.Properties` on the exported object tree.
    fn properties_call(
        self: &Arc<Self>,
        message: &Message,
    ) -> Result<Option<Message>, DBusError> {
        let member = message.member().unwrap_or_default();
        let signature = message.signature();

        let expected = match member {
            "Get" => "ss",
            "Set" => "ssv",
            "GetAll" => "s",
            _ => return Err(unknown_method(message)),
        };

        if signature != expected {
            return Err(unknown_method(message));
        }

        let path = message.path().unwrap_or_default();

        let Some(Value::String(interface_name)) = message.body().first() else {
            return Err(unknown_method(message));
        };

        if interface_name.is_empty() {
            return Err(DBusError::raw(
                fdo::error_name::FAILED,
                "property access with an empty interface is not supported".to_owned(),
            ));
        }

        let interface = {
            let state = self.lock_state();

            let Some(exports) = state.exports.get(path) else {
                return Err(DBusError::raw(
                    fdo::error_name::UNKNOWN_OBJECT,
                    format!("no object exported at path {path:?}"),
                ));
            };

            let Some(interface) = exports.iter().find(|i| i.name() == *interface_name) else {
                return Err(DBusError::raw(
                    fdo::error_name::UNKNOWN_INTERFACE,
                    format!("no interface {interface_name:?} at path {path:?}"),
                ));
            };

            interface.clone()
        };

        match member {
            "Get" => {
                let Some(Value::String(property_name)) = message.body().get(1) else {
                    return Err(unknown_method(message));
                };

                let property = find_property(&interface, property_name)?;

                if !property.access.readable() {
                    return Err(DBusError::raw(
                        fdo::error_name::ACCESS_DENIED,
                        format!("property {property_name:?} is not readable"),
                    ));
                }

                let getter = property.getter.as_ref().expect("readable property has a getter");
                let value = getter()?;

                let variant = Variant::with_tree(property.signature.clone(), value)
                    .map_err(|error| {
                        DBusError::raw(fdo::error_name::FAILED, error.to_string())
                    })?;

                let reply = Message::method_return(message)
                    .with_body("v", vec![Value::Variant(Box::new(variant))])?;
                Ok(Some(reply))
            }
            "Set" => {
                let Some(Value::String(property_name)) = message.body().get(1) else {
                    return Err(unknown_method(message));
                };

                let Some(Value::Variant(variant)) = message.body().get(2) else {
                    return Err(unknown_method(message));
                };

                let property = find_property(&interface, property_name)?;

                if !property.access.writable() {
                    return Err(DBusError::raw(
                        fdo::error_name::PROPERTY_READ_ONLY,
                        format!("property {property_name:?} is read only"),
                    ));
                }

                if variant.signature() != property.signature.signature() {
                    return Err(DBusError::raw(
                        fdo::error_name::INVALID_ARGS,
                        format!(
                            "property {property_name:?} takes a {:?}, not a {:?}",
                            property.signature.signature(),
                            variant.signature(),
                        ),
                    ));
                }

                let setter = property.setter.as_ref().expect("writable property has a setter");
                let future = setter(variant.value().clone());

                let previous = property.getter.as_ref().map(|getter| getter());
                let inner = self.clone();
                let request = message.clone();
                let interface_name = interface_name.clone();
                let property_name = property_name.clone();
                let variant = variant.clone();

                tokio::spawn(async move {
                    let no_reply = request.flags() & Flags::NO_REPLY_EXPECTED;

                    match future.await {
                        Ok(()) => {
                            if !no_reply {
                                inner.queue_reply(Message::method_return(&request));
                            }

                            let changed = match &previous {
                                Some(Ok(value)) => *value != *variant.value(),
                                _ => true,
                            };

                            if changed {
                                inner.emit_properties_changed(
                                    request.path().unwrap_or("/"),
                                    &interface_name,
                                    &property_name,
                                    *variant,
                                );
                            }
                        }
                        Err(error) => {
                            if !no_reply {
                                inner.queue_reply(Message::error(
                                    &request,
                                    error.name(),
                                    error.text(),
                                ));
                            }
                        }
                    }
                });

                Ok(None)
            }
            _ => {
                let properties = collect_properties(&interface, true)?;
                let reply =
                    Message::method_return(message).with_body("a{sv}", vec![properties])?;
                Ok(Some(reply))
            }
        }
    }

    /// Emit `PropertiesChanged` for a single changed property.
    fn emit_properties_changed(
        &self,
        path: &str,
        interface_name: &str,
        property_name: &str,
        variant: Variant,
    ) {
        let body = vec![
            Value::String(interface_name.to_owned()),
            Value::Dict(vec![(
                Value::String(property_name.to_owned()),
                Value::Variant(Box::new(variant)),
            )]),
            Value::Array(Vec::new()),
        ];

        let signal = Message::signal(path, fdo::PROPERTIES, "PropertiesChanged")
            .with_body("sa{sv}as", body);

        match signal {
            Ok(mut signal) => {
                if let Err(error) = self.queue_message(&mut signal, false) {
                    tracing::warn!(%error, "failed to emit PropertiesChanged");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to build PropertiesChanged"),
        }
    }

    /// The generated introspection document for a path: exported
    /// interfaces, the standard interfaces, and child node names.
    pub(crate) fn introspect_path(&self, path: &str) -> String {
        let state = self.lock_state();
        let mut node = Node::new();

        if let Some(exports) = state.exports.get(path) {
            for interface in standard_interfaces() {
                node.push_interface(interface.clone());
            }

            for interface in exports {
                node.push_interface(interface.introspect());
            }
        }

        let mut children = BTreeSet::new();

        for export_path in state.exports.keys() {
            let rest = match path {
                "/" => export_path.strip_prefix('/'),
                path => export_path
                    .strip_prefix(path)
                    .and_then(|rest| rest.strip_prefix('/')),
            };

            let Some(rest) = rest else {
                continue;
            };

            if let Some(child) = rest.split('/').next() {
                if !child.is_empty() {
                    children.insert(child.to_owned());
                }
            }
        }

        drop(state);

        for child in children {
            node.push_node(Node::with_name(&child));
        }

        node.to_xml()
    }

    /// The `GetManagedObjects` listing of every exported object at or below
    /// a path.
    fn managed_objects(&self, path: &str) -> Value {
        let state = self.lock_state();
        let mut objects = Vec::new();

        for (export_path, exports) in &state.exports {
            let below = path == "/"
                || export_path
                    .strip_prefix(path)
                    .is_some_and(|rest| rest.starts_with('/'));

            if !below {
                continue;
            }

            let mut interfaces = Vec::new();

            for interface in exports {
                let properties = collect_properties(interface, false)
                    .expect("lenient property collection cannot fail");

                interfaces.push((Value::String(interface.name().to_owned()), properties));
            }

            objects.push((
                Value::ObjectPath(export_path.clone()),
                Value::Dict(interfaces),
            ));
        }

        Value::Dict(objects)
    }

    /// `InterfacesAdded` for a freshly exported interface.
    pub(crate) fn emit_interfaces_added(&self, path: &str, interface: &Arc<ServiceInterface>) {
        let properties = collect_properties(interface, false)
            .expect("lenient property collection cannot fail");

        let body = vec![
            Value::ObjectPath(path.to_owned()),
            Value::Dict(vec![(
                Value::String(interface.name().to_owned()),
                properties,
            )]),
        ];

        self.emit_object_manager_signal(path, "InterfacesAdded", "oa{sa{sv}}", body);
    }

    /// `InterfacesRemoved` after an unexport.
    pub(crate) fn emit_interfaces_removed(&self, path: &str, names: Vec<String>) {
        let body = vec![
            Value::ObjectPath(path.to_owned()),
            Value::Array(names.into_iter().map(Value::String).collect()),
        ];

        self.emit_object_manager_signal(path, "InterfacesRemoved", "oas", body);
    }

    fn emit_object_manager_signal(
        &self,
        path: &str,
        member: &str,
        signature: &str,
        body: Vec<Value>,
    ) {
        let signal =
            Message::signal(path, fdo::OBJECT_MANAGER, member).with_body(signature, body);

        match signal {
            Ok(mut signal) => {
                if let Err(error) = self.queue_message(&mut signal, false) {
                    tracing::debug!(%error, member, "failed to emit ObjectManager signal");
                }
            }
            Err(error) => tracing::warn!(%error, member, "failed to build ObjectManager signal"),
        }
    }

    /// The machine id served by `org.freedesktop.DBus.Peer.GetMachineId`,
    /// read once from the well-known files.
    fn machine_id(&self) -> Result<String, DBusError> {
        {
            let state = self.lock_state();

            if let Some(id) = &state.machine_id {
                return Ok(id.clone());
            }
        }

        let id = ["/var/lib/dbus/machine-id", "/etc/machine-id"]
            .iter()
            .find_map(|path| fs::read_to_string(path).ok())
            .map(|contents| contents.trim().to_owned())
            .filter(|id| !id.is_empty());

        match id {
            Some(id) => {
                self.lock_state().machine_id = Some(id.clone());
                Ok(id)
            }
            None => Err(DBusError::raw(
                fdo::error_name::FAILED,
                "could not read the machine id".to_owned(),
            )),
        }
    }
}

fn unknown_method(message: &Message) -> DBusError {
    DBusError::raw(
        fdo::error_name::UNKNOWN_METHOD,
        format!(
            "{}.{} with signature {:?} could not be found",
            message.interface().unwrap_or_default(),
            message.member().unwrap_or_default(),
            message.signature(),
        ),
    )
}

fn find_property<'i>(
    interface: &'i Arc<ServiceInterface>,
    name: &str,
) -> Result<&'i crate::service::PropertyDescriptor, DBusError> {
    interface.find_property(name).ok_or_else(|| {
        DBusError::raw(
            fdo::error_name::UNKNOWN_PROPERTY,
            format!("interface {:?} has no property {name:?}", interface.name()),
        )
    })
}

/// The readable properties of an interface as an `a{sv}` value.
///
/// In strict mode a failing getter fails the whole collection; in lenient
/// mode, used for unsolicited signals and `GetManagedObjects`, it is
/// skipped.
fn collect_properties(
    interface: &Arc<ServiceInterface>,
    strict: bool,
) -> Result<Value, DBusError> {
    let mut entries = Vec::new();

    for property in &interface.properties {
        if property.disabled || !property.access.readable() {
            continue;
        }

        let Some(getter) = &property.getter else {
            continue;
        };

        let value = match getter() {
            Ok(value) => value,
            Err(error) if strict => return Err(error),
            Err(..) => continue,
        };

        let Ok(variant) = Variant::with_tree(property.signature.clone(), value) else {
            if strict {
                return Err(DBusError::raw(
                    fdo::error_name::FAILED,
                    format!("property {:?} returned a mistyped value", property.name),
                ));
            }

            continue;
        };

        entries.push((
            Value::String(property.name.clone()),
            Value::Variant(Box::new(variant)),
        ));
    }

    Ok(Value::Dict(entries))
}

/// The descriptions of the standard interfaces every exported path serves.
fn standard_interfaces() -> &'static [introspect::Interface] {
    static STANDARD: OnceLock<Vec<introspect::Interface>> = OnceLock::new();

    STANDARD.get_or_init(|| {
        let arg = |signature, direction| {
            Arg::new(signature, direction).expect("static signature")
        };

        let introspectable = introspect::Interface::new(fdo::INTROSPECTABLE)
            .expect("static interface name")
            .with_method(
                introspect::Method::new(
                    "Introspect",
                    vec![arg("s", ArgDirection::Out).with_name("data")],
                )
                .expect("static member"),
            );

        let properties = introspect::Interface::new(fdo::PROPERTIES)
            .expect("static interface name")
            .with_method(
                introspect::Method::new(
                    "Get",
                    vec![
                        arg("s", ArgDirection::In).with_name("interface_name"),
                        arg("s", ArgDirection::In).with_name("property_name"),
                        arg("v", ArgDirection::Out).with_name("value"),
                    ],
                )
                .expect("static member"),
            )
            .with_method(
                introspect::Method::new(
                    "Set",
                    vec![
                        arg("s", ArgDirection::In).with_name("interface_name"),
                        arg("s", ArgDirection::In).with_name("property_name"),
                        arg("v", ArgDirection::In).with_name("value"),
                    ],
                )
                .expect("static member"),
            )
            .with_method(
                introspect::Method::new(
                    "GetAll",
                    vec![
                        arg("s", ArgDirection::In).with_name("interface_name"),
                        arg("a{sv}", ArgDirection::Out).with_name("properties"),
                    ],
                )
                .expect("static member"),
            )
            .with_signal(
                introspect::Signal::new(
                    "PropertiesChanged",
                    vec![
                        arg("s", ArgDirection::Out).with_name("interface_name"),
                        arg("a{sv}", ArgDirection::Out).with_name("changed_properties"),
                        arg("as", ArgDirection::Out).with_name("invalidated_properties"),
                    ],
                )
                .expect("static member"),
            );

        let peer = introspect::Interface::new(fdo::PEER)
            .expect("static interface name")
            .with_method(introspect::Method::new("Ping", vec![]).expect("static member"))
            .with_method(
                introspect::Method::new(
                    "GetMachineId",
                    vec![arg("s", ArgDirection::Out).with_name("machine_uuid")],
                )
                .expect("static member"),
            );

        vec![introspectable, properties, peer]
    })
}
