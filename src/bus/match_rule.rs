use std::collections::HashMap;

use crate::message::Message;
use crate::protocol::MessageType;

/// A match rule, the filter a connection registers with the bus daemon to
/// receive broadcast messages.
///
/// The canonical string rendering is what travels in `AddMatch` and
/// `RemoveMatch` calls and what the bus refcounts registrations by.
///
/// # Examples
///
/// ```
/// use minibus::MatchRule;
///
/// let rule = MatchRule::signal()
///     .with_sender("org.freedesktop.DBus")
///     .with_interface("org.freedesktop.DBus")
///     .with_member("NameOwnerChanged");
///
/// assert_eq!(
///     rule.canonical(),
///     "type='signal',sender='org.freedesktop.DBus',\
///      interface='org.freedesktop.DBus',member='NameOwnerChanged'",
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    arg0: Option<String>,
    arg0namespace: Option<String>,
}

impl MatchRule {
    /// An empty rule matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule matching signals.
    pub fn signal() -> Self {
        Self {
            message_type: Some(MessageType::SIGNAL),
            ..Self::default()
        }
    }

    /// Restrict the rule to messages from the given sender.
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Restrict the rule to messages of the given interface.
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Restrict the rule to messages of the given member.
    pub fn with_member(mut self, member: &str) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Restrict the rule to messages emitted at the given path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Restrict the rule to messages emitted at or below the given path.
    pub fn with_path_namespace(mut self, namespace: &str) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    /// Restrict the rule to messages addressed to the given destination.
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Restrict the rule to messages whose first body argument is the given
    /// string.
    pub fn with_arg0(mut self, arg0: &str) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    /// Restrict the rule to messages whose first body argument is a name in
    /// the given dot-separated namespace.
    pub fn with_arg0namespace(mut self, namespace: &str) -> Self {
        self.arg0namespace = Some(namespace.into());
        self
    }

    /// The canonical string rendering of the rule.
    pub fn canonical(&self) -> String {
        let mut out = String::new();

        let mut push = |key: &str, value: &str| {
            if !out.is_empty() {
                out.push(',');
            }

            out.push_str(key);
            out.push_str("='");
            out.push_str(value);
            out.push('\'');
        };

        if let Some(message_type) = self.message_type {
            let name = match message_type {
                MessageType::METHOD_CALL => "method_call",
                MessageType::METHOD_RETURN => "method_return",
                MessageType::ERROR => "error",
                _ => "signal",
            };

            push("type", name);
        }

        if let Some(v) = &self.sender {
            push("sender", v);
        }

        if let Some(v) = &self.interface {
            push("interface", v);
        }

        if let Some(v) = &self.member {
            push("member", v);
        }

        if let Some(v) = &self.path {
            push("path", v);
        }

        if let Some(v) = &self.path_namespace {
            push("path_namespace", v);
        }

        if let Some(v) = &self.destination {
            push("destination", v);
        }

        if let Some(v) = &self.arg0 {
            push("arg0", v);
        }

        if let Some(v) = &self.arg0namespace {
            push("arg0namespace", v);
        }

        out
    }

    /// Test the rule against a message.
    ///
    /// A sender given as a well-known name also matches messages whose
    /// sender is the unique name currently owning it, per `owners`.
    pub(crate) fn matches(&self, message: &Message, owners: &HashMap<String, String>) -> bool {
        if let Some(message_type) = self.message_type {
            if message.message_type() != message_type {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            let resolved = owners.get(sender).map(String::as_str);

            match message.sender() {
                Some(actual) => {
                    if actual != sender && Some(actual) != resolved {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if let Some(interface) = &self.interface {
            if message.interface() != Some(interface.as_str()) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if message.member() != Some(member.as_str()) {
                return false;
            }
        }

        if let Some(path) = &self.path {
            if message.path() != Some(path.as_str()) {
                return false;
            }
        }

        if let Some(namespace) = &self.path_namespace {
            match message.path() {
                Some(path) => {
                    let under = path
                        .strip_prefix(namespace.as_str())
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));

                    if !under && namespace != "/" {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if let Some(destination) = &self.destination {
            if message.destination() != Some(destination.as_str()) {
                return false;
            }
        }

        if let Some(arg0) = &self.arg0 {
            match message.body().first().and_then(|v| v.as_str()) {
                Some(actual) if actual == arg0 => {}
                _ => return false,
            }
        }

        if let Some(namespace) = &self.arg0namespace {
            match message.body().first().and_then(|v| v.as_str()) {
                Some(actual) => {
                    let inside = actual
                        .strip_prefix(namespace.as_str())
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'));

                    if !inside {
                        return false;
                    }
                }
                None => return false,
            }
        }

        true
    }
}
