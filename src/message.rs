use std::num::NonZeroU32;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Flags, MessageType};
use crate::signature::SignatureTree;
use crate::validators;
use crate::value::Value;

/// A D-Bus message.
///
/// Messages are built with one of the constructors matching the four message
/// types and the `with_*` adapters, and are sent with [`MessageBus::send`]
/// or [`MessageBus::call`].
///
/// A message owns its body and its file descriptor list; descriptors
/// received from the bus belong to whoever received the message and are
/// never closed by the bus itself.
///
/// [`MessageBus::send`]: crate::MessageBus::send
/// [`MessageBus::call`]: crate::MessageBus::call
///
/// # Examples
///
/// ```
/// use minibus::{Message, Value};
///
/// let m = Message::method_call("/org/mpris/MediaPlayer2", "OpenUri")
///     .with_interface("org.mpris.MediaPlayer2.Player")
///     .with_destination("org.mpris.MediaPlayer2.vlc")
///     .with_body("s", vec![Value::from("file:///tmp/a.ogg")])?;
///
/// assert_eq!(m.member(), Some("OpenUri"));
/// assert_eq!(m.signature(), "s");
/// # Ok::<_, minibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) serial: Option<NonZeroU32>,
    pub(crate) destination: Option<String>,
    pub(crate) path: Option<String>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) error_name: Option<String>,
    pub(crate) reply_serial: Option<NonZeroU32>,
    pub(crate) sender: Option<String>,
    pub(crate) signature: Arc<SignatureTree>,
    pub(crate) body: Vec<Value>,
    pub(crate) unix_fds: Vec<RawFd>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: Flags::EMPTY,
            serial: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            sender: None,
            signature: SignatureTree::empty(),
            body: Vec::new(),
            unix_fds: Vec::new(),
        }
    }

    /// Construct a method call for the given path and member.
    pub fn method_call(path: &str, member: &str) -> Self {
        let mut m = Self::empty(MessageType::METHOD_CALL);
        m.path = Some(path.into());
        m.member = Some(member.into());
        m
    }

    /// Construct a signal emitted from the given path, interface and member.
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut m = Self::empty(MessageType::SIGNAL);
        m.path = Some(path.into());
        m.interface = Some(interface.into());
        m.member = Some(member.into());
        m
    }

    /// Construct a method return replying to the given message.
    ///
    /// The destination is taken from the sender of the replied-to message.
    pub fn method_return(reply_to: &Message) -> Self {
        let mut m = Self::empty(MessageType::METHOD_RETURN);
        m.reply_serial = reply_to.serial;
        m.destination = reply_to.sender.clone();
        m
    }

    /// Construct an error replying to the given message.
    ///
    /// The error text becomes the single `s` body argument, mirroring what
    /// every D-Bus implementation expects of an error reply.
    pub fn error(reply_to: &Message, error_name: &str, text: &str) -> Self {
        let mut m = Self::empty(MessageType::ERROR);
        m.reply_serial = reply_to.serial;
        m.destination = reply_to.sender.clone();
        m.error_name = Some(error_name.into());
        m.signature = SignatureTree::get("s").expect("`s` is a valid signature");
        m.body = vec![Value::String(text.into())];
        m
    }

    /// Set the destination of the message.
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the interface of the message.
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Set the flags of the message.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the serial of the message.
    ///
    /// Serials are normally assigned by the bus when the message is sent;
    /// this is only needed when managing serials manually.
    pub fn with_serial(mut self, serial: NonZeroU32) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Set the body of the message along with its signature.
    ///
    /// The body is type-checked against the signature.
    pub fn with_body(mut self, signature: &str, body: Vec<Value>) -> Result<Self> {
        let tree = SignatureTree::get(signature)?;
        tree.verify(&body)?;
        self.signature = tree;
        self.body = body;
        Ok(self)
    }

    /// Attach a file descriptor to the message, returning the
    /// [`Value::UnixFd`] index referencing it.
    ///
    /// Attaching the same descriptor twice yields the same index.
    ///
    /// # Examples
    ///
    /// ```
    /// use minibus::{Message, Value};
    ///
    /// let mut m = Message::method_call("/", "TakeFd");
    /// let fd = m.push_fd(0);
    /// assert_eq!(fd, Value::UnixFd(0));
    ///
    /// let m = m.with_body("h", vec![fd])?;
    /// assert_eq!(m.unix_fds(), [0]);
    /// # Ok::<_, minibus::Error>(())
    /// ```
    pub fn push_fd(&mut self, fd: RawFd) -> Value {
        let index = match self.unix_fds.iter().position(|&existing| existing == fd) {
            Some(index) => index,
            None => {
                self.unix_fds.push(fd);
                self.unix_fds.len() - 1
            }
        };

        Value::UnixFd(index as u32)
    }

    /// The type of the message.
    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The flags of the message.
    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The serial of the message, if one has been assigned.
    #[inline]
    pub fn serial(&self) -> Option<NonZeroU32> {
        self.serial
    }

    /// The destination of the message.
    #[inline]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The object path of the message.
    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The interface of the message.
    #[inline]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// The member of the message.
    #[inline]
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// The error name of the message, set on `ERROR` messages.
    #[inline]
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// The serial this message replies to.
    #[inline]
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        self.reply_serial
    }

    /// The sender of the message, filled in by the message bus.
    #[inline]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The signature of the body.
    #[inline]
    pub fn signature(&self) -> &str {
        self.signature.signature()
    }

    /// The parsed signature tree of the body.
    #[inline]
    pub fn signature_tree(&self) -> &Arc<SignatureTree> {
        &self.signature
    }

    /// The body values of the message.
    #[inline]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// The file descriptors attached to the message.
    #[inline]
    pub fn unix_fds(&self) -> &[RawFd] {
        &self.unix_fds
    }

    /// Validate the header fields required for this message type, and the
    /// validity of every name-valued field.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(destination) = &self.destination {
            validators::assert_bus_name_valid(destination)?;
        }

        if let Some(path) = &self.path {
            validators::assert_object_path_valid(path)?;
        }

        if let Some(interface) = &self.interface {
            validators::assert_interface_name_valid(interface)?;
        }

        if let Some(member) = &self.member {
            validators::assert_member_name_valid(member)?;
        }

        if let Some(error_name) = &self.error_name {
            validators::assert_interface_name_valid(error_name)?;
        }

        let missing = match self.message_type {
            MessageType::METHOD_CALL => match (&self.path, &self.member) {
                (None, _) => Some("PATH"),
                (_, None) => Some("MEMBER"),
                _ => None,
            },
            MessageType::METHOD_RETURN => self.reply_serial.is_none().then_some("REPLY_SERIAL"),
            MessageType::ERROR => match (&self.error_name, &self.reply_serial) {
                (None, _) => Some("ERROR_NAME"),
                (_, None) => Some("REPLY_SERIAL"),
                _ => None,
            },
            MessageType::SIGNAL => match (&self.path, &self.interface, &self.member) {
                (None, ..) => Some("PATH"),
                (_, None, _) => Some("INTERFACE"),
                (.., None) => Some("MEMBER"),
                _ => None,
            },
            _ => {
                return Err(Error::new(ErrorKind::InvalidMessage(
                    "unknown message type".into(),
                )))
            }
        };

        if let Some(field) = missing {
            return Err(Error::new(ErrorKind::InvalidMessage(
                format!("missing required {field} header").into(),
            )));
        }

        Ok(())
    }
}
