use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::org_freedesktop_dbus as fdo;
use crate::signature::SignatureError;
use crate::validators;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    #[inline]
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Test if the error indicates that the connection to the message bus has
    /// been lost.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self.kind, ErrorKind::Disconnected)
    }

    /// Test if the error indicates that a call timed out.
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// The reply error raised by the remote peer, if this error was caused by
    /// an `ERROR` message.
    ///
    /// # Examples
    ///
    /// ```
    /// use minibus::{DBusError, Error};
    ///
    /// let e = Error::from(DBusError::failed("out of cheese"));
    /// let remote = e.remote_error().unwrap();
    /// assert_eq!(remote.name(), "org.freedesktop.DBus.Error.Failed");
    /// ```
    #[inline]
    pub fn remote_error(&self) -> Option<&DBusError> {
        match &self.kind {
            ErrorKind::Remote(error) => Some(error),
            _ => None,
        }
    }
}

/// An error name and message as carried by a D-Bus `ERROR` reply.
///
/// Service method and property handlers return this type to control the error
/// name of the reply. Any other failure is reported to the caller as
/// `org.freedesktop.DBus.Error.Failed`.
///
/// # Examples
///
/// ```
/// use minibus::DBusError;
///
/// let e = DBusError::new("org.freedesktop.DBus.Error.AccessDenied", "not yours")?;
/// assert_eq!(e.name(), "org.freedesktop.DBus.Error.AccessDenied");
/// assert_eq!(e.text(), "not yours");
/// # Ok::<_, minibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBusError {
    name: Box<str>,
    text: Box<str>,
}

impl DBusError {
    /// Construct a new error with the given name and message text.
    ///
    /// The name must be a valid D-Bus interface name, such as
    /// `org.freedesktop.DBus.Error.InvalidArgs`.
    pub fn new(name: &str, text: &str) -> Result<Self> {
        validators::assert_interface_name_valid(name)?;

        Ok(Self {
            name: name.into(),
            text: text.into(),
        })
    }

    /// Construct a `org.freedesktop.DBus.Error.Failed` error with the given
    /// message text.
    pub fn failed(text: &str) -> Self {
        Self {
            name: fdo::error_name::FAILED.into(),
            text: text.into(),
        }
    }

    #[inline]
    pub(crate) fn raw(name: &str, text: String) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// The error name, such as `org.freedesktop.DBus.Error.UnknownMethod`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human readable error message.
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for DBusError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.text)
    }
}

impl error::Error for DBusError {}

impl From<DBusError> for Error {
    #[inline]
    fn from(error: DBusError) -> Self {
        Self::new(ErrorKind::Remote(error))
    }
}

impl From<Error> for DBusError {
    fn from(error: Error) -> Self {
        match error.kind {
            ErrorKind::Remote(error) => error,
            kind => DBusError::raw(fdo::error_name::FAILED, kind.to_string()),
        }
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            ErrorKind::Remote(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    Utf8Error(Utf8Error),
    SignatureBodyMismatch(Box<str>),
    InvalidAddress(Box<str>),
    AuthFailed(Box<str>),
    InvalidMessage(Box<str>),
    InvalidIntrospection(Box<str>),
    InvalidBusName(Box<str>),
    InvalidObjectPath(Box<str>),
    InvalidInterfaceName(Box<str>),
    InvalidMemberName(Box<str>),
    InterfaceNotFound(Box<str>),
    MemberNotFound(Box<str>),
    SignalDisabled(Box<str>),
    AlreadyExported(Box<str>),
    MissingBus,
    MessageTooLarge(usize),
    ArrayTooLong(u32),
    FdPassingDisabled,
    Transport(Box<str>),
    Disconnected,
    TimedOut,
    Remote(DBusError),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Signature(error) => error.fmt(f),
            ErrorKind::Utf8Error(error) => error.fmt(f),
            ErrorKind::SignatureBodyMismatch(what) => {
                write!(f, "Body does not match signature: {what}")
            }
            ErrorKind::InvalidAddress(address) => write!(f, "Invalid D-Bus address `{address}`"),
            ErrorKind::AuthFailed(reason) => write!(f, "Authentication failed: {reason}"),
            ErrorKind::InvalidMessage(what) => write!(f, "Invalid message: {what}"),
            ErrorKind::InvalidIntrospection(what) => write!(f, "Invalid introspection: {what}"),
            ErrorKind::InvalidBusName(name) => write!(f, "Invalid bus name `{name}`"),
            ErrorKind::InvalidObjectPath(path) => write!(f, "Invalid object path `{path}`"),
            ErrorKind::InvalidInterfaceName(name) => {
                write!(f, "Invalid interface name `{name}`")
            }
            ErrorKind::InvalidMemberName(name) => write!(f, "Invalid member name `{name}`"),
            ErrorKind::InterfaceNotFound(name) => {
                write!(f, "Interface `{name}` not found")
            }
            ErrorKind::MemberNotFound(name) => write!(f, "Member `{name}` not found"),
            ErrorKind::SignalDisabled(name) => write!(f, "Signal `{name}` is disabled"),
            ErrorKind::AlreadyExported(what) => {
                write!(f, "Interface `{what}` is already exported at this path")
            }
            ErrorKind::MissingBus => write!(f, "Missing session bus address"),
            ErrorKind::MessageTooLarge(length) => {
                write!(f, "Message of length {length} is too large (max is 134217728)")
            }
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::FdPassingDisabled => {
                write!(f, "File descriptor passing was not negotiated")
            }
            ErrorKind::Transport(what) => write!(f, "Transport failed: {what}"),
            ErrorKind::Disconnected => write!(f, "Connection to the message bus was lost"),
            ErrorKind::TimedOut => write!(f, "Call timed out"),
            ErrorKind::Remote(error) => error.fmt(f),
        }
    }
}
