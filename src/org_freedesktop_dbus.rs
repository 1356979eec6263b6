//! Types associated with the `org.freedesktop.DBus` interface.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor};

/// Well known destination name of the message bus daemon.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Well known interface name of the message bus daemon.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Well known D-Bus path of the message bus daemon.
pub const PATH: &str = "/org/freedesktop/DBus";

/// The `org.freedesktop.DBus.Introspectable` interface.
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// The `org.freedesktop.DBus.Properties` interface.
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// The `org.freedesktop.DBus.Peer` interface.
pub const PEER: &str = "org.freedesktop.DBus.Peer";

/// The `org.freedesktop.DBus.ObjectManager` interface.
pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

/// Well known error names emitted and recognized by this implementation.
pub mod error_name {
    /// A generic error.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// No object is exported at the requested path.
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    /// The object has no such interface.
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    /// The interface has no such method.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// The interface has no such property.
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    /// The arguments of a call did not match the member's signature.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// A write to a read-only property.
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    /// The connection to the bus was lost.
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    /// No reply arrived for a call expecting one.
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    /// A call did not complete in time.
    pub const TIMED_OUT: &str = "org.freedesktop.DBus.Error.TimedOut";
    /// The caller is not permitted to perform the operation.
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    /// The named bus name has no owner.
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
}

macro_rules! bus_enum {
    (
        $(#[doc = $doc:literal])*
        $vis:vis enum $name:ident {
            $(
                $(#[$($variant_meta:meta)*])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        $vis struct $name(pub(crate) u32);

        impl $name {
            $(
                $(#[$($variant_meta)*])*
                $vis const $variant: Self = Self($value);
            )*

            /// The raw protocol value.
            #[inline]
            $vis fn value(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    _ => write!(f, "UNKNOWN({})", self.0),
                }
            }
        }
    }
}

/// The flags to a `RequestName` call.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NameFlag(pub(crate) u32);

impl NameFlag {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Allow another application requesting the name with `REPLACE_EXISTING`
    /// to take it over.
    pub const ALLOW_REPLACEMENT: Self = Self(1);
    /// Try to replace the current owner if there is one, which only works if
    /// that owner specified `ALLOW_REPLACEMENT`.
    pub const REPLACE_EXISTING: Self = Self(2);
    /// Fail the request instead of queueing for the name when it is already
    /// owned.
    pub const DO_NOT_QUEUE: Self = Self(4);

    /// The raw protocol value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NameFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameFlag({:b})", self.0)
    }
}

impl BitOr<NameFlag> for NameFlag {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: NameFlag) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd<NameFlag> for NameFlag {
    type Output = bool;

    #[inline]
    fn bitand(self, rhs: NameFlag) -> Self::Output {
        self.0 & rhs.0 != 0
    }
}

impl BitXor<NameFlag> for NameFlag {
    type Output = Self;

    #[inline]
    fn bitxor(self, rhs: NameFlag) -> Self::Output {
        Self(self.0 ^ rhs.0)
    }
}

bus_enum! {
    /// The reply to a `RequestName` call.
    pub enum NameReply {
        /// The caller is now the primary owner of the name.
        PRIMARY_OWNER = 1,
        /// The name already had an owner and the caller has been placed in
        /// the queue for it.
        IN_QUEUE = 2,
        /// The name already has an owner and the request was refused.
        EXISTS = 3,
        /// The caller already owns the name.
        ALREADY_OWNER = 4,
    }
}

bus_enum! {
    /// The reply to a `ReleaseName` call.
    pub enum ReleaseNameReply {
        /// The name has been released.
        RELEASED = 1,
        /// No one owned the name.
        NON_EXISTENT = 2,
        /// The caller was not the owner of the name.
        NOT_OWNER = 3,
    }
}
