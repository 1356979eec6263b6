//! Marshalling to and from the D-Bus binary encoding.
//!
//! [`Marshaller`] serializes values into a growable, alignment-aware byte
//! buffer driven by a signature tree, [`Unmarshaller`] is the resumable
//! counterpart that consumes successive byte chunks off a transport and
//! produces complete [`Message`]s.
//!
//! [`Message`]: crate::Message


pub(crate) use self::marshaller::{marshal_message, Marshaller};
mod marshaller;

pub(crate) use self::unmarshaller::Unmarshaller;
mod unmarshaller;
