//! [<img alt="crates.io" src="https://img.shields.io/crates/v/minibus.svg?style=for-the-badge&color=fc8d62&logo=rust" height="20">](https://crates.io/crates/minibus)
//! [<img alt="docs.rs" src="https://img.shields.io/badge/docs.rs-minibus-66c2a5?style=for-the-badge&logoColor=white&logo=data:image/svg+xml;base64,PHN2ZyByb2xlPSJpbWciIHhtbG5zPSJodHRwOi8vd3d3LnczLm9yZy8yMDAwL3N2ZyIgdmlld0JveD0iMCAwIDUxMiA1MTIiPjxwYXRoIGZpbGw9IiNmNWY1ZjUiIGQ9Ik00ODguNiAyNTAuMkw0MzIgMjM2LjRWOTMuNGMwLTE1LjctOS42LTI5LjgtMjQuMS0zNS42TDI3OC4xIDVjLTE0LjItNS43LTMwLTUuNy00NC4yIDBMMTA0LjEgNTcuOGMtMTQuNSA1LjgtMjQuMSAxOS45LTI0LjEgMzUuNnYxNDNsLTU2LjYgMTMuOEM5LjYgMjUzLjkgMCAyNjggMCAyODMuN1Y0MjhjMCAxNC44IDguNyAyOC4zIDIyLjMgMzQuNWwxMTQuMyA1MS43YzEyLjYgNS43IDI3LjEgNS43IDM5LjcgMGwxMTAuNi01MCAxMTAuNiA1MGMxMi42IDUuNyAyNy4xIDUuNyAzOS43IDBsMTE0LjMtNTEuN2MxMy42LTYuMiAyMi4zLTE5LjcgMjIuMy0zNC41VjI4My43YzAtMTUuNy05LjYtMjkuOC0yNC4xLTM1LjV6IiAvPjwvc3ZnPg==" height="20">](https://docs.rs/minibus)
//!
//! A dynamic D-Bus client and service runtime for tokio.
//!
//! This crate speaks the D-Bus wire protocol in user space: it opens a
//! stream transport, authenticates over SASL, marshals strongly typed
//! messages driven by signature strings, and dispatches calls, replies,
//! signals and property operations between local handlers and the message
//! bus daemon. No reference to `libdbus` is involved.
//!
//! Messages carry dynamically typed [`Value`]s validated against parsed
//! [`SignatureTree`]s, so services and clients can be assembled at runtime,
//! from introspection data or by hand.
//!
//! # Examples
//!
//! Calling a method on the session bus:
//!
//! ```no_run
//! use minibus::{Message, MessageBus, Value};
//!
//! # #[tokio::main] async fn main() -> minibus::Result<()> {
//! let bus = MessageBus::session().await?;
//!
//! let reply = bus
//!     .call(
//!         Message::method_call("/org/freedesktop/Notifications", "Notify")
//!             .with_interface("org.freedesktop.Notifications")
//!             .with_destination("org.freedesktop.Notifications")
//!             .with_body(
//!                 "susssasa{sv}i",
//!                 vec![
//!                     Value::from("example"),
//!                     Value::Uint32(0),
//!                     Value::from("dialog-information"),
//!                     Value::from("Hello"),
//!                     Value::from("A message body"),
//!                     Value::Array(vec![]),
//!                     Value::Dict(vec![]),
//!                     Value::Int32(-1),
//!                 ],
//!             )?,
//!     )
//!     .await?;
//!
//! println!("notification id: {:?}", reply.unwrap().body());
//! # Ok(()) }
//! ```
//!
//! Serving an interface:
//!
//! ```no_run
//! use minibus::{MessageBus, ServiceInterface};
//! use minibus::org_freedesktop_dbus::NameFlag;
//!
//! # #[tokio::main] async fn main() -> minibus::Result<()> {
//! let bus = MessageBus::session().await?;
//!
//! let interface = ServiceInterface::builder("com.example.Echo")?
//!     .method("Echo", "s", "s", |args| async move { Ok(args) })?
//!     .build();
//!
//! bus.export("/com/example/Echo", interface)?;
//! bus.request_name("com.example.Echo", NameFlag::NONE).await?;
//! bus.wait_for_disconnect().await
//! # }
//! ```

#[doc(inline)]
pub use self::error::{DBusError, Error, Result};
mod error;

#[doc(inline)]
pub use self::protocol::{Endianness, Flags, MessageType};
pub mod protocol;

pub mod validators;

#[doc(inline)]
pub use self::signature::{SignatureError, SignatureTree, SignatureType, TypeCode};
mod signature;

#[doc(inline)]
pub use self::value::Value;
mod value;

#[doc(inline)]
pub use self::variant::Variant;
mod variant;

mod marshal;

#[doc(inline)]
pub use self::message::Message;
mod message;

#[doc(inline)]
pub use self::sasl::AuthMechanism;
mod sasl;

mod address;

mod connection;

#[doc(inline)]
pub use self::bus::{
    HandlerAction, HandlerId, MatchRule, MessageBus, MessageBusBuilder,
};
mod bus;

#[doc(inline)]
pub use self::service::{MethodResult, ServiceInterface, ServiceInterfaceBuilder};
mod service;

#[doc(inline)]
pub use self::proxy::{ProxyInterface, ProxyObject, SignalToken};
mod proxy;

pub mod introspect;

pub mod org_freedesktop_dbus;
