//! Parsing of D-Bus server addresses.
//!
//! An address is a semicolon-separated list of transports to try in order,
//! such as `unix:path=/run/user/1000/bus;tcp:host=localhost,port=4444`.
//! Option values may be percent-escaped.

#[cfg(test)]
mod tests;

use std::env;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
pub(crate) const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub(crate) const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// The address of the session bus, from `DBUS_SESSION_BUS_ADDRESS`.
pub(crate) fn session_bus_address() -> Result<String> {
    match env::var(ENV_SESSION_BUS) {
        Ok(address) => Ok(address),
        Err(..) => Err(Error::new(ErrorKind::MissingBus)),
    }
}

/// The address of the system bus, from `DBUS_SYSTEM_BUS_ADDRESS` with a
/// fallback to the well-known socket path.
pub(crate) fn system_bus_address() -> String {
    env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.to_owned())
}

/// The preferred IP family of a TCP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpFamily {
    V4,
    V6,
}

/// A single parsed entry of an address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AddressKind {
    /// `unix:path=`, a socket in the file system.
    UnixPath(String),
    /// `unix:abstract=`, a socket in the abstract namespace.
    UnixAbstract(String),
    /// `unix:tmpdir=`, rewritten to a random name in the abstract namespace.
    UnixTmpdir(String),
    /// `tcp:host=…,port=…`.
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
    /// `launchd:env=…`, the socket path published in the named environment
    /// variable.
    Launchd(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Address {
    pub(crate) kind: AddressKind,
    /// Server GUID, checked against the one learned during authentication.
    pub(crate) guid: Option<String>,
}

/// Parse a semicolon-separated address list.
///
/// Entries that do not parse, such as transports unknown to this
/// implementation, are skipped so that a later entry of the list can still
/// be dialed. The list fails as a whole only when no entry is usable.
pub(crate) fn parse_address_list(addresses: &str) -> Result<Vec<Address>> {
    let mut out = Vec::new();
    let mut first_error = None;

    for entry in addresses.split(';') {
        if entry.is_empty() {
            continue;
        }

        match parse_address(entry) {
            Ok(address) => out.push(address),
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
    }

    if out.is_empty() {
        return Err(match first_error {
            Some(error) => error,
            None => invalid(addresses),
        });
    }

    Ok(out)
}

fn parse_address(entry: &str) -> Result<Address> {
    let Some((transport, options)) = entry.split_once(':') else {
        return Err(invalid(entry));
    };

    let mut path = None;
    let mut abstract_ = None;
    let mut tmpdir = None;
    let mut host = None;
    let mut port = None;
    let mut family = None;
    let mut env_name = None;
    let mut guid = None;

    for option in options.split(',') {
        if option.is_empty() {
            continue;
        }

        let Some((key, value)) = option.split_once('=') else {
            return Err(invalid(entry));
        };

        let value = unescape(value).ok_or_else(|| invalid(entry))?;

        match key {
            "path" => path = Some(value),
            "abstract" => abstract_ = Some(value),
            "tmpdir" => tmpdir = Some(value),
            "host" => host = Some(value),
            "port" => port = Some(value),
            "family" => family = Some(value),
            "env" => env_name = Some(value),
            "guid" => guid = Some(value),
            // Unknown options are ignored for forward compatibility.
            _ => {}
        }
    }

    let kind = match transport {
        "unix" => match (path, abstract_, tmpdir) {
            (Some(path), None, None) => AddressKind::UnixPath(path),
            (None, Some(name), None) => AddressKind::UnixAbstract(name),
            (None, None, Some(dir)) => AddressKind::UnixTmpdir(dir),
            _ => return Err(invalid(entry)),
        },
        "tcp" => {
            let (Some(host), Some(port)) = (host, port) else {
                return Err(invalid(entry));
            };

            let Ok(port) = port.parse::<u16>() else {
                return Err(invalid(entry));
            };

            let family = match family.as_deref() {
                None => None,
                Some("ipv4") => Some(TcpFamily::V4),
                Some("ipv6") => Some(TcpFamily::V6),
                Some(..) => return Err(invalid(entry)),
            };

            AddressKind::Tcp { host, port, family }
        }
        "launchd" => {
            let Some(env_name) = env_name else {
                return Err(invalid(entry));
            };

            AddressKind::Launchd(env_name)
        }
        _ => return Err(invalid(entry)),
    };

    Ok(Address { kind, guid })
}

/// Undo D-Bus percent-escaping of an option value.
fn unescape(value: &str) -> Option<String> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }

        let high = hex_digit(bytes.next()?)?;
        let low = hex_digit(bytes.next()?)?;
        out.push(high << 4 | low);
    }

    String::from_utf8(out).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[inline]
fn invalid(entry: &str) -> Error {
    Error::new(ErrorKind::InvalidAddress(entry.into()))
}
