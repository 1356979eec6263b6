//! The SASL handshake D-Bus performs before any protocol byte is exchanged.
//!
//! [`Authenticator`] is a pure line-level state machine: the transport layer
//! feeds it the peer's response lines and writes out the command lines it
//! produces. Lines are ASCII and `\r\n` terminated on the wire, the
//! terminator is handled by the driver.

#[cfg(test)]
mod tests;

use std::fmt::Write;

use crate::error::{Error, ErrorKind, Result};

/// A SASL mechanism offered to the server, tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMechanism {
    /// EXTERNAL authentication: the out-of-band credentials of the socket,
    /// with the numeric UID of the process as the initial response.
    External,
    /// ANONYMOUS authentication with an opaque trace tag.
    Anonymous,
}

impl AuthMechanism {
    fn command(&self) -> String {
        match self {
            AuthMechanism::External => {
                let uid = unsafe { libc::getuid() };
                format!("AUTH EXTERNAL {}", ascii_hex(uid.to_string().as_bytes()))
            }
            AuthMechanism::Anonymous => {
                format!("AUTH ANONYMOUS {}", ascii_hex(b"minibus"))
            }
        }
    }
}

/// Hex-encode bytes the way the D-Bus auth protocol spells initial
/// responses.
fn ascii_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);

    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String");
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Start,
    WaitingForData,
    WaitingForOk,
    WaitingForAgreeUnixFd,
    Authenticated,
}

/// The next step the transport has to take for the handshake to make
/// progress.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AuthAction {
    /// Write the line and wait for the next response.
    Send(String),
    /// Write the line; the handshake is complete and the next byte written
    /// after it is the first byte of a D-Bus message.
    SendThenDone(String),
}

/// Client side of the SASL handshake.
pub(crate) struct Authenticator {
    mechanisms: Vec<AuthMechanism>,
    next: usize,
    negotiate_unix_fd: bool,
    state: AuthState,
    guid: Option<String>,
    unix_fd_agreed: bool,
}

impl Authenticator {
    pub(crate) fn new(mechanisms: Vec<AuthMechanism>, negotiate_unix_fd: bool) -> Self {
        debug_assert!(!mechanisms.is_empty());

        Self {
            mechanisms,
            next: 0,
            negotiate_unix_fd,
            state: AuthState::Start,
            guid: None,
            unix_fd_agreed: false,
        }
    }

    /// The first command line, sent right after the initial zero byte.
    pub(crate) fn start(&mut self) -> String {
        debug_assert_eq!(self.state, AuthState::Start);
        self.state = AuthState::WaitingForOk;
        let line = self.mechanisms[self.next].command();
        self.next += 1;
        line
    }

    /// Feed one response line, without its terminator.
    pub(crate) fn feed_line(&mut self, line: &str) -> Result<AuthAction> {
        let line = line.trim_end();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (line, ""),
        };

        match (self.state, command) {
            (AuthState::WaitingForOk, "OK") => {
                self.guid = Some(rest.to_owned());

                if self.negotiate_unix_fd {
                    self.state = AuthState::WaitingForAgreeUnixFd;
                    Ok(AuthAction::Send("NEGOTIATE_UNIX_FD".into()))
                } else {
                    self.state = AuthState::Authenticated;
                    Ok(AuthAction::SendThenDone("BEGIN".into()))
                }
            }
            (AuthState::WaitingForOk, "REJECTED") => {
                let Some(mechanism) = self.mechanisms.get(self.next) else {
                    return Err(Error::new(ErrorKind::AuthFailed(
                        format!("all mechanisms rejected: {rest}").into(),
                    )));
                };

                let line = mechanism.command();
                self.next += 1;
                Ok(AuthAction::Send(line))
            }
            (AuthState::WaitingForOk | AuthState::WaitingForData, "DATA") => {
                // No mechanism we offer has a data phase, answer with an
                // empty data block.
                self.state = AuthState::WaitingForOk;
                Ok(AuthAction::Send("DATA".into()))
            }
            (AuthState::WaitingForAgreeUnixFd, "AGREE_UNIX_FD") => {
                self.unix_fd_agreed = true;
                self.state = AuthState::Authenticated;
                Ok(AuthAction::SendThenDone("BEGIN".into()))
            }
            (AuthState::WaitingForAgreeUnixFd, "ERROR") => {
                // The server speaks the protocol but will not pass
                // descriptors; carry on without them.
                self.state = AuthState::Authenticated;
                Ok(AuthAction::SendThenDone("BEGIN".into()))
            }
            (_, "ERROR") => Err(Error::new(ErrorKind::AuthFailed(
                format!("server error: {rest}").into(),
            ))),
            (state, _) => Err(Error::new(ErrorKind::AuthFailed(
                format!("unexpected `{line}` in state {state:?}").into(),
            ))),
        }
    }

    /// Test if the handshake has completed.
    pub(crate) fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// The GUID of the server, from its `OK` line.
    pub(crate) fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// Test if the server agreed to pass file descriptors.
    pub(crate) fn unix_fd_agreed(&self) -> bool {
        self.unix_fd_agreed
    }
}
