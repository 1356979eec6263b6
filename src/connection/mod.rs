//! The stream transport underneath a bus connection.

pub(crate) use self::transport::{IoEvent, Transport, MAX_FDS_PER_MESSAGE};
mod transport;

#[cfg(test)]
mod tests;

use crate::error::Result;
use crate::sasl::{AuthAction, AuthMechanism, Authenticator};

/// Drive the SASL handshake over a freshly opened transport.
///
/// Returns the completed authenticator, carrying the server GUID and the
/// negotiated file descriptor capability.
pub(crate) async fn authenticate(
    transport: &mut Transport,
    mechanisms: Vec<AuthMechanism>,
    negotiate_unix_fd: bool,
) -> Result<Authenticator> {
    let mut auth = Authenticator::new(mechanisms, negotiate_unix_fd);

    // The zero byte that precedes the handshake, along with which the peer
    // credentials travel on unix sockets.
    transport.write_all(b"\0", &[]).await?;

    let mut line = auth.start();

    loop {
        line.push_str("\r\n");
        transport.write_all(line.as_bytes(), &[]).await?;

        if auth.is_authenticated() {
            return Ok(auth);
        }

        let response = transport.read_line().await?;

        line = match auth.feed_line(&response)? {
            AuthAction::Send(line) => line,
            AuthAction::SendThenDone(line) => line,
        };
    }
}
