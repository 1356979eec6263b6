use std::collections::VecDeque;
use std::io;
use std::mem::{size_of, zeroed};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};

use crate::address::{Address, AddressKind, TcpFamily};
use crate::error::{Error, ErrorKind, Result};

/// The outcome of one readiness-driven transport operation.
pub(crate) enum IoEvent {
    /// Bytes were read; zero means end of stream.
    Read(usize),
    /// Bytes of the pending outbound message were written.
    Wrote(usize),
}

/// The most file descriptors a single message may carry, matching the limit
/// enforced by the reference bus daemon.
pub(crate) const MAX_FDS_PER_MESSAGE: usize = 16;

const CMSG_BUF_LEN: usize = 256;

/// The underlying stream socket of a connection.
pub(crate) enum Socket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsRawFd for Socket {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Unix(stream) => stream.as_raw_fd(),
            Socket::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}

impl Socket {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Socket::Unix(stream) => stream.set_nonblocking(true),
            Socket::Tcp(stream) => stream.set_nonblocking(true),
        }
    }

    /// Receive bytes, collecting any `SCM_RIGHTS` descriptors into `fds`.
    fn recv_with_fds(&self, buf: &mut [u8], fds: &mut VecDeque<RawFd>) -> io::Result<usize> {
        match self {
            Socket::Unix(stream) => recvmsg(stream.as_raw_fd(), buf, fds),
            Socket::Tcp(stream) => recv(stream.as_raw_fd(), buf),
        }
    }

    /// Send bytes, attaching the given descriptors as `SCM_RIGHTS` ancillary
    /// data.
    fn send_with_fds(&self, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        match self {
            Socket::Unix(stream) => sendmsg(stream.as_raw_fd(), buf, fds),
            Socket::Tcp(stream) => {
                debug_assert!(fds.is_empty(), "fd passing is unix only");
                send(stream.as_raw_fd(), buf)
            }
        }
    }
}

/// An open, authenticated-or-authenticating connection to a D-Bus server.
///
/// The transport owns the socket exclusively, a queue of received but
/// unclaimed file descriptors, and the line buffer used during the SASL
/// phase.
pub(crate) struct Transport {
    fd: AsyncFd<Socket>,
    fds: VecDeque<RawFd>,
    line_buf: Vec<u8>,
}

impl Transport {
    /// Dial the first usable entry of a parsed address list.
    pub(crate) fn connect(addresses: &[Address]) -> Result<(Self, Option<String>)> {
        let mut last_error = None;

        for address in addresses {
            match Self::dial(&address.kind) {
                Ok(socket) => {
                    socket.set_nonblocking()?;

                    let transport = Self {
                        fd: AsyncFd::new(socket)?,
                        fds: VecDeque::new(),
                        line_buf: Vec::new(),
                    };

                    return Ok((transport, address.guid.clone()));
                }
                Err(error) => {
                    tracing::debug!(?address.kind, %error, "failed to dial address");
                    last_error = Some(error);
                }
            }
        }

        Err(match last_error {
            Some(error) => error,
            None => Error::new(ErrorKind::InvalidAddress("".into())),
        })
    }

    fn dial(kind: &AddressKind) -> Result<Socket> {
        match kind {
            AddressKind::UnixPath(path) => Ok(Socket::Unix(UnixStream::connect(path)?)),
            AddressKind::UnixAbstract(name) => {
                Ok(Socket::Unix(connect_abstract(name.as_bytes())?))
            }
            AddressKind::UnixTmpdir(dir) => {
                // A tmpdir address names a directory the server would create
                // a randomly named socket under; as a client we mint the
                // abstract counterpart of such a name.
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.subsec_nanos())
                    .unwrap_or(0);
                let name = format!("{dir}/dbus-{}-{nanos:08x}", process::id());
                Ok(Socket::Unix(connect_abstract(name.as_bytes())?))
            }
            AddressKind::Tcp { host, port, family } => {
                let mut last_error = None;

                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    let usable = match family {
                        None => true,
                        Some(TcpFamily::V4) => addr.is_ipv4(),
                        Some(TcpFamily::V6) => addr.is_ipv6(),
                    };

                    if !usable {
                        continue;
                    }

                    match TcpStream::connect(addr) {
                        Ok(stream) => return Ok(Socket::Tcp(stream)),
                        Err(error) => last_error = Some(error),
                    }
                }

                Err(match last_error {
                    Some(error) => error.into(),
                    None => Error::new(ErrorKind::InvalidAddress(format!(
                        "tcp:host={host},port={port}"
                    ).into())),
                })
            }
            AddressKind::Launchd(env_name) => {
                let Ok(path) = std::env::var(env_name) else {
                    return Err(Error::new(ErrorKind::InvalidAddress(
                        format!("launchd:env={env_name}").into(),
                    )));
                };

                Ok(Socket::Unix(UnixStream::connect(path)?))
            }
        }
    }

    /// Test if this transport can carry file descriptors at all.
    pub(crate) fn supports_fd_passing(&self) -> bool {
        matches!(self.fd.get_ref(), Socket::Unix(..))
    }

    /// The queue of received descriptors not yet attached to a message.
    pub(crate) fn fds_mut(&mut self) -> &mut VecDeque<RawFd> {
        &mut self.fds
    }

    /// Read some bytes off the socket, returning `Ok(0)` at end of stream.
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|fd| fd.get_ref().recv_with_fds(buf, &mut self.fds)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of the given bytes, attaching the descriptors to the first
    /// byte so they travel no later than the message they belong to.
    pub(crate) async fn write_all(&mut self, mut bytes: &[u8], fds: &[RawFd]) -> Result<()> {
        let mut fds = fds;

        if fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(Error::new(ErrorKind::InvalidMessage(
                format!("message carries {} descriptors (max is 16)", fds.len()).into(),
            )));
        }

        while !bytes.is_empty() || !fds.is_empty() {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|fd| fd.get_ref().send_with_fds(bytes, fds)) {
                Ok(result) => {
                    let n = result?;
                    bytes = &bytes[n..];
                    fds = &[];
                }
                Err(_would_block) => continue,
            }
        }

        Ok(())
    }

    /// Wait until the socket is readable or, when an outbound message is
    /// pending, writable, and perform one read or write.
    ///
    /// Reading wins when both directions are ready, keeping inbound dispatch
    /// ahead of our own traffic.
    pub(crate) async fn read_or_write(
        &mut self,
        out: Option<(&[u8], &[RawFd])>,
        buf: &mut [u8],
    ) -> Result<IoEvent> {
        let interest = match out {
            Some(..) => Interest::READABLE | Interest::WRITABLE,
            None => Interest::READABLE,
        };

        loop {
            let mut guard = self.fd.ready(interest).await?;
            let ready = guard.ready();

            if ready.is_readable() {
                match self.fd.get_ref().recv_with_fds(buf, &mut self.fds) {
                    Ok(n) => return Ok(IoEvent::Read(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        guard.clear_ready_matching(Ready::READABLE);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some((bytes, fds)) = out {
                if ready.is_writable() {
                    match self.fd.get_ref().send_with_fds(bytes, fds) {
                        Ok(n) => return Ok(IoEvent::Wrote(n)),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            guard.clear_ready_matching(Ready::WRITABLE);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Read one `\r\n` terminated line of the SASL handshake.
    pub(crate) async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(n) = self.line_buf.iter().position(|&b| b == b'\n') {
                let rest = self.line_buf.split_off(n + 1);
                let line = std::mem::replace(&mut self.line_buf, rest);
                let line = std::str::from_utf8(&line)?.trim_end().to_owned();
                return Ok(line);
            }

            let mut buf = [0u8; 256];
            let n = self.read_some(&mut buf).await?;

            if n == 0 {
                return Err(Error::new(ErrorKind::Disconnected));
            }

            self.line_buf.extend_from_slice(&buf[..n]);
        }
    }

    /// Bytes read past the final SASL line, the beginning of the message
    /// stream.
    pub(crate) fn take_leftover(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.line_buf)
    }

    /// Wrap an already connected unix socket, for peers talking directly
    /// over a socket pair.
    pub(crate) fn from_unix_stream(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;

        Ok(Self {
            fd: AsyncFd::new(Socket::Unix(stream))?,
            fds: VecDeque::new(),
            line_buf: Vec::new(),
        })
    }
}

/// Connect a stream socket in the abstract namespace, which the standard
/// library cannot spell.
fn connect_abstract(name: &[u8]) -> Result<UnixStream> {
    unsafe {
        let fd = libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );

        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut addr: libc::sockaddr_un = zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

        if name.len() + 1 > addr.sun_path.len() {
            libc::close(fd);
            return Err(Error::new(ErrorKind::InvalidAddress(
                String::from_utf8_lossy(name).into_owned().into_boxed_str(),
            )));
        }

        // sun_path[0] stays zero, the name follows it.
        for (i, &b) in name.iter().enumerate() {
            addr.sun_path[i + 1] = b as libc::c_char;
        }

        let len = size_of::<libc::sa_family_t>() + 1 + name.len();

        if libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len as libc::socklen_t) < 0 {
            let error = io::Error::last_os_error();
            libc::close(fd);
            return Err(error.into());
        }

        Ok(UnixStream::from_raw_fd(fd))
    }
}

fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const _, buf.len(), libc::MSG_NOSIGNAL) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

/// `recvmsg` with room for `SCM_RIGHTS` ancillary data; received descriptors
/// are appended to `fds`.
pub(super) fn recvmsg(fd: RawFd, buf: &mut [u8], fds: &mut VecDeque<RawFd>) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };

        let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

        let mut msg: libc::msghdr = zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
        msg.msg_controllen = cmsg_buf.len() as _;

        let n = libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC);

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);

        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count =
                    ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;

                for i in 0..count {
                    fds.push_back(*data.add(i));
                }
            }

            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok(n as usize)
    }
}

/// `sendmsg` attaching the given descriptors as `SCM_RIGHTS` ancillary
/// data.
pub(super) fn sendmsg(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    if fds.is_empty() {
        return send(fd, buf);
    }

    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut _,
            iov_len: buf.len(),
        };

        let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
        let payload = fds.len() * size_of::<RawFd>();

        let mut msg: libc::msghdr = zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
        msg.msg_controllen = libc::CMSG_SPACE(payload as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as _;

        let data = libc::CMSG_DATA(cmsg) as *mut RawFd;

        for (i, &fd) in fds.iter().enumerate() {
            *data.add(i) = fd;
        }

        let n = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }
}
