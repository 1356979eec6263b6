use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;

use super::transport::{recvmsg, sendmsg};
use super::{authenticate, Transport};
use crate::sasl::AuthMechanism;

#[test]
fn fd_passing_over_socketpair() {
    let (a, b) = UnixStream::pair().unwrap();

    let mut pipe = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
    let [read_end, write_end] = pipe;

    let n = sendmsg(a.as_raw_fd(), b"!", &[read_end]).unwrap();
    assert_eq!(n, 1);

    let mut buf = [0u8; 16];
    let mut fds = VecDeque::new();
    let n = recvmsg(b.as_raw_fd(), &mut buf, &mut fds).unwrap();

    assert_eq!(&buf[..n], b"!");
    assert_eq!(fds.len(), 1);

    // The received descriptor is a live duplicate of the pipe's read end.
    let received = fds.pop_front().unwrap();
    assert_eq!(unsafe { libc::write(write_end, b"y".as_ptr() as *const _, 1) }, 1);

    let mut byte = 0u8;
    let n = unsafe { libc::read(received, &mut byte as *mut _ as *mut _, 1) };
    assert_eq!(n, 1);
    assert_eq!(byte, b'y');

    unsafe {
        libc::close(received);
        libc::close(read_end);
        libc::close(write_end);
    }
}

#[test]
fn sendmsg_without_fds_is_plain_send() {
    let (a, b) = UnixStream::pair().unwrap();

    let n = sendmsg(a.as_raw_fd(), b"hello", &[]).unwrap();
    assert_eq!(n, 5);

    let mut buf = [0u8; 16];
    let mut fds = VecDeque::new();
    let n = recvmsg(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert!(fds.is_empty());
}

/// A scripted server side of the SASL handshake.
fn sasl_server(mut stream: UnixStream, negotiate: bool) -> thread::JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut seen = Vec::new();
        let mut buf = Vec::new();

        // The NUL greeting.
        let mut nul = [0u8; 1];
        stream.read_exact(&mut nul).unwrap();
        assert_eq!(nul, [0]);

        loop {
            let mut byte = [0u8; 1];

            if stream.read(&mut byte).unwrap() == 0 {
                break;
            }

            buf.push(byte[0]);

            if !buf.ends_with(b"\r\n") {
                continue;
            }

            let line = String::from_utf8(buf.split_off(0)).unwrap();
            let line = line.trim_end().to_owned();

            if line.starts_with("AUTH EXTERNAL") {
                stream
                    .write_all(b"OK 6871a0ef4a1a5f17769c8d3c5d5d0c99\r\n")
                    .unwrap();
            } else if line == "NEGOTIATE_UNIX_FD" {
                assert!(negotiate);
                stream.write_all(b"AGREE_UNIX_FD\r\n").unwrap();
            } else if line == "BEGIN" {
                seen.push(line);
                break;
            }

            seen.push(line);
        }

        seen
    })
}

#[tokio::test]
async fn handshake_over_socketpair() {
    let (client, server) = UnixStream::pair().unwrap();
    let server = sasl_server(server, false);

    let mut transport = Transport::from_unix_stream(client).unwrap();
    let auth = authenticate(&mut transport, vec![AuthMechanism::External], false)
        .await
        .unwrap();

    assert!(auth.is_authenticated());
    assert_eq!(auth.guid(), Some("6871a0ef4a1a5f17769c8d3c5d5d0c99"));
    assert!(!auth.unix_fd_agreed());

    let seen = server.join().unwrap();
    assert!(seen[0].starts_with("AUTH EXTERNAL "));
    assert_eq!(seen[1], "BEGIN");
}

#[tokio::test]
async fn handshake_negotiating_fds() {
    let (client, server) = UnixStream::pair().unwrap();
    let server = sasl_server(server, true);

    let mut transport = Transport::from_unix_stream(client).unwrap();
    let auth = authenticate(&mut transport, vec![AuthMechanism::External], true)
        .await
        .unwrap();

    assert!(auth.unix_fd_agreed());

    let seen = server.join().unwrap();
    assert_eq!(seen[1], "NEGOTIATE_UNIX_FD");
    assert_eq!(seen[2], "BEGIN");
}
