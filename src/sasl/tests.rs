use super::{ascii_hex, AuthAction, AuthMechanism, Authenticator};

#[test]
fn hex_encoding() {
    assert_eq!(ascii_hex(b"1000"), "31303030");
    assert_eq!(ascii_hex(b"0"), "30");
    assert_eq!(ascii_hex(b"4294967295"), "34323934393637323935");
    assert_eq!(ascii_hex(b""), "");
}

#[test]
fn plain_handshake() {
    let mut auth = Authenticator::new(vec![AuthMechanism::External], false);

    let first = auth.start();
    assert!(first.starts_with("AUTH EXTERNAL "));

    let action = auth
        .feed_line("OK 6871a0ef4a1a5f17769c8d3c5d5d0c99")
        .unwrap();
    assert_eq!(action, AuthAction::SendThenDone("BEGIN".into()));
    assert!(auth.is_authenticated());
    assert_eq!(auth.guid(), Some("6871a0ef4a1a5f17769c8d3c5d5d0c99"));
    assert!(!auth.unix_fd_agreed());
}

#[test]
fn fd_negotiation_agreed() {
    let mut auth = Authenticator::new(vec![AuthMechanism::External], true);

    auth.start();
    let action = auth.feed_line("OK cafebabe").unwrap();
    assert_eq!(action, AuthAction::Send("NEGOTIATE_UNIX_FD".into()));
    assert!(!auth.is_authenticated());

    let action = auth.feed_line("AGREE_UNIX_FD").unwrap();
    assert_eq!(action, AuthAction::SendThenDone("BEGIN".into()));
    assert!(auth.is_authenticated());
    assert!(auth.unix_fd_agreed());
}

#[test]
fn fd_negotiation_refused() {
    let mut auth = Authenticator::new(vec![AuthMechanism::External], true);

    auth.start();
    auth.feed_line("OK cafebabe").unwrap();
    let action = auth.feed_line("ERROR not on this server").unwrap();
    assert_eq!(action, AuthAction::SendThenDone("BEGIN".into()));
    assert!(auth.is_authenticated());
    assert!(!auth.unix_fd_agreed());
}

#[test]
fn rejected_falls_through_mechanisms() {
    let mut auth = Authenticator::new(
        vec![AuthMechanism::External, AuthMechanism::Anonymous],
        false,
    );

    auth.start();

    let action = auth.feed_line("REJECTED ANONYMOUS").unwrap();
    let AuthAction::Send(line) = action else {
        panic!("expected a retry with the next mechanism");
    };
    assert!(line.starts_with("AUTH ANONYMOUS "));

    let action = auth.feed_line("OK cafebabe").unwrap();
    assert_eq!(action, AuthAction::SendThenDone("BEGIN".into()));
}

#[test]
fn rejection_of_last_mechanism_fails() {
    let mut auth = Authenticator::new(vec![AuthMechanism::External], false);

    auth.start();
    let error = auth.feed_line("REJECTED EXTERNAL").unwrap_err();
    assert!(error.to_string().contains("rejected"));
}

#[test]
fn data_challenge_is_answered() {
    let mut auth = Authenticator::new(vec![AuthMechanism::External], false);

    auth.start();
    let action = auth.feed_line("DATA").unwrap();
    assert_eq!(action, AuthAction::Send("DATA".into()));

    let action = auth.feed_line("OK cafebabe").unwrap();
    assert_eq!(action, AuthAction::SendThenDone("BEGIN".into()));
}

#[test]
fn garbage_fails() {
    let mut auth = Authenticator::new(vec![AuthMechanism::External], false);

    auth.start();
    assert!(auth.feed_line("WAT").is_err());
}
