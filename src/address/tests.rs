use super::{parse_address_list, Address, AddressKind, TcpFamily};

#[test]
fn unix_addresses() {
    let list = parse_address_list("unix:path=/run/user/1000/bus").unwrap();
    assert_eq!(
        list,
        [Address {
            kind: AddressKind::UnixPath("/run/user/1000/bus".into()),
            guid: None,
        }]
    );

    let list = parse_address_list(
        "unix:abstract=/tmp/dbus-ft9sODWpZk,guid=a7b1d5912379c2d471165e9b5cb74a03",
    )
    .unwrap();
    assert_eq!(
        list,
        [Address {
            kind: AddressKind::UnixAbstract("/tmp/dbus-ft9sODWpZk".into()),
            guid: Some("a7b1d5912379c2d471165e9b5cb74a03".into()),
        }]
    );

    let list = parse_address_list("unix:tmpdir=/tmp").unwrap();
    assert_eq!(
        list,
        [Address {
            kind: AddressKind::UnixTmpdir("/tmp".into()),
            guid: None,
        }]
    );
}

#[test]
fn fallback_lists() {
    let list =
        parse_address_list("unix:path=/run/bus;tcp:host=127.0.0.1,port=55556").unwrap();

    assert_eq!(list.len(), 2);
    assert_eq!(list[0].kind, AddressKind::UnixPath("/run/bus".into()));
    assert_eq!(
        list[1].kind,
        AddressKind::Tcp {
            host: "127.0.0.1".into(),
            port: 55556,
            family: None,
        }
    );
}

#[test]
fn tcp_with_family() {
    let list = parse_address_list("tcp:host=localhost,port=4444,family=ipv4").unwrap();
    assert_eq!(
        list[0].kind,
        AddressKind::Tcp {
            host: "localhost".into(),
            port: 4444,
            family: Some(TcpFamily::V4),
        }
    );

    assert!(parse_address_list("tcp:host=localhost,port=4444,family=ipx").is_err());
    assert!(parse_address_list("tcp:host=localhost").is_err());
    assert!(parse_address_list("tcp:host=localhost,port=notaport").is_err());
}

#[test]
fn launchd_address() {
    let list = parse_address_list("launchd:env=DBUS_LAUNCHD_SESSION_BUS_SOCKET").unwrap();
    assert_eq!(
        list[0].kind,
        AddressKind::Launchd("DBUS_LAUNCHD_SESSION_BUS_SOCKET".into())
    );
}

#[test]
fn percent_escapes() {
    let list = parse_address_list("unix:path=hello%20world").unwrap();
    assert_eq!(list[0].kind, AddressKind::UnixPath("hello world".into()));

    assert!(parse_address_list("unix:path=bad%2escape%").is_err());
    assert!(parse_address_list("unix:path=bad%zz").is_err());
}

#[test]
fn unknown_transport_falls_through() {
    let list = parse_address_list("warp:drive=5;unix:path=/run/bus").unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].kind, AddressKind::UnixPath("/run/bus".into()));
}

#[test]
fn invalid_addresses() {
    assert!(parse_address_list("").is_err());
    assert!(parse_address_list("unix").is_err());
    assert!(parse_address_list("unix:").is_err());
    assert!(parse_address_list("unix:opt").is_err());
    assert!(parse_address_list("unix:path=/a,abstract=b").is_err());
    assert!(parse_address_list("warp:drive=5").is_err());
    assert!(parse_address_list("launchd:path=/nope").is_err());
}
