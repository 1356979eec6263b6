use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::bus::{HandlerAction, MatchRule, MessageBus, MessageBusBuilder};
use crate::error::ErrorKind;
use crate::introspect::{self, Arg, ArgDirection, Node, PropertyAccess};
use crate::marshal::{marshal_message, Unmarshaller};
use crate::message::Message;
use crate::org_freedesktop_dbus as fdo;
use crate::protocol::{Flags, MessageType};
use crate::service::ServiceInterface;
use crate::value::Value;
use crate::variant::Variant;

fn peer_pair() -> (MessageBus, MessageBus) {
    let (a, b) = UnixStream::pair().unwrap();
    let service = MessageBus::peer(a).unwrap();
    let client = MessageBus::peer(b).unwrap();
    (service, client)
}

fn echo_interface() -> Arc<ServiceInterface> {
    ServiceInterface::builder("test.interface")
        .unwrap()
        .method("Echo", "s", "s", |args| async move { Ok(args) })
        .unwrap()
        .method("Add", "ii", "i", |args| async move {
            let (Some(Value::Int32(a)), Some(Value::Int32(b))) = (args.first(), args.get(1))
            else {
                unreachable!("arguments are checked against the signature");
            };

            Ok(vec![Value::Int32(a + b)])
        })
        .unwrap()
        .signal("Echoed", "s")
        .unwrap()
        .build()
}

/// A round trip that flushes everything the peer queued before it.
async fn ping(bus: &MessageBus) {
    let m = Message::method_call("/", "Ping").with_interface(fdo::PEER);
    bus.call(m).await.unwrap();
}

#[tokio::test]
async fn serials_are_monotone() {
    let (_service, client) = peer_pair();

    let m = || Message::signal("/test", "test.interface", "Tick");

    let first = client.send(m()).unwrap();
    let second = client.send(m()).unwrap();
    let third = client.send(m()).unwrap();

    assert!(first.get() >= 1);
    assert!(first < second);
    assert!(second < third);
}

#[tokio::test]
async fn echo_round_trip() {
    let (service, client) = peer_pair();
    service.export("/test/path", echo_interface()).unwrap();

    let reply = client
        .call(
            Message::method_call("/test/path", "Echo")
                .with_interface("test.interface")
                .with_body("s", vec![Value::from("hello")])
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.message_type(), MessageType::METHOD_RETURN);
    assert_eq!(reply.signature(), "s");
    assert_eq!(reply.body(), [Value::from("hello")]);

    let reply = client
        .call(
            Message::method_call("/test/path", "Add")
                .with_interface("test.interface")
                .with_body("ii", vec![Value::Int32(2), Value::Int32(40)])
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.body(), [Value::Int32(42)]);
}

#[tokio::test]
async fn member_lookup_without_interface() {
    let (service, client) = peer_pair();
    service.export("/test/path", echo_interface()).unwrap();

    let reply = client
        .call(
            Message::method_call("/test/path", "Echo")
                .with_body("s", vec![Value::from("anonymous")])
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.body(), [Value::from("anonymous")]);
}

#[tokio::test]
async fn unknown_member_is_an_error_reply() {
    let (service, client) = peer_pair();
    service.export("/test/path", echo_interface()).unwrap();

    let error = client
        .call(
            Message::method_call("/test/path", "Nope")
                .with_interface("test.interface"),
        )
        .await
        .unwrap_err();

    let remote = error.remote_error().unwrap();
    assert_eq!(remote.name(), fdo::error_name::UNKNOWN_METHOD);

    let error = client
        .call(
            Message::method_call("/test/path", "Echo")
                .with_interface("test.not.There"),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::UNKNOWN_INTERFACE,
    );

    let error = client
        .call(Message::method_call("/no/such/object", "Echo"))
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::UNKNOWN_OBJECT,
    );

    // Known member, wrong argument signature.
    let error = client
        .call(
            Message::method_call("/test/path", "Echo")
                .with_interface("test.interface")
                .with_body("i", vec![Value::Int32(1)])
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::INVALID_ARGS,
    );
}

#[tokio::test]
async fn handler_errors_become_error_replies() {
    let (service, client) = peer_pair();

    let interface = ServiceInterface::builder("test.interface")
        .unwrap()
        .method("Fail", "", "", |_| async move {
            Err(crate::DBusError::new(
                "org.freedesktop.DBus.Error.AccessDenied",
                "not yours",
            )
            .unwrap())
        })
        .unwrap()
        .build();

    service.export("/test/path", interface).unwrap();

    let error = client
        .call(
            Message::method_call("/test/path", "Fail").with_interface("test.interface"),
        )
        .await
        .unwrap_err();

    let remote = error.remote_error().unwrap();
    assert_eq!(remote.name(), fdo::error_name::ACCESS_DENIED);
    assert_eq!(remote.text(), "not yours");
}

#[tokio::test]
async fn no_reply_expected_creates_no_pending_reply() {
    let (_service, client) = peer_pair();

    let m = Message::method_call("/test/path", "Echo")
        .with_interface("test.interface")
        .with_flags(Flags::NO_REPLY_EXPECTED)
        .with_body("s", vec![Value::from("void")])
        .unwrap();

    let reply = client.call(m).await.unwrap();
    assert!(reply.is_none());
    assert!(client.inner().lock_state().replies.is_empty());
}

#[tokio::test]
async fn properties_set_emits_changed_exactly_once() {
    let (service, client) = peer_pair();

    let stored = Arc::new(Mutex::new(Value::Byte(105)));
    let for_get = stored.clone();
    let for_set = stored.clone();

    let interface = ServiceInterface::builder("test.interface")
        .unwrap()
        .writable_property(
            "Bar",
            "y",
            move || Ok(for_get.lock().unwrap().clone()),
            move |value| {
                let stored = for_set.clone();
                async move {
                    *stored.lock().unwrap() = value;
                    Ok(())
                }
            },
        )
        .unwrap()
        .build();

    service.export("/test/path", interface).unwrap();

    let changed = Arc::new(Mutex::new(Vec::new()));
    let seen = changed.clone();

    client.add_message_handler(move |message| {
        if message.member() == Some("PropertiesChanged") {
            seen.lock().unwrap().push(message.body().to_vec());
        }

        HandlerAction::Continue
    });

    let set = |value: u8| {
        Message::method_call("/test/path", "Set")
            .with_interface(fdo::PROPERTIES)
            .with_body(
                "ssv",
                vec![
                    Value::from("test.interface"),
                    Value::from("Bar"),
                    Value::from(Variant::new("y", Value::Byte(value)).unwrap()),
                ],
            )
            .unwrap()
    };

    client.call(set(42)).await.unwrap();
    ping(&client).await;

    {
        let changed = changed.lock().unwrap();
        assert_eq!(changed.len(), 1, "one PropertiesChanged for a real change");
        assert_eq!(changed[0][0], Value::from("test.interface"));
        assert_eq!(
            changed[0][1],
            Value::Dict(vec![(
                Value::from("Bar"),
                Value::from(Variant::new("y", Value::Byte(42)).unwrap()),
            )]),
        );
        assert_eq!(changed[0][2], Value::Array(vec![]));
    }

    // Setting the same value again changes nothing and stays silent.
    client.call(set(42)).await.unwrap();
    ping(&client).await;

    assert_eq!(changed.lock().unwrap().len(), 1);

    // Get reflects the write.
    let reply = client
        .call(
            Message::method_call("/test/path", "Get")
                .with_interface(fdo::PROPERTIES)
                .with_body(
                    "ss",
                    vec![Value::from("test.interface"), Value::from("Bar")],
                )
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        reply.body(),
        [Value::from(Variant::new("y", Value::Byte(42)).unwrap())],
    );

    // GetAll lists it as well.
    let reply = client
        .call(
            Message::method_call("/test/path", "GetAll")
                .with_interface(fdo::PROPERTIES)
                .with_body("s", vec![Value::from("test.interface")])
                .unwrap(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.signature(), "a{sv}");
}

#[tokio::test]
async fn property_access_is_enforced() {
    let (service, client) = peer_pair();

    let interface = ServiceInterface::builder("test.interface")
        .unwrap()
        .property("Fixed", "s", || Ok(Value::from("immutable")))
        .unwrap()
        .build();

    service.export("/test/path", interface).unwrap();

    let error = client
        .call(
            Message::method_call("/test/path", "Set")
                .with_interface(fdo::PROPERTIES)
                .with_body(
                    "ssv",
                    vec![
                        Value::from("test.interface"),
                        Value::from("Fixed"),
                        Value::from(Variant::new("s", Value::from("nope")).unwrap()),
                    ],
                )
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::PROPERTY_READ_ONLY,
    );

    let error = client
        .call(
            Message::method_call("/test/path", "Get")
                .with_interface(fdo::PROPERTIES)
                .with_body(
                    "ss",
                    vec![Value::from("test.interface"), Value::from("Missing")],
                )
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::UNKNOWN_PROPERTY,
    );
}

#[tokio::test]
async fn mistyped_property_write_is_invalid_args() {
    let (service, client) = peer_pair();

    let stored = Arc::new(Mutex::new(Value::Byte(1)));
    let for_get = stored.clone();
    let for_set = stored.clone();

    let interface = ServiceInterface::builder("test.interface")
        .unwrap()
        .writable_property(
            "Bar",
            "y",
            move || Ok(for_get.lock().unwrap().clone()),
            move |value| {
                let stored = for_set.clone();
                async move {
                    *stored.lock().unwrap() = value;
                    Ok(())
                }
            },
        )
        .unwrap()
        .build();

    service.export("/test/path", interface).unwrap();

    let error = client
        .call(
            Message::method_call("/test/path", "Set")
                .with_interface(fdo::PROPERTIES)
                .with_body(
                    "ssv",
                    vec![
                        Value::from("test.interface"),
                        Value::from("Bar"),
                        Value::from(Variant::new("s", Value::from("wrong")).unwrap()),
                    ],
                )
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::INVALID_ARGS,
    );
}

#[tokio::test]
async fn introspection_lists_interfaces_and_children() {
    let (service, client) = peer_pair();
    service.export("/test/path", echo_interface()).unwrap();
    service.export("/test/path/child", echo_interface()).unwrap();

    let xml = client
        .introspect("com.example.Peer", "/test/path")
        .await
        .unwrap();

    assert!(xml.starts_with("<!DOCTYPE node"));
    assert!(xml.contains("<interface name=\"test.interface\">"));
    assert!(xml.contains("<method name=\"Echo\">"));
    assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Properties\">"));
    assert!(xml.contains("<node name=\"child\"/>"));
}

#[tokio::test]
async fn managed_objects_cover_the_export_tree() {
    let (service, client) = peer_pair();
    service.export("/test/path", echo_interface()).unwrap();
    service.export("/test/path/child", echo_interface()).unwrap();

    let reply = client
        .call(
            Message::method_call("/test/path", "GetManagedObjects")
                .with_interface(fdo::OBJECT_MANAGER),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.signature(), "a{oa{sa{sv}}}");

    let Some(Value::Dict(objects)) = reply.body().first() else {
        panic!("expected a dict of objects");
    };

    assert_eq!(
        objects
            .iter()
            .map(|(path, _)| path.as_str().unwrap().to_owned())
            .collect::<Vec<_>>(),
        ["/test/path/child"],
    );
}

#[tokio::test]
async fn unix_fds_pass_through() {
    let (service, client) = peer_pair();

    let observed = Arc::new(Mutex::new(None));
    let sink = observed.clone();

    service.add_message_handler(move |message| {
        if message.message_type() == MessageType::METHOD_CALL
            && message.member() == Some("TakeFd")
        {
            *sink.lock().unwrap() =
                Some((message.signature().to_owned(), message.unix_fds().len()));
            return HandlerAction::Reply(Message::method_return(message));
        }

        HandlerAction::Continue
    });

    let mut pipe = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);

    let mut m = Message::method_call("/test/path", "TakeFd");
    let fd = m.push_fd(pipe[0]);
    let m = m.with_body("h", vec![fd]).unwrap();

    client.call(m).await.unwrap();

    let observed = observed.lock().unwrap().clone();
    assert_eq!(observed, Some(("h".to_owned(), 1)));

    unsafe {
        libc::close(pipe[0]);
        libc::close(pipe[1]);
    }
}

#[tokio::test]
async fn match_rules_are_refcounted() {
    let (a, b) = UnixStream::pair().unwrap();
    let bus = MessageBus::peer(a).unwrap();

    // A scripted peer recording every message the bus sends.
    let recorder = thread::spawn(move || {
        let mut stream = b;
        let mut unmarshaller = Unmarshaller::new();
        let mut fds = VecDeque::new();
        let mut members = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            match unmarshaller.take_message(&mut fds) {
                Ok(Some(message)) => {
                    members.push((
                        message.member().unwrap_or_default().to_owned(),
                        message.body().to_vec(),
                    ));
                    continue;
                }
                Ok(None) => {}
                Err(..) => break,
            }

            match stream.read(&mut buf) {
                Ok(0) | Err(..) => break,
                Ok(n) => unmarshaller.feed(&buf[..n]),
            }
        }

        members
    });

    let rule = MatchRule::signal()
        .with_interface("test.interface")
        .with_member("Echoed");

    bus.add_match(&rule).unwrap();
    bus.add_match(&rule).unwrap();
    bus.remove_match(&rule).unwrap();
    bus.remove_match(&rule).unwrap();
    // Balanced re-registration goes through the daemon again.
    bus.add_match(&rule).unwrap();
    bus.remove_match(&rule).unwrap();
    // Removing an unknown rule is a quiet no-op.
    bus.remove_match(&MatchRule::signal().with_member("Other")).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.disconnect();

    let members: Vec<_> = recorder.join().unwrap();
    let names: Vec<&str> = members.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["AddMatch", "RemoveMatch", "AddMatch", "RemoveMatch"]);

    let canonical = rule.canonical();

    for (_, body) in &members {
        assert_eq!(body, &[Value::String(canonical.clone())]);
    }
}

#[tokio::test]
async fn calls_time_out_and_late_replies_are_dropped() {
    let (a, _silent) = UnixStream::pair().unwrap();
    let bus = MessageBus::peer(a).unwrap();

    let error = bus
        .call_with_timeout(
            Message::method_call("/test/path", "Forever"),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert!(error.is_timed_out());
    assert!(bus.inner().lock_state().replies.is_empty());
}

#[tokio::test]
async fn disconnect_fails_outstanding_and_later_calls() {
    let (a, _silent) = UnixStream::pair().unwrap();
    let bus = MessageBus::peer(a).unwrap();

    let outstanding = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.call(Message::method_call("/test/path", "Forever")).await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;

    bus.disconnect();
    // Idempotent.
    bus.disconnect();

    let error = outstanding.await.unwrap().unwrap_err();
    assert!(error.is_disconnected());

    let error = bus
        .call(Message::method_call("/test/path", "After"))
        .await
        .unwrap_err();
    assert!(error.is_disconnected());

    let error = bus.send(Message::method_call("/test/path", "After")).unwrap_err();
    assert!(error.is_disconnected());

    bus.wait_for_disconnect().await.unwrap();
}

#[tokio::test]
async fn peer_hangup_propagates_as_disconnect() {
    let (a, b) = UnixStream::pair().unwrap();
    let bus = MessageBus::peer(a).unwrap();

    drop(b);

    assert!(bus.wait_for_disconnect().await.is_err());

    let error = bus
        .call(Message::method_call("/test/path", "After"))
        .await
        .unwrap_err();
    assert!(error.is_disconnected());
}

fn proxy_node() -> Node {
    Node::new().with_interface(
        introspect::Interface::new("test.interface")
            .unwrap()
            .with_method(
                introspect::Method::new(
                    "Echo",
                    vec![
                        Arg::new("s", ArgDirection::In).unwrap(),
                        Arg::new("s", ArgDirection::Out).unwrap(),
                    ],
                )
                .unwrap(),
            )
            .with_method(
                introspect::Method::new(
                    "Add",
                    vec![
                        Arg::new("i", ArgDirection::In).unwrap(),
                        Arg::new("i", ArgDirection::In).unwrap(),
                        Arg::new("i", ArgDirection::Out).unwrap(),
                    ],
                )
                .unwrap(),
            )
            .with_signal(
                introspect::Signal::new("Echoed", vec![Arg::new("s", ArgDirection::Out).unwrap()])
                    .unwrap(),
            )
            .with_property(
                introspect::Property::new("Bar", "y", PropertyAccess::ReadWrite).unwrap(),
            ),
    )
}

#[tokio::test]
async fn proxy_calls_and_checks_signatures_locally() {
    let (service, client) = peer_pair();
    service.export("/test/path", echo_interface()).unwrap();

    let proxy = client
        .get_proxy_object("com.example.Svc", "/test/path", proxy_node())
        .unwrap();
    let interface = proxy.interface("test.interface").unwrap();

    let out = interface
        .call("Echo", vec![Value::from("hi")])
        .await
        .unwrap();
    assert_eq!(out, [Value::from("hi")]);

    let out = interface
        .call("Add", vec![Value::Int32(20), Value::Int32(22)])
        .await
        .unwrap();
    assert_eq!(out, [Value::Int32(42)]);

    // A body that does not match the declared input signature fails before
    // anything is sent.
    let error = interface
        .call("Add", vec![Value::from("x"), Value::from("y")])
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind(),
        ErrorKind::SignatureBodyMismatch(..)
    ));
    assert!(client.inner().lock_state().replies.is_empty());

    let error = interface.call("Absent", vec![]).await.unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::MemberNotFound(..)));
}

#[tokio::test]
async fn proxy_signals_subscribe_and_unsubscribe() {
    let (service, client) = peer_pair();
    let interface = echo_interface();
    service.export("/test/path", interface.clone()).unwrap();

    let proxy = client
        .get_proxy_object("com.example.Svc", "/test/path", proxy_node())
        .unwrap();
    let proxy_interface = proxy.interface("test.interface").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let token = proxy_interface
        .on_signal("Echoed", move |body| {
            sink.lock().unwrap().push(body.to_vec());
        })
        .unwrap();

    service
        .emit_signal(&interface, "Echoed", vec![Value::from("one")])
        .unwrap();
    ping(&client).await;

    assert_eq!(received.lock().unwrap().as_slice(), [vec![Value::from("one")]]);

    proxy_interface.off_signal(token).unwrap();

    service
        .emit_signal(&interface, "Echoed", vec![Value::from("two")])
        .unwrap();
    ping(&client).await;

    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn proxy_properties() {
    let (service, client) = peer_pair();

    let stored = Arc::new(Mutex::new(Value::Byte(105)));
    let for_get = stored.clone();
    let for_set = stored.clone();

    let interface = ServiceInterface::builder("test.interface")
        .unwrap()
        .writable_property(
            "Bar",
            "y",
            move || Ok(for_get.lock().unwrap().clone()),
            move |value| {
                let stored = for_set.clone();
                async move {
                    *stored.lock().unwrap() = value;
                    Ok(())
                }
            },
        )
        .unwrap()
        .build();

    service.export("/test/path", interface).unwrap();

    let proxy = client
        .get_proxy_object("com.example.Svc", "/test/path", proxy_node())
        .unwrap();
    let proxy_interface = proxy.interface("test.interface").unwrap();

    assert_eq!(
        proxy_interface.get_property("Bar").await.unwrap(),
        Value::Byte(105),
    );

    proxy_interface
        .set_property("Bar", Value::Byte(42))
        .await
        .unwrap();

    assert_eq!(
        proxy_interface.get_property("Bar").await.unwrap(),
        Value::Byte(42),
    );

    // A mistyped value fails locally.
    let error = proxy_interface
        .set_property("Bar", Value::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind(),
        ErrorKind::SignatureBodyMismatch(..)
    ));
}

#[tokio::test]
async fn emitting_signals_requires_a_declaration() {
    let (service, _client) = peer_pair();
    let interface = echo_interface();
    service.export("/test/path", interface.clone()).unwrap();

    let error = service
        .emit_signal(&interface, "Undeclared", vec![])
        .unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::MemberNotFound(..)));

    let error = service
        .emit_signal(&interface, "Echoed", vec![Value::Int32(1)])
        .unwrap_err();
    assert!(matches!(
        error.kind(),
        ErrorKind::SignatureBodyMismatch(..)
    ));

    let disabled = ServiceInterface::builder("test.disabled")
        .unwrap()
        .signal("Hidden", "")
        .unwrap()
        .disabled()
        .build();

    service.export("/test/other", disabled.clone()).unwrap();

    let error = service.emit_signal(&disabled, "Hidden", vec![]).unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::SignalDisabled(..)));
}

#[tokio::test]
async fn exporting_twice_fails_and_unexport_removes() {
    let (service, client) = peer_pair();
    let interface = echo_interface();

    service.export("/test/path", interface.clone()).unwrap();

    let error = service.export("/test/path", interface.clone()).unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::AlreadyExported(..)));

    service.unexport("/test/path").unwrap();

    let error = client
        .call(
            Message::method_call("/test/path", "Echo")
                .with_interface("test.interface")
                .with_body("s", vec![Value::from("gone")])
                .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.remote_error().unwrap().name(),
        fdo::error_name::UNKNOWN_OBJECT,
    );
}

/// The scripted daemon side of a full `connect()`: SASL, `Hello`, and the
/// `NameOwnerChanged` match registration.
fn scripted_daemon(listener: UnixListener) -> thread::JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        // SASL exchange up to BEGIN.
        let mut nul = [0u8; 1];
        stream.read_exact(&mut nul).unwrap();
        assert_eq!(nul, [0]);

        let mut line = Vec::new();

        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).unwrap();
            line.push(byte[0]);

            if !line.ends_with(b"\r\n") {
                continue;
            }

            let text = String::from_utf8(line.split_off(0)).unwrap();

            if text.starts_with("AUTH") {
                stream
                    .write_all(b"OK 6871a0ef4a1a5f17769c8d3c5d5d0c99\r\n")
                    .unwrap();
            } else if text.trim_end() == "BEGIN" {
                break;
            }
        }

        // Message phase.
        let mut unmarshaller = Unmarshaller::new();
        let mut fds = VecDeque::new();
        let mut members = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let message = loop {
                if let Some(message) = unmarshaller.take_message(&mut fds).unwrap() {
                    break Some(message);
                }

                match stream.read(&mut buf) {
                    Ok(0) | Err(..) => break None,
                    Ok(n) => unmarshaller.feed(&buf[..n]),
                }
            };

            let Some(message) = message else {
                break;
            };

            members.push(message.member().unwrap_or_default().to_owned());

            if message.member() == Some("Hello") {
                let mut reply = Message::method_return(&message)
                    .with_body("s", vec![Value::from(":1.42")])
                    .unwrap()
                    .with_serial(std::num::NonZeroU32::new(1).unwrap());
                reply.sender = Some(fdo::DESTINATION.to_owned());
                reply.destination = Some(":1.42".to_owned());

                stream.write_all(&marshal_message(&reply).unwrap()).unwrap();
            }

            if members.len() == 2 {
                break;
            }
        }

        members
    })
}

#[tokio::test]
async fn connect_authenticates_and_says_hello() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("minibus-test-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path).unwrap();
    let daemon = scripted_daemon(listener);

    let bus = MessageBusBuilder::new()
        .address(&format!("unix:path={}", path.display()))
        .connect()
        .await
        .unwrap();

    assert_eq!(bus.unique_name(), Some(":1.42".to_owned()));

    let members = daemon.join().unwrap();
    assert_eq!(members, ["Hello", "AddMatch"]);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn guid_mismatch_fails_the_connection() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("minibus-guid-test-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path).unwrap();
    let daemon = scripted_daemon(listener);

    let error = MessageBusBuilder::new()
        .address(&format!(
            "unix:path={},guid=00000000000000000000000000000000",
            path.display(),
        ))
        .connect()
        .await
        .unwrap_err();

    assert!(matches!(error.kind(), ErrorKind::AuthFailed(..)));

    drop(daemon);
    let _ = std::fs::remove_file(&path);
}
