//! Connection-oriented end-to-end scenarios: echo, graceful shutdown,
//! abort, partial reads and peek.

use sctp_socketapi as sctp;

use sctp::api::types::{Linger, SocketOption};
use sctp::{SctpEventSubscribe, SocketAddress, MSG_EOR, MSG_NOTIFICATION, MSG_PEEK};

use std::thread;
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stream_socket() -> i32 {
    sctp::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_SCTP).expect("socket")
}

/// Binds to 127.0.0.1 with an ephemeral port and returns (fd, port).
fn bound_server() -> (i32, u16) {
    let fd = stream_socket();
    let local = SocketAddress::parse("127.0.0.1", 0).unwrap();
    sctp::bind(fd, &local).expect("bind");
    let port = sctp::getsockname(fd).expect("getsockname").port();
    assert_ne!(port, 0, "bound port must be known");
    (fd, port)
}

#[test]
fn test_echo_connection_oriented() {
    init();
    let (server, port) = bound_server();
    sctp::listen(server, 10).expect("listen");

    let client_side = thread::spawn(move || {
        let client = stream_socket();
        let remote = SocketAddress::parse("127.0.0.1", port).unwrap();
        sctp::connect(client, &remote).expect("connect");
        let sent = sctp::send(client, b"Hello", 0).expect("send");
        assert_eq!(sent, 5);
        let mut buf = [0u8; 64];
        let got = sctp::recv(client, &mut buf, 0).expect("recv");
        assert_eq!(&buf[..got], b"Hello", "echo must match");
        sctp::close(client).expect("close");
    });

    let (connection, peers) = sctp::accept(server).expect("accept");
    assert!(!peers.is_empty(), "accept must report the peer address");
    assert_ne!(peers[0].port(), 0);

    let mut buf = [0u8; 64];
    let got = sctp::recv(connection, &mut buf, 0).expect("server recv");
    assert_eq!(&buf[..got], b"Hello");
    let sent = sctp::send(connection, &buf[..got], 0).expect("server send");
    assert_eq!(sent, 5);

    client_side.join().unwrap();
    sctp::close(connection).expect("close connection");
    sctp::close(server).expect("close server");
}

#[test]
fn test_graceful_shutdown_drains_then_eof() {
    init();
    let (server, port) = bound_server();
    sctp::listen(server, 10).expect("listen");

    let client_side = thread::spawn(move || {
        let client = stream_socket();
        let remote = SocketAddress::parse("127.0.0.1", port).unwrap();
        sctp::connect(client, &remote).expect("connect");
        for i in 0..100u32 {
            let message = format!("message {i}");
            sctp::send(client, message.as_bytes(), 0).expect("send");
        }
        sctp::shutdown(client, libc::SHUT_WR).expect("shutdown");
        // Leave the descriptor open long enough for the handshake.
        thread::sleep(Duration::from_millis(500));
        sctp::close(client).expect("close");
    });

    let (connection, _) = sctp::accept(server).expect("accept");
    let mut buf = [0u8; 256];
    for i in 0..100u32 {
        let got = sctp::recv(connection, &mut buf, 0).expect("recv");
        assert_eq!(
            std::str::from_utf8(&buf[..got]).unwrap(),
            format!("message {i}"),
            "messages must arrive in order"
        );
    }
    let got = sctp::recv(connection, &mut buf, 0).expect("recv at end");
    assert_eq!(got, 0, "shutdown drains the queue, then reads return EOF");

    client_side.join().unwrap();
    sctp::close(connection).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_shutdown_event_notification_when_subscribed() {
    init();
    let (server, port) = bound_server();
    sctp::listen(server, 10).expect("listen");

    let client_side = thread::spawn(move || {
        let client = stream_socket();
        let remote = SocketAddress::parse("127.0.0.1", port).unwrap();
        sctp::connect(client, &remote).expect("connect");
        sctp::send(client, b"bye", 0).expect("send");
        // Give the receiver time to subscribe before the shutdown event is
        // generated; the mask is evaluated at enqueue time.
        thread::sleep(Duration::from_millis(300));
        sctp::shutdown(client, libc::SHUT_WR).expect("shutdown");
        thread::sleep(Duration::from_millis(500));
        sctp::close(client).expect("close");
    });

    let (connection, _) = sctp::accept(server).expect("accept");
    let events = SctpEventSubscribe {
        shutdown_event: true,
        ..SctpEventSubscribe::default()
    };
    sctp::setsockopt(connection, SocketOption::SctpEvents(events)).expect("subscribe");

    let mut buf = [0u8; 256];
    let (got, _, _, flags) = sctp::sctp_recvmsg(connection, &mut buf, 0).expect("data");
    assert_eq!(&buf[..got], b"bye");
    assert_eq!(flags & MSG_NOTIFICATION, 0);

    let (_, _, _, flags) = sctp::sctp_recvmsg(connection, &mut buf, 0).expect("notification");
    assert_ne!(
        flags & MSG_NOTIFICATION,
        0,
        "subscribed shutdown event arrives as a notification"
    );

    let got = sctp::recv(connection, &mut buf, 0).expect("eof");
    assert_eq!(got, 0);

    client_side.join().unwrap();
    sctp::close(connection).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_abort_yields_connection_aborted() {
    init();
    let (server, port) = bound_server();
    sctp::listen(server, 10).expect("listen");

    let client_side = thread::spawn(move || {
        let client = stream_socket();
        let remote = SocketAddress::parse("127.0.0.1", port).unwrap();
        sctp::connect(client, &remote).expect("connect");
        sctp::send(client, b"only one", 0).expect("send");
        thread::sleep(Duration::from_millis(300));
        // Zero linger: close aborts instead of shutting down.
        let linger = Linger {
            onoff: true,
            seconds: 0,
        };
        sctp::setsockopt(client, SocketOption::Linger(linger)).expect("linger");
        sctp::close(client).expect("close");
    });

    let (connection, _) = sctp::accept(server).expect("accept");
    let mut buf = [0u8; 64];
    let got = sctp::recv(connection, &mut buf, 0).expect("first recv");
    assert_eq!(&buf[..got], b"only one");

    let err = sctp::recv(connection, &mut buf, 0).expect_err("second recv must fail");
    assert_eq!(err, sctp::Error::ErrConnectionAborted);
    assert_eq!(err.errno(), libc::ECONNABORTED);

    client_side.join().unwrap();
    sctp::close(connection).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_partial_receive_and_message_boundary() {
    init();
    let (server, port) = bound_server();
    sctp::listen(server, 10).expect("listen");

    let client_side = thread::spawn(move || {
        let client = stream_socket();
        let remote = SocketAddress::parse("127.0.0.1", port).unwrap();
        sctp::connect(client, &remote).expect("connect");
        let message = vec![0x42u8; 10000];
        sctp::send(client, &message, 0).expect("send");
        thread::sleep(Duration::from_millis(500));
        sctp::close(client).expect("close");
    });

    let (connection, _) = sctp::accept(server).expect("accept");
    let mut buf = [0u8; 4096];

    let (got, _, _, flags) = sctp::sctp_recvmsg(connection, &mut buf, 0).expect("read 1");
    assert_eq!(got, 4096);
    assert_eq!(flags & MSG_EOR, 0, "message continues");

    let (got, _, _, flags) = sctp::sctp_recvmsg(connection, &mut buf, 0).expect("read 2");
    assert_eq!(got, 4096);
    assert_eq!(flags & MSG_EOR, 0, "message still continues");

    let (got, _, _, flags) = sctp::sctp_recvmsg(connection, &mut buf, 0).expect("read 3");
    assert_eq!(got, 1808);
    assert_ne!(flags & MSG_EOR, 0, "end of message");

    client_side.join().unwrap();
    sctp::close(connection).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_peek_matches_following_read() {
    init();
    let (server, port) = bound_server();
    sctp::listen(server, 10).expect("listen");

    let client_side = thread::spawn(move || {
        let client = stream_socket();
        let remote = SocketAddress::parse("127.0.0.1", port).unwrap();
        sctp::connect(client, &remote).expect("connect");
        sctp::send(client, b"peekaboo", 0).expect("send");
        thread::sleep(Duration::from_millis(500));
        sctp::close(client).expect("close");
    });

    let (connection, _) = sctp::accept(server).expect("accept");
    let mut peeked = [0u8; 64];
    let n1 = sctp::recv(connection, &mut peeked, MSG_PEEK).expect("peek");
    let mut read = [0u8; 64];
    let n2 = sctp::recv(connection, &mut read, 0).expect("read");
    assert_eq!(n1, n2);
    assert_eq!(&peeked[..n1], &read[..n2], "peek must not consume");

    client_side.join().unwrap();
    sctp::close(connection).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_send_on_closed_descriptor_fails() {
    init();
    let fd = stream_socket();
    sctp::close(fd).expect("close");
    let err = sctp::send(fd, b"x", 0).expect_err("send after close");
    assert_eq!(err, sctp::Error::ErrBadDescriptor);
    assert_eq!(err.errno(), libc::EBADF);
}

#[test]
fn test_connect_to_nobody_fails() {
    init();
    let client = stream_socket();
    // Shrink the init timeout so the failure is quick.
    let initmsg = sctp::SctpInitMsg {
        max_attempts: 2,
        max_init_timeo: 50,
        ..sctp::SctpInitMsg::default()
    };
    sctp::setsockopt(client, SocketOption::SctpInitMsg(initmsg)).expect("initmsg");
    let remote = SocketAddress::parse("127.0.0.1", 9).unwrap();
    let err = sctp::connect(client, &remote).expect_err("nobody listens on port 9");
    assert_eq!(err, sctp::Error::ErrIo);
    sctp::close(client).expect("close");
}
