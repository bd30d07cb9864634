//! select/poll composition and socket-option round trips.

use sctp_socketapi as sctp;

use sctp::api::types::{Linger, OptName, SocketOption};
use sctp::{BindxFlags, PollFd, SctpInitMsg, SocketAddress};

use std::thread;
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stream_socket() -> i32 {
    sctp::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_SCTP).expect("socket")
}

fn seqpacket_socket() -> i32 {
    sctp::socket(libc::AF_INET, libc::SOCK_SEQPACKET, libc::IPPROTO_SCTP).expect("socket")
}

fn bound(fd: i32) -> u16 {
    let local = SocketAddress::parse("127.0.0.1", 0).unwrap();
    sctp::bind(fd, &local).expect("bind");
    sctp::getsockname(fd).expect("getsockname").port()
}

#[test]
fn test_select_times_out_on_idle_socket() {
    init();
    let fd = seqpacket_socket();
    bound(fd);
    sctp::listen(fd, 1).expect("listen");

    let result = sctp::select(&[fd], &[], &[], Some(Duration::from_millis(50))).expect("select");
    assert_eq!(result.count(), 0, "nothing is readable yet");
    sctp::close(fd).expect("close");
}

#[test]
fn test_select_reports_readable_sctp_socket() {
    init();
    let server = seqpacket_socket();
    let port = bound(server);
    sctp::listen(server, 1).expect("listen");

    let client = seqpacket_socket();
    let destination = SocketAddress::parse("127.0.0.1", port).unwrap();
    sctp::sendto(client, b"wake up", 0, Some(&destination)).expect("sendto");

    let result =
        sctp::select(&[server], &[], &[], Some(Duration::from_secs(5))).expect("select");
    assert!(
        result.read.contains(&server),
        "socket with queued data must select readable"
    );

    let mut buf = [0u8; 64];
    let (got, _) = sctp::recvfrom(server, &mut buf, 0).expect("recvfrom");
    assert_eq!(&buf[..got], b"wake up");

    sctp::close(client).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_select_connectionless_always_writable() {
    init();
    let fd = seqpacket_socket();
    bound(fd);
    let result = sctp::select(&[], &[fd], &[], Some(Duration::from_millis(100))).expect("select");
    assert!(
        result.write.contains(&fd),
        "a connectionless socket is always writable"
    );
    sctp::close(fd).expect("close");
}

#[test]
fn test_select_composes_system_descriptors() {
    init();
    // Make sure the engine thread runs, so the composed path is exercised.
    let sctp_fd = seqpacket_socket();
    bound(sctp_fd);

    let receiver = sctp::socket(libc::AF_INET, libc::SOCK_DGRAM, 0).expect("udp socket");
    let local = SocketAddress::parse("127.0.0.1", 0).unwrap();
    sctp::bind(receiver, &local).expect("bind");
    let port = sctp::getsockname(receiver).expect("getsockname").port();

    let sender = sctp::socket(libc::AF_INET, libc::SOCK_DGRAM, 0).expect("udp socket");
    let destination = SocketAddress::parse("127.0.0.1", port).unwrap();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        sctp::sendto(sender, b"ding", 0, Some(&destination)).expect("udp sendto");
        sender
    });

    let result = sctp::select(&[receiver, sctp_fd], &[], &[], Some(Duration::from_secs(5)))
        .expect("select");
    assert!(
        result.read.contains(&receiver),
        "system descriptor readiness must flow through the event loop"
    );

    let mut buf = [0u8; 16];
    let (got, _) = sctp::recvfrom(receiver, &mut buf, 0).expect("udp recv");
    assert_eq!(&buf[..got], b"ding");

    let sender = writer.join().unwrap();
    sctp::close(sender).expect("close");
    sctp::close(receiver).expect("close");
    sctp::close(sctp_fd).expect("close");
}

#[test]
fn test_poll_maps_select_results() {
    init();
    let server = seqpacket_socket();
    let port = bound(server);
    sctp::listen(server, 1).expect("listen");
    let client = seqpacket_socket();
    let destination = SocketAddress::parse("127.0.0.1", port).unwrap();
    sctp::sendto(client, b"poll me", 0, Some(&destination)).expect("sendto");

    let mut fds = [PollFd {
        fd: server,
        events: libc::POLLIN,
        revents: 0,
    }];
    let changed = sctp::poll(&mut fds, 5000).expect("poll");
    assert_eq!(changed, 1);
    assert_ne!(fds[0].revents & libc::POLLIN, 0);

    let mut empty: [PollFd; 0] = [];
    assert_eq!(sctp::poll(&mut empty, 0).expect("empty poll"), 0);

    sctp::close(client).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_option_round_trips() {
    init();
    let fd = stream_socket();

    let initmsg = SctpInitMsg {
        num_ostreams: 6,
        max_instreams: 4,
        max_attempts: 3,
        max_init_timeo: 2000,
    };
    sctp::setsockopt(fd, SocketOption::SctpInitMsg(initmsg.clone())).expect("set initmsg");
    assert_eq!(
        sctp::getsockopt(fd, OptName::SctpInitMsg).expect("get initmsg"),
        SocketOption::SctpInitMsg(initmsg)
    );

    let linger = Linger {
        onoff: true,
        seconds: 7,
    };
    sctp::setsockopt(fd, SocketOption::Linger(linger)).expect("set linger");
    assert_eq!(
        sctp::getsockopt(fd, OptName::Linger).expect("get linger"),
        SocketOption::Linger(linger)
    );

    sctp::setsockopt(fd, SocketOption::SctpAutoclose(120)).expect("set autoclose");
    assert_eq!(
        sctp::getsockopt(fd, OptName::SctpAutoclose).expect("get autoclose"),
        SocketOption::SctpAutoclose(120)
    );

    sctp::setsockopt(fd, SocketOption::IpTos(0x10)).expect("set tos");
    assert_eq!(
        sctp::getsockopt(fd, OptName::IpTos).expect("get tos"),
        SocketOption::IpTos(0x10)
    );

    sctp::setsockopt(fd, SocketOption::SendBuffer(131072)).expect("set sndbuf");
    assert_eq!(
        sctp::getsockopt(fd, OptName::SendBuffer).expect("get sndbuf"),
        SocketOption::SendBuffer(131072)
    );
    sctp::setsockopt(fd, SocketOption::ReceiveBuffer(65536)).expect("set rcvbuf");
    assert_eq!(
        sctp::getsockopt(fd, OptName::ReceiveBuffer).expect("get rcvbuf"),
        SocketOption::ReceiveBuffer(65536)
    );

    sctp::setsockopt(fd, SocketOption::Ipv6FlowInfo(0x12345)).expect("set flowinfo");
    assert_eq!(
        sctp::getsockopt(fd, OptName::Ipv6FlowInfo).expect("get flowinfo"),
        SocketOption::Ipv6FlowInfo(0x12345)
    );

    sctp::close(fd).expect("close");
}

#[test]
fn test_rto_info_round_trip_on_bound_socket() {
    init();
    let fd = stream_socket();
    bound(fd);

    let rto = sctp::api::types::SctpRtoInfo {
        assoc_id: 0,
        initial: 1500,
        max: 20000,
        min: 500,
    };
    sctp::setsockopt(fd, SocketOption::SctpRtoInfo(rto)).expect("set rtoinfo");
    match sctp::getsockopt(fd, OptName::SctpRtoInfo).expect("get rtoinfo") {
        SocketOption::SctpRtoInfo(read) => {
            assert_eq!(read.initial, 1500);
            assert_eq!(read.max, 20000);
            assert_eq!(read.min, 500);
        }
        other => panic!("unexpected option {other:?}"),
    }
    sctp::close(fd).expect("close");
}

#[test]
fn test_bindx_add_remove_round_trip() {
    init();
    let fd = stream_socket();
    bound(fd);

    let before = sctp::sctp_getladdrs(fd, 0).expect("local addresses");
    let extra = SocketAddress::parse("127.0.0.2", before[0].port()).unwrap();

    sctp::bindx(fd, std::slice::from_ref(&extra), BindxFlags::AddAddr).expect("bindx add");
    let during = sctp::sctp_getladdrs(fd, 0).expect("local addresses");
    assert_eq!(during.len(), before.len() + 1);

    sctp::bindx(fd, std::slice::from_ref(&extra), BindxFlags::RemAddr).expect("bindx rem");
    let after = sctp::sctp_getladdrs(fd, 0).expect("local addresses");
    assert_eq!(after, before, "bindx REM restores the pre-bindx address set");

    sctp::close(fd).expect("close");
}

#[test]
fn test_fcntl_nonblocking_recv_returns_again() {
    init();
    let fd = seqpacket_socket();
    bound(fd);
    sctp::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK).expect("set nonblocking");
    assert_eq!(
        sctp::fcntl(fd, libc::F_GETFL, 0).expect("get flags"),
        libc::O_NONBLOCK
    );

    let mut buf = [0u8; 16];
    let err = sctp::recvfrom(fd, &mut buf, 0).expect_err("nothing to read");
    assert_eq!(err, sctp::Error::ErrAgain);
    assert_eq!(err.errno(), libc::EAGAIN);
    sctp::close(fd).expect("close");
}
