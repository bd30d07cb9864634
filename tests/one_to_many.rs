//! Connectionless (one-to-many) end-to-end scenarios: global-queue echo,
//! association reuse, peel-off and idle auto-close.

use sctp_socketapi as sctp;

use sctp::api::types::SocketOption;
use sctp::descriptor::{Descriptor, DescriptorTable};
use sctp::master::SocketMaster;
use sctp::{PeelOffTarget, SctpEventSubscribe, SocketAddress};

use std::thread;
use std::time::{Duration, Instant};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn seqpacket_socket() -> i32 {
    sctp::socket(libc::AF_INET, libc::SOCK_SEQPACKET, libc::IPPROTO_SCTP).expect("socket")
}

fn bound(fd: i32) -> u16 {
    let local = SocketAddress::parse("127.0.0.1", 0).unwrap();
    sctp::bind(fd, &local).expect("bind");
    sctp::getsockname(fd).expect("getsockname").port()
}

fn socket_id_of(fd: i32) -> sctp::master::SocketId {
    let guard = DescriptorTable::global();
    match guard.as_ref().unwrap().lookup(fd) {
        Some(Descriptor::Sctp(desc)) => desc.socket_id,
        _ => panic!("fd {fd} is not an SCTP descriptor"),
    }
}

#[test]
fn test_echo_connectionless_global_queue() {
    init();
    let server = seqpacket_socket();
    let server_port = bound(server);
    sctp::listen(server, 1).expect("listen");

    let server_side = thread::spawn(move || {
        let mut buf = [0u8; 256];
        let (got, peer) = sctp::recvfrom(server, &mut buf, 0).expect("recvfrom");
        assert_eq!(&buf[..got], b"Test #1");
        let peer = peer.expect("sender address must be reported");
        assert_ne!(peer.port(), 0, "peer port is the client's ephemeral port");
        let reply = b"Re> Test #1";
        sctp::sendto(server, reply, 0, Some(&peer)).expect("reply");
        sctp::close(server).expect("close server");
    });

    let client = seqpacket_socket();
    let destination = SocketAddress::parse("127.0.0.1", server_port).unwrap();
    sctp::sendto(client, b"Test #1", 0, Some(&destination)).expect("sendto");
    let mut buf = [0u8; 256];
    let (got, from) = sctp::recvfrom(client, &mut buf, 0).expect("client recvfrom");
    assert_eq!(&buf[..got], b"Re> Test #1");
    assert_eq!(from.map(|a| a.port()), Some(server_port));

    server_side.join().unwrap();
    sctp::close(client).expect("close client");
}

#[test]
fn test_sendto_reuses_association() {
    init();
    let server = seqpacket_socket();
    let server_port = bound(server);
    sctp::listen(server, 1).expect("listen");
    let client = seqpacket_socket();
    let destination = SocketAddress::parse("127.0.0.1", server_port).unwrap();

    sctp::sendto(client, b"one", 0, Some(&destination)).expect("first sendto");
    sctp::sendto(client, b"two", 0, Some(&destination)).expect("second sendto");

    let master = SocketMaster::instance().unwrap();
    let socket_id = socket_id_of(client);
    let count = master.with_state(|state| state.sockets[&socket_id].connectionless.len());
    assert_eq!(count, 1, "same destination must reuse the association");

    let mut buf = [0u8; 64];
    let (_, from1) = sctp::recvfrom(server, &mut buf, 0).expect("recv one");
    let (_, from2) = sctp::recvfrom(server, &mut buf, 0).expect("recv two");
    assert_eq!(from1, from2, "both messages come from one association");

    sctp::close(client).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_peel_off_detaches_association() {
    init();
    let server = seqpacket_socket();
    let server_port = bound(server);
    sctp::listen(server, 1).expect("listen");
    let events = SctpEventSubscribe {
        data_io_event: true,
        ..SctpEventSubscribe::default()
    };
    sctp::setsockopt(server, SocketOption::SctpEvents(events)).expect("events");

    let destination = SocketAddress::parse("127.0.0.1", server_port).unwrap();
    let client1 = seqpacket_socket();
    let client2 = seqpacket_socket();
    sctp::sendto(client1, b"from c1", 0, Some(&destination)).expect("c1 sendto");
    sctp::sendto(client2, b"from c2", 0, Some(&destination)).expect("c2 sendto");

    // Collect both messages and learn the association ids.
    let mut c1_assoc = 0;
    let mut buf = [0u8; 256];
    for _ in 0..2 {
        let (got, _, info, _) = sctp::sctp_recvmsg(server, &mut buf, 0).expect("recv");
        let info = info.expect("data-io event gives side information");
        if &buf[..got] == b"from c1" {
            c1_assoc = info.assoc_id;
        }
    }
    assert_ne!(c1_assoc, 0, "c1's association id must be known");

    let peeled = sctp::sctp_peeloff(server, PeelOffTarget::Association(c1_assoc)).expect("peeloff");

    // Traffic from c1 now lands only on the peeled descriptor.
    sctp::sendto(client1, b"more from c1", 0, Some(&destination)).expect("c1 again");
    let got = sctp::recv(peeled, &mut buf, 0).expect("peeled recv");
    assert_eq!(&buf[..got], b"more from c1");

    // The peeled descriptor sends towards c1 only.
    sctp::send(peeled, b"to c1", 0).expect("peeled send");
    let (got, _) = sctp::recvfrom(client1, &mut buf, 0).expect("c1 recv");
    assert_eq!(&buf[..got], b"to c1");

    // The original socket still serves c2.
    sctp::sendto(client2, b"still c2", 0, Some(&destination)).expect("c2 again");
    let (got, _) = sctp::recvfrom(server, &mut buf, 0).expect("server recv");
    assert_eq!(&buf[..got], b"still c2");

    sctp::close(peeled).expect("close peeled");
    sctp::close(client1).expect("close c1");
    sctp::close(client2).expect("close c2");
    sctp::close(server).expect("close server");
}

#[test]
fn test_auto_close_reaps_idle_association() {
    init();
    let server = seqpacket_socket();
    let server_port = bound(server);
    sctp::listen(server, 1).expect("listen");
    let client = seqpacket_socket();
    sctp::setsockopt(client, SocketOption::SctpAutoclose(1)).expect("autoclose");

    let destination = SocketAddress::parse("127.0.0.1", server_port).unwrap();
    sctp::sendto(client, b"ping", 0, Some(&destination)).expect("sendto");

    let master = SocketMaster::instance().unwrap();
    let socket_id = socket_id_of(client);
    let live = master.with_state(|state| state.sockets[&socket_id].connectionless.len());
    assert_eq!(live, 1);

    // The garbage collector shuts the idle association down and reaps it.
    let deadline = Instant::now() + Duration::from_secs(6);
    loop {
        let live = master.with_state(|state| state.sockets[&socket_id].connectionless.len());
        if live == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "idle association must be auto-closed"
        );
        thread::sleep(Duration::from_millis(200));
    }

    sctp::close(client).expect("close");
    sctp::close(server).expect("close");
}

#[test]
fn test_close_invalidates_descriptor() {
    init();
    let fd = seqpacket_socket();
    let socket_id = socket_id_of(fd);
    sctp::close(fd).expect("close");
    {
        let guard = DescriptorTable::global();
        assert!(
            guard.as_ref().unwrap().lookup(fd).is_none(),
            "slot must be invalid after close"
        );
    }
    let master = SocketMaster::instance().unwrap();
    let gone = master.with_state(|state| !state.sockets.contains_key(&socket_id));
    assert!(gone, "socket must leave the arena on close");
}

#[test]
fn test_instance_registry_uniqueness() {
    init();
    let a = seqpacket_socket();
    let b = seqpacket_socket();
    bound(a);
    bound(b);

    let master = SocketMaster::instance().unwrap();
    let (id_a, id_b) = (socket_id_of(a), socket_id_of(b));
    master.with_state(|state| {
        let hits_a = state
            .instance_registry
            .values()
            .filter(|s| **s == id_a)
            .count();
        let hits_b = state
            .instance_registry
            .values()
            .filter(|s| **s == id_b)
            .count();
        assert_eq!(hits_a, 1, "each bound socket appears at exactly one key");
        assert_eq!(hits_b, 1);
    });

    sctp::close(a).expect("close");
    sctp::close(b).expect("close");
}
