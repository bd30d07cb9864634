use super::packet::{Chunk, Packet};
use super::*;
use crate::address::SocketAddress;
use crate::error::Result;

use bytes::Bytes;
use std::time::{Duration, Instant};

fn local(port: u16) -> Vec<SocketAddress> {
    vec![SocketAddress::parse("127.0.0.1", port).unwrap()]
}

/// Drains engine IO until `pred` matches an event or the timeout elapses.
fn pump_until(
    engine: &mut DatagramEngine,
    waiter: &mut Box<dyn EngineWaiter>,
    collected: &mut Vec<Event>,
    pred: impl Fn(&Event) -> bool,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if collected.iter().any(&pred) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        let ready = waiter.wait(Some(Duration::from_millis(20)));
        let mut out = Vec::new();
        engine.drive(&ready, &mut out);
        collected.append(&mut out);
    }
}

#[test]
fn test_packet_marshal_unmarshal_round_trip() -> Result<()> {
    let packet = Packet {
        source_port: 5000,
        destination_port: 4711,
        verification_tag: 0xdeadbeef,
        chunks: vec![
            Chunk::Data {
                tsn: 42,
                stream: 3,
                ssn: 7,
                ppid: 99,
                unordered: false,
                user_data: Bytes::from_static(b"Hello"),
            },
            Chunk::Shutdown,
        ],
    };
    let raw = packet.marshal(true);
    let parsed = Packet::unmarshal(&raw, true)?;
    assert_eq!(packet, parsed);
    Ok(())
}

#[test]
fn test_packet_checksum_detects_corruption() -> Result<()> {
    let packet = Packet {
        source_port: 1,
        destination_port: 2,
        verification_tag: 3,
        chunks: vec![Chunk::Abort],
    };
    let raw = packet.marshal(true);
    let mut corrupted = raw.to_vec();
    *corrupted.last_mut().unwrap() ^= 0xff;
    let result = Packet::unmarshal(&Bytes::from(corrupted), true);
    assert_eq!(result, Err(crate::error::Error::ErrChecksumMismatch));
    Ok(())
}

#[test]
fn test_init_chunk_round_trip_with_addresses() -> Result<()> {
    let packet = Packet {
        source_port: 9,
        destination_port: 10,
        verification_tag: 0,
        chunks: vec![Chunk::Init {
            initiate_tag: 77,
            out_streams: 10,
            in_streams: 5,
            initial_tsn: 1000,
            addresses: vec!["127.0.0.1".to_string(), "10.0.0.1".to_string()],
        }],
    };
    let raw = packet.marshal(true);
    let parsed = Packet::unmarshal(&raw, true)?;
    assert_eq!(packet, parsed);
    Ok(())
}

#[test]
fn test_handshake_data_and_shutdown() -> Result<()> {
    let mut engine = DatagramEngine::new()?;
    let mut waiter = engine.attach_waiter()?;

    let server = engine.register_instance(0, 8, 8, &local(0))?;
    let server_port = engine.local_addresses(server)?[0].port();
    let client = engine.register_instance(0, 8, 8, &local(0))?;

    let dest = local(server_port);
    let assoc = engine.associate(client, 4, &dest, server_port)?;
    assert!(engine.instance_of(assoc) == Some(client));

    let mut events = Vec::new();
    assert!(
        pump_until(
            &mut engine,
            &mut waiter,
            &mut events,
            |e| matches!(e, Event::CommunicationUp { assoc_id, .. } if *assoc_id == assoc),
            Duration::from_secs(2),
        ),
        "client association must come up"
    );
    // The server side produced its own association and CommunicationUp.
    let server_assoc = events
        .iter()
        .find_map(|e| match e {
            Event::CommunicationUp { assoc_id, .. } if *assoc_id != assoc => Some(*assoc_id),
            _ => None,
        })
        .expect("server side association must come up");
    assert_eq!(engine.instance_of(server_assoc), Some(server));

    // Data, client to server.
    let sent = engine.send(assoc, 0, b"Test #1", 0x29, SCTP_INFINITE_LIFETIME, false, false)?;
    assert_eq!(sent, SendResult::Sent);
    assert!(
        pump_until(
            &mut engine,
            &mut waiter,
            &mut events,
            |e| matches!(e, Event::DataArrive { assoc_id, .. } if *assoc_id == server_assoc),
            Duration::from_secs(2),
        ),
        "server must see the message"
    );
    let chunk = engine.receive(server_assoc, 0, 1024, false)?;
    assert_eq!(&chunk.data[..], b"Test #1");

    // Graceful shutdown initiated by the client.
    engine.shutdown(assoc);
    assert!(
        pump_until(
            &mut engine,
            &mut waiter,
            &mut events,
            |e| matches!(e, Event::ShutdownComplete { assoc_id } if *assoc_id == assoc),
            Duration::from_secs(2),
        ),
        "initiator must observe shutdown-complete"
    );
    assert!(
        pump_until(
            &mut engine,
            &mut waiter,
            &mut events,
            |e| matches!(e, Event::ShutdownComplete { assoc_id } if *assoc_id == server_assoc),
            Duration::from_secs(2),
        ),
        "peer must observe shutdown-complete"
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ShutdownReceived { assoc_id } if *assoc_id == server_assoc)));

    engine.delete_association(assoc)?;
    engine.delete_association(server_assoc)?;
    assert_eq!(engine.instance_of(assoc), None);
    Ok(())
}

#[test]
fn test_partial_receive_keeps_tail() -> Result<()> {
    let mut engine = DatagramEngine::new()?;
    let mut waiter = engine.attach_waiter()?;
    let server = engine.register_instance(0, 1, 1, &local(0))?;
    let server_port = engine.local_addresses(server)?[0].port();
    let client = engine.register_instance(0, 1, 1, &local(0))?;
    let assoc = engine.associate(client, 1, &local(server_port), server_port)?;

    let mut events = Vec::new();
    assert!(pump_until(
        &mut engine,
        &mut waiter,
        &mut events,
        |e| matches!(e, Event::CommunicationUp { assoc_id, .. } if *assoc_id == assoc),
        Duration::from_secs(2),
    ));
    let server_assoc = events
        .iter()
        .find_map(|e| match e {
            Event::CommunicationUp { assoc_id, .. } if *assoc_id != assoc => Some(*assoc_id),
            _ => None,
        })
        .unwrap();

    let message = vec![0x5a; 10000];
    engine.send(assoc, 0, &message, 0, SCTP_INFINITE_LIFETIME, false, false)?;
    assert!(pump_until(
        &mut engine,
        &mut waiter,
        &mut events,
        |e| matches!(e, Event::DataArrive { assoc_id, length, .. } if *assoc_id == server_assoc && *length == 10000),
        Duration::from_secs(2),
    ));

    // Peek does not consume.
    let peeked = engine.receive(server_assoc, 0, 4096, true)?;
    assert_eq!(peeked.data.len(), 4096);
    let first = engine.receive(server_assoc, 0, 4096, false)?;
    assert_eq!(peeked.data, first.data);

    let second = engine.receive(server_assoc, 0, 4096, false)?;
    assert_eq!(second.data.len(), 4096);
    let third = engine.receive(server_assoc, 0, 4096, false)?;
    assert_eq!(third.data.len(), 1808);
    assert_eq!(first.tsn, third.tsn, "one message, one TSN");
    Ok(())
}

#[test]
fn test_init_failure_reports_communication_lost() -> Result<()> {
    let mut engine = DatagramEngine::new()?;
    let mut waiter = engine.attach_waiter()?;
    let client = engine.register_instance(0, 1, 1, &local(0))?;
    let mut parameters = engine.instance_parameters(client)?;
    parameters.rto_max = 30;
    parameters.max_init_retransmits = 2;
    engine.set_instance_parameters(client, &parameters)?;

    // Nobody listens on this port.
    let assoc = engine.associate(client, 1, &local(9), 9)?;
    let mut events = Vec::new();
    assert!(
        pump_until(
            &mut engine,
            &mut waiter,
            &mut events,
            |e| matches!(
                e,
                Event::CommunicationLost {
                    assoc_id,
                    reason: LossReason::InitFailed,
                } if *assoc_id == assoc
            ),
            Duration::from_secs(2),
        ),
        "exhausted INIT attempts must report communication lost"
    );
    Ok(())
}

#[test]
fn test_abort_reaches_peer() -> Result<()> {
    let mut engine = DatagramEngine::new()?;
    let mut waiter = engine.attach_waiter()?;
    let server = engine.register_instance(0, 1, 1, &local(0))?;
    let server_port = engine.local_addresses(server)?[0].port();
    let client = engine.register_instance(0, 1, 1, &local(0))?;
    let assoc = engine.associate(client, 1, &local(server_port), server_port)?;

    let mut events = Vec::new();
    assert!(pump_until(
        &mut engine,
        &mut waiter,
        &mut events,
        |e| matches!(e, Event::CommunicationUp { assoc_id, .. } if *assoc_id == assoc),
        Duration::from_secs(2),
    ));
    let server_assoc = events
        .iter()
        .find_map(|e| match e {
            Event::CommunicationUp { assoc_id, .. } if *assoc_id != assoc => Some(*assoc_id),
            _ => None,
        })
        .unwrap();

    engine.abort(assoc);
    assert!(
        pump_until(
            &mut engine,
            &mut waiter,
            &mut events,
            |e| matches!(
                e,
                Event::CommunicationLost { assoc_id, reason: LossReason::PeerAbort }
                    if *assoc_id == server_assoc
            ),
            Duration::from_secs(2),
        ),
        "peer must observe the abort"
    );
    // The aborting side hears about it through the same event path.
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CommunicationLost { assoc_id, .. } if *assoc_id == assoc
    )));
    Ok(())
}

#[test]
fn test_association_status_and_parameters() -> Result<()> {
    let mut engine = DatagramEngine::new()?;
    let _waiter = engine.attach_waiter()?;
    let client = engine.register_instance(0, 2, 2, &local(0))?;
    let assoc = engine.associate(client, 2, &local(1), 1)?;

    let mut status = engine.association_status(assoc)?;
    assert_eq!(status.state, AssocState::CookieWait);
    assert_eq!(status.dest_port, 1);
    assert_eq!(status.primary_destination_address, "127.0.0.1");

    status.rto_max = 12345;
    engine.set_association_status(assoc, &status)?;
    assert_eq!(engine.association_status(assoc)?.rto_max, 12345);
    Ok(())
}
