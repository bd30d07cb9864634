use super::*;
use crate::error::Result;

use bytes::Buf;

fn data_arrive(assoc_id: u32, bytes_arrived: u32) -> SctpNotification {
    SctpNotification::new(NotificationContent::DataArrive {
        assoc_id,
        stream: 0,
        ppid: 0,
        unordered: false,
        bytes_arrived,
    })
}

fn shutdown_event(assoc_id: u32) -> SctpNotification {
    SctpNotification::new(NotificationContent::ShutdownEvent { assoc_id })
}

#[test]
fn test_queue_fifo_order() -> Result<()> {
    let mut q = NotificationQueue::new("test");
    q.add(data_arrive(1, 10))?;
    q.add(data_arrive(2, 20))?;
    q.add(shutdown_event(3))?;
    assert_eq!(q.count(), 3);

    assert_eq!(q.peek().unwrap().assoc_id(), 1);
    q.drop_head();
    assert_eq!(q.peek().unwrap().assoc_id(), 2);
    q.drop_head();
    assert_eq!(q.peek().unwrap().assoc_id(), 3);
    q.drop_head();
    assert!(q.peek().is_none());
    Ok(())
}

#[test]
fn test_add_signals_update_condition() -> Result<()> {
    let mut q = NotificationQueue::new("test");
    assert!(!q.update_condition().peek_fired());
    q.add(data_arrive(1, 1))?;
    assert!(q.update_condition().peek_fired());
    Ok(())
}

#[test]
fn test_update_replaces_head_only() -> Result<()> {
    let mut q = NotificationQueue::new("test");
    q.add(data_arrive(1, 100))?;
    q.add(data_arrive(2, 200))?;

    let mut head = q.peek().unwrap().clone();
    if let NotificationContent::DataArrive {
        ref mut bytes_arrived,
        ..
    } = head.content
    {
        *bytes_arrived -= 40;
    }
    q.update(head);

    match q.peek().unwrap().content {
        NotificationContent::DataArrive { bytes_arrived, .. } => assert_eq!(bytes_arrived, 60),
        _ => panic!("head changed type"),
    }
    q.drop_head();
    assert_eq!(q.peek().unwrap().assoc_id(), 2, "tail must be untouched");
    Ok(())
}

#[test]
fn test_has_data_honors_mask_but_data_always_readable() -> Result<()> {
    let mut q = NotificationQueue::new("test");
    q.add(shutdown_event(1))?;
    assert!(!q.has_data(0), "masked-out event type is not readable");
    assert!(q.has_data(SCTP_RECVSHUTDOWNEVNT));

    q.add(data_arrive(1, 5))?;
    assert!(q.has_data(0), "data arrival ignores the mask");
    Ok(())
}

#[test]
fn test_flush_empties_queue() -> Result<()> {
    let mut q = NotificationQueue::new("test");
    q.add(data_arrive(1, 1))?;
    q.add(data_arrive(2, 2))?;
    q.flush();
    assert_eq!(q.count(), 0);
    Ok(())
}

#[test]
fn test_encoding_header_and_length() {
    let n = SctpNotification::new(NotificationContent::AssocChange {
        state: AssocChangeState::CommUp,
        error: 0,
        outbound_streams: 4,
        inbound_streams: 2,
        assoc_id: 9,
    });
    let mut raw = n.to_bytes();
    assert_eq!(raw.get_u16_le(), SCTP_ASSOC_CHANGE);
    let _flags = raw.get_u16_le();
    let length = raw.get_u32_le();
    assert_eq!(length as usize, raw.remaining() + 8);
    assert_eq!(raw.get_u16_le(), AssocChangeState::CommUp as u16);
    let _error = raw.get_u32_le();
    assert_eq!(raw.get_u16_le(), 4);
    assert_eq!(raw.get_u16_le(), 2);
    assert_eq!(raw.get_u32_le(), 9);
}

#[test]
fn test_selection_mask_per_type() {
    let n = SctpNotification::new(NotificationContent::PeerAddrChange {
        state: PeerAddrChangeState::AddrReachable,
        address: "10.0.0.1".to_string(),
        error: 0,
        assoc_id: 3,
    });
    assert!(!n.is_selected(SCTP_RECVASSOCEVNT));
    assert!(n.is_selected(SCTP_RECVPADDREVNT));
}
