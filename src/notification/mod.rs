#[cfg(test)]
mod notification_test;

mod queue;

pub use queue::NotificationQueue;

use crate::engine::AssocId;

use bytes::{BufMut, Bytes, BytesMut};

/// Subscription mask bits. Data arrival is always delivered; the rest of the
/// notification types reach the application only when subscribed.
pub const SCTP_RECVDATAIOEVNT: u32 = 1 << 0;
pub const SCTP_RECVASSOCEVNT: u32 = 1 << 1;
pub const SCTP_RECVPADDREVNT: u32 = 1 << 2;
pub const SCTP_RECVPEERERR: u32 = 1 << 3;
pub const SCTP_RECVSENDFAILEVNT: u32 = 1 << 4;
pub const SCTP_RECVSHUTDOWNEVNT: u32 = 1 << 5;

/// Wire identifiers of the notification types, used in the encoded header.
pub const SCTP_ASSOC_CHANGE: u16 = 0x0001;
pub const SCTP_PEER_ADDR_CHANGE: u16 = 0x0002;
pub const SCTP_REMOTE_ERROR: u16 = 0x0003;
pub const SCTP_SEND_FAILED: u16 = 0x0004;
pub const SCTP_SHUTDOWN_EVENT: u16 = 0x0005;
pub const SCTP_DATA_ARRIVE: u16 = 0x0006;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum AssocChangeState {
    CommUp = 1,
    CommLost = 2,
    Restart = 3,
    ShutdownComplete = 4,
    CantStartAssoc = 5,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum PeerAddrChangeState {
    AddrReachable = 1,
    AddrUnreachable = 2,
    AddrAdded = 3,
    AddrRemoved = 4,
    AddrMadePrimary = 5,
    AddrConfirmed = 6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationContent {
    DataArrive {
        assoc_id: AssocId,
        stream: u16,
        ppid: u32,
        unordered: bool,
        bytes_arrived: u32,
    },
    AssocChange {
        state: AssocChangeState,
        error: u32,
        outbound_streams: u16,
        inbound_streams: u16,
        assoc_id: AssocId,
    },
    PeerAddrChange {
        state: PeerAddrChangeState,
        address: String,
        error: u32,
        assoc_id: AssocId,
    },
    RemoteError {
        error: u32,
        assoc_id: AssocId,
        data: Bytes,
    },
    SendFailed {
        error: u32,
        assoc_id: AssocId,
        context: u32,
        data: Bytes,
    },
    ShutdownEvent {
        assoc_id: AssocId,
    },
}

/// A notification queued towards the application. Carries the owning
/// association's peer address list as captured at enqueue time, plus a read
/// position so one notification can be delivered over several bounded reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpNotification {
    pub remote_port: u16,
    pub remote_addresses: Vec<String>,
    pub content: NotificationContent,
    pub content_position: usize,
}

impl SctpNotification {
    pub fn new(content: NotificationContent) -> Self {
        SctpNotification {
            remote_port: 0,
            remote_addresses: Vec::new(),
            content,
            content_position: 0,
        }
    }

    pub fn notification_type(&self) -> u16 {
        match self.content {
            NotificationContent::DataArrive { .. } => SCTP_DATA_ARRIVE,
            NotificationContent::AssocChange { .. } => SCTP_ASSOC_CHANGE,
            NotificationContent::PeerAddrChange { .. } => SCTP_PEER_ADDR_CHANGE,
            NotificationContent::RemoteError { .. } => SCTP_REMOTE_ERROR,
            NotificationContent::SendFailed { .. } => SCTP_SEND_FAILED,
            NotificationContent::ShutdownEvent { .. } => SCTP_SHUTDOWN_EVENT,
        }
    }

    pub fn assoc_id(&self) -> AssocId {
        match self.content {
            NotificationContent::DataArrive { assoc_id, .. }
            | NotificationContent::AssocChange { assoc_id, .. }
            | NotificationContent::PeerAddrChange { assoc_id, .. }
            | NotificationContent::RemoteError { assoc_id, .. }
            | NotificationContent::SendFailed { assoc_id, .. }
            | NotificationContent::ShutdownEvent { assoc_id } => assoc_id,
        }
    }

    /// True when `mask` selects this notification for delivery. Data arrival
    /// is always readable.
    pub fn is_selected(&self, mask: u32) -> bool {
        match self.notification_type() {
            SCTP_DATA_ARRIVE => true,
            SCTP_ASSOC_CHANGE => mask & SCTP_RECVASSOCEVNT != 0,
            SCTP_PEER_ADDR_CHANGE => mask & SCTP_RECVPADDREVNT != 0,
            SCTP_REMOTE_ERROR => mask & SCTP_RECVPEERERR != 0,
            SCTP_SEND_FAILED => mask & SCTP_RECVSENDFAILEVNT != 0,
            SCTP_SHUTDOWN_EVENT => mask & SCTP_RECVSHUTDOWNEVNT != 0,
            _ => false,
        }
    }

    /// Stable binary encoding delivered to MSG_NOTIFICATION readers:
    /// a {type, flags, length} header followed by the event fields, all
    /// little-endian, variable-size fields length-prefixed. No pad bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::new();
        match &self.content {
            NotificationContent::DataArrive {
                assoc_id,
                stream,
                ppid,
                unordered,
                bytes_arrived,
            } => {
                body.put_u32_le(*assoc_id);
                body.put_u16_le(*stream);
                body.put_u32_le(*ppid);
                body.put_u8(u8::from(*unordered));
                body.put_u32_le(*bytes_arrived);
            }
            NotificationContent::AssocChange {
                state,
                error,
                outbound_streams,
                inbound_streams,
                assoc_id,
            } => {
                body.put_u16_le(*state as u16);
                body.put_u32_le(*error);
                body.put_u16_le(*outbound_streams);
                body.put_u16_le(*inbound_streams);
                body.put_u32_le(*assoc_id);
            }
            NotificationContent::PeerAddrChange {
                state,
                address,
                error,
                assoc_id,
            } => {
                body.put_u16_le(*state as u16);
                body.put_u32_le(*error);
                body.put_u32_le(*assoc_id);
                body.put_u16_le(address.len() as u16);
                body.put_slice(address.as_bytes());
            }
            NotificationContent::RemoteError {
                error,
                assoc_id,
                data,
            } => {
                body.put_u32_le(*error);
                body.put_u32_le(*assoc_id);
                body.put_u16_le(data.len() as u16);
                body.put_slice(data);
            }
            NotificationContent::SendFailed {
                error,
                assoc_id,
                context,
                data,
            } => {
                body.put_u32_le(*error);
                body.put_u32_le(*assoc_id);
                body.put_u32_le(*context);
                body.put_u16_le(data.len() as u16);
                body.put_slice(data);
            }
            NotificationContent::ShutdownEvent { assoc_id } => {
                body.put_u32_le(*assoc_id);
            }
        }

        let mut raw = BytesMut::with_capacity(8 + body.len());
        raw.put_u16_le(self.notification_type());
        raw.put_u16_le(0); // flags
        raw.put_u32_le(8 + body.len() as u32);
        raw.extend_from_slice(&body);
        raw.freeze()
    }
}
