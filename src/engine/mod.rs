#[cfg(test)]
mod engine_test;

pub(crate) mod datagram;
mod packet;

pub use datagram::DatagramEngine;

use crate::address::SocketAddress;
use crate::error::Result;

use bytes::Bytes;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Engine association identifier. Non-zero while the association is live.
pub type AssocId = u32;
/// Engine instance identifier, one per bound endpoint.
pub type InstanceId = u32;

/// Lifetime value meaning "never expire" for a user message.
pub const SCTP_INFINITE_LIFETIME: u32 = u32::MAX;

/// Association state as reported by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssocState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

impl std::fmt::Display for AssocState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match *self {
            AssocState::Closed => "Closed",
            AssocState::CookieWait => "CookieWait",
            AssocState::CookieEchoed => "CookieEchoed",
            AssocState::Established => "Established",
            AssocState::ShutdownPending => "ShutdownPending",
            AssocState::ShutdownSent => "ShutdownSent",
            AssocState::ShutdownReceived => "ShutdownReceived",
            AssocState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathState {
    Reachable,
    Unreachable,
}

/// Per-instance defaults applied to new associations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceParameters {
    pub rto_initial: u32,
    pub rto_min: u32,
    pub rto_max: u32,
    pub max_init_retransmits: u16,
    pub assoc_max_retransmits: u16,
    pub valid_cookie_life: u32,
    pub in_streams: u16,
    pub out_streams: u16,
}

impl Default for InstanceParameters {
    fn default() -> Self {
        InstanceParameters {
            rto_initial: 3000,
            rto_min: 1000,
            rto_max: 60000,
            max_init_retransmits: 8,
            assoc_max_retransmits: 10,
            valid_cookie_life: 60000,
            in_streams: 1,
            out_streams: 1,
        }
    }
}

/// Association status snapshot. `primary_destination_address` is the legacy
/// printed form (address only, no port), which the socket layer uses for
/// destination matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationStatus {
    pub state: AssocState,
    pub number_of_destination_paths: u16,
    pub primary_destination_address: String,
    pub primary_address_index: u16,
    pub dest_port: u16,
    pub in_streams: u16,
    pub out_streams: u16,
    pub current_receiver_window: u32,
    pub outstanding_bytes: u32,
    pub rto_initial: u32,
    pub rto_min: u32,
    pub rto_max: u32,
    pub assoc_max_retransmits: u16,
}

/// Per-path status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStatus {
    pub destination_address: String,
    pub state: PathState,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: u32,
    pub rto: u32,
    pub path_mtu: u32,
}

/// Library-wide parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryParameters {
    pub send_ootb_aborts: bool,
    pub checksum_crc32: bool,
}

impl Default for LibraryParameters {
    fn default() -> Self {
        LibraryParameters {
            send_ootb_aborts: false,
            checksum_crc32: true,
        }
    }
}

/// Why an association was lost.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LossReason {
    PeerAbort,
    InitFailed,
    Unreachable,
}

/// One consumed chunk of user data.
#[derive(Debug, Clone)]
pub struct ReceivedChunk {
    pub data: Bytes,
    pub ssn: u16,
    pub tsn: u32,
}

/// Outcome of a send attempt that did not fail outright.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    QueueExceeded,
}

/// Events the engine produces. The SocketMaster's event-loop thread drains
/// them under the global lock and dispatches one handler per event, which is
/// where every notification towards the application originates.
#[derive(Debug, Clone)]
pub enum Event {
    DataArrive {
        assoc_id: AssocId,
        stream: u16,
        length: u32,
        ppid: u32,
        unordered: bool,
    },
    SendFailure {
        assoc_id: AssocId,
        data: Bytes,
        context: u32,
    },
    NetworkStatusChange {
        assoc_id: AssocId,
        path_id: u16,
        state: PathState,
    },
    CommunicationUp {
        assoc_id: AssocId,
        destinations: u16,
        in_streams: u16,
        out_streams: u16,
    },
    CommunicationLost {
        assoc_id: AssocId,
        reason: LossReason,
    },
    CommunicationError {
        assoc_id: AssocId,
        error: u32,
    },
    Restart {
        assoc_id: AssocId,
    },
    ShutdownReceived {
        assoc_id: AssocId,
    },
    ShutdownComplete {
        assoc_id: AssocId,
    },
    QueueStatusChange {
        assoc_id: AssocId,
        queue_length: u32,
    },
    UserSocket {
        fd: RawFd,
        revents: i16,
    },
}

/// Readiness report handed from the waiter to `Engine::drive`.
#[derive(Debug, Copy, Clone)]
pub struct Readiness {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Blocks for engine IO outside the global lock. Exactly one waiter exists,
/// owned by the SocketMaster's event-loop thread.
pub trait EngineWaiter: Send {
    /// Waits until IO is ready or `timeout` expires. An empty result means
    /// timeout (or spurious wake-up); both are fine to hand to `drive`.
    fn wait(&mut self, timeout: Option<Duration>) -> Vec<Readiness>;
}

/// The lower-level SCTP protocol engine. All methods are called under the
/// SocketMaster's global lock; none of them block.
pub trait Engine: Send {
    // ====== Instance management =========================================
    fn register_instance(
        &mut self,
        local_port: u16,
        in_streams: u16,
        out_streams: u16,
        local_addresses: &[SocketAddress],
    ) -> Result<InstanceId>;
    fn unregister_instance(&mut self, instance: InstanceId) -> Result<()>;
    fn local_addresses(&self, instance: InstanceId) -> Result<Vec<SocketAddress>>;
    fn add_local_address(&mut self, instance: InstanceId, address: &SocketAddress) -> Result<()>;
    fn remove_local_address(
        &mut self,
        instance: InstanceId,
        address: &SocketAddress,
    ) -> Result<()>;
    fn instance_parameters(&self, instance: InstanceId) -> Result<InstanceParameters>;
    fn set_instance_parameters(
        &mut self,
        instance: InstanceId,
        parameters: &InstanceParameters,
    ) -> Result<()>;

    // ====== Association management ======================================
    fn associate(
        &mut self,
        instance: InstanceId,
        out_streams: u16,
        destinations: &[SocketAddress],
        dest_port: u16,
    ) -> Result<AssocId>;
    fn shutdown(&mut self, assoc: AssocId);
    fn abort(&mut self, assoc: AssocId);
    fn delete_association(&mut self, assoc: AssocId) -> Result<()>;
    /// Instance the association belongs to; the reverse index every engine
    /// callback resolution starts from.
    fn instance_of(&self, assoc: AssocId) -> Option<InstanceId>;
    fn association_status(&self, assoc: AssocId) -> Result<AssociationStatus>;
    fn set_association_status(&mut self, assoc: AssocId, status: &AssociationStatus)
        -> Result<()>;
    fn remote_addresses(&self, assoc: AssocId) -> Result<Vec<SocketAddress>>;

    // ====== Paths =======================================================
    fn path_status(&self, assoc: AssocId, path_index: u16) -> Result<PathStatus>;
    fn primary_path(&self, assoc: AssocId) -> Result<u16>;
    fn set_primary(&mut self, assoc: AssocId, path_index: u16) -> Result<()>;
    fn set_peer_primary(&mut self, assoc: AssocId, address: &SocketAddress) -> Result<()>;
    fn change_heartbeat(
        &mut self,
        assoc: AssocId,
        path_index: u16,
        enabled: bool,
        interval: u32,
    ) -> Result<()>;
    fn request_heartbeat(&mut self, assoc: AssocId, path_index: u16) -> Result<()>;

    // ====== Data ========================================================
    #[allow(clippy::too_many_arguments)]
    fn send(
        &mut self,
        assoc: AssocId,
        stream: u16,
        data: &[u8],
        ppid: u32,
        time_to_live: u32,
        unordered: bool,
        bundle_disabled: bool,
    ) -> Result<SendResult>;
    /// Consumes (or peeks) up to `max_len` bytes of the front message queued
    /// on `(assoc, stream)`. A bounded read leaves the tail in place.
    fn receive(
        &mut self,
        assoc: AssocId,
        stream: u16,
        max_len: usize,
        peek: bool,
    ) -> Result<ReceivedChunk>;

    // ====== Tuning ======================================================
    fn send_buffer_size(&self, assoc: AssocId) -> Result<usize>;
    fn set_send_buffer_size(&mut self, assoc: AssocId, size: usize) -> Result<()>;
    fn receive_buffer_size(&self, assoc: AssocId) -> Result<usize>;
    fn set_receive_buffer_size(&mut self, assoc: AssocId, size: usize) -> Result<()>;
    fn traffic_class(&self, assoc: AssocId, stream: i32) -> Result<u8>;
    fn set_traffic_class(&mut self, assoc: AssocId, stream: i32, tc: u8) -> Result<()>;
    fn library_parameters(&self) -> LibraryParameters;
    fn set_library_parameters(&mut self, parameters: &LibraryParameters) -> Result<()>;

    // ====== User sockets (select/poll composition) ======================
    /// Registers an external OS descriptor; `drive` reports it once via
    /// `Event::UserSocket` and drops the registration (one-shot).
    fn register_user_fd(&mut self, fd: RawFd, events: i16) -> Result<()>;
    fn unregister_user_fd(&mut self, fd: RawFd) -> Result<()>;

    // ====== Event loop ==================================================
    /// Hands out the blocking waiter. Called once, by the event-loop thread.
    fn attach_waiter(&mut self) -> Result<Box<dyn EngineWaiter>>;
    /// Earliest timer deadline, bounding the waiter's timeout.
    fn next_deadline(&self) -> Option<Instant>;
    /// Processes ready IO and expired timers, appending produced events.
    fn drive(&mut self, ready: &[Readiness], out: &mut Vec<Event>);
}
