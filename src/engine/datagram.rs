use crate::address::{InternetAddress, SocketAddress, PF_ADDRESS, PF_HIDE_PORT, PF_LEGACY};
use crate::engine::packet::{Chunk, Packet};
use crate::engine::{
    AssocId, AssocState, AssociationStatus, Engine, EngineWaiter, Event, InstanceId,
    InstanceParameters, LibraryParameters, LossReason, PathState, PathStatus, Readiness,
    ReceivedChunk, SendResult,
};
use crate::error::{Error, Result};

use bytes::Bytes;
use log::{debug, trace, warn};
use mio::net::UdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use rand::Rng;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const RECEIVE_MTU: usize = 65536;
/// Header overhead assumed when checking a message against the MTU.
const COMMON_OVERHEAD: usize = 28;
/// Soft cap on bytes buffered per association before send reports
/// queue-exceeded.
const DEFAULT_SEND_BUFFER: usize = 256 * 1024;
const DEFAULT_RECV_BUFFER: usize = 256 * 1024;

const PRINT_FORMAT: u32 = PF_ADDRESS | PF_HIDE_PORT | PF_LEGACY;

/// Retransmission and handshake timers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TimerKind {
    InitRtx(AssocId),
    CookieRtx(AssocId),
    ShutdownRtx(AssocId),
    Heartbeat(AssocId, u16),
}

#[derive(Debug)]
struct Timer {
    deadline: Instant,
    kind: TimerKind,
}

#[derive(Debug)]
struct Instance {
    local_port: u16,
    in_streams: u16,
    out_streams: u16,
    addresses: Vec<SocketAddress>,
    socket: UdpSocket,
    token: Token,
    parameters: InstanceParameters,
}

/// One queued inbound user message, partially consumable.
#[derive(Debug)]
struct PendingMessage {
    data: Bytes,
    offset: usize,
    ssn: u16,
    tsn: u32,
    ppid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AssocParameters {
    rto_initial: u32,
    rto_min: u32,
    rto_max: u32,
    assoc_max_retransmits: u16,
}

#[derive(Debug)]
struct PathConfig {
    address: String,
    heartbeat_enabled: bool,
    heartbeat_interval: u32,
    state: PathState,
}

struct AssocCore {
    instance: InstanceId,
    state: AssocState,
    passive: bool,
    local_tag: u32,
    peer_tag: u32,
    peer: SocketAddr,
    dest_port: u16,
    paths: Vec<PathConfig>,
    primary_path: u16,
    in_streams: u16,
    out_streams: u16,
    next_tsn: u32,
    next_ssn: HashMap<u16, u16>,
    recv_queues: HashMap<u16, VecDeque<PendingMessage>>,
    buffered_recv_bytes: usize,
    init_attempts_left: u16,
    handshake_packet: Option<Bytes>,
    parameters: AssocParameters,
    send_buffer: usize,
    recv_buffer: usize,
    traffic_class: u8,
    stream_traffic_class: HashMap<u16, u8>,
}

struct UserFdRegistration {
    events: i16,
    token: Token,
}

/// The built-in engine: SCTP-like chunks over UDP datagrams, driven by a mio
/// poller. It honors the callback contract of the `Engine` trait; it is not
/// RFC 2960 on the wire (no congestion control, no SACK, no data
/// retransmission).
pub struct DatagramEngine {
    poll: Option<Poll>,
    registry: Registry,
    instances: HashMap<InstanceId, Instance>,
    assocs: HashMap<AssocId, AssocCore>,
    user_fds: HashMap<RawFd, UserFdRegistration>,
    tokens: HashMap<Token, TokenTarget>,
    timers: Vec<Timer>,
    queued: Vec<Event>,
    library: LibraryParameters,
    next_token: usize,
    next_instance: InstanceId,
    next_assoc: AssocId,
}

#[derive(Debug, Copy, Clone)]
enum TokenTarget {
    Instance(InstanceId),
    UserFd(RawFd),
}

impl DatagramEngine {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(DatagramEngine {
            poll: Some(poll),
            registry,
            instances: HashMap::new(),
            assocs: HashMap::new(),
            user_fds: HashMap::new(),
            tokens: HashMap::new(),
            timers: Vec::new(),
            queued: Vec::new(),
            library: LibraryParameters::default(),
            next_token: 1,
            next_instance: 1,
            next_assoc: 1,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn assoc(&self, assoc: AssocId) -> Result<&AssocCore> {
        self.assocs.get(&assoc).ok_or(Error::ErrNotConnected)
    }

    fn assoc_mut(&mut self, assoc: AssocId) -> Result<&mut AssocCore> {
        self.assocs.get_mut(&assoc).ok_or(Error::ErrNotConnected)
    }

    fn arm_timer(&mut self, deadline: Instant, kind: TimerKind) {
        self.timers.push(Timer { deadline, kind });
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        self.timers.retain(|t| t.kind != kind);
    }

    fn cancel_assoc_timers(&mut self, assoc: AssocId) {
        self.timers.retain(|t| match t.kind {
            TimerKind::InitRtx(a)
            | TimerKind::CookieRtx(a)
            | TimerKind::ShutdownRtx(a)
            | TimerKind::Heartbeat(a, _) => a != assoc,
        });
    }

    fn send_raw(&self, instance: InstanceId, to: SocketAddr, packet: &Packet) {
        if let Some(inst) = self.instances.get(&instance) {
            let raw = packet.marshal(self.library.checksum_crc32);
            match inst.socket.send_to(&raw, to) {
                Ok(_) => {}
                Err(e) => trace!("send_to {to} failed: {e}"),
            }
        }
    }

    fn send_chunk(&self, assoc: &AssocCore, chunk: Chunk) {
        let instance = match self.instances.get(&assoc.instance) {
            Some(inst) => inst,
            None => return,
        };
        let packet = Packet {
            source_port: instance.local_port,
            destination_port: assoc.dest_port,
            verification_tag: assoc.peer_tag,
            chunks: vec![chunk],
        };
        self.send_raw(assoc.instance, assoc.peer, &packet);
    }

    fn printed(addr: &SocketAddr) -> String {
        InternetAddress::from(*addr).address_string(PRINT_FORMAT)
    }

    /// Finds the association a packet addresses: by verification tag, or for
    /// INIT (tag zero) by instance and origin.
    fn assoc_for_packet(
        &self,
        instance: InstanceId,
        from: SocketAddr,
        tag: u32,
    ) -> Option<AssocId> {
        if tag != 0 {
            self.assocs
                .iter()
                .find(|(_, a)| a.instance == instance && a.local_tag == tag)
                .map(|(id, _)| *id)
        } else {
            self.assocs
                .iter()
                .find(|(_, a)| a.instance == instance && a.peer == from)
                .map(|(id, _)| *id)
        }
    }

    fn handle_datagram(
        &mut self,
        instance: InstanceId,
        from: SocketAddr,
        raw: Bytes,
        out: &mut Vec<Event>,
    ) {
        let packet = match Packet::unmarshal(&raw, self.library.checksum_crc32) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping malformed datagram from {from}: {e}");
                return;
            }
        };
        let tag = packet.verification_tag;
        for chunk in packet.chunks {
            self.handle_chunk(instance, from, tag, chunk, out);
        }
    }

    fn handle_chunk(
        &mut self,
        instance: InstanceId,
        from: SocketAddr,
        tag: u32,
        chunk: Chunk,
        out: &mut Vec<Event>,
    ) {
        let assoc_id = self.assoc_for_packet(instance, from, tag);
        match chunk {
            Chunk::Init {
                initiate_tag,
                out_streams,
                in_streams,
                initial_tsn: _,
                addresses,
            } => self.handle_init(
                instance,
                from,
                assoc_id,
                initiate_tag,
                out_streams,
                in_streams,
                addresses,
            ),
            Chunk::InitAck {
                initiate_tag,
                out_streams,
                in_streams,
                initial_tsn: _,
                addresses,
            } => self.handle_init_ack(
                assoc_id,
                initiate_tag,
                out_streams,
                in_streams,
                addresses,
            ),
            Chunk::CookieEcho { echo_tag } => self.handle_cookie_echo(assoc_id, echo_tag, out),
            Chunk::CookieAck => self.handle_cookie_ack(assoc_id, out),
            Chunk::Data {
                tsn,
                stream,
                ssn,
                ppid,
                unordered,
                user_data,
            } => self.handle_data(assoc_id, tsn, stream, ssn, ppid, unordered, user_data, out),
            Chunk::Heartbeat { info } => {
                if let Some(id) = assoc_id {
                    if let Ok(assoc) = self.assoc(id) {
                        self.send_chunk(assoc, Chunk::HeartbeatAck { info });
                    }
                }
            }
            Chunk::HeartbeatAck { .. } => {
                if let Some(id) = assoc_id {
                    if let Some(assoc) = self.assocs.get_mut(&id) {
                        let path = assoc.primary_path;
                        if let Some(p) = assoc.paths.get_mut(path as usize) {
                            p.state = PathState::Reachable;
                        }
                        out.push(Event::NetworkStatusChange {
                            assoc_id: id,
                            path_id: path,
                            state: PathState::Reachable,
                        });
                    }
                }
            }
            Chunk::Shutdown => self.handle_shutdown(assoc_id, out),
            Chunk::ShutdownAck => self.handle_shutdown_ack(assoc_id, out),
            Chunk::ShutdownComplete => self.handle_shutdown_complete(assoc_id, out),
            Chunk::Abort => self.handle_abort(assoc_id, out),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_init(
        &mut self,
        instance_id: InstanceId,
        from: SocketAddr,
        existing: Option<AssocId>,
        initiate_tag: u32,
        peer_out_streams: u16,
        peer_in_streams: u16,
        addresses: Vec<String>,
    ) {
        // Duplicate INIT for a handshake in flight: answer again.
        if let Some(id) = existing {
            if let Some(assoc) = self.assocs.get(&id) {
                if assoc.peer_tag == initiate_tag {
                    let ack = self.build_init_ack(assoc);
                    self.send_chunk(assoc, ack);
                }
                return;
            }
        }

        let instance = match self.instances.get(&instance_id) {
            Some(i) => i,
            None => return,
        };
        let local_tag = rand::thread_rng().gen_range(1..u32::MAX);
        let id = self.next_assoc;
        self.next_assoc += 1;

        let mut paths = vec![PathConfig {
            address: Self::printed(&from),
            heartbeat_enabled: false,
            heartbeat_interval: 30000,
            state: PathState::Reachable,
        }];
        for address in addresses.iter().skip(1) {
            paths.push(PathConfig {
                address: address.clone(),
                heartbeat_enabled: false,
                heartbeat_interval: 30000,
                state: PathState::Reachable,
            });
        }

        let core = AssocCore {
            instance: instance_id,
            state: AssocState::CookieWait,
            passive: true,
            local_tag,
            peer_tag: initiate_tag,
            peer: from,
            dest_port: from.port(),
            paths,
            primary_path: 0,
            in_streams: instance.in_streams,
            out_streams: peer_in_streams.min(instance.out_streams).max(1),
            next_tsn: rand::thread_rng().gen(),
            next_ssn: HashMap::new(),
            recv_queues: HashMap::new(),
            buffered_recv_bytes: 0,
            init_attempts_left: 0,
            handshake_packet: None,
            parameters: AssocParameters {
                rto_initial: instance.parameters.rto_initial,
                rto_min: instance.parameters.rto_min,
                rto_max: instance.parameters.rto_max,
                assoc_max_retransmits: instance.parameters.assoc_max_retransmits,
            },
            send_buffer: DEFAULT_SEND_BUFFER,
            recv_buffer: DEFAULT_RECV_BUFFER,
            traffic_class: 0,
            stream_traffic_class: HashMap::new(),
        };
        debug!(
            "incoming INIT from {from} on instance {instance_id}: new association {id}, peer streams {peer_out_streams}/{peer_in_streams}"
        );
        let ack = self.build_init_ack(&core);
        self.send_chunk(&core, ack);
        self.assocs.insert(id, core);
    }

    fn build_init_ack(&self, assoc: &AssocCore) -> Chunk {
        let addresses = self
            .instances
            .get(&assoc.instance)
            .map(|inst| {
                inst.addresses
                    .iter()
                    .map(|a| a.address_string(PRINT_FORMAT))
                    .collect()
            })
            .unwrap_or_default();
        Chunk::InitAck {
            initiate_tag: assoc.local_tag,
            out_streams: assoc.out_streams,
            in_streams: assoc.in_streams,
            initial_tsn: assoc.next_tsn,
            addresses,
        }
    }

    fn handle_init_ack(
        &mut self,
        assoc_id: Option<AssocId>,
        initiate_tag: u32,
        peer_out_streams: u16,
        peer_in_streams: u16,
        addresses: Vec<String>,
    ) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        if assoc.state != AssocState::CookieWait || assoc.passive {
            return;
        }
        assoc.peer_tag = initiate_tag;
        assoc.out_streams = assoc.out_streams.min(peer_in_streams).max(1);
        assoc.in_streams = assoc.in_streams.min(peer_out_streams.max(1));
        for address in addresses.iter().skip(1) {
            assoc.paths.push(PathConfig {
                address: address.clone(),
                heartbeat_enabled: false,
                heartbeat_interval: 30000,
                state: PathState::Reachable,
            });
        }
        assoc.state = AssocState::CookieEchoed;
        self.cancel_timer(TimerKind::InitRtx(id));

        let echo = Chunk::CookieEcho {
            echo_tag: initiate_tag,
        };
        let assoc = &self.assocs[&id];
        self.send_chunk(assoc, echo);
        let rto = Duration::from_millis(assoc.parameters.rto_max as u64);
        self.arm_timer(Instant::now() + rto, TimerKind::CookieRtx(id));
    }

    fn handle_cookie_echo(
        &mut self,
        assoc_id: Option<AssocId>,
        echo_tag: u32,
        out: &mut Vec<Event>,
    ) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        if echo_tag != assoc.local_tag {
            return;
        }
        let established_now = assoc.state == AssocState::CookieWait && assoc.passive;
        if established_now {
            assoc.state = AssocState::Established;
        }
        let assoc = &self.assocs[&id];
        self.send_chunk(assoc, Chunk::CookieAck);
        if established_now {
            out.push(Event::CommunicationUp {
                assoc_id: id,
                destinations: assoc.paths.len() as u16,
                in_streams: assoc.in_streams,
                out_streams: assoc.out_streams,
            });
            out.push(Event::QueueStatusChange {
                assoc_id: id,
                queue_length: 0,
            });
        }
    }

    fn handle_cookie_ack(&mut self, assoc_id: Option<AssocId>, out: &mut Vec<Event>) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        if assoc.state != AssocState::CookieEchoed {
            return;
        }
        assoc.state = AssocState::Established;
        self.cancel_timer(TimerKind::CookieRtx(id));
        let assoc = &self.assocs[&id];
        out.push(Event::CommunicationUp {
            assoc_id: id,
            destinations: assoc.paths.len() as u16,
            in_streams: assoc.in_streams,
            out_streams: assoc.out_streams,
        });
        out.push(Event::QueueStatusChange {
            assoc_id: id,
            queue_length: 0,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_data(
        &mut self,
        assoc_id: Option<AssocId>,
        tsn: u32,
        stream: u16,
        ssn: u16,
        ppid: u32,
        unordered: bool,
        user_data: Bytes,
        out: &mut Vec<Event>,
    ) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        match assoc.state {
            AssocState::Established | AssocState::ShutdownSent | AssocState::ShutdownReceived => {}
            _ => return,
        }
        if stream >= assoc.in_streams {
            trace!("data for out-of-range stream {stream} on association {id}");
            return;
        }
        if assoc.buffered_recv_bytes + user_data.len() > assoc.recv_buffer {
            warn!("receive buffer overrun on association {id}; dropping message");
            return;
        }
        let length = user_data.len() as u32;
        assoc.buffered_recv_bytes += user_data.len();
        assoc
            .recv_queues
            .entry(stream)
            .or_default()
            .push_back(PendingMessage {
                data: user_data,
                offset: 0,
                ssn,
                tsn,
                ppid,
            });
        out.push(Event::DataArrive {
            assoc_id: id,
            stream,
            length,
            ppid,
            unordered,
        });
    }

    fn handle_shutdown(&mut self, assoc_id: Option<AssocId>, out: &mut Vec<Event>) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        if assoc.state == AssocState::Established {
            out.push(Event::ShutdownReceived { assoc_id: id });
        }
        assoc.state = AssocState::ShutdownAckSent;
        self.cancel_timer(TimerKind::ShutdownRtx(id));
        let assoc = &self.assocs[&id];
        self.send_chunk(assoc, Chunk::ShutdownAck);
    }

    fn handle_shutdown_ack(&mut self, assoc_id: Option<AssocId>, out: &mut Vec<Event>) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        // ShutdownAckSent covers the simultaneous-shutdown crossing.
        match assoc.state {
            AssocState::ShutdownSent | AssocState::ShutdownAckSent => {}
            _ => return,
        }
        assoc.state = AssocState::Closed;
        self.cancel_timer(TimerKind::ShutdownRtx(id));
        let assoc = &self.assocs[&id];
        self.send_chunk(assoc, Chunk::ShutdownComplete);
        out.push(Event::ShutdownComplete { assoc_id: id });
    }

    fn handle_shutdown_complete(&mut self, assoc_id: Option<AssocId>, out: &mut Vec<Event>) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        let assoc = match self.assocs.get_mut(&id) {
            Some(a) => a,
            None => return,
        };
        if assoc.state != AssocState::ShutdownAckSent {
            return;
        }
        assoc.state = AssocState::Closed;
        out.push(Event::ShutdownComplete { assoc_id: id });
    }

    fn handle_abort(&mut self, assoc_id: Option<AssocId>, out: &mut Vec<Event>) {
        let id = match assoc_id {
            Some(id) => id,
            None => return,
        };
        if let Some(assoc) = self.assocs.get_mut(&id) {
            if assoc.state == AssocState::Closed {
                return;
            }
            assoc.state = AssocState::Closed;
            self.cancel_assoc_timers(id);
            out.push(Event::CommunicationLost {
                assoc_id: id,
                reason: LossReason::PeerAbort,
            });
        }
    }

    fn fire_timer(&mut self, kind: TimerKind, out: &mut Vec<Event>) {
        match kind {
            TimerKind::InitRtx(id) => {
                let (resend, lost) = match self.assocs.get_mut(&id) {
                    Some(assoc) if assoc.state == AssocState::CookieWait && !assoc.passive => {
                        if assoc.init_attempts_left > 0 {
                            assoc.init_attempts_left -= 1;
                            (true, false)
                        } else {
                            assoc.state = AssocState::Closed;
                            (false, true)
                        }
                    }
                    _ => (false, false),
                };
                if resend {
                    let assoc = &self.assocs[&id];
                    if let Some(raw) = assoc.handshake_packet.clone() {
                        if let Some(inst) = self.instances.get(&assoc.instance) {
                            let _ = inst.socket.send_to(&raw, assoc.peer);
                        }
                    }
                    let rto =
                        Duration::from_millis(self.assocs[&id].parameters.rto_max as u64);
                    self.arm_timer(Instant::now() + rto, TimerKind::InitRtx(id));
                } else if lost {
                    debug!("association {id}: INIT attempts exhausted");
                    out.push(Event::CommunicationLost {
                        assoc_id: id,
                        reason: LossReason::InitFailed,
                    });
                }
            }
            TimerKind::CookieRtx(id) => {
                if let Some(assoc) = self.assocs.get(&id) {
                    if assoc.state == AssocState::CookieEchoed {
                        let echo = Chunk::CookieEcho {
                            echo_tag: assoc.peer_tag,
                        };
                        self.send_chunk(assoc, echo);
                        let rto = Duration::from_millis(assoc.parameters.rto_max as u64);
                        self.arm_timer(Instant::now() + rto, TimerKind::CookieRtx(id));
                    }
                }
            }
            TimerKind::ShutdownRtx(id) => {
                let give_up = match self.assocs.get_mut(&id) {
                    Some(assoc) if assoc.state == AssocState::ShutdownSent => {
                        if assoc.init_attempts_left > 0 {
                            assoc.init_attempts_left -= 1;
                            false
                        } else {
                            assoc.state = AssocState::Closed;
                            true
                        }
                    }
                    _ => return,
                };
                if give_up {
                    // Peer never acknowledged; report completion locally.
                    out.push(Event::ShutdownComplete { assoc_id: id });
                } else {
                    let assoc = &self.assocs[&id];
                    self.send_chunk(assoc, Chunk::Shutdown);
                    let rto = Duration::from_millis(assoc.parameters.rto_max as u64);
                    self.arm_timer(Instant::now() + rto, TimerKind::ShutdownRtx(id));
                }
            }
            TimerKind::Heartbeat(id, path) => {
                if let Some(assoc) = self.assocs.get(&id) {
                    let enabled = assoc
                        .paths
                        .get(path as usize)
                        .map(|p| p.heartbeat_enabled)
                        .unwrap_or(false);
                    if enabled && assoc.state == AssocState::Established {
                        self.send_chunk(
                            assoc,
                            Chunk::Heartbeat {
                                info: Bytes::from_static(b"hb"),
                            },
                        );
                        let interval = Duration::from_millis(
                            assoc.paths[path as usize].heartbeat_interval as u64,
                        );
                        self.arm_timer(Instant::now() + interval, TimerKind::Heartbeat(id, path));
                    }
                }
            }
        }
    }
}

impl Engine for DatagramEngine {
    fn register_instance(
        &mut self,
        local_port: u16,
        in_streams: u16,
        out_streams: u16,
        local_addresses: &[SocketAddress],
    ) -> Result<InstanceId> {
        if local_addresses.is_empty() {
            return Err(Error::ErrInvalidArgument);
        }
        let bind_ip = local_addresses[0]
            .as_internet()
            .ok_or(Error::ErrFamilyUnsupported)?
            .ip();
        let bind_addr = SocketAddr::new(bind_ip, local_port);
        let mut socket = UdpSocket::bind(bind_addr).map_err(|e| {
            debug!("bind {bind_addr} failed: {e}");
            match e.raw_os_error() {
                Some(errno) if errno == libc::EADDRINUSE => Error::ErrAddressInUse,
                Some(errno) if errno == libc::EACCES => Error::ErrPermissionDenied,
                _ => Error::ErrAddressNotAvailable,
            }
        })?;
        let actual_port = socket.local_addr().map(|a| a.port()).unwrap_or(local_port);

        let token = self.alloc_token();
        self.registry
            .register(&mut socket, token, Interest::READABLE)?;

        let id = self.next_instance;
        self.next_instance += 1;
        let mut addresses = local_addresses.to_vec();
        for a in addresses.iter_mut() {
            a.set_port(actual_port);
        }
        self.instances.insert(
            id,
            Instance {
                local_port: actual_port,
                in_streams,
                out_streams,
                addresses,
                socket,
                token,
                parameters: InstanceParameters {
                    in_streams,
                    out_streams,
                    ..InstanceParameters::default()
                },
            },
        );
        self.tokens.insert(token, TokenTarget::Instance(id));
        debug!("registered instance {id} on port {actual_port}");
        Ok(id)
    }

    fn unregister_instance(&mut self, instance: InstanceId) -> Result<()> {
        let mut inst = self
            .instances
            .remove(&instance)
            .ok_or(Error::ErrInvalidArgument)?;
        self.tokens.remove(&inst.token);
        let _ = self.registry.deregister(&mut inst.socket);
        debug!("unregistered instance {instance}");
        Ok(())
    }

    fn local_addresses(&self, instance: InstanceId) -> Result<Vec<SocketAddress>> {
        self.instances
            .get(&instance)
            .map(|i| i.addresses.clone())
            .ok_or(Error::ErrInvalidArgument)
    }

    fn add_local_address(&mut self, instance: InstanceId, address: &SocketAddress) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(Error::ErrInvalidArgument)?;
        let mut address = address.clone();
        address.set_port(inst.local_port);
        if !inst.addresses.contains(&address) {
            inst.addresses.push(address);
        }
        Ok(())
    }

    fn remove_local_address(
        &mut self,
        instance: InstanceId,
        address: &SocketAddress,
    ) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(Error::ErrInvalidArgument)?;
        if inst.addresses.len() <= 1 {
            return Err(Error::ErrInvalidArgument);
        }
        let mut address = address.clone();
        address.set_port(inst.local_port);
        inst.addresses.retain(|a| a != &address);
        Ok(())
    }

    fn instance_parameters(&self, instance: InstanceId) -> Result<InstanceParameters> {
        self.instances
            .get(&instance)
            .map(|i| i.parameters.clone())
            .ok_or(Error::ErrInvalidArgument)
    }

    fn set_instance_parameters(
        &mut self,
        instance: InstanceId,
        parameters: &InstanceParameters,
    ) -> Result<()> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(Error::ErrInvalidArgument)?;
        inst.parameters = parameters.clone();
        Ok(())
    }

    fn associate(
        &mut self,
        instance: InstanceId,
        out_streams: u16,
        destinations: &[SocketAddress],
        dest_port: u16,
    ) -> Result<AssocId> {
        let inst = self
            .instances
            .get(&instance)
            .ok_or(Error::ErrInvalidArgument)?;
        let primary = destinations
            .first()
            .and_then(|d| d.as_internet())
            .ok_or(Error::ErrInvalidArgument)?;
        let peer = SocketAddr::new(primary.ip(), dest_port);

        let local_tag = rand::thread_rng().gen_range(1..u32::MAX);
        let id = self.next_assoc;
        self.next_assoc += 1;

        let paths = destinations
            .iter()
            .map(|d| PathConfig {
                address: d.address_string(PRINT_FORMAT),
                heartbeat_enabled: false,
                heartbeat_interval: 30000,
                state: PathState::Reachable,
            })
            .collect();

        let init = Chunk::Init {
            initiate_tag: local_tag,
            out_streams: out_streams.max(1),
            in_streams: inst.in_streams,
            initial_tsn: rand::thread_rng().gen(),
            addresses: inst
                .addresses
                .iter()
                .map(|a| a.address_string(PRINT_FORMAT))
                .collect(),
        };
        let packet = Packet {
            source_port: inst.local_port,
            destination_port: dest_port,
            verification_tag: 0,
            chunks: vec![init],
        };
        let raw = packet.marshal(self.library.checksum_crc32);
        let _ = inst.socket.send_to(&raw, peer);

        let parameters = AssocParameters {
            rto_initial: inst.parameters.rto_initial,
            rto_min: inst.parameters.rto_min,
            rto_max: inst.parameters.rto_max,
            assoc_max_retransmits: inst.parameters.assoc_max_retransmits,
        };
        let attempts = inst.parameters.max_init_retransmits;
        let rto = Duration::from_millis(parameters.rto_max as u64);
        let core = AssocCore {
            instance,
            state: AssocState::CookieWait,
            passive: false,
            local_tag,
            peer_tag: 0,
            peer,
            dest_port,
            paths,
            primary_path: 0,
            in_streams: inst.in_streams,
            out_streams: out_streams.max(1),
            next_tsn: rand::thread_rng().gen(),
            next_ssn: HashMap::new(),
            recv_queues: HashMap::new(),
            buffered_recv_bytes: 0,
            init_attempts_left: attempts,
            handshake_packet: Some(raw),
            parameters,
            send_buffer: DEFAULT_SEND_BUFFER,
            recv_buffer: DEFAULT_RECV_BUFFER,
            traffic_class: 0,
            stream_traffic_class: HashMap::new(),
        };
        self.assocs.insert(id, core);
        self.arm_timer(Instant::now() + rto, TimerKind::InitRtx(id));
        debug!("association {id}: INIT sent to {peer}");
        Ok(id)
    }

    fn shutdown(&mut self, assoc: AssocId) {
        let rto = match self.assocs.get_mut(&assoc) {
            Some(core) => {
                match core.state {
                    AssocState::Established
                    | AssocState::CookieWait
                    | AssocState::CookieEchoed => {}
                    _ => return,
                }
                core.state = AssocState::ShutdownSent;
                core.init_attempts_left = core.parameters.assoc_max_retransmits;
                Duration::from_millis(core.parameters.rto_max as u64)
            }
            None => return,
        };
        self.cancel_timer(TimerKind::InitRtx(assoc));
        self.cancel_timer(TimerKind::CookieRtx(assoc));
        let core = &self.assocs[&assoc];
        self.send_chunk(core, Chunk::Shutdown);
        self.arm_timer(Instant::now() + rto, TimerKind::ShutdownRtx(assoc));
    }

    fn abort(&mut self, assoc: AssocId) {
        let send = match self.assocs.get_mut(&assoc) {
            Some(core) => {
                let was_closed = core.state == AssocState::Closed;
                core.state = AssocState::Closed;
                !was_closed
            }
            None => return,
        };
        self.cancel_assoc_timers(assoc);
        if send {
            let core = &self.assocs[&assoc];
            self.send_chunk(core, Chunk::Abort);
            // The local side learns of the loss through the regular event
            // path, exactly like a peer-initiated abort.
            self.queued.push(Event::CommunicationLost {
                assoc_id: assoc,
                reason: LossReason::PeerAbort,
            });
        }
    }

    fn delete_association(&mut self, assoc: AssocId) -> Result<()> {
        self.cancel_assoc_timers(assoc);
        self.assocs
            .remove(&assoc)
            .map(|_| ())
            .ok_or(Error::ErrInvalidArgument)
    }

    fn instance_of(&self, assoc: AssocId) -> Option<InstanceId> {
        self.assocs.get(&assoc).map(|a| a.instance)
    }

    fn association_status(&self, assoc: AssocId) -> Result<AssociationStatus> {
        let core = self.assoc(assoc)?;
        let primary = core
            .paths
            .get(core.primary_path as usize)
            .map(|p| p.address.clone())
            .unwrap_or_default();
        Ok(AssociationStatus {
            state: core.state,
            number_of_destination_paths: core.paths.len() as u16,
            primary_destination_address: primary,
            primary_address_index: core.primary_path,
            dest_port: core.dest_port,
            in_streams: core.in_streams,
            out_streams: core.out_streams,
            current_receiver_window: (core.recv_buffer - core.buffered_recv_bytes) as u32,
            outstanding_bytes: 0,
            rto_initial: core.parameters.rto_initial,
            rto_min: core.parameters.rto_min,
            rto_max: core.parameters.rto_max,
            assoc_max_retransmits: core.parameters.assoc_max_retransmits,
        })
    }

    fn set_association_status(
        &mut self,
        assoc: AssocId,
        status: &AssociationStatus,
    ) -> Result<()> {
        let core = self.assoc_mut(assoc)?;
        core.parameters.rto_initial = status.rto_initial;
        core.parameters.rto_min = status.rto_min;
        core.parameters.rto_max = status.rto_max;
        core.parameters.assoc_max_retransmits = status.assoc_max_retransmits;
        if (status.primary_address_index as usize) < core.paths.len() {
            core.primary_path = status.primary_address_index;
        }
        Ok(())
    }

    fn remote_addresses(&self, assoc: AssocId) -> Result<Vec<SocketAddress>> {
        let core = self.assoc(assoc)?;
        let mut addresses = Vec::with_capacity(core.paths.len());
        for path in &core.paths {
            if let Ok(a) = SocketAddress::parse(&path.address, core.dest_port) {
                addresses.push(a);
            }
        }
        Ok(addresses)
    }

    fn path_status(&self, assoc: AssocId, path_index: u16) -> Result<PathStatus> {
        let core = self.assoc(assoc)?;
        let path = core
            .paths
            .get(path_index as usize)
            .ok_or(Error::ErrInvalidArgument)?;
        Ok(PathStatus {
            destination_address: path.address.clone(),
            state: path.state,
            heartbeat_enabled: path.heartbeat_enabled,
            heartbeat_interval: path.heartbeat_interval,
            rto: core.parameters.rto_initial,
            path_mtu: RECEIVE_MTU as u32,
        })
    }

    fn primary_path(&self, assoc: AssocId) -> Result<u16> {
        Ok(self.assoc(assoc)?.primary_path)
    }

    fn set_primary(&mut self, assoc: AssocId, path_index: u16) -> Result<()> {
        let core = self.assoc_mut(assoc)?;
        if (path_index as usize) >= core.paths.len() {
            return Err(Error::ErrInvalidArgument);
        }
        core.primary_path = path_index;
        Ok(())
    }

    fn set_peer_primary(&mut self, assoc: AssocId, address: &SocketAddress) -> Result<()> {
        // Advisory towards the peer; the datagram engine records it locally.
        let wanted = address.address_string(PRINT_FORMAT);
        let core = self.assoc_mut(assoc)?;
        match core.paths.iter().position(|p| p.address == wanted) {
            Some(index) => {
                core.primary_path = index as u16;
                Ok(())
            }
            None => Err(Error::ErrAddressNotAvailable),
        }
    }

    fn change_heartbeat(
        &mut self,
        assoc: AssocId,
        path_index: u16,
        enabled: bool,
        interval: u32,
    ) -> Result<()> {
        let core = self.assoc_mut(assoc)?;
        let path = core
            .paths
            .get_mut(path_index as usize)
            .ok_or(Error::ErrInvalidArgument)?;
        path.heartbeat_enabled = enabled;
        path.heartbeat_interval = interval;
        if enabled {
            let interval = Duration::from_millis(interval as u64);
            self.arm_timer(Instant::now() + interval, TimerKind::Heartbeat(assoc, path_index));
        }
        Ok(())
    }

    fn request_heartbeat(&mut self, assoc: AssocId, path_index: u16) -> Result<()> {
        let core = self.assoc(assoc)?;
        if (path_index as usize) >= core.paths.len() {
            return Err(Error::ErrInvalidArgument);
        }
        self.send_chunk(
            core,
            Chunk::Heartbeat {
                info: Bytes::from_static(b"hb"),
            },
        );
        Ok(())
    }

    fn send(
        &mut self,
        assoc: AssocId,
        stream: u16,
        data: &[u8],
        ppid: u32,
        time_to_live: u32,
        unordered: bool,
        bundle_disabled: bool,
    ) -> Result<SendResult> {
        let _ = (time_to_live, bundle_disabled);
        let core = self.assoc_mut(assoc)?;
        match core.state {
            AssocState::Established => {}
            AssocState::CookieWait | AssocState::CookieEchoed => {
                // Not yet writable; the caller's blocking loop retries.
                return Ok(SendResult::QueueExceeded);
            }
            _ => return Err(Error::ErrShutdown),
        }
        if stream >= core.out_streams {
            return Err(Error::ErrInvalidArgument);
        }
        if data.len() + COMMON_OVERHEAD > RECEIVE_MTU {
            return Err(Error::ErrInvalidArgument);
        }

        let tsn = core.next_tsn;
        core.next_tsn = core.next_tsn.wrapping_add(1);
        let ssn = {
            let entry = core.next_ssn.entry(stream).or_insert(0);
            let ssn = *entry;
            if !unordered {
                *entry = entry.wrapping_add(1);
            }
            ssn
        };
        let chunk = Chunk::Data {
            tsn,
            stream,
            ssn,
            ppid,
            unordered,
            user_data: Bytes::copy_from_slice(data),
        };
        let core = &self.assocs[&assoc];
        self.send_chunk(core, chunk);
        Ok(SendResult::Sent)
    }

    fn receive(
        &mut self,
        assoc: AssocId,
        stream: u16,
        max_len: usize,
        peek: bool,
    ) -> Result<ReceivedChunk> {
        let core = self.assoc_mut(assoc)?;
        let queue = core
            .recv_queues
            .get_mut(&stream)
            .ok_or(Error::ErrAgain)?;
        let message = queue.front_mut().ok_or(Error::ErrAgain)?;
        let end = (message.offset + max_len).min(message.data.len());
        let data = message.data.slice(message.offset..end);
        let ssn = message.ssn;
        let tsn = message.tsn;
        if !peek {
            message.offset = end;
            core.buffered_recv_bytes -= data.len();
            if message.offset >= message.data.len() {
                queue.pop_front();
            }
        }
        Ok(ReceivedChunk { data, ssn, tsn })
    }

    fn send_buffer_size(&self, assoc: AssocId) -> Result<usize> {
        Ok(self.assoc(assoc)?.send_buffer)
    }

    fn set_send_buffer_size(&mut self, assoc: AssocId, size: usize) -> Result<()> {
        self.assoc_mut(assoc)?.send_buffer = size;
        Ok(())
    }

    fn receive_buffer_size(&self, assoc: AssocId) -> Result<usize> {
        Ok(self.assoc(assoc)?.recv_buffer)
    }

    fn set_receive_buffer_size(&mut self, assoc: AssocId, size: usize) -> Result<()> {
        self.assoc_mut(assoc)?.recv_buffer = size;
        Ok(())
    }

    fn traffic_class(&self, assoc: AssocId, stream: i32) -> Result<u8> {
        let core = self.assoc(assoc)?;
        if stream < 0 {
            return Ok(core.traffic_class);
        }
        Ok(core
            .stream_traffic_class
            .get(&(stream as u16))
            .copied()
            .unwrap_or(core.traffic_class))
    }

    fn set_traffic_class(&mut self, assoc: AssocId, stream: i32, tc: u8) -> Result<()> {
        let core = self.assoc_mut(assoc)?;
        if stream < 0 {
            core.traffic_class = tc;
            core.stream_traffic_class.clear();
        } else {
            core.stream_traffic_class.insert(stream as u16, tc);
        }
        Ok(())
    }

    fn library_parameters(&self) -> LibraryParameters {
        self.library.clone()
    }

    fn set_library_parameters(&mut self, parameters: &LibraryParameters) -> Result<()> {
        self.library = parameters.clone();
        Ok(())
    }

    fn register_user_fd(&mut self, fd: RawFd, events: i16) -> Result<()> {
        if self.user_fds.contains_key(&fd) {
            return Ok(());
        }
        let token = self.alloc_token();
        let mut interest = Interest::READABLE;
        if events & libc::POLLOUT != 0 {
            interest = if events & (libc::POLLIN | libc::POLLPRI) != 0 {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::WRITABLE
            };
        }
        self.registry
            .register(&mut SourceFd(&fd), token, interest)?;
        self.tokens.insert(token, TokenTarget::UserFd(fd));
        self.user_fds
            .insert(fd, UserFdRegistration { events, token });
        Ok(())
    }

    fn unregister_user_fd(&mut self, fd: RawFd) -> Result<()> {
        if let Some(reg) = self.user_fds.remove(&fd) {
            self.tokens.remove(&reg.token);
            let _ = self.registry.deregister(&mut SourceFd(&fd));
        }
        Ok(())
    }

    fn attach_waiter(&mut self) -> Result<Box<dyn EngineWaiter>> {
        let poll = self.poll.take().ok_or(Error::ErrInvalidArgument)?;
        Ok(Box::new(MioWaiter {
            poll,
            events: Events::with_capacity(128),
        }))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    fn drive(&mut self, ready: &[Readiness], out: &mut Vec<Event>) {
        out.append(&mut self.queued);

        let mut buf = [0u8; RECEIVE_MTU];
        for readiness in ready {
            let token = Token(readiness.token as usize);
            match self.tokens.get(&token).copied() {
                Some(TokenTarget::Instance(id)) => loop {
                    let recv = match self.instances.get(&id) {
                        Some(inst) => inst.socket.recv_from(&mut buf),
                        None => break,
                    };
                    match recv {
                        Ok((len, from)) => {
                            let raw = Bytes::copy_from_slice(&buf[..len]);
                            self.handle_datagram(id, from, raw, out);
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            trace!("recv_from on instance {id} failed: {e}");
                            break;
                        }
                    }
                },
                Some(TokenTarget::UserFd(fd)) => {
                    // One-shot: report and drop the registration so a ready
                    // fd cannot spin the event loop.
                    let events = self.user_fds.get(&fd).map(|r| r.events).unwrap_or(0);
                    let mut revents = 0i16;
                    if readiness.readable {
                        revents |= libc::POLLIN;
                    }
                    if readiness.writable {
                        revents |= libc::POLLOUT;
                    }
                    if readiness.error {
                        revents |= libc::POLLERR;
                    }
                    let _ = self.unregister_user_fd(fd);
                    out.push(Event::UserSocket {
                        fd,
                        revents: revents & (events | libc::POLLERR),
                    });
                }
                None => {}
            }
        }

        let now = Instant::now();
        loop {
            let due = self
                .timers
                .iter()
                .position(|t| t.deadline <= now)
                .map(|i| self.timers.swap_remove(i));
            match due {
                Some(timer) => self.fire_timer(timer.kind, out),
                None => break,
            }
        }
    }
}

struct MioWaiter {
    poll: Poll,
    events: Events,
}

impl EngineWaiter for MioWaiter {
    fn wait(&mut self, timeout: Option<Duration>) -> Vec<Readiness> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Vec::new(),
            Err(e) => {
                warn!("event poll failed: {e}");
                return Vec::new();
            }
        }
        self.events
            .iter()
            .map(|event| Readiness {
                token: event.token().0 as u64,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
            })
            .collect()
    }
}
