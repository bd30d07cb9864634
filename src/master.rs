use crate::address::SocketAddress;
use crate::association::Association;
use crate::engine::{
    AssocId, DatagramEngine, Engine, Event, InstanceId, LibraryParameters, LossReason, PathState,
};
use crate::error::{Error, Result};
use crate::notification::{
    AssocChangeState, NotificationContent, PeerAddrChangeState, SctpNotification,
};
use crate::socket::{
    IncomingConnection, ReceiveInfo, ReceiveOutcome, ReceiveScope, SctpSocket, SendOnce,
    SSF_AUTO_CONNECT, SSF_GLOBAL_QUEUE,
};
use crate::sync::{Condition, ReentrantMutex};
use crate::{MSG_ABORT, MSG_DONTWAIT, MSG_EOF, SCTP_MAX_NUM_ADDRESSES};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use rand::Rng;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

pub type SocketId = u64;

/// Wait quantum for every blocking loop; between expiries the loops poll
/// auto-connect state, exactly as the callback-driven design requires.
const WAIT_SLICE_US: u64 = 100_000;
const GC_INTERVAL: Duration = Duration::from_secs(1);

/// Deferred-delete sets. Nothing is destroyed from inside an engine event
/// handler; ids land here and the event-loop thread reaps them between
/// events.
#[derive(Default)]
pub struct GcSets {
    pub closing_instances: HashSet<InstanceId>,
    pub closing_assocs: Vec<(AssocId, InstanceId)>,
}

impl GcSets {
    pub fn delayed_delete_association(&mut self, instance: InstanceId, assoc: AssocId) {
        trace!("delayed delete: association {assoc} on instance {instance}");
        self.closing_assocs.push((assoc, instance));
    }

    pub fn delayed_delete_instance(&mut self, instance: InstanceId) {
        trace!("delayed delete: instance {instance}");
        self.closing_instances.insert(instance);
    }
}

/// Registration of an external OS descriptor whose readiness select/poll
/// wants to observe through the engine's event loop.
pub struct UserNotification {
    pub event_mask: i16,
    pub events: i16,
    pub condition: Arc<Condition>,
    refs: u32,
}

pub struct MasterState {
    pub engine: Box<dyn Engine>,
    pub sockets: HashMap<SocketId, SctpSocket>,
    pub instance_registry: HashMap<InstanceId, SocketId>,
    pub gc: GcSets,
    pub user_notifications: HashMap<RawFd, UserNotification>,
    pub(crate) break_pipe: [RawFd; 2],
    pub break_condition: Arc<Condition>,
    pub(crate) last_gc: Instant,
    pub(crate) next_socket_id: SocketId,
}

/// The singleton that owns the engine, its event-loop thread and every
/// registry. All state sits behind one recursive lock; blocking calls
/// release it while waiting on a condition.
pub struct SocketMaster {
    state: ReentrantMutex<RefCell<MasterState>>,
    thread_started: AtomicBool,
}

static MASTER: OnceLock<Option<SocketMaster>> = OnceLock::new();

impl SocketMaster {
    /// The master instance, or `None` when the engine could not be
    /// initialized (then every SCTP call reports the engine unavailable).
    pub fn instance() -> Option<&'static SocketMaster> {
        MASTER
            .get_or_init(|| match MasterState::new() {
                Ok(state) => Some(SocketMaster {
                    state: ReentrantMutex::new(RefCell::new(state)),
                    thread_started: AtomicBool::new(false),
                }),
                Err(e) => {
                    error!("SCTP engine initialization failed: {e}");
                    None
                }
            })
            .as_ref()
    }

    pub fn try_instance() -> Result<&'static SocketMaster> {
        SocketMaster::instance().ok_or(Error::ErrEngineUnavailable)
    }

    /// Runs `f` with the global lock held.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MasterState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut *state)
    }

    pub fn is_running(&self) -> bool {
        self.thread_started.load(Ordering::SeqCst)
    }

    /// Starts the event-loop thread on first demand (the first bind). Start
    /// attempts serialize on the global lock, and the started flag is set
    /// only after the spawn succeeded, so a failed attempt (thread resources
    /// exhausted) surfaces to this caller and the next caller retries.
    pub fn ensure_running(&'static self) -> Result<()> {
        if self.thread_started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.with_state(|_state| {
            if self.thread_started.load(Ordering::SeqCst) {
                return Ok(());
            }
            thread::Builder::new()
                .name("sctp-socket-master".to_string())
                .spawn(move || self.run())
                .map_err(|e| {
                    error!("unable to start the SCTP event-loop thread: {e}");
                    Error::from(e)
                })?;
            self.thread_started.store(true, Ordering::SeqCst);
            info!("SCTP event-loop thread started");
            Ok(())
        })
    }

    /// The event loop: wait for IO or the next timer, drain engine events
    /// under the lock, then run garbage collection when its interval is up.
    /// The waiter is attached here, not by the spawner, so a failed spawn
    /// leaves the engine poller available for the retry.
    fn run(&'static self) {
        let waiter = self.with_state(|state| {
            state.register_break_pipe();
            state.engine.attach_waiter()
        });
        let mut waiter = match waiter {
            Ok(waiter) => waiter,
            Err(e) => {
                error!("unable to attach the engine waiter: {e}");
                return;
            }
        };
        loop {
            let timeout = self.with_state(|state| {
                let now = Instant::now();
                let gc_deadline = state.last_gc + GC_INTERVAL;
                let deadline = match state.engine.next_deadline() {
                    Some(deadline) => deadline.min(gc_deadline),
                    None => gc_deadline,
                };
                deadline.saturating_duration_since(now)
            });
            let ready = waiter.wait(Some(timeout.max(Duration::from_millis(1))));
            self.with_state(|state| {
                let mut events = Vec::new();
                state.engine.drive(&ready, &mut events);
                for event in events {
                    state.handle_event(event);
                }
                if state.last_gc.elapsed() >= GC_INTERVAL {
                    state.socket_garbage_collection();
                }
            });
        }
    }

    /// Wakes the event-loop thread through the break pipe.
    pub fn wake_event_loop(&self) {
        let write_end = self.with_state(|state| state.break_pipe[1]);
        if write_end >= 0 {
            let byte = b'T';
            unsafe {
                libc::write(write_end, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    // ====== Socket arena ================================================

    pub fn create_socket(&self, flags: u32) -> SocketId {
        self.with_state(|state| {
            let id = state.next_socket_id;
            state.next_socket_id += 1;
            state.sockets.insert(id, SctpSocket::new(id, flags));
            debug!("created SCTP socket {id} (flags {flags:#x})");
            id
        })
    }

    /// Closes and removes a socket: destroys every remaining association,
    /// unbinds, drops the arena entry. `send_abort` selects abort over
    /// graceful shutdown for the teardown (the SO_LINGER decision).
    pub fn close_socket(&self, socket_id: SocketId, send_abort: bool) {
        self.with_state(|state| {
            let MasterState {
                engine,
                sockets,
                instance_registry,
                gc,
                ..
            } = state;
            if let Some(mut socket) = sockets.remove(&socket_id) {
                let remaining: Vec<AssocId> = socket.assoc_list.keys().copied().collect();
                for assoc_id in remaining {
                    if send_abort {
                        if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                            a.abort(engine.as_mut());
                        }
                    }
                    socket.destroy_association(assoc_id, engine.as_mut(), gc);
                }
                socket.unbind(engine.as_mut(), instance_registry, gc, send_abort);
                debug!("closed SCTP socket {socket_id}");
            }
        });
    }

    /// Destroys one association of a socket (the close path of an
    /// association-level descriptor). `send_abort` selects abort over
    /// graceful shutdown.
    pub fn close_association(&self, socket_id: SocketId, assoc_id: AssocId, send_abort: bool) {
        self.with_state(|state| {
            let MasterState {
                engine,
                sockets,
                gc,
                ..
            } = state;
            if let Some(socket) = sockets.get_mut(&socket_id) {
                if socket.assoc_list.contains_key(&assoc_id) {
                    if send_abort {
                        if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                            a.abort(engine.as_mut());
                        }
                    }
                    socket.destroy_association(assoc_id, engine.as_mut(), gc);
                }
            }
        });
    }

    // ====== Blocking operations =========================================

    pub fn associate_blocking(
        &'static self,
        socket_id: SocketId,
        out_streams: u16,
        max_attempts: u16,
        max_init_timeout: u32,
        destinations: &[SocketAddress],
        blocking: bool,
    ) -> Result<AssocId> {
        self.ensure_running()?;
        let (assoc_id, establish) = self.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let socket = sockets.get_mut(&socket_id).ok_or(Error::ErrBadDescriptor)?;
            let assoc_id = socket.start_associate(
                engine.as_mut(),
                out_streams,
                max_attempts,
                max_init_timeout,
                destinations,
            )?;
            let establish = socket.assoc_list[&assoc_id].establish_condition.clone();
            Ok::<_, Error>((assoc_id, establish))
        })?;

        if blocking {
            while !establish.timed_wait(WAIT_SLICE_US) {
                self.with_state(|state| {
                    if let Some(socket) = state.sockets.get_mut(&socket_id) {
                        socket.check_auto_connect();
                    }
                });
            }
            return self.with_state(|state| {
                let MasterState {
                    engine,
                    sockets,
                    gc,
                    ..
                } = state;
                let socket = sockets.get_mut(&socket_id).ok_or(Error::ErrBadDescriptor)?;
                let up = socket
                    .assoc_list
                    .get(&assoc_id)
                    .map(|a| a.comm_up_notification)
                    .unwrap_or(false);
                if !up {
                    debug!("association {assoc_id} failed to establish");
                    if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                        a.use_count = a.use_count.saturating_sub(1);
                    }
                    if socket.assoc_list.contains_key(&assoc_id) {
                        socket.destroy_association(assoc_id, engine.as_mut(), gc);
                    }
                    return Err(Error::ErrIo);
                }
                let _ = engine.set_traffic_class(assoc_id, -1, socket.default_traffic_class);
                if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                    a.use_count = a.use_count.saturating_sub(1);
                }
                Ok(assoc_id)
            });
        }

        self.with_state(|state| {
            if let Some(socket) = state.sockets.get_mut(&socket_id) {
                if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                    a.use_count = a.use_count.saturating_sub(1);
                }
            }
        });
        Ok(assoc_id)
    }

    pub fn accept_blocking(
        &self,
        socket_id: SocketId,
        blocking: bool,
    ) -> Result<(AssocId, Vec<SocketAddress>)> {
        loop {
            let step = self.with_state(|state| {
                let socket = state
                    .sockets
                    .get_mut(&socket_id)
                    .ok_or(Error::ErrBadDescriptor)?;
                match socket.accept_step()? {
                    Some((assoc_id, notification)) => {
                        let mut addresses = Vec::new();
                        for address in &notification.remote_addresses {
                            match SocketAddress::parse(address, notification.remote_port) {
                                Ok(a) => addresses.push(a),
                                Err(_) => warn!(
                                    "accept: bad address {address}, port {}",
                                    notification.remote_port
                                ),
                            }
                        }
                        Ok(Some((assoc_id, addresses)))
                    }
                    None => Ok::<_, Error>(None),
                }
            })?;
            if let Some(accepted) = step {
                debug!("accepted association {}", accepted.0);
                return Ok(accepted);
            }
            if !blocking {
                return Err(Error::ErrAgain);
            }
            let establish = self.with_state(|state| {
                state
                    .sockets
                    .get(&socket_id)
                    .map(|s| s.establish_condition.clone())
                    .ok_or(Error::ErrBadDescriptor)
            })?;
            while !establish.timed_wait(WAIT_SLICE_US) {
                self.with_state(|state| {
                    if let Some(socket) = state.sockets.get_mut(&socket_id) {
                        socket.check_auto_connect();
                    }
                });
            }
        }
    }

    pub fn receive_blocking(
        &self,
        socket_id: SocketId,
        scope: ReceiveScope,
        buf: &mut [u8],
        flags: i32,
    ) -> Result<ReceiveInfo> {
        loop {
            enum Next {
                Done(ReceiveInfo),
                Wait(Arc<Condition>),
                Retry,
            }
            let next = self.with_state(|state| {
                let MasterState {
                    engine, sockets, ..
                } = state;
                let socket = sockets.get_mut(&socket_id).ok_or(Error::ErrBadDescriptor)?;
                match socket.internal_receive_step(engine.as_mut(), scope, buf, flags) {
                    Ok(ReceiveOutcome::Received(info)) => Ok(Next::Done(info)),
                    Ok(ReceiveOutcome::Eof(info)) => Ok(Next::Done(info)),
                    Ok(ReceiveOutcome::WouldBlock) => {
                        if flags & MSG_DONTWAIT != 0 {
                            return Err(Error::ErrAgain);
                        }
                        let condition = match scope {
                            ReceiveScope::Global => socket.global_queue.update_condition(),
                            ReceiveScope::Assoc(assoc_id) => socket
                                .assoc_list
                                .get(&assoc_id)
                                .ok_or(Error::ErrBadDescriptor)?
                                .in_queue
                                .update_condition(),
                        };
                        Ok(Next::Wait(condition.clone()))
                    }
                    Err(Error::ErrAgain) => {
                        if flags & MSG_DONTWAIT != 0 {
                            Err(Error::ErrAgain)
                        } else {
                            Ok(Next::Retry)
                        }
                    }
                    Err(e) => Err(e),
                }
            })?;
            match next {
                Next::Done(info) => {
                    if scope == ReceiveScope::Global {
                        self.with_state(|state| {
                            if let Some(socket) = state.sockets.get_mut(&socket_id) {
                                socket.check_auto_connect();
                            }
                        });
                    }
                    return Ok(info);
                }
                Next::Retry => continue,
                Next::Wait(condition) => {
                    while !condition.timed_wait(WAIT_SLICE_US) {
                        self.with_state(|state| {
                            if let Some(socket) = state.sockets.get_mut(&socket_id) {
                                socket.check_auto_connect();
                            }
                        });
                    }
                }
            }
        }
    }

    /// Sends on an existing association, waiting out transient queue
    /// pressure unless MSG_DONTWAIT asks otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn send_blocking(
        &self,
        socket_id: SocketId,
        assoc_id: AssocId,
        buf: &[u8],
        flags: i32,
        stream_id: u16,
        proto_id: u32,
        time_to_live: u32,
        use_defaults: bool,
    ) -> Result<usize> {
        let (stream_id, proto_id, time_to_live) = self.with_state(|state| {
            let socket = state.sockets.get(&socket_id).ok_or(Error::ErrBadDescriptor)?;
            Ok::<_, Error>(socket.effective_send_parameters(
                assoc_id,
                stream_id,
                proto_id,
                time_to_live,
                use_defaults,
            ))
        })?;
        loop {
            enum Next {
                Done(usize),
                Wait(Arc<Condition>),
            }
            let next = self.with_state(|state| {
                let MasterState {
                    engine, sockets, ..
                } = state;
                let socket = sockets.get_mut(&socket_id).ok_or(Error::ErrBadDescriptor)?;
                match socket.internal_send_once(
                    engine.as_mut(),
                    assoc_id,
                    buf,
                    flags,
                    stream_id,
                    proto_id,
                    time_to_live,
                )? {
                    SendOnce::Sent(len) => Ok(Next::Done(len)),
                    SendOnce::QueueFull => {
                        if flags & MSG_DONTWAIT != 0 {
                            return Err(Error::ErrAgain);
                        }
                        let condition = socket
                            .assoc_list
                            .get(&assoc_id)
                            .ok_or(Error::ErrNotConnected)?
                            .ready_for_transmit
                            .clone();
                        Ok(Next::Wait(condition))
                    }
                }
            })?;
            match next {
                Next::Done(len) => return Ok(len),
                Next::Wait(condition) => {
                    condition.timed_wait(WAIT_SLICE_US);
                }
            }
        }
    }

    /// The sendto path: routes by association id or destination address,
    /// auto-connecting on a miss when the socket allows it.
    #[allow(clippy::too_many_arguments)]
    pub fn sendto_blocking(
        &'static self,
        socket_id: SocketId,
        buf: &[u8],
        flags: i32,
        assoc_id: AssocId,
        stream_id: u16,
        proto_id: u32,
        time_to_live: u32,
        max_attempts: u16,
        max_init_timeout: u32,
        use_defaults: bool,
        destination: Option<&SocketAddress>,
        out_streams: u16,
    ) -> Result<usize> {
        // ====== Find or create the target association ===================
        let mut target = self.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let socket = sockets.get_mut(&socket_id).ok_or(Error::ErrBadDescriptor)?;
            let found = match destination {
                Some(destination) => {
                    socket.association_for_destination(engine.as_ref(), destination)
                }
                None => socket.assoc_list.get(&assoc_id).map(|_| assoc_id),
            };
            if let Some(id) = found {
                if let Some(a) = socket.assoc_list.get_mut(&id) {
                    a.use_count += 1;
                }
            }
            Ok::<_, Error>(found)
        })?;

        let auto_connect = self.with_state(|state| {
            state
                .sockets
                .get(&socket_id)
                .map(|s| s.flags & SSF_AUTO_CONNECT != 0)
                .unwrap_or(false)
        });
        if target.is_none() && auto_connect {
            if let Some(destination) = destination {
                debug!(
                    "auto-connect: new outgoing association to {}",
                    destination
                );
                let created = self.associate_blocking(
                    socket_id,
                    out_streams,
                    max_attempts,
                    max_init_timeout,
                    std::slice::from_ref(destination),
                    flags & MSG_DONTWAIT == 0,
                )?;
                self.with_state(|state| {
                    if let Some(socket) = state.sockets.get_mut(&socket_id) {
                        socket.connectionless.insert(created);
                        if let Some(a) = socket.assoc_list.get_mut(&created) {
                            a.use_count += 1;
                        }
                    }
                });
                target = Some(created);
            }
        }
        let assoc_id = match target {
            Some(id) => id,
            None => return Err(Error::ErrIo),
        };

        // ====== Send ====================================================
        let result = if !buf.is_empty() {
            self.send_blocking(
                socket_id,
                assoc_id,
                buf,
                flags,
                stream_id,
                proto_id,
                time_to_live,
                use_defaults,
            )
        } else {
            Ok(0)
        };

        // ====== Shutdown-on-send flags ==================================
        if result.is_ok() && flags & (MSG_EOF | MSG_ABORT) != 0 {
            self.with_state(|state| {
                let MasterState {
                    engine,
                    sockets,
                    gc,
                    ..
                } = state;
                if let Some(socket) = sockets.get_mut(&socket_id) {
                    if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                        if flags & MSG_ABORT != 0 {
                            a.abort(engine.as_mut());
                        } else {
                            a.shutdown(engine.as_mut());
                        }
                    }
                    if socket.flags & SSF_AUTO_CONNECT != 0 {
                        debug!("auto-connect: shutdown of association {assoc_id} on send");
                        socket.connectionless.remove(&assoc_id);
                        socket.destroy_association(assoc_id, engine.as_mut(), gc);
                    }
                    socket.check_auto_connect();
                }
            });
        }

        // ====== Unpin ====================================================
        self.with_state(|state| {
            if let Some(socket) = state.sockets.get_mut(&socket_id) {
                if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                    a.last_usage = Instant::now();
                    if a.use_count > 0 {
                        a.use_count -= 1;
                    } else {
                        error!("sendto: too many use-count decrements on {assoc_id}");
                        std::process::abort();
                    }
                }
            }
        });
        result
    }

    // ====== User socket notifications (select support) ===================

    /// Registers interest in an external OS fd; the returned condition is
    /// broadcast when the event loop sees matching readiness.
    pub fn add_user_notification(&self, fd: RawFd, event_mask: i16) -> Result<Arc<Condition>> {
        let condition = self.with_state(|state| {
            let entry = state
                .user_notifications
                .entry(fd)
                .or_insert_with(|| UserNotification {
                    event_mask: 0,
                    events: 0,
                    condition: Condition::new("UserSocketNotification"),
                    refs: 0,
                });
            entry.refs += 1;
            entry.event_mask |= event_mask;
            entry.events = 0;
            let condition = entry.condition.clone();
            let mask = entry.event_mask;
            state.engine.register_user_fd(fd, mask)?;
            Ok::<_, Error>(condition)
        })?;
        self.wake_event_loop();
        Ok(condition)
    }

    /// Drops one registration reference and returns the accumulated events.
    pub fn remove_user_notification(&self, fd: RawFd) -> i16 {
        self.with_state(|state| {
            let remove = match state.user_notifications.get_mut(&fd) {
                Some(entry) => {
                    entry.refs -= 1;
                    entry.refs == 0
                }
                None => false,
            };
            let mut events = 0;
            if remove {
                if let Some(entry) = state.user_notifications.remove(&fd) {
                    events = entry.events;
                }
                let _ = state.engine.unregister_user_fd(fd);
            } else if let Some(entry) = state.user_notifications.get(&fd) {
                events = entry.events;
            }
            events
        })
    }

    // ====== Library toggles =============================================

    pub fn enable_ootb_handling(&self, enable: bool) -> Result<()> {
        self.with_state(|state| {
            let mut parameters = state.engine.library_parameters();
            parameters.send_ootb_aborts = enable;
            state.engine.set_library_parameters(&parameters)
        })
    }

    pub fn enable_crc32(&self, enable: bool) -> Result<()> {
        self.with_state(|state| {
            let mut parameters = state.engine.library_parameters();
            parameters.checksum_crc32 = enable;
            state.engine.set_library_parameters(&parameters)
        })
    }

    /// Random ephemeral port for the implicit bind path.
    pub fn random_port(&self) -> u16 {
        16384 + rand::thread_rng().gen_range(0..61000 - 16384) as u16
    }
}

impl MasterState {
    fn new() -> Result<MasterState> {
        let engine = DatagramEngine::new()?;
        let mut break_pipe = [-1 as RawFd; 2];
        unsafe {
            if libc::pipe(break_pipe.as_mut_ptr()) == 0 {
                let flags = libc::fcntl(break_pipe[0], libc::F_GETFL, 0);
                if flags < 0
                    || libc::fcntl(break_pipe[0], libc::F_SETFL, flags | libc::O_NONBLOCK) != 0
                {
                    warn!("unable to set the break pipe non-blocking");
                    libc::close(break_pipe[0]);
                    libc::close(break_pipe[1]);
                    break_pipe = [-1, -1];
                }
            } else {
                warn!("break pipe not available");
                break_pipe = [-1, -1];
            }
        }
        let mut state = MasterState {
            engine: Box::new(engine),
            sockets: HashMap::new(),
            instance_registry: HashMap::new(),
            gc: GcSets::default(),
            user_notifications: HashMap::new(),
            break_pipe,
            break_condition: Condition::new("BreakPipe"),
            last_gc: Instant::now(),
            next_socket_id: 1,
        };
        let parameters = LibraryParameters {
            send_ootb_aborts: false,
            checksum_crc32: true,
        };
        state.engine.set_library_parameters(&parameters)?;
        Ok(state)
    }

    fn register_break_pipe(&mut self) {
        if self.break_pipe[0] >= 0 {
            if let Err(e) = self
                .engine
                .register_user_fd(self.break_pipe[0], libc::POLLIN | libc::POLLPRI)
            {
                warn!("unable to register the break pipe: {e}");
            }
        }
    }

    /// Resolves assoc -> instance -> socket. The canonical first step of
    /// every event handler.
    pub fn socket_for_assoc(&self, assoc_id: AssocId) -> Option<SocketId> {
        let instance = self.engine.instance_of(assoc_id)?;
        self.instance_registry.get(&instance).copied()
    }

    /// Captures the association's current peer address list for a
    /// notification about to be enqueued.
    fn notification_base(&self, assoc_id: AssocId) -> (u16, Vec<String>) {
        let status = match self.engine.association_status(assoc_id) {
            Ok(status) => status,
            Err(_) => return (0, Vec::new()),
        };
        let count = (status.number_of_destination_paths as usize).min(SCTP_MAX_NUM_ADDRESSES);
        let mut addresses = Vec::with_capacity(count);
        for index in 0..count {
            match self.engine.path_status(assoc_id, index as u16) {
                Ok(path) => addresses.push(path.destination_address),
                Err(_) => warn!("notification: path {index} of {assoc_id} unavailable"),
            }
        }
        (status.dest_port, addresses)
    }

    /// Queues a notification towards the association's consumer, honoring
    /// the subscription mask, global-queue routing and the use-count pin.
    fn add_notification(&mut self, socket_id: SocketId, notification: SctpNotification) {
        let assoc_id = notification.assoc_id();
        let socket = match self.sockets.get_mut(&socket_id) {
            Some(socket) => socket,
            None => return,
        };
        let global = socket.flags & SSF_GLOBAL_QUEUE != 0;
        let (mask, peeled) = match socket.assoc_list.get(&assoc_id) {
            Some(a) => (a.notification_flags, a.peeled_off),
            // Association not found: already closed.
            None => return,
        };

        if notification.is_selected(mask) {
            if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                a.use_count += 1;
            }
            if global && !peeled {
                if socket.global_queue.add(notification).is_err() {
                    error!("global notification queue exhausted");
                }
                socket.read_ready =
                    socket.has_global_data() || !socket.connection_requests.is_empty();
            } else {
                let a = socket
                    .assoc_list
                    .get_mut(&assoc_id)
                    .expect("association vanished during enqueue");
                if a.in_queue.add(notification).is_err() {
                    error!("association notification queue exhausted");
                }
                a.read_ready = a.has_data();
            }
        } else if !(global && !peeled) {
            // The consumer does not want the notification, but a blocked
            // receive still has to wake up and re-evaluate.
            if let Some(a) = socket.assoc_list.get(&assoc_id) {
                a.in_queue.signal();
            }
        }
    }

    // ====== Event handlers ==============================================

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::DataArrive {
                assoc_id,
                stream,
                length,
                ppid,
                unordered,
            } => self.on_data_arrive(assoc_id, stream, length, ppid, unordered),
            Event::SendFailure {
                assoc_id,
                data,
                context,
            } => self.on_send_failure(assoc_id, data, context),
            Event::NetworkStatusChange {
                assoc_id,
                path_id,
                state,
            } => self.on_network_status_change(assoc_id, path_id, state),
            Event::CommunicationUp {
                assoc_id,
                destinations,
                in_streams,
                out_streams,
            } => self.on_communication_up(assoc_id, destinations, in_streams, out_streams),
            Event::CommunicationLost { assoc_id, reason } => {
                self.on_communication_lost(assoc_id, reason)
            }
            Event::CommunicationError { assoc_id, error } => {
                self.on_communication_error(assoc_id, error)
            }
            Event::Restart { assoc_id } => self.on_restart(assoc_id),
            Event::ShutdownReceived { assoc_id } => self.on_shutdown_received(assoc_id),
            Event::ShutdownComplete { assoc_id } => self.on_shutdown_complete(assoc_id),
            Event::QueueStatusChange { assoc_id, .. } => self.on_queue_status_change(assoc_id),
            Event::UserSocket { fd, revents } => self.on_user_socket(fd, revents),
        }
    }

    fn on_data_arrive(
        &mut self,
        assoc_id: AssocId,
        stream: u16,
        length: u32,
        ppid: u32,
        unordered: bool,
    ) {
        trace!("A{assoc_id:04} S{stream:02}: data arrive, length={length}, ppid={ppid}");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let (remote_port, remote_addresses) = self.notification_base(assoc_id);
        let mut notification = SctpNotification::new(NotificationContent::DataArrive {
            assoc_id,
            stream,
            ppid,
            unordered,
            bytes_arrived: length,
        });
        notification.remote_port = remote_port;
        notification.remote_addresses = remote_addresses;
        self.add_notification(socket_id, notification);
    }

    fn on_send_failure(&mut self, assoc_id: AssocId, data: Bytes, context: u32) {
        debug!("A{assoc_id:04}: send failure");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let (remote_port, remote_addresses) = self.notification_base(assoc_id);
        let mut notification = SctpNotification::new(NotificationContent::SendFailed {
            error: 0,
            assoc_id,
            context,
            data,
        });
        notification.remote_port = remote_port;
        notification.remote_addresses = remote_addresses;
        self.add_notification(socket_id, notification);
    }

    fn on_network_status_change(&mut self, assoc_id: AssocId, path_id: u16, state: PathState) {
        debug!("A{assoc_id:04}: network status change, path {path_id} now {state:?}");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let address = self
            .engine
            .path_status(assoc_id, path_id)
            .map(|p| p.destination_address)
            .unwrap_or_default();
        let (remote_port, remote_addresses) = self.notification_base(assoc_id);
        let mut notification = SctpNotification::new(NotificationContent::PeerAddrChange {
            state: match state {
                PathState::Reachable => PeerAddrChangeState::AddrReachable,
                PathState::Unreachable => PeerAddrChangeState::AddrUnreachable,
            },
            address,
            error: 0,
            assoc_id,
        });
        notification.remote_port = remote_port;
        notification.remote_addresses = remote_addresses;
        self.add_notification(socket_id, notification);
    }

    fn on_communication_up(
        &mut self,
        assoc_id: AssocId,
        destinations: u16,
        in_streams: u16,
        out_streams: u16,
    ) {
        debug!("A{assoc_id:04}: communication up ({in_streams} in / {out_streams} out)");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let (remote_port, remote_addresses) = self.notification_base(assoc_id);

        let accepted = {
            let MasterState {
                engine, sockets, ..
            } = self;
            let socket = match sockets.get_mut(&socket_id) {
                Some(socket) => socket,
                None => return,
            };
            if let Some(association) = socket.assoc_list.get_mut(&assoc_id) {
                // A successful associate(): restore the shadowed rto-max.
                if association.rto_max_is_init_timeout {
                    if let Ok(mut status) = engine.association_status(assoc_id) {
                        trace!(
                            "A{assoc_id:04}: restoring rto-max {} over init timeout {}",
                            association.saved_rto_max,
                            status.rto_max
                        );
                        status.rto_max = association.saved_rto_max;
                        let _ = engine.set_association_status(assoc_id, &status);
                    }
                    association.rto_max_is_init_timeout = false;
                }
                association.comm_up_notification = true;
                association.establish_condition.broadcast();
                association.write_ready = true;
                association.has_exception = false;
                true
            } else if socket.is_listening() {
                // Incoming connection on a listening socket.
                let mut association = Association::new(
                    socket_id,
                    assoc_id,
                    socket.notification_flags,
                    socket.flags & SSF_GLOBAL_QUEUE == 0,
                );
                association.comm_up_notification = true;
                association.write_ready = true;
                association.defaults = socket.default_io.clone();
                socket.assoc_list.insert(assoc_id, association);

                let mut incoming = SctpNotification::new(NotificationContent::AssocChange {
                    state: AssocChangeState::CommUp,
                    error: 0,
                    outbound_streams: out_streams,
                    inbound_streams: in_streams,
                    assoc_id,
                });
                incoming.remote_port = remote_port;
                incoming.remote_addresses = remote_addresses.clone();
                socket.connection_requests.push_back(IncomingConnection {
                    assoc_id,
                    notification: incoming,
                });
                socket.read_ready = true;
                socket.establish_condition.broadcast();
                true
            } else {
                warn!("incoming association, but not in listen mode: rejecting");
                engine.abort(assoc_id);
                if engine.delete_association(assoc_id).is_err() {
                    error!("unable to delete rejected association {assoc_id}");
                    std::process::abort();
                }
                false
            }
        };
        let _ = destinations;

        if accepted {
            let mut notification = SctpNotification::new(NotificationContent::AssocChange {
                state: AssocChangeState::CommUp,
                error: 0,
                outbound_streams: out_streams,
                inbound_streams: in_streams,
                assoc_id,
            });
            let (port, addresses) = self.notification_base(assoc_id);
            notification.remote_port = port;
            notification.remote_addresses = addresses;
            self.add_notification(socket_id, notification);
        }
    }

    fn on_communication_lost(&mut self, assoc_id: AssocId, reason: LossReason) {
        debug!("A{assoc_id:04}: communication lost ({reason:?})");
        if self.association_garbage_collection(assoc_id, false) {
            return;
        }
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };

        let present = {
            let MasterState {
                engine, sockets, ..
            } = self;
            let socket = match sockets.get_mut(&socket_id) {
                Some(socket) => socket,
                None => return,
            };
            match socket.assoc_list.get_mut(&assoc_id) {
                Some(association) => {
                    if association.rto_max_is_init_timeout {
                        if let Ok(mut status) = engine.association_status(assoc_id) {
                            status.rto_max = association.saved_rto_max;
                            let _ = engine.set_association_status(assoc_id, &status);
                        }
                        association.rto_max_is_init_timeout = false;
                    }
                    association.comm_lost_notification = true;
                    association.shutdown_complete_notification = true;
                    association.shutdown_complete_condition.broadcast();
                    association.read_update_condition.broadcast();
                    true
                }
                None => false,
            }
        };
        if present {
            let state = match reason {
                LossReason::InitFailed => AssocChangeState::CantStartAssoc,
                _ => AssocChangeState::CommLost,
            };
            let notification = SctpNotification::new(NotificationContent::AssocChange {
                state,
                error: 0,
                outbound_streams: 0,
                inbound_streams: 0,
                assoc_id,
            });
            self.add_notification(socket_id, notification);

            if let Some(socket) = self.sockets.get_mut(&socket_id) {
                if let Some(association) = socket.assoc_list.get_mut(&assoc_id) {
                    // Wake an associate() still waiting for establishment.
                    association.has_exception = true;
                    association.write_ready = true;
                    association.read_ready = true;
                    association.establish_condition.broadcast();
                    association.ready_for_transmit.broadcast();
                }
            }
        }
        let MasterState {
            engine,
            sockets,
            gc,
            ..
        } = self;
        if let Some(socket) = sockets.get_mut(&socket_id) {
            socket.check_auto_close(engine.as_mut(), gc);
        }
    }

    fn on_communication_error(&mut self, assoc_id: AssocId, error: u32) {
        debug!("A{assoc_id:04}: communication error, status={error}");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let (remote_port, remote_addresses) = self.notification_base(assoc_id);
        let mut notification = SctpNotification::new(NotificationContent::RemoteError {
            error,
            assoc_id,
            data: Bytes::new(),
        });
        notification.remote_port = remote_port;
        notification.remote_addresses = remote_addresses;
        self.add_notification(socket_id, notification);
    }

    fn on_restart(&mut self, assoc_id: AssocId) {
        debug!("A{assoc_id:04}: restart");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let (in_streams, out_streams) = match self.engine.association_status(assoc_id) {
            Ok(status) => (status.in_streams, status.out_streams),
            Err(_) => {
                warn!("restart: association status unavailable");
                (1, 1)
            }
        };
        let notification = SctpNotification::new(NotificationContent::AssocChange {
            state: AssocChangeState::Restart,
            error: 0,
            outbound_streams: out_streams,
            inbound_streams: in_streams,
            assoc_id,
        });
        self.add_notification(socket_id, notification);
    }

    fn on_shutdown_received(&mut self, assoc_id: AssocId) {
        debug!("A{assoc_id:04}: shutdown received");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let present = self
            .sockets
            .get(&socket_id)
            .map(|s| s.assoc_list.contains_key(&assoc_id))
            .unwrap_or(false);
        if present {
            let notification =
                SctpNotification::new(NotificationContent::ShutdownEvent { assoc_id });
            self.add_notification(socket_id, notification);
        }
    }

    fn on_shutdown_complete(&mut self, assoc_id: AssocId) {
        debug!("A{assoc_id:04}: shutdown complete");
        if self.association_garbage_collection(assoc_id, false) {
            return;
        }
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        let present = {
            let socket = match self.sockets.get_mut(&socket_id) {
                Some(socket) => socket,
                None => return,
            };
            match socket.assoc_list.get_mut(&assoc_id) {
                Some(association) => {
                    association.write_ready = true;
                    association.read_ready = true;
                    association.has_exception = true;
                    association.shutdown_complete_notification = true;
                    association.shutdown_complete_condition.broadcast();
                    association.ready_for_transmit.broadcast();
                    association.read_update_condition.broadcast();
                    true
                }
                None => false,
            }
        };
        if present {
            let notification = SctpNotification::new(NotificationContent::AssocChange {
                state: AssocChangeState::ShutdownComplete,
                error: 0,
                outbound_streams: 0,
                inbound_streams: 0,
                assoc_id,
            });
            self.add_notification(socket_id, notification);
        }
        let MasterState {
            engine,
            sockets,
            gc,
            ..
        } = self;
        if let Some(socket) = sockets.get_mut(&socket_id) {
            socket.check_auto_close(engine.as_mut(), gc);
        }
    }

    fn on_queue_status_change(&mut self, assoc_id: AssocId) {
        trace!("A{assoc_id:04}: queue status change");
        let socket_id = match self.socket_for_assoc(assoc_id) {
            Some(socket_id) => socket_id,
            None => return,
        };
        if let Some(socket) = self.sockets.get_mut(&socket_id) {
            if let Some(association) = socket.assoc_list.get_mut(&assoc_id) {
                association.ready_for_transmit.broadcast();
                association.write_ready = true;
            }
        }
    }

    fn on_user_socket(&mut self, fd: RawFd, revents: i16) {
        if fd == self.break_pipe[0] {
            trace!("break via break pipe received");
            let mut drain = [0u8; 256];
            loop {
                let got = unsafe {
                    libc::read(
                        fd,
                        drain.as_mut_ptr() as *mut libc::c_void,
                        drain.len(),
                    )
                };
                if got <= 0 {
                    break;
                }
            }
            self.break_condition.fire();
            // The engine's user-fd registration is one-shot; the break pipe
            // stays registered permanently.
            self.register_break_pipe();
            return;
        }
        if let Some(entry) = self.user_notifications.get_mut(&fd) {
            entry.events |= revents;
            if revents & entry.event_mask != 0 {
                entry.condition.broadcast();
            }
        }
    }

    // ====== Garbage collection ==========================================

    /// Deletes a deferred association once its closing callback has fired.
    /// Returns true when the id was pending deletion.
    pub fn association_garbage_collection(&mut self, assoc_id: AssocId, send_abort: bool) -> bool {
        let position = self
            .gc
            .closing_assocs
            .iter()
            .position(|(a, _)| *a == assoc_id);
        let index = match position {
            Some(index) => index,
            None => return false,
        };
        debug!("garbage collection: removing association {assoc_id}");
        if send_abort {
            self.engine.abort(assoc_id);
        }
        if self.engine.delete_association(assoc_id).is_err() {
            error!("garbage collection: engine delete of {assoc_id} failed");
            std::process::abort();
        }
        self.gc.closing_assocs.remove(index);
        self.socket_garbage_collection();
        true
    }

    /// Auto-close sweep plus deferred instance unregistration. An instance
    /// leaves the engine only when no closing association still uses it.
    pub fn socket_garbage_collection(&mut self) {
        self.last_gc = Instant::now();
        let MasterState {
            engine,
            sockets,
            gc,
            ..
        } = self;
        for socket in sockets.values_mut() {
            socket.check_auto_close(engine.as_mut(), gc);
        }

        let pending: Vec<InstanceId> = gc.closing_instances.iter().copied().collect();
        for instance in pending {
            let used = gc.closing_assocs.iter().any(|(_, i)| *i == instance);
            if !used {
                debug!("garbage collection: unregistering instance {instance}");
                gc.closing_instances.remove(&instance);
                if engine.unregister_instance(instance).is_err() {
                    error!("garbage collection: unregister of {instance} failed");
                    std::process::abort();
                }
            }
        }
    }
}
