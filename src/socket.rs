use crate::address::{SocketAddress, PF_ADDRESS, PF_HIDE_PORT, PF_LEGACY};
use crate::association::{AssocIoDefaults, Association, UpdateConditionType};
use crate::engine::{
    AssocId, Engine, InstanceId, InstanceParameters, SendResult,
};
use crate::error::{Error, Result};
use crate::master::{GcSets, SocketId};
use crate::notification::{NotificationContent, NotificationQueue, SctpNotification};
use crate::sync::Condition;
use crate::{
    MSG_EOR, MSG_NOTIFICATION, MSG_PEEK, MSG_UNBUNDLED, MSG_UNORDERED, SCTP_MAX_NUM_ADDRESSES,
};

use log::{debug, error, trace, warn};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Route all child-association events into the socket-level queue.
pub const SSF_GLOBAL_QUEUE: u32 = 1 << 0;
/// Connectionless 1:M behavior: implicit associate on send, implicit accept
/// on first data, idle auto-close.
pub const SSF_AUTO_CONNECT: u32 = 1 << 1;
/// Accepting incoming associations.
pub const SSF_LISTENING: u32 = 1 << 31;

const PRINT_FORMAT: u32 = PF_ADDRESS | PF_HIDE_PORT | PF_LEGACY;

/// A pending incoming association, queued until accept() consumes it.
pub struct IncomingConnection {
    pub assoc_id: AssocId,
    pub notification: SctpNotification,
}

/// Which queue a receive drains.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReceiveScope {
    Global,
    Assoc(AssocId),
}

/// Out-parameters of one receive step.
#[derive(Debug, Clone, Default)]
pub struct ReceiveInfo {
    pub len: usize,
    pub flags: i32,
    pub assoc_id: AssocId,
    pub stream_id: u16,
    pub proto_id: u32,
    pub ssn: u16,
    pub tsn: u32,
    pub remote_port: u16,
    pub remote_addresses: Vec<String>,
}

/// Result of a non-blocking receive step.
pub enum ReceiveOutcome {
    Received(ReceiveInfo),
    /// Shutdown observed and the queue is drained: end of file.
    Eof(ReceiveInfo),
    /// Queue empty; the caller may wait on the queue's update condition.
    WouldBlock,
}

/// Result of a non-blocking send attempt.
pub enum SendOnce {
    Sent(usize),
    /// Engine transmit queue full; the caller may wait on ready-for-transmit.
    QueueFull,
}

/// An SCTP socket: the wrapper around one engine instance. Owns all of its
/// associations; everything else refers to them by id.
pub struct SctpSocket {
    pub id: SocketId,
    pub flags: u32,

    pub instance_id: Option<InstanceId>,
    pub local_port: u16,
    pub in_streams: u16,
    pub out_streams: u16,

    pub notification_flags: u32,
    pub global_queue: NotificationQueue,
    pub establish_condition: Arc<Condition>,
    pub read_update_condition: Arc<Condition>,
    pub write_update_condition: Arc<Condition>,
    pub except_update_condition: Arc<Condition>,

    pub connection_requests: VecDeque<IncomingConnection>,
    pub assoc_list: HashMap<AssocId, Association>,
    /// Membership of `assoc_list` entries created by auto-connect.
    pub connectionless: HashSet<AssocId>,

    pub auto_close_timeout: Duration,
    pub default_traffic_class: u8,
    /// IO defaults inherited by new associations (SCTP_DEFAULT_SEND_PARAM
    /// applied before any association exists).
    pub default_io: AssocIoDefaults,
    pub send_buffer_default: usize,
    pub receive_buffer_default: usize,

    pub read_ready: bool,
    pub write_ready: bool,
    pub has_exception: bool,
}

impl SctpSocket {
    pub fn new(id: SocketId, flags: u32) -> Self {
        let socket = SctpSocket {
            id,
            flags,
            instance_id: None,
            local_port: 0,
            in_streams: 0,
            out_streams: 0,
            notification_flags: 0,
            global_queue: NotificationQueue::new("SctpSocket::GlobalQueue"),
            establish_condition: Condition::new("SctpSocket::EstablishCondition"),
            read_update_condition: Condition::new("SctpSocket::ReadUpdateCondition"),
            write_update_condition: Condition::new("SctpSocket::WriteUpdateCondition"),
            except_update_condition: Condition::new("SctpSocket::ExceptUpdateCondition"),
            connection_requests: VecDeque::new(),
            assoc_list: HashMap::new(),
            connectionless: HashSet::new(),
            auto_close_timeout: Duration::from_secs(30),
            default_traffic_class: 0,
            default_io: AssocIoDefaults::default(),
            send_buffer_default: 0,
            receive_buffer_default: 0,
            read_ready: false,
            write_ready: false,
            has_exception: false,
        };
        socket
            .establish_condition
            .add_parent(&socket.read_update_condition);
        socket
            .global_queue
            .update_condition()
            .add_parent(&socket.read_update_condition);
        socket
    }

    pub fn update_condition(&self, which: UpdateConditionType) -> &Arc<Condition> {
        match which {
            UpdateConditionType::Read => &self.read_update_condition,
            UpdateConditionType::Write => &self.write_update_condition,
            UpdateConditionType::Except => &self.except_update_condition,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.flags & SSF_LISTENING != 0
    }

    pub fn is_bound(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Connection-oriented lookup that skips shutting-down associations
    /// unless asked otherwise.
    pub fn association(&self, assoc_id: AssocId, active_only: bool) -> Option<&Association> {
        self.assoc_list
            .get(&assoc_id)
            .filter(|a| !(active_only && a.is_shutting_down))
    }

    pub fn association_mut(
        &mut self,
        assoc_id: AssocId,
        active_only: bool,
    ) -> Option<&mut Association> {
        self.assoc_list
            .get_mut(&assoc_id)
            .filter(|a| !(active_only && a.is_shutting_down))
    }

    pub fn has_global_data(&self) -> bool {
        self.flags & SSF_GLOBAL_QUEUE != 0 && self.global_queue.has_data(self.notification_flags)
    }

    // ====== Bind / unbind ================================================

    pub fn bind(
        &mut self,
        engine: &mut dyn Engine,
        instance_registry: &mut HashMap<InstanceId, SocketId>,
        gc: &mut GcSets,
        local_port: u16,
        in_streams: u16,
        out_streams: u16,
        addresses: &[SocketAddress],
    ) -> Result<()> {
        if addresses.is_empty() {
            return Err(Error::ErrInvalidArgument);
        }
        if addresses.len() > SCTP_MAX_NUM_ADDRESSES {
            return Err(Error::ErrTooManyAddresses);
        }
        self.unbind(engine, instance_registry, gc, false);

        let instance = engine.register_instance(local_port, in_streams, out_streams, addresses)?;
        self.instance_id = Some(instance);
        self.local_port = engine
            .local_addresses(instance)?
            .first()
            .map(|a| a.port())
            .unwrap_or(local_port);
        self.in_streams = in_streams;
        self.out_streams = out_streams;
        instance_registry.insert(instance, self.id);
        debug!(
            "socket {}: bound instance {instance} on port {}",
            self.id, self.local_port
        );
        Ok(())
    }

    pub fn unbind(
        &mut self,
        engine: &mut dyn Engine,
        instance_registry: &mut HashMap<InstanceId, SocketId>,
        gc: &mut GcSets,
        send_abort: bool,
    ) {
        let instance = match self.instance_id {
            Some(instance) => instance,
            None => return,
        };
        debug!("socket {}: unbinding instance {instance}", self.id);

        // Tear down every association made by sendto().
        let connectionless: Vec<AssocId> = self.connectionless.drain().collect();
        for assoc_id in connectionless {
            if send_abort {
                if let Some(a) = self.assoc_list.get_mut(&assoc_id) {
                    a.abort(engine);
                }
            }
            self.destroy_association(assoc_id, engine, gc);
        }

        gc.delayed_delete_instance(instance);
        if instance_registry.remove(&instance).is_none() {
            error!("unbind: instance {instance} missing from registry");
            std::process::abort();
        }

        // Abort whatever sits unaccepted in the backlog.
        while let Some(incoming) = self.connection_requests.pop_front() {
            if self.assoc_list.contains_key(&incoming.assoc_id) {
                if let Some(a) = self.assoc_list.get_mut(&incoming.assoc_id) {
                    a.abort(engine);
                }
                self.destroy_association(incoming.assoc_id, engine, gc);
            }
        }

        self.global_queue.flush();
        self.instance_id = None;
        self.local_port = 0;
        self.flags &= !SSF_LISTENING;
    }

    /// The association teardown path. Either defers engine deletion until
    /// the shutdown completes, or deletes immediately when the association
    /// is already down.
    pub fn destroy_association(
        &mut self,
        assoc_id: AssocId,
        engine: &mut dyn Engine,
        gc: &mut GcSets,
    ) {
        let mut association = match self.assoc_list.remove(&assoc_id) {
            Some(a) => a,
            None => {
                error!("destroy: association {assoc_id} not in socket {}", self.id);
                std::process::abort();
            }
        };
        self.connectionless.remove(&assoc_id);
        if !association.shutdown_complete_notification {
            trace!("association {assoc_id}: active shutdown, deferred delete");
            if let Some(instance) = self.instance_id {
                gc.delayed_delete_association(instance, assoc_id);
            }
            association.shutdown(engine);
        } else {
            trace!("association {assoc_id}: passive teardown");
            let _ = engine.delete_association(assoc_id);
        }
    }

    // ====== Listen / accept ==============================================

    pub fn listen(&mut self, backlog: u32) {
        if backlog > 0 {
            self.flags |= SSF_LISTENING;
        } else {
            self.flags &= !SSF_LISTENING;
        }
    }

    /// Non-blocking accept: next pending incoming association, FIFO.
    pub fn accept_step(&mut self) -> Result<Option<(AssocId, SctpNotification)>> {
        if !self.is_listening() {
            return Err(Error::ErrOpNotSupported);
        }
        let incoming = self.connection_requests.pop_front();
        self.read_ready = self.has_global_data() || !self.connection_requests.is_empty();
        Ok(incoming.map(|c| (c.assoc_id, c.notification)))
    }

    // ====== Associate =====================================================

    /// Starts an association attempt: overrides the instance defaults for
    /// the attempt, calls the engine, wraps the result. The returned
    /// association carries one use-count the caller must drop after its
    /// establish wait. Restores the defaults either way.
    pub fn start_associate(
        &mut self,
        engine: &mut dyn Engine,
        out_streams: u16,
        max_attempts: u16,
        max_init_timeout: u32,
        destinations: &[SocketAddress],
    ) -> Result<AssocId> {
        let instance = self.instance_id.ok_or(Error::ErrBadDescriptor)?;
        if destinations.is_empty() {
            return Err(Error::ErrInvalidArgument);
        }
        if destinations.len() > SCTP_MAX_NUM_ADDRESSES {
            return Err(Error::ErrTooManyAddresses);
        }

        let old_parameters = engine.instance_parameters(instance)?;
        let max_init_timeout = if max_init_timeout == 0 {
            old_parameters.rto_max
        } else {
            max_init_timeout
        };
        let mut new_parameters = old_parameters.clone();
        new_parameters.max_init_retransmits = max_attempts.saturating_sub(1).max(1);
        new_parameters.rto_max = max_init_timeout;
        if let Err(e) = engine.set_instance_parameters(instance, &new_parameters) {
            warn!("associate: unable to set instance parameters: {e}");
        }

        let dest_port = destinations[0].port();
        let attempt = engine.associate(instance, out_streams.max(1), destinations, dest_port);

        if let Err(e) = engine.set_instance_parameters(instance, &old_parameters) {
            warn!("associate: unable to restore instance parameters: {e}");
        }

        let assoc_id = attempt?;
        let mut association = Association::new(
            self.id,
            assoc_id,
            self.notification_flags,
            self.flags & SSF_GLOBAL_QUEUE == 0,
        );
        association.use_count += 1;
        association.defaults = self.default_io.clone();
        association.rto_max_is_init_timeout = true;
        association.saved_rto_max = old_parameters.rto_max;
        association.init_timeout = max_init_timeout;
        let _ = engine.set_traffic_class(assoc_id, -1, self.default_traffic_class);
        self.assoc_list.insert(assoc_id, association);
        debug!(
            "socket {}: association {assoc_id} to {} port {dest_port} started",
            self.id,
            destinations[0].address_string(PRINT_FORMAT)
        );
        Ok(assoc_id)
    }

    // ====== Destination lookup (connectionless) ==========================

    /// Finds a live association whose primary destination matches
    /// `destination` (address string plus port), auto-created ones first.
    pub fn association_for_destination(
        &self,
        engine: &dyn Engine,
        destination: &SocketAddress,
    ) -> Option<AssocId> {
        let wanted = destination.address_string(PRINT_FORMAT);
        let port = destination.port();
        let matches = |assoc_id: &AssocId| -> bool {
            let association = match self.assoc_list.get(assoc_id) {
                Some(a) => a,
                None => return false,
            };
            if association.is_shutting_down {
                return false;
            }
            match engine.association_status(*assoc_id) {
                Ok(status) => {
                    trace!(
                        "destination search: {wanted}:{port} == {}:{}?",
                        status.primary_destination_address,
                        status.dest_port
                    );
                    status.dest_port == port && status.primary_destination_address == wanted
                }
                Err(_) => false,
            }
        };
        self.connectionless
            .iter()
            .find(|id| matches(id))
            .copied()
            .or_else(|| self.assoc_list.keys().find(|id| matches(id)).copied())
    }

    // ====== Send ==========================================================

    /// One send attempt against the engine. The caller loops on `QueueFull`
    /// for blocking sends, waiting on the association's ready-for-transmit
    /// condition between attempts.
    pub fn internal_send_once(
        &mut self,
        engine: &mut dyn Engine,
        assoc_id: AssocId,
        buf: &[u8],
        flags: i32,
        stream_id: u16,
        proto_id: u32,
        time_to_live: u32,
    ) -> Result<SendOnce> {
        match self.assoc_list.get_mut(&assoc_id) {
            Some(association) => {
                if let Some(error) = association.error_code() {
                    return Err(error);
                }
            }
            None => return Err(Error::ErrNotConnected),
        }
        match engine.send(
            assoc_id,
            stream_id,
            buf,
            proto_id,
            time_to_live,
            flags & MSG_UNORDERED != 0,
            flags & MSG_UNBUNDLED != 0,
        ) {
            Ok(SendResult::Sent) => {
                self.write_ready = true;
                Ok(SendOnce::Sent(buf.len()))
            }
            Ok(SendResult::QueueExceeded) => {
                self.write_ready = false;
                Ok(SendOnce::QueueFull)
            }
            Err(Error::ErrShutdown) => Err(Error::ErrShutdown),
            Err(e) => {
                trace!("engine send on association {assoc_id} failed: {e}");
                Err(Error::ErrIo)
            }
        }
    }

    /// Resolves the effective send parameters, substituting the
    /// association's IO defaults (with the per-stream timeout table) when
    /// `use_defaults` is set.
    pub fn effective_send_parameters(
        &self,
        assoc_id: AssocId,
        stream_id: u16,
        proto_id: u32,
        time_to_live: u32,
        use_defaults: bool,
    ) -> (u16, u32, u32) {
        if !use_defaults {
            return (stream_id, proto_id, time_to_live);
        }
        match self.assoc_list.get(&assoc_id) {
            Some(a) => {
                let defaults: &AssocIoDefaults = &a.defaults;
                let ttl = a
                    .default_stream_timeout(defaults.stream_id)
                    .unwrap_or(defaults.time_to_live);
                (defaults.stream_id, defaults.proto_id, ttl)
            }
            None => (stream_id, proto_id, time_to_live),
        }
    }

    // ====== Receive =======================================================

    /// One receive step against the selected queue; the exact consume /
    /// update-in-place / drop semantics of the notification protocol.
    pub fn internal_receive_step(
        &mut self,
        engine: &mut dyn Engine,
        scope: ReceiveScope,
        buf: &mut [u8],
        in_flags: i32,
    ) -> Result<ReceiveOutcome> {
        if buf.is_empty() {
            return Err(Error::ErrInvalidArgument);
        }
        let receive_notifications = in_flags & MSG_NOTIFICATION != 0;

        // ====== Head of queue, or the empty-queue verdict ================
        let (head, mask) = match scope {
            ReceiveScope::Global => {
                (self.global_queue.peek().cloned(), self.notification_flags)
            }
            ReceiveScope::Assoc(assoc_id) => {
                let association = self
                    .assoc_list
                    .get(&assoc_id)
                    .ok_or(Error::ErrBadDescriptor)?;
                (
                    association.in_queue.peek().cloned(),
                    association.notification_flags,
                )
            }
        };
        let head = match head {
            Some(head) => head,
            None => {
                if let ReceiveScope::Assoc(assoc_id) = scope {
                    let association = self
                        .assoc_list
                        .get_mut(&assoc_id)
                        .ok_or(Error::ErrBadDescriptor)?;
                    if let Some(error) = association.error_code() {
                        let mask = association.notification_flags;
                        if error == Error::ErrShutdown && !association.in_queue.has_data(mask) {
                            trace!("association {assoc_id}: drained after shutdown, EOF");
                            return Ok(ReceiveOutcome::Eof(ReceiveInfo {
                                assoc_id,
                                flags: in_flags,
                                ..ReceiveInfo::default()
                            }));
                        }
                        return Err(error);
                    }
                }
                return Ok(ReceiveOutcome::WouldBlock);
            }
        };

        let mut info = ReceiveInfo {
            flags: in_flags,
            assoc_id: head.assoc_id(),
            remote_port: head.remote_port,
            remote_addresses: head.remote_addresses.clone(),
            ..ReceiveInfo::default()
        };
        let mut updated = false;
        let mut skip_error: Option<Error> = None;
        let mut result: Result<usize> = Ok(0);

        match &head.content {
            // ====== User data ===========================================
            &NotificationContent::DataArrive {
                assoc_id,
                stream,
                ppid,
                unordered,
                bytes_arrived,
            } => {
                info.flags &= !MSG_NOTIFICATION;
                info.stream_id = stream;
                info.proto_id = ppid;
                if bytes_arrived > 0 {
                    let want = (bytes_arrived as usize).min(buf.len());
                    match engine.receive(assoc_id, stream, want, in_flags & MSG_PEEK != 0) {
                        Ok(chunk) => {
                            let got = chunk.data.len();
                            buf[..got].copy_from_slice(&chunk.data);
                            info.ssn = chunk.ssn;
                            info.tsn = chunk.tsn;
                            if unordered {
                                info.flags |= MSG_UNORDERED;
                            }
                            if in_flags & MSG_PEEK != 0 {
                                self.queue_update(scope, head.clone());
                                updated = true;
                            } else {
                                let remaining = bytes_arrived - got as u32;
                                if remaining > 0 {
                                    let mut new_head = head.clone();
                                    new_head.content = NotificationContent::DataArrive {
                                        assoc_id,
                                        stream,
                                        ppid,
                                        unordered,
                                        bytes_arrived: remaining,
                                    };
                                    self.queue_update(scope, new_head);
                                    updated = true;
                                } else {
                                    info.flags |= MSG_EOR;
                                }
                            }
                            result = Ok(got);
                        }
                        Err(e) => {
                            warn!("engine receive on association {assoc_id} failed: {e}");
                            skip_error = Some(Error::ErrConnectionAborted);
                        }
                    }
                }
            }

            // ====== Notification ========================================
            _ => {
                if receive_notifications && head.is_selected(mask) {
                    let raw = head.to_bytes();
                    let position = head.content_position.min(raw.len());
                    let to_copy = (raw.len() - position).min(buf.len());
                    buf[..to_copy].copy_from_slice(&raw[position..position + to_copy]);
                    let new_position = position + to_copy;
                    if new_position < raw.len() {
                        let mut new_head = head.clone();
                        new_head.content_position = new_position;
                        self.queue_update(scope, new_head);
                        updated = true;
                        info.flags |= MSG_NOTIFICATION;
                    } else {
                        info.flags |= MSG_EOR | MSG_NOTIFICATION;
                    }
                    result = Ok(to_copy);
                } else {
                    // Not subscribed: the notification is consumed silently,
                    // but lifecycle errors still surface.
                    trace!(
                        "skipping notification type {} for association {}",
                        head.notification_type(),
                        info.assoc_id
                    );
                    let error = self
                        .assoc_list
                        .get_mut(&info.assoc_id)
                        .and_then(|a| a.error_code());
                    skip_error = Some(error.unwrap_or(Error::ErrAgain));
                }
            }
        }

        // ====== Drop the head unless updated in place, and update ========
        // ====== per-association bookkeeping ==============================
        if !updated {
            self.queue_drop(scope);
            let mask_for_ready = mask;
            if let Some(association) = self.assoc_list.get_mut(&info.assoc_id) {
                association.last_usage = Instant::now();
                if association.use_count > 0 {
                    association.use_count -= 1;
                } else {
                    error!(
                        "association {}: too many use-count decrements",
                        info.assoc_id
                    );
                    std::process::abort();
                }
                let errored = association.error_code().is_some();
                association.read_ready =
                    association.in_queue.has_data(mask_for_ready) || errored;
            }
            self.read_ready = self.has_global_data() || !self.connection_requests.is_empty();
        }

        if let Some(error) = skip_error {
            return Err(error);
        }
        match result {
            Ok(len) => {
                info.len = len;
                Ok(ReceiveOutcome::Received(info))
            }
            Err(e) => Err(e),
        }
    }

    fn queue_update(&mut self, scope: ReceiveScope, head: SctpNotification) {
        match scope {
            ReceiveScope::Global => self.global_queue.update(head),
            ReceiveScope::Assoc(assoc_id) => match self.assoc_list.get_mut(&assoc_id) {
                Some(a) => a.in_queue.update(head),
                None => {
                    error!("queue update: association {assoc_id} vanished");
                    std::process::abort();
                }
            },
        }
    }

    fn queue_drop(&mut self, scope: ReceiveScope) {
        match scope {
            ReceiveScope::Global => self.global_queue.drop_head(),
            ReceiveScope::Assoc(assoc_id) => {
                if let Some(a) = self.assoc_list.get_mut(&assoc_id) {
                    a.in_queue.drop_head();
                }
            }
        }
    }

    // ====== Auto-connect / auto-close maintenance ========================

    /// Adopts pending incoming associations into the connectionless table.
    pub fn check_auto_connect(&mut self) {
        if self.flags & SSF_AUTO_CONNECT == 0 {
            return;
        }
        while let Some(incoming) = self.connection_requests.pop_front() {
            debug!(
                "auto-connect: new incoming association {}",
                incoming.assoc_id
            );
            self.connectionless.insert(incoming.assoc_id);
        }
        self.read_ready = self.has_global_data() || !self.connection_requests.is_empty();
    }

    /// The periodic sweep: shuts down idle zero-use associations and reaps
    /// the ones whose shutdown finished.
    pub fn check_auto_close(&mut self, engine: &mut dyn Engine, gc: &mut GcSets) {
        let now = Instant::now();
        let candidates: Vec<AssocId> = self.connectionless.iter().copied().collect();
        for assoc_id in candidates {
            let (idle, finished) = match self.assoc_list.get(&assoc_id) {
                Some(a) => (
                    a.use_count == 0
                        && !self.auto_close_timeout.is_zero()
                        && now.duration_since(a.last_usage) > self.auto_close_timeout,
                    a.shutdown_complete_notification || a.comm_lost_notification,
                ),
                None => {
                    self.connectionless.remove(&assoc_id);
                    continue;
                }
            };
            if finished {
                debug!("auto-close: reaping association {assoc_id}");
                self.connectionless.remove(&assoc_id);
                self.destroy_association(assoc_id, engine, gc);
            } else if idle {
                debug!("auto-close: shutting down idle association {assoc_id}");
                if let Some(a) = self.assoc_list.get_mut(&assoc_id) {
                    a.shutdown(engine);
                }
            }
        }
    }

    // ====== Peel-off ======================================================

    pub fn peel_off(&mut self, assoc_id: AssocId) -> Result<AssocId> {
        if !self.connectionless.contains(&assoc_id) {
            return Err(Error::ErrInvalidArgument);
        }
        let association = self
            .assoc_list
            .get_mut(&assoc_id)
            .ok_or(Error::ErrInvalidArgument)?;
        if association.is_shutting_down {
            return Err(Error::ErrShutdown);
        }
        association.peeled_off = true;
        self.connectionless.remove(&assoc_id);
        debug!("socket {}: association {assoc_id} peeled off", self.id);
        Ok(assoc_id)
    }

    pub fn peel_off_address(
        &mut self,
        engine: &dyn Engine,
        destination: &SocketAddress,
    ) -> Result<AssocId> {
        let wanted = destination.address_string(PRINT_FORMAT);
        let port = destination.port();
        let found = self.connectionless.iter().copied().find(|assoc_id| {
            let association = match self.assoc_list.get(assoc_id) {
                Some(a) => a,
                None => return false,
            };
            if association.is_shutting_down {
                return false;
            }
            matches!(
                engine.association_status(*assoc_id),
                Ok(status)
                    if status.dest_port == port
                        && status.primary_destination_address == wanted
            )
        });
        match found {
            Some(assoc_id) => self.peel_off(assoc_id),
            None => Err(Error::ErrInvalidArgument),
        }
    }

    // ====== Instance parameters and whole-socket tuning ==================

    pub fn assoc_defaults(&self, engine: &dyn Engine) -> Result<InstanceParameters> {
        let instance = self.instance_id.ok_or(Error::ErrBadDescriptor)?;
        engine.instance_parameters(instance)
    }

    pub fn set_assoc_defaults(
        &mut self,
        engine: &mut dyn Engine,
        parameters: &InstanceParameters,
    ) -> Result<()> {
        let instance = self.instance_id.ok_or(Error::ErrBadDescriptor)?;
        engine.set_instance_parameters(instance, parameters)
    }

    pub fn local_addresses(&self, engine: &dyn Engine) -> Result<Vec<SocketAddress>> {
        let instance = self.instance_id.ok_or(Error::ErrBadDescriptor)?;
        engine.local_addresses(instance)
    }

    /// Applies a traffic class to the socket default and every
    /// connectionless association.
    pub fn set_traffic_class(
        &mut self,
        engine: &mut dyn Engine,
        traffic_class: u8,
        stream_id: i32,
    ) -> bool {
        self.default_traffic_class = traffic_class;
        let mut ok = true;
        for assoc_id in self.connectionless.iter() {
            if engine
                .set_traffic_class(*assoc_id, stream_id, traffic_class)
                .is_err()
            {
                ok = false;
            }
        }
        ok
    }

    pub fn set_send_buffer(&mut self, engine: &mut dyn Engine, size: usize) -> bool {
        let mut ok = true;
        for assoc_id in self.connectionless.iter() {
            if engine.set_send_buffer_size(*assoc_id, size).is_err() {
                ok = false;
            }
        }
        ok
    }

    pub fn set_receive_buffer(&mut self, engine: &mut dyn Engine, size: usize) -> bool {
        let mut ok = true;
        for assoc_id in self.connectionless.iter() {
            if engine.set_receive_buffer_size(*assoc_id, size).is_err() {
                ok = false;
            }
        }
        ok
    }
}
