use crate::address::SocketAddress;
use crate::engine::{
    AssocId, AssociationStatus, Engine, PathStatus, SCTP_INFINITE_LIFETIME,
};
use crate::error::{Error, Result};
use crate::master::SocketId;
use crate::notification::NotificationQueue;
use crate::sync::Condition;

use log::trace;

use std::sync::Arc;
use std::time::Instant;

/// Per-association IO defaults, substituted on send when the caller asks for
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssocIoDefaults {
    pub stream_id: u16,
    pub proto_id: u32,
    pub time_to_live: u32,
    pub context: u32,
}

impl Default for AssocIoDefaults {
    fn default() -> Self {
        AssocIoDefaults {
            stream_id: 0,
            proto_id: 0,
            time_to_live: SCTP_INFINITE_LIFETIME,
            context: 0,
        }
    }
}

/// Readiness condition selector used by select/poll composition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateConditionType {
    Read,
    Write,
    Except,
}

/// State for one SCTP association. Owned by its socket; every other
/// reference is the `(socket_id, assoc_id)` pair.
pub struct Association {
    pub assoc_id: AssocId,
    pub socket_id: SocketId,

    pub in_queue: NotificationQueue,
    pub establish_condition: Arc<Condition>,
    pub shutdown_complete_condition: Arc<Condition>,
    pub ready_for_transmit: Arc<Condition>,
    pub read_update_condition: Arc<Condition>,
    pub write_update_condition: Arc<Condition>,
    pub except_update_condition: Arc<Condition>,

    pub last_usage: Instant,
    pub use_count: u32,

    pub notification_flags: u32,
    pub defaults: AssocIoDefaults,
    stream_default_timeouts: Vec<(u16, u16, u32)>,

    pub comm_up_notification: bool,
    pub comm_lost_notification: bool,
    pub shutdown_complete_notification: bool,
    pub is_shutting_down: bool,
    pub peeled_off: bool,

    pub read_ready: bool,
    pub write_ready: bool,
    pub has_exception: bool,

    // While associate() is in flight the engine's rto-max carries the init
    // timeout; the saved value is restored on communication-up or -lost.
    pub rto_max_is_init_timeout: bool,
    pub init_timeout: u32,
    pub saved_rto_max: u32,
}

impl Association {
    /// `connection_oriented` selects the extra condition wiring a one-to-one
    /// socket needs; global-queue children skip it.
    pub fn new(
        socket_id: SocketId,
        assoc_id: AssocId,
        notification_flags: u32,
        connection_oriented: bool,
    ) -> Self {
        let association = Association {
            assoc_id,
            socket_id,
            in_queue: NotificationQueue::new("Association::InQueue"),
            establish_condition: Condition::new("Association::EstablishCondition"),
            shutdown_complete_condition: Condition::new(
                "Association::ShutdownCompleteCondition",
            ),
            ready_for_transmit: Condition::new("Association::ReadyForTransmit"),
            read_update_condition: Condition::new("Association::ReadUpdateCondition"),
            write_update_condition: Condition::new("Association::WriteUpdateCondition"),
            except_update_condition: Condition::new("Association::ExceptUpdateCondition"),
            last_usage: Instant::now(),
            use_count: 0,
            notification_flags,
            defaults: AssocIoDefaults::default(),
            stream_default_timeouts: Vec::new(),
            comm_up_notification: false,
            comm_lost_notification: false,
            shutdown_complete_notification: false,
            is_shutting_down: false,
            peeled_off: false,
            read_ready: false,
            write_ready: false,
            has_exception: false,
            rto_max_is_init_timeout: false,
            init_timeout: 0,
            saved_rto_max: 0,
        };

        association
            .in_queue
            .update_condition()
            .add_parent(&association.read_update_condition);
        if connection_oriented {
            association
                .shutdown_complete_condition
                .add_parent(&association.except_update_condition);
            association
                .establish_condition
                .add_parent(&association.write_update_condition);
            association
                .ready_for_transmit
                .add_parent(&association.write_update_condition);
        }
        association
    }

    pub fn update_condition(&self, which: UpdateConditionType) -> &Arc<Condition> {
        match which {
            UpdateConditionType::Read => &self.read_update_condition,
            UpdateConditionType::Write => &self.write_update_condition,
            UpdateConditionType::Except => &self.except_update_condition,
        }
    }

    pub fn has_data(&self) -> bool {
        self.in_queue.has_data(self.notification_flags)
    }

    /// The latched error state. Reading it also latches the exception flag,
    /// exactly like the select/poll readiness path expects.
    pub fn error_code(&mut self) -> Option<Error> {
        if self.shutdown_complete_notification {
            self.has_exception = true;
            Some(Error::ErrShutdown)
        } else if self.comm_lost_notification {
            self.has_exception = true;
            Some(Error::ErrConnectionAborted)
        } else {
            None
        }
    }

    pub fn shutdown(&mut self, engine: &mut dyn Engine) {
        if !self.is_shutting_down {
            self.is_shutting_down = true;
            engine.shutdown(self.assoc_id);
        }
    }

    pub fn abort(&mut self, engine: &mut dyn Engine) {
        self.is_shutting_down = true;
        engine.abort(self.assoc_id);
    }

    // ====== IO defaults and per-stream timeouts ===========================

    pub fn io_defaults(&self) -> AssocIoDefaults {
        self.defaults.clone()
    }

    pub fn set_io_defaults(&mut self, defaults: AssocIoDefaults) {
        self.defaults = defaults;
    }

    /// Applies `timeout` to streams `start..=end`. Later settings win.
    pub fn set_default_stream_timeouts(&mut self, timeout: u32, start: u16, end: u16) -> bool {
        if start > end {
            return false;
        }
        self.stream_default_timeouts.push((start, end, timeout));
        true
    }

    pub fn default_stream_timeout(&self, stream_id: u16) -> Option<u32> {
        self.stream_default_timeouts
            .iter()
            .rev()
            .find(|(start, end, _)| (*start..=*end).contains(&stream_id))
            .map(|(_, _, timeout)| *timeout)
    }

    // ====== Engine-backed accessors =======================================

    pub fn local_addresses(&self, engine: &dyn Engine) -> Result<Vec<SocketAddress>> {
        match engine.instance_of(self.assoc_id) {
            Some(instance) => engine.local_addresses(instance),
            None => Err(Error::ErrNotConnected),
        }
    }

    pub fn remote_addresses(&self, engine: &dyn Engine) -> Result<Vec<SocketAddress>> {
        engine.remote_addresses(self.assoc_id)
    }

    pub fn association_status(&self, engine: &dyn Engine) -> Result<AssociationStatus> {
        engine.association_status(self.assoc_id)
    }

    pub fn set_association_status(
        &mut self,
        engine: &mut dyn Engine,
        status: &AssociationStatus,
    ) -> Result<()> {
        engine.set_association_status(self.assoc_id, status)
    }

    /// Path parameters for `address`, or for the primary path when `None`.
    pub fn path_status(
        &self,
        engine: &dyn Engine,
        address: Option<&SocketAddress>,
    ) -> Result<PathStatus> {
        let index = self.path_index_for_address(engine, address)?;
        engine.path_status(self.assoc_id, index)
    }

    pub fn path_index_for_address(
        &self,
        engine: &dyn Engine,
        address: Option<&SocketAddress>,
    ) -> Result<u16> {
        let address = match address {
            None => return engine.primary_path(self.assoc_id),
            Some(address) => address,
        };
        let wanted = address.address_string(
            crate::address::PF_ADDRESS | crate::address::PF_HIDE_PORT | crate::address::PF_LEGACY,
        );
        for index in 0.. {
            match engine.path_status(self.assoc_id, index) {
                Ok(status) => {
                    if status.destination_address == wanted {
                        return Ok(index);
                    }
                }
                Err(_) => break,
            }
        }
        trace!(
            "association {}: no path matches {wanted}",
            self.assoc_id
        );
        Err(Error::ErrAddressNotAvailable)
    }

    pub fn primary_address(&self, engine: &dyn Engine) -> Result<SocketAddress> {
        let status = engine.association_status(self.assoc_id)?;
        let mut address =
            SocketAddress::parse(&status.primary_destination_address, status.dest_port)?;
        address.set_port(status.dest_port);
        Ok(address)
    }

    pub fn set_primary(
        &mut self,
        engine: &mut dyn Engine,
        primary: &SocketAddress,
    ) -> Result<()> {
        let index = self.path_index_for_address(engine, Some(primary))?;
        engine.set_primary(self.assoc_id, index)
    }

    pub fn set_peer_primary(
        &mut self,
        engine: &mut dyn Engine,
        primary: &SocketAddress,
    ) -> Result<()> {
        engine.set_peer_primary(self.assoc_id, primary)
    }

    pub fn send_buffer(&self, engine: &dyn Engine) -> Result<usize> {
        engine.send_buffer_size(self.assoc_id)
    }

    pub fn set_send_buffer(&mut self, engine: &mut dyn Engine, size: usize) -> Result<()> {
        engine.set_send_buffer_size(self.assoc_id, size)
    }

    pub fn receive_buffer(&self, engine: &dyn Engine) -> Result<usize> {
        engine.receive_buffer_size(self.assoc_id)
    }

    pub fn set_receive_buffer(&mut self, engine: &mut dyn Engine, size: usize) -> Result<()> {
        engine.set_receive_buffer_size(self.assoc_id, size)
    }

    pub fn traffic_class(&self, engine: &dyn Engine, stream_id: i32) -> Result<u8> {
        engine.traffic_class(self.assoc_id, stream_id)
    }

    pub fn set_traffic_class(
        &mut self,
        engine: &mut dyn Engine,
        traffic_class: u8,
        stream_id: i32,
    ) -> Result<()> {
        engine.set_traffic_class(self.assoc_id, stream_id, traffic_class)
    }
}
