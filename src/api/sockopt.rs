//! getsockopt / setsockopt / sctp_opt_info dispatch. SCTP-level options run
//! against the socket layer under the master's lock; the handful of
//! SOL_SOCKET / IP-level options a System descriptor supports delegate to
//! the host OS.

use crate::address::SocketAddress;
use crate::api::types::{
    Linger, OptName, SctpAssocParams, SctpEventSubscribe, SctpPaddrInfo, SctpPaddrParams,
    SctpPaddrState, SctpRtoInfo, SctpSndRcvInfo, SctpStatus, SocketOption,
};
use crate::api::{last_os_error, resolve, update_sctp_descriptor, Resolved};
use crate::association::AssocIoDefaults;
use crate::descriptor::SctpDescriptor;
use crate::engine::{AssocId, AssocState, PathState, SCTP_INFINITE_LIFETIME};
use crate::error::{Error, Result};
use crate::master::{MasterState, SocketMaster};
use crate::notification::{
    SCTP_RECVASSOCEVNT, SCTP_RECVDATAIOEVNT, SCTP_RECVPADDREVNT, SCTP_RECVPEERERR,
    SCTP_RECVSENDFAILEVNT, SCTP_RECVSHUTDOWNEVNT,
};

use log::trace;

use std::time::Duration;

fn assoc_state_code(state: AssocState) -> i32 {
    match state {
        AssocState::Closed => 0,
        AssocState::CookieWait => 1,
        AssocState::CookieEchoed => 2,
        AssocState::Established => 3,
        AssocState::ShutdownPending => 4,
        AssocState::ShutdownSent => 5,
        AssocState::ShutdownReceived => 6,
        AssocState::ShutdownAckSent => 7,
    }
}

/// The association an option call targets: the explicit id when given,
/// otherwise the descriptor's own association.
fn target_assoc(desc: &SctpDescriptor, assoc_id: AssocId) -> Option<AssocId> {
    match assoc_id {
        0 => desc.assoc_id,
        id => Some(id),
    }
}

pub fn getsockopt(fd: i32, name: OptName) -> Result<SocketOption> {
    opt_info(fd, 0, name)
}

/// getsockopt with an explicit association id, the sctp_opt_info() surface.
pub fn opt_info(fd: i32, assoc_id: AssocId, name: OptName) -> Result<SocketOption> {
    let desc = match resolve(fd)? {
        Resolved::System(os_fd) => return system_getsockopt(os_fd, name),
        Resolved::Sctp(desc) => desc,
    };
    let master = SocketMaster::try_instance()?;
    let assoc = target_assoc(&desc, assoc_id);

    match name {
        OptName::SctpStatus => master.with_state(|state| {
            let assoc_id = assoc.ok_or(Error::ErrNotConnected)?;
            let status = state.engine.association_status(assoc_id)?;
            let primary_index = status.primary_address_index;
            let primary = state.engine.path_status(assoc_id, primary_index)?;
            Ok(SocketOption::SctpStatus(SctpStatus {
                assoc_id,
                state: assoc_state_code(status.state),
                rwnd: status.current_receiver_window,
                unackdata: 0,
                penddata: 0,
                instrms: status.in_streams,
                outstrms: status.out_streams,
                fragmentation_point: primary.path_mtu,
                primary: SctpPaddrInfo {
                    assoc_id,
                    address: SocketAddress::parse(
                        &primary.destination_address,
                        status.dest_port,
                    )
                    .ok(),
                    state: match primary.state {
                        PathState::Reachable => SctpPaddrState::Active,
                        PathState::Unreachable => SctpPaddrState::Inactive,
                    },
                    cwnd: 0,
                    srtt: 0,
                    rto: primary.rto,
                    mtu: primary.path_mtu,
                },
            }))
        }),

        OptName::SctpInitMsg => Ok(SocketOption::SctpInitMsg(desc.initmsg)),

        OptName::SctpRtoInfo => master.with_state(|state| {
            let info = match assoc {
                Some(assoc_id) => {
                    let status = state.engine.association_status(assoc_id)?;
                    SctpRtoInfo {
                        assoc_id,
                        initial: status.rto_initial,
                        max: status.rto_max,
                        min: status.rto_min,
                    }
                }
                None => {
                    let socket = state
                        .sockets
                        .get(&desc.socket_id)
                        .ok_or(Error::ErrBadDescriptor)?;
                    let parameters = socket.assoc_defaults(state.engine.as_ref())?;
                    SctpRtoInfo {
                        assoc_id: 0,
                        initial: parameters.rto_initial,
                        max: parameters.rto_max,
                        min: parameters.rto_min,
                    }
                }
            };
            Ok(SocketOption::SctpRtoInfo(info))
        }),

        OptName::SctpAssocInfo => master.with_state(|state| {
            let info = match assoc {
                Some(assoc_id) => {
                    let status = state.engine.association_status(assoc_id)?;
                    SctpAssocParams {
                        assoc_id,
                        asocmaxrxt: status.assoc_max_retransmits,
                        number_peer_destinations: status.number_of_destination_paths,
                        peer_rwnd: 0,
                        local_rwnd: status.current_receiver_window,
                        cookie_life: 0,
                    }
                }
                None => {
                    let socket = state
                        .sockets
                        .get(&desc.socket_id)
                        .ok_or(Error::ErrBadDescriptor)?;
                    let parameters = socket.assoc_defaults(state.engine.as_ref())?;
                    SctpAssocParams {
                        assoc_id: 0,
                        asocmaxrxt: parameters.assoc_max_retransmits,
                        number_peer_destinations: 0,
                        peer_rwnd: 0,
                        local_rwnd: 0,
                        cookie_life: parameters.valid_cookie_life,
                    }
                }
            };
            Ok(SocketOption::SctpAssocInfo(info))
        }),

        OptName::SctpEvents => master.with_state(|state| {
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let mask = match assoc.and_then(|id| socket.assoc_list.get(&id)) {
                Some(a) => a.notification_flags,
                None => socket.notification_flags,
            };
            Ok(SocketOption::SctpEvents(SctpEventSubscribe::from_mask(
                mask,
            )))
        }),

        OptName::SctpDefaultSendParam => master.with_state(|state| {
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let defaults = match assoc.and_then(|id| socket.assoc_list.get(&id)) {
                Some(a) => a.io_defaults(),
                None => socket.default_io.clone(),
            };
            Ok(SocketOption::SctpDefaultSendParam(SctpSndRcvInfo {
                stream: defaults.stream_id,
                ppid: defaults.proto_id,
                context: defaults.context,
                timetolive: if defaults.time_to_live == SCTP_INFINITE_LIFETIME {
                    0
                } else {
                    defaults.time_to_live
                },
                assoc_id: assoc.unwrap_or(0),
                ..SctpSndRcvInfo::default()
            }))
        }),

        OptName::SctpAutoclose => master.with_state(|state| {
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            Ok(SocketOption::SctpAutoclose(
                socket.auto_close_timeout.as_secs() as u32,
            ))
        }),

        OptName::SctpNodelay => Ok(SocketOption::SctpNodelay(desc.nodelay)),

        OptName::SctpPrimaryAddr => master.with_state(|state| {
            let assoc_id = assoc.ok_or(Error::ErrNotConnected)?;
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let association = socket
                .association(assoc_id, false)
                .ok_or(Error::ErrNotConnected)?;
            let address = association.primary_address(state.engine.as_ref())?;
            Ok(SocketOption::SctpPrimaryAddr(address))
        }),

        OptName::SctpPeerAddrInfo(address) => master.with_state(|state| {
            let assoc_id = assoc.ok_or(Error::ErrNotConnected)?;
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let association = socket
                .association(assoc_id, false)
                .ok_or(Error::ErrNotConnected)?;
            let path = association.path_status(state.engine.as_ref(), Some(&address))?;
            Ok(SocketOption::SctpPeerAddrInfo(SctpPaddrInfo {
                assoc_id,
                address: Some(address),
                state: match path.state {
                    PathState::Reachable => SctpPaddrState::Active,
                    PathState::Unreachable => SctpPaddrState::Inactive,
                },
                cwnd: 0,
                srtt: 0,
                rto: path.rto,
                mtu: path.path_mtu,
            }))
        }),

        OptName::SctpPeerAddrParams(address) => master.with_state(|state| {
            let assoc_id = assoc.ok_or(Error::ErrNotConnected)?;
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let association = socket
                .association(assoc_id, false)
                .ok_or(Error::ErrNotConnected)?;
            let path = association.path_status(state.engine.as_ref(), address.as_ref())?;
            let status = state.engine.association_status(assoc_id)?;
            Ok(SocketOption::SctpPeerAddrParams(SctpPaddrParams {
                assoc_id,
                address,
                hbinterval: if path.heartbeat_enabled {
                    path.heartbeat_interval
                } else {
                    0
                },
                pathmaxrxt: status.assoc_max_retransmits,
            }))
        }),

        OptName::SendBuffer => master.with_state(|state| {
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let size = match assoc {
                Some(assoc_id) => state.engine.send_buffer_size(assoc_id)?,
                None => socket.send_buffer_default,
            };
            Ok(SocketOption::SendBuffer(size))
        }),

        OptName::ReceiveBuffer => master.with_state(|state| {
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let size = match assoc {
                Some(assoc_id) => state.engine.receive_buffer_size(assoc_id)?,
                None => socket.receive_buffer_default,
            };
            Ok(SocketOption::ReceiveBuffer(size))
        }),

        OptName::Linger => Ok(SocketOption::Linger(desc.linger)),

        OptName::IpTos => master.with_state(|state| {
            let socket = state
                .sockets
                .get(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            Ok(SocketOption::IpTos(socket.default_traffic_class))
        }),

        OptName::Ipv6FlowInfo => Ok(SocketOption::Ipv6FlowInfo(desc.flow_info)),
        OptName::Ipv6FlowInfoSend => Ok(SocketOption::Ipv6FlowInfoSend(desc.flow_info_send)),
    }
}

pub fn setsockopt(fd: i32, option: SocketOption) -> Result<()> {
    let desc = match resolve(fd)? {
        Resolved::System(os_fd) => return system_setsockopt(os_fd, option),
        Resolved::Sctp(desc) => desc,
    };
    let master = SocketMaster::try_instance()?;
    let assoc = desc.assoc_id;

    match option {
        SocketOption::SctpStatus(_) | SocketOption::SctpPeerAddrInfo(_) => {
            Err(Error::ErrOpNotSupported)
        }

        SocketOption::SctpInitMsg(initmsg) => {
            update_sctp_descriptor(fd, |d| d.initmsg = initmsg)
        }

        SocketOption::SctpRtoInfo(info) => master.with_state(|state| {
            match target_assoc(&desc, info.assoc_id) {
                Some(assoc_id) => {
                    let mut status = state.engine.association_status(assoc_id)?;
                    status.rto_initial = info.initial;
                    status.rto_max = info.max;
                    status.rto_min = info.min;
                    state.engine.set_association_status(assoc_id, &status)
                }
                None => {
                    let socket = state
                        .sockets
                        .get(&desc.socket_id)
                        .ok_or(Error::ErrBadDescriptor)?;
                    let mut parameters = socket.assoc_defaults(state.engine.as_ref())?;
                    parameters.rto_initial = info.initial;
                    parameters.rto_max = info.max;
                    parameters.rto_min = info.min;
                    let instance = socket.instance_id.ok_or(Error::ErrBadDescriptor)?;
                    state.engine.set_instance_parameters(instance, &parameters)
                }
            }
        }),

        SocketOption::SctpAssocInfo(info) => master.with_state(|state| {
            match target_assoc(&desc, info.assoc_id) {
                Some(assoc_id) => {
                    let mut status = state.engine.association_status(assoc_id)?;
                    status.assoc_max_retransmits = info.asocmaxrxt;
                    state.engine.set_association_status(assoc_id, &status)
                }
                None => {
                    let socket = state
                        .sockets
                        .get(&desc.socket_id)
                        .ok_or(Error::ErrBadDescriptor)?;
                    let mut parameters = socket.assoc_defaults(state.engine.as_ref())?;
                    parameters.assoc_max_retransmits = info.asocmaxrxt;
                    if info.cookie_life > 0 {
                        parameters.valid_cookie_life = info.cookie_life;
                    }
                    let instance = socket.instance_id.ok_or(Error::ErrBadDescriptor)?;
                    state.engine.set_instance_parameters(instance, &parameters)
                }
            }
        }),

        SocketOption::SctpEvents(events) => {
            let mask = events.to_mask();
            set_notification_mask(master, &desc, mask)
        }

        SocketOption::RecvDataIoEvent(on) => {
            set_notification_bit(master, &desc, SCTP_RECVDATAIOEVNT, on)
        }
        SocketOption::RecvAssocEvent(on) => {
            set_notification_bit(master, &desc, SCTP_RECVASSOCEVNT, on)
        }
        SocketOption::RecvPaddrEvent(on) => {
            set_notification_bit(master, &desc, SCTP_RECVPADDREVNT, on)
        }
        SocketOption::RecvPeerErrEvent(on) => {
            set_notification_bit(master, &desc, SCTP_RECVPEERERR, on)
        }
        SocketOption::RecvSendFailEvent(on) => {
            set_notification_bit(master, &desc, SCTP_RECVSENDFAILEVNT, on)
        }
        SocketOption::RecvShutdownEvent(on) => {
            set_notification_bit(master, &desc, SCTP_RECVSHUTDOWNEVNT, on)
        }

        SocketOption::SctpDefaultSendParam(info) => master.with_state(|state| {
            let socket = state
                .sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let defaults = AssocIoDefaults {
                stream_id: info.stream,
                proto_id: info.ppid,
                time_to_live: if info.timetolive == 0 {
                    SCTP_INFINITE_LIFETIME
                } else {
                    info.timetolive
                },
                context: info.context,
            };
            match target_assoc(&desc, info.assoc_id) {
                Some(assoc_id) => {
                    let association = socket
                        .assoc_list
                        .get_mut(&assoc_id)
                        .ok_or(Error::ErrNotConnected)?;
                    association.set_io_defaults(defaults);
                }
                None => {
                    let members: Vec<_> = socket.connectionless.iter().copied().collect();
                    for assoc_id in members {
                        if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                            a.set_io_defaults(defaults.clone());
                        }
                    }
                    socket.default_io = defaults;
                }
            }
            Ok(())
        }),

        SocketOption::SctpStreamTimeouts(timeouts) => master.with_state(|state| {
            let socket = state
                .sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            match assoc {
                Some(assoc_id) => {
                    let association = socket
                        .assoc_list
                        .get_mut(&assoc_id)
                        .ok_or(Error::ErrNotConnected)?;
                    if !association.set_default_stream_timeouts(
                        timeouts.timeout,
                        timeouts.start,
                        timeouts.end,
                    ) {
                        return Err(Error::ErrInvalidArgument);
                    }
                }
                None => {
                    let members: Vec<_> = socket.connectionless.iter().copied().collect();
                    for assoc_id in members {
                        if let Some(a) = socket.assoc_list.get_mut(&assoc_id) {
                            a.set_default_stream_timeouts(
                                timeouts.timeout,
                                timeouts.start,
                                timeouts.end,
                            );
                        }
                    }
                }
            }
            Ok(())
        }),

        SocketOption::SctpAutoclose(seconds) => master.with_state(|state| {
            let socket = state
                .sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            socket.auto_close_timeout = Duration::from_secs(seconds as u64);
            Ok(())
        }),

        SocketOption::SctpNodelay(on) => update_sctp_descriptor(fd, |d| d.nodelay = on),

        SocketOption::SctpPrimaryAddr(address) => master.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let assoc_id = assoc.ok_or(Error::ErrNotConnected)?;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let association = socket
                .association_mut(assoc_id, false)
                .ok_or(Error::ErrNotConnected)?;
            association.set_primary(engine.as_mut(), &address)
        }),

        SocketOption::SctpSetPeerPrimaryAddr(address) => master.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let assoc_id = assoc.ok_or(Error::ErrNotConnected)?;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let association = socket
                .association_mut(assoc_id, false)
                .ok_or(Error::ErrNotConnected)?;
            association.set_peer_primary(engine.as_mut(), &address)
        }),

        SocketOption::SctpPeerAddrParams(params) => master.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let assoc_id = target_assoc(&desc, params.assoc_id).ok_or(Error::ErrNotConnected)?;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            let association = socket
                .association_mut(assoc_id, false)
                .ok_or(Error::ErrNotConnected)?;
            let index =
                association.path_index_for_address(engine.as_ref(), params.address.as_ref())?;
            if params.hbinterval == u32::MAX {
                engine.request_heartbeat(assoc_id, index)
            } else {
                engine.change_heartbeat(
                    assoc_id,
                    index,
                    params.hbinterval > 0,
                    params.hbinterval,
                )
            }
        }),

        SocketOption::SendBuffer(size) => master.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            socket.send_buffer_default = size;
            match assoc {
                Some(assoc_id) => engine.set_send_buffer_size(assoc_id, size),
                None => {
                    socket.set_send_buffer(engine.as_mut(), size);
                    Ok(())
                }
            }
        }),

        SocketOption::ReceiveBuffer(size) => master.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            socket.receive_buffer_default = size;
            match assoc {
                Some(assoc_id) => engine.set_receive_buffer_size(assoc_id, size),
                None => {
                    socket.set_receive_buffer(engine.as_mut(), size);
                    Ok(())
                }
            }
        }),

        SocketOption::Linger(linger) => update_sctp_descriptor(fd, |d| d.linger = linger),

        SocketOption::IpTos(tos) => master.with_state(|state| {
            let MasterState {
                engine, sockets, ..
            } = state;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            socket.set_traffic_class(engine.as_mut(), tos, -1);
            if let Some(assoc_id) = assoc {
                let _ = engine.set_traffic_class(assoc_id, -1, tos);
            }
            Ok(())
        }),

        SocketOption::Ipv6FlowInfo(flowinfo) => {
            trace!("fd {fd}: flow info {flowinfo:#x}");
            update_sctp_descriptor(fd, |d| d.flow_info = flowinfo)
        }
        SocketOption::Ipv6FlowInfoSend(on) => {
            update_sctp_descriptor(fd, |d| d.flow_info_send = on)
        }
    }
}

/// Applies an events mask to the socket and to every current association,
/// the way SCTP_EVENTS has always worked here.
fn set_notification_mask(
    master: &'static SocketMaster,
    desc: &SctpDescriptor,
    mask: u32,
) -> Result<()> {
    master.with_state(|state| {
        let socket = state
            .sockets
            .get_mut(&desc.socket_id)
            .ok_or(Error::ErrBadDescriptor)?;
        socket.notification_flags = mask;
        for association in socket.assoc_list.values_mut() {
            association.notification_flags = mask;
        }
        Ok(())
    })
}

fn set_notification_bit(
    master: &'static SocketMaster,
    desc: &SctpDescriptor,
    bit: u32,
    on: bool,
) -> Result<()> {
    master.with_state(|state| {
        let socket = state
            .sockets
            .get_mut(&desc.socket_id)
            .ok_or(Error::ErrBadDescriptor)?;
        let apply = |mask: &mut u32| {
            if on {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
        };
        apply(&mut socket.notification_flags);
        for association in socket.assoc_list.values_mut() {
            apply(&mut association.notification_flags);
        }
        Ok(())
    })
}

// ====== System descriptor delegation ===================================

fn system_getsockopt(os_fd: i32, name: OptName) -> Result<SocketOption> {
    unsafe {
        match name {
            OptName::SendBuffer => {
                let mut value: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                if libc::getsockopt(
                    os_fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    &mut value as *mut _ as *mut libc::c_void,
                    &mut len,
                ) < 0
                {
                    return Err(last_os_error());
                }
                Ok(SocketOption::SendBuffer(value as usize))
            }
            OptName::ReceiveBuffer => {
                let mut value: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                if libc::getsockopt(
                    os_fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &mut value as *mut _ as *mut libc::c_void,
                    &mut len,
                ) < 0
                {
                    return Err(last_os_error());
                }
                Ok(SocketOption::ReceiveBuffer(value as usize))
            }
            OptName::Linger => {
                let mut value: libc::linger = libc::linger {
                    l_onoff: 0,
                    l_linger: 0,
                };
                let mut len = std::mem::size_of::<libc::linger>() as libc::socklen_t;
                if libc::getsockopt(
                    os_fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &mut value as *mut _ as *mut libc::c_void,
                    &mut len,
                ) < 0
                {
                    return Err(last_os_error());
                }
                Ok(SocketOption::Linger(Linger {
                    onoff: value.l_onoff != 0,
                    seconds: value.l_linger as u32,
                }))
            }
            OptName::IpTos => {
                let mut value: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                if libc::getsockopt(
                    os_fd,
                    libc::IPPROTO_IP,
                    libc::IP_TOS,
                    &mut value as *mut _ as *mut libc::c_void,
                    &mut len,
                ) < 0
                {
                    return Err(last_os_error());
                }
                Ok(SocketOption::IpTos(value as u8))
            }
            _ => Err(Error::ErrOpNotSupported),
        }
    }
}

fn system_setsockopt(os_fd: i32, option: SocketOption) -> Result<()> {
    unsafe {
        let ret = match option {
            SocketOption::SendBuffer(size) => {
                let value = size as libc::c_int;
                libc::setsockopt(
                    os_fd,
                    libc::SOL_SOCKET,
                    libc::SO_SNDBUF,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            }
            SocketOption::ReceiveBuffer(size) => {
                let value = size as libc::c_int;
                libc::setsockopt(
                    os_fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            }
            SocketOption::Linger(linger) => {
                let value = libc::linger {
                    l_onoff: linger.onoff as libc::c_int,
                    l_linger: linger.seconds as libc::c_int,
                };
                libc::setsockopt(
                    os_fd,
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                )
            }
            SocketOption::IpTos(tos) => {
                let value = tos as libc::c_int;
                libc::setsockopt(
                    os_fd,
                    libc::IPPROTO_IP,
                    libc::IP_TOS,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            }
            _ => return Err(Error::ErrOpNotSupported),
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }
}
