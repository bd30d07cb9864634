//! The BSD-style entry points. Every call first resolves the descriptor:
//! System descriptors delegate one-to-one to the host OS, SCTP descriptors
//! dispatch into the socket layer under the master's lock. Errors carry the
//! errno value via [`Error::errno`].

pub mod poll;
pub mod sockopt;
pub mod types;

use crate::address::{InternetAddress, SocketAddress};
use crate::descriptor::{Descriptor, DescriptorTable, SctpDescriptor};
use crate::engine::{AssocId, SCTP_INFINITE_LIFETIME};
use crate::error::{Error, Result};
use crate::master::SocketMaster;
use crate::notification::SCTP_RECVDATAIOEVNT;
use crate::socket::{ReceiveScope, SSF_AUTO_CONNECT, SSF_GLOBAL_QUEUE};
use crate::{MSG_DONTWAIT, MSG_NOTIFICATION};

use types::{
    BindxFlags, Linger, RecvMessage, SctpInitMsg, SctpSndRcvInfo, SendMessage,
};

use log::{debug, trace};

use std::os::unix::io::RawFd;

/// Result of the last OS call, as an [`Error`].
pub(crate) fn last_os_error() -> Error {
    std::io::Error::last_os_error().into()
}

pub(crate) enum Resolved {
    System(RawFd),
    Sctp(SctpDescriptor),
}

/// Snapshot of the descriptor behind `fd`. The table lock is never held
/// across master calls.
pub(crate) fn resolve(fd: i32) -> Result<Resolved> {
    let guard = DescriptorTable::global();
    let table = guard.as_ref().unwrap();
    match table.lookup(fd).ok_or(Error::ErrBadDescriptor)? {
        Descriptor::System(os_fd) => Ok(Resolved::System(*os_fd)),
        Descriptor::Sctp(desc) => Ok(Resolved::Sctp(desc.clone())),
        Descriptor::Invalid => Err(Error::ErrBadDescriptor),
    }
}

pub(crate) fn update_sctp_descriptor(
    fd: i32,
    f: impl FnOnce(&mut SctpDescriptor),
) -> Result<()> {
    let mut guard = DescriptorTable::global();
    let table = guard.as_mut().unwrap();
    match table.lookup_mut(fd) {
        Some(Descriptor::Sctp(desc)) => {
            f(desc);
            Ok(())
        }
        _ => Err(Error::ErrBadDescriptor),
    }
}

// ====== socket() / close() =============================================

/// Creates a descriptor. `IPPROTO_SCTP` yields an SCTP descriptor
/// (SOCK_STREAM: one-to-one; SOCK_DGRAM / SOCK_SEQPACKET: one-to-many with
/// auto-connect and the global queue). Everything else falls through to the
/// host OS.
pub fn socket(domain: i32, socket_type: i32, protocol: i32) -> Result<i32> {
    if protocol == libc::IPPROTO_SCTP {
        let master = SocketMaster::try_instance()?;
        let connection_oriented = match socket_type {
            libc::SOCK_STREAM => true,
            libc::SOCK_DGRAM | libc::SOCK_SEQPACKET => false,
            _ => return Err(Error::ErrInvalidArgument),
        };
        let flags = if connection_oriented {
            0
        } else {
            SSF_GLOBAL_QUEUE | SSF_AUTO_CONNECT
        };
        let socket_id = master.create_socket(flags);
        let descriptor = Descriptor::Sctp(SctpDescriptor {
            socket_id,
            assoc_id: None,
            domain,
            socket_type,
            flags: 0,
            initmsg: SctpInitMsg::default(),
            linger: Linger::default(),
            nodelay: false,
            flow_info: 0,
            flow_info_send: false,
            connection_oriented,
            parent_fd: None,
        });
        let mut guard = DescriptorTable::global();
        let fd = guard.as_mut().unwrap().insert(descriptor);
        if fd.is_err() {
            drop(guard);
            master.close_socket(socket_id, false);
        }
        return fd;
    }

    let os_fd = unsafe { libc::socket(domain, socket_type, protocol) };
    if os_fd < 0 {
        return Err(last_os_error());
    }
    let mut guard = DescriptorTable::global();
    guard.as_mut().unwrap().insert(Descriptor::System(os_fd))
}

fn close_one(fd: i32) -> Result<()> {
    let removed = {
        let mut guard = DescriptorTable::global();
        guard.as_mut().unwrap().remove(fd)
    };
    match removed.ok_or(Error::ErrBadDescriptor)? {
        Descriptor::System(os_fd) => {
            let ret = unsafe { libc::close(os_fd) };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(())
        }
        Descriptor::Sctp(desc) => {
            let master = SocketMaster::try_instance()?;
            match desc.assoc_id {
                Some(assoc_id) => {
                    // Association-level descriptor: abort on zero linger.
                    let send_abort = desc.linger.onoff && desc.linger.seconds == 0;
                    master.close_association(desc.socket_id, assoc_id, send_abort);
                    if desc.parent_fd.is_none() {
                        master.close_socket(desc.socket_id, false);
                    }
                }
                None => {
                    // Socket-level descriptor. Auto-connect associations go
                    // down hard unless a positive linger asks for grace.
                    let send_abort = !(desc.linger.onoff && desc.linger.seconds > 0);
                    master.close_socket(desc.socket_id, send_abort);
                }
            }
            Ok(())
        }
        Descriptor::Invalid => Err(Error::ErrBadDescriptor),
    }
}

/// Closes a descriptor, accepted and peeled-off children first.
pub fn close(fd: i32) -> Result<()> {
    let children = {
        let guard = DescriptorTable::global();
        guard.as_ref().unwrap().children_of(fd)
    };
    for child in children {
        trace!("close({fd}): closing child descriptor {child}");
        let _ = close_one(child);
    }
    close_one(fd)
}

// ====== bind / listen / accept / connect ===============================

pub fn bind(fd: i32, address: &SocketAddress) -> Result<()> {
    bindx(fd, std::slice::from_ref(address), BindxFlags::AddAddr)
}

pub fn bindx(fd: i32, addresses: &[SocketAddress], flags: BindxFlags) -> Result<()> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let address = addresses.first().ok_or(Error::ErrInvalidArgument)?;
            let (storage, len) = address.to_system()?;
            let ret = unsafe {
                libc::bind(os_fd, &storage as *const _ as *const libc::sockaddr, len)
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(())
        }
        Resolved::Sctp(desc) => {
            if addresses.is_empty() {
                return Err(Error::ErrInvalidArgument);
            }
            let master = SocketMaster::try_instance()?;
            master.ensure_running()?;
            master.with_state(|state| {
                let crate::master::MasterState {
                    engine,
                    sockets,
                    instance_registry,
                    gc,
                    ..
                } = state;
                let socket = sockets
                    .get_mut(&desc.socket_id)
                    .ok_or(Error::ErrBadDescriptor)?;
                match flags {
                    BindxFlags::AddAddr if !socket.is_bound() => socket.bind(
                        engine.as_mut(),
                        instance_registry,
                        gc,
                        addresses[0].port(),
                        desc.initmsg.max_instreams,
                        desc.initmsg.num_ostreams,
                        addresses,
                    ),
                    BindxFlags::AddAddr => {
                        let instance = socket.instance_id.ok_or(Error::ErrBadDescriptor)?;
                        for address in addresses {
                            engine.add_local_address(instance, address)?;
                        }
                        Ok(())
                    }
                    BindxFlags::RemAddr => {
                        let instance = socket.instance_id.ok_or(Error::ErrBadDescriptor)?;
                        for address in addresses {
                            engine.remove_local_address(instance, address)?;
                        }
                        Ok(())
                    }
                }
            })
        }
    }
}

/// Binds an unbound SCTP socket to the any-address with a random ephemeral
/// port. Used by connect/listen/sendto on unbound descriptors.
fn bind_to_any(master: &'static SocketMaster, desc: &SctpDescriptor) -> Result<()> {
    master.ensure_running()?;
    let mut result = Err(Error::ErrAddressInUse);
    for _ in 0..1000 {
        let port = master.random_port();
        let address = SocketAddress::Internet(InternetAddress::any(port));
        result = master.with_state(|state| {
            let crate::master::MasterState {
                engine,
                sockets,
                instance_registry,
                gc,
                ..
            } = state;
            let socket = sockets
                .get_mut(&desc.socket_id)
                .ok_or(Error::ErrBadDescriptor)?;
            if socket.is_bound() {
                return Ok(());
            }
            socket.bind(
                engine.as_mut(),
                instance_registry,
                gc,
                port,
                desc.initmsg.max_instreams,
                desc.initmsg.num_ostreams,
                std::slice::from_ref(&address),
            )
        });
        match result {
            Ok(()) => return Ok(()),
            Err(Error::ErrAddressInUse) => continue,
            Err(_) => break,
        }
    }
    result
}

pub fn listen(fd: i32, backlog: u32) -> Result<()> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret = unsafe { libc::listen(os_fd, backlog as i32) };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(())
        }
        Resolved::Sctp(desc) => {
            let master = SocketMaster::try_instance()?;
            let bound = master.with_state(|state| {
                state
                    .sockets
                    .get(&desc.socket_id)
                    .map(|s| s.is_bound())
                    .ok_or(Error::ErrBadDescriptor)
            })?;
            if !bound {
                bind_to_any(master, &desc)?;
            }
            master.with_state(|state| {
                if let Some(socket) = state.sockets.get_mut(&desc.socket_id) {
                    socket.listen(backlog);
                }
            });
            Ok(())
        }
    }
}

/// Accepts the next incoming association and returns the new descriptor
/// together with the peer's addresses.
pub fn accept(fd: i32) -> Result<(i32, Vec<SocketAddress>)> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let mut storage = crate::address::empty_storage();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = unsafe {
                libc::accept(
                    os_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            let address = SocketAddress::from_system(&storage)
                .map(|a| vec![a])
                .unwrap_or_default();
            let mut guard = DescriptorTable::global();
            let new_fd = guard.as_mut().unwrap().insert(Descriptor::System(ret))?;
            Ok((new_fd, address))
        }
        Resolved::Sctp(desc) => {
            let master = SocketMaster::try_instance()?;
            let blocking = desc.flags & libc::O_NONBLOCK == 0;
            let (assoc_id, addresses) = master.accept_blocking(desc.socket_id, blocking)?;
            let child = Descriptor::Sctp(SctpDescriptor {
                assoc_id: Some(assoc_id),
                parent_fd: Some(fd),
                connection_oriented: true,
                ..desc.clone()
            });
            let mut guard = DescriptorTable::global();
            let new_fd = guard.as_mut().unwrap().insert(child);
            match new_fd {
                Ok(new_fd) => Ok((new_fd, addresses)),
                Err(e) => {
                    drop(guard);
                    master.close_association(desc.socket_id, assoc_id, true);
                    Err(e)
                }
            }
        }
    }
}

pub fn connect(fd: i32, address: &SocketAddress) -> Result<()> {
    connectx(fd, std::slice::from_ref(address)).map(|_| ())
}

/// Multi-address connect. Returns the association id.
pub fn connectx(fd: i32, addresses: &[SocketAddress]) -> Result<AssocId> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let address = addresses.first().ok_or(Error::ErrInvalidArgument)?;
            let (storage, len) = address.to_system()?;
            let ret = unsafe {
                libc::connect(os_fd, &storage as *const _ as *const libc::sockaddr, len)
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(0)
        }
        Resolved::Sctp(desc) => {
            if addresses.is_empty() {
                return Err(Error::ErrInvalidArgument);
            }
            if desc.connection_oriented && desc.assoc_id.is_some() {
                return Err(Error::ErrIsConnected);
            }
            let master = SocketMaster::try_instance()?;
            let bound = master.with_state(|state| {
                state
                    .sockets
                    .get(&desc.socket_id)
                    .map(|s| s.is_bound())
                    .ok_or(Error::ErrBadDescriptor)
            })?;
            if !bound {
                bind_to_any(master, &desc)?;
            }
            let blocking = desc.flags & libc::O_NONBLOCK == 0;
            let assoc_id = master.associate_blocking(
                desc.socket_id,
                desc.initmsg.num_ostreams,
                desc.initmsg.max_attempts,
                init_timeout_ms(&desc.initmsg),
                addresses,
                blocking,
            )?;
            if desc.connection_oriented {
                if update_sctp_descriptor(fd, |d| d.assoc_id = Some(assoc_id)).is_err() {
                    // The descriptor vanished while we were connecting.
                    master.close_association(desc.socket_id, assoc_id, true);
                    return Err(Error::ErrBadDescriptor);
                }
            } else {
                master.with_state(|state| {
                    if let Some(socket) = state.sockets.get_mut(&desc.socket_id) {
                        socket.connectionless.insert(assoc_id);
                    }
                });
            }
            debug!("connect on fd {fd}: association {assoc_id}");
            if !blocking {
                return Err(Error::ErrInProgress);
            }
            Ok(assoc_id)
        }
    }
}

/// Effective init timeout in milliseconds; zero keeps the engine default.
fn init_timeout_ms(initmsg: &SctpInitMsg) -> u32 {
    initmsg.max_init_timeo as u32
}

// ====== shutdown / names / fcntl =======================================

pub fn shutdown(fd: i32, how: i32) -> Result<()> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret = unsafe { libc::shutdown(os_fd, how) };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(())
        }
        Resolved::Sctp(desc) => {
            let assoc_id = desc.assoc_id.ok_or(Error::ErrNotConnected)?;
            if how == types::SHUT_RD {
                return Ok(());
            }
            let master = SocketMaster::try_instance()?;
            master.with_state(|state| {
                let crate::master::MasterState {
                    engine, sockets, ..
                } = state;
                if let Some(socket) = sockets.get_mut(&desc.socket_id) {
                    if let Some(association) = socket.assoc_list.get_mut(&assoc_id) {
                        association.shutdown(engine.as_mut());
                    }
                }
            });
            Ok(())
        }
    }
}

pub fn getsockname(fd: i32) -> Result<SocketAddress> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let mut storage = crate::address::empty_storage();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockname(
                    os_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            SocketAddress::from_system(&storage)
        }
        Resolved::Sctp(desc) => {
            let master = SocketMaster::try_instance()?;
            master.with_state(|state| {
                let socket = state
                    .sockets
                    .get(&desc.socket_id)
                    .ok_or(Error::ErrBadDescriptor)?;
                if !socket.is_bound() {
                    return Ok(SocketAddress::Internet(InternetAddress::any(0)));
                }
                socket
                    .local_addresses(state.engine.as_ref())?
                    .into_iter()
                    .next()
                    .ok_or(Error::ErrAddressNotAvailable)
            })
        }
    }
}

pub fn getpeername(fd: i32) -> Result<SocketAddress> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let mut storage = crate::address::empty_storage();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = unsafe {
                libc::getpeername(
                    os_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            SocketAddress::from_system(&storage)
        }
        Resolved::Sctp(desc) => {
            let assoc_id = desc.assoc_id.ok_or(Error::ErrNotConnected)?;
            let master = SocketMaster::try_instance()?;
            master.with_state(|state| {
                state
                    .engine
                    .remote_addresses(assoc_id)?
                    .into_iter()
                    .next()
                    .ok_or(Error::ErrNotConnected)
            })
        }
    }
}

/// fcntl with F_GETFL / F_SETFL. Other commands pass through for System
/// descriptors and are unsupported on SCTP ones.
pub fn fcntl(fd: i32, cmd: i32, arg: i32) -> Result<i32> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret = unsafe { libc::fcntl(os_fd, cmd, arg) };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(ret)
        }
        Resolved::Sctp(desc) => match cmd {
            libc::F_GETFL => Ok(desc.flags),
            libc::F_SETFL => {
                update_sctp_descriptor(fd, |d| d.flags = arg & libc::O_NONBLOCK)?;
                Ok(0)
            }
            _ => Err(Error::ErrOpNotSupported),
        },
    }
}

// ====== Data transfer ==================================================

pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret =
                unsafe { libc::read(os_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(ret as usize)
        }
        Resolved::Sctp(_) => recv(fd, buf, 0),
    }
}

pub fn write(fd: i32, buf: &[u8]) -> Result<usize> {
    match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret =
                unsafe { libc::write(os_fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if ret < 0 {
                return Err(last_os_error());
            }
            Ok(ret as usize)
        }
        Resolved::Sctp(_) => send(fd, buf, 0),
    }
}

/// The receive core shared by recv/recvfrom/recvmsg/sctp_recvmsg.
fn recv_core(fd: i32, buf: &mut [u8], mut flags: i32) -> Result<RecvMessage> {
    let desc = match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret = unsafe {
                libc::recv(
                    os_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags & !MSG_NOTIFICATION,
                )
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            return Ok(RecvMessage {
                len: ret as usize,
                flags,
                address: None,
                info: None,
            });
        }
        Resolved::Sctp(desc) => desc,
    };

    let master = SocketMaster::try_instance()?;
    if desc.flags & libc::O_NONBLOCK != 0 {
        flags |= MSG_DONTWAIT;
    }
    let scope = match desc.assoc_id {
        Some(assoc_id) if desc.connection_oriented => ReceiveScope::Assoc(assoc_id),
        _ => ReceiveScope::Global,
    };
    if scope == ReceiveScope::Global && desc.connection_oriented {
        return Err(Error::ErrNotConnected);
    }
    let info = master.receive_blocking(desc.socket_id, scope, buf, flags)?;

    let data_io = master.with_state(|state| {
        state
            .sockets
            .get(&desc.socket_id)
            .map(|socket| match scope {
                ReceiveScope::Assoc(assoc_id) => socket
                    .assoc_list
                    .get(&assoc_id)
                    .map(|a| a.notification_flags & SCTP_RECVDATAIOEVNT != 0)
                    .unwrap_or(false),
                ReceiveScope::Global => socket.notification_flags & SCTP_RECVDATAIOEVNT != 0,
            })
            .unwrap_or(false)
    });

    let address = info
        .remote_addresses
        .first()
        .and_then(|a| SocketAddress::parse(a, info.remote_port).ok());
    let side_info = if data_io {
        Some(SctpSndRcvInfo {
            stream: info.stream_id,
            ssn: info.ssn,
            flags: info.flags,
            ppid: info.proto_id,
            context: 0,
            timetolive: 0,
            tsn: info.tsn,
            cumtsn: 0,
            assoc_id: info.assoc_id,
        })
    } else {
        None
    };
    Ok(RecvMessage {
        len: info.len,
        flags: info.flags,
        address,
        info: side_info,
    })
}

pub fn recv(fd: i32, buf: &mut [u8], flags: i32) -> Result<usize> {
    recv_core(fd, buf, flags & !MSG_NOTIFICATION).map(|m| m.len)
}

pub fn recvfrom(fd: i32, buf: &mut [u8], flags: i32) -> Result<(usize, Option<SocketAddress>)> {
    recv_core(fd, buf, flags & !MSG_NOTIFICATION).map(|m| (m.len, m.address))
}

/// recvmsg: iovecs are filled from one coalesced message, since the
/// underlying engine is message-oriented. Notifications are delivered.
pub fn recvmsg(fd: i32, iov: &mut [&mut [u8]], flags: i32) -> Result<RecvMessage> {
    let total: usize = iov.iter().map(|b| b.len()).sum();
    let mut coalesced = vec![0u8; total];
    let message = recv_core(fd, &mut coalesced, flags | MSG_NOTIFICATION)?;
    let mut offset = 0;
    for buf in iov.iter_mut() {
        if offset >= message.len {
            break;
        }
        let take = buf.len().min(message.len - offset);
        buf[..take].copy_from_slice(&coalesced[offset..offset + take]);
        offset += take;
    }
    Ok(message)
}

pub fn send(fd: i32, buf: &[u8], flags: i32) -> Result<usize> {
    sendto(fd, buf, flags, None)
}

pub fn sendto(
    fd: i32,
    buf: &[u8],
    flags: i32,
    destination: Option<&SocketAddress>,
) -> Result<usize> {
    sendto_with_info(fd, buf, flags, destination, None)
}

fn sendto_with_info(
    fd: i32,
    buf: &[u8],
    mut flags: i32,
    destination: Option<&SocketAddress>,
    info: Option<&SctpSndRcvInfo>,
) -> Result<usize> {
    let desc = match resolve(fd)? {
        Resolved::System(os_fd) => {
            let ret = match destination {
                Some(address) => {
                    let (storage, len) = address.to_system()?;
                    unsafe {
                        libc::sendto(
                            os_fd,
                            buf.as_ptr() as *const libc::c_void,
                            buf.len(),
                            flags,
                            &storage as *const _ as *const libc::sockaddr,
                            len,
                        )
                    }
                }
                None => unsafe {
                    libc::send(os_fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
                },
            };
            if ret < 0 {
                return Err(last_os_error());
            }
            return Ok(ret as usize);
        }
        Resolved::Sctp(desc) => desc,
    };

    let master = SocketMaster::try_instance()?;
    if desc.flags & libc::O_NONBLOCK != 0 {
        flags |= MSG_DONTWAIT;
    }
    let (stream_id, proto_id, time_to_live, use_defaults) = match info {
        Some(info) => {
            flags |= info.flags;
            let ttl = if info.timetolive == 0 {
                SCTP_INFINITE_LIFETIME
            } else {
                info.timetolive
            };
            (info.stream, info.ppid, ttl, false)
        }
        None => (0, 0, SCTP_INFINITE_LIFETIME, true),
    };

    match desc.assoc_id {
        Some(assoc_id) if desc.connection_oriented => master.send_blocking(
            desc.socket_id,
            assoc_id,
            buf,
            flags,
            stream_id,
            proto_id,
            time_to_live,
            use_defaults,
        ),
        _ => {
            if destination.is_none() && desc.connection_oriented {
                return Err(Error::ErrNotConnected);
            }
            if destination.is_some() {
                let bound = master.with_state(|state| {
                    state
                        .sockets
                        .get(&desc.socket_id)
                        .map(|s| s.is_bound())
                        .ok_or(Error::ErrBadDescriptor)
                })?;
                if !bound {
                    bind_to_any(master, &desc)?;
                }
            }
            master.sendto_blocking(
                desc.socket_id,
                buf,
                flags,
                info.map(|i| i.assoc_id).unwrap_or(0),
                stream_id,
                proto_id,
                time_to_live,
                desc.initmsg.max_attempts,
                init_timeout_ms(&desc.initmsg),
                use_defaults,
                destination,
                desc.initmsg.num_ostreams.max(1),
            )
        }
    }
}

/// sendmsg: iovecs are coalesced into one message; `info` supplies the
/// side information a cmsg(SCTP_SNDRCV) would.
pub fn sendmsg(fd: i32, message: &SendMessage<'_>) -> Result<usize> {
    let total: usize = message.iov.iter().map(|b| b.len()).sum();
    let mut coalesced = Vec::with_capacity(total);
    for part in message.iov {
        coalesced.extend_from_slice(part);
    }
    sendto_with_info(
        fd,
        &coalesced,
        message.flags,
        message.address.as_ref(),
        message.info.as_ref(),
    )
}

// ====== SCTP extensions ================================================

/// The cmsg-free convenience send.
#[allow(clippy::too_many_arguments)]
pub fn sctp_sendmsg(
    fd: i32,
    buf: &[u8],
    to: Option<&SocketAddress>,
    ppid: u32,
    flags: i32,
    stream: u16,
    timetolive: u32,
    context: u32,
) -> Result<usize> {
    let info = SctpSndRcvInfo {
        stream,
        ppid,
        flags: 0,
        timetolive,
        context,
        ..SctpSndRcvInfo::default()
    };
    sendto_with_info(fd, buf, flags, to, Some(&info))
}

/// The cmsg-free convenience receive: data or (when subscribed)
/// notifications, with source address and side information.
pub fn sctp_recvmsg(
    fd: i32,
    buf: &mut [u8],
    flags: i32,
) -> Result<(usize, Option<SocketAddress>, Option<SctpSndRcvInfo>, i32)> {
    let message = recv_core(fd, buf, flags | MSG_NOTIFICATION)?;
    Ok((message.len, message.address, message.info, message.flags))
}

/// Detaches an auto-connect association into its own one-to-one descriptor.
pub fn sctp_peeloff(fd: i32, target: PeelOffTarget) -> Result<i32> {
    let desc = match resolve(fd)? {
        Resolved::System(_) => return Err(Error::ErrOpNotSupported),
        Resolved::Sctp(desc) => desc,
    };
    if desc.connection_oriented {
        return Err(Error::ErrOpNotSupported);
    }
    let master = SocketMaster::try_instance()?;
    let assoc_id = master.with_state(|state| {
        let crate::master::MasterState {
            engine, sockets, ..
        } = state;
        let socket = sockets
            .get_mut(&desc.socket_id)
            .ok_or(Error::ErrBadDescriptor)?;
        match &target {
            PeelOffTarget::Association(assoc_id) => socket.peel_off(*assoc_id),
            PeelOffTarget::Destination(address) => {
                socket.peel_off_address(engine.as_ref(), address)
            }
        }
    })?;
    let child = Descriptor::Sctp(SctpDescriptor {
        assoc_id: Some(assoc_id),
        parent_fd: Some(fd),
        connection_oriented: true,
        ..desc
    });
    let mut guard = DescriptorTable::global();
    guard.as_mut().unwrap().insert(child)
}

pub enum PeelOffTarget {
    Association(AssocId),
    Destination(SocketAddress),
}

/// Peer addresses of an association (`assoc_id` zero means the descriptor's
/// own association). The returned vector replaces sctp_freepaddrs.
pub fn sctp_getpaddrs(fd: i32, assoc_id: AssocId) -> Result<Vec<SocketAddress>> {
    let desc = match resolve(fd)? {
        Resolved::System(_) => return Err(Error::ErrOpNotSupported),
        Resolved::Sctp(desc) => desc,
    };
    let assoc_id = match assoc_id {
        0 => desc.assoc_id.ok_or(Error::ErrNotConnected)?,
        id => id,
    };
    let master = SocketMaster::try_instance()?;
    master.with_state(|state| state.engine.remote_addresses(assoc_id))
}

/// Local addresses of the endpoint. The returned vector replaces
/// sctp_freeladdrs.
pub fn sctp_getladdrs(fd: i32, _assoc_id: AssocId) -> Result<Vec<SocketAddress>> {
    let desc = match resolve(fd)? {
        Resolved::System(_) => return Err(Error::ErrOpNotSupported),
        Resolved::Sctp(desc) => desc,
    };
    let master = SocketMaster::try_instance()?;
    master.with_state(|state| {
        let socket = state
            .sockets
            .get(&desc.socket_id)
            .ok_or(Error::ErrBadDescriptor)?;
        socket.local_addresses(state.engine.as_ref())
    })
}

/// True when the SCTP engine initialized and the wrapper is usable.
pub fn sctp_isavailable() -> bool {
    SocketMaster::instance().is_some()
}

pub fn sctp_enable_ootb_handling(enable: bool) -> Result<()> {
    SocketMaster::try_instance()?.enable_ootb_handling(enable)
}

pub fn sctp_enable_crc32(enable: bool) -> Result<()> {
    SocketMaster::try_instance()?.enable_crc32(enable)
}
