//! User-space BSD-style sockets API for SCTP.
//!
//! The crate multiplexes a single callback-driven SCTP protocol engine into
//! many concurrent application threads presenting familiar socket semantics:
//! socket/bind/listen/accept/connect/send/recv/close plus the SCTP
//! extensions (sctp_sendmsg, sctp_recvmsg, sctp_peeloff, bindx,
//! sctp_getpaddrs/sctp_getladdrs, sctp_opt_info), a select/poll layer that
//! composes SCTP readiness with native OS descriptors, and both association
//! models: one-to-one (SOCK_STREAM) and one-to-many with auto-connect and a
//! socket-level event queue (SOCK_DGRAM / SOCK_SEQPACKET).
//!
//! A dedicated event-loop thread owns the engine. Engine events are turned
//! into queued notifications and condition broadcasts under one global lock;
//! application threads block on the conditions, never inside the engine.

#![warn(rust_2018_idioms)]

pub mod address;
pub mod api;
pub mod association;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod master;
pub mod notification;
pub mod socket;
pub mod sync;

pub use crate::api::poll::{poll, select, PollFd, SelectSet};
pub use crate::api::sockopt::{getsockopt, opt_info as sctp_opt_info, setsockopt};
pub use crate::api::types::{
    BindxFlags, Linger, OptName, RecvMessage, SctpEventSubscribe, SctpInitMsg, SctpSndRcvInfo,
    SendMessage, SocketOption,
};
pub use crate::api::{
    accept, bind, bindx, close, connect, connectx, fcntl, getpeername, getsockname, listen, read,
    recv, recvfrom, recvmsg, sctp_enable_crc32, sctp_enable_ootb_handling, sctp_getladdrs,
    sctp_getpaddrs, sctp_isavailable, sctp_peeloff, sctp_recvmsg, sctp_sendmsg, send, sendmsg,
    sendto, shutdown, socket, write, PeelOffTarget,
};
pub use crate::address::{InternetAddress, SocketAddress};
pub use crate::error::{Error, Result};

/// Upper bound on addresses per endpoint or association.
pub const SCTP_MAX_NUM_ADDRESSES: usize = 20;

// ====== Message flags ===================================================
// The system values where they exist, private bits above them for the
// SCTP-specific ones.

pub const MSG_PEEK: i32 = libc::MSG_PEEK;
pub const MSG_DONTWAIT: i32 = libc::MSG_DONTWAIT;
pub const MSG_EOR: i32 = libc::MSG_EOR;
/// The read returned a notification, not user data.
pub const MSG_NOTIFICATION: i32 = 0x8000;
/// Graceful shutdown after this send.
pub const MSG_EOF: i32 = 0x0200;
/// Abort after this send.
pub const MSG_ABORT: i32 = 0x1000;
/// Unordered delivery for this message.
pub const MSG_UNORDERED: i32 = 0x10000;
/// Disable bundling for this message.
pub const MSG_UNBUNDLED: i32 = 0x20000;
