#[cfg(test)]
mod address_test;

mod internet;
mod packet;
mod unix;

pub use internet::InternetAddress;
pub use packet::PacketAddress;
pub use unix::UnixAddress;

use crate::error::{Error, Result};

use std::fmt;
use std::mem;

/// Print only the address part.
pub const PF_ADDRESS: u32 = 1 << 0;
/// Suppress the `:port` suffix.
pub const PF_HIDE_PORT: u32 = 1 << 1;
/// Print IPv4-mapped IPv6 addresses in dotted-quad form.
pub const PF_LEGACY: u32 = 1 << 2;

/// A socket address value. Internet addresses keep IPv4 mapped into IPv6
/// internally, so comparison is family-agnostic for equivalent addresses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketAddress {
    Internet(InternetAddress),
    Unix(UnixAddress),
    Packet(PacketAddress),
}

impl SocketAddress {
    /// Parses `"host"`, `"host:port"`, `"[v6]:port"` or a Unix path
    /// (anything containing `/`). A separate port wins over a suffix.
    pub fn parse(s: &str, port: u16) -> Result<SocketAddress> {
        if s.contains('/') {
            return Ok(SocketAddress::Unix(UnixAddress::new(s)?));
        }
        Ok(SocketAddress::Internet(InternetAddress::parse(s, port)?))
    }

    pub fn is_valid(&self) -> bool {
        match self {
            SocketAddress::Internet(a) => a.is_valid(),
            SocketAddress::Unix(a) => a.is_valid(),
            SocketAddress::Packet(a) => a.is_valid(),
        }
    }

    pub fn family(&self) -> i32 {
        match self {
            SocketAddress::Internet(a) => a.family(),
            SocketAddress::Unix(_) => libc::AF_UNIX,
            SocketAddress::Packet(_) => libc::AF_PACKET,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SocketAddress::Internet(a) => a.port(),
            _ => 0,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        if let SocketAddress::Internet(a) = self {
            a.set_port(port);
        }
    }

    pub fn address_string(&self, format: u32) -> String {
        match self {
            SocketAddress::Internet(a) => a.address_string(format),
            SocketAddress::Unix(a) => a.path().to_string(),
            SocketAddress::Packet(a) => a.interface().to_string(),
        }
    }

    /// Converts to a system `sockaddr_storage`. Returns the storage and the
    /// length actually used.
    pub fn to_system(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        match self {
            SocketAddress::Internet(a) => a.to_system(),
            SocketAddress::Unix(a) => a.to_system(),
            SocketAddress::Packet(_) => Err(Error::ErrFamilyUnsupported),
        }
    }

    /// Builds an address from a system `sockaddr_storage`.
    pub fn from_system(storage: &libc::sockaddr_storage) -> Result<SocketAddress> {
        match storage.ss_family as i32 {
            libc::AF_INET | libc::AF_INET6 => {
                Ok(SocketAddress::Internet(InternetAddress::from_system(
                    storage,
                )?))
            }
            libc::AF_UNIX => Ok(SocketAddress::Unix(UnixAddress::from_system(storage)?)),
            _ => Err(Error::ErrFamilyUnsupported),
        }
    }

    pub fn as_internet(&self) -> Option<&InternetAddress> {
        match self {
            SocketAddress::Internet(a) => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_string(PF_ADDRESS))
    }
}

/// Zeroed `sockaddr_storage`, the starting point for every conversion.
pub(crate) fn empty_storage() -> libc::sockaddr_storage {
    unsafe { mem::zeroed() }
}
