use crate::address::{empty_storage, PF_HIDE_PORT, PF_LEGACY};
use crate::error::{Error, Result};

use std::cmp::Ordering;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// An Internet address with port, IPv6 flow label and traffic class.
///
/// IPv4 addresses are stored IPv4-mapped-in-IPv6, so two addresses naming
/// the same host compare equal regardless of the family they were created
/// from.
#[derive(Debug, Clone, Hash)]
pub struct InternetAddress {
    addr: Ipv6Addr,
    port: u16,
    flow_label: u32,
    traffic_class: u8,
    scope_id: u32,
}

impl InternetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let addr = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        InternetAddress {
            addr,
            port,
            flow_label: 0,
            traffic_class: 0,
            scope_id: 0,
        }
    }

    /// Parses `"host"`, `"host:port"` or `"[v6]:port"`. An explicit `port`
    /// argument applies when the string carries none.
    pub fn parse(s: &str, port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ErrAddressParse);
        }
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(InternetAddress::new(sa.ip(), sa.port()));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(InternetAddress::new(ip, port));
        }
        // "host:port" with an IPv4 host part
        if let Some((host, p)) = s.rsplit_once(':') {
            if !host.contains(':') {
                if let (Ok(ip), Ok(p)) = (host.parse::<IpAddr>(), p.parse::<u16>()) {
                    return Ok(InternetAddress::new(ip, p));
                }
            }
        }
        Err(Error::ErrAddressParse)
    }

    pub fn any(port: u16) -> Self {
        InternetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    pub fn localhost(port: u16) -> Self {
        InternetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn is_valid(&self) -> bool {
        // The null value is all-zero with port zero.
        !(self.addr.is_unspecified() && self.port == 0)
    }

    pub fn is_any(&self) -> bool {
        self.addr.is_unspecified()
            || self
                .addr
                .to_ipv4_mapped()
                .map(|v4| v4.is_unspecified())
                .unwrap_or(false)
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.to_ipv4_mapped().is_some()
    }

    pub fn family(&self) -> i32 {
        if self.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// 20-bit IPv6 flow label.
    pub fn flow_label(&self) -> u32 {
        self.flow_label
    }

    pub fn set_flow_label(&mut self, label: u32) {
        self.flow_label = label & 0x000f_ffff;
    }

    pub fn traffic_class(&self) -> u8 {
        self.traffic_class
    }

    pub fn set_traffic_class(&mut self, tc: u8) {
        self.traffic_class = tc;
    }

    /// Combined `sin6_flowinfo` value: traffic class above the flow label.
    pub fn flow_info(&self) -> u32 {
        ((self.traffic_class as u32) << 20) | self.flow_label
    }

    pub fn set_flow_info(&mut self, flowinfo: u32) {
        self.flow_label = flowinfo & 0x000f_ffff;
        self.traffic_class = ((flowinfo >> 20) & 0xff) as u8;
    }

    pub fn ip(&self) -> IpAddr {
        match self.addr.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.addr),
        }
    }

    /// Canonical mapped representation used by comparison.
    pub fn mapped(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn address_string(&self, format: u32) -> String {
        // PF_LEGACY prints a mapped address in dotted-quad form; without it
        // the ::ffff: prefix stays visible.
        let legacy_v4 = format & PF_LEGACY != 0 && self.is_ipv4();
        let host = match self.addr.to_ipv4_mapped() {
            Some(v4) if legacy_v4 => v4.to_string(),
            _ => self.addr.to_string(),
        };
        if format & PF_HIDE_PORT != 0 {
            host
        } else if legacy_v4 {
            format!("{}:{}", host, self.port)
        } else {
            format!("[{}]:{}", host, self.port)
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    pub fn to_system(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let mut storage = empty_storage();
        match self.addr.to_ipv4_mapped() {
            Some(v4) => {
                let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = self.port.to_be();
                    (*sin).sin_addr.s_addr = u32::from(v4).to_be();
                }
                Ok((storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
            }
            None => {
                let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = self.port.to_be();
                    (*sin6).sin6_flowinfo = self.flow_info().to_be();
                    (*sin6).sin6_addr.s6_addr = self.addr.octets();
                    (*sin6).sin6_scope_id = self.scope_id;
                }
                Ok((storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
            }
        }
    }

    pub fn from_system(storage: &libc::sockaddr_storage) -> Result<Self> {
        match storage.ss_family as i32 {
            libc::AF_INET => {
                let sin = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in;
                let (addr, port) = unsafe {
                    (
                        Ipv4Addr::from(u32::from_be((*sin).sin_addr.s_addr)),
                        u16::from_be((*sin).sin_port),
                    )
                };
                Ok(InternetAddress::new(IpAddr::V4(addr), port))
            }
            libc::AF_INET6 => {
                let sin6 = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6;
                let (octets, port, flowinfo, scope) = unsafe {
                    (
                        (*sin6).sin6_addr.s6_addr,
                        u16::from_be((*sin6).sin6_port),
                        u32::from_be((*sin6).sin6_flowinfo),
                        (*sin6).sin6_scope_id,
                    )
                };
                let mut address = InternetAddress::new(IpAddr::V6(Ipv6Addr::from(octets)), port);
                address.set_flow_info(flowinfo);
                address.scope_id = scope;
                Ok(address)
            }
            _ => Err(Error::ErrFamilyUnsupported),
        }
    }
}

impl PartialEq for InternetAddress {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.port == other.port
    }
}

impl Eq for InternetAddress {}

impl PartialOrd for InternetAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternetAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .octets()
            .cmp(&other.addr.octets())
            .then(self.port.cmp(&other.port))
    }
}

impl From<SocketAddr> for InternetAddress {
    fn from(sa: SocketAddr) -> Self {
        let mut address = InternetAddress::new(sa.ip(), sa.port());
        if let SocketAddr::V6(v6) = sa {
            address.set_flow_info(v6.flowinfo());
            address.scope_id = v6.scope_id();
        }
        address
    }
}
