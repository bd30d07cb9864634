/// A packet-socket address, identified by interface name only. Carried as a
/// value type; system-level packet socket plumbing is outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketAddress {
    interface: String,
}

impl PacketAddress {
    pub fn new(interface: &str) -> Self {
        PacketAddress {
            interface: interface.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.interface.is_empty() && self.interface.len() < libc::IFNAMSIZ
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}
