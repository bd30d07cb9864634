use crate::api::types::{Linger, SctpInitMsg};
use crate::engine::AssocId;
use crate::error::{Error, Result};
use crate::master::SocketId;

use log::trace;

use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard};

/// Size of the descriptor table, matching the select() universe.
pub const MAX_DESCRIPTORS: usize = libc::FD_SETSIZE as usize;

/// Descriptor payload for an SCTP endpoint: the socket handle, optionally a
/// single association (connection-oriented, accepted or peeled-off), and the
/// per-descriptor settings the BSD surface keeps outside the socket proper.
#[derive(Debug, Clone)]
pub struct SctpDescriptor {
    pub socket_id: SocketId,
    pub assoc_id: Option<AssocId>,
    pub domain: i32,
    pub socket_type: i32,
    pub flags: i32,
    pub initmsg: SctpInitMsg,
    pub linger: Linger,
    pub nodelay: bool,
    pub flow_info: u32,
    pub flow_info_send: bool,
    pub connection_oriented: bool,
    pub parent_fd: Option<i32>,
}

#[derive(Debug, Clone)]
pub enum Descriptor {
    Invalid,
    System(RawFd),
    Sctp(SctpDescriptor),
}

/// The process-global fd table. Slots 0..2 are premapped to the OS stdio
/// descriptors; new entries are allocated from the top down so they rarely
/// collide with kernel-assigned fds in the low range.
pub struct DescriptorTable {
    slots: Vec<Descriptor>,
}

static TABLE: Mutex<Option<DescriptorTable>> = Mutex::new(None);

impl DescriptorTable {
    fn new() -> Self {
        let mut slots = vec![Descriptor::Invalid; MAX_DESCRIPTORS];
        slots[0] = Descriptor::System(0);
        slots[1] = Descriptor::System(1);
        slots[2] = Descriptor::System(2);
        DescriptorTable { slots }
    }

    /// Locks the singleton table.
    pub fn global() -> MutexGuard<'static, Option<DescriptorTable>> {
        let mut guard = TABLE.lock().unwrap();
        if guard.is_none() {
            *guard = Some(DescriptorTable::new());
        }
        guard
    }

    pub fn lookup(&self, fd: i32) -> Option<&Descriptor> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return None;
        }
        match &self.slots[fd as usize] {
            Descriptor::Invalid => None,
            slot => Some(slot),
        }
    }

    pub fn lookup_mut(&mut self, fd: i32) -> Option<&mut Descriptor> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return None;
        }
        match &mut self.slots[fd as usize] {
            Descriptor::Invalid => None,
            slot => Some(slot),
        }
    }

    /// Allocates the highest free slot.
    pub fn insert(&mut self, descriptor: Descriptor) -> Result<i32> {
        for fd in (0..self.slots.len()).rev() {
            if matches!(self.slots[fd], Descriptor::Invalid) {
                trace!("descriptor table: allocated fd {fd}");
                self.slots[fd] = descriptor;
                return Ok(fd as i32);
            }
        }
        Err(Error::ErrTableFull)
    }

    pub fn remove(&mut self, fd: i32) -> Option<Descriptor> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return None;
        }
        let slot = std::mem::replace(&mut self.slots[fd as usize], Descriptor::Invalid);
        match slot {
            Descriptor::Invalid => None,
            slot => Some(slot),
        }
    }

    /// Descriptors whose parent is `fd` (accepted and peeled-off children).
    pub fn children_of(&self, fd: i32) -> Vec<i32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Descriptor::Sctp(desc) if desc.parent_fd == Some(fd) => Some(index as i32),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod descriptor_test {
    use super::*;
    use crate::api::types::{Linger, SctpInitMsg};

    fn sctp_descriptor(socket_id: SocketId) -> Descriptor {
        Descriptor::Sctp(SctpDescriptor {
            socket_id,
            assoc_id: None,
            domain: libc::AF_INET,
            socket_type: libc::SOCK_STREAM,
            flags: 0,
            initmsg: SctpInitMsg::default(),
            linger: Linger::default(),
            nodelay: false,
            flow_info: 0,
            flow_info_send: false,
            connection_oriented: true,
            parent_fd: None,
        })
    }

    #[test]
    fn test_stdio_premapped() {
        let mut table = DescriptorTable::new();
        for fd in 0..3 {
            assert!(matches!(table.lookup(fd), Some(Descriptor::System(f)) if *f == fd));
        }
        assert!(table.lookup(3).is_none());
        assert!(table.remove(42).is_none());
    }

    #[test]
    fn test_allocation_from_the_top() {
        let mut table = DescriptorTable::new();
        let first = table.insert(sctp_descriptor(1)).unwrap();
        let second = table.insert(sctp_descriptor(2)).unwrap();
        assert_eq!(first as usize, MAX_DESCRIPTORS - 1);
        assert_eq!(second as usize, MAX_DESCRIPTORS - 2);

        assert!(table.remove(first).is_some());
        let third = table.insert(sctp_descriptor(3)).unwrap();
        assert_eq!(third, first, "freed top slot is reused first");
    }

    #[test]
    fn test_children_of_tracks_parent() {
        let mut table = DescriptorTable::new();
        let parent = table.insert(sctp_descriptor(1)).unwrap();
        let mut child = sctp_descriptor(1);
        if let Descriptor::Sctp(ref mut desc) = child {
            desc.assoc_id = Some(7);
            desc.parent_fd = Some(parent);
        }
        let child_fd = table.insert(child).unwrap();
        assert_eq!(table.children_of(parent), vec![child_fd]);
        assert!(table.children_of(child_fd).is_empty());
    }

    #[test]
    fn test_out_of_range_lookups() {
        let table = DescriptorTable::new();
        assert!(table.lookup(-1).is_none());
        assert!(table.lookup(MAX_DESCRIPTORS as i32).is_none());
    }
}
