//! select()/poll() with composed readiness: SCTP descriptors contribute
//! their read/write/except conditions, System descriptors are watched by
//! the engine's event loop, and everything parents one global condition the
//! caller waits on.

use crate::api::Resolved;
use crate::association::UpdateConditionType;
use crate::descriptor::{Descriptor, DescriptorTable};
use crate::error::{Error, Result};
use crate::master::SocketMaster;
use crate::socket::SSF_AUTO_CONNECT;
use crate::sync::Condition;

use log::trace;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Output of select(): the descriptors found ready, per interest kind.
#[derive(Debug, Default, Clone)]
pub struct SelectSet {
    pub read: Vec<i32>,
    pub write: Vec<i32>,
    pub except: Vec<i32>,
}

impl SelectSet {
    pub fn count(&self) -> usize {
        self.read.len() + self.write.len() + self.except.len()
    }
}

pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

struct SctpWatch {
    fd: i32,
    kind: UpdateConditionType,
    condition: Arc<Condition>,
    parent: Arc<Condition>,
}

/// select() over this crate's descriptors. `None` timeout blocks until
/// something fires.
pub fn select(
    read: &[i32],
    write: &[i32],
    except: &[i32],
    timeout: Option<Duration>,
) -> Result<SelectSet> {
    let master = match SocketMaster::instance() {
        Some(master) if master.is_running() => master,
        _ => return native_select(read, write, except, timeout),
    };

    let global = Condition::new("select::GlobalCondition");
    let read_condition = Condition::new("select::ReadCondition");
    let write_condition = Condition::new("select::WriteCondition");
    let except_condition = Condition::new("select::ExceptCondition");
    read_condition.add_parent(&global);
    write_condition.add_parent(&global);
    except_condition.add_parent(&global);

    // Combined event mask per descriptor, so each System fd registers once.
    let mut masks: HashMap<i32, i16> = HashMap::new();
    for fd in read {
        *masks.entry(*fd).or_default() |= libc::POLLIN | libc::POLLPRI;
    }
    for fd in write {
        *masks.entry(*fd).or_default() |= libc::POLLOUT;
    }
    for fd in except {
        *masks.entry(*fd).or_default() |= libc::POLLERR;
    }

    let mut watches: Vec<SctpWatch> = Vec::new();
    let mut user_fds: Vec<(i32, RawFd)> = Vec::new();
    let cleanup = |watches: &Vec<SctpWatch>, user_fds: &Vec<(i32, RawFd)>| {
        for watch in watches {
            watch.condition.remove_parent(&watch.parent);
        }
        for (_, os_fd) in user_fds {
            master.remove_user_notification(*os_fd);
        }
    };

    for (&fd, &mask) in &masks {
        match crate::api::resolve(fd) {
            Ok(Resolved::System(os_fd)) => {
                let condition = match master.add_user_notification(os_fd, mask) {
                    Ok(condition) => condition,
                    Err(e) => {
                        cleanup(&watches, &user_fds);
                        return Err(e);
                    }
                };
                if mask & (libc::POLLIN | libc::POLLPRI) != 0 {
                    condition.add_parent(&read_condition);
                }
                if mask & libc::POLLOUT != 0 {
                    condition.add_parent(&write_condition);
                }
                condition.add_parent(&except_condition);
                user_fds.push((fd, os_fd));
            }
            Ok(Resolved::Sctp(desc)) => {
                let mut kinds = Vec::new();
                if mask & (libc::POLLIN | libc::POLLPRI) != 0 {
                    kinds.push(UpdateConditionType::Read);
                }
                if mask & libc::POLLOUT != 0 {
                    kinds.push(UpdateConditionType::Write);
                }
                if mask & libc::POLLERR != 0 {
                    kinds.push(UpdateConditionType::Except);
                }
                for kind in kinds {
                    let attach = master.with_state(|state| {
                        let socket = state
                            .sockets
                            .get(&desc.socket_id)
                            .ok_or(Error::ErrBadDescriptor)?;
                        let (condition, ready) = match desc.assoc_id {
                            Some(assoc_id) => {
                                let association = socket
                                    .assoc_list
                                    .get(&assoc_id)
                                    .ok_or(Error::ErrBadDescriptor)?;
                                let ready = match kind {
                                    UpdateConditionType::Read => association.read_ready,
                                    UpdateConditionType::Write => association.write_ready,
                                    UpdateConditionType::Except => association.has_exception,
                                };
                                (association.update_condition(kind).clone(), ready)
                            }
                            None => {
                                let ready = match kind {
                                    UpdateConditionType::Read => socket.read_ready,
                                    // Connectionless sockets are always
                                    // writable.
                                    UpdateConditionType::Write => {
                                        socket.flags & SSF_AUTO_CONNECT != 0
                                            || socket.write_ready
                                    }
                                    UpdateConditionType::Except => socket.has_exception,
                                };
                                (socket.update_condition(kind).clone(), ready)
                            }
                        };
                        Ok::<_, Error>((condition, ready))
                    });
                    let (condition, ready) = match attach {
                        Ok(pair) => pair,
                        Err(e) => {
                            cleanup(&watches, &user_fds);
                            return Err(e);
                        }
                    };
                    let parent = match kind {
                        UpdateConditionType::Read => read_condition.clone(),
                        UpdateConditionType::Write => write_condition.clone(),
                        UpdateConditionType::Except => except_condition.clone(),
                    };
                    if ready {
                        condition.signal();
                    }
                    condition.add_parent(&parent);
                    watches.push(SctpWatch {
                        fd,
                        kind,
                        condition,
                        parent,
                    });
                }
            }
            Err(e) => {
                cleanup(&watches, &user_fds);
                return Err(e);
            }
        }
    }

    // ====== Wait =========================================================
    if watches.is_empty() && user_fds.is_empty() {
        if let Some(timeout) = timeout {
            std::thread::sleep(timeout);
        }
        return Ok(SelectSet::default());
    }
    match timeout {
        Some(timeout) => {
            global.timed_wait(timeout.as_micros() as u64);
        }
        None => global.wait(),
    }

    // ====== Rebuild the output sets ======================================
    let mut result = SelectSet::default();
    for watch in &watches {
        if watch.condition.fired() {
            trace!("select: fd {} ready for {:?}", watch.fd, watch.kind);
            match watch.kind {
                UpdateConditionType::Read => result.read.push(watch.fd),
                UpdateConditionType::Write => result.write.push(watch.fd),
                UpdateConditionType::Except => result.except.push(watch.fd),
            }
        }
        watch.condition.remove_parent(&watch.parent);
    }
    for (fd, os_fd) in &user_fds {
        let events = master.remove_user_notification(*os_fd);
        if events & (libc::POLLIN | libc::POLLPRI) != 0 {
            result.read.push(*fd);
        }
        if events & libc::POLLOUT != 0 {
            result.write.push(*fd);
        }
        if events & !(libc::POLLIN | libc::POLLPRI | libc::POLLOUT) != 0 {
            result.except.push(*fd);
        }
    }
    Ok(result)
}

/// poll(), expressed in terms of select(). A zero interest set returns 0
/// immediately.
pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> Result<usize> {
    let mut read = Vec::new();
    let mut write = Vec::new();
    let mut except = Vec::new();
    for entry in fds.iter_mut() {
        entry.revents = 0;
        if entry.fd < 0 {
            continue;
        }
        if entry.events & libc::POLLIN != 0 {
            read.push(entry.fd);
        }
        if entry.events & libc::POLLOUT != 0 {
            write.push(entry.fd);
        }
        except.push(entry.fd);
    }
    if read.is_empty() && write.is_empty() && except.is_empty() {
        return Ok(0);
    }

    let timeout = if timeout_ms < 0 {
        None
    } else {
        Some(Duration::from_millis(timeout_ms as u64))
    };
    let result = select(&read, &write, &except, timeout)?;

    let mut changed = 0;
    for entry in fds.iter_mut() {
        if result.read.contains(&entry.fd) && entry.events & libc::POLLIN != 0 {
            entry.revents |= libc::POLLIN;
        }
        if result.write.contains(&entry.fd) && entry.events & libc::POLLOUT != 0 {
            entry.revents |= libc::POLLOUT;
        }
        if result.except.contains(&entry.fd) {
            entry.revents |= libc::POLLERR;
        }
        if entry.revents != 0 {
            changed += 1;
        }
    }
    Ok(changed)
}

/// Pure native path used when no engine thread is running: translate the
/// descriptors to OS fds and poll them directly.
fn native_select(
    read: &[i32],
    write: &[i32],
    except: &[i32],
    timeout: Option<Duration>,
) -> Result<SelectSet> {
    let mut entries: HashMap<i32, i16> = HashMap::new();
    for fd in read {
        *entries.entry(*fd).or_default() |= libc::POLLIN;
    }
    for fd in write {
        *entries.entry(*fd).or_default() |= libc::POLLOUT;
    }
    for fd in except {
        *entries.entry(*fd).or_default() |= libc::POLLERR;
    }

    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut reverse: Vec<i32> = Vec::new();
    {
        let guard = DescriptorTable::global();
        let table = guard.as_ref().unwrap();
        for (&fd, &events) in &entries {
            match table.lookup(fd) {
                Some(Descriptor::System(os_fd)) => {
                    pollfds.push(libc::pollfd {
                        fd: *os_fd,
                        events,
                        revents: 0,
                    });
                    reverse.push(fd);
                }
                Some(_) => {
                    trace!("native select: skipping non-System fd {fd}");
                }
                _ => return Err(Error::ErrBadDescriptor),
            }
        }
    }

    let timeout_ms = match timeout {
        Some(t) => t.as_millis() as i32,
        None => -1,
    };
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        return Err(crate::api::last_os_error());
    }

    let mut result = SelectSet::default();
    for (entry, fd) in pollfds.iter().zip(reverse) {
        if entry.revents & libc::POLLIN != 0 {
            result.read.push(fd);
        }
        if entry.revents & libc::POLLOUT != 0 {
            result.write.push(fd);
        }
        if entry.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            result.except.push(fd);
        }
    }
    Ok(result)
}
