use crate::address::empty_storage;
use crate::error::{Error, Result};

use std::mem;

/// Maximum path length a `sockaddr_un` can carry, including the NUL.
const MAX_PATH_LEN: usize = 108;

/// A Unix domain socket address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixAddress {
    path: String,
}

impl UnixAddress {
    pub fn new(path: &str) -> Result<Self> {
        if path.len() >= MAX_PATH_LEN {
            return Err(Error::ErrNameTooLong);
        }
        Ok(UnixAddress {
            path: path.to_string(),
        })
    }

    pub fn is_valid(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn to_system(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let mut storage = empty_storage();
        let sun = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un;
        unsafe {
            (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (i, b) in self.path.as_bytes().iter().enumerate() {
                (*sun).sun_path[i] = *b as libc::c_char;
            }
        }
        Ok((storage, mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
    }

    pub fn from_system(storage: &libc::sockaddr_storage) -> Result<Self> {
        if storage.ss_family as i32 != libc::AF_UNIX {
            return Err(Error::ErrFamilyUnsupported);
        }
        let sun = storage as *const libc::sockaddr_storage as *const libc::sockaddr_un;
        let mut path = String::new();
        unsafe {
            for c in (*sun).sun_path.iter() {
                if *c == 0 {
                    break;
                }
                path.push(*c as u8 as char);
            }
        }
        UnixAddress::new(&path)
    }
}
