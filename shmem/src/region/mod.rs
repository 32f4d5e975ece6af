use std::fmt;
use std::ptr;

use log::{debug, info, warn};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::{LatticeError, Result};

pub struct SharedRegion {
    name: String,
    shmem: Shmem,
}

// POSIX shared memory names start with a single `/`.
pub fn os_name(name: &str) -> String {
    if cfg!(unix) && !name.starts_with('/') {
        format!("/{}", name)
    } else {
        name.to_string()
    }
}

impl SharedRegion {
    /// Replaces any stale region under `name`. The new region is zero-filled.
    pub fn create(name: &str, size: usize) -> Result<SharedRegion> {
        let name = os_name(name);
        if SharedRegion::remove(&name)? {
            warn!("removed stale shared memory region `{}` left by a previous run", name);
        }
        let mut shmem = ShmemConf::new()
            .size(size)
            .os_id(&name)
            .create()
            .map_err(|source| LatticeError::Allocation {
                name: name.clone(),
                size,
                source,
            })?;
        // The mapping must not unlink the name on drop: only `remove` does that.
        shmem.set_owner(false);
        unsafe { ptr::write_bytes(shmem.as_ptr(), 0, shmem.len()) };
        info!("created shared memory region `{}` ({} bytes)", name, shmem.len());
        Ok(SharedRegion { name, shmem })
    }

    pub fn attach(name: &str) -> Result<SharedRegion> {
        let name = os_name(name);
        let mut shmem = match ShmemConf::new().os_id(&name).open() {
            Ok(v) => v,
            Err(e) if is_not_found(&e) => return Err(LatticeError::NotFound { name }),
            Err(e) if is_unsized(&e) => return Err(LatticeError::NotReady { name }),
            Err(source) => return Err(LatticeError::Open { name, source }),
        };
        shmem.set_owner(false);
        info!("attached shared memory region `{}` ({} bytes)", name, shmem.len());
        Ok(SharedRegion { name, shmem })
    }

    /// Whether a region was removed. A missing one is not an error.
    pub fn remove(name: &str) -> Result<bool> {
        let name = os_name(name);
        let removed = unlink(&name)?;
        if removed {
            debug!("removed shared memory region `{}`", name);
        }
        Ok(removed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shmem.len() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.shmem.len())
            .finish()
    }
}

fn is_not_found(err: &ShmemError) -> bool {
    match err {
        ShmemError::MapOpenFailed(code) => *code == libc::ENOENT as u32,
        ShmemError::LinkDoesNotExist => true,
        _ => false,
    }
}

// The name exists but its creator has not sized it yet: mapping zero bytes
// fails with EINVAL.
fn is_unsized(err: &ShmemError) -> bool {
    match err {
        ShmemError::MapOpenFailed(code) => cfg!(unix) && *code == libc::EINVAL as u32,
        _ => false,
    }
}

#[cfg(unix)]
fn unlink(name: &str) -> Result<bool> {
    use std::ffi::CString;
    use std::io;

    let c_name = CString::new(name)
        .map_err(|_| LatticeError::Config(format!("region name `{}` contains a NUL byte", name)))?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOENT) => Ok(false),
        _ => Err(LatticeError::Remove {
            name: name.to_string(),
            source: err,
        }),
    }
}

// Named mappings vanish with their last handle here; taking ownership of an
// open handle is the closest equivalent of unlinking.
#[cfg(not(unix))]
fn unlink(name: &str) -> Result<bool> {
    match ShmemConf::new().os_id(name).open() {
        Ok(mut shmem) => {
            shmem.set_owner(true);
            Ok(true)
        }
        Err(e) if is_not_found(&e) => Ok(false),
        Err(source) => Err(LatticeError::Open {
            name: name.to_string(),
            source,
        }),
    }
}
