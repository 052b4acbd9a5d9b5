//! Attaching the engine owned coverage segment.

use super::CoverError;
use nix::errno::Errno;
use nix::libc;
use shared_memory::{Shmem, ShmemConf};
use std::fs;
use std::path::Path;
use std::ptr::{self, NonNull};

/// File in the checkpoint directory holding the segment identifier.
pub const SHM_ID_FILE: &str = "shm_id";
/// Environment variable the fuzzing engine publishes the segment identifier in.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

enum Backing {
    /// System V segment, the engine's default.
    SysV(NonNull<u8>),
    /// Named POSIX segment.
    Posix(Shmem),
    /// Process private counters, nothing is shared.
    Local(Box<[u8]>),
}

/// Counter array the target logs edges into.
pub struct CoverageMap {
    backing: Backing,
    len: usize,
}

// Only raw counters live behind the pointer, the segment stays mapped until drop.
unsafe impl Send for CoverageMap {}

impl CoverageMap {
    /// Attach the segment named by `id`: numeric ids are System V segments,
    /// anything else is opened as a POSIX segment.
    pub fn attach(id: &str, size: usize) -> Result<Self, CoverError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(CoverError::EmptyId);
        }
        match id.parse::<i32>() {
            Ok(shm_id) => Self::attach_sysv(shm_id, size),
            Err(_) => Self::attach_posix(id, size),
        }
    }

    /// Attach the segment recorded in `<dir>/shm_id`.
    pub fn attach_from(dir: &Path, size: usize) -> Result<Self, CoverError> {
        let id = read_shm_id(dir)?;
        Self::attach(&id, size)
    }

    /// Zeroed counters private to this process.
    pub fn local(size: usize) -> Self {
        Self {
            backing: Backing::Local(vec![0; size].into_boxed_slice()),
            len: size,
        }
    }

    fn attach_sysv(shm_id: i32, size: usize) -> Result<Self, CoverError> {
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut ds) } == -1 {
            return Err(CoverError::SysV {
                id: shm_id,
                err: Errno::last(),
            });
        }
        let len = ds.shm_segsz as usize;
        if len < size {
            return Err(CoverError::TooSmall {
                id: shm_id.to_string(),
                len,
                need: size,
            });
        }

        let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(CoverError::SysV {
                id: shm_id,
                err: Errno::last(),
            });
        }
        let addr = NonNull::new(addr as *mut u8).ok_or(CoverError::SysV {
            id: shm_id,
            err: Errno::EFAULT,
        })?;
        Ok(Self {
            backing: Backing::SysV(addr),
            len,
        })
    }

    fn attach_posix(os_id: &str, size: usize) -> Result<Self, CoverError> {
        let shm = ShmemConf::new()
            .os_id(os_id)
            .open()
            .map_err(|err| CoverError::Posix {
                id: os_id.to_string(),
                err,
            })?;
        let len = shm.len();
        if len < size {
            return Err(CoverError::TooSmall {
                id: os_id.to_string(),
                len,
                need: size,
            });
        }
        Ok(Self {
            backing: Backing::Posix(shm),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_shared(&self) -> bool {
        !matches!(self.backing, Backing::Local(_))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::SysV(addr) => addr.as_ptr(),
            Backing::Posix(shm) => shm.as_ptr(),
            Backing::Local(buf) => buf.as_ptr() as *mut u8,
        }
    }

    /// Copy of the counters, torn reads are possible while a target is logging.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        unsafe { ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), self.len) };
        out
    }

    pub fn clear(&mut self) {
        unsafe { ptr::write_bytes(self.as_ptr(), 0, self.len) };
    }
}

impl Drop for CoverageMap {
    fn drop(&mut self) {
        if let Backing::SysV(addr) = self.backing {
            unsafe { libc::shmdt(addr.as_ptr() as *const libc::c_void) };
        }
    }
}

/// Publish the segment identifier for the target to pick up after restore.
pub fn write_shm_id(dir: &Path, id: &str) -> Result<(), CoverError> {
    fs::write(dir.join(SHM_ID_FILE), id.trim())?;
    Ok(())
}

pub fn read_shm_id(dir: &Path) -> Result<String, CoverError> {
    let id = fs::read_to_string(dir.join(SHM_ID_FILE))?;
    Ok(id.trim().to_string())
}
