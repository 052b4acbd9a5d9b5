//! Telling the coordinator which process it restored.
//!
//! `criu restore -d` detaches the restored tree, so the coordinator cannot
//! learn the child's PID from the restore helper. The child instead writes
//! its own PID into the coordinator's PID pipe, reached through `/proc`.

use crate::utils::{read_exact, write_all};
use nix::unistd::{getpid, Pid};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File in the checkpoint directory holding the coordinator's `pid_t`.
pub const PARENT_PID_FILE: &str = "parent_pid";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("read coordinator pid from '{path}': {err}")]
    ParentPid { path: PathBuf, err: io::Error },
    #[error("open pid channel '{path}': {err}")]
    Channel { path: PathBuf, err: io::Error },
    #[error("send pid: {0}")]
    Send(io::Error),
}

pub fn write_parent_pid(dir: &Path, pid: Pid) -> io::Result<()> {
    let f = File::create(dir.join(PARENT_PID_FILE))?;
    write_all(f, &pid.as_raw())
}

pub fn read_parent_pid(dir: &Path) -> Result<Pid, HandoffError> {
    let path = dir.join(PARENT_PID_FILE);
    File::open(&path)
        .and_then(read_exact::<i32, _>)
        .map(Pid::from_raw)
        .map_err(|err| HandoffError::ParentPid { path, err })
}

/// Path of descriptor `fd` of process `pid`.
pub fn channel_path(pid: Pid, fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/{}/fd/{}", pid, fd))
}

/// One-shot PID notification.
///
/// The restore path can be entered more than once, the coordinator must see
/// exactly one PID per restored child.
#[derive(Debug)]
pub struct Handoff {
    dir: PathBuf,
    fd: RawFd,
    sent: bool,
}

impl Handoff {
    /// `fd` is the write end of the PID pipe in the coordinator.
    pub fn new(dir: &Path, fd: RawFd) -> Self {
        Self {
            dir: dir.to_path_buf(),
            fd,
            sent: false,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Send our PID unless that already happened. Returns whether anything was sent.
    pub fn send(&mut self) -> Result<bool, HandoffError> {
        if self.sent {
            return Ok(false);
        }
        let ppid = read_parent_pid(&self.dir)?;
        let path = channel_path(ppid, self.fd);
        let channel = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|err| HandoffError::Channel { path, err })?;
        write_all(channel, &getpid().as_raw()).map_err(HandoffError::Send)?;
        self.sent = true;
        Ok(true)
    }
}
