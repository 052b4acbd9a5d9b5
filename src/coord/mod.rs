//! Forkserver side: answers the fuzzing engine's requests with restored copies
//! of the checkpointed target instead of forked children.

use crate::cover::shm::{write_shm_id, SHM_ENV_VAR};
use crate::cover::CoverError;
use crate::target::handoff::write_parent_pid;
use crate::utils::{read_exact, write_all};
use iota::iota;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{close, dup2, getpid, pipe, Pid};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use thiserror::Error;

pub mod restore;

pub use restore::CriuSpawner;

// Descriptors shared with the engine and the restored target.
iota! {
    pub const CONTROL_FD: RawFd = 198 + (iota);  // engine -> coordinator, go-ahead
    , STATUS_FD                                   // coordinator -> engine, alive token, pid and status
    , PID_PIPE_WRITE_FD                           // restored target -> coordinator
    , PID_PIPE_READ_FD
}

/// Sent once on the status channel before the first go-ahead.
pub const ALIVE: &[u8; 4] = b"here";

pub const EXIT_NO_GO_AHEAD: i32 = 2;
pub const EXIT_FATAL: i32 = 5;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("no go-ahead from engine: {0}")]
    GoAhead(io::Error),
    #[error("report to engine: {0}")]
    Report(io::Error),
    #[error("read pid of restored child: {0}")]
    ChildPid(io::Error),
    #[error("fork restore helper: {0}")]
    Restore(nix::Error),
    #[error("attach to {pid}: {err}")]
    Attach { pid: Pid, err: nix::Error },
    #[error("wait for {pid}: {err}")]
    Wait { pid: Pid, err: nix::Error },
    #[error("pid pipe: {0}")]
    Pipe(nix::Error),
    #[error("'{0}' is not a directory")]
    NotADir(PathBuf),
    #[error("publish parent pid: {0}")]
    ParentPid(io::Error),
    #[error("publish shm id: {0}")]
    ShmId(#[from] CoverError),
}

impl CoordError {
    /// Process exit code the engine expects for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoordError::GoAhead(_) => EXIT_NO_GO_AHEAD,
            _ => EXIT_FATAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub sync_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Path to the criu binary.
    pub criu: PathBuf,
    /// Restore log name, relative to the checkpoint dir.
    pub restore_log: String,
    pub log_level: u8,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            sync_dir: PathBuf::from("."),
            checkpoint_dir: PathBuf::from("./checkpoint"),
            criu: PathBuf::from("criu"),
            restore_log: "restore.log".to_string(),
            log_level: 4,
        }
    }
}

impl CoordConfig {
    pub fn check(&self) -> Result<(), CoordError> {
        for dir in [&self.sync_dir, &self.checkpoint_dir].iter() {
            if !dir.is_dir() {
                return Err(CoordError::NotADir(dir.to_path_buf()));
            }
        }
        Ok(())
    }
}

/// Leave what restored targets need in the checkpoint dir: our PID and the coverage segment id.
pub fn publish(config: &CoordConfig, shm_id: Option<&str>) -> Result<(), CoordError> {
    write_parent_pid(&config.checkpoint_dir, getpid()).map_err(CoordError::ParentPid)?;
    match shm_id {
        Some(id) => write_shm_id(&config.checkpoint_dir, id)?,
        None => log::warn!("{} is not set, targets will run without coverage", SHM_ENV_VAR),
    }
    Ok(())
}

/// Create the PID pipe on its fixed descriptors and return the read end.
pub fn open_pid_pipe() -> Result<File, CoordError> {
    let (rx, tx) = pipe().map_err(CoordError::Pipe)?;
    place_pid_pipe(rx, tx)
}

/// Move both pipe ends onto their fixed descriptors, wherever they were created.
fn place_pid_pipe(rx: RawFd, tx: RawFd) -> Result<File, CoordError> {
    // clear of the fixed range first, so placing one end cannot clobber the other.
    let rx = lift(rx).map_err(CoordError::Pipe)?;
    let tx = lift(tx).map_err(CoordError::Pipe)?;
    for &(fd, fixed) in [(rx, PID_PIPE_READ_FD), (tx, PID_PIPE_WRITE_FD)].iter() {
        dup2(fd, fixed).map_err(CoordError::Pipe)?;
        close(fd).map_err(CoordError::Pipe)?;
    }
    Ok(unsafe { File::from_raw_fd(PID_PIPE_READ_FD) })
}

fn lift(fd: RawFd) -> nix::Result<RawFd> {
    let high = fcntl(fd, FcntlArg::F_DUPFD(PID_PIPE_READ_FD + 1))?;
    close(fd)?;
    Ok(high)
}

/// Startup of the coordinator binary.
pub fn setup(config: &CoordConfig) -> Result<File, CoordError> {
    let shm_id = std::env::var(SHM_ENV_VAR).ok();
    publish(config, shm_id.as_deref())?;
    open_pid_pipe()
}

/// Produces and supervises one restored child per iteration.
pub trait Spawn {
    /// Bring up a child from the image, returns once its PID is known.
    fn restore(&mut self) -> Result<Pid, CoordError>;
    fn attach(&mut self, pid: Pid) -> Result<(), CoordError>;
    /// Block until `pid` terminates, returns its exit code or terminating signal.
    fn wait_exit(&mut self, pid: Pid) -> Result<i32, CoordError>;
    /// Collect finished helpers without blocking.
    fn reap(&mut self);
}

pub struct Coordinator<C, S, P> {
    control: C,
    status: S,
    spawner: P,
    iterations: u64,
}

impl<C: Read, S: Write, P: Spawn> Coordinator<C, S, P> {
    pub fn new(control: C, status: S, spawner: P) -> Self {
        Self {
            control,
            status,
            spawner,
            iterations: 0,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn spawner(&self) -> &P {
        &self.spawner
    }

    /// Tell the engine we are up.
    pub fn handshake(&mut self) -> Result<(), CoordError> {
        self.status.write_all(ALIVE).map_err(CoordError::Report)?;
        self.status.flush().map_err(CoordError::Report)
    }

    /// Serve one go-ahead: exactly one PID message, then exactly one status message.
    pub fn run_once(&mut self) -> Result<i32, CoordError> {
        read_exact::<u32, _>(&mut self.control).map_err(CoordError::GoAhead)?;
        log::debug!("iteration {}: restoring", self.iterations);

        let pid = self.spawner.restore()?;
        self.spawner.attach(pid)?;
        self.report(pid.as_raw())?;
        log::debug!("iteration {}: child {} running", self.iterations, pid);

        let status = self.spawner.wait_exit(pid)?;
        self.report(status)?;
        log::debug!("iteration {}: child {} exited with {}", self.iterations, pid, status);

        self.spawner.reap();
        self.iterations += 1;
        Ok(status)
    }

    /// Handshake, then serve go-aheads until something fails.
    pub fn run(&mut self) -> CoordError {
        if let Err(e) = self.handshake() {
            return e;
        }
        loop {
            if let Err(e) = self.run_once() {
                return e;
            }
        }
    }

    fn report(&mut self, word: i32) -> Result<(), CoordError> {
        write_all(&mut self.status, &word).map_err(CoordError::Report)?;
        self.status.flush().map_err(CoordError::Report)
    }
}
