//! Restoring and supervising children with CRIU and ptrace.

use super::{CoordConfig, CoordError, Spawn};
use crate::utils::read_exact;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::path::Path;
use std::process::{self, Command, Stdio};

/// Restores children through `criu restore`, attaches to them with ptrace.
pub struct CriuSpawner {
    config: CoordConfig,
    /// Read end of the PID pipe the restored target reports on.
    pid_pipe: File,
    /// Restore helpers not collected yet.
    helpers: FxHashSet<Pid>,
}

impl CriuSpawner {
    pub fn new(config: CoordConfig, pid_pipe: File) -> Self {
        Self {
            config,
            pid_pipe,
            helpers: FxHashSet::default(),
        }
    }

    pub fn helpers(&self) -> usize {
        self.helpers.len()
    }

    /// `criu restore` arguments.
    pub fn restore_args(&self) -> Vec<String> {
        vec![
            "restore".to_string(),
            "-d".to_string(),
            "-S".to_string(),
            "-D".to_string(),
            self.config.checkpoint_dir.display().to_string(),
            format!("-v{}", self.config.log_level),
            "-o".to_string(),
            self.config.restore_log.clone(),
        ]
    }

    fn spawn_helper(&mut self) -> Result<Pid, CoordError> {
        let args = self.restore_args();
        match unsafe { fork() } {
            Ok(ForkResult::Child) => restore_until_success(&self.config.criu, &args),
            Ok(ForkResult::Parent { child }) => {
                self.helpers.insert(child);
                Ok(child)
            }
            Err(e) => Err(CoordError::Restore(e)),
        }
    }
}

impl Spawn for CriuSpawner {
    fn restore(&mut self) -> Result<Pid, CoordError> {
        let helper = self.spawn_helper()?;
        log::debug!("restore helper {} started", helper);
        let pid = read_exact::<i32, _>(&self.pid_pipe).map_err(CoordError::ChildPid)?;
        Ok(Pid::from_raw(pid))
    }

    fn attach(&mut self, pid: Pid) -> Result<(), CoordError> {
        ptrace::seize(pid, ptrace::Options::empty()).map_err(|err| CoordError::Attach { pid, err })
    }

    fn wait_exit(&mut self, pid: Pid) -> Result<i32, CoordError> {
        wait_for_exit(pid)
    }

    fn reap(&mut self) {
        self.helpers.retain(|&pid| {
            matches!(
                waitpid(pid, Some(WaitPidFlag::WNOHANG)),
                Ok(WaitStatus::StillAlive)
            )
        });
    }
}

/// Body of the restore helper. Restoring races with the kernel now and then,
/// so keep trying until criu succeeds.
fn restore_until_success(criu: &Path, args: &[String]) -> ! {
    let mut attempts = 0_u64;
    loop {
        attempts += 1;
        match Command::new(criu).args(args).stdin(Stdio::null()).status() {
            Ok(status) if status.success() => process::exit(0),
            Ok(status) => log::debug!("restore attempt {} failed: {}", attempts, status),
            Err(e) => log::debug!("restore attempt {} failed: {}", attempts, e),
        }
        reap_strays();
    }
}

/// Collect every finished child of the calling process without blocking.
fn reap_strays() {
    while let Ok(status) = waitpid(None, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
        if status == WaitStatus::StillAlive {
            break;
        }
    }
}

/// Wait until `pid` terminates. Returns the exit code, or the signal number if
/// it was killed. Ptrace stops on the way are continued, delivering the
/// pending signal so that a crash still terminates the child.
pub fn wait_for_exit(pid: Pid) -> Result<i32, CoordError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(sig as i32),
            Ok(WaitStatus::Stopped(_, sig)) => {
                let _ = ptrace::cont(pid, sig);
            }
            Ok(WaitStatus::PtraceEvent(..)) | Ok(WaitStatus::PtraceSyscall(_)) => {
                let _ = ptrace::cont(pid, None::<Signal>);
            }
            Ok(_) => (),
            Err(Errno::EINTR) => (),
            Err(err) => return Err(CoordError::Wait { pid, err }),
        }
    }
}
