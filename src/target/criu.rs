//! Capturing the process image.
//!
//! A successful dump does not return into the dumped process: CRIU kills the
//! original, and execution continues in whichever copy gets restored later.
//! [`DumpOutcome`] makes that explicit instead of pretending the call returns.

use nix::libc;
use nix::sys::wait::waitpid;
use nix::unistd::{execv, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Log file CRIU writes into the images directory while dumping.
pub const DUMP_LOG: &str = "dump.log";
/// Exit code of the dump helper, published once CRIU is done.
pub const DUMP_STATUS: &str = "dump.status";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("fork dump helper: {0}")]
    Fork(nix::Error),
    #[error("criu dump exited with {0}, see {}", DUMP_LOG)]
    Criu(i32),
    #[error("unreadable dump status '{0}'")]
    BadStatus(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// What to capture and where.
#[derive(Debug, Clone)]
pub struct DumpRequest<'a> {
    /// Root of the process tree to dump, the caller itself.
    pub pid: Pid,
    pub images_dir: &'a Path,
    pub log_file: &'a str,
}

/// Where control continues after asking for a dump.
#[derive(Debug)]
pub enum DumpOutcome {
    /// The image was written and this is the original process, which must be discarded.
    Suspended,
    /// This process was restored from the image.
    Resumed,
    /// No usable image, this is still the original process.
    Failed(CheckpointError),
}

pub trait CheckpointBackend {
    fn dump(&mut self, req: &DumpRequest<'_>) -> DumpOutcome;
}

/// Dumps through the `criu` binary.
///
/// CRIU cannot run inside the tree it dumps, so a detached helper (double
/// fork, own session) runs it and then publishes its exit code in
/// `dump.status`. The dumped process waits for that file: the original only
/// ever sees a failure code since CRIU kills it on success, a restored copy
/// wakes up to find `0`.
#[derive(Debug, Clone)]
pub struct CriuDump {
    pub criu: PathBuf,
    pub log_level: u8,
    pub file_locks: bool,
    pub poll_interval: Duration,
}

impl Default for CriuDump {
    fn default() -> Self {
        Self {
            criu: PathBuf::from("criu"),
            log_level: 4,
            file_locks: true,
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl CheckpointBackend for CriuDump {
    fn dump(&mut self, req: &DumpRequest<'_>) -> DumpOutcome {
        let status = req.images_dir.join(DUMP_STATUS);
        match fs::remove_file(&status) {
            Err(e) if e.kind() != ErrorKind::NotFound => return DumpOutcome::Failed(e.into()),
            _ => (),
        }
        if let Err(e) = self.spawn_helper(req, &status) {
            return DumpOutcome::Failed(e);
        }
        match self.wait_status(&status) {
            Ok(0) => DumpOutcome::Resumed,
            Ok(code) => DumpOutcome::Failed(CheckpointError::Criu(code)),
            Err(e) => DumpOutcome::Failed(e),
        }
    }
}

impl CriuDump {
    pub fn new<P: Into<PathBuf>>(criu: P) -> Self {
        Self {
            criu: criu.into(),
            ..Default::default()
        }
    }

    /// `criu dump` arguments for `req`.
    pub fn dump_args(&self, req: &DumpRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "dump".to_string(),
            "-t".to_string(),
            req.pid.to_string(),
            "-D".to_string(),
            req.images_dir.display().to_string(),
            "-o".to_string(),
            req.log_file.to_string(),
            format!("-v{}", self.log_level),
        ];
        if self.file_locks {
            args.push("--file-locks".to_string());
        }
        args
    }

    fn spawn_helper(&self, req: &DumpRequest<'_>, status: &Path) -> Result<(), CheckpointError> {
        // Build everything before forking, the helper only calls setsid and execv.
        let script = "status=\"$1\"; shift; \"$@\"; echo $? > \"$status.tmp\" && mv \"$status.tmp\" \"$status\"";
        let mut argv = vec![
            cstr("sh".as_bytes())?,
            cstr("-c".as_bytes())?,
            cstr(script.as_bytes())?,
            cstr("sh".as_bytes())?,
            cstr(status.as_os_str().as_bytes())?,
            cstr(self.criu.as_os_str().as_bytes())?,
        ];
        for arg in self.dump_args(req) {
            argv.push(cstr(arg.as_bytes())?);
        }
        let sh = cstr(b"/bin/sh")?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                if let Ok(ForkResult::Child) = unsafe { fork() } {
                    let _ = setsid();
                    let _ = execv(&sh, &argv);
                }
                unsafe { libc::_exit(0) }
            }
            Ok(ForkResult::Parent { child }) => {
                waitpid(child, None).map_err(CheckpointError::Fork)?;
                Ok(())
            }
            Err(e) => Err(CheckpointError::Fork(e)),
        }
    }

    fn wait_status(&self, status: &Path) -> Result<i32, CheckpointError> {
        loop {
            match fs::read_to_string(status) {
                Ok(s) => {
                    return s
                        .trim()
                        .parse::<i32>()
                        .map_err(|_| CheckpointError::BadStatus(s.trim().to_string()))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => sleep(self.poll_interval),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn cstr(bytes: &[u8]) -> Result<CString, CheckpointError> {
    CString::new(bytes).map_err(|e| CheckpointError::Io(io::Error::new(ErrorKind::InvalidInput, e)))
}
