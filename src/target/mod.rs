//! Checkpoint/restore lifecycle running inside the target.
//!
//! The first input request captures the process. Every later run of the
//! target is a restored copy of that image: it reattaches its I/O and the
//! coverage map, rolls external files back, hides the time it spent frozen and
//! reports its PID to the coordinator before serving the input.

use crate::clock::Clock;
use crate::coord::PID_PIPE_WRITE_FD;
use crate::cover::{CoverError, CoverageLogger, CoverageMap, MAP_SIZE};
use nix::unistd::{getpid, setsid};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod criu;
pub mod files;
pub mod handoff;
pub mod io;

use self::criu::{CheckpointBackend, DumpOutcome, DumpRequest, DUMP_LOG};
use self::files::ExternalFiles;
use self::handoff::Handoff;
use self::io::{close_stdio, InputStream, IterationFiles, CONSOLE};

/// Exit code of a target that cannot tell the coordinator its PID.
pub const HANDOFF_FAILURE: i32 = 5;

/// The engine executing target code, paused around state capture.
pub trait ExecutionEngine {
    fn stop(&mut self);
    fn resume(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No input requested yet.
    Fresh,
    /// Capturing the image.
    Checkpointing,
    /// Running from a restored image, reattaching resources.
    Restored,
    /// Serving inputs with coverage armed.
    Executing,
    /// Replaying inputs from the console, nothing captured.
    Validating,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("sync dir '{0}' is not a directory")]
    SyncDir(PathBuf),
    #[error("checkpoint dir '{0}' is not a directory")]
    CheckpointDir(PathBuf),
    #[error("instrumentation ratio {ratio} exceeds map size {map_size}")]
    InstRatio { ratio: usize, map_size: usize },
    #[error("coverage: {0}")]
    Cover(#[from] CoverError),
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Engine's per-iteration directory, holds `.cur_input`, `stdout` and `stderr`.
    pub sync_dir: PathBuf,
    /// Images, saved external files, `shm_id` and `parent_pid`.
    pub checkpoint_dir: PathBuf,
    pub external_files: ExternalFiles,
    /// Replay inputs from the console without checkpointing.
    pub validating: bool,
    pub map_size: usize,
    /// Locations scrambling to this value or above are not instrumented.
    pub inst_ratio: usize,
    pub console: PathBuf,
    /// Start a new session and swap fds 0, 1 and 2 around the checkpoint.
    pub detach_io: bool,
    /// Write end of the coordinator's PID pipe, as numbered in the coordinator.
    pub handoff_fd: RawFd,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            sync_dir: PathBuf::from("."),
            checkpoint_dir: PathBuf::from("./checkpoint"),
            external_files: ExternalFiles::default(),
            validating: false,
            map_size: MAP_SIZE,
            inst_ratio: MAP_SIZE,
            console: PathBuf::from(CONSOLE),
            detach_io: true,
            handoff_fd: PID_PIPE_WRITE_FD,
        }
    }
}

impl TargetConfig {
    pub fn check(&self) -> Result<(), TargetError> {
        if !self.map_size.is_power_of_two() {
            return Err(CoverError::BadMapSize(self.map_size).into());
        }
        if self.inst_ratio > self.map_size {
            return Err(TargetError::InstRatio {
                ratio: self.inst_ratio,
                map_size: self.map_size,
            });
        }
        if self.validating {
            return Ok(());
        }
        if !self.sync_dir.is_dir() {
            return Err(TargetError::SyncDir(self.sync_dir.clone()));
        }
        if !self.checkpoint_dir.is_dir() {
            return Err(TargetError::CheckpointDir(self.checkpoint_dir.clone()));
        }
        Ok(())
    }
}

pub struct Lifecycle<E, B> {
    config: TargetConfig,
    engine: E,
    backend: B,
    stage: Stage,
    clock: Arc<Clock>,
    coverage: Arc<CoverageLogger>,
    input: InputStream,
    handoff: Handoff,
    checkpoint_done: bool,
    console_redirected: bool,
}

impl<E: ExecutionEngine, B: CheckpointBackend> Lifecycle<E, B> {
    pub fn new(config: TargetConfig, engine: E, backend: B) -> Result<Self, TargetError> {
        config.check()?;
        let coverage = CoverageLogger::new(config.map_size, config.inst_ratio)?;
        let handoff = Handoff::new(&config.checkpoint_dir, config.handoff_fd);
        Ok(Self {
            config,
            engine,
            backend,
            stage: Stage::Fresh,
            clock: Arc::new(Clock::new()),
            coverage: Arc::new(coverage),
            input: InputStream::stdin(),
            handoff,
            checkpoint_done: false,
            console_redirected: false,
        })
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn coverage(&self) -> &Arc<CoverageLogger> {
        &self.coverage
    }

    pub fn checkpoint_done(&self) -> bool {
        self.checkpoint_done
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Fill `dest` with the next fuzz input, exactly `dest.len()` bytes with a
    /// zero padded tail. Captures the process on the first call.
    pub fn request_input(&mut self, dest: &mut [u8]) -> usize {
        self.checkpoint();
        if self.config.validating && !self.console_redirected {
            self.redirect_console();
        }
        match self.input.fill(dest) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("input read failed, serving zeros: {}", e);
                0
            }
        }
    }

    /// Capture the process once; later calls do nothing.
    ///
    /// Returns in a restored copy, or in the original when no image could be
    /// written. A suspended original is discarded here.
    pub fn checkpoint(&mut self) {
        if self.checkpoint_done {
            return;
        }
        if self.config.validating {
            self.checkpoint_done = true;
            self.stage = Stage::Validating;
            return;
        }

        self.stage = Stage::Checkpointing;
        match self.capture() {
            DumpOutcome::Suspended => self.discard(),
            DumpOutcome::Resumed => self.restore(true),
            DumpOutcome::Failed(e) => {
                log::error!("checkpoint failed, running without an image: {}", e);
                self.restore(false);
            }
        }
    }

    fn capture(&mut self) -> DumpOutcome {
        self.engine.stop();
        self.clock.mark_checkpoint();
        for e in self
            .config
            .external_files
            .save_into(&self.config.checkpoint_dir)
        {
            log::error!("save external file: {}", e);
        }
        if self.config.detach_io {
            // a fresh session keeps restored copies off the original's terminal.
            let _ = setsid();
            close_stdio();
        }
        self.checkpoint_done = true;

        let req = DumpRequest {
            pid: getpid(),
            images_dir: &self.config.checkpoint_dir,
            log_file: DUMP_LOG,
        };
        self.backend.dump(&req)
    }

    /// Bring a copy back up after capture. Only a restored copy reports to the
    /// coordinator, nobody waits for an original whose dump failed.
    fn restore(&mut self, restored: bool) {
        self.stage = Stage::Restored;
        self.reopen_io();
        self.attach_coverage();
        for e in self
            .config
            .external_files
            .restore_from(&self.config.checkpoint_dir)
        {
            log::error!("restore external file: {}", e);
        }
        self.clock.mark_restore();
        self.engine.resume();
        if restored {
            self.notify();
        }
        self.stage = Stage::Executing;
    }

    /// End the original process after a successful capture.
    pub fn discard(&mut self) -> ! {
        log::info!("image captured, discarding original process {}", getpid());
        std::process::exit(0)
    }

    fn reopen_io(&mut self) {
        let files = match IterationFiles::open(&self.config.sync_dir) {
            Ok(files) => files,
            Err(e) => {
                log::error!("open iteration files in '{}': {}", self.config.sync_dir.display(), e);
                return;
            }
        };
        if !self.config.detach_io {
            self.input = InputStream::new(files.input);
            return;
        }
        match files.into_stdio() {
            Ok(stdin) => self.input = InputStream::new(stdin),
            Err(e) => log::error!("rebind stdio: {}", e),
        }
    }

    fn attach_coverage(&mut self) {
        match CoverageMap::attach_from(&self.config.checkpoint_dir, self.config.map_size) {
            Ok(map) => {
                if let Err(e) = self.coverage.arm(map) {
                    log::error!("arm coverage map: {}", e);
                }
            }
            Err(e) => log::error!("attach coverage map: {}", e),
        }
    }

    fn notify(&mut self) {
        match self.handoff.send() {
            Ok(true) => log::debug!("reported pid {} to coordinator", getpid()),
            Ok(false) => (),
            Err(e) => exits!(HANDOFF_FAILURE, "failed to report pid to coordinator: {}", e),
        }
    }

    fn redirect_console(&mut self) {
        self.console_redirected = true;
        match InputStream::open(&self.config.console) {
            Ok(input) => self.input = input,
            Err(e) => log::warn!("open console '{}': {}", self.config.console.display(), e),
        }
    }

    /// Count an executed location; nothing is recorded before the first restore.
    #[inline]
    pub fn log(&self, loc: u64) {
        self.coverage.log(loc)
    }
}

#[cfg(test)]
mod tests {
    use super::criu::CheckpointError;
    use super::handoff::write_parent_pid;
    use super::io::{CUR_INPUT, STDERR_FILE, STDOUT_FILE};
    use super::*;
    use crate::cover::shm::write_shm_id;
    use nix::fcntl::{fcntl, FcntlArg};
    use nix::libc;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{close, fork, pipe, read, write, ForkResult};
    use std::panic::{self, AssertUnwindSafe};
    use shared_memory::{Shmem, ShmemConf};
    use std::fs::{self, File};
    use std::io::Read;
    use std::os::unix::io::FromRawFd;
    use std::path::Path;
    use std::sync::Mutex;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    type Events = Arc<Mutex<Vec<&'static str>>>;

    struct Engine(Events);

    impl ExecutionEngine for Engine {
        fn stop(&mut self) {
            self.0.lock().unwrap().push("stop");
        }

        fn resume(&mut self) {
            self.0.lock().unwrap().push("resume");
        }
    }

    /// Pretends to be restored right away, or fails, after running `during`.
    struct Backend {
        events: Events,
        fail: bool,
        dumps: usize,
        during: Box<dyn FnMut(&Path)>,
    }

    impl CheckpointBackend for Backend {
        fn dump(&mut self, req: &DumpRequest<'_>) -> DumpOutcome {
            self.events.lock().unwrap().push("dump");
            self.dumps += 1;
            assert_eq!(req.pid, getpid());
            assert_eq!(req.log_file, DUMP_LOG);
            (self.during)(req.images_dir);
            if self.fail {
                DumpOutcome::Failed(CheckpointError::Criu(1))
            } else {
                DumpOutcome::Resumed
            }
        }
    }

    struct Fixture {
        sync: TempDir,
        ckpt: TempDir,
        _shm: Shmem,
        pid_rx: File,
        pid_tx: RawFd,
        events: Events,
    }

    impl Fixture {
        fn new(input: &[u8]) -> Self {
            let sync = tempdir().unwrap();
            let ckpt = tempdir().unwrap();
            fs::write(sync.path().join(CUR_INPUT), input).unwrap();
            let shm = ShmemConf::new().size(MAP_SIZE).create().unwrap();
            write_shm_id(ckpt.path(), shm.get_os_id()).unwrap();
            write_parent_pid(ckpt.path(), getpid()).unwrap();
            let (rx, tx) = pipe().unwrap();
            Self {
                sync,
                ckpt,
                _shm: shm,
                pid_rx: unsafe { File::from_raw_fd(rx) },
                pid_tx: tx,
                events: Events::default(),
            }
        }

        fn config(&self) -> TargetConfig {
            TargetConfig {
                sync_dir: self.sync.path().to_path_buf(),
                checkpoint_dir: self.ckpt.path().to_path_buf(),
                detach_io: false,
                handoff_fd: self.pid_tx,
                ..Default::default()
            }
        }

        fn lifecycle(&self, config: TargetConfig, fail: bool) -> Lifecycle<Engine, Backend> {
            self.lifecycle_with(config, fail, Box::new(|_: &Path| ()))
        }

        fn lifecycle_with(
            &self,
            config: TargetConfig,
            fail: bool,
            during: Box<dyn FnMut(&Path)>,
        ) -> Lifecycle<Engine, Backend> {
            let backend = Backend {
                events: self.events.clone(),
                fail,
                dumps: 0,
                during,
            };
            Lifecycle::new(config, Engine(self.events.clone()), backend).unwrap()
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        fn reported_pids(self) -> Vec<u8> {
            close(self.pid_tx).unwrap();
            let mut got = Vec::new();
            (&self.pid_rx).read_to_end(&mut got).unwrap();
            got
        }
    }

    #[test]
    fn short_input_is_padded_after_restore() {
        let fx = Fixture::new(&[1, 2, 3, 4]);
        let mut target = fx.lifecycle(fx.config(), false);
        assert_eq!(target.stage(), Stage::Fresh);
        assert!(!target.coverage().is_armed());

        let mut dest = [0xee_u8; 8];
        assert_eq!(target.request_input(&mut dest), 4);
        assert_eq!(dest, [1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(target.stage(), Stage::Executing);
        assert!(target.checkpoint_done());
        assert!(target.coverage().is_armed());
        assert_eq!(fx.events(), vec!["stop", "dump", "resume"]);
        assert!(target.clock().restore_time() >= target.clock().checkpoint_time());

        drop(target);
        assert_eq!(fx.reported_pids(), getpid().as_raw().to_ne_bytes());
    }

    /// Body of a forked child driving the detached stdio path. Returns its exit code.
    fn detached_run(fx: &Fixture) -> i32 {
        let config = TargetConfig {
            detach_io: true,
            ..fx.config()
        };
        let mut target = fx.lifecycle(config, false);
        let mut dest = [0_u8; 4];
        if target.request_input(&mut dest) != 4 || dest != [1, 2, 3, 4] {
            return 10;
        }

        let open = (0..=2)
            .filter(|&fd| fcntl(fd, FcntlArg::F_GETFD).is_ok())
            .fold(0, |bits, fd| bits | 1 << fd);
        if open != 0b111 {
            return 20 + open;
        }
        // the rest of the queued input is on fd 0.
        let mut rest = [0_u8; 8];
        if read(0, &mut rest) != Ok(4) || rest[..4] != [5, 6, 7, 8] {
            return 30;
        }
        if write(1, b"out\n") != Ok(4) || write(2, b"err\n") != Ok(4) {
            return 40;
        }
        // still usable through the lifecycle after the raw reads.
        if target.request_input(&mut dest) != 0 {
            return 50;
        }
        0
    }

    #[test]
    fn restored_stdio_points_at_sync_files() {
        let fx = Fixture::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        fs::write(fx.sync.path().join(STDOUT_FILE), b"old\n").unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = panic::catch_unwind(AssertUnwindSafe(|| detached_run(&fx))).unwrap_or(99);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
        assert_eq!(fs::read(fx.sync.path().join(STDOUT_FILE)).unwrap(), b"old\nout\n");
        assert_eq!(fs::read(fx.sync.path().join(STDERR_FILE)).unwrap(), b"err\n");
        // the child reported itself through the inherited pipe.
        assert_eq!(fx.reported_pids().len(), 4);
    }

    #[test]
    fn second_checkpoint_is_a_noop() {
        let fx = Fixture::new(&[7; 16]);
        let mut target = fx.lifecycle(fx.config(), false);
        let mut dest = [0_u8; 8];
        target.request_input(&mut dest);
        target.checkpoint();
        target.request_input(&mut dest);
        assert_eq!(dest, [7; 8]);
        assert_eq!(target.backend().dumps, 1);
        assert_eq!(fx.events(), vec!["stop", "dump", "resume"]);

        // the input is drained, further requests are all zeros.
        assert_eq!(target.request_input(&mut dest), 0);
        assert_eq!(dest, [0; 8]);

        drop(target);
        // one pid, however often the lifecycle is driven.
        assert_eq!(fx.reported_pids().len(), 4);
    }

    #[test]
    fn frozen_time_is_hidden() {
        let fx = Fixture::new(&[]);
        let during = Box::new(|_: &Path| sleep(Duration::from_millis(30)));
        let mut target = fx.lifecycle_with(fx.config(), false, during);
        target.request_input(&mut [0_u8; 1]);
        assert!(target.clock().offset() >= Duration::from_millis(30).as_nanos() as i64);
    }

    #[test]
    fn external_files_roll_back() {
        let fx = Fixture::new(&[]);
        let work = tempdir().unwrap();
        let disk = work.path().join("disk.img");
        fs::write(&disk, b"pristine").unwrap();

        let mut config = fx.config();
        config.external_files = ExternalFiles::new(vec![disk.clone()]);
        let dirty = disk.clone();
        let during = Box::new(move |images: &Path| {
            // saved before the capture starts.
            assert_eq!(fs::read(images.join("disk.img")).unwrap(), b"pristine");
            fs::write(&dirty, b"dirty").unwrap();
        });
        let mut target = fx.lifecycle_with(config, false, during);
        target.request_input(&mut [0_u8; 4]);
        assert_eq!(fs::read(&disk).unwrap(), b"pristine");
    }

    #[test]
    fn coverage_starts_at_restore() {
        let fx = Fixture::new(&[]);
        let mut target = fx.lifecycle(fx.config(), false);
        target.log(0x2000);
        target.request_input(&mut [0_u8; 4]);
        let map = target.coverage().with_map(|m| m.snapshot()).unwrap();
        assert!(map.iter().all(|&c| c == 0));
        crate::cover::reset_thread();
        target.log(0x1000);
        let map = target.coverage().with_map(|m| m.snapshot()).unwrap();
        assert_eq!(map[crate::cover::scramble(0x1000, MAP_SIZE)], 1);
    }

    #[test]
    fn failed_dump_keeps_running_unreported() {
        let fx = Fixture::new(&[5, 6]);
        let mut target = fx.lifecycle(fx.config(), true);
        let mut dest = [0xee_u8; 3];
        assert_eq!(target.request_input(&mut dest), 2);
        assert_eq!(dest, [5, 6, 0]);
        assert_eq!(target.stage(), Stage::Executing);
        assert!(target.checkpoint_done());
        drop(target);
        assert!(fx.reported_pids().is_empty());
    }

    #[test]
    fn validation_reads_the_console_once() {
        let fx = Fixture::new(&[1, 1, 1]);
        let console = fx.sync.path().join("console");
        fs::write(&console, [9, 8, 7, 6]).unwrap();
        let mut config = fx.config();
        config.validating = true;
        config.console = console.clone();
        let mut target = fx.lifecycle(config, false);

        let mut dest = [0_u8; 2];
        target.request_input(&mut dest);
        assert_eq!(dest, [9, 8]);
        // a replaced console must not be reopened.
        let next = fx.sync.path().join("console.next");
        fs::write(&next, [0xff; 4]).unwrap();
        fs::rename(&next, &console).unwrap();
        target.request_input(&mut dest);
        assert_eq!(dest, [7, 6]);

        assert_eq!(target.stage(), Stage::Validating);
        assert!(target.checkpoint_done());
        assert!(!target.coverage().is_armed());
        assert_eq!(target.backend().dumps, 0);
        assert!(fx.events().is_empty());
        drop(target);
        assert!(fx.reported_pids().is_empty());
    }

    #[test]
    fn config_checks() {
        let fx = Fixture::new(&[]);
        assert!(fx.config().check().is_ok());
        let bad = TargetConfig {
            inst_ratio: MAP_SIZE + 1,
            ..fx.config()
        };
        assert!(matches!(bad.check(), Err(TargetError::InstRatio { .. })));
        let bad = TargetConfig {
            map_size: 1000,
            ..fx.config()
        };
        assert!(matches!(bad.check(), Err(TargetError::Cover(_))));
        let bad = TargetConfig {
            sync_dir: fx.sync.path().join("missing"),
            ..fx.config()
        };
        assert!(matches!(bad.check(), Err(TargetError::SyncDir(_))));
        let ok = TargetConfig {
            validating: true,
            ..bad
        };
        assert!(ok.check().is_ok());
    }
}
