//! C entry points for emulators embedding the target lifecycle.
//!
//! One session per process. The hot paths (`snapsrv_log` and the clock
//! readers) never take a lock, they go through the session's shared handles.

use crate::clock::{raw_monotonic, raw_realtime, Clock};
use crate::cover::CoverageLogger;
use crate::target::criu::CriuDump;
use crate::target::{ExecutionEngine, Lifecycle, TargetConfig};
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Once};

/// Engine hook, called with the opaque pointer passed to `snapsrv_init`.
pub type EngineHook = Option<unsafe extern "C" fn(*mut c_void)>;

struct HookEngine {
    stop: EngineHook,
    resume: EngineHook,
    opaque: *mut c_void,
}

// The opaque pointer is only handed back to the embedder's own hooks.
unsafe impl Send for HookEngine {}

impl ExecutionEngine for HookEngine {
    fn stop(&mut self) {
        if let Some(f) = self.stop {
            unsafe { f(self.opaque) }
        }
    }

    fn resume(&mut self) {
        if let Some(f) = self.resume {
            unsafe { f(self.opaque) }
        }
    }
}

struct Session {
    lifecycle: Mutex<Lifecycle<HookEngine, CriuDump>>,
    clock: Arc<Clock>,
    coverage: Arc<CoverageLogger>,
    checkpoint_done: AtomicBool,
}

static SESSION: AtomicPtr<Session> = AtomicPtr::new(ptr::null_mut());
static INIT: Once = Once::new();

fn session() -> Option<&'static Session> {
    let s = SESSION.load(Ordering::Acquire);
    // set once, never freed.
    unsafe { s.as_ref() }
}

unsafe fn path_arg(p: *const c_char) -> Option<PathBuf> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok().map(PathBuf::from)
}

/// Set up the session. `external_files` is a comma separated list and may be
/// null. `map_size` and `inst_ratio` fall back to the full map when 0.
/// Returns 0 on success, -1 on bad arguments or when already set up.
///
/// # Safety
/// String arguments must be null or valid NUL terminated strings.
#[no_mangle]
pub unsafe extern "C" fn snapsrv_init(
    sync_dir: *const c_char,
    checkpoint_dir: *const c_char,
    external_files: *const c_char,
    validating: c_int,
    map_size: usize,
    inst_ratio: usize,
    stop: EngineHook,
    resume: EngineHook,
    opaque: *mut c_void,
) -> c_int {
    let mut config = TargetConfig {
        validating: validating != 0,
        ..Default::default()
    };
    match (path_arg(sync_dir), path_arg(checkpoint_dir)) {
        (Some(sync), Some(ckpt)) => {
            config.sync_dir = sync;
            config.checkpoint_dir = ckpt;
        }
        _ => {
            log::error!("snapsrv_init: sync and checkpoint dirs are required");
            return -1;
        }
    }
    if map_size != 0 {
        config.map_size = map_size;
        config.inst_ratio = map_size;
    }
    if inst_ratio != 0 {
        config.inst_ratio = inst_ratio;
    }
    if !external_files.is_null() {
        match CStr::from_ptr(external_files).to_str() {
            Ok(list) => config.external_files = list.parse().unwrap_or_default(),
            Err(e) => log::warn!("snapsrv_init: ignoring external files: {}", e),
        }
    }

    // rejected here, a failed setup must not use up the session.
    if let Err(e) = config.check() {
        log::error!("snapsrv_init: {}", e);
        return -1;
    }

    let engine = HookEngine {
        stop,
        resume,
        opaque,
    };
    let mut ret = -1;
    INIT.call_once(|| match Lifecycle::new(config, engine, CriuDump::default()) {
        Ok(lifecycle) => {
            let session = Box::new(Session {
                clock: Arc::clone(lifecycle.clock()),
                coverage: Arc::clone(lifecycle.coverage()),
                lifecycle: Mutex::new(lifecycle),
                checkpoint_done: AtomicBool::new(false),
            });
            SESSION.store(Box::into_raw(session), Ordering::Release);
            ret = 0;
        }
        Err(e) => log::error!("snapsrv_init: {}", e),
    });
    ret
}

/// Fill `dest` with `len` bytes of fuzz input, zero padded. Captures the
/// process on the first call. Returns the number of input bytes, -1 before init.
///
/// # Safety
/// `dest` must be valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn snapsrv_fuzz(dest: *mut u8, len: usize) -> isize {
    let session = match session() {
        Some(s) => s,
        None => return -1,
    };
    let dest: &mut [u8] = if len == 0 || dest.is_null() {
        &mut []
    } else {
        slice::from_raw_parts_mut(dest, len)
    };
    let mut lifecycle = match session.lifecycle.lock() {
        Ok(l) => l,
        Err(poisoned) => poisoned.into_inner(),
    };
    let n = lifecycle.request_input(dest);
    session
        .checkpoint_done
        .store(lifecycle.checkpoint_done(), Ordering::Release);
    n as isize
}

/// Count an executed location.
#[no_mangle]
pub extern "C" fn snapsrv_log(loc: u64) {
    if let Some(s) = session() {
        s.coverage.log(loc);
    }
}

/// 1 once the process has been captured (or validation started), else 0.
#[no_mangle]
pub extern "C" fn snapsrv_checkpoint_done() -> c_int {
    session()
        .map(|s| s.checkpoint_done.load(Ordering::Acquire))
        .unwrap_or(false) as c_int
}

/// Monotonic time in nanoseconds with the frozen interval removed.
#[no_mangle]
pub extern "C" fn snapsrv_clock_monotonic() -> i64 {
    match session() {
        Some(s) => s.clock.monotonic(),
        None => raw_monotonic(),
    }
}

/// Wall clock time in nanoseconds with the frozen interval removed.
#[no_mangle]
pub extern "C" fn snapsrv_clock_realtime() -> i64 {
    match session() {
        Some(s) => s.clock.realtime(),
        None => raw_realtime(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::MAP_SIZE;
    use std::ffi::CString;
    use tempfile::tempdir;

    // One session per process, so the whole surface is checked in one test.
    #[test]
    fn session_setup() {
        assert_eq!(snapsrv_checkpoint_done(), 0);
        assert!(snapsrv_clock_monotonic() > 0);
        let mut buf = [0xaa_u8; 4];
        assert_eq!(unsafe { snapsrv_fuzz(buf.as_mut_ptr(), buf.len()) }, -1);
        assert_eq!(buf, [0xaa; 4]);
        snapsrv_log(0x1000);

        let dir = tempdir().unwrap();
        let path = CString::new(dir.path().to_str().unwrap()).unwrap();
        let files = CString::new("/tmp/a.img,/tmp/b.img").unwrap();
        let init = |sync: *const c_char, map_size: usize, inst_ratio: usize| unsafe {
            snapsrv_init(
                sync,
                path.as_ptr(),
                files.as_ptr(),
                1,
                map_size,
                inst_ratio,
                None,
                None,
                ptr::null_mut(),
            )
        };

        assert_eq!(init(ptr::null(), 0, 0), -1);
        // not a power of two.
        assert_eq!(init(path.as_ptr(), 1000, 0), -1);
        // ratio above the map size.
        assert_eq!(init(path.as_ptr(), 1 << 10, 1 << 11), -1);
        assert!(session().is_none());
        assert_eq!(init(path.as_ptr(), 0, 1 << 12), 0);
        // a second session is refused.
        assert_eq!(init(path.as_ptr(), 0, 0), -1);

        let session = session().unwrap();
        {
            let lifecycle = session.lifecycle.lock().unwrap();
            assert!(lifecycle.config().validating);
            assert_eq!(lifecycle.config().external_files.paths().len(), 2);
        }
        assert_eq!(session.coverage.map_size(), MAP_SIZE);
        assert_eq!(session.coverage.inst_ratio(), 1 << 12);
        snapsrv_log(0x1000);
        assert!(!session.coverage.is_armed());
        assert_eq!(snapsrv_checkpoint_done(), 0);
        assert_eq!(session.clock.offset(), 0);
        assert!(snapsrv_clock_realtime() > 0);
    }
}
