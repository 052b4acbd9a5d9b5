//! Branch-edge coverage accounting into the engine's shared map.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Coverage map plumbing.
pub mod shm;

pub use shm::CoverageMap;

/// Map size expected by the fuzzing engine, must be a power of two.
pub const MAP_SIZE: usize = 1 << 16;

thread_local! {
    static PREV_LOC: Cell<usize> = Cell::new(0);
}

#[derive(Debug, Error)]
pub enum CoverError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty shm id")]
    EmptyId,
    #[error("system v segment {id}: {err}")]
    SysV { id: i32, err: nix::Error },
    #[error("posix segment '{id}': {err}")]
    Posix {
        id: String,
        err: shared_memory::ShmemError,
    },
    #[error("segment '{id}' holds {len} bytes, need {need}")]
    TooSmall { id: String, len: usize, need: usize },
    #[error("map size {0} is not a power of two")]
    BadMapSize(usize),
}

/// Spread aligned instruction addresses over the map.
#[inline]
pub fn scramble(loc: u64, map_size: usize) -> usize {
    (((loc >> 4) ^ (loc << 8)) as usize) & (map_size - 1)
}

/// Forget the previous location of the calling thread.
pub fn reset_thread() {
    PREV_LOC.with(|prev| prev.set(0));
}

/// Logs executed locations as edges once a map is armed.
///
/// The map pointer is published through an atomic so that any thread of the
/// target may log without taking a lock; `prev_loc` is kept per thread.
pub struct CoverageLogger {
    area: AtomicPtr<u8>,
    map_size: usize,
    inst_ratio: usize,
    map: Mutex<Option<CoverageMap>>,
}

impl CoverageLogger {
    /// `inst_ratio` keeps only locations whose scrambled value is below it,
    /// `map_size` instruments everything.
    pub fn new(map_size: usize, inst_ratio: usize) -> Result<Self, CoverError> {
        if !map_size.is_power_of_two() {
            return Err(CoverError::BadMapSize(map_size));
        }
        Ok(Self {
            area: AtomicPtr::new(ptr::null_mut()),
            map_size,
            inst_ratio,
            map: Mutex::new(None),
        })
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    pub fn inst_ratio(&self) -> usize {
        self.inst_ratio
    }

    /// Start logging into `map`, replacing any previous one.
    pub fn arm(&self, map: CoverageMap) -> Result<(), CoverError> {
        if map.len() < self.map_size {
            return Err(CoverError::TooSmall {
                id: "armed map".to_string(),
                len: map.len(),
                need: self.map_size,
            });
        }
        let mut slot = self.map.lock().unwrap();
        self.area.store(map.as_ptr(), Ordering::Release);
        *slot = Some(map);
        Ok(())
    }

    /// Stop logging and hand the map back.
    pub fn disarm(&self) -> Option<CoverageMap> {
        let mut slot = self.map.lock().unwrap();
        self.area.store(ptr::null_mut(), Ordering::Release);
        slot.take()
    }

    pub fn is_armed(&self) -> bool {
        !self.area.load(Ordering::Acquire).is_null()
    }

    /// Run `f` over the armed map, if any.
    pub fn with_map<R>(&self, f: impl FnOnce(&CoverageMap) -> R) -> Option<R> {
        self.map.lock().unwrap().as_ref().map(f)
    }

    /// Count the edge from the previous location of this thread to `loc`.
    #[inline]
    pub fn log(&self, loc: u64) {
        let area = self.area.load(Ordering::Acquire);
        if area.is_null() {
            return;
        }

        let cur = scramble(loc, self.map_size);
        if cur >= self.inst_ratio {
            return;
        }

        PREV_LOC.with(|prev| {
            let idx = cur ^ prev.get();
            // Lossy like the engine's own instrumentation: no read-modify-write
            // lock, counters wrap.
            let counter = unsafe { &*(area.add(idx) as *const AtomicU8) };
            counter.store(
                counter.load(Ordering::Relaxed).wrapping_add(1),
                Ordering::Relaxed,
            );
            prev.set(cur >> 1);
        });
    }
}
