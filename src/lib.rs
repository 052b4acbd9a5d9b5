//! Snapshot based fuzzing: an AFL forkserver that restores a CRIU image of the
//! target instead of forking, and the lifecycle the target runs to produce
//! and resume from that image.

#[macro_use]
pub mod utils;
pub mod clock;
pub mod coord;
pub mod cover;
pub mod ffi;
pub mod target;
