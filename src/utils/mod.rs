//! Small helpers shared by the coordinator and the in-target lifecycle.

use std::io::{Read, Write};
use std::{mem, slice};

pub mod log;

/// Report to stderr and exit with a fixed code.
#[macro_export]
macro_rules! exits {
    ( $code:expr ) => {
        ::std::process::exit($code)
    };

    ( $code:expr, $fmt:expr $( , $arg:expr )* ) => {{
        eprintln!($fmt $( , $arg )*);
        ::std::process::exit($code)
    }};
}

/// Read one value of `T` in host layout, e.g. a 4 byte handshake word or a `pid_t`.
pub fn read_exact<T: Default + Sized, R: Read>(mut r: R) -> Result<T, std::io::Error> {
    let mut v = T::default();
    let data = cast_to_mut(&mut v);
    r.read_exact(data)?;
    Ok(v)
}

/// Write one value of `T` in host layout.
pub fn write_all<T: Sized, W: Write>(mut w: W, v: &T) -> Result<(), std::io::Error> {
    let data = cast_to(v);
    w.write_all(data)
}

pub fn cast_to<T: Sized>(v: &T) -> &[u8] {
    let ptr = (v as *const T).cast::<u8>();
    let len = mem::size_of::<T>();
    unsafe { slice::from_raw_parts(ptr, len) }
}

pub fn cast_to_mut<T: Sized>(v: &mut T) -> &mut [u8] {
    let ptr = (v as *mut T).cast::<u8>();
    let len = mem::size_of::<T>();
    unsafe { slice::from_raw_parts_mut(ptr, len) }
}
