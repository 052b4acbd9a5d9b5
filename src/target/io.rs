//! Standard I/O of a restored target and the fuzz input stream.

use nix::unistd::{close, dup2};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::Path;

/// Queued input of the current iteration, inside the sync directory.
pub const CUR_INPUT: &str = ".cur_input";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";
/// Raw console input used when replaying in validation mode.
pub const CONSOLE: &str = "/dev/stdin";

/// Per-iteration files of a sync directory.
pub struct IterationFiles {
    pub input: File,
    pub stdout: File,
    pub stderr: File,
}

impl IterationFiles {
    pub fn open(sync_dir: &Path) -> io::Result<Self> {
        let append = |name: &str| {
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(sync_dir.join(name))
        };
        Ok(Self {
            input: File::open(sync_dir.join(CUR_INPUT))?,
            stdout: append(STDOUT_FILE)?,
            stderr: append(STDERR_FILE)?,
        })
    }

    /// Move these files onto descriptors 0, 1 and 2, where they stay open.
    /// Returns the input, reading through descriptor 0.
    ///
    /// The files were opened in ascending descriptor order, so pinning them in
    /// the same order never overwrites one that is still to be moved.
    pub fn into_stdio(self) -> nix::Result<File> {
        let stdin = pin(self.input, 0)?;
        pin(self.stdout, 1)?;
        pin(self.stderr, 2)?;
        Ok(unsafe { File::from_raw_fd(stdin) })
    }
}

/// Leave `file` open on `fd`, whatever descriptor it was opened on.
fn pin(file: File, fd: RawFd) -> nix::Result<RawFd> {
    if file.as_raw_fd() == fd {
        Ok(file.into_raw_fd())
    } else {
        // dropping `file` closes only its own descriptor.
        dup2(file.as_raw_fd(), fd)
    }
}

/// Close descriptors 0, 1 and 2 so that no host side file state ends up in the image.
pub fn close_stdio() {
    for fd in 0..=2 {
        let _ = close(fd);
    }
}

/// Source fuzz input requests are served from.
pub struct InputStream {
    src: Box<dyn Read + Send>,
}

impl InputStream {
    pub fn new<R: Read + Send + 'static>(src: R) -> Self {
        Self { src: Box::new(src) }
    }

    pub fn stdin() -> Self {
        Self::new(io::stdin())
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        File::open(path).map(Self::new)
    }

    /// Fill `dest` from the stream. Bytes past the end of the stream are zero,
    /// also when the read fails midway. Returns the number of bytes read.
    pub fn fill(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        let mut ret = Ok(());
        while n < dest.len() {
            match self.src.read(&mut dest[n..]) {
                Ok(0) => break,
                Ok(sz) => n += sz,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    ret = Err(e);
                    break;
                }
            }
        }
        for b in &mut dest[n..] {
            *b = 0;
        }
        ret.map(|_| n)
    }
}
