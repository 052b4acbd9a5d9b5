//! Files outside the process image that must roll back with every restore.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("'{0}' has no base name")]
    NoBaseName(PathBuf),
    #[error("copy '{from}' to '{to}': {err}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        err: std::io::Error,
    },
}

/// Ordered list of external files, parsed once from a comma separated list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalFiles {
    paths: Vec<PathBuf>,
}

impl FromStr for ExternalFiles {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let paths = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        Ok(Self { paths })
    }
}

impl ExternalFiles {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Copy every file into `dir` under its base name.
    ///
    /// A failed copy does not stop the others; all failures are returned.
    pub fn save_into(&self, dir: &Path) -> Vec<FileError> {
        self.paths
            .iter()
            .filter_map(|path| {
                let saved = saved_copy(dir, path).ok()?;
                copy(path, &saved).err()
            })
            .chain(self.unnamed())
            .collect()
    }

    /// Put the copies saved in `dir` back at their original paths.
    pub fn restore_from(&self, dir: &Path) -> Vec<FileError> {
        self.paths
            .iter()
            .filter_map(|path| {
                let saved = saved_copy(dir, path).ok()?;
                copy(&saved, path).err()
            })
            .chain(self.unnamed())
            .collect()
    }

    fn unnamed(&self) -> impl Iterator<Item = FileError> + '_ {
        self.paths
            .iter()
            .filter(|p| p.file_name().is_none())
            .map(|p| FileError::NoBaseName(p.clone()))
    }
}

/// Where `path` is kept inside `dir`: keyed by the component after the last separator.
pub fn saved_copy(dir: &Path, path: &Path) -> Result<PathBuf, FileError> {
    path.file_name()
        .map(|base| dir.join(base))
        .ok_or_else(|| FileError::NoBaseName(path.to_path_buf()))
}

fn copy(from: &Path, to: &Path) -> Result<(), FileError> {
    fs::copy(from, to).map(|_| ()).map_err(|err| FileError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_list() {
        let files: ExternalFiles = "/var/lib/a.db, /tmp/b.img,,c".parse().unwrap();
        assert_eq!(
            files.paths(),
            &[
                PathBuf::from("/var/lib/a.db"),
                PathBuf::from("/tmp/b.img"),
                PathBuf::from("c")
            ]
        );
        assert!("".parse::<ExternalFiles>().unwrap().is_empty());
    }

    #[test]
    fn keyed_by_base_name() {
        let dir = Path::new("/ckpt");
        assert_eq!(
            saved_copy(dir, Path::new("/a/b/disk.qcow2")).unwrap(),
            PathBuf::from("/ckpt/disk.qcow2")
        );
        assert_eq!(
            saved_copy(dir, Path::new("disk.qcow2")).unwrap(),
            PathBuf::from("/ckpt/disk.qcow2")
        );
        assert!(saved_copy(dir, Path::new("/")).is_err());
    }

    #[test]
    fn save_then_restore_rolls_back() {
        let work = tempdir().unwrap();
        let ckpt = tempdir().unwrap();
        let disk = work.path().join("disk.img");
        let log = work.path().join("state.log");
        fs::write(&disk, b"pristine").unwrap();
        fs::write(&log, b"one").unwrap();

        let files = ExternalFiles::new(vec![disk.clone(), log.clone()]);
        assert!(files.save_into(ckpt.path()).is_empty());
        assert_eq!(fs::read(ckpt.path().join("disk.img")).unwrap(), b"pristine");

        fs::write(&disk, b"dirty").unwrap();
        fs::write(&log, b"one two").unwrap();
        assert!(files.restore_from(ckpt.path()).is_empty());
        assert_eq!(fs::read(&disk).unwrap(), b"pristine");
        assert_eq!(fs::read(&log).unwrap(), b"one");
    }

    #[test]
    fn missing_file_does_not_stop_the_rest() {
        let work = tempdir().unwrap();
        let ckpt = tempdir().unwrap();
        let present = work.path().join("present");
        fs::write(&present, b"x").unwrap();

        let files = ExternalFiles::new(vec![work.path().join("absent"), present]);
        let errs = files.save_into(ckpt.path());
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], FileError::Copy { .. }));
        assert!(ckpt.path().join("present").exists());
    }
}
