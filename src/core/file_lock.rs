//! Cross-process exclusion via flock(2) on a sidecar `.lock` file.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Exclusive lock guarding one data file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

/// Sidecar lock path for `data_path` (`secrets.toml` -> `secrets.toml.lock`).
pub fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    data_path.with_file_name(name)
}

fn open(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
}

impl FileLock {
    /// Block until the lock for `data_path` is held.
    pub fn acquire(data_path: &Path) -> io::Result<Self> {
        let file = open(&lock_path_for(data_path))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }

    /// `Ok(None)` when another holder has it.
    pub fn try_acquire(data_path: &Path) -> io::Result<Option<Self>> {
        let file = open(&lock_path_for(data_path))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // fs2 reports EAGAIN as Other on some Linux targets
            Err(e) if e.raw_os_error() == Some(11) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
