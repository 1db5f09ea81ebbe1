//! Helpers for dealing with files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use bytes::Bytes;
use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use crate::commons::error::IoError;


/// Creates a sub dir if needed, return full path to it.
pub fn sub_dir(base: &Path, name: &str) -> Result<PathBuf, IoError> {
    let full_path = base.join(name);
    create_dir_all(&full_path)?;
    Ok(full_path)
}

pub fn create_dir_all(dir: &Path) -> Result<(), IoError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| {
            IoError::new(
                format!("could not create dir: {}", dir.display()), e
            )
        })?;
    }
    Ok(())
}

/// Reads a file to Bytes.
pub fn read(path: &Path) -> Result<Bytes, IoError> {
    fs::read(path).map(Bytes::from).map_err(|e| {
        IoError::new(format!("could not read: '{}'", path.display()), e)
    })
}

/// Saves a file atomically, creating parent dirs as needed.
///
/// The content is written to a temporary file in the same directory first
/// which is then renamed to the final path. A crash therefore leaves either
/// the old or the new content.
pub fn save(content: &[u8], full_path: &Path) -> Result<(), IoError> {
    let mut tmp_file = tmp_file_for(full_path)?;
    tmp_file.write_all(content).map_err(|e| {
        IoError::new(
            format!(
                "could not write temp file for '{}'", full_path.display()
            ),
            e
        )
    })?;
    persist(tmp_file, full_path)
}

/// Saves an object as pretty JSON atomically.
pub fn save_json<O: Serialize>(
    object: &O, full_path: &Path
) -> Result<(), IoError> {
    let mut tmp_file = tmp_file_for(full_path)?;
    serde_json::to_writer_pretty(
        &mut BufWriter::new(&mut tmp_file), object
    ).map_err(|e| {
        IoError::new(
            format!("could not write json to '{}'", full_path.display()),
            e.into()
        )
    })?;
    persist(tmp_file, full_path)
}

/// Loads a file and deserializes it as JSON.
pub fn load_json<O: DeserializeOwned>(full_path: &Path) -> Result<O, IoError> {
    let bytes = read(full_path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        IoError::new(
            format!("could not parse json in '{}'", full_path.display()),
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })
}

pub fn delete_file(full_path: &Path) -> Result<(), IoError> {
    fs::remove_file(full_path).map_err(|e| {
        IoError::new(
            format!("could not remove file: {}", full_path.display()), e
        )
    })?;
    trace!("Removed file: {}", full_path.display());
    Ok(())
}

/// Renames a file, replacing an existing file at the target.
pub fn rename(from: &Path, to: &Path) -> Result<(), IoError> {
    fs::rename(from, to).map_err(|e| {
        IoError::new(
            format!(
                "could not rename '{}' to '{}'", from.display(), to.display()
            ),
            e
        )
    })?;
    trace!("Renamed file: {} to {}", from.display(), to.display());
    Ok(())
}

fn tmp_file_for(full_path: &Path) -> Result<NamedTempFile, IoError> {
    let dir = match full_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir_all(dir)?;
    NamedTempFile::new_in(dir).map_err(|e| {
        IoError::new(
            format!("could not create temp file in '{}'", dir.display()), e
        )
    })
}

fn persist(tmp_file: NamedTempFile, full_path: &Path) -> Result<(), IoError> {
    tmp_file.persist(full_path).map_err(|err| {
        IoError::new(
            format!(
                "failed to rename temp file '{}' to '{}'",
                err.file.path().display(),
                full_path.display()
            ),
            err.error
        )
    })?;
    trace!("Saved file: {}", full_path.display());
    Ok(())
}


//------------ FileLock ------------------------------------------------------

/// An advisory lock on a file, used to keep other processes from writing
/// into the same data directory.
pub struct FileLock {
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    pub fn create(path: &Path) -> Result<Self, IoError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                IoError::new(
                    format!("failed to open lock file '{}'", path.display()),
                    e
                )
            })?;
        Ok(FileLock { lock: fd_lock::RwLock::new(file) })
    }

    /// Blocks until the lock is held exclusively.
    pub fn write(
        &mut self
    ) -> Result<fd_lock::RwLockWriteGuard<'_, File>, IoError> {
        self.lock.write().map_err(|e| {
            IoError::new("cannot get file lock", e)
        })
    }

    /// Takes the lock exclusively, failing if somebody else holds it.
    pub fn try_write(
        &mut self
    ) -> Result<fd_lock::RwLockWriteGuard<'_, File>, IoError> {
        self.lock.try_write().map_err(|e| {
            IoError::new("file lock held by another process", e)
        })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::test_under_tmp;

    #[test]
    fn save_replaces_content() {
        test_under_tmp(|dir| {
            let path = dir.join("sub").join("file.txt");
            save(b"first", &path).unwrap();
            save(b"second", &path).unwrap();
            assert_eq!(read(&path).unwrap().as_ref(), b"second");

            // Only the target file remains, no temp files.
            let entries = fs::read_dir(dir.join("sub")).unwrap().count();
            assert_eq!(entries, 1);
        })
    }

    #[test]
    fn json_round_trip() {
        test_under_tmp(|dir| {
            let path = dir.join("values.json");
            save_json(&vec![1u32, 2, 3], &path).unwrap();
            let back: Vec<u32> = load_json(&path).unwrap();
            assert_eq!(back, vec![1, 2, 3]);
        })
    }

    #[test]
    fn second_lock_fails() {
        test_under_tmp(|dir| {
            let path = dir.join("lockfile.lock");
            let mut first = FileLock::create(&path).unwrap();
            let _guard = first.write().unwrap();
            let mut second = FileLock::create(&path).unwrap();
            assert!(second.try_write().is_err());
        })
    }
}
