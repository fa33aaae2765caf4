// Copyright (c) 2025 RustyDB Contributors
//
// Disk manager: registers logical files and performs byte-range I/O
// against each by file id + byte offset.
//
// The backing here is an in-memory, zero-initialized byte buffer per
// file -- durability across process restart is explicitly a non-goal of
// this design. A disk-backed implementation would swap the
// `RwLock<Vec<u8>>` backings for file handles without touching the
// public API.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::error::{DbError, Result};
use crate::storage::page::{FileId, MAX_FILES};

struct FileBacking {
    bytes: RwLock<Vec<u8>>,
}

/// Owns up to [`MAX_FILES`] logical-file backings and performs
/// byte-addressed reads/writes against them.
///
/// Registration uses interior mutability (`RwLock<Vec<_>>`) rather than
/// `&mut self`: callers such as [`crate::storage::heap::HeapFile`] hold
/// only a shared reference to the disk manager through the buffer pool,
/// and registration is rare enough that a write-lock on the whole file
/// list is not a contention concern.
pub struct DiskManager {
    files: RwLock<Vec<FileBacking>>,
    reads: AtomicU64,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(Vec::new()),
            reads: AtomicU64::new(0),
        }
    }

    /// Number of [`DiskManager::read`] calls served so far. Used by the
    /// buffer pool's tests to confirm that concurrent misses on the same
    /// key collapse into a single disk read.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    /// Register a new logical file with a fresh zeroed backing of
    /// `initial_bytes` bytes, returning its assigned [`FileId`]. Ids are
    /// assigned densely starting at zero and are never reused.
    #[instrument(skip(self))]
    pub fn register_file(&self, initial_bytes: usize) -> Result<FileId> {
        let mut files = self.files.write();
        if files.len() >= MAX_FILES {
            return Err(DbError::Internal(format!(
                "cannot register more than {MAX_FILES} files"
            )));
        }
        let id = files.len() as FileId;
        files.push(FileBacking {
            bytes: RwLock::new(vec![0u8; initial_bytes]),
        });
        debug!(file_id = id, initial_bytes, "registered file");
        Ok(id)
    }

    /// `file_id` being registered is a caller precondition, not an
    /// operational error: an unregistered id is a programmer error and
    /// aborts rather than returning a value (see `error.rs`).
    fn with_backing<R>(&self, file_id: FileId, f: impl FnOnce(&FileBacking) -> R) -> R {
        let files = self.files.read();
        let backing = files
            .get(file_id as usize)
            .unwrap_or_else(|| panic!("unregistered file id: {file_id}"));
        f(backing)
    }

    /// Copy `out.len()` bytes from the backing at `offset` into `out`.
    pub fn read(&self, file_id: FileId, offset: u64, out: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        self.with_backing(file_id, |backing| {
            let bytes = backing.bytes.read();
            let start = offset as usize;
            let end = start
                .checked_add(out.len())
                .ok_or_else(|| DbError::OutOfBounds("read range overflowed".to_string()))?;
            if end > bytes.len() {
                return Err(DbError::OutOfBounds(format!(
                    "read [{start}, {end}) exceeds file {file_id} size {}",
                    bytes.len()
                )));
            }
            out.copy_from_slice(&bytes[start..end]);
            Ok(())
        })
    }

    /// Copy `data` into the backing at `offset`. Concurrent overlapping
    /// writes to the same bytes are undefined; the buffer pool's pin
    /// discipline is what prevents that in practice.
    pub fn write(&self, file_id: FileId, offset: u64, data: &[u8]) -> Result<()> {
        self.with_backing(file_id, |backing| {
            let mut bytes = backing.bytes.write();
            let start = offset as usize;
            let end = start
                .checked_add(data.len())
                .ok_or_else(|| DbError::OutOfBounds("write range overflowed".to_string()))?;
            if end > bytes.len() {
                return Err(DbError::OutOfBounds(format!(
                    "write [{start}, {end}) exceeds file {file_id} size {}",
                    bytes.len()
                )));
            }
            bytes[start..end].copy_from_slice(data);
            Ok(())
        })
    }

    /// Size in bytes of a registered file's backing.
    pub fn file_size(&self, file_id: FileId) -> u64 {
        self.with_backing(file_id, |backing| backing.bytes.read().len() as u64)
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_round_trip() {
        let dm = DiskManager::new();
        let id = dm.register_file(4096).unwrap();
        assert_eq!(id, 0);

        let data = vec![7u8; 128];
        dm.write(id, 64, &data).unwrap();

        let mut out = vec![0u8; 128];
        dm.read(id, 64, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn file_ids_are_dense_and_unique() {
        let dm = DiskManager::new();
        let a = dm.register_file(4096).unwrap();
        let b = dm.register_file(4096).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn fresh_backing_is_zeroed() {
        let dm = DiskManager::new();
        let id = dm.register_file(16).unwrap();
        let mut out = vec![0xFFu8; 16];
        dm.read(id, 0, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    #[should_panic(expected = "unregistered file id")]
    fn unregistered_file_id_aborts() {
        let dm = DiskManager::new();
        let mut out = vec![0u8; 4];
        let _ = dm.read(3, 0, &mut out);
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let dm = DiskManager::new();
        let id = dm.register_file(16).unwrap();
        let mut out = vec![0u8; 32];
        assert!(matches!(dm.read(id, 0, &mut out), Err(DbError::OutOfBounds(_))));
    }

    #[test]
    fn out_of_bounds_write_fails() {
        let dm = DiskManager::new();
        let id = dm.register_file(16).unwrap();
        let data = vec![1u8; 8];
        assert!(matches!(
            dm.write(id, 12, &data),
            Err(DbError::OutOfBounds(_))
        ));
    }
}
