// Copyright (c) 2025 RustyDB Contributors
//
// Buffer pool: caches fixed-size pages from disk in a pre-allocated
// array of frames, pinning them for callers and evicting unpinned
// frames (flushing dirty ones first) when the pool is full.
//
// This is the corrected design. The original source this was modeled on
// composed its lookup key as `(io_id << 48) | (page_id >> 16)`, which
// throws away the low 16 bits of `page_id` and collides every 65536
// pages; here the key is `(fileId << 48) | pageId` with no shift on the
// low half. It also fetched from disk while holding no claim on the
// frame other than the shared lock, so two callers missing on the same
// key would both win the free list and leak a frame; here a fetch first
// claims the slot by publishing a sentinel `LOADING` frame id so a
// racing caller finds it and waits rather than starting a second load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::concurrent::LockFreeStack;
use crate::error::{DbError, Result};
use crate::storage::disk::DiskManager;
use crate::storage::page::{self, FileId, PageId, PAGE_SIZE};

pub type FrameId = u32;
pub type BufferPoolKey = u64;

/// Sentinel frame id published while a page is being loaded from disk,
/// so a second caller that misses on the same key waits instead of
/// starting a redundant load.
const LOADING: FrameId = FrameId::MAX;

/// `(fileId << 48) | pageId`. `pageId` is 16 bits so no bits of either
/// half are discarded.
fn buffer_pool_key(file_id: FileId, page_id: PageId) -> BufferPoolKey {
    ((file_id as u64) << 48) | page_id as u64
}

struct Frame {
    pin_count: AtomicU16,
    dirty: AtomicBool,
    file_id: RwLock<FileId>,
    page_id: RwLock<PageId>,
    bytes: RwLock<Vec<u8>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            pin_count: AtomicU16::new(0),
            dirty: AtomicBool::new(false),
            file_id: RwLock::new(0),
            page_id: RwLock::new(0),
            bytes: RwLock::new(vec![0u8; PAGE_SIZE]),
        }
    }
}

/// A small wait queue pages block on while another thread loads the
/// same key from disk on their behalf.
#[derive(Default)]
struct LoadWaiters {
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// Caches up to `num_frames` pages in memory, backed by a [`DiskManager`].
pub struct BufferPool {
    disk: DiskManager,
    frames: Vec<Frame>,
    page_table: RwLock<HashMap<BufferPoolKey, FrameId>>,
    free_frames: LockFreeStack<FrameId>,
    lru: Mutex<Vec<FrameId>>,
    waiters: LoadWaiters,
}

/// RAII handle to a pinned frame. Dropping it unpins the frame and
/// marks it recently-used; `mark_dirty` must be called before any
/// mutation made through `page_bytes_mut` is visible to eviction.
pub struct PinGuard<'a> {
    pool: &'a BufferPool,
    frame_id: FrameId,
    key: BufferPoolKey,
}

impl<'a> PinGuard<'a> {
    /// Raw page bytes for read access. Callers use [`crate::storage::page`]
    /// functions to interpret them.
    pub fn page_bytes(&self) -> parking_lot::RwLockReadGuard<'_, Vec<u8>> {
        self.pool.frames[self.frame_id as usize].bytes.read()
    }

    /// Raw page bytes for mutation. Callers must call [`PinGuard::mark_dirty`]
    /// after writing through this guard.
    pub fn page_bytes_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Vec<u8>> {
        self.pool.frames[self.frame_id as usize].bytes.write()
    }

    pub fn mark_dirty(&self) {
        self.pool.frames[self.frame_id as usize]
            .dirty
            .store(true, Ordering::Release);
    }

    pub fn page_id(&self) -> PageId {
        *self.pool.frames[self.frame_id as usize].page_id.read()
    }

    #[cfg(test)]
    fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl<'a> Drop for PinGuard<'a> {
    fn drop(&mut self) {
        let frame = &self.pool.frames[self.frame_id as usize];
        let prev = frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpinning a frame with zero pins");
        if prev == 1 {
            let mut lru = self.pool.lru.lock();
            lru.retain(|&f| f != self.frame_id);
            lru.push(self.frame_id);
        }
        let _ = self.key;
    }
}

impl BufferPool {
    pub fn new(num_frames: usize, disk: DiskManager) -> Self {
        let free_frames = LockFreeStack::with_capacity(num_frames);
        for i in 0..num_frames {
            free_frames.push(i as FrameId).expect("fresh stack has capacity");
        }
        let frames = (0..num_frames).map(|_| Frame::new()).collect();
        Self {
            disk,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_frames,
            lru: Mutex::new(Vec::new()),
            waiters: LoadWaiters::default(),
        }
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Fetch and pin the page at `(file_id, page_id)`, loading it from
    /// disk on a miss.
    #[instrument(skip(self))]
    pub fn fetch_page(&self, file_id: FileId, page_id: PageId) -> Result<PinGuard<'_>> {
        let key = buffer_pool_key(file_id, page_id);
        loop {
            {
                let table = self.page_table.read();
                match table.get(&key).copied() {
                    Some(LOADING) => {
                        drop(table);
                        self.wait_for_load();
                        continue;
                    }
                    Some(frame_id) => {
                        // Pin while still holding the map's read lock so
                        // `evict_one`'s write-lock-guarded pin check (below)
                        // cannot observe this frame as unpinned, select it,
                        // and hand it to a different page while this pin is
                        // in flight.
                        let frame = &self.frames[frame_id as usize];
                        frame.pin_count.fetch_add(1, Ordering::AcqRel);
                        drop(table);
                        self.lru.lock().retain(|&f| f != frame_id);
                        debug!(file_id, page_id, frame_id, "buffer pool hit");
                        return Ok(PinGuard {
                            pool: self,
                            frame_id,
                            key,
                        });
                    }
                    None => {}
                }
            }

            // Miss: claim the key with the LOADING sentinel before
            // releasing the write lock, so a racing fetch on the same
            // key waits rather than starting a second load.
            {
                let mut table = self.page_table.write();
                if table.contains_key(&key) {
                    continue;
                }
                table.insert(key, LOADING);
            }

            let frame_id = match self.claim_frame() {
                Ok(id) => id,
                Err(e) => {
                    self.page_table.write().remove(&key);
                    self.notify_waiters();
                    return Err(e);
                }
            };

            let mut bytes = vec![0u8; PAGE_SIZE];
            let offset = page::HEADER_PAGES as u64 * PAGE_SIZE as u64
                + page_id as u64 * PAGE_SIZE as u64;
            if let Err(e) = self.disk.read(file_id, offset, &mut bytes) {
                self.free_frames.push(frame_id).ok();
                self.page_table.write().remove(&key);
                self.notify_waiters();
                return Err(e);
            }

            let frame = &self.frames[frame_id as usize];
            *frame.bytes.write() = bytes;
            *frame.file_id.write() = file_id;
            *frame.page_id.write() = page_id;
            frame.dirty.store(false, Ordering::Release);
            frame.pin_count.store(1, Ordering::Release);

            self.page_table.write().insert(key, frame_id);
            self.notify_waiters();

            debug!(file_id, page_id, frame_id, "buffer pool miss, loaded from disk");
            return Ok(PinGuard {
                pool: self,
                frame_id,
                key,
            });
        }
    }

    fn wait_for_load(&self) {
        let mut guard = self.waiters.mutex.lock();
        self.waiters.condvar.wait_for(&mut guard, std::time::Duration::from_millis(5));
    }

    fn notify_waiters(&self) {
        let _guard = self.waiters.mutex.lock();
        self.waiters.condvar.notify_all();
    }

    fn claim_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.pop() {
            return Ok(frame_id);
        }
        self.evict_one()
    }

    fn evict_one(&self) -> Result<FrameId> {
        loop {
            let candidate = {
                let mut lru = self.lru.lock();
                if lru.is_empty() {
                    return Err(DbError::NoFreeFrame);
                }
                lru.remove(0)
            };

            // Re-check the pin count and remove the mapping under the same
            // lock `fetch_page`'s hit path holds (as a reader) while it
            // increments the pin. That mutual exclusion is what makes "zero
            // pin count" and "victim selected" atomic: a hit that already
            // entered its read-locked section finishes incrementing before
            // this write lock is granted, and a hit that hasn't started yet
            // will see the mapping gone and fall through to the miss path
            // instead of pinning a frame this call is about to repurpose.
            let mut table = self.page_table.write();
            let frame = &self.frames[candidate as usize];
            if frame.pin_count.load(Ordering::Acquire) != 0 {
                drop(table);
                continue;
            }

            if frame.dirty.load(Ordering::Acquire) {
                let file_id = *frame.file_id.read();
                let page_id = *frame.page_id.read();
                let offset = page::HEADER_PAGES as u64 * PAGE_SIZE as u64
                    + page_id as u64 * PAGE_SIZE as u64;
                let bytes = frame.bytes.read();
                self.disk.write(file_id, offset, &bytes)?;
                drop(bytes);
                frame.dirty.store(false, Ordering::Release);
                warn!(file_id, page_id, frame_id = candidate, "flushed dirty frame on eviction");
            }

            let old_key = buffer_pool_key(*frame.file_id.read(), *frame.page_id.read());
            table.remove(&old_key);
            return Ok(candidate);
        }
    }

    /// Flush every dirty, currently-cached frame to disk.
    pub fn flush_all(&self) -> Result<()> {
        for (frame_id, frame) in self.frames.iter().enumerate() {
            if frame.dirty.load(Ordering::Acquire) {
                let file_id = *frame.file_id.read();
                let page_id = *frame.page_id.read();
                let offset = page::HEADER_PAGES as u64 * PAGE_SIZE as u64
                    + page_id as u64 * PAGE_SIZE as u64;
                let bytes = frame.bytes.read();
                self.disk.write(file_id, offset, &bytes)?;
                drop(bytes);
                frame.dirty.store(false, Ordering::Release);
                debug!(frame_id, file_id, page_id, "flushed frame");
            }
        }
        Ok(())
    }
}
