// Copyright (c) 2025 RustyDB Contributors
//
// Heap file: a fixed-capacity collection of slotted pages, with tuple
// placement driven by a free-space-ordered priority structure.
//
// The free-space structure's defining invariant is that every page id
// appears in it at most once: a page being inserted into is "checked
// out" (popped) for the duration of the insert and republished only
// after the page's header has been updated, so two concurrent inserters
// can never both believe they have room on the same page.

use std::collections::BinaryHeap;

use parking_lot::RwLock;
use tracing::instrument;

use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::checksum::ChecksumFn;
use crate::storage::page::{self, FileId, PageId, SlotId, TupleId, FREE_BYTES_INITIAL, HEADER_PAGES, MAX_PAGES, PAGE_SIZE};

/// `(freeBytes << 16) | pageId`, ordered so the page with the most free
/// space sorts first and `pageId` breaks ties deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeSpaceEntry(u32);

impl FreeSpaceEntry {
    fn new(free_bytes: u16, page_id: PageId) -> Self {
        Self(((free_bytes as u32) << 16) | page_id as u32)
    }

    fn free_bytes(self) -> u16 {
        (self.0 >> 16) as u16
    }

    fn page_id(self) -> PageId {
        self.0 as u16
    }
}

/// A fixed-size heap file of `MAX_PAGES` slotted pages, backed by a
/// [`BufferPool`].
pub struct HeapFile<'a> {
    file_id: FileId,
    pool: &'a BufferPool,
    free_space: RwLock<BinaryHeap<FreeSpaceEntry>>,
    checksum_fn: ChecksumFn,
}

impl<'a> HeapFile<'a> {
    /// Registers a backing file sized for `MAX_PAGES` pages plus the
    /// reserved header region, initializes every page's header, and
    /// seeds the free-space structure.
    #[instrument(skip(pool, checksum_fn))]
    pub fn create(pool: &'a BufferPool, checksum_fn: ChecksumFn) -> Result<Self> {
        let total_pages = MAX_PAGES as usize + HEADER_PAGES as usize;
        let file_id = pool.disk().register_file(total_pages * PAGE_SIZE)?;

        let mut free_space = BinaryHeap::with_capacity(MAX_PAGES as usize);
        let mut buf = vec![0u8; PAGE_SIZE];
        for page_id in 0..MAX_PAGES as PageId {
            page::init(&mut buf, page_id);
            let offset = HEADER_PAGES as u64 * PAGE_SIZE as u64 + page_id as u64 * PAGE_SIZE as u64;
            pool.disk().write(file_id, offset, &buf)?;
            free_space.push(FreeSpaceEntry::new(FREE_BYTES_INITIAL, page_id));
        }

        Ok(Self {
            file_id,
            pool,
            free_space: RwLock::new(free_space),
            checksum_fn,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Insert `payload`, returning its assigned `(pageId, slot)`.
    ///
    /// Fails with [`DbError::NoSpace`] if no page currently has enough
    /// free space, measured against the page with the most free space
    /// in the heap file.
    #[instrument(skip(self, payload))]
    pub fn add_tuple(&self, payload: &[u8]) -> Result<TupleId> {
        let checksum = (self.checksum_fn)(payload);
        let needed = page::space_for_tuple(payload.len());

        let entry = {
            let mut free_space = self.free_space.write();
            match free_space.peek() {
                Some(top) if top.free_bytes() as u32 >= needed => free_space.pop().unwrap(),
                Some(top) => {
                    return Err(DbError::NoSpace {
                        needed,
                        available: top.free_bytes() as u32,
                    })
                }
                None => {
                    return Err(DbError::Internal(
                        "free-space structure unexpectedly empty".to_string(),
                    ))
                }
            }
        };
        // `entry` is now privately owned by this insert: no other caller
        // can see `entry.page_id()` in the free-space structure until we
        // push its successor below.
        let page_id = entry.page_id();

        let insert_result = (|| -> Result<(SlotId, u16)> {
            let pin = self.pool.fetch_page(self.file_id, page_id)?;
            let mut bytes = pin.page_bytes_mut();
            let slot = page::insert_tuple(&mut bytes, checksum, payload)?;
            let new_free_bytes = page::free_bytes(&bytes);
            drop(bytes);
            pin.mark_dirty();
            Ok((slot, new_free_bytes))
        })();

        match insert_result {
            Ok((slot, new_free_bytes)) => {
                self.free_space
                    .write()
                    .push(FreeSpaceEntry::new(new_free_bytes, page_id));
                Ok((page_id, slot))
            }
            Err(e) => {
                // Re-publish the page at its last-known free space so a
                // transient failure (e.g. a disk error on fetch) does not
                // permanently strand it out of the free-space structure.
                self.free_space.write().push(entry);
                Err(e)
            }
        }
    }

    /// Read back the payload previously stored at `(page_id, slot)`.
    #[instrument(skip(self))]
    pub fn read_tuple(&self, page_id: PageId, slot: SlotId) -> Result<Vec<u8>> {
        let pin = self.pool.fetch_page(self.file_id, page_id)?;
        let bytes = pin.page_bytes();
        page::read_tuple(&bytes, page_id, slot, self.checksum_fn)
    }
}
