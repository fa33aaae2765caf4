// Small demo binary exercising the storage layer end to end: registers
// a heap file, inserts a handful of tuples, reads them back, and prints
// a summary. Not a server -- this crate has no network surface.

use rustydb_storage::storage::{crc32c_checksum, BufferPool, DiskManager, HeapFile};
use rustydb_storage::Config;
use tracing::info;

fn main() -> rustydb_storage::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let config = Config::default();
    info!(pool_frames = config.pool_frames, max_pages = config.max_pages, "starting storage demo");

    let disk = DiskManager::new();
    let pool = BufferPool::new(config.pool_frames, disk);
    let heap = HeapFile::create(&pool, crc32c_checksum)?;

    let mut ids = Vec::new();
    for i in 0..10u32 {
        let payload = format!("tuple-{i}");
        let id = heap.add_tuple(payload.as_bytes())?;
        ids.push(id);
    }

    for (i, &(page_id, slot)) in ids.iter().enumerate() {
        let payload = heap.read_tuple(page_id, slot)?;
        info!(page_id, slot, payload = %String::from_utf8_lossy(&payload), "read tuple {i}");
    }

    pool.flush_all()?;
    info!("demo complete, {} tuples written and verified", ids.len());
    Ok(())
}
