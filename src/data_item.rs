//! Data-item manager: variable-length records laid out inside pages.
//!
//! Every record is framed as `[valid: 1][size: 2][payload: size]` inside its
//! page. A uid addresses a record by `(page_num, offset)`. Every durable
//! mutation to a record's payload is preceded by a write-ahead log entry
//! whose redo reproduces the new bytes and whose undo reproduces the old
//! bytes; see [`crate::log_entry`] and [`crate::recovery`].

use std::sync::Arc;

use log::debug;

use crate::cache::{CacheSource, ResourceCache};
use crate::error::{QuarryError, Result};
use crate::free_space::FreeSpaceIndex;
use crate::log_entry::LogEntry;
use crate::page::{Page, PageInner};
use crate::pager::Pager;
use crate::types::{make_uid, split_uid, PageNum, PageOffset, Uid, Xid};
use crate::wal::Wal;

const VALID: u8 = 0;
const INVALID: u8 = 1;
const FRAME_HEADER_LEN: usize = 1 + 2; // valid byte + u16 size

/// A handle to a record's backing page and in-page offset. Cheap to clone:
/// the page bytes themselves live behind the shared `Page` handle.
#[derive(Clone)]
pub struct DataItem {
    page: Page,
    page_num: PageNum,
    offset: PageOffset,
}

impl DataItem {
    /// Whether the record is live (not logically deleted).
    pub fn is_valid(&self) -> bool {
        let inner = self.page.lock().unwrap();
        inner.read_at(self.offset, 1)[0] == VALID
    }

    /// Copy of the record's current payload bytes (excludes the framing
    /// header).
    pub fn payload(&self) -> Vec<u8> {
        let inner = self.page.lock().unwrap();
        let size_bytes = inner.read_at(self.offset + 1, 2);
        let size = u16::from_be_bytes([size_bytes[0], size_bytes[1]]) as usize;
        inner.read_at(self.offset + 3, size).to_vec()
    }

    fn set_valid(&self, valid: u8) {
        let mut inner = self.page.lock().unwrap();
        inner.write_at(self.offset, &[valid]);
    }
}

/// Manages data items across all pages, mediating allocation through the
/// free-space index and durability through the write-ahead log.
pub struct DataItemManager {
    pager: Arc<Pager>,
    wal: Arc<Wal>,
    free_space: FreeSpaceIndex,
    cache: ResourceCache<Uid, DataItem>,
}

impl DataItemManager {
    pub fn new(pager: Arc<Pager>, wal: Arc<Wal>, cache_capacity: usize) -> Result<Self> {
        Ok(Self {
            pager,
            wal,
            free_space: FreeSpaceIndex::new(),
            cache: ResourceCache::new(cache_capacity)?,
        })
    }

    /// Insert a new record with the given (already MVCC-framed) payload.
    /// Logs the insert, writes the framed item, and returns its uid. The
    /// caller should `release` the uid once done; it is not left cached.
    pub fn insert(&self, xid: Xid, payload: &[u8]) -> Result<Uid> {
        let needed = FRAME_HEADER_LEN + payload.len();

        let (page_num, page) = match self.free_space.select(needed) {
            Some((page_num, _)) => (page_num, self.pager.acquire(page_num)?),
            None => {
                let init = PageInner::new(0);
                let page_num = self.pager.new_page(&init)?;
                (page_num, self.pager.acquire(page_num)?)
            }
        };

        let offset = {
            let mut inner = page.lock().map_err(|_| poisoned())?;
            let mut frame = Vec::with_capacity(needed);
            frame.push(VALID);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            frame.extend_from_slice(payload);

            let offset = inner.append(&frame);

            self.wal.append(&LogEntry::encode_insert(xid, page_num, offset, &frame))?;
            offset
        };

        let remaining = {
            let inner = page.lock().map_err(|_| poisoned())?;
            inner.free_space()
        };
        self.free_space.add(page_num, remaining);
        self.pager.release(page_num)?;

        let uid = make_uid(page_num, offset);
        debug!("inserted item {} ({} bytes)", uid, payload.len());
        Ok(uid)
    }

    /// Acquire a cached handle to the record identified by `uid`.
    pub fn acquire(&self, uid: Uid) -> Result<DataItem> {
        self.cache.acquire(uid, self)
    }

    /// Release a previously acquired handle.
    pub fn release(&self, uid: Uid) -> Result<()> {
        self.cache.release(uid, self)
    }

    /// Replace a live record's payload in place, logging the before/after
    /// image. `mutate` receives the current payload and returns the new
    /// one; it must not change length relative to what the page can hold
    /// (the payload region is not resized).
    ///
    /// The page is mutated before the log entry is appended (the log entry
    /// itself needs the new bytes), so a failed `wal.append` must undo the
    /// in-place write before returning -- the `unBefore()` half of the
    /// before/after protocol -- otherwise a durable flush of this page could
    /// later persist bytes with no corresponding log entry to redo or undo
    /// them on recovery.
    pub fn update<F>(&self, xid: Xid, uid: Uid, mutate: F) -> Result<()>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let item = self.acquire(uid)?;
        let payload_offset = item.offset + 3;
        let result = (|| {
            let old = item.payload();
            let new = mutate(&old);
            if new.len() != old.len() {
                return Err(QuarryError::Internal(
                    "data item update changed payload length".into(),
                ));
            }

            {
                let mut inner = item.page.lock().map_err(|_| poisoned())?;
                inner.write_at(payload_offset, &new);
            }

            if let Err(e) = self.wal.append(&LogEntry::encode_update(xid, uid, &old, &new)) {
                // unBefore(): the log entry never made it to disk, so the
                // in-place write must not survive either.
                let mut inner = item.page.lock().map_err(|_| poisoned())?;
                inner.write_at(payload_offset, &old);
                return Err(e);
            }

            Ok(())
        })();

        self.release(uid)?;
        result
    }

    /// Logically delete a record by flipping its valid byte, without
    /// logging (used only by recovery's undo pass to reverse an insert).
    pub fn redo_invalidate(&self, uid: Uid) -> Result<()> {
        let item = self.acquire(uid)?;
        item.set_valid(INVALID);
        self.release(uid)
    }

    /// Apply an insert's redo image directly, bypassing free-space bookkeeping
    /// (used only during crash recovery, where the page may already contain
    /// the bytes or may need them reapplied).
    pub fn redo_insert(&self, page_num: PageNum, offset: PageOffset, frame: &[u8]) -> Result<()> {
        let page = self.pager.acquire(page_num)?;
        {
            let mut inner = page.lock().map_err(|_| poisoned())?;
            inner.write_at(offset, frame);
        }
        self.pager.release(page_num)
    }

    /// Apply an update's redo or undo image directly to the page, bypassing
    /// the log (used only during crash recovery).
    pub fn redo_update(&self, uid: Uid, bytes: &[u8]) -> Result<()> {
        let (page_num, offset) = split_uid(uid);
        let page = self.pager.acquire(page_num)?;
        {
            let mut inner = page.lock().map_err(|_| poisoned())?;
            let payload_offset = offset + 3;
            inner.write_at(payload_offset, bytes);
        }
        self.pager.release(page_num)
    }

    pub fn close(&self) -> Result<()> {
        self.cache.close(self)
    }
}

impl CacheSource<Uid, DataItem> for DataItemManager {
    fn load(&self, uid: Uid) -> Result<DataItem> {
        let (page_num, offset) = split_uid(uid);
        let page = self.pager.acquire(page_num)?;
        Ok(DataItem { page, page_num, offset })
    }

    fn evict(&self, _uid: Uid, item: DataItem) {
        let _ = self.pager.release(item.page_num);
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("data item mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (DataItemManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::create(dir.path().join("test.db"), 32).unwrap());
        let wal = Arc::new(Wal::create(dir.path().join("test.log")).unwrap());
        let manager = DataItemManager::new(pager, wal, 32).unwrap();
        (manager, dir)
    }

    #[test]
    fn insert_then_read_round_trips() {
        let (manager, _dir) = setup();
        let uid = manager.insert(1, b"hello world").unwrap();
        let item = manager.acquire(uid).unwrap();
        assert!(item.is_valid());
        assert_eq!(item.payload(), b"hello world");
        manager.release(uid).unwrap();
    }

    #[test]
    fn update_replaces_payload_in_place() {
        let (manager, _dir) = setup();
        let uid = manager.insert(1, b"aaaaa").unwrap();
        manager.update(1, uid, |_old| b"bbbbb".to_vec()).unwrap();
        let item = manager.acquire(uid).unwrap();
        assert_eq!(item.payload(), b"bbbbb");
        manager.release(uid).unwrap();
    }
}
