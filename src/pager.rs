//! Fixed-size page store (the `.db` file), cached through [`crate::cache`].
//!
//! Pages are 1-indexed, 8192 bytes each. The pager owns the file handle and
//! implements `CacheSource` so that reads go through the reference-counted
//! cache while writes and truncation go straight to disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::{debug, info};

use crate::cache::{CacheSource, ResourceCache};
use crate::error::{QuarryError, Result};
use crate::page::{page_handle_from_bytes, Page, PageInner};
use crate::types::{PageNum, PAGE_SIZE};

/// Page store backed by a single file, with a reference-counted cache of
/// resident pages in front of it.
pub struct Pager {
    file: Mutex<File>,
    next_page_num: AtomicU32,
    cache: ResourceCache<PageNum, Page>,
}

impl Pager {
    /// Create a fresh page file. Fails if one already exists at `path`.
    pub fn create<P: AsRef<Path>>(path: P, cache_capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(QuarryError::FileExists(path.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| QuarryError::FileCannotRw(path.display().to_string()))?;

        info!("created page store {}", path.display());
        Ok(Self {
            file: Mutex::new(file),
            next_page_num: AtomicU32::new(1),
            cache: ResourceCache::new(cache_capacity)?,
        })
    }

    /// Open an existing page file.
    pub fn open<P: AsRef<Path>>(path: P, cache_capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(QuarryError::FileNotExists(path.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| QuarryError::FileCannotRw(path.display().to_string()))?;

        let len = file.metadata()?.len();
        let page_count = (len as usize / PAGE_SIZE) as u32;
        info!("opened page store {} with {} pages", path.display(), page_count);

        Ok(Self {
            file: Mutex::new(file),
            next_page_num: AtomicU32::new(page_count + 1),
            cache: ResourceCache::new(cache_capacity)?,
        })
    }

    /// Allocate a new page, initialize it with `init` bytes, and flush it to
    /// disk immediately. The new page is not admitted into the cache; callers
    /// that want a handle should `acquire` it afterward.
    pub fn new_page(&self, init: &PageInner) -> Result<PageNum> {
        let page_num = self.next_page_num.fetch_add(1, Ordering::SeqCst);
        self.flush_bytes(page_num, &init.buf)?;
        debug!("allocated page {}", page_num);
        Ok(page_num)
    }

    /// Acquire a cached handle to `page_num`, loading it from disk if needed.
    pub fn acquire(&self, page_num: PageNum) -> Result<Page> {
        self.cache.acquire(page_num, self)
    }

    /// Release a previously acquired handle, flushing it if dirty.
    pub fn release(&self, page_num: PageNum) -> Result<()> {
        self.cache.release(page_num, self)
    }

    /// Flush a page's current bytes to disk and clear its dirty flag.
    pub fn flush(&self, page: &Page) -> Result<()> {
        let mut inner = page.lock().map_err(|_| poisoned())?;
        if !inner.dirty {
            return Ok(());
        }
        self.flush_bytes(inner.page_num, &inner.buf)?;
        inner.dirty = false;
        Ok(())
    }

    fn flush_bytes(&self, page_num: PageNum, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock().map_err(|_| poisoned())?;
        let offset = (page_num as u64 - 1) * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Truncate the page file to `max_page_num` pages, discarding anything
    /// beyond it and resetting the allocation counter. Used by recovery to
    /// discard uncommitted post-crash growth.
    pub fn truncate_to(&self, max_page_num: PageNum) -> Result<()> {
        let mut file = self.file.lock().map_err(|_| poisoned())?;
        file.set_len(max_page_num as u64 * PAGE_SIZE as u64)?;
        self.next_page_num.store(max_page_num + 1, Ordering::SeqCst);
        info!("truncated page store to {} pages", max_page_num);
        Ok(())
    }

    pub fn page_count(&self) -> PageNum {
        self.next_page_num.load(Ordering::SeqCst) - 1
    }

    pub fn close(&self) -> Result<()> {
        self.cache.close(self)
    }
}

impl CacheSource<PageNum, Page> for Pager {
    fn load(&self, page_num: PageNum) -> Result<Page> {
        let mut buf = [0u8; PAGE_SIZE];
        let mut file = self.file.lock().map_err(|_| poisoned())?;
        let offset = (page_num as u64 - 1) * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(page_handle_from_bytes(page_num, buf))
    }

    fn evict(&self, _page_num: PageNum, page: Page) {
        if let Ok(mut inner) = page.lock() {
            if inner.dirty {
                if self.flush_bytes(inner.page_num, &inner.buf).is_ok() {
                    inner.dirty = false;
                }
            }
        }
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("pager mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageInner;
    use tempfile::tempdir;

    #[test]
    fn new_page_round_trips() {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("test.db"), 16).unwrap();

        let mut init = PageInner::new(1);
        init.append(b"hello");
        let page_num = pager.new_page(&init).unwrap();

        let handle = pager.acquire(page_num).unwrap();
        let inner = handle.lock().unwrap();
        assert_eq!(inner.read_at(2, 5), b"hello");
        drop(inner);
        pager.release(page_num).unwrap();
    }

    #[test]
    fn truncate_discards_trailing_pages() {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("test.db"), 16).unwrap();
        let init = PageInner::new(1);
        pager.new_page(&init).unwrap();
        pager.new_page(&init).unwrap();
        assert_eq!(pager.page_count(), 2);
        pager.truncate_to(1).unwrap();
        assert_eq!(pager.page_count(), 1);
    }
}
