//! In-memory representation of a single fixed-size page.
//!
//! Bytes 0..2 hold the free-space offset (FSO), a big-endian `u16` pointing
//! at the first unused byte in the page. Normal pages grow by appending at
//! the FSO and advancing it; recovery may rewrite bytes behind the FSO
//! in place without moving it.

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

use crate::types::{PageNum, PageOffset, PAGE_SIZE};

const FSO_LEN: usize = 2;

/// A single page's mutable state: its raw bytes, dirty flag, and page
/// number. Always accessed behind a lock because multiple threads may hold
/// handles to the same page through the cache.
pub struct PageInner {
    pub page_num: PageNum,
    pub buf: [u8; PAGE_SIZE],
    pub dirty: bool,
}

impl PageInner {
    pub fn new(page_num: PageNum) -> Self {
        let mut inner = Self {
            page_num,
            buf: [0u8; PAGE_SIZE],
            dirty: false,
        };
        inner.set_fso(FSO_LEN as u16);
        inner
    }

    pub fn from_bytes(page_num: PageNum, buf: [u8; PAGE_SIZE]) -> Self {
        Self { page_num, buf, dirty: false }
    }

    pub fn fso(&self) -> u16 {
        BigEndian::read_u16(&self.buf[0..FSO_LEN])
    }

    pub fn set_fso(&mut self, fso: u16) {
        BigEndian::write_u16(&mut self.buf[0..FSO_LEN], fso);
    }

    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso() as usize
    }

    /// Append `data` at the current FSO, advance it, and return the write
    /// offset. Caller must have already checked `free_space() >= data.len()`.
    pub fn append(&mut self, data: &[u8]) -> PageOffset {
        let offset = self.fso();
        let start = offset as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.set_fso(offset + data.len() as u16);
        self.dirty = true;
        offset
    }

    /// Write `data` at `offset` without touching the FSO. Used by recovery
    /// redo/undo, where the write target already lies behind the FSO.
    pub fn write_at(&mut self, offset: PageOffset, data: &[u8]) {
        let start = offset as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.dirty = true;
        if offset as usize + data.len() > self.fso() as usize {
            self.set_fso((offset as usize + data.len()) as u16);
        }
    }

    pub fn read_at(&self, offset: PageOffset, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.buf[start..start + len]
    }
}

/// Shared, lockable handle to a page's bytes. This is the resource type
/// admitted by the page cache: cloning a `Page` clones the `Arc`, not the
/// underlying bytes.
pub type Page = Arc<Mutex<PageInner>>;

pub fn new_page_handle(page_num: PageNum) -> Page {
    Arc::new(Mutex::new(PageInner::new(page_num)))
}

pub fn page_handle_from_bytes(page_num: PageNum, buf: [u8; PAGE_SIZE]) -> Page {
    Arc::new(Mutex::new(PageInner::from_bytes(page_num, buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_fso() {
        let mut page = PageInner::new(1);
        assert_eq!(page.fso(), 2);
        let off = page.append(b"hello");
        assert_eq!(off, 2);
        assert_eq!(page.fso(), 7);
        assert_eq!(page.read_at(off, 5), b"hello");
    }

    #[test]
    fn write_at_does_not_move_fso_if_within_used_region() {
        let mut page = PageInner::new(1);
        page.append(b"hello");
        let fso_before = page.fso();
        page.write_at(2, b"HELLO");
        assert_eq!(page.fso(), fso_before);
        assert_eq!(page.read_at(2, 5), b"HELLO");
    }
}
