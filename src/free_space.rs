//! Page free-space bucket index.
//!
//! Pages are bucketed by how much free space they have so the data-item
//! manager can find a page that fits a new record without scanning the
//! whole file. Entries are one-shot: callers must re-add a page after
//! using its free space.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{PageNum, PAGE_SIZE};

const NUM_BUCKETS: usize = 41;
const THRESHOLD: usize = PAGE_SIZE / 40;

fn bucket_for(free_space: usize) -> usize {
    (free_space / THRESHOLD).min(NUM_BUCKETS - 1)
}

/// Bucketed index of pages by free space.
pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<VecDeque<(PageNum, usize)>>>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(VecDeque::new());
        }
        Self { buckets: Mutex::new(buckets) }
    }

    /// Register `page_num` as having `free_space` bytes available.
    pub fn add(&self, page_num: PageNum, free_space: usize) {
        let bucket = bucket_for(free_space);
        self.buckets.lock().unwrap()[bucket].push_back((page_num, free_space));
    }

    /// Find and remove a page guaranteed to have at least `needed` bytes
    /// free. Returns `None` if no such page is indexed; the caller should
    /// then allocate a fresh page.
    pub fn select(&self, needed: usize) -> Option<(PageNum, usize)> {
        let start_bucket = (needed / THRESHOLD + 1).min(NUM_BUCKETS - 1);
        let mut buckets = self.buckets.lock().unwrap();
        for bucket in start_bucket..NUM_BUCKETS {
            if let Some(entry) = buckets[bucket].pop_front() {
                return Some(entry);
            }
        }
        None
    }
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_page_with_enough_space() {
        let index = FreeSpaceIndex::new();
        index.add(1, 100);
        index.add(2, 4000);
        let (page, space) = index.select(500).unwrap();
        assert_eq!(page, 2);
        assert!(space >= 500);
    }

    #[test]
    fn select_returns_none_when_nothing_fits() {
        let index = FreeSpaceIndex::new();
        index.add(1, 50);
        assert!(index.select(5000).is_none());
    }

    #[test]
    fn select_is_one_shot() {
        let index = FreeSpaceIndex::new();
        index.add(1, 4000);
        assert!(index.select(100).is_some());
        assert!(index.select(100).is_none());
    }
}
