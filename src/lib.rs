//! Storage and transaction substrate for a small relational database engine.
//!
//! This crate provides the durable, concurrent, multi-version core that a
//! query layer sits on top of: a reference-counted page cache, a
//! transaction status store, a fixed-size page store with append-only
//! normal pages, a write-ahead log with checksums and torn-tail repair, a
//! free-space bucket index, a data-item manager for variable-length
//! records, a deadlock-detecting lock table, and an MVCC version manager
//! with snapshot isolation and read-committed semantics.
//!
//! SQL parsing, query planning and execution, index structures, network
//! protocol framing, connection handling, and configuration-file loading
//! are not part of this crate; [`Database`] is a library-level handle meant
//! to be driven by such a layer.

pub mod cache;
pub mod data_item;
pub mod error;
pub mod free_space;
pub mod lock_table;
pub mod log_entry;
pub mod page;
pub mod pager;
pub mod recovery;
pub mod types;
pub mod version_manager;
pub mod wal;
pub mod xid_store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

pub use error::{QuarryError, Result};
pub use types::{IsolationLevel, Uid, Xid};

use data_item::DataItemManager;
use pager::Pager;
use version_manager::VersionManager;
use wal::Wal;
use xid_store::XidStore;

/// Configuration for opening or creating a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of pages resident in the page cache at once.
    pub page_cache_capacity: usize,
    /// Maximum number of data items resident in the item cache at once.
    pub item_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_cache_capacity: 256,
            item_cache_capacity: 256,
        }
    }
}

/// A handle to an open database: its page store, log, transaction status
/// store, and version manager. This is the entry point a query layer
/// embeds to get durable, transactional, multi-version storage.
pub struct Database {
    version_manager: VersionManager,
    items: Arc<DataItemManager>,
    pager: Arc<Pager>,
    wal: Arc<Wal>,
}

impl Database {
    /// Create a fresh database rooted at `path` (a directory containing the
    /// `.db`, `.log`, and `.xid` files). Fails if any of those files
    /// already exist.
    pub fn create<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let paths = FilePaths::new(path.as_ref());
        let pager = Arc::new(Pager::create(&paths.data, config.page_cache_capacity)?);
        let wal = Arc::new(Wal::create(&paths.log)?);
        let xid_store = Arc::new(XidStore::create(&paths.xid)?);
        let items = Arc::new(DataItemManager::new(
            pager.clone(),
            wal.clone(),
            config.item_cache_capacity,
        )?);

        info!("created database at {}", paths.data.display());
        Ok(Self {
            version_manager: VersionManager::new(xid_store, items.clone()),
            items,
            pager,
            wal,
        })
    }

    /// Open an existing database, running crash recovery before returning.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let paths = FilePaths::new(path.as_ref());
        let pager = Arc::new(Pager::open(&paths.data, config.page_cache_capacity)?);
        let wal = Arc::new(Wal::open(&paths.log)?);
        let xid_store = Arc::new(XidStore::open(&paths.xid)?);
        let items = Arc::new(DataItemManager::new(
            pager.clone(),
            wal.clone(),
            config.item_cache_capacity,
        )?);

        recovery::recover(&wal, &xid_store, &items)?;

        info!("opened database at {}", paths.data.display());
        Ok(Self {
            version_manager: VersionManager::new(xid_store, items.clone()),
            items,
            pager,
            wal,
        })
    }

    /// Begin a new transaction at the given isolation level, returning its
    /// xid.
    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        self.version_manager.begin(level)
    }

    /// Read a record's user payload as visible to `xid`.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.version_manager.read(xid, uid)
    }

    /// Insert a new record owned by `xid`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        self.version_manager.insert(xid, data)
    }

    /// Delete a record visible to `xid`. Returns `false` if it was not
    /// visible.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        self.version_manager.delete(xid, uid)
    }

    /// Commit `xid`.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.version_manager.commit(xid)
    }

    /// Abort `xid`.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.version_manager.abort(xid)
    }

    /// Flush and close all caches. The database file handles themselves
    /// close when the handle is dropped.
    pub fn close(&self) -> Result<()> {
        self.items.close()?;
        self.pager.close()?;
        info!("closed database");
        Ok(())
    }
}

struct FilePaths {
    data: PathBuf,
    log: PathBuf,
    xid: PathBuf,
}

impl FilePaths {
    fn new(root: &Path) -> Self {
        Self {
            data: root.with_extension("db"),
            log: root.with_extension("log"),
            xid: root.with_extension("xid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_insert_commit_reopen_survives() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("db");
        let config = Config::default();

        let uid = {
            let db = Database::create(&root, &config).unwrap();
            let xid = db.begin(IsolationLevel::ReadCommitted).unwrap();
            let uid = db.insert(xid, b"payload").unwrap();
            db.commit(xid).unwrap();
            db.close().unwrap();
            uid
        };

        let db = Database::open(&root, &config).unwrap();
        let xid = db.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(db.read(xid, uid).unwrap(), Some(b"payload".to_vec()));
        db.commit(xid).unwrap();
    }
}
