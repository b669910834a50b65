//! MVCC version manager: visibility, snapshot isolation, and the write path.
//!
//! Every stored record carries a 16-byte header ahead of its user payload:
//! an 8-byte `xmin` (creator xid) and an 8-byte `xmax` (deleter xid, zero
//! while live). Readers never take locks; writers take a lock-table entry
//! on the uid they are about to mutate and hold it until they commit or
//! abort (strict two-phase locking for writes only).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::data_item::DataItemManager;
use crate::error::{QuarryError, Result};
use crate::lock_table::{Acquired, LockTable};
use crate::types::{IsolationLevel, Uid, Xid, SUPER_XID};
use crate::xid_store::XidStore;

const HEADER_LEN: usize = 16;

fn encode_header(xmin: Xid, xmax: Xid) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..8].copy_from_slice(&xmin.to_be_bytes());
    buf[8..16].copy_from_slice(&xmax.to_be_bytes());
    buf
}

fn decode_header(raw: &[u8]) -> (Xid, Xid) {
    let xmin = u64::from_be_bytes(raw[0..8].try_into().unwrap());
    let xmax = u64::from_be_bytes(raw[8..16].try_into().unwrap());
    (xmin, xmax)
}

/// In-memory bookkeeping for a running transaction.
struct ActiveTxn {
    isolation: IsolationLevel,
    snapshot: HashSet<Xid>,
    err: Option<QuarryError>,
    auto_aborted: AtomicBool,
}

/// Coordinates MVCC reads/writes, visibility, and transaction lifecycle.
pub struct VersionManager {
    xid_store: Arc<XidStore>,
    items: Arc<DataItemManager>,
    locks: LockTable,
    active: Mutex<HashMap<Xid, ActiveTxn>>,
}

impl VersionManager {
    pub fn new(xid_store: Arc<XidStore>, items: Arc<DataItemManager>) -> Self {
        Self {
            xid_store,
            items,
            locks: LockTable::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction at the given isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> Result<Xid> {
        let mut active = self.active.lock().map_err(|_| poisoned())?;
        let xid = self.xid_store.begin()?;

        let snapshot = match isolation {
            IsolationLevel::ReadCommitted => HashSet::new(),
            IsolationLevel::RepeatableRead => active.keys().copied().collect(),
        };

        active.insert(
            xid,
            ActiveTxn { isolation, snapshot, err: None, auto_aborted: AtomicBool::new(false) },
        );
        debug!("began xid {} ({:?})", xid, isolation);
        Ok(xid)
    }

    /// Read a record's user payload as visible to `xid`, or `None` if it
    /// does not exist or is not visible.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.check_live(xid)?;

        let item = match self.items.acquire(uid) {
            Ok(item) => item,
            Err(QuarryError::NullEntry) => return Ok(None),
            Err(e) => return Err(e),
        };

        let result = if !item.is_valid() {
            None
        } else {
            let raw = item.payload();
            let (xmin, xmax) = decode_header(&raw);
            if self.is_visible(xid, xmin, xmax)? {
                Some(raw[HEADER_LEN..].to_vec())
            } else {
                None
            }
        };

        self.items.release(uid)?;
        Ok(result)
    }

    /// Insert a new record owned by `xid`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        self.check_live(xid)?;
        let mut payload = Vec::with_capacity(HEADER_LEN + data.len());
        payload.extend_from_slice(&encode_header(xid, 0));
        payload.extend_from_slice(data);
        self.items.insert(xid, &payload)
    }

    /// Delete (mark as superseded by `xid`) a visible record. Returns
    /// `false` if the record is not visible to `xid`.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        self.check_live(xid)?;

        let item = match self.items.acquire(uid) {
            Ok(item) => item,
            Err(QuarryError::NullEntry) => return Ok(false),
            Err(e) => return Err(e),
        };
        let visible = {
            let raw = item.payload();
            let (xmin, xmax) = decode_header(&raw);
            self.is_visible(xid, xmin, xmax)?
        };
        self.items.release(uid)?;
        if !visible {
            return Ok(false);
        }

        match self.locks.acquire(xid, uid)? {
            Acquired::Granted => {}
            Acquired::Wait(latch) => {
                latch.wait();
                self.check_live(xid)?;
            }
        }

        let item = self.items.acquire(uid)?;
        let raw = item.payload();
        let (xmin, xmax) = decode_header(&raw);
        self.items.release(uid)?;

        if !self.is_visible(xid, xmin, xmax)? || self.is_version_skip(xid, xmax)? {
            self.set_error(xid, QuarryError::ConcurrentUpdate)?;
            self.abort_internal(xid, true)?;
            return Err(QuarryError::ConcurrentUpdate);
        }

        self.items.update(xid, uid, |old| {
            let mut new = old.to_vec();
            new[8..16].copy_from_slice(&xid.to_be_bytes());
            new
        })?;

        Ok(true)
    }

    /// Commit `xid`: mark it committed and release its write locks.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        {
            let active = self.active.lock().map_err(|_| poisoned())?;
            if let Some(txn) = active.get(&xid) {
                if let Some(err) = &txn.err {
                    return Err(clone_err(err));
                }
            }
        }
        self.xid_store.commit(xid)?;
        self.locks.release(xid)?;
        self.active.lock().map_err(|_| poisoned())?.remove(&xid);
        debug!("committed xid {}", xid);
        Ok(())
    }

    /// Abort `xid` explicitly (not because of an internal conflict).
    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.abort_internal(xid, false)
    }

    fn abort_internal(&self, xid: Xid, auto: bool) -> Result<()> {
        let already_auto = {
            let active = self.active.lock().map_err(|_| poisoned())?;
            active.get(&xid).map(|t| t.auto_aborted.load(Ordering::SeqCst)).unwrap_or(false)
        };
        if already_auto && !auto {
            // Internal abort already ran; explicit abort just needs the
            // status flip, not a second lock release.
            self.xid_store.abort(xid)?;
            self.active.lock().map_err(|_| poisoned())?.remove(&xid);
            return Ok(());
        }

        self.xid_store.abort(xid)?;
        self.locks.release(xid)?;
        if let Some(txn) = self.active.lock().map_err(|_| poisoned())?.get(&xid) {
            txn.auto_aborted.store(auto, Ordering::SeqCst);
        }
        self.active.lock().map_err(|_| poisoned())?.remove(&xid);
        debug!("aborted xid {} (auto={})", xid, auto);
        Ok(())
    }

    fn set_error(&self, xid: Xid, err: QuarryError) -> Result<()> {
        let mut active = self.active.lock().map_err(|_| poisoned())?;
        if let Some(txn) = active.get_mut(&xid) {
            txn.err = Some(err);
        }
        Ok(())
    }

    fn check_live(&self, xid: Xid) -> Result<()> {
        let active = self.active.lock().map_err(|_| poisoned())?;
        match active.get(&xid) {
            Some(txn) => match &txn.err {
                Some(e) => Err(clone_err(e)),
                None => Ok(()),
            },
            None => Ok(()), // xid already terminated; caller's prior op already surfaced any error
        }
    }

    fn in_snapshot(&self, xid: Xid, other: Xid) -> Result<bool> {
        let active = self.active.lock().map_err(|_| poisoned())?;
        Ok(active.get(&xid).map(|t| t.snapshot.contains(&other)).unwrap_or(false))
    }

    fn isolation_of(&self, xid: Xid) -> Result<IsolationLevel> {
        let active = self.active.lock().map_err(|_| poisoned())?;
        Ok(active.get(&xid).map(|t| t.isolation).unwrap_or(IsolationLevel::ReadCommitted))
    }

    fn committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        self.xid_store.is_committed(xid)
    }

    /// Visibility per the reader's isolation level (READ_COMMITTED or
    /// REPEATABLE_READ).
    fn is_visible(&self, reader: Xid, xmin: Xid, xmax: Xid) -> Result<bool> {
        if xmin == reader && xmax == 0 {
            return Ok(true);
        }

        match self.isolation_of(reader)? {
            IsolationLevel::ReadCommitted => {
                if !self.committed(xmin)? {
                    return Ok(false);
                }
                if xmax == 0 {
                    return Ok(true);
                }
                if xmax == reader {
                    return Ok(false);
                }
                Ok(!self.committed(xmax)?)
            }
            IsolationLevel::RepeatableRead => {
                if !self.committed(xmin)? {
                    return Ok(false);
                }
                if xmin >= reader {
                    return Ok(false);
                }
                if self.in_snapshot(reader, xmin)? {
                    return Ok(false);
                }
                if xmax == 0 {
                    return Ok(true);
                }
                if xmax == reader {
                    return Ok(false);
                }
                if !self.committed(xmax)? {
                    return Ok(true);
                }
                if xmax > reader {
                    return Ok(true);
                }
                Ok(self.in_snapshot(reader, xmax)?)
            }
        }
    }
}

impl VersionManager {
    /// Version skip (REPEATABLE_READ only): a second write by `xid` must be
    /// refused, not merely treated as invisible, when the holder that set
    /// `xmax` has since committed a version `xid` cannot see -- committing
    /// `xid` on top of it would silently discard that committed write. Under
    /// READ_COMMITTED this case never arises: a committed `xmax` already
    /// makes the row invisible and ordinary visibility handles the conflict.
    fn is_version_skip(&self, xid: Xid, xmax: Xid) -> Result<bool> {
        if xmax == 0 || self.isolation_of(xid)? != IsolationLevel::RepeatableRead {
            return Ok(false);
        }
        if !self.committed(xmax)? {
            return Ok(false);
        }
        Ok(xmax > xid || self.in_snapshot(xid, xmax)?)
    }
}

fn clone_err(e: &QuarryError) -> QuarryError {
    // QuarryError does not derive Clone (it wraps io::Error); reconstruct an
    // equivalent variant for re-surfacing a previously recorded failure.
    match e {
        QuarryError::ConcurrentUpdate => QuarryError::ConcurrentUpdate,
        QuarryError::Deadlock => QuarryError::Deadlock,
        other => QuarryError::Internal(other.to_string()),
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("version manager mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Pager;
    use crate::wal::Wal;
    use tempfile::tempdir;

    fn setup() -> (VersionManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::create(dir.path().join("t.db"), 32).unwrap());
        let wal = Arc::new(Wal::create(dir.path().join("t.log")).unwrap());
        let items = Arc::new(DataItemManager::new(pager, wal, 32).unwrap());
        let xid_store = Arc::new(XidStore::create(dir.path().join("t.xid")).unwrap());
        (VersionManager::new(xid_store, items), dir)
    }

    #[test]
    fn insert_then_read_same_txn_is_visible() {
        let (vm, _dir) = setup();
        let xid = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(xid, b"row").unwrap();
        assert_eq!(vm.read(xid, uid).unwrap(), Some(b"row".to_vec()));
        vm.commit(xid).unwrap();
    }

    #[test]
    fn uncommitted_insert_is_invisible_to_other_read_committed_txn() {
        let (vm, _dir) = setup();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(t1, b"row").unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), None);

        vm.commit(t1).unwrap();
        assert_eq!(vm.read(t2, uid).unwrap(), Some(b"row".to_vec()));
        vm.commit(t2).unwrap();
    }

    #[test]
    fn repeatable_read_snapshot_excludes_later_commit() {
        let (vm, _dir) = setup();
        let t1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        let uid = vm.insert(t1, b"row").unwrap();

        let t2 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        vm.commit(t1).unwrap();

        // t2's snapshot was taken while t1 was still active, so t1's insert
        // stays invisible for the rest of t2's lifetime.
        assert_eq!(vm.read(t2, uid).unwrap(), None);
        vm.commit(t2).unwrap();
    }

    #[test]
    fn delete_after_aborted_deleter_is_not_a_conflict() {
        let (vm, _dir) = setup();
        let t0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(t0, b"row").unwrap();
        vm.commit(t0).unwrap();

        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, uid).unwrap());
        vm.abort(t1).unwrap();

        // t1's xmax write is never visible once t1 aborted, so t2 must be
        // able to delete the row itself rather than seeing a conflict.
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t2, uid).unwrap());
        vm.commit(t2).unwrap();
    }

    #[test]
    fn repeatable_read_version_skip_rejects_delete_past_snapshot() {
        let (vm, _dir) = setup();
        let t0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(t0, b"row").unwrap();
        vm.commit(t0).unwrap();

        let t1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();

        // A concurrent READ_COMMITTED transaction deletes and commits the
        // same row while t1's snapshot predates it.
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t2, uid).unwrap());
        vm.commit(t2).unwrap();

        // t1 still finds the row visible under its own snapshot reasoning
        // up to the lock wait, but the version-skip check must refuse the
        // write rather than silently clobbering t2's committed delete.
        let result = vm.delete(t1, uid);
        assert!(matches!(result, Err(QuarryError::ConcurrentUpdate)));
    }

    #[test]
    fn second_delete_after_commit_sees_concurrent_update() {
        let (vm, _dir) = setup();
        let t0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(t0, b"row").unwrap();
        vm.commit(t0).unwrap();

        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(t1, uid).unwrap());
        vm.commit(t1).unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        // Already deleted and committed: no longer visible, so delete
        // reports false rather than blocking.
        assert!(!vm.delete(t2, uid).unwrap());
        vm.commit(t2).unwrap();
    }
}
