//! Crash recovery: replay the write-ahead log against the page store before
//! the engine serves traffic.
//!
//! Two passes: a forward redo of every entry belonging to a committed
//! transaction, then a reverse undo of every entry belonging to a
//! transaction that was still active when the process died. Undone
//! transactions are then marked aborted so they never appear live again.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::data_item::DataItemManager;
use crate::error::Result;
use crate::log_entry::LogEntry;
use crate::types::Xid;
use crate::wal::Wal;
use crate::xid_store::XidStore;

/// Scan the log and reconcile the page store with the transaction status
/// store. Must run after opening the log/xid/page files and before any
/// client transaction begins.
pub fn recover(wal: &Wal, xid_store: &Arc<XidStore>, items: &Arc<DataItemManager>) -> Result<()> {
    let raw_entries = wal.iterate()?;
    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in &raw_entries {
        entries.push(LogEntry::decode(raw)?);
    }

    info!("recovery: replaying {} log entries", entries.len());

    redo_committed(&entries, xid_store, items)?;
    undo_active(&entries, xid_store, items)?;

    info!("recovery: complete");
    Ok(())
}

fn redo_committed(entries: &[LogEntry], xid_store: &XidStore, items: &DataItemManager) -> Result<()> {
    for entry in entries {
        if !xid_store.is_committed(entry.xid())? {
            continue;
        }
        match entry {
            LogEntry::Insert { page_num, offset, item, .. } => {
                items.redo_insert(*page_num, *offset, item)?;
            }
            LogEntry::Update { uid, new, .. } => {
                items.redo_update(*uid, new)?;
            }
        }
    }
    Ok(())
}

fn undo_active(entries: &[LogEntry], xid_store: &XidStore, items: &DataItemManager) -> Result<()> {
    let mut by_xid: HashMap<Xid, Vec<&LogEntry>> = HashMap::new();
    for entry in entries {
        if xid_store.is_active(entry.xid())? {
            by_xid.entry(entry.xid()).or_default().push(entry);
        }
    }

    for (xid, mut xid_entries) in by_xid {
        xid_entries.reverse();
        for entry in xid_entries {
            match entry {
                LogEntry::Update { uid, old, .. } => {
                    items.redo_update(*uid, old)?;
                }
                LogEntry::Insert { page_num, offset, .. } => {
                    let uid = crate::types::make_uid(*page_num, *offset);
                    items.redo_invalidate(uid)?;
                }
            }
        }
        xid_store.abort(xid)?;
        info!("recovery: marked active xid {} aborted", xid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::LogEntry;
    use crate::pager::Pager;
    use crate::types::make_uid;
    use tempfile::tempdir;

    #[test]
    fn redoes_committed_insert_not_yet_flushed_to_page() {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::create(dir.path().join("t.db"), 32).unwrap());
        let wal = Wal::create(dir.path().join("t.log")).unwrap();
        let xid_store = Arc::new(XidStore::create(dir.path().join("t.xid")).unwrap());
        let items = Arc::new(DataItemManager::new(pager.clone(), Arc::new(Wal::create(dir.path().join("t2.log")).unwrap()), 32).unwrap());

        let xid = xid_store.begin().unwrap();
        xid_store.commit(xid).unwrap();

        // Build an insert frame by hand (as insert() would) and log it, but
        // never write it to the page -- simulating a crash after the log
        // force but before the page flush.
        let mut frame = Vec::new();
        frame.push(0u8); // valid
        frame.extend_from_slice(&5u16.to_be_bytes());
        frame.extend_from_slice(b"hello");

        let init = crate::page::PageInner::new(0);
        let page_num = pager.new_page(&init).unwrap();
        let offset = 2u16;
        wal.append(&LogEntry::encode_insert(xid, page_num, offset, &frame)).unwrap();

        recover(&wal, &xid_store, &items).unwrap();

        let uid = make_uid(page_num, offset);
        let item = items.acquire(uid).unwrap();
        assert!(item.is_valid());
        assert_eq!(item.payload(), b"hello");
        items.release(uid).unwrap();
    }
}
