//! Transaction status store (the `.xid` file).
//!
//! Layout: an 8-byte big-endian counter at offset 0, followed by one status
//! byte per allocated xid at `8 + (xid - 1)`. `xid == 0` is the super
//! transaction and always reads as committed without touching the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{QuarryError, Result};
use crate::types::{Xid, TxnStatus, SUPER_XID};

const HEADER_LEN: u64 = 8;

struct Inner {
    file: File,
    counter: u64,
}

/// Durable per-transaction status store backing MVCC visibility checks.
pub struct XidStore {
    mu: Mutex<Inner>,
}

impl XidStore {
    /// Create a fresh `.xid` file. Fails if one already exists at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(QuarryError::FileExists(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| QuarryError::FileCannotRw(path.display().to_string()))?;

        let mut header = [0u8; HEADER_LEN as usize];
        BigEndian::write_u64(&mut header, 0);
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            mu: Mutex::new(Inner { file, counter: 0 }),
        })
    }

    /// Open an existing `.xid` file, verifying its length matches its header
    /// counter.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(QuarryError::FileNotExists(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| QuarryError::FileCannotRw(path.display().to_string()))?;

        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(QuarryError::BadXidFile("file shorter than header".into()));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let counter = BigEndian::read_u64(&header);

        if len != HEADER_LEN + counter {
            return Err(QuarryError::BadXidFile(format!(
                "file length {} does not match counter {}",
                len, counter
            )));
        }

        Ok(Self {
            mu: Mutex::new(Inner { file, counter }),
        })
    }

    /// Allocate a new xid, durably marking it active before returning.
    pub fn begin(&self) -> Result<Xid> {
        let mut inner = self.mu.lock().map_err(|_| poisoned())?;
        let xid = inner.counter + 1;

        let status_pos = HEADER_LEN + (xid - 1);
        inner.file.seek(SeekFrom::Start(status_pos))?;
        inner.file.write_all(&[TxnStatus::Active.to_byte()])?;
        inner.file.sync_all()?;

        inner.counter = xid;
        let mut header = [0u8; HEADER_LEN as usize];
        BigEndian::write_u64(&mut header, inner.counter);
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&header)?;
        inner.file.sync_all()?;

        Ok(xid)
    }

    /// Durably record `xid` as committed.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.set_status(xid, TxnStatus::Committed)
    }

    /// Durably record `xid` as aborted.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.set_status(xid, TxnStatus::Aborted)
    }

    fn set_status(&self, xid: Xid, status: TxnStatus) -> Result<()> {
        let mut inner = self.mu.lock().map_err(|_| poisoned())?;
        let status_pos = HEADER_LEN + (xid - 1);
        inner.file.seek(SeekFrom::Start(status_pos))?;
        inner.file.write_all(&[status.to_byte()])?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Look up the status of `xid`. The super transaction always reads as
    /// committed.
    pub fn status(&self, xid: Xid) -> Result<TxnStatus> {
        if xid == SUPER_XID {
            return Ok(TxnStatus::Committed);
        }
        let mut inner = self.mu.lock().map_err(|_| poisoned())?;
        let status_pos = HEADER_LEN + (xid - 1);
        let mut byte = [0u8; 1];
        inner.file.seek(SeekFrom::Start(status_pos))?;
        inner.file.read_exact(&mut byte)?;
        TxnStatus::from_byte(byte[0])
            .ok_or_else(|| QuarryError::BadXidFile(format!("unrecognized status byte for xid {}", xid)))
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == TxnStatus::Committed)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == TxnStatus::Active)
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("xid store mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn begin_commit_abort_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.xid");
        let store = XidStore::create(&path).unwrap();

        let x1 = store.begin().unwrap();
        let x2 = store.begin().unwrap();
        assert_eq!(x1, 1);
        assert_eq!(x2, 2);

        assert!(store.is_active(x1).unwrap());
        store.commit(x1).unwrap();
        assert!(store.is_committed(x1).unwrap());

        store.abort(x2).unwrap();
        assert_eq!(store.status(x2).unwrap(), TxnStatus::Aborted);

        assert!(store.is_committed(SUPER_XID).unwrap());
    }

    #[test]
    fn reopen_validates_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.xid");
        {
            let store = XidStore::create(&path).unwrap();
            store.begin().unwrap();
        }
        let reopened = XidStore::open(&path).unwrap();
        assert!(reopened.is_active(1).unwrap());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.xid");
        assert!(matches!(XidStore::open(&path), Err(QuarryError::FileNotExists(_))));
    }
}
