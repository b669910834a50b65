//! Binary framing for the payloads carried inside write-ahead log entries.
//!
//! Two kinds of entries exist, each tagged by a leading byte:
//!
//! - **Insert**: `[0x00][xid: 8][pgno: 4][offset: 2][item: N]`
//! - **Update**: `[0x01][xid: 8][uid: 8][old_len: 4][old][new_len: 4][new]`
//!
//! Redo re-applies the "new" side of an entry; undo reapplies the "old"
//! side (or, for inserts, flips the item's valid flag).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{QuarryError, Result};
use crate::types::{PageNum, PageOffset, Uid, Xid};

const INSERT_TAG: u8 = 0x00;
const UPDATE_TAG: u8 = 0x01;

/// A decoded log entry payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Insert {
        xid: Xid,
        page_num: PageNum,
        offset: PageOffset,
        item: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl LogEntry {
    pub fn xid(&self) -> Xid {
        match self {
            LogEntry::Insert { xid, .. } => *xid,
            LogEntry::Update { xid, .. } => *xid,
        }
    }

    pub fn encode_insert(xid: Xid, page_num: PageNum, offset: PageOffset, item: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 4 + 2 + item.len());
        buf.push(INSERT_TAG);
        write_u64(&mut buf, xid);
        write_u32(&mut buf, page_num);
        write_u16(&mut buf, offset);
        buf.extend_from_slice(item);
        buf
    }

    pub fn encode_update(xid: Xid, uid: Uid, old: &[u8], new: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 4 + old.len() + 4 + new.len());
        buf.push(UPDATE_TAG);
        write_u64(&mut buf, xid);
        write_u64(&mut buf, uid);
        write_u32(&mut buf, old.len() as u32);
        buf.extend_from_slice(old);
        write_u32(&mut buf, new.len() as u32);
        buf.extend_from_slice(new);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(malformed("empty log entry"));
        }
        match data[0] {
            INSERT_TAG => {
                let mut pos = 1;
                let xid = read_u64(data, &mut pos)?;
                let page_num = read_u32(data, &mut pos)?;
                let offset = read_u16(data, &mut pos)?;
                let item = data.get(pos..).ok_or_else(|| malformed("truncated insert item"))?.to_vec();
                Ok(LogEntry::Insert { xid, page_num, offset, item })
            }
            UPDATE_TAG => {
                let mut pos = 1;
                let xid = read_u64(data, &mut pos)?;
                let uid = read_u64(data, &mut pos)?;
                let old_len = read_u32(data, &mut pos)? as usize;
                let old = take(data, &mut pos, old_len)?;
                let new_len = read_u32(data, &mut pos)? as usize;
                let new = take(data, &mut pos, new_len)?;
                Ok(LogEntry::Update { xid, uid, old, new })
            }
            other => Err(malformed(&format!("unrecognized log entry tag {}", other))),
        }
    }
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    BigEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    BigEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn write_u16(buf: &mut Vec<u8>, v: u16) {
    let mut tmp = [0u8; 2];
    BigEndian::write_u16(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64> {
    let bytes = data.get(*pos..*pos + 8).ok_or_else(|| malformed("truncated u64"))?;
    *pos += 8;
    Ok(BigEndian::read_u64(bytes))
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = data.get(*pos..*pos + 4).ok_or_else(|| malformed("truncated u32"))?;
    *pos += 4;
    Ok(BigEndian::read_u32(bytes))
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16> {
    let bytes = data.get(*pos..*pos + 2).ok_or_else(|| malformed("truncated u16"))?;
    *pos += 2;
    Ok(BigEndian::read_u16(bytes))
}

fn take(data: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>> {
    let bytes = data.get(*pos..*pos + len).ok_or_else(|| malformed("truncated field"))?;
    *pos += len;
    Ok(bytes.to_vec())
}

fn malformed(msg: &str) -> QuarryError {
    QuarryError::BadLogFile(format!("malformed log entry payload: {}", msg))
}
