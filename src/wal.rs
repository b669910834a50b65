//! Write-ahead log.
//!
//! File layout: a 4-byte big-endian cumulative checksum `X` at offset 0,
//! followed by a sequence of frames `[size: 4][checksum: 4][data: size]`.
//! `X` is the polynomial fold (seed `13331`) over the concatenation of every
//! complete frame's bytes; each frame also carries its own checksum over
//! just its data, so a torn tail can be located without re-verifying the
//! whole file.
//!
//! Appends are serialized by a single mutex and forced to disk before
//! returning, mirroring the durability-first posture of a WAL that other
//! components build atomicity on top of.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use log::{info, warn};

use crate::error::{QuarryError, Result};

const SEED: i64 = 13331;
const HEADER_LEN: u64 = 4;

fn fold(mut h: i64, bytes: &[u8]) -> i64 {
    for &b in bytes {
        h = h.wrapping_mul(SEED).wrapping_add(b as i8 as i64);
    }
    h
}

fn checksum(data: &[u8]) -> i32 {
    fold(0, data) as i32
}

struct Inner {
    file: File,
    cumulative: i32,
}

/// Append-only write-ahead log with torn-tail detection and repair.
pub struct Wal {
    mu: Mutex<Inner>,
}

impl Wal {
    /// Create a fresh, empty log file.
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
        BigEndian::write_i32(&mut header, 0);
        file.write_all(&header)?;
        file.sync_all()?;

        info!("created log file {}", path.display());
        Ok(Self { mu: Mutex::new(Inner { file, cumulative: 0 }) })
    }

    /// Open an existing log file and repair any torn tail left by a crash.
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

        if file.metadata()?.len() < HEADER_LEN {
            return Err(QuarryError::BadLogFile("file shorter than header".into()));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let stored_x = BigEndian::read_i32(&header);

        let (verified_x, good_end) = verify(&mut file)?;

        if verified_x != stored_x {
            warn!(
                "log file {} has a torn tail, truncating to last good frame",
                path.display()
            );
            file.set_len(good_end)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&{
                let mut h = [0u8; HEADER_LEN as usize];
                BigEndian::write_i32(&mut h, verified_x);
                h
            })?;
            file.sync_all()?;
        }

        info!("opened log file {}", path.display());
        Ok(Self { mu: Mutex::new(Inner { file, cumulative: verified_x }) })
    }

    /// Append `data` as a new frame, forcing it to disk before returning.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.mu.lock().map_err(|_| poisoned())?;

        let entry_checksum = checksum(data);
        let mut frame = Vec::with_capacity(8 + data.len());
        let mut size_buf = [0u8; 4];
        BigEndian::write_u32(&mut size_buf, data.len() as u32);
        frame.extend_from_slice(&size_buf);
        let mut cs_buf = [0u8; 4];
        BigEndian::write_i32(&mut cs_buf, entry_checksum);
        frame.extend_from_slice(&cs_buf);
        frame.extend_from_slice(data);

        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&frame)?;

        let new_cumulative = fold(inner.cumulative as i64, &frame) as i32;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&{
            let mut h = [0u8; HEADER_LEN as usize];
            BigEndian::write_i32(&mut h, new_cumulative);
            h
        })?;
        inner.file.sync_all()?;
        inner.cumulative = new_cumulative;

        Ok(())
    }

    /// Return every verified data payload in append order.
    pub fn iterate(&self) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.mu.lock().map_err(|_| poisoned())?;
        let mut entries = Vec::new();
        inner.file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = &mut inner.file;
        loop {
            match read_frame(&mut reader)? {
                Some(data) => entries.push(data),
                None => break,
            }
        }
        Ok(entries)
    }
}

/// Re-verify the whole file and return `(recomputed X, byte offset of the
/// last good frame boundary)`.
fn verify(file: &mut File) -> Result<(i32, u64)> {
    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut cumulative: i64 = 0;
    let mut good_end = HEADER_LEN;
    loop {
        let frame_start = good_end;
        let mut size_buf = [0u8; 4];
        if file.read_exact(&mut size_buf).is_err() {
            break;
        }
        let size = BigEndian::read_u32(&size_buf) as usize;

        let mut cs_buf = [0u8; 4];
        if file.read_exact(&mut cs_buf).is_err() {
            break;
        }
        let stored_checksum = BigEndian::read_i32(&cs_buf);

        let mut data = vec![0u8; size];
        if file.read_exact(&mut data).is_err() {
            break;
        }

        if checksum(&data) != stored_checksum {
            break;
        }

        let mut frame = Vec::with_capacity(8 + size);
        frame.extend_from_slice(&size_buf);
        frame.extend_from_slice(&cs_buf);
        frame.extend_from_slice(&data);
        cumulative = fold(cumulative, &frame);

        good_end = frame_start + 8 + size as u64;
    }
    Ok((cumulative as i32, good_end))
}

fn read_frame(file: &mut File) -> Result<Option<Vec<u8>>> {
    // Insufficient bytes or a bad checksum both mark the first bad-tail
    // byte: iteration simply stops there, it never errors out.
    let mut size_buf = [0u8; 4];
    if file.read_exact(&mut size_buf).is_err() {
        return Ok(None);
    }
    let size = BigEndian::read_u32(&size_buf) as usize;

    let mut cs_buf = [0u8; 4];
    if file.read_exact(&mut cs_buf).is_err() {
        return Ok(None);
    }
    let stored_checksum = BigEndian::read_i32(&cs_buf);

    let mut data = vec![0u8; size];
    if file.read_exact(&mut data).is_err() {
        return Ok(None);
    }

    if checksum(&data) != stored_checksum {
        return Ok(None);
    }

    Ok(Some(data))
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("wal mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn append_and_iterate_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        let wal = Wal::create(&path).unwrap();

        wal.append(b"first").unwrap();
        wal.append(b"second").unwrap();

        let entries = wal.iterate().unwrap();
        assert_eq!(entries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        {
            let wal = Wal::create(&path).unwrap();
            wal.append(b"first").unwrap();
            wal.append(b"second").unwrap();
        }

        // Simulate a crash mid-write of a third frame: append a partial,
        // unchecksummed frame without updating the header.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0, 0, 0, 10, 0, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let reopened = Wal::open(&path).unwrap();
        let entries = reopened.iterate().unwrap();
        assert_eq!(entries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn iterate_stops_at_bad_checksum_instead_of_erroring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        let wal = Wal::create(&path).unwrap();

        wal.append(b"good").unwrap();
        wal.append(b"second").unwrap();

        // Corrupt the second frame's checksum in place, without reopening
        // the log (so `open()`'s repair pass never runs). `good` occupies
        // bytes 4..16 (4-byte size + 4-byte checksum + 4-byte data), so the
        // second frame's checksum sits at 20..24.
        {
            use std::io::{Seek, SeekFrom};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(20)).unwrap();
            file.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();
        }

        let entries = wal.iterate().unwrap();
        assert_eq!(entries, vec![b"good".to_vec()]);
    }
}
