//! The write-ahead log.
//!
//! File layout: `[xchecksum: i32 BE][record...]` where each record is
//! `[size: u32 BE][checksum: i32 BE][payload]`. The per-record checksum is
//! the seeded multiplicative hash of the payload; the file header is the
//! same hash rolled over every wrapped record in order. The header is
//! rewritten (and forced) only after its record is durable, so at open a
//! record the header does not yet cover is recognized and truncated away;
//! that is the normal crash-mid-append path, not an error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BufMut;
use parking_lot::Mutex;
use tracing::warn;

use crate::{failpoint, Error, Result};

pub const LOG_SUFFIX: &str = ".log";

const SEED: i32 = 13331;

/// Crash-injection site between the record append and the header roll.
pub const CRASH_BEFORE_HEADER: &str = "wal.append.before_header";

const OF_SIZE: u64 = 0;
const OF_CHECKSUM: u64 = OF_SIZE + 4;
const OF_DATA: u64 = OF_CHECKSUM + 4;

fn log_path(base: &Path) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(LOG_SUFFIX);
    PathBuf::from(p)
}

/// Seeded rolling checksum, bit-exact with the historical signed-byte
/// wrapping-i32 arithmetic.
fn checksum(mut acc: i32, data: &[u8]) -> i32 {
    for &b in data {
        acc = acc.wrapping_mul(SEED).wrapping_add(b as i8 as i32);
    }
    acc
}

struct Inner {
    file: File,
    /// Forward-iteration cursor, positioned just past the header.
    pos: u64,
    file_size: u64,
    xchecksum: i32,
}

impl Inner {
    /// Reads the wrapped record at the cursor, advancing past it. Returns
    /// `None` (without moving) on a torn or checksum-failing record.
    fn next_wrapped(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pos + OF_DATA >= self.file_size {
            return Ok(None);
        }
        let mut head = [0u8; 8];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut head)?;
        let size = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as u64;
        if self.pos + OF_DATA + size > self.file_size {
            return Ok(None);
        }
        let stored = i32::from_be_bytes([head[4], head[5], head[6], head[7]]);

        let mut wrapped = vec![0u8; (OF_DATA + size) as usize];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut wrapped)?;
        if checksum(0, &wrapped[OF_DATA as usize..]) != stored {
            return Ok(None);
        }
        self.pos += wrapped.len() as u64;
        Ok(Some(wrapped))
    }
}

/// Append-only checksummed log.
pub struct Wal {
    inner: Mutex<Inner>,
}

impl Wal {
    pub fn create(base: &Path) -> Result<Self> {
        let path = log_path(base);
        if path.exists() {
            return Err(Error::StoreExists);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&0i32.to_be_bytes())?;
        file.sync_data()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                pos: 4,
                file_size: 4,
                xchecksum: 0,
            }),
        })
    }

    /// Opens the log, verifying the rolling checksum and truncating any
    /// tail the header does not cover.
    pub fn open(base: &Path) -> Result<Self> {
        let path = log_path(base);
        if !path.exists() {
            return Err(Error::StoreMissing);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < 4 {
            return Err(Error::CorruptLog);
        }
        let mut header = [0u8; 4];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let xchecksum = i32::from_be_bytes(header);

        let mut inner = Inner {
            file,
            pos: 4,
            file_size,
            xchecksum,
        };

        // Find the longest record prefix whose rolling checksum matches
        // the stored header. Anything past it is a crash artifact.
        let mut acc = 0i32;
        let mut verified_end = if acc == xchecksum { Some(4u64) } else { None };
        loop {
            let Some(wrapped) = inner.next_wrapped()? else {
                break;
            };
            acc = checksum(acc, &wrapped);
            if acc == xchecksum {
                verified_end = Some(inner.pos);
            }
        }
        let Some(end) = verified_end else {
            return Err(Error::CorruptLog);
        };
        if end < inner.file_size {
            warn!(
                end,
                file_size = inner.file_size,
                "truncating torn log tail"
            );
            inner.file.set_len(end)?;
            inner.file.sync_data()?;
            inner.file_size = end;
        }
        inner.pos = 4;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Appends one payload: record first, then the rolled-forward header
    /// checksum, each forced to disk in that order.
    pub fn log(&self, data: &[u8]) -> Result<()> {
        let mut wrapped = Vec::with_capacity(OF_DATA as usize + data.len());
        wrapped.put_u32(data.len() as u32);
        wrapped.put_i32(checksum(0, data));
        wrapped.put_slice(data);

        let mut inner = self.inner.lock();
        let end = inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&wrapped)?;
        inner.file.sync_data()?;
        inner.file_size = end + wrapped.len() as u64;

        failpoint::crash_site(CRASH_BEFORE_HEADER)?;

        inner.xchecksum = checksum(inner.xchecksum, &wrapped);
        let header = inner.xchecksum.to_be_bytes();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&header)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Resets the forward iterator to the first record.
    pub fn rewind(&self) {
        self.inner.lock().pos = 4;
    }

    /// Returns the next record's payload, or `None` at the verified end of
    /// the log.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.next_wrapped()? {
            Some(wrapped) => Ok(Some(wrapped[OF_DATA as usize..].to_vec())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn drain(wal: &Wal) -> Vec<Vec<u8>> {
        wal.rewind();
        let mut out = Vec::new();
        while let Some(payload) = wal.next().unwrap() {
            out.push(payload);
        }
        out
    }

    #[test]
    fn records_replay_in_append_order() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("wal_order");
        let wal = Wal::create(&base).unwrap();

        wal.log(b"first").unwrap();
        wal.log(b"second").unwrap();
        wal.log(b"third").unwrap();
        assert_eq!(drain(&wal), vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);

        drop(wal);
        let wal = Wal::open(&base).unwrap();
        assert_eq!(drain(&wal).len(), 3);
    }

    #[test]
    fn torn_record_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("wal_torn");
        let wal = Wal::create(&base).unwrap();
        wal.log(b"keep me").unwrap();
        wal.log(b"tear me").unwrap();
        drop(wal);

        // Chop the last record mid-payload, as a crash during the append
        // write would.
        let path = log_path(&base);
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();
        drop(f);

        // The header still covers both records but only one is intact;
        // open refuses, since the covered prefix cannot be reproduced.
        assert!(matches!(Wal::open(&base), Err(Error::CorruptLog)));
    }

    #[test]
    fn unheadered_append_is_dropped_on_open() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("wal_crash");
        let wal = Wal::create(&base).unwrap();
        wal.log(b"durable").unwrap();

        // Crash between the record append and the header update.
        let armed = failpoint::arm(CRASH_BEFORE_HEADER);
        assert!(wal.log(b"lost").unwrap_err().is_fatal());
        drop(armed);
        drop(wal);

        let wal = Wal::open(&base).unwrap();
        assert_eq!(drain(&wal), vec![b"durable".to_vec()]);

        // The log keeps working after the repair.
        wal.log(b"after repair").unwrap();
        assert_eq!(drain(&wal).len(), 2);
    }

    #[test]
    fn empty_log_round_trips() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("wal_empty");
        let wal = Wal::create(&base).unwrap();
        assert!(drain(&wal).is_empty());
        drop(wal);
        let wal = Wal::open(&base).unwrap();
        assert!(drain(&wal).is_empty());
    }
}
