//! Transaction status management.
//!
//! Every transaction has a status byte in the `.xid` file, indexed by its
//! XID. The file starts with an 8-byte big-endian counter of allocated
//! XIDs; the length invariant `8 + counter == file_len` is checked on open
//! and any violation is fatal, since transaction status is the root of all
//! durability guarantees.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Result, Xid};

/// Reserved bypass transaction, always reported committed. Used for
/// non-transactional bootstrap writes such as page metadata.
pub const SUPER_XID: Xid = 0;

pub const XID_SUFFIX: &str = ".xid";

const XID_HEADER_LEN: u64 = 8;
const XID_FIELD_SIZE: u64 = 1;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

fn xid_path(base: &Path) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(XID_SUFFIX);
    PathBuf::from(p)
}

#[derive(Debug)]
struct Inner {
    file: File,
    counter: u64,
}

/// Durable, append-only XID status table. Shared across worker threads
/// behind an `Arc`.
#[derive(Debug)]
pub struct TransactionManager {
    inner: Mutex<Inner>,
}

impl TransactionManager {
    /// Creates a fresh status file with a zeroed counter.
    pub fn create(base: &Path) -> Result<Self> {
        let path = xid_path(base);
        if path.exists() {
            return Err(Error::StoreExists);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&0u64.to_be_bytes())?;
        file.sync_data()?;
        Ok(Self {
            inner: Mutex::new(Inner { file, counter: 0 }),
        })
    }

    /// Opens an existing status file, validating the length invariant.
    pub fn open(base: &Path) -> Result<Self> {
        let path = xid_path(base);
        if !path.exists() {
            return Err(Error::StoreMissing);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < XID_HEADER_LEN {
            return Err(Error::CorruptXidFile);
        }
        let mut header = [0u8; XID_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let counter = u64::from_be_bytes(header);
        if XID_HEADER_LEN + counter * XID_FIELD_SIZE != file_len {
            return Err(Error::CorruptXidFile);
        }

        Ok(Self {
            inner: Mutex::new(Inner { file, counter }),
        })
    }

    fn status_position(xid: Xid) -> u64 {
        XID_HEADER_LEN + (xid - 1) * XID_FIELD_SIZE
    }

    fn write_status(file: &mut File, xid: Xid, status: u8) -> Result<()> {
        file.seek(SeekFrom::Start(Self::status_position(xid)))?;
        file.write_all(&[status])?;
        file.sync_data()?;
        Ok(())
    }

    /// Allocates the next XID and durably marks it active. The status byte
    /// is forced to disk before the counter, so a crash between the two
    /// leaves a status byte the counter does not yet claim; recovery then
    /// treats the XID as never allocated.
    pub fn begin(&self) -> Result<Xid> {
        let mut inner = self.inner.lock();
        let xid = inner.counter + 1;
        Self::write_status(&mut inner.file, xid, STATUS_ACTIVE)?;

        inner.counter += 1;
        let counter = inner.counter;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&counter.to_be_bytes())?;
        inner.file.sync_data()?;

        debug!(xid, "transaction begun");
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_status(&mut inner.file, xid, STATUS_COMMITTED)?;
        debug!(xid, "transaction committed");
        Ok(())
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_status(&mut inner.file, xid, STATUS_ABORTED)?;
        debug!(xid, "transaction aborted");
        Ok(())
    }

    fn check_status(&self, xid: Xid, status: u8) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner
            .file
            .seek(SeekFrom::Start(Self::status_position(xid)))?;
        let mut byte = [0u8; 1];
        inner.file.read_exact(&mut byte)?;
        Ok(byte[0] == status)
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check_status(xid, STATUS_ACTIVE)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        self.check_status(xid, STATUS_COMMITTED)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        self.check_status(xid, STATUS_ABORTED)
    }
}
