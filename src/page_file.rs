//! Raw paged file I/O for the `.db` store file.
//!
//! All positioning and transfer for one operation happens under a single
//! file mutex, keeping each seek+read/seek+write atomic relative to
//! concurrent flushes and loads.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Pgno, Result, PAGE_SIZE};

pub const DB_SUFFIX: &str = ".db";

fn db_path(base: &Path) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(DB_SUFFIX);
    PathBuf::from(p)
}

#[derive(Debug)]
pub struct PageFile {
    file: Mutex<File>,
    /// Highest allocated page number; pages are 1-based.
    page_count: AtomicU32,
}

impl PageFile {
    pub fn create(base: &Path) -> Result<Self> {
        let path = db_path(base);
        if path.exists() {
            return Err(Error::StoreExists);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            page_count: AtomicU32::new(0),
        })
    }

    pub fn open(base: &Path) -> Result<Self> {
        let path = db_path(base);
        if !path.exists() {
            return Err(Error::StoreMissing);
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            page_count: AtomicU32::new((len / PAGE_SIZE as u64) as u32),
        })
    }

    fn page_offset(pgno: Pgno) -> u64 {
        (pgno as u64 - 1) * PAGE_SIZE as u64
    }

    /// Reads one page-sized block; a short read (page allocated but never
    /// flushed before a crash) is zero-filled.
    pub fn read_page(&self, pgno: Pgno) -> Result<Box<[u8]>> {
        let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(pgno)))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(buf)
    }

    /// Writes one page and forces it to disk.
    pub fn write_page(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(pgno)))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reserves the next page number.
    pub fn allocate(&self) -> Pgno {
        self.page_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn page_count(&self) -> Pgno {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Shrinks the file to `max_pgno` pages. Recovery only: discards any
    /// page grown past what the log describes.
    pub fn truncate(&self, max_pgno: Pgno) -> Result<()> {
        let file = self.file.lock();
        file.set_len(max_pgno as u64 * PAGE_SIZE as u64)?;
        self.page_count.store(max_pgno, Ordering::SeqCst);
        debug!(max_pgno, "page file truncated");
        Ok(())
    }
}
