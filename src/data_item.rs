//! Data items: page-resident, independently lockable byte ranges.
//!
//! On-page layout: `[valid: u8][size: u16 BE][data]`. An item never copies
//! page bytes; it holds the page reference plus its range, and mutation
//! goes through the before/after protocol: `before()` takes the item's
//! write lock and snapshots the old image, the mutation happens through
//! the guard, and `after()` (driven by the data manager) logs old/new
//! while the lock is still held, so no two logged mutations of one item
//! can interleave.

use std::sync::Arc;

use bytes::BufMut;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::page::Page;
use crate::{Error, Result, Uid};

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
pub const OF_DATA: usize = 3;

const RAW_VALID: u8 = 0;
const RAW_INVALID: u8 = 1;

/// Frames a payload as item bytes ready for page insertion.
pub fn wrap_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OF_DATA + data.len());
    raw.put_u8(RAW_VALID);
    raw.put_u16(data.len() as u16);
    raw.put_slice(data);
    raw
}

/// Marks a raw item image as logically deleted. Used by insert-undo.
pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = RAW_INVALID;
}

pub struct DataItem {
    uid: Uid,
    page: Arc<Page>,
    start: usize,
    /// Whole item length on the page, header included.
    len: usize,
    lock: RwLock<()>,
}

impl DataItem {
    /// Overlays the item at `offset` on `page`, reading its size header.
    pub fn parse(page: Arc<Page>, offset: u16, uid: Uid) -> Result<Self> {
        let start = offset as usize;
        let buf = page.data();
        if start + OF_DATA > buf.len() {
            return Err(Error::MissingEntry);
        }
        let size = u16::from_be_bytes([buf[start + OF_SIZE], buf[start + OF_SIZE + 1]]) as usize;
        let len = OF_DATA + size;
        if start + len > buf.len() {
            return Err(Error::MissingEntry);
        }
        drop(buf);
        Ok(Self {
            uid,
            page,
            start,
            len,
            lock: RwLock::new(()),
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn is_valid(&self) -> bool {
        self.page.data()[self.start + OF_VALID] == RAW_VALID
    }

    /// Runs `f` over the item's payload under the item read lock.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _r = self.lock.read();
        let buf = self.page.data();
        f(&buf[self.start + OF_DATA..self.start + self.len])
    }

    /// Copies the payload out under the item read lock.
    pub fn data(&self) -> Vec<u8> {
        self.with_data(|d| d.to_vec())
    }

    /// Starts a logged mutation: takes the write lock, marks the page
    /// dirty and snapshots the old image for rollback/logging.
    pub fn before(&self) -> ItemWriteGuard<'_> {
        let guard = self.lock.write();
        self.page.mark_dirty();
        let old = {
            let buf = self.page.data();
            buf[self.start..self.start + self.len].to_vec()
        };
        ItemWriteGuard {
            item: self,
            old,
            _lock: guard,
        }
    }
}

/// Exclusive mutation handle returned by [`DataItem::before`]. Dropping it
/// releases the item's write lock; the data manager logs old/new bytes
/// through it before that happens.
pub struct ItemWriteGuard<'a> {
    item: &'a DataItem,
    old: Vec<u8>,
    _lock: RwLockWriteGuard<'a, ()>,
}

impl ItemWriteGuard<'_> {
    /// Overwrites payload bytes at `offset` within the item's data region.
    pub fn write_data_at(&self, offset: usize, bytes: &[u8]) {
        let item = self.item;
        let mut buf = item.page.data();
        let at = item.start + OF_DATA + offset;
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Old image of the whole item, header included.
    pub fn old_raw(&self) -> &[u8] {
        &self.old
    }

    /// Current image of the whole item, header included.
    pub fn new_raw(&self) -> Vec<u8> {
        let item = self.item;
        let buf = item.page.data();
        buf[item.start..item.start + item.len].to_vec()
    }

    /// Discards the attempted change: restores the old image and releases
    /// the write lock without logging anything.
    pub fn un_before(self) {
        let item = self.item;
        let mut buf = item.page.data();
        buf[item.start..item.start + item.len].copy_from_slice(&self.old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::record;
    use crate::uid_from_addr;

    fn item_on_page(data: &[u8]) -> (Arc<Page>, DataItem) {
        let page = Arc::new(Page::new(2, record::init_raw()));
        let raw = wrap_raw(data);
        let offset = record::insert(&page, &raw);
        let uid = uid_from_addr(2, offset);
        let item = DataItem::parse(Arc::clone(&page), offset, uid).unwrap();
        (page, item)
    }

    #[test]
    fn parse_reads_the_framed_payload() {
        let (_page, item) = item_on_page(b"hello item");
        assert!(item.is_valid());
        assert_eq!(item.data(), b"hello item");
    }

    #[test]
    fn guard_mutation_is_visible_and_logged_images_differ() {
        let (_page, item) = item_on_page(b"aaaa");
        let guard = item.before();
        guard.write_data_at(0, b"bbbb");
        assert_ne!(guard.old_raw(), guard.new_raw().as_slice());
        drop(guard);
        assert_eq!(item.data(), b"bbbb");
    }

    #[test]
    fn un_before_restores_the_old_image() {
        let (_page, item) = item_on_page(b"keep");
        let guard = item.before();
        guard.write_data_at(0, b"lose");
        guard.un_before();
        assert_eq!(item.data(), b"keep");
    }

    #[test]
    fn invalidated_raw_parses_as_logically_deleted() {
        let (page, item) = item_on_page(b"gone");
        {
            let mut buf = page.data();
            let start = item.start;
            set_raw_invalid(&mut buf[start..]);
        }
        assert!(!item.is_valid());
    }
}
