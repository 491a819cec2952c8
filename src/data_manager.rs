//! Data manager: uid-addressed item storage over the page cache, with
//! write-ahead logging and the free-space index.
//!
//! Ordering rule for every mutation: the log record is durable before the
//! page byte changes. A logged-but-unapplied write is repaired by redo; an
//! applied-but-unlogged write cannot be repaired at all.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CacheSource, RefCache};
use crate::data_item::{self, DataItem, ItemWriteGuard};
use crate::page::{meta, record, Page};
use crate::page_cache::PageCache;
use crate::page_index::PageIndex;
use crate::recovery;
use crate::tm::TransactionManager;
use crate::wal::Wal;
use crate::{addr_from_uid, uid_from_addr, Error, Result, Uid, Xid};

/// How many fresh pages to allocate before giving up on placing an insert.
const INSERT_RETRIES: usize = 5;

struct ItemBacking {
    pages: Arc<PageCache>,
}

impl CacheSource for ItemBacking {
    type Item = DataItem;

    /// Pins the item's page for as long as the item is cached; the pin is
    /// dropped on eviction, which is also when a dirtied page hits disk.
    fn load(&self, uid: u64) -> Result<Arc<DataItem>> {
        let (pgno, offset) = addr_from_uid(uid);
        let page = self.pages.get_page(pgno)?;
        match DataItem::parse(Arc::clone(&page), offset, uid) {
            Ok(item) => Ok(Arc::new(item)),
            Err(e) => {
                self.pages.release(&page)?;
                Err(e)
            }
        }
    }

    fn evict(&self, item: Arc<DataItem>) -> Result<()> {
        self.pages.release(item.page())
    }
}

pub struct DataManager {
    tm: Arc<TransactionManager>,
    pages: Arc<PageCache>,
    wal: Wal,
    index: PageIndex,
    items: RefCache<ItemBacking>,
    /// Metadata page, pinned for the whole session.
    page_one: Mutex<Option<Arc<Page>>>,
}

impl DataManager {
    pub fn create(base: &Path, memory: usize, tm: Arc<TransactionManager>) -> Result<Arc<Self>> {
        let pages = Arc::new(PageCache::create(base, memory)?);
        let wal = Wal::create(base)?;
        let dm = Self::assemble(tm, pages, wal);
        dm.init_page_one()?;
        Ok(dm)
    }

    pub fn open(base: &Path, memory: usize, tm: Arc<TransactionManager>) -> Result<Arc<Self>> {
        let pages = Arc::new(PageCache::open(base, memory)?);
        let wal = Wal::open(base)?;
        let dm = Self::assemble(tm, pages, wal);
        if !dm.load_page_one()? {
            recovery::recover(&dm.tm, &dm.wal, &dm.pages)?;
        }
        dm.fill_index()?;
        dm.stamp_open()?;
        Ok(dm)
    }

    fn assemble(tm: Arc<TransactionManager>, pages: Arc<PageCache>, wal: Wal) -> Arc<Self> {
        Arc::new(Self {
            tm,
            pages: Arc::clone(&pages),
            wal,
            index: PageIndex::new(),
            items: RefCache::new(ItemBacking { pages }, 0),
            page_one: Mutex::new(None),
        })
    }

    fn init_page_one(&self) -> Result<()> {
        let pgno = self.pages.new_page(&meta::init_raw())?;
        debug_assert_eq!(pgno, 1);
        let page = self.pages.get_page(pgno)?;
        *self.page_one.lock() = Some(page);
        Ok(())
    }

    /// Pins page 1 and reports whether the previous session closed cleanly.
    fn load_page_one(&self) -> Result<bool> {
        let page = self.pages.get_page(1)?;
        let clean = meta::is_clean(&page);
        *self.page_one.lock() = Some(page);
        Ok(clean)
    }

    fn stamp_open(&self) -> Result<()> {
        let page = self.page_one.lock().as_ref().map(Arc::clone);
        if let Some(page) = page {
            meta::set_open(&page);
            self.pages.flush_page(&page)?;
        }
        Ok(())
    }

    fn fill_index(&self) -> Result<()> {
        for pgno in 2..=self.pages.page_count() {
            let page = self.pages.get_page(pgno)?;
            self.index.add(pgno, record::free_space(&page));
            self.pages.release(&page)?;
        }
        Ok(())
    }

    /// Fetches the item at `uid`, or `None` if it does not exist or is
    /// marked deleted. A `Some` result holds a cache reference the caller
    /// must hand back via [`release_item`](Self::release_item).
    pub fn read(&self, uid: Uid) -> Result<Option<Arc<DataItem>>> {
        let item = match self.items.get(uid) {
            Ok(item) => item,
            Err(Error::MissingEntry) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !item.is_valid() {
            self.items.release(uid)?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    pub fn release_item(&self, uid: Uid) -> Result<()> {
        self.items.release(uid)
    }

    /// Stores `data` as a new item on behalf of `xid` and returns its uid.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let raw = data_item::wrap_raw(data);
        if raw.len() > record::MAX_FREE_SPACE {
            return Err(Error::DataTooLarge);
        }

        let mut slot = None;
        for _ in 0..INSERT_RETRIES {
            if let Some(s) = self.index.select(raw.len()) {
                slot = Some(s);
                break;
            }
            let pgno = self.pages.new_page(&record::init_raw())?;
            self.index.add(pgno, record::MAX_FREE_SPACE);
        }
        let slot = slot.ok_or(Error::Busy)?;

        let page = match self.pages.get_page(slot.pgno) {
            Ok(page) => page,
            Err(e) => {
                self.index.add(slot.pgno, slot.free_space);
                return Err(e);
            }
        };

        let result = self.append_logged(xid, &page, &raw);

        // The page goes back into the index with its current free space
        // whether or not the append went through.
        self.index.add(slot.pgno, record::free_space(&page));
        self.pages.release(&page)?;

        let offset = result?;
        let uid = uid_from_addr(slot.pgno, offset);
        debug!(xid, uid, len = data.len(), "item inserted");
        Ok(uid)
    }

    fn append_logged(&self, xid: Xid, page: &Page, raw: &[u8]) -> Result<u16> {
        let log = recovery::insert_log(xid, page.pgno(), record::fso(page), raw);
        self.wal.log(&log)?;
        Ok(record::insert(page, raw))
    }

    /// Durably records an in-place item mutation. Called while the caller
    /// still holds the item's write guard, so logged images of one item
    /// never interleave.
    pub fn log_update(&self, xid: Xid, item: &DataItem, guard: &ItemWriteGuard<'_>) -> Result<()> {
        let log = recovery::update_log(xid, item.uid(), guard.old_raw(), &guard.new_raw());
        self.wal.log(&log)
    }

    /// Flushes everything and writes the clean-close stamp. The store must
    /// not be used afterwards.
    pub fn close(&self) -> Result<()> {
        self.items.close()?;
        if let Some(page) = self.page_one.lock().take() {
            meta::set_close(&page);
            self.pages.release(&page)?;
        }
        self.pages.close()
    }
}
