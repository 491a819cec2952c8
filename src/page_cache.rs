//! Page cache: the first instantiation of the generic reference-counted
//! cache, backed by the paged store file.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheSource, RefCache};
use crate::page::Page;
use crate::page_file::PageFile;
use crate::{Error, Pgno, Result, PAGE_SIZE};

/// Reject memory budgets below this many pages.
const MIN_CACHE_PAGES: usize = 10;

#[derive(Debug)]
pub struct PageBacking {
    file: Arc<PageFile>,
}

impl CacheSource for PageBacking {
    type Item = Page;

    fn load(&self, key: u64) -> Result<Arc<Page>> {
        let pgno = key as Pgno;
        let data = self.file.read_page(pgno)?;
        Ok(Arc::new(Page::new(pgno, data)))
    }

    /// Write-back on eviction: dirty pages hit disk exactly when their
    /// last reference is released.
    fn evict(&self, page: Arc<Page>) -> Result<()> {
        if page.is_dirty() {
            self.file.write_page(page.pgno(), &page.snapshot())?;
            page.clear_dirty();
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PageCache {
    file: Arc<PageFile>,
    cache: RefCache<PageBacking>,
}

impl PageCache {
    pub fn create(base: &Path, memory: usize) -> Result<Self> {
        Self::with_file(Arc::new(PageFile::create(base)?), memory)
    }

    pub fn open(base: &Path, memory: usize) -> Result<Self> {
        Self::with_file(Arc::new(PageFile::open(base)?), memory)
    }

    fn with_file(file: Arc<PageFile>, memory: usize) -> Result<Self> {
        let capacity = memory / PAGE_SIZE;
        if capacity < MIN_CACHE_PAGES {
            return Err(Error::MemTooSmall);
        }
        let cache = RefCache::new(
            PageBacking {
                file: Arc::clone(&file),
            },
            capacity,
        );
        Ok(Self { file, cache })
    }

    /// Allocates a page, writes its initial contents and forces them to
    /// disk immediately. New pages are never cached dirty.
    pub fn new_page(&self, init: &[u8]) -> Result<Pgno> {
        let pgno = self.file.allocate();
        self.file.write_page(pgno, init)?;
        debug!(pgno, "page allocated");
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: Pgno) -> Result<Arc<Page>> {
        self.cache.get(pgno as u64)
    }

    pub fn release(&self, page: &Page) -> Result<()> {
        self.cache.release(page.pgno() as u64)
    }

    /// Immediate flush, bypassing eviction. Used for the metadata page.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        self.file.write_page(page.pgno(), &page.snapshot())?;
        page.clear_dirty();
        Ok(())
    }

    pub fn truncate(&self, max_pgno: Pgno) -> Result<()> {
        self.file.truncate(max_pgno)
    }

    pub fn page_count(&self) -> Pgno {
        self.file.page_count()
    }

    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}
