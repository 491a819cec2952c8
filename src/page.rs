//! In-memory page and the two on-disk page layouts.
//!
//! Page 1 of every store is metadata (`meta`): a random 8-byte stamp is
//! written at offset 100 on open and copied to offset 108 on clean close,
//! so a mismatch at the next open means the previous session crashed.
//! Every other page is a record page (`record`): a 2-byte big-endian
//! free-space offset followed by densely packed records, free space always
//! being the suffix `[fso, PAGE_SIZE)`.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::{Pgno, PAGE_SIZE};

#[derive(Debug)]
pub struct Page {
    pgno: Pgno,
    buf: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(pgno: Pgno, data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            pgno,
            buf: Mutex::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    /// Locks the page buffer. Holders keep the guard only for short,
    /// in-memory byte manipulation; never across I/O or other locks.
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.buf.lock()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Copies the page contents out for a flush, so file I/O does not run
    /// under the buffer lock.
    pub fn snapshot(&self) -> Box<[u8]> {
        self.buf.lock().clone()
    }
}

/// Metadata-page (page 1) layout: the open/close stamp pair.
pub mod meta {
    use super::*;
    use rand::RngCore;

    const OF_STAMP: usize = 100;
    const STAMP_LEN: usize = 8;

    pub fn init_raw() -> Box<[u8]> {
        let mut raw = vec![0u8; PAGE_SIZE].into_boxed_slice();
        write_open_stamp(&mut raw);
        raw
    }

    fn write_open_stamp(raw: &mut [u8]) {
        let mut stamp = [0u8; STAMP_LEN];
        rand::thread_rng().fill_bytes(&mut stamp);
        raw[OF_STAMP..OF_STAMP + STAMP_LEN].copy_from_slice(&stamp);
    }

    /// Stamps the page with fresh random open bytes. Called on every open
    /// so that only a subsequent clean close makes the pair match again.
    pub fn set_open(page: &Page) {
        page.mark_dirty();
        write_open_stamp(&mut page.data());
    }

    /// Copies the open stamp into the close slot; the matching pair marks
    /// a clean shutdown.
    pub fn set_close(page: &Page) {
        page.mark_dirty();
        let mut buf = page.data();
        let (open_half, close_half) = buf[OF_STAMP..OF_STAMP + 2 * STAMP_LEN].split_at_mut(STAMP_LEN);
        close_half.copy_from_slice(open_half);
    }

    /// True if the previous session closed cleanly.
    pub fn is_clean(page: &Page) -> bool {
        let buf = page.data();
        buf[OF_STAMP..OF_STAMP + STAMP_LEN]
            == buf[OF_STAMP + STAMP_LEN..OF_STAMP + 2 * STAMP_LEN]
    }
}

/// Record-page layout: `[fso: u16 BE][records...]`.
pub mod record {
    use super::*;

    const OF_FSO: usize = 0;
    const OF_DATA: usize = 2;

    /// Largest record (including item framing) a page can hold.
    pub const MAX_FREE_SPACE: usize = PAGE_SIZE - OF_DATA;

    pub fn init_raw() -> Box<[u8]> {
        let mut raw = vec![0u8; PAGE_SIZE].into_boxed_slice();
        set_fso(&mut raw, OF_DATA as u16);
        raw
    }

    fn set_fso(raw: &mut [u8], fso: u16) {
        raw[OF_FSO..OF_DATA].copy_from_slice(&fso.to_be_bytes());
    }

    fn get_fso(raw: &[u8]) -> u16 {
        u16::from_be_bytes([raw[OF_FSO], raw[OF_FSO + 1]])
    }

    pub fn fso(page: &Page) -> u16 {
        get_fso(&page.data())
    }

    pub fn free_space(page: &Page) -> usize {
        PAGE_SIZE - fso(page) as usize
    }

    /// Appends `raw` at the free-space offset and advances it. The caller
    /// guarantees the page has room (single-writer via the free-space
    /// index checkout).
    pub fn insert(page: &Page, raw: &[u8]) -> u16 {
        page.mark_dirty();
        let mut buf = page.data();
        let offset = get_fso(&buf);
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        set_fso(&mut buf, offset + raw.len() as u16);
        offset
    }

    /// Redo/undo path: writes `raw` at a known offset, extending the
    /// free-space offset if the write lands past it.
    pub fn recover_insert(page: &Page, raw: &[u8], offset: u16) {
        page.mark_dirty();
        let mut buf = page.data();
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as u16;
        if get_fso(&buf) < end {
            set_fso(&mut buf, end);
        }
    }

    /// Redo/undo path: in-place overwrite, free-space offset untouched.
    pub fn recover_update(page: &Page, raw: &[u8], offset: u16) {
        page.mark_dirty();
        let mut buf = page.data();
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
    }
}
