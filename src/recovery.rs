//! Crash recovery: log record formats plus the redo/undo replay.
//!
//! Two record kinds share the log. An insert record carries the page and
//! offset the item landed at; an update record carries the old and new
//! images of the item (equal length, so the split point is implicit).
//!
//! Replay runs in three passes over the repaired log: a scan to find the
//! highest page number ever touched (the page file is truncated there, so
//! pages allocated after the last durable record disappear), a redo pass
//! applying every record of finished transactions in log order, and an
//! undo pass replaying each unfinished transaction's records backwards
//! before marking it aborted.

use bytes::{Buf, BufMut};
use tracing::info;

use crate::data_item;
use crate::page::record;
use crate::page_cache::PageCache;
use crate::tm::TransactionManager;
use crate::wal::Wal;
use crate::{addr_from_uid, Error, Pgno, Result, Uid, Xid};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: Pgno,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } | LogRecord::Update { xid, .. } => *xid,
        }
    }

    fn pgno(&self) -> Pgno {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => addr_from_uid(*uid).0,
        }
    }
}

/// `[0][xid: u64 BE][pgno: u32 BE][offset: u16 BE][raw]`
pub fn insert_log(xid: Xid, pgno: Pgno, offset: u16, raw: &[u8]) -> Vec<u8> {
    let mut log = Vec::with_capacity(15 + raw.len());
    log.put_u8(TYPE_INSERT);
    log.put_u64(xid);
    log.put_u32(pgno);
    log.put_u16(offset);
    log.put_slice(raw);
    log
}

/// `[1][xid: u64 BE][uid: u64 BE][old image][new image]`
pub fn update_log(xid: Xid, uid: Uid, old: &[u8], new: &[u8]) -> Vec<u8> {
    debug_assert_eq!(old.len(), new.len());
    let mut log = Vec::with_capacity(17 + old.len() + new.len());
    log.put_u8(TYPE_UPDATE);
    log.put_u64(xid);
    log.put_u64(uid);
    log.put_slice(old);
    log.put_slice(new);
    log
}

pub fn parse_log(data: &[u8]) -> Result<LogRecord> {
    let mut buf = data;
    if buf.remaining() < 1 {
        return Err(Error::CorruptLog);
    }
    match buf.get_u8() {
        TYPE_INSERT => {
            if buf.remaining() < 14 {
                return Err(Error::CorruptLog);
            }
            let xid = buf.get_u64();
            let pgno = buf.get_u32();
            let offset = buf.get_u16();
            Ok(LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw: buf.to_vec(),
            })
        }
        TYPE_UPDATE => {
            if buf.remaining() < 16 || (buf.remaining() - 16) % 2 != 0 {
                return Err(Error::CorruptLog);
            }
            let xid = buf.get_u64();
            let uid = buf.get_u64();
            let half = buf.remaining() / 2;
            Ok(LogRecord::Update {
                xid,
                uid,
                old: buf[..half].to_vec(),
                new: buf[half..].to_vec(),
            })
        }
        _ => Err(Error::CorruptLog),
    }
}

/// Replays the log against the page file after an unclean shutdown.
pub fn recover(tm: &TransactionManager, wal: &Wal, pages: &PageCache) -> Result<()> {
    info!("recovering after unclean shutdown");

    // Pass 1: trim the page file to the highest page the log ever touched.
    let mut max_pgno: Pgno = 1;
    wal.rewind();
    while let Some(data) = wal.next()? {
        let rec = parse_log(&data)?;
        max_pgno = max_pgno.max(rec.pgno());
    }
    pages.truncate(max_pgno)?;

    redo_finished(tm, wal, pages)?;
    undo_unfinished(tm, wal, pages)?;

    info!("recovery complete");
    Ok(())
}

fn redo_finished(tm: &TransactionManager, wal: &Wal, pages: &PageCache) -> Result<()> {
    wal.rewind();
    while let Some(data) = wal.next()? {
        let rec = parse_log(&data)?;
        if tm.is_active(rec.xid())? {
            continue;
        }
        match rec {
            LogRecord::Insert {
                pgno, offset, raw, ..
            } => {
                let page = pages.get_page(pgno)?;
                record::recover_insert(&page, &raw, offset);
                pages.release(&page)?;
            }
            LogRecord::Update { uid, new, .. } => {
                let (pgno, offset) = addr_from_uid(uid);
                let page = pages.get_page(pgno)?;
                record::recover_update(&page, &new, offset);
                pages.release(&page)?;
            }
        }
    }
    Ok(())
}

fn undo_unfinished(tm: &TransactionManager, wal: &Wal, pages: &PageCache) -> Result<()> {
    use std::collections::HashMap;

    let mut pending: HashMap<Xid, Vec<LogRecord>> = HashMap::new();
    wal.rewind();
    while let Some(data) = wal.next()? {
        let rec = parse_log(&data)?;
        if tm.is_active(rec.xid())? {
            pending.entry(rec.xid()).or_default().push(rec);
        }
    }

    for (xid, records) in pending {
        info!(xid, records = records.len(), "undoing unfinished transaction");
        for rec in records.into_iter().rev() {
            match rec {
                LogRecord::Insert {
                    pgno,
                    offset,
                    mut raw,
                    ..
                } => {
                    // An undone insert stays on the page but is marked
                    // logically deleted; its uid may already be referenced
                    // by a later, committed update chain.
                    data_item::set_raw_invalid(&mut raw);
                    let page = pages.get_page(pgno)?;
                    record::recover_insert(&page, &raw, offset);
                    pages.release(&page)?;
                }
                LogRecord::Update { uid, old, .. } => {
                    let (pgno, offset) = addr_from_uid(uid);
                    let page = pages.get_page(pgno)?;
                    record::recover_update(&page, &old, offset);
                    pages.release(&page)?;
                }
            }
        }
        tm.abort(xid)?;
    }
    Ok(())
}
