//! Versioned entries: the MVCC framing stored inside a data item.
//!
//! Payload layout: `[xmin: u64 BE][xmax: u64 BE][data]`. `xmin` is the
//! creating transaction, `xmax` the deleting one (0 while live). Entries
//! are immutable except for `xmax`, which is set exactly once through the
//! item's logged write path.

use std::sync::Arc;

use bytes::BufMut;

use crate::data_item::DataItem;
use crate::data_manager::DataManager;
use crate::{Result, Uid, Xid};

const OF_XMIN: usize = 0;
const OF_XMAX: usize = 8;
const OF_DATA: usize = 16;

pub struct Entry {
    uid: Uid,
    item: Arc<DataItem>,
}

/// Frames `data` as a fresh entry created by `xid`.
pub fn wrap_raw(xid: Xid, data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OF_DATA + data.len());
    raw.put_u64(xid);
    raw.put_u64(0);
    raw.put_slice(data);
    raw
}

impl Entry {
    /// Loads the entry at `uid`; `None` if the item is missing or marked
    /// deleted. A `Some` entry pins a data-item reference released by
    /// [`remove`](Self::remove).
    pub fn load(dm: &DataManager, uid: Uid) -> Result<Option<Entry>> {
        Ok(dm.read(uid)?.map(|item| Entry { uid, item }))
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn xmin(&self) -> Xid {
        self.item.with_data(|d| read_xid(d, OF_XMIN))
    }

    pub fn xmax(&self) -> Xid {
        self.item.with_data(|d| read_xid(d, OF_XMAX))
    }

    pub fn data(&self) -> Vec<u8> {
        self.item.with_data(|d| d[OF_DATA..].to_vec())
    }

    /// Marks the entry deleted by `xid`. The new image is logged before
    /// the item's write lock is released; if logging fails the in-memory
    /// bytes are rolled back.
    pub fn set_xmax(&self, dm: &DataManager, xid: Xid) -> Result<()> {
        let guard = self.item.before();
        guard.write_data_at(OF_XMAX, &xid.to_be_bytes());
        match dm.log_update(xid, &self.item, &guard) {
            Ok(()) => Ok(()),
            Err(e) => {
                guard.un_before();
                Err(e)
            }
        }
    }

    /// Returns the underlying item reference to the data manager.
    pub fn remove(&self, dm: &DataManager) -> Result<()> {
        dm.release_item(self.uid)
    }
}

fn read_xid(d: &[u8], at: usize) -> Xid {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&d[at..at + 8]);
    Xid::from_be_bytes(buf)
}
