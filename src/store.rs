//! Top-level embeddable store handle.
//!
//! A `Store` bundles the transaction manager, data manager and version
//! manager over one triplet of files sharing a base path: `<base>.xid`,
//! `<base>.db` and `<base>.log`. All operations are `&self` and thread
//! safe; the handle is shared behind an `Arc` by multi-threaded hosts.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::data_manager::DataManager;
use crate::tm::TransactionManager;
use crate::vm::{IsolationLevel, VersionManager};
use crate::{Result, Uid, Xid};

pub struct Store {
    dm: Arc<DataManager>,
    vm: VersionManager,
}

impl Store {
    /// Creates the store files at `base` and opens them. `memory` is the
    /// page-cache budget in bytes.
    pub fn create(base: &Path, memory: usize) -> Result<Self> {
        let tm = Arc::new(TransactionManager::create(base)?);
        let dm = DataManager::create(base, memory, Arc::clone(&tm))?;
        let vm = VersionManager::new(tm, Arc::clone(&dm));
        info!(base = %base.display(), "store created");
        Ok(Self { dm, vm })
    }

    /// Opens an existing store, running crash recovery first when the
    /// previous session did not close cleanly.
    pub fn open(base: &Path, memory: usize) -> Result<Self> {
        let tm = Arc::new(TransactionManager::open(base)?);
        let dm = DataManager::open(base, memory, Arc::clone(&tm))?;
        let vm = VersionManager::new(tm, Arc::clone(&dm));
        info!(base = %base.display(), "store opened");
        Ok(Self { dm, vm })
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        self.vm.begin(level)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.vm.abort(xid)
    }

    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.vm.read(xid, uid)
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        self.vm.insert(xid, data)
    }

    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        self.vm.delete(xid, uid)
    }

    /// Flushes everything and stamps a clean close. Transactions still
    /// active at this point keep their active status; their writes remain
    /// invisible to every future transaction.
    pub fn close(self) -> Result<()> {
        self.vm.close()?;
        self.dm.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use tempfile::tempdir;

    const MEM: usize = PAGE_SIZE * 32;

    #[test]
    fn full_lifecycle_across_a_restart() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store_cycle");

        let store = Store::create(&base, MEM).unwrap();
        let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
        let kept = store.insert(t, b"kept record").unwrap();
        let gone = store.insert(t, b"deleted record").unwrap();
        store.commit(t).unwrap();

        let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(store.delete(t, gone).unwrap());
        store.commit(t).unwrap();
        store.close().unwrap();

        let store = Store::open(&base, MEM).unwrap();
        let t = store.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(store.read(t, kept).unwrap().unwrap(), b"kept record");
        assert!(store.read(t, gone).unwrap().is_none());
        store.commit(t).unwrap();
        store.close().unwrap();
    }

    #[test]
    fn create_refuses_an_existing_store() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store_dup");
        let store = Store::create(&base, MEM).unwrap();
        store.close().unwrap();
        assert!(Store::create(&base, MEM).is_err());
    }
}
