//! Version manager: transaction lifecycle, snapshot isolation and the
//! delete pipeline.
//!
//! Entries are immutable versions; a logical update is delete-then-insert
//! performed by the host. Deletes serialize through the lock table, and a
//! transaction that loses a conflict (deadlock or unreachable committed
//! version) is aborted on the spot and poisoned: every later operation on
//! it fails with the same conflict until the host calls `abort`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CacheSource, RefCache};
use crate::data_manager::DataManager;
use crate::entry::{self, Entry};
use crate::lock_table::LockTable;
use crate::tm::{TransactionManager, SUPER_XID};
use crate::visibility;
use crate::{Error, Result, Uid, Xid};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IsolationLevel {
    /// Sees every committed version, re-evaluated at each read.
    ReadCommitted,
    /// Sees only versions committed before the transaction began.
    RepeatableRead,
}

/// Conflict kind a transaction was auto-aborted for.
#[derive(Clone, Copy, Debug)]
enum Fault {
    Deadlock,
    ConcurrentUpdate,
}

impl Fault {
    fn to_error(self) -> Error {
        match self {
            Fault::Deadlock => Error::Deadlock,
            Fault::ConcurrentUpdate => Error::ConcurrentUpdate,
        }
    }
}

pub struct Transaction {
    xid: Xid,
    level: IsolationLevel,
    /// XIDs active at begin time; `None` for read-committed.
    snapshot: Option<HashSet<Xid>>,
    fault: Mutex<Option<Fault>>,
    /// Set once the version manager has aborted this transaction itself;
    /// the host's own `abort` then skips the duplicate status write.
    auto_aborted: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(xid: Xid, level: IsolationLevel, snapshot: Option<HashSet<Xid>>) -> Self {
        Self {
            xid,
            level,
            snapshot,
            fault: Mutex::new(None),
            auto_aborted: AtomicBool::new(false),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Whether `xid` was active when this transaction began. The bypass
    /// transaction counts as committed since forever.
    pub fn in_snapshot(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        self.snapshot.as_ref().is_some_and(|s| s.contains(&xid))
    }

    fn check_fault(&self) -> Result<()> {
        match *self.fault.lock() {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }
}

struct EntryBacking {
    dm: Arc<DataManager>,
}

impl CacheSource for EntryBacking {
    type Item = Entry;

    fn load(&self, uid: u64) -> Result<Arc<Entry>> {
        match Entry::load(&self.dm, uid)? {
            Some(e) => Ok(Arc::new(e)),
            None => Err(Error::MissingEntry),
        }
    }

    fn evict(&self, entry: Arc<Entry>) -> Result<()> {
        entry.remove(&self.dm)
    }
}

pub struct VersionManager {
    tm: Arc<TransactionManager>,
    dm: Arc<DataManager>,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
    lock_table: LockTable,
    entries: RefCache<EntryBacking>,
}

impl VersionManager {
    pub fn new(tm: Arc<TransactionManager>, dm: Arc<DataManager>) -> Self {
        let mut active = HashMap::new();
        active.insert(
            SUPER_XID,
            Arc::new(Transaction::new(SUPER_XID, IsolationLevel::ReadCommitted, None)),
        );
        Self {
            tm,
            dm: Arc::clone(&dm),
            active: Mutex::new(active),
            lock_table: LockTable::new(),
            entries: RefCache::new(EntryBacking { dm }, 0),
        }
    }

    fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or(Error::UnknownXid(xid))
    }

    /// Starts a transaction. The snapshot, when one is taken, is built
    /// under the active-map lock so no commit can slip between XID
    /// allocation and the snapshot.
    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let mut active = self.active.lock();
        let xid = self.tm.begin()?;
        let snapshot = match level {
            IsolationLevel::ReadCommitted => None,
            IsolationLevel::RepeatableRead => Some(active.keys().copied().collect()),
        };
        active.insert(xid, Arc::new(Transaction::new(xid, level, snapshot)));
        debug!(xid, ?level, "transaction started");
        Ok(xid)
    }

    /// Reads the entry at `uid` as seen by `xid`; `None` if no version is
    /// visible.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        let t = self.transaction(xid)?;
        t.check_fault()?;

        let entry = match self.entries.get(uid) {
            Ok(e) => e,
            Err(Error::MissingEntry) => return Ok(None),
            Err(e) => return Err(e),
        };
        let result = visibility::is_visible(&self.tm, &t, entry.xmin(), entry.xmax())
            .map(|visible| visible.then(|| entry.data()));
        self.entries.release(uid)?;
        result
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let t = self.transaction(xid)?;
        t.check_fault()?;
        self.dm.insert(xid, &entry::wrap_raw(xid, data))
    }

    /// Deletes the entry at `uid`. Returns `false` when there is nothing
    /// for this transaction to delete: no visible version, or it already
    /// deleted the entry itself.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        let t = self.transaction(xid)?;
        t.check_fault()?;

        let entry = match self.entries.get(uid) {
            Ok(e) => e,
            Err(Error::MissingEntry) => return Ok(false),
            Err(e) => return Err(e),
        };
        let result = self.delete_entry(&t, &entry);
        self.entries.release(uid)?;
        result
    }

    fn delete_entry(&self, t: &Transaction, entry: &Entry) -> Result<bool> {
        let xid = t.xid();
        if !visibility::is_visible(&self.tm, t, entry.xmin(), entry.xmax())? {
            return Ok(false);
        }

        match self.lock_table.add(xid, entry.uid()) {
            Ok(None) => {}
            Ok(Some(waiter)) => waiter.wait(),
            Err(Error::Deadlock) => return Err(self.conflict_abort(t, Fault::Deadlock)),
            Err(e) => return Err(e),
        }

        if entry.xmax() == xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.tm, t, entry.xmax())? {
            return Err(self.conflict_abort(t, Fault::ConcurrentUpdate));
        }

        entry.set_xmax(&self.dm, xid)?;
        Ok(true)
    }

    /// Poisons and aborts a transaction that lost a conflict. The entry in
    /// the active map stays until the host acknowledges with `abort`.
    fn conflict_abort(&self, t: &Transaction, fault: Fault) -> Error {
        debug!(xid = t.xid, ?fault, "transaction auto-aborted");
        *t.fault.lock() = Some(fault);
        let aborted = self.intern_abort(t.xid, true);
        t.auto_aborted.store(true, Ordering::Release);
        match aborted {
            Err(e) => e,
            Ok(()) => fault.to_error(),
        }
    }

    /// Commits `xid`. Fails with the pending conflict if the transaction
    /// was auto-aborted; the host must `abort` it instead.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        if xid == SUPER_XID {
            return Err(Error::UnknownXid(xid));
        }
        let t = self.transaction(xid)?;
        t.check_fault()?;

        self.active.lock().remove(&xid);
        self.lock_table.remove(xid);
        self.tm.commit(xid)?;
        debug!(xid, "transaction committed");
        Ok(())
    }

    /// Aborts `xid`. Always succeeds on a live transaction, including one
    /// already auto-aborted by a conflict.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        if xid == SUPER_XID {
            return Err(Error::UnknownXid(xid));
        }
        self.intern_abort(xid, false)
    }

    fn intern_abort(&self, xid: Xid, auto: bool) -> Result<()> {
        let t = {
            let mut active = self.active.lock();
            let t = active.get(&xid).cloned().ok_or(Error::UnknownXid(xid))?;
            if !auto {
                active.remove(&xid);
            }
            t
        };
        // Locks and status were already released by the conflict path.
        if t.auto_aborted.load(Ordering::Acquire) {
            return Ok(());
        }
        self.lock_table.remove(xid);
        self.tm.abort(xid)?;
        debug!(xid, "transaction aborted");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.entries.close()
    }
}
