//! Exclusive uid locks with FIFO waiting and deadlock detection.
//!
//! Each transaction waits for at most one uid at a time, so the wait-for
//! graph is a set of chains and detection is a stamped walk: every node is
//! tagged with the stamp of the pass that visited it, and meeting the
//! current pass's own stamp again means a cycle. Stamps only grow, so no
//! per-call reset of the visited map is needed.
//!
//! When a uid is freed, its waiters are granted in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{Error, Result, Uid, Xid};

/// Handle for a queued lock request. `wait` blocks until the lock table
/// grants the uid to this transaction.
pub struct Waiter {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
    }

    fn grant(&self) {
        *self.granted.lock() = true;
        self.cv.notify_one();
    }
}

#[derive(Default)]
struct Inner {
    /// uids held by each transaction.
    owned: HashMap<Xid, Vec<Uid>>,
    /// Current holder of each locked uid.
    holder: HashMap<Uid, Xid>,
    /// Arrival-ordered waiters per uid.
    queue: HashMap<Uid, VecDeque<Xid>>,
    /// Pending waiter handle per queued transaction.
    waiters: HashMap<Xid, Arc<Waiter>>,
    /// The single uid each queued transaction is waiting for.
    wanted: HashMap<Xid, Uid>,
    stamps: HashMap<Xid, u64>,
    stamp_gen: u64,
}

#[derive(Default)]
pub struct LockTable {
    inner: Mutex<Inner>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the exclusive lock on `uid` for `xid`. Returns `None` when
    /// the lock is granted immediately, a [`Waiter`] to block on when it is
    /// held by someone else, and `Err(Deadlock)` when queuing would close a
    /// cycle in the wait-for graph (the request is then withdrawn).
    pub fn add(&self, xid: Xid, uid: Uid) -> Result<Option<Arc<Waiter>>> {
        let mut inner = self.inner.lock();

        if inner.owned.get(&xid).is_some_and(|u| u.contains(&uid)) {
            return Ok(None);
        }
        if !inner.holder.contains_key(&uid) {
            inner.holder.insert(uid, xid);
            inner.owned.entry(xid).or_default().push(uid);
            return Ok(None);
        }

        inner.wanted.insert(xid, uid);
        inner.queue.entry(uid).or_default().push_back(xid);
        if has_deadlock(&mut inner) {
            inner.wanted.remove(&xid);
            if let Some(q) = inner.queue.get_mut(&uid) {
                q.retain(|&x| x != xid);
                if q.is_empty() {
                    inner.queue.remove(&uid);
                }
            }
            debug!(xid, uid, "lock request refused, would deadlock");
            return Err(Error::Deadlock);
        }

        let waiter = Waiter::new();
        inner.waiters.insert(xid, Arc::clone(&waiter));
        Ok(Some(waiter))
    }

    /// Releases everything `xid` holds or waits for, granting each freed
    /// uid to the earliest surviving waiter.
    pub fn remove(&self, xid: Xid) {
        let mut granted = Vec::new();
        {
            let mut inner = self.inner.lock();
            let uids = inner.owned.remove(&xid).unwrap_or_default();
            for uid in uids {
                if let Some(w) = pass_on(&mut inner, uid) {
                    granted.push(w);
                }
            }
            inner.wanted.remove(&xid);
            inner.waiters.remove(&xid);
            inner.stamps.remove(&xid);
        }
        for w in granted {
            w.grant();
        }
    }
}

/// Hands `uid` to the first queued transaction that still wants it, or
/// leaves it free.
fn pass_on(inner: &mut Inner, uid: Uid) -> Option<Arc<Waiter>> {
    inner.holder.remove(&uid);
    loop {
        let next = match inner.queue.get_mut(&uid) {
            Some(q) => match q.pop_front() {
                Some(x) => x,
                None => break,
            },
            None => break,
        };
        // Withdrawn waiters (deadlock refusals, removed transactions) may
        // still sit in the queue; skip them.
        if let Some(w) = inner.waiters.remove(&next) {
            inner.wanted.remove(&next);
            inner.holder.insert(uid, next);
            inner.owned.entry(next).or_default().push(uid);
            return Some(w);
        }
    }
    if inner.queue.get(&uid).is_some_and(|q| q.is_empty()) {
        inner.queue.remove(&uid);
    }
    None
}

fn has_deadlock(inner: &mut Inner) -> bool {
    // Stamps at or below the floor are leftovers from earlier calls.
    let floor = inner.stamp_gen;
    let roots: Vec<Xid> = inner.owned.keys().copied().collect();
    for root in roots {
        if inner.stamps.get(&root).is_some_and(|&s| s > floor) {
            continue;
        }
        inner.stamp_gen += 1;
        let stamp = inner.stamp_gen;
        if walk(inner, root, stamp, floor) {
            return true;
        }
    }
    false
}

/// Follows the wait-for chain from `root`. Each transaction waits for at
/// most one uid, so the walk is a simple loop rather than a general DFS.
fn walk(inner: &mut Inner, root: Xid, stamp: u64, floor: u64) -> bool {
    let mut x = root;
    loop {
        match inner.stamps.get(&x) {
            Some(&s) if s == stamp => return true,
            Some(&s) if s > floor => return false,
            _ => {}
        }
        inner.stamps.insert(x, stamp);
        let Some(&uid) = inner.wanted.get(&x) else {
            return false;
        };
        let Some(&next) = inner.holder.get(&uid) else {
            return false;
        };
        x = next;
    }
}
