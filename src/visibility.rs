//! MVCC visibility rules.
//!
//! A transaction judges an entry by its `xmin`/`xmax` pair and the commit
//! state of those transactions. Read-committed consults commit state only;
//! repeatable-read additionally hides transactions that started after the
//! reader or were active in its begin-time snapshot.

use crate::tm::TransactionManager;
use crate::vm::{IsolationLevel, Transaction};
use crate::{Result, Xid};

pub fn is_visible(
    tm: &TransactionManager,
    t: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    match t.level() {
        IsolationLevel::ReadCommitted => read_committed(tm, t, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(tm, t, xmin, xmax),
    }
}

fn read_committed(
    tm: &TransactionManager,
    t: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    let xid = t.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid && !tm.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read(
    tm: &TransactionManager,
    t: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> Result<bool> {
    let xid = t.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    // The creator must have committed before this transaction began.
    if tm.is_committed(xmin)? && xmin < xid && !t.in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        // A deletion only hides the entry if it too committed before we
        // began; later or snapshotted deleters do not exist for us.
        if xmax != xid && (!tm.is_committed(xmax)? || xmax > xid || t.in_snapshot(xmax)) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True when deleting this entry would overwrite a committed version the
/// transaction cannot see. Only repeatable-read refuses such writes.
pub fn is_version_skip(tm: &TransactionManager, t: &Transaction, xmax: Xid) -> Result<bool> {
    match t.level() {
        IsolationLevel::ReadCommitted => Ok(false),
        IsolationLevel::RepeatableRead => {
            Ok(tm.is_committed(xmax)? && (xmax > t.xid() || t.in_snapshot(xmax)))
        }
    }
}
