//! Isolation-level semantics through the public store API.

use keystone::{Error, IsolationLevel, Store, PAGE_SIZE};
use tempfile::tempdir;

const MEM: usize = PAGE_SIZE * 32;

#[test]
fn read_committed_sees_commits_as_they_land() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("mvcc_rc"), MEM).unwrap();

    let reader = store.begin(IsolationLevel::ReadCommitted).unwrap();

    let writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = store.insert(writer, b"landed").unwrap();
    assert!(store.read(reader, uid).unwrap().is_none());

    store.commit(writer).unwrap();
    assert_eq!(store.read(reader, uid).unwrap().unwrap(), b"landed");
    store.commit(reader).unwrap();
}

#[test]
fn repeatable_read_pins_the_begin_time_view() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("mvcc_rr"), MEM).unwrap();

    let writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let before = store.insert(writer, b"before begin").unwrap();
    store.commit(writer).unwrap();

    let reader = store.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(store.read(reader, before).unwrap().unwrap(), b"before begin");

    // Committed after the reader began: permanently invisible to it.
    let writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let after = store.insert(writer, b"after begin").unwrap();
    store.commit(writer).unwrap();
    assert!(store.read(reader, after).unwrap().is_none());

    // A deletion committed after begin is equally invisible.
    let deleter = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(store.delete(deleter, before).unwrap());
    store.commit(deleter).unwrap();
    assert_eq!(store.read(reader, before).unwrap().unwrap(), b"before begin");

    store.commit(reader).unwrap();

    // A fresh transaction sees the final state.
    let t = store.begin(IsolationLevel::RepeatableRead).unwrap();
    assert!(store.read(t, before).unwrap().is_none());
    assert_eq!(store.read(t, after).unwrap().unwrap(), b"after begin");
    store.commit(t).unwrap();
}

#[test]
fn repeatable_read_hides_transactions_active_at_begin() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("mvcc_snap"), MEM).unwrap();

    let writer = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = store.insert(writer, b"in flight").unwrap();

    // The reader begins while the writer is still active, so even the
    // writer's later commit does not make the entry visible.
    let reader = store.begin(IsolationLevel::RepeatableRead).unwrap();
    store.commit(writer).unwrap();
    assert!(store.read(reader, uid).unwrap().is_none());
    store.commit(reader).unwrap();
}

#[test]
fn logical_update_is_delete_then_insert() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("mvcc_update"), MEM).unwrap();

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let v1 = store.insert(t, b"version 1").unwrap();
    store.commit(t).unwrap();

    let updater = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(store.delete(updater, v1).unwrap());
    let v2 = store.insert(updater, b"version 2").unwrap();

    // Another transaction still sees the old version until the commit.
    let reader = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(store.read(reader, v1).unwrap().unwrap(), b"version 1");
    assert!(store.read(reader, v2).unwrap().is_none());

    store.commit(updater).unwrap();
    assert!(store.read(reader, v1).unwrap().is_none());
    assert_eq!(store.read(reader, v2).unwrap().unwrap(), b"version 2");
    store.commit(reader).unwrap();
}

#[test]
fn payload_size_boundaries_round_trip() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("mvcc_bounds"), MEM).unwrap();

    // The free-space offset (2), item header (3) and entry header (16)
    // leave this much of a page for the payload itself.
    const MAX_PAYLOAD: usize = PAGE_SIZE - 2 - 3 - 16;

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let empty = store.insert(t, b"").unwrap();
    let full = store.insert(t, &vec![0x5A; MAX_PAYLOAD]).unwrap();
    assert!(matches!(
        store.insert(t, &vec![0x5A; MAX_PAYLOAD + 1]),
        Err(Error::DataTooLarge)
    ));
    store.commit(t).unwrap();

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(store.read(t, empty).unwrap().unwrap(), b"");
    assert_eq!(
        store.read(t, full).unwrap().unwrap(),
        vec![0x5A; MAX_PAYLOAD]
    );
    store.commit(t).unwrap();
}

#[test]
fn aborted_transactions_leave_no_trace() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("mvcc_abort"), MEM).unwrap();

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let kept = store.insert(t, b"kept").unwrap();
    store.commit(t).unwrap();

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let ghost = store.insert(t, b"ghost").unwrap();
    assert!(store.delete(t, kept).unwrap());
    store.abort(t).unwrap();

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(store.read(t, ghost).unwrap().is_none());
    assert_eq!(store.read(t, kept).unwrap().unwrap(), b"kept");
    store.commit(t).unwrap();
}
