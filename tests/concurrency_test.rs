//! Multi-threaded behavior: shared inserts, delete serialization and
//! deadlock handling, all through one `Arc<Store>`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keystone::{Error, IsolationLevel, Store, PAGE_SIZE};
use serial_test::serial;
use tempfile::tempdir;

const MEM: usize = PAGE_SIZE * 64;

#[test]
fn concurrent_inserts_are_all_durable() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("conc_inserts");
    let store = Arc::new(Store::create(&base, MEM).unwrap());

    const THREADS: usize = 8;
    const PER_THREAD: u32 = 25;

    let mut handles = Vec::new();
    for worker in 0..THREADS as u32 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let mut uids = Vec::new();
            for i in 0..PER_THREAD {
                let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
                let payload = format!("worker {worker} record {i}");
                uids.push((payload.clone(), store.insert(t, payload.as_bytes()).unwrap()));
                store.commit(t).unwrap();
            }
            uids
        }));
    }
    let mut all: Vec<(String, u64)> = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    assert_eq!(all.len(), THREADS * PER_THREAD as usize);

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    for (payload, uid) in &all {
        assert_eq!(store.read(t, *uid).unwrap().unwrap(), payload.as_bytes());
    }
    store.commit(t).unwrap();

    Arc::try_unwrap(store).ok().unwrap().close().unwrap();

    // And once more through a restart.
    let store = Store::open(&base, MEM).unwrap();
    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    for (payload, uid) in &all {
        assert_eq!(store.read(t, *uid).unwrap().unwrap(), payload.as_bytes());
    }
    store.commit(t).unwrap();
    store.close().unwrap();
}

#[test]
#[serial]
fn delete_blocks_until_the_holder_commits() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::create(&dir.path().join("conc_block"), MEM).unwrap());

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = store.insert(t, b"contested").unwrap();
    store.commit(t).unwrap();

    let holder = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(store.delete(holder, uid).unwrap());

    let contender = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.delete(contender, uid))
    };

    // Give the contender time to queue, then let it through.
    thread::sleep(Duration::from_millis(200));
    assert!(!blocked.is_finished());
    store.commit(holder).unwrap();

    // Read-committed does not refuse the overwrite; the delete lands.
    assert!(blocked.join().unwrap().unwrap());
    store.commit(contender).unwrap();
}

#[test]
#[serial]
fn repeatable_read_loser_is_aborted_with_a_conflict() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::create(&dir.path().join("conc_fww"), MEM).unwrap());

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = store.insert(t, b"first writer wins").unwrap();
    store.commit(t).unwrap();

    let winner = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let loser = store.begin(IsolationLevel::RepeatableRead).unwrap();
    assert!(store.delete(winner, uid).unwrap());

    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.delete(loser, uid))
    };
    thread::sleep(Duration::from_millis(200));
    store.commit(winner).unwrap();

    // The loser wakes under the lock, finds a committed version it cannot
    // see, and is aborted on the spot.
    assert!(matches!(blocked.join().unwrap(), Err(Error::ConcurrentUpdate)));
    assert!(matches!(
        store.read(loser, uid),
        Err(Error::ConcurrentUpdate)
    ));
    store.abort(loser).unwrap();
}

#[test]
#[serial]
fn deadlock_is_broken_by_refusing_the_closing_request() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::create(&dir.path().join("conc_dead"), MEM).unwrap());

    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid_a = store.insert(t, b"resource a").unwrap();
    let uid_b = store.insert(t, b"resource b").unwrap();
    store.commit(t).unwrap();

    let x1 = store.begin(IsolationLevel::ReadCommitted).unwrap();
    let x2 = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(store.delete(x1, uid_a).unwrap());
    assert!(store.delete(x2, uid_b).unwrap());

    // x1 queues behind x2 on b; x2 then asking for a closes the cycle.
    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.delete(x1, uid_b))
    };
    thread::sleep(Duration::from_millis(200));
    assert!(matches!(store.delete(x2, uid_a), Err(Error::Deadlock)));

    // Refusing x2 auto-aborted it, releasing b; x1 proceeds.
    assert!(blocked.join().unwrap().unwrap());
    store.commit(x1).unwrap();
    store.abort(x2).unwrap();

    // x1's deletes stand, x2's were rolled back by the abort status.
    let t = store.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(store.read(t, uid_a).unwrap().is_none());
    assert!(store.read(t, uid_b).unwrap().is_none());
    store.commit(t).unwrap();
}
