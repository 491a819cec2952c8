//! Generic reference-counted resource cache.
//!
//! There is no eviction heuristic: callers hold explicit references and a
//! resource is written back exactly when its last reference is released.
//! A full cache refuses new loads with `CacheFull` instead of evicting,
//! so every `get` must be paired with a `release` or capacity leaks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

/// Capability supplied by each concrete cache: how to materialize a missing
/// resource and how to write one back when it leaves the cache.
pub trait CacheSource {
    type Item;

    fn load(&self, key: u64) -> Result<Arc<Self::Item>>;

    fn evict(&self, item: Arc<Self::Item>) -> Result<()>;
}

#[derive(Debug)]
struct State<T> {
    resident: HashMap<u64, Arc<T>>,
    refs: HashMap<u64, usize>,
    /// Keys currently being loaded by some thread. Counted against capacity
    /// so two racing loads cannot overshoot the bound.
    loading: HashSet<u64>,
}

#[derive(Debug)]
pub struct RefCache<S: CacheSource> {
    source: S,
    /// Maximum resident items; 0 means unbounded.
    max_resident: usize,
    state: Mutex<State<S::Item>>,
    load_done: Condvar,
}

impl<S: CacheSource> RefCache<S> {
    pub fn new(source: S, max_resident: usize) -> Self {
        Self {
            source,
            max_resident,
            state: Mutex::new(State {
                resident: HashMap::new(),
                refs: HashMap::new(),
                loading: HashSet::new(),
            }),
            load_done: Condvar::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches the resource for `key`, loading it through the source if it
    /// is not resident. The returned reference must be paired with exactly
    /// one `release(key)`.
    pub fn get(&self, key: u64) -> Result<Arc<S::Item>> {
        {
            let mut state = self.state.lock();
            loop {
                // Another thread is mid-load for this key; wait for it to
                // finish and re-check the cache.
                if state.loading.contains(&key) {
                    self.load_done.wait(&mut state);
                    continue;
                }

                if let Some(item) = state.resident.get(&key) {
                    let item = Arc::clone(item);
                    *state.refs.entry(key).or_insert(0) += 1;
                    return Ok(item);
                }

                if self.max_resident > 0
                    && state.resident.len() + state.loading.len() >= self.max_resident
                {
                    return Err(Error::CacheFull);
                }

                state.loading.insert(key);
                break;
            }
        }

        // The load runs outside the bookkeeping lock so a slow source does
        // not block unrelated keys.
        let loaded = self.source.load(key);

        let mut state = self.state.lock();
        state.loading.remove(&key);
        self.load_done.notify_all();
        match loaded {
            Ok(item) => {
                state.resident.insert(key, Arc::clone(&item));
                state.refs.insert(key, 1);
                Ok(item)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops one reference to `key`. At zero the item leaves the cache and
    /// the source's `evict` runs (outside the bookkeeping lock).
    pub fn release(&self, key: u64) -> Result<()> {
        let evicted = {
            let mut state = self.state.lock();
            let Some(count) = state.refs.get_mut(&key) else {
                return Ok(());
            };
            *count -= 1;
            if *count > 0 {
                return Ok(());
            }
            state.refs.remove(&key);
            state.resident.remove(&key)
        };
        match evicted {
            Some(item) => self.source.evict(item),
            None => Ok(()),
        }
    }

    /// Force-evicts every resident item regardless of reference counts.
    /// Shutdown path only; the first eviction failure is reported after
    /// all items have been drained.
    pub fn close(&self) -> Result<()> {
        let drained: Vec<Arc<S::Item>> = {
            let mut state = self.state.lock();
            state.refs.clear();
            state.resident.drain().map(|(_, item)| item).collect()
        };
        let mut first_err = None;
        for item in drained {
            if let Err(e) = self.source.evict(item) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
