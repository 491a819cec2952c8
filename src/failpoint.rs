//! Test-only crash injection.
//!
//! A site is a named point where a test can force the engine to fail with
//! an I/O error, standing in for a crash between two durable writes.
//! Sites are armed per thread through the RAII [`arm`] guard, or
//! process-wide by listing names in the `KEYSTONE_FAILPOINTS` environment
//! variable (comma separated).

use std::cell::RefCell;
use std::io;

use crate::Result;

thread_local! {
    static ARMED: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
}

/// Keeps a site armed on the current thread until dropped.
pub struct Armed {
    name: &'static str,
}

pub fn arm(name: &'static str) -> Armed {
    ARMED.with(|sites| sites.borrow_mut().push(name));
    Armed { name }
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|sites| {
            let mut sites = sites.borrow_mut();
            if let Some(i) = sites.iter().rposition(|&n| n == self.name) {
                sites.remove(i);
            }
        });
    }
}

fn is_armed(name: &str) -> bool {
    if ARMED.with(|sites| sites.borrow().iter().any(|&n| n == name)) {
        return true;
    }
    std::env::var("KEYSTONE_FAILPOINTS")
        .ok()
        .is_some_and(|raw| raw.split(',').any(|v| v.trim() == name))
}

/// Fails with an injected I/O error while `name` is armed.
pub fn crash_site(name: &str) -> Result<()> {
    if is_armed(name) {
        Err(io::Error::other(format!("injected crash at {name}")).into())
    } else {
        Ok(())
    }
}
