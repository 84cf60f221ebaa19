//! Counting semaphore used as an event's completion signal.
//!
//! The semaphore has its own lock, separate from any context lock, so the
//! thread finishing an event never needs the queue lock to wake a waiter.
//! Posting before anyone waits leaves a permit behind.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            condvar: Condvar::new(),
        }
    }

    /// Release one permit.
    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.condvar.notify_one();
    }

    /// Take one permit, blocking until one is available.
    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.condvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take one permit if available.
    pub(crate) fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Take one permit, giving up after `timeout`.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.condvar.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }
}
