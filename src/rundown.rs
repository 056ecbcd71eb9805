// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Rundown protection: blocks a closer until every in-flight acquirer has
//! released, without making acquirers take a lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Inner {
    active: AtomicUsize,
    draining: AtomicBool,
}

/// Shared rundown state for one socket object.
#[derive(Clone)]
pub struct Rundown {
    inner: Arc<Inner>,
}

/// Held for the duration of one in-flight operation (e.g. a received
/// indication awaiting dispatch). Releases on drop.
pub struct RundownGuard {
    inner: Arc<Inner>,
}

impl Rundown {
    pub fn new() -> Self {
        Rundown {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire rundown protection, or `None` if the object is already being
    /// drained for close.
    pub fn acquire(&self) -> Option<RundownGuard> {
        if self.inner.draining.load(Ordering::Acquire) {
            return None;
        }
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        if self.inner.draining.load(Ordering::Acquire) {
            // Raced with a drain that just started; back out and let the
            // drainer see the count return to its pre-acquire value.
            self.inner.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(RundownGuard {
            inner: self.inner.clone(),
        })
    }

    /// Mark the object as draining and block until every outstanding guard
    /// has been released. Idempotent.
    pub fn wait_for_drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
        while self.inner.active.load(Ordering::Acquire) != 0 {
            thread::yield_now();
        }
    }

    /// Same as [`Self::wait_for_drain`] but polls on an interval instead of
    /// spinning, for callers that can tolerate a little latency.
    pub fn wait_for_drain_polling(&self, poll_interval: Duration) {
        self.inner.draining.store(true, Ordering::Release);
        while self.inner.active.load(Ordering::Acquire) != 0 {
            thread::sleep(poll_interval);
        }
    }
}

impl Default for Rundown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RundownGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_after_drain_is_refused() {
        let rundown = Rundown::new();
        rundown.wait_for_drain();
        assert!(rundown.acquire().is_none());
    }

    #[test]
    fn drain_waits_for_outstanding_guards() {
        let rundown = Rundown::new();
        let guard = rundown.acquire().unwrap();

        let rundown2 = rundown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });

        rundown.wait_for_drain();
        handle.join().unwrap();
    }
}
