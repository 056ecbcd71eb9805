// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause
//
// A read/write lock tuned for the access pattern the endpoint store needs
// rather than a general-purpose primitive.

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::ops::Deref;

/// A special type of read/write lock, tuned for the endpoint hot path:
///
/// a) Read access (the send path) is frequent and must stay fast, so readers
///    hold the lock for the lifetime of a send.
/// b) Write access (a resolved source binding or an externally observed
///    endpoint change) is rare and may be a little slower.
/// c) A thread already holding a read lock can ask to upgrade to a write
///    lock, cooperatively asking other readers to yield theirs.
pub struct EndpointLock<T: ?Sized> {
    wants_write: (Mutex<bool>, Condvar),
    inner: RwLock<T>,
}

impl<T> EndpointLock<T> {
    pub fn new(value: T) -> Self {
        EndpointLock {
            wants_write: (Mutex::new(false), Condvar::new()),
            inner: RwLock::new(value),
        }
    }
}

impl<T: ?Sized> EndpointLock<T> {
    /// Acquire a read lock.
    pub fn read(&self) -> EndpointReadGuard<'_, T> {
        let (lock, cvar) = &self.wants_write;
        let mut wants_write = lock.lock();
        while *wants_write {
            cvar.wait(&mut wants_write);
        }

        EndpointReadGuard {
            wants_write: &self.wants_write,
            inner: self.inner.read(),
        }
    }

    /// Acquire the lock in exclusive mode directly, without first holding a
    /// read section. Used by writers that have no read state to preserve
    /// (`SetPeerEndpoint`, `ClearPeerEndpointSrc`).
    pub fn write<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let (lock, cvar) = &self.wants_write;
        {
            let mut wants_write = lock.lock();
            while *wants_write {
                cvar.wait(&mut wants_write);
            }
            *wants_write = true;
        }

        let ret = f(&mut *self.inner.write());

        let mut wants_write = lock.lock();
        *wants_write = false;
        cvar.notify_all();

        ret
    }
}

#[derive(Debug)]
pub struct EndpointReadGuard<'a, T: ?Sized> {
    wants_write: &'a (Mutex<bool>, Condvar),
    inner: RwLockReadGuard<'a, T>,
}

impl<'a, T: ?Sized> EndpointReadGuard<'a, T> {
    /// Upgrade to a write lock, run `mut_func`, then drop back to holding no
    /// lock at all. `prep_func` runs once write intent has been announced
    /// but before the write lock is actually acquired, so callers can use it
    /// to double check whether the write is still needed.
    pub fn try_writeable<U, P: FnOnce(&T) -> bool, F: FnOnce(&mut T) -> U>(
        &mut self,
        prep_func: P,
        mut_func: F,
    ) -> Option<U> {
        {
            let (lock, cvar) = &self.wants_write;
            let mut wants_write = lock.lock();

            RwLockReadGuard::unlocked(&mut self.inner, move || {
                while *wants_write {
                    cvar.wait(&mut wants_write);
                }
                *wants_write = true;
            });
        }

        let should_write = prep_func(&self.inner);

        let lock = RwLockReadGuard::rwlock(&self.inner);

        let ret = if should_write {
            Some(RwLockReadGuard::unlocked(&mut self.inner, move || {
                let mut write_access = lock.write();
                mut_func(&mut write_access)
            }))
        } else {
            None
        };

        let (lock, cvar) = &self.wants_write;
        let mut wants_write = lock.lock();
        *wants_write = false;
        cvar.notify_all();

        ret
    }
}

impl<'a, T: ?Sized> Deref for EndpointReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_is_visible_to_later_readers() {
        let lock = Arc::new(EndpointLock::new(0u32));
        lock.write(|v| *v = 7);
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn concurrent_readers_do_not_deadlock_a_writer() {
        let lock = Arc::new(EndpointLock::new(0u32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _g = lock.read();
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            lock.write(|v| *v += 1);
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 50);
    }
}
