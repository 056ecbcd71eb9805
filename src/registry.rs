// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Lock-free read / exclusive-write publication of a device's two sockets
//! (§4.4). Readers dereference an `ArcSwapOption` without ever blocking a
//! writer; writers serialize amongst themselves with a push-lock, swap the
//! pointer, and wait for a grace period before the displaced socket's
//! handle is allowed to close.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::family::AddressFamily;
use crate::socket::SocketObject;

const GRACE_PERIOD_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Per-device pair of published sockets.
pub struct SocketRegistry {
    v4: ArcSwapOption<SocketObject>,
    v6: ArcSwapOption<SocketObject>,
    /// Serializes writers (`SocketReinit`); readers never touch this.
    push_lock: Mutex<()>,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        SocketRegistry {
            v4: ArcSwapOption::const_empty(),
            v6: ArcSwapOption::const_empty(),
            push_lock: Mutex::new(()),
        }
    }
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reader's lightweight read section: load the current pointer for
    /// `family` and hold a strong reference to it for as long as needed.
    pub fn load(&self, family: AddressFamily) -> Option<Arc<SocketObject>> {
        self.slot(family).load_full()
    }

    fn slot(&self, family: AddressFamily) -> &ArcSwapOption<SocketObject> {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// `SocketReinit`: publish `new4`/`new6` (either may be `None` to leave
    /// that family unpublished), then wait for the grace period and close
    /// the displaced sockets. Returns the old sockets' local addresses so
    /// the caller can update `Device::incoming_port`, but the actual close
    /// happens here.
    pub fn reinit(
        &self,
        new4: Option<Arc<SocketObject>>,
        new6: Option<Arc<SocketObject>>,
    ) -> (Option<Arc<SocketObject>>, Option<Arc<SocketObject>>) {
        let _serialize = self.push_lock.lock();

        let old4 = self.v4.swap(new4);
        let old6 = self.v6.swap(new6);

        drop(_serialize);

        wait_for_grace_period(&old4);
        wait_for_grace_period(&old6);

        if let Some(old) = &old4 {
            old.drain();
        }
        if let Some(old) = &old6 {
            old.drain();
        }

        (old4, old6)
    }
}

/// A grace period has elapsed once every reader that took a strong
/// reference before the swap has dropped it, which shows up as this being
/// the only remaining owner.
fn wait_for_grace_period(old: &Option<Arc<SocketObject>>) {
    let Some(old) = old else { return };
    while Arc::strong_count(old) > 1 {
        std::thread::sleep(GRACE_PERIOD_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::AddressFamily;
    use std::sync::Weak;

    fn loopback_socket(family: AddressFamily, port: u16) -> Arc<SocketObject> {
        let addr = match family {
            AddressFamily::V4 => format!("127.0.0.1:{port}").parse().unwrap(),
            AddressFamily::V6 => format!("[::1]:{port}").parse().unwrap(),
        };
        let (socket, _local) = SocketObject::create_and_bind(Weak::new(), family, addr).unwrap();
        Arc::new(socket)
    }

    #[test]
    fn publishes_and_loads_a_socket() {
        let registry = SocketRegistry::new();
        assert!(registry.load(AddressFamily::V4).is_none());

        let socket = loopback_socket(AddressFamily::V4, 0);
        registry.reinit(Some(socket), None);

        assert!(registry.load(AddressFamily::V4).is_some());
        assert!(registry.load(AddressFamily::V6).is_none());
    }

    #[test]
    fn reinit_waits_for_readers_before_returning() {
        let registry = SocketRegistry::new();
        let first = loopback_socket(AddressFamily::V4, 0);
        registry.reinit(Some(first), None);

        let reader_ref = registry.load(AddressFamily::V4).unwrap();

        let second = loopback_socket(AddressFamily::V4, 0);
        let registry = Arc::new(registry);
        let registry2 = registry.clone();
        let handle = std::thread::spawn(move || {
            registry2.reinit(Some(second), None);
        });

        std::thread::sleep(Duration::from_millis(10));
        drop(reader_ref);
        handle.join().unwrap();

        assert!(registry.load(AddressFamily::V4).is_some());
    }
}
