// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Routing-generation counters.
//!
//! Two process-wide counters, one per address family. Each is bumped by a
//! route-change notification; readers compare the value stamped on their
//! cached source binding against the live counter to detect staleness. A
//! stale miss is cheap and self-correcting: it just triggers a re-resolution
//! on the next send, so the load on the hot path is a single relaxed load.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::family::AddressFamily;

/// Bumped by +2 (even values only) per notification. The increment is
/// historical: any implementation that keeps equality comparison correct
/// (e.g. plain +1) would satisfy the same contract.
const STEP: u32 = 2;

#[derive(Default)]
pub struct RoutingGenerations {
    v4: AtomicU32,
    v6: AtomicU32,
}

impl RoutingGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, family: AddressFamily) -> &AtomicU32 {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// Record that the OS routing table changed for `family`.
    pub fn bump(&self, family: AddressFamily) {
        self.counter(family).fetch_add(STEP, Ordering::Relaxed);
    }

    /// Fenceless read of the current generation. Exact currency is
    /// unnecessary: a reader racing a concurrent `bump` simply resolves
    /// again on its next send.
    pub fn current(&self, family: AddressFamily) -> u32 {
        self.counter(family).load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_bumps_independently() {
        let gens = RoutingGenerations::new();
        assert_eq!(gens.current(AddressFamily::V4), 0);
        assert_eq!(gens.current(AddressFamily::V6), 0);

        gens.bump(AddressFamily::V4);
        assert_eq!(gens.current(AddressFamily::V4), 2);
        assert_eq!(gens.current(AddressFamily::V6), 0);

        gens.bump(AddressFamily::V4);
        gens.bump(AddressFamily::V6);
        assert_eq!(gens.current(AddressFamily::V4), 4);
        assert_eq!(gens.current(AddressFamily::V6), 2);
    }
}
