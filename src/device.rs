// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The device state this crate reads: up/down flag, interface identity, the
//! bound incoming port, and the statistics counters the send/receive paths
//! maintain. Everything else about "a device" — peer table, crypto state,
//! control API — is the caller's.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use crate::registry::SocketRegistry;

#[derive(Default)]
pub struct DeviceStats {
    pub tx_bytes: AtomicU64,
    pub tx_unicast_packets: AtomicU64,
    pub rx_discards: AtomicU64,
}

pub struct Device {
    up: AtomicBool,
    interface_luid: u64,
    incoming_port: AtomicU16,
    pub sockets: SocketRegistry,
    pub stats: DeviceStats,
}

impl Device {
    pub fn new(interface_luid: u64) -> Self {
        Device {
            up: AtomicBool::new(false),
            interface_luid,
            incoming_port: AtomicU16::new(0),
            sockets: SocketRegistry::new(),
            stats: DeviceStats::default(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn interface_luid(&self) -> u64 {
        self.interface_luid
    }

    pub fn incoming_port(&self) -> u16 {
        self.incoming_port.load(Ordering::Acquire)
    }

    pub fn set_incoming_port(&self, port: u16) {
        self.incoming_port.store(port, Ordering::Release);
    }

    pub fn add_tx_bytes(&self, n: u64) {
        self.stats.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx_unicast_packet(&self) {
        self.stats.tx_unicast_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rx_discards(&self, n: u64) {
        self.stats.rx_discards.fetch_add(n, Ordering::Relaxed);
    }
}
