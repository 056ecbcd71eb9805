// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The peer state this crate actually needs: the endpoint store operations
//! from §4.3 plus the handful of fields the send pipeline reads. Everything
//! else about a peer (its keys, allowed IPs, handshake state) belongs to the
//! caller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::device::Device;
use crate::endpoint::{endpoint_from_received, endpoints_equal, Endpoint};
use crate::lock::EndpointLock;

pub struct Peer {
    endpoint: EndpointLock<Endpoint>,
    owning_device: Weak<Device>,
    tx_bytes: AtomicU64,
}

impl Peer {
    pub fn new(owning_device: Weak<Device>) -> Self {
        Peer {
            endpoint: EndpointLock::new(Endpoint::default()),
            owning_device,
            tx_bytes: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &EndpointLock<Endpoint> {
        &self.endpoint
    }

    pub fn owning_device(&self) -> Option<std::sync::Arc<Device>> {
        self.owning_device.upgrade()
    }

    pub fn add_tx_bytes(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// `SetPeerEndpoint`: an unlocked optimistic equality check short-circuits
    /// the common case of a send re-confirming an endpoint that hasn't
    /// changed. Divergent concurrent writers race to last-writer-wins.
    pub fn set_endpoint(&self, candidate: &Endpoint) {
        {
            let current = self.endpoint.read();
            if endpoints_equal(&current, candidate) {
                return;
            }
        }

        self.endpoint.write(|live| {
            live.set_remote(candidate.remote);
            live.set_source(candidate.source, candidate.routing_generation);
        });
    }

    /// `SetPeerEndpointFromNbl`: extracts an endpoint from a received
    /// datagram's source address and `PKTINFO`, silently doing nothing if
    /// extraction fails.
    pub fn set_endpoint_from_received(
        &self,
        remote: SocketAddr,
        control: &[u8],
        routing_generation: u32,
    ) {
        if let Ok(candidate) = endpoint_from_received(remote, control, routing_generation) {
            self.set_endpoint(&candidate);
        }
    }

    /// `ClearPeerEndpointSrc`: forces the next `ResolveSource` to
    /// unconditionally query the OS.
    pub fn clear_endpoint_source(&self) {
        self.endpoint.write(|e| e.clear_source());
    }
}
