// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Upcalls into whatever owns the crypto/dispatch layer above this socket
//! layer. Kept as a trait so tests can substitute a recording stub instead
//! of standing up a full device.

use crate::receive::ReceivedDatagram;

/// Length, in bytes, of the canonical empty-data keepalive payload. Used by
/// the send pipeline to classify whether a batch was keepalive-only.
pub const KEEPALIVE_DATA_LEN: usize = 0;

/// Hands a batch of accepted inbound datagrams to whatever does
/// decryption and dispatch. Implementations must not block the receive
/// dispatcher for long; this runs on the kernel's receive-event thread.
pub trait PacketReceiver: Send + Sync {
    fn packet_receive(&self, datagrams: Vec<ReceivedDatagram>);
}

/// A collaborator that drops every batch it receives. Useful for lifecycle
/// and send-path tests that don't care about inbound traffic.
pub struct DiscardingReceiver;

impl PacketReceiver for DiscardingReceiver {
    fn packet_receive(&self, _datagrams: Vec<ReceivedDatagram>) {}
}
