// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! UDP socket layer for a WireGuard-style VPN data plane.
//!
//! This crate owns source-address resolution against the live routing
//! table, lock-free publication of socket handles and endpoint bindings,
//! and the batched send pipeline. It does not implement the Noise
//! handshake, the per-peer packet queue, or any device-wide control
//! surface — those are the caller's concern; this crate only moves
//! datagrams in and out of the kernel on the caller's behalf.

pub mod cmsg;
pub mod collaborators;
pub mod datagram;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod family;
pub mod generation;
pub mod lifecycle;
pub mod lock;
pub mod peer;
pub mod receive;
pub mod registry;
pub mod resolver;
pub mod route_monitor;
pub mod route_table;
pub mod rundown;
pub mod send;
pub mod send_context;
pub mod socket;

pub use error::{Error, Result};
