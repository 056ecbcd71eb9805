// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Lifecycle controller (§4.7): brings a device's sockets up, tears them
//! down, and rebinds them in place when the interface's port changes —
//! wrapping the pieces built elsewhere (`registry`, `socket`, `route_table`,
//! `route_monitor`, `send_context`) into the three operations a caller
//! actually drives: `Init`, `SocketReinit`, `Unload`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collaborators::PacketReceiver;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::family::AddressFamily;
use crate::generation::RoutingGenerations;
use crate::route_monitor::RouteMonitor;
use crate::route_table::RouteTable;
use crate::send_context::SendContextPool;
use crate::socket::SocketObject;

/// Number of concurrently in-flight sends a device's pool admits.
const SEND_CONTEXT_POOL_CAPACITY: usize = 256;

/// Bind retries attempted when the caller asked for an ephemeral port (0)
/// and happened to race another process for the one the kernel picked.
const WILDCARD_PORT_BIND_RETRIES: u32 = 100;

/// Everything a running device needs besides the per-peer state the caller
/// owns: the published sockets, the routing-table view, the generation
/// counters the resolver checks against, the background route-change
/// monitor, and the bounded send-context pool.
pub struct Lifecycle {
    device: Arc<Device>,
    route_table: Arc<dyn RouteTable>,
    generations: Arc<RoutingGenerations>,
    own_interface_index: u32,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    route_monitor: Mutex<Option<RouteMonitor>>,
    send_pool: Mutex<Option<Arc<SendContextPool>>>,
    receiver: Mutex<Option<Arc<dyn PacketReceiver>>>,
}

impl Lifecycle {
    pub fn new(device: Arc<Device>, route_table: Arc<dyn RouteTable>, own_interface_index: u32) -> Self {
        Lifecycle {
            device,
            route_table,
            generations: Arc::new(RoutingGenerations::new()),
            own_interface_index,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            route_monitor: Mutex::new(None),
            send_pool: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn route_table(&self) -> &Arc<dyn RouteTable> {
        &self.route_table
    }

    pub fn generations(&self) -> &Arc<RoutingGenerations> {
        &self.generations
    }

    pub fn own_interface_index(&self) -> u32 {
        self.own_interface_index
    }

    /// Returns the pool a send call must allocate its contexts from. `None`
    /// before `Init` has run.
    pub fn send_pool(&self) -> Option<Arc<SendContextPool>> {
        self.send_pool.lock().clone()
    }

    /// `Init`: idempotent and sticky. The first caller does the real work
    /// under `init_lock`; everyone else, including a caller racing the
    /// first one, observes the fully-initialized state or blocks briefly
    /// until it appears.
    pub fn init(&self, receiver: Arc<dyn PacketReceiver>) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let _serialize = self.init_lock.lock();
        if self.is_initialized() {
            return Ok(());
        }

        *self.receiver.lock() = Some(receiver);
        *self.send_pool.lock() = Some(SendContextPool::new(SEND_CONTEXT_POOL_CAPACITY));

        let monitor = match RouteMonitor::spawn(self.generations.clone()) {
            Ok(monitor) => monitor,
            Err(e) => {
                self.send_pool.lock().take();
                self.receiver.lock().take();
                return Err(Error::Io(e));
            }
        };
        *self.route_monitor.lock() = Some(monitor);

        self.device.set_up(true);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// `Unload`: symmetric teardown. Safe to call on a device that was
    /// never initialized, or twice in a row.
    pub fn unload(&self) {
        let _serialize = self.init_lock.lock();
        if !self.is_initialized() {
            return;
        }

        self.device.set_up(false);
        self.device.sockets.reinit(None, None);
        self.route_monitor.lock().take();
        self.send_pool.lock().take();
        self.receiver.lock().take();

        self.initialized.store(false, Ordering::Release);
    }

    /// `SocketInit` / `SocketReinit`: bind a fresh v4 socket on `port`
    /// (0 for an OS-assigned ephemeral port), then bind v6 on whatever port
    /// the v4 bind landed on, publish both, and update the device's
    /// recorded incoming port. Retries a wildcard-port bind on
    /// `AddressAlreadyInUse` since two sequential ephemeral binds can
    /// legitimately race each other for the same port.
    pub fn socket_reinit(&self, port: u16) -> Result<u16> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let mut attempts = 0;
        let (v4, v6, bound_port) = loop {
            match bind_pair(port) {
                Ok(pair) => break pair,
                Err(Error::AddressAlreadyInUse) if port == 0 && attempts < WILDCARD_PORT_BIND_RETRIES => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        self.device.sockets.reinit(Some(v4), Some(v6));
        self.device.set_incoming_port(bound_port);
        Ok(bound_port)
    }
}

/// Binds a v4 socket on `port` (or an ephemeral one) and a v6 socket on
/// whichever port the v4 bind actually landed on, so both families answer
/// on the same externally-visible port.
fn bind_pair(requested_port: u16) -> Result<(Arc<SocketObject>, Arc<SocketObject>, u16)> {
    let v4_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), requested_port);
    let (v4_socket, v4_local) = create_bound(AddressFamily::V4, v4_addr)?;

    let v6_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), v4_local.port());
    let (v6_socket, _v6_local) = create_bound(AddressFamily::V6, v6_addr)?;

    Ok((Arc::new(v4_socket), Arc::new(v6_socket), v4_local.port()))
}

fn create_bound(family: AddressFamily, addr: SocketAddr) -> Result<(SocketObject, SocketAddr)> {
    SocketObject::create_and_bind(std::sync::Weak::new(), family, addr).map_err(|e| match e {
        Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::AddrInUse => {
            Error::AddressAlreadyInUse
        }
        other => other,
    })
}
