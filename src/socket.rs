// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The kernel-owned datagram socket a device sends and receives through.

use std::net::SocketAddr;
use std::sync::Weak;

use socket2::Socket;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::family::AddressFamily;
use crate::rundown::Rundown;

/// One bound UDP socket, with the rundown protection that lets the registry
/// close it safely once every in-flight received indication has drained.
pub struct SocketObject {
    owning_device: Weak<Device>,
    handle: Socket,
    family: AddressFamily,
    rundown: Rundown,
}

impl SocketObject {
    /// `CreateAndBindSocket`: create a UDP socket, apply the family-specific
    /// options the wire format depends on, bind it, and read back the local
    /// address (so a wildcard port request surfaces the OS-assigned port).
    pub fn create_and_bind(
        owning_device: Weak<Device>,
        family: AddressFamily,
        addr: SocketAddr,
    ) -> Result<(Self, SocketAddr)> {
        let domain = match family {
            AddressFamily::V4 => socket2::Domain::IPV4,
            AddressFamily::V6 => socket2::Domain::IPV6,
        };
        let handle = Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;

        apply_family_options(&handle, family)?;
        enable_pktinfo(&handle, family)?;

        handle.bind(&addr.into())?;
        handle.set_nonblocking(true)?;

        let local_addr = handle
            .local_addr()?
            .as_socket()
            .ok_or(Error::NetworkUnreachable)?;

        Ok((
            SocketObject {
                owning_device,
                handle,
                family,
                rundown: Rundown::new(),
            },
            local_addr,
        ))
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn owning_device(&self) -> Option<std::sync::Arc<Device>> {
        self.owning_device.upgrade()
    }

    pub fn rundown(&self) -> &Rundown {
        &self.rundown
    }

    pub fn raw(&self) -> &Socket {
        &self.handle
    }

    /// Block until every received indication that acquired rundown
    /// protection on this socket has released, then the handle may be
    /// closed by dropping this object.
    pub fn drain(&self) {
        self.rundown.wait_for_drain();
    }
}

fn apply_family_options(socket: &Socket, family: AddressFamily) -> Result<()> {
    match family {
        AddressFamily::V4 => {}
        AddressFamily::V6 => {
            socket.set_only_v6(true)?;
        }
    }
    Ok(())
}

fn enable_pktinfo(socket: &Socket, family: AddressFamily) -> Result<()> {
    match family {
        AddressFamily::V4 => setsockopt_flag(socket, libc::IPPROTO_IP, libc::IP_PKTINFO, true),
        AddressFamily::V6 => setsockopt_flag(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, true),
    }
}

fn setsockopt_flag(socket: &Socket, level: i32, name: i32, enabled: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let value: i32 = enabled as i32;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as u32,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
