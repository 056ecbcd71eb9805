// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Subscribes to OS routing-table change notifications and bumps the
//! corresponding [`RoutingGenerations`] counter. Talks to `AF_NETLINK`
//! directly with `libc` rather than through an async client, since all this
//! needs is "a route for some family changed" — no message is ever parsed
//! beyond its address family byte.

use std::io;
use std::mem::{size_of, zeroed};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::family::AddressFamily;
use crate::generation::RoutingGenerations;

const RTMGRP_IPV4_ROUTE: u32 = 0x40;
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

pub struct RouteMonitor {
    stop: Arc<AtomicBool>,
    fd: RawFd,
    handle: Option<JoinHandle<()>>,
}

impl RouteMonitor {
    /// Open a netlink route socket and spawn a background thread that bumps
    /// `generations` on every notification, for as long as the returned
    /// handle is alive.
    pub fn spawn(generations: Arc<RoutingGenerations>) -> io::Result<Self> {
        let fd = open_route_socket()?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("route-generation-monitor".into())
            .spawn(move || monitor_loop(fd, generations, thread_stop))?;

        Ok(RouteMonitor {
            stop,
            fd,
            handle: Some(handle),
        })
    }
}

impl Drop for RouteMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        unsafe {
            // Unblocks the monitor thread's blocking recv so it can observe
            // the stop flag and exit.
            libc::shutdown(self.fd, libc::SHUT_RDWR);
            libc::close(self.fd);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn open_route_socket() -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_nl = zeroed();
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_groups = RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE;

        let rc = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_nl>() as u32,
        );
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn monitor_loop(fd: RawFd, generations: Arc<RoutingGenerations>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 8192];

    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
        if stop.load(Ordering::Acquire) {
            return;
        }
        if n <= 0 {
            continue;
        }

        for family in families_touched(&buf[..n as usize]) {
            generations.bump(family);
        }
    }
}

/// Walk the chain of `nlmsghdr`s in one recv buffer and report which address
/// families had a route add/delete/replace in it. A route message's address
/// family lives in the first byte of the `rtmsg` payload that follows the
/// header.
fn families_touched(buf: &[u8]) -> Vec<AddressFamily> {
    const NLMSG_HDRLEN: usize = size_of::<libc::nlmsghdr>();
    let mut families = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let hdr: libc::nlmsghdr =
            unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const _) };
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }

        let is_route_msg = matches!(
            hdr.nlmsg_type,
            libc::RTM_NEWROUTE | libc::RTM_DELROUTE
        );
        if is_route_msg && offset + NLMSG_HDRLEN < buf.len() {
            match buf[offset + NLMSG_HDRLEN] as i32 {
                libc::AF_INET => families.push(AddressFamily::V4),
                libc::AF_INET6 => families.push(AddressFamily::V6),
                _ => {}
            }
        }

        offset += align_nlmsg(msg_len);
    }

    families
}

fn align_nlmsg(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlmsg(nlmsg_type: u16, family: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 32];
        let hdr_len = size_of::<libc::nlmsghdr>();
        let hdr = libc::nlmsghdr {
            nlmsg_len: buf.len() as u32,
            nlmsg_type,
            nlmsg_flags: 0,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        };
        unsafe {
            std::ptr::write_unaligned(buf.as_mut_ptr() as *mut libc::nlmsghdr, hdr);
        }
        buf[hdr_len] = family;
        buf
    }

    #[test]
    fn recognizes_v4_route_notification() {
        let buf = nlmsg(libc::RTM_NEWROUTE as u16, libc::AF_INET as u8);
        assert_eq!(families_touched(&buf), vec![AddressFamily::V4]);
    }

    #[test]
    fn recognizes_v6_route_notification() {
        let buf = nlmsg(libc::RTM_DELROUTE as u16, libc::AF_INET6 as u8);
        assert_eq!(families_touched(&buf), vec![AddressFamily::V6]);
    }

    #[test]
    fn ignores_non_route_messages() {
        let buf = nlmsg(libc::RTM_NEWLINK as u16, libc::AF_INET as u8);
        assert!(families_touched(&buf).is_empty());
    }
}
