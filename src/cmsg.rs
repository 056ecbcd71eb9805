// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Building and parsing the `IP_PKTINFO` / `IPV6_PKTINFO` ancillary control
//! message that pins a datagram's source address and egress interface.
//!
//! There is no safe, portable crate API for ancillary data in this shape, so
//! this module talks to `libc`'s `cmsghdr` machinery directly.

use std::mem::{size_of, zeroed};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::endpoint::SourceBinding;

/// A control buffer sized to hold exactly one `PKTINFO` ancillary message,
/// for either family (the v6 variant is larger, so it sets the size).
#[derive(Clone, Debug)]
pub struct ControlBuffer {
    bytes: Vec<u8>,
}

fn cmsg_space(payload_len: usize) -> usize {
    unsafe { libc::CMSG_SPACE(payload_len as u32) as usize }
}

impl ControlBuffer {
    pub fn empty() -> Self {
        ControlBuffer { bytes: Vec::new() }
    }

    /// Build the ancillary buffer for `binding`, or an empty buffer if the
    /// binding has no resolved source yet.
    pub fn for_source(binding: &SourceBinding) -> Self {
        match binding {
            SourceBinding::None => ControlBuffer::empty(),
            SourceBinding::V4 { addr, ifindex } => {
                let pktinfo = libc::in_pktinfo {
                    ipi_ifindex: *ifindex as i32,
                    ipi_spec_dst: libc::in_addr {
                        s_addr: u32::from_ne_bytes(addr.octets()),
                    },
                    ipi_addr: libc::in_addr { s_addr: 0 },
                };
                Self::build(libc::IPPROTO_IP, libc::IP_PKTINFO, &pktinfo)
            }
            SourceBinding::V6 { addr, ifindex } => {
                let pktinfo = libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: addr.octets(),
                    },
                    ipi6_ifindex: *ifindex,
                };
                Self::build(libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, &pktinfo)
            }
        }
    }

    fn build<T: Copy>(level: i32, ty: i32, payload: &T) -> Self {
        let payload_len = size_of::<T>();
        let space = cmsg_space(payload_len);
        let mut bytes = vec![0u8; space];

        unsafe {
            let mut msg: libc::msghdr = zeroed();
            msg.msg_control = bytes.as_mut_ptr() as *mut _;
            msg.msg_controllen = space as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            debug_assert!(!cmsg.is_null());
            (*cmsg).cmsg_level = level;
            (*cmsg).cmsg_type = ty;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                payload as *const T as *const u8,
                libc::CMSG_DATA(cmsg),
                payload_len,
            );
        }

        ControlBuffer { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Scan a received control buffer for a `PKTINFO` blob and return the
/// decoded source binding. Returns `None` when the buffer carries no
/// supported `PKTINFO` message (unsupported family, or control data was not
/// requested on the socket).
pub fn parse_pktinfo(control: &[u8]) -> Option<SourceBinding> {
    if control.is_empty() {
        return None;
    }

    unsafe {
        let mut msg: libc::msghdr = zeroed();
        msg.msg_control = control.as_ptr() as *mut _;
        msg.msg_controllen = control.len() as _;

        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let ty = (*cmsg).cmsg_type;

            if level == libc::IPPROTO_IP && ty == libc::IP_PKTINFO {
                let info: libc::in_pktinfo = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                let addr = Ipv4Addr::from(u32::to_ne_bytes(info.ipi_spec_dst.s_addr));
                return Some(SourceBinding::V4 {
                    addr,
                    ifindex: info.ipi_ifindex as u32,
                });
            }

            if level == libc::IPPROTO_IPV6 && ty == libc::IPV6_PKTINFO {
                let info: libc::in6_pktinfo = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                let addr = Ipv6Addr::from(info.ipi6_addr.s6_addr);
                return Some(SourceBinding::V6 {
                    addr,
                    ifindex: info.ipi6_ifindex,
                });
            }

            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    None
}
