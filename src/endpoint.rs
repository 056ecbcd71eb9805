// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The endpoint data model: the tuple (remote address+port, cached
//! source binding, egress interface index) describing one direction of the
//! UDP conversation with a peer.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::cmsg::ControlBuffer;
use crate::family::AddressFamily;

/// The peer's remote address, family-tagged so a peer that has never been
/// given one (`None`) is a distinct, representable state rather than an
/// `Option` wrapped around everything else.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RemoteAddress {
    None,
    V4(SocketAddrV4),
    V6 {
        addr: Ipv6Addr,
        port: u16,
        scope_id: u32,
    },
}

impl RemoteAddress {
    pub fn family(&self) -> Option<AddressFamily> {
        match self {
            RemoteAddress::None => None,
            RemoteAddress::V4(_) => Some(AddressFamily::V4),
            RemoteAddress::V6 { .. } => Some(AddressFamily::V6),
        }
    }

    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self {
            RemoteAddress::None => None,
            RemoteAddress::V4(a) => Some(std::net::IpAddr::V4(*a.ip())),
            RemoteAddress::V6 { addr, .. } => Some(std::net::IpAddr::V6(*addr)),
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            RemoteAddress::None => None,
            RemoteAddress::V4(a) => Some(SocketAddr::V4(*a)),
            RemoteAddress::V6 { addr, port, scope_id } => {
                Some(SocketAddr::V6(SocketAddrV6::new(*addr, *port, 0, *scope_id)))
            }
        }
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => RemoteAddress::V4(a),
            SocketAddr::V6(a) => RemoteAddress::V6 {
                addr: *a.ip(),
                port: a.port(),
                scope_id: a.scope_id(),
            },
        }
    }
}

/// The source address + egress interface the resolver last pinned for this
/// endpoint, or `None` if nothing has been resolved (or the cache was
/// cleared).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SourceBinding {
    None,
    V4 { addr: Ipv4Addr, ifindex: u32 },
    V6 { addr: Ipv6Addr, ifindex: u32 },
}

impl SourceBinding {
    pub fn ifindex(&self) -> u32 {
        match self {
            SourceBinding::None => 0,
            SourceBinding::V4 { ifindex, .. } => *ifindex,
            SourceBinding::V6 { ifindex, .. } => *ifindex,
        }
    }
}

/// One direction of a UDP conversation with a peer.
///
/// Created zeroed inside each peer, mutated only through
/// [`crate::peer::Peer`]'s endpoint-store primitives, destroyed with the
/// peer.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub remote: RemoteAddress,
    pub source: SourceBinding,
    control: ControlBuffer,
    /// Routing generation stamped when `source` was written. Stale relative
    /// to the live [`crate::generation::RoutingGenerations`] counter means
    /// the cache must not be trusted.
    pub routing_generation: u32,
    /// Bumped on every write; used to detect a concurrent mutation across a
    /// lock release/reacquire in the resolver.
    pub update_generation: u32,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            remote: RemoteAddress::None,
            source: SourceBinding::None,
            control: ControlBuffer::empty(),
            routing_generation: 0,
            update_generation: 0,
        }
    }
}

impl Endpoint {
    pub fn family(&self) -> Option<AddressFamily> {
        self.remote.family()
    }

    /// A resolved source is live only if its stamped
    /// routing generation matches the family-wide current one and its
    /// interface index is non-zero.
    pub fn source_is_live(&self, current_routing_generation: u32) -> bool {
        self.routing_generation == current_routing_generation && self.source.ifindex() != 0
    }

    pub fn control_buffer(&self) -> &ControlBuffer {
        &self.control
    }

    /// Write a newly resolved source binding and rebuild the prebuilt
    /// control-message header to reference it. Bumps `update_generation`.
    pub fn set_source(&mut self, source: SourceBinding, routing_generation: u32) {
        self.control = ControlBuffer::for_source(&source);
        self.source = source;
        self.routing_generation = routing_generation;
        self.update_generation = self.update_generation.wrapping_add(1);
    }

    /// `ClearPeerEndpointSrc` forces the next resolve to
    /// unconditionally query the OS.
    pub fn clear_source(&mut self) {
        self.source = SourceBinding::None;
        self.control = ControlBuffer::empty();
        self.routing_generation = 0;
        self.update_generation = self.update_generation.wrapping_add(1);
    }

    pub fn set_remote(&mut self, remote: RemoteAddress) {
        self.remote = remote;
    }
}

/// `EndpointFromNbl`: parse a received datagram's source address and
/// `PKTINFO` control message into a standalone endpoint. Fails with
/// [`crate::error::Error::InvalidAddress`] when the control message is
/// missing or names a family that doesn't match the source address.
pub fn endpoint_from_received(
    remote: SocketAddr,
    control: &[u8],
    routing_generation: u32,
) -> Result<Endpoint, crate::error::Error> {
    use crate::error::Error;

    let source = crate::cmsg::parse_pktinfo(control).ok_or(Error::InvalidAddress)?;
    let remote = RemoteAddress::from(remote);

    match (remote.family(), &source) {
        (Some(AddressFamily::V4), SourceBinding::V4 { .. })
        | (Some(AddressFamily::V6), SourceBinding::V6 { .. }) => {}
        _ => return Err(Error::InvalidAddress),
    }

    let mut endpoint = Endpoint::default();
    endpoint.set_remote(remote);
    endpoint.set_source(source, routing_generation);
    Ok(endpoint)
}

/// `EndpointEq`: two endpoints are equal iff both are family
/// `None`, or both are the same family with equal remote address+port (and,
/// for v6, scope id) and equal cached source address and interface index.
/// Deliberately ignores `routing_generation` and `update_generation` — those
/// are bookkeeping, not identity.
pub fn endpoints_equal(a: &Endpoint, b: &Endpoint) -> bool {
    match (a.remote, b.remote) {
        (RemoteAddress::None, RemoteAddress::None) => true,
        (RemoteAddress::None, _) | (_, RemoteAddress::None) => false,
        _ => a.remote == b.remote && a.source == b.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4_endpoint(port: u16, src_ifindex: u32) -> Endpoint {
        let mut e = Endpoint::default();
        e.set_remote(RemoteAddress::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 0, 2, 1),
            port,
        )));
        if src_ifindex != 0 {
            e.set_source(
                SourceBinding::V4 {
                    addr: Ipv4Addr::new(192, 0, 2, 55),
                    ifindex: src_ifindex,
                },
                2,
            );
        }
        e
    }

    #[test]
    fn eq_is_reflexive_symmetric_transitive() {
        let a = v4_endpoint(51820, 7);
        let b = v4_endpoint(51820, 7);
        let c = v4_endpoint(51820, 7);

        assert!(endpoints_equal(&a, &a));
        assert!(endpoints_equal(&a, &b));
        assert!(endpoints_equal(&b, &a));
        assert!(endpoints_equal(&b, &c));
        assert!(endpoints_equal(&a, &c));
    }

    #[test]
    fn none_only_equals_none() {
        let none_a = Endpoint::default();
        let none_b = Endpoint::default();
        let some = v4_endpoint(51820, 7);

        assert!(endpoints_equal(&none_a, &none_b));
        assert!(!endpoints_equal(&none_a, &some));
        assert!(!endpoints_equal(&some, &none_a));
    }

    #[test]
    fn differing_port_is_not_equal() {
        let a = v4_endpoint(51820, 7);
        let b = v4_endpoint(51821, 7);
        assert!(!endpoints_equal(&a, &b));
    }

    #[test]
    fn ignores_generation_bookkeeping() {
        let mut a = v4_endpoint(51820, 7);
        let b = v4_endpoint(51820, 7);
        a.update_generation = 99;
        a.routing_generation = 12;
        assert!(endpoints_equal(&a, &b));
    }

    #[test]
    fn set_source_bumps_update_generation_and_rebuilds_control() {
        let mut e = Endpoint::default();
        assert_eq!(e.update_generation, 0);
        assert!(e.control_buffer().is_empty());

        e.set_source(
            SourceBinding::V4 {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                ifindex: 3,
            },
            4,
        );
        assert_eq!(e.update_generation, 1);
        assert!(!e.control_buffer().is_empty());
        assert!(e.source_is_live(4));
        assert!(!e.source_is_live(6));
    }

    #[test]
    fn clear_source_forces_next_resolve() {
        let mut e = v4_endpoint(51820, 7);
        assert!(e.source_is_live(2));
        e.clear_source();
        assert!(!e.source_is_live(2));
        assert_eq!(e.source, SourceBinding::None);
    }

    #[test]
    fn endpoint_from_received_round_trips_a_datagram() {
        use crate::cmsg::ControlBuffer;
        use std::net::SocketAddr;

        let source = SourceBinding::V4 {
            addr: Ipv4Addr::new(192, 0, 2, 55),
            ifindex: 7,
        };
        let control = ControlBuffer::for_source(&source);
        let remote: SocketAddr = "192.0.2.1:51820".parse().unwrap();

        let parsed = endpoint_from_received(remote, control.as_bytes(), 4).unwrap();
        assert_eq!(parsed.remote, RemoteAddress::from(remote));
        assert_eq!(parsed.source, source);
    }

    #[test]
    fn endpoint_from_received_rejects_missing_control_message() {
        use std::net::SocketAddr;

        let remote: SocketAddr = "192.0.2.1:51820".parse().unwrap();
        assert!(endpoint_from_received(remote, &[], 4).is_err());
    }
}
