// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Resolves the source address and egress interface for a peer's remote
//! endpoint by scanning the live forwarding table, then commits the result
//! into the peer's endpoint under the optimistic update-generation protocol.

use crate::endpoint::{Endpoint, SourceBinding};
use crate::error::{Error, Result};
use crate::family::AddressFamily;
use crate::generation::RoutingGenerations;
use crate::lock::{EndpointLock, EndpointReadGuard};
use crate::route_table::RouteTable;

/// `ResolveSource`: on success, returns the peer's endpoint lock held in
/// shared mode with a live cached source binding.
///
/// `own_interface_index` is the tunnel's own egress interface; forwarding
/// entries that route back out through it are skipped to avoid looping
/// traffic through the tunnel it is trying to carry.
pub fn resolve_source<'a>(
    endpoint: &'a EndpointLock<Endpoint>,
    route_table: &dyn RouteTable,
    generations: &RoutingGenerations,
    own_interface_index: u32,
) -> Result<EndpointReadGuard<'a, Endpoint>> {
    loop {
        let guard = endpoint.read();
        let snapshot = guard.update_generation;
        let family = guard.family().ok_or(Error::UnreachableAddress)?;
        let current_generation = generations.current(family);

        if guard.source_is_live(current_generation) {
            return Ok(guard);
        }

        let remote = guard.remote.ip().ok_or(Error::UnreachableAddress)?;
        drop(guard);

        let source = resolve_once(route_table, family, remote, own_interface_index)?;

        let mut guard = endpoint.read();
        let committed = guard.try_writeable(
            |e| e.update_generation == snapshot,
            |e| e.set_source(source, current_generation),
        );

        match committed {
            Some(()) if guard.update_generation == snapshot.wrapping_add(1) => {
                return Ok(guard);
            }
            _ => continue,
        }
    }
}

/// Steps 3-5 of the resolve protocol: fetch the table, score candidates,
/// and ask the OS for a source address on the winning interface.
fn resolve_once(
    route_table: &dyn RouteTable,
    family: AddressFamily,
    remote: std::net::IpAddr,
    own_interface_index: u32,
) -> Result<SourceBinding> {
    let entries = route_table.forwarding_table(family);

    let mut best: Option<(u8, u32, u32)> = None; // (prefix_len, combined_metric, interface_index)
    for entry in entries {
        if entry.interface_index == own_interface_index {
            continue;
        }
        if !entry.destination.contains(remote) {
            continue;
        }
        if !route_table.interface_is_up(entry.interface_index) {
            continue;
        }
        let Some(interface_metric) = route_table.interface_metric(entry.interface_index) else {
            continue;
        };

        let combined_metric = entry.metric.saturating_add(interface_metric);
        let prefix_len = entry.destination.netmask();

        let better = match best {
            None => true,
            Some((best_len, best_metric, _)) => {
                prefix_len > best_len || (prefix_len == best_len && combined_metric < best_metric)
            }
        };
        if better {
            best = Some((prefix_len, combined_metric, entry.interface_index));
        }
    }

    let (_, _, interface_index) = best.ok_or(Error::UnreachableAddress)?;

    let source_addr = route_table
        .source_address_for_interface(interface_index, remote)
        .ok_or(Error::NetworkPath)?;

    Ok(match (family, source_addr) {
        (AddressFamily::V4, std::net::IpAddr::V4(addr)) => SourceBinding::V4 {
            addr,
            ifindex: interface_index,
        },
        (AddressFamily::V6, std::net::IpAddr::V6(addr)) => SourceBinding::V6 {
            addr,
            ifindex: interface_index,
        },
        _ => return Err(Error::NetworkPath),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RemoteAddress;
    use crate::route_table::{ForwardingEntry, InMemoryRouteTable};
    use ip_network::IpNetwork;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn table_with_default_route(iface: u32, metric: u32, up: bool, source: Ipv4Addr) -> InMemoryRouteTable {
        InMemoryRouteTable::new()
            .with_route(ForwardingEntry {
                destination: IpNetwork::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
                metric,
                interface_index: iface,
                preferred_source: None,
            })
            .with_interface(iface, 0, up, std::net::IpAddr::V4(source))
    }

    #[test]
    fn resolves_via_default_route() {
        let table = table_with_default_route(7, 10, true, Ipv4Addr::new(192, 0, 2, 5));
        let generations = RoutingGenerations::new();

        let mut endpoint = Endpoint::default();
        endpoint.set_remote(RemoteAddress::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 0, 2, 1),
            51820,
        )));
        let lock = EndpointLock::new(endpoint);

        let guard = resolve_source(&lock, &table, &generations, 0).unwrap();
        assert_eq!(
            guard.source,
            SourceBinding::V4 {
                addr: Ipv4Addr::new(192, 0, 2, 5),
                ifindex: 7,
            }
        );
    }

    #[test]
    fn skips_own_interface_to_avoid_loop() {
        let table = table_with_default_route(7, 10, true, Ipv4Addr::new(192, 0, 2, 5));
        let generations = RoutingGenerations::new();

        let mut endpoint = Endpoint::default();
        endpoint.set_remote(RemoteAddress::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 0, 2, 1),
            51820,
        )));
        let lock = EndpointLock::new(endpoint);

        let err = resolve_source(&lock, &table, &generations, 7).unwrap_err();
        assert!(matches!(err, Error::UnreachableAddress));
    }

    #[test]
    fn down_interface_is_skipped() {
        let table = table_with_default_route(7, 10, false, Ipv4Addr::new(192, 0, 2, 5));
        let generations = RoutingGenerations::new();

        let mut endpoint = Endpoint::default();
        endpoint.set_remote(RemoteAddress::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 0, 2, 1),
            51820,
        )));
        let lock = EndpointLock::new(endpoint);

        let err = resolve_source(&lock, &table, &generations, 0).unwrap_err();
        assert!(matches!(err, Error::UnreachableAddress));
    }

    #[test]
    fn longest_prefix_wins_over_lower_metric() {
        let table = InMemoryRouteTable::new()
            .with_route(ForwardingEntry {
                destination: IpNetwork::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
                metric: 1,
                interface_index: 9,
                preferred_source: None,
            })
            .with_route(ForwardingEntry {
                destination: IpNetwork::new(Ipv4Addr::new(192, 0, 2, 0), 24).unwrap(),
                metric: 100,
                interface_index: 7,
                preferred_source: None,
            })
            .with_interface(9, 0, true, std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .with_interface(7, 0, true, std::net::IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)));

        let generations = RoutingGenerations::new();
        let mut endpoint = Endpoint::default();
        endpoint.set_remote(RemoteAddress::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 0, 2, 1),
            51820,
        )));
        let lock = EndpointLock::new(endpoint);

        let guard = resolve_source(&lock, &table, &generations, 0).unwrap();
        assert_eq!(guard.source.ifindex(), 7);
    }

    #[test]
    fn cached_binding_short_circuits_when_generation_matches() {
        let table = table_with_default_route(7, 10, true, Ipv4Addr::new(192, 0, 2, 5));
        let generations = RoutingGenerations::new();

        let mut endpoint = Endpoint::default();
        endpoint.set_remote(RemoteAddress::V4(SocketAddrV4::new(
            Ipv4Addr::new(192, 0, 2, 1),
            51820,
        )));
        endpoint.set_source(
            SourceBinding::V4 {
                addr: Ipv4Addr::new(198, 51, 100, 1),
                ifindex: 3,
            },
            generations.current(AddressFamily::V4),
        );
        let lock = EndpointLock::new(endpoint);

        let guard = resolve_source(&lock, &table, &generations, 0).unwrap();
        assert_eq!(guard.source.ifindex(), 3);
    }
}
