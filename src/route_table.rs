// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The forwarding-table and link-state queries the resolver needs.
//!
//! [`RouteTable`] is the seam between the resolver's scoring algorithm and
//! the OS. [`InMemoryRouteTable`] is a hand-fed double for tests and for
//! targets without netlink; the `netlink` feature adds
//! [`netlink::NetlinkRouteTable`], a thin synchronous wrapper around
//! `rtnetlink`.

use std::net::IpAddr;

use ip_network::IpNetwork;

use crate::family::AddressFamily;

/// One row of the OS forwarding table, trimmed to what the resolver scores
/// candidates on.
#[derive(Clone, Copy, Debug)]
pub struct ForwardingEntry {
    pub destination: IpNetwork,
    pub metric: u32,
    pub interface_index: u32,
    /// Preferred source address attached to this route, if the OS reported
    /// one directly (common for routes to directly-connected subnets).
    pub preferred_source: Option<IpAddr>,
}

/// Abstraction over the OS routing subsystem, so the resolver's scoring
/// logic can be exercised without a live kernel routing table.
pub trait RouteTable: Send + Sync {
    /// Every row of the forwarding table for `family`. No filtering: the
    /// resolver does its own longest-prefix-match and metric scoring.
    fn forwarding_table(&self, family: AddressFamily) -> Vec<ForwardingEntry>;

    /// Per-interface metric contribution, added to a route's own metric
    /// when scoring candidates. `None` if the interface is unknown.
    fn interface_metric(&self, interface_index: u32) -> Option<u32>;

    /// Whether the interface's operational state is "up". An interface
    /// whose metadata can't be read at all should also resolve to `false`
    /// rather than erroring — the resolver treats it as unusable either way.
    fn interface_is_up(&self, interface_index: u32) -> bool;

    /// Best local source address for `remote` when sending out
    /// `interface_index`, used when a matched route carries no preferred
    /// source attribute of its own.
    fn source_address_for_interface(
        &self,
        interface_index: u32,
        remote: IpAddr,
    ) -> Option<IpAddr>;
}

/// A hand-fed routing table for tests and non-Linux targets.
#[derive(Default)]
pub struct InMemoryRouteTable {
    entries: Vec<ForwardingEntry>,
    interface_metrics: std::collections::HashMap<u32, u32>,
    interfaces_up: std::collections::HashMap<u32, bool>,
    interface_addresses: std::collections::HashMap<u32, IpAddr>,
}

impl InMemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, entry: ForwardingEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_interface(mut self, index: u32, metric: u32, up: bool, address: IpAddr) -> Self {
        self.interface_metrics.insert(index, metric);
        self.interfaces_up.insert(index, up);
        self.interface_addresses.insert(index, address);
        self
    }
}

impl RouteTable for InMemoryRouteTable {
    fn forwarding_table(&self, family: AddressFamily) -> Vec<ForwardingEntry> {
        self.entries
            .iter()
            .copied()
            .filter(|e| AddressFamily::of(e.destination.network_address()) == family)
            .collect()
    }

    fn interface_metric(&self, interface_index: u32) -> Option<u32> {
        self.interface_metrics.get(&interface_index).copied()
    }

    fn interface_is_up(&self, interface_index: u32) -> bool {
        self.interfaces_up
            .get(&interface_index)
            .copied()
            .unwrap_or(false)
    }

    fn source_address_for_interface(
        &self,
        interface_index: u32,
        _remote: IpAddr,
    ) -> Option<IpAddr> {
        self.interface_addresses.get(&interface_index).copied()
    }
}

#[cfg(feature = "netlink")]
pub mod netlink {
    use super::*;
    use netlink_packet_route::link::{LinkAttribute, State};
    use netlink_packet_route::route::{RouteAddress, RouteAttribute};
    use netlink_packet_route::AddressFamily as NetlinkAddressFamily;
    use rtnetlink::{Handle, RouteMessageBuilder};

    /// Synchronous facade over an async `rtnetlink` connection, run on a
    /// dedicated single-threaded runtime so the resolver's passive-level
    /// callers don't need to be async themselves.
    pub struct NetlinkRouteTable {
        handle: Handle,
        runtime: tokio::runtime::Runtime,
    }

    impl NetlinkRouteTable {
        pub fn new() -> std::io::Result<Self> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let (connection, handle, _) = runtime.block_on(async { rtnetlink::new_connection() })?;
            runtime.spawn(connection);
            Ok(NetlinkRouteTable { handle, runtime })
        }

        fn route_message(family: AddressFamily) -> netlink_packet_route::route::RouteMessage {
            match family {
                AddressFamily::V4 => RouteMessageBuilder::<std::net::Ipv4Addr>::new().build(),
                AddressFamily::V6 => RouteMessageBuilder::<std::net::Ipv6Addr>::new().build(),
            }
        }
    }

    impl RouteTable for NetlinkRouteTable {
        fn forwarding_table(&self, family: AddressFamily) -> Vec<ForwardingEntry> {
            use futures::TryStreamExt;

            self.runtime.block_on(async {
                let mut stream = self.handle.route().get(Self::route_message(family)).execute();
                let mut entries = Vec::new();

                while let Ok(Some(msg)) = stream.try_next().await {
                    let mut destination = None;
                    let mut preferred_source = None;
                    let mut interface_index = 0u32;
                    let mut metric = 0u32;

                    for attr in &msg.attributes {
                        match attr {
                            RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                                destination = IpNetwork::new(
                                    std::net::IpAddr::V4(*addr),
                                    msg.header.destination_prefix_length,
                                )
                                .ok();
                            }
                            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                                destination = IpNetwork::new(
                                    std::net::IpAddr::V6(*addr),
                                    msg.header.destination_prefix_length,
                                )
                                .ok();
                            }
                            RouteAttribute::PrefSource(RouteAddress::Inet(addr)) => {
                                preferred_source = Some(std::net::IpAddr::V4(*addr));
                            }
                            RouteAttribute::PrefSource(RouteAddress::Inet6(addr)) => {
                                preferred_source = Some(std::net::IpAddr::V6(*addr));
                            }
                            RouteAttribute::Oif(idx) => interface_index = *idx,
                            RouteAttribute::Priority(p) => metric = *p,
                            _ => {}
                        }
                    }

                    let destination = match destination {
                        Some(d) => d,
                        None => {
                            // No explicit destination attribute means the
                            // implicit default route (0.0.0.0/0 or ::/0).
                            let unspecified = match family {
                                AddressFamily::V4 => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                                AddressFamily::V6 => std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                            };
                            IpNetwork::new(unspecified, 0).expect("prefix length 0 is always valid")
                        }
                    };

                    entries.push(ForwardingEntry {
                        destination,
                        metric,
                        interface_index,
                        preferred_source,
                    });
                }

                entries
            })
        }

        fn interface_metric(&self, interface_index: u32) -> Option<u32> {
            use futures::TryStreamExt;

            // Linux doesn't expose a per-link routing metric outside of
            // individual route entries; this just confirms the link still
            // exists and contributes a neutral baseline.
            self.runtime.block_on(async {
                let mut stream = self
                    .handle
                    .link()
                    .get()
                    .match_index(interface_index)
                    .execute();
                stream.try_next().await.ok().flatten()?;
                Some(0)
            })
        }

        fn interface_is_up(&self, interface_index: u32) -> bool {
            use futures::TryStreamExt;

            self.runtime.block_on(async {
                let mut stream = self
                    .handle
                    .link()
                    .get()
                    .match_index(interface_index)
                    .execute();
                let Ok(Some(msg)) = stream.try_next().await else {
                    return false;
                };
                msg.attributes.iter().any(|attr| {
                    matches!(attr, LinkAttribute::OperState(State::Up))
                })
            })
        }

        fn source_address_for_interface(
            &self,
            interface_index: u32,
            remote: IpAddr,
        ) -> Option<IpAddr> {
            use futures::TryStreamExt;

            self.runtime.block_on(async {
                let mut addresses = self
                    .handle
                    .address()
                    .get()
                    .set_link_index_filter(interface_index)
                    .execute();

                while let Ok(Some(msg)) = addresses.try_next().await {
                    let matches_family = match remote {
                        IpAddr::V4(_) => msg.header.family == NetlinkAddressFamily::Inet,
                        IpAddr::V6(_) => msg.header.family == NetlinkAddressFamily::Inet6,
                    };
                    if !matches_family {
                        continue;
                    }
                    for attr in &msg.attributes {
                        if let netlink_packet_route::address::AddressAttribute::Address(addr) = attr {
                            return Some(*addr);
                        }
                    }
                }
                None
            })
        }
    }
}

#[cfg(feature = "netlink")]
pub use netlink::NetlinkRouteTable;
