// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Send pipeline (§4.5): resolves a peer's source address, snapshots its
//! endpoint into a pooled send context, and submits the datagrams to the
//! kernel — batched via `sendmmsg` where the platform has it, falling back
//! to a per-datagram `sendmsg` loop everywhere else.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use bytes::Bytes;

use crate::datagram::DatagramList;
use crate::device::Device;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::generation::RoutingGenerations;
use crate::peer::Peer;
use crate::receive::ReceivedDatagram;
use crate::route_table::RouteTable;
use crate::send_context::{SendContext, SendContextPool, SendPayload};
use crate::socket::SocketObject;

/// `SendDatagramListToPeer`: resolve source, submit the whole batch, and on
/// success account bytes/packets against both the peer and the device.
/// Returns whether every datagram in the batch was keepalive-length.
pub fn send_datagram_list_to_peer(
    device: &Device,
    peer: &Peer,
    pool: &std::sync::Arc<SendContextPool>,
    route_table: &dyn RouteTable,
    generations: &RoutingGenerations,
    own_interface_index: u32,
    list: DatagramList,
) -> Result<bool> {
    if list.is_empty() {
        return Err(Error::AlreadyComplete);
    }

    let all_keepalive = list.all_keepalive();
    let total_bytes = list.total_bytes();
    let packet_count = list.len();

    let guard =
        crate::resolver::resolve_source(peer.endpoint(), route_table, generations, own_interface_index)?;
    let endpoint = guard.clone();
    drop(guard);

    let ctx = pool.allocate(endpoint, SendPayload::Batched(list.into_buffers()))?;

    submit_send(device, ctx)?;

    peer.add_tx_bytes(total_bytes);
    device.add_tx_bytes(total_bytes);
    for _ in 0..packet_count {
        device.add_tx_unicast_packet();
    }

    Ok(all_keepalive)
}

/// `SendBufferToPeer`: single-buffer control/handshake send, resolving
/// source the same way the batched path does.
pub fn send_buffer_to_peer(
    device: &Device,
    peer: &Peer,
    pool: &std::sync::Arc<SendContextPool>,
    route_table: &dyn RouteTable,
    generations: &RoutingGenerations,
    own_interface_index: u32,
    buffer: Bytes,
) -> Result<()> {
    let guard =
        crate::resolver::resolve_source(peer.endpoint(), route_table, generations, own_interface_index)?;
    let endpoint = guard.clone();
    drop(guard);

    let len = buffer.len() as u64;
    let ctx = pool.allocate(endpoint, SendPayload::Single(buffer))?;
    submit_send(device, ctx)?;

    peer.add_tx_bytes(len);
    device.add_tx_bytes(len);
    device.add_tx_unicast_packet();
    Ok(())
}

/// `SendBufferAsReplyToNbl`: send back the way a received datagram came,
/// with no resolution — the endpoint is taken verbatim from the datagram
/// that prompted the reply. Used for cookie replies.
pub fn send_buffer_as_reply_to_received(
    device: &Device,
    pool: &std::sync::Arc<SendContextPool>,
    received: &ReceivedDatagram,
    routing_generation: u32,
    buffer: Bytes,
) -> Result<()> {
    let endpoint = crate::endpoint::endpoint_from_received(
        received.remote(),
        received.control(),
        routing_generation,
    )?;

    let ctx = pool.allocate(endpoint, SendPayload::Single(buffer))?;
    submit_send(device, ctx)
}

/// `SubmitSend`: pick the socket matching the context's endpoint family and
/// hand the payload to the kernel.
fn submit_send(device: &Device, ctx: SendContext) -> Result<()> {
    let family = ctx
        .endpoint
        .family()
        .ok_or(Error::NetworkUnreachable)?;
    let socket = device
        .sockets
        .load(family)
        .ok_or(Error::NetworkUnreachable)?;

    let remote = ctx
        .endpoint
        .remote
        .to_socket_addr()
        .ok_or(Error::NetworkUnreachable)?;
    let control = ctx.endpoint.control_buffer().as_bytes();

    match &ctx.payload {
        SendPayload::Batched(buffers) => send_batched(&socket, remote, control, buffers),
        SendPayload::Single(buffer) => send_one(&socket, remote, control, buffer),
    }
}

#[cfg(target_os = "linux")]
fn send_batched(
    socket: &SocketObject,
    remote: SocketAddr,
    control: &[u8],
    buffers: &[Bytes],
) -> Result<()> {
    if buffers.is_empty() {
        return Ok(());
    }

    let dest = socket2::SockAddr::from(remote);
    let mut iovecs: Vec<libc::iovec> = buffers
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut _,
            iov_len: b.len(),
        })
        .collect();

    let mut msgs: Vec<libc::mmsghdr> = iovecs
        .iter_mut()
        .map(|iov| libc::mmsghdr {
            msg_hdr: libc::msghdr {
                msg_name: dest.as_ptr() as *mut _,
                msg_namelen: dest.len(),
                msg_iov: iov as *mut _,
                msg_iovlen: 1,
                msg_control: control.as_ptr() as *mut _,
                msg_controllen: control.len(),
                msg_flags: 0,
            },
            msg_len: 0,
        })
        .collect();

    let fd = socket.raw().as_raw_fd();
    let rc = unsafe { libc::sendmmsg(fd, msgs.as_mut_ptr(), msgs.len() as u32, 0) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_batched(
    socket: &SocketObject,
    remote: SocketAddr,
    control: &[u8],
    buffers: &[Bytes],
) -> Result<()> {
    for buffer in buffers {
        send_one(socket, remote, control, buffer)?;
    }
    Ok(())
}

fn send_one(socket: &SocketObject, remote: SocketAddr, control: &[u8], buffer: &[u8]) -> Result<()> {
    let dest = socket2::SockAddr::from(remote);
    let iov = libc::iovec {
        iov_base: buffer.as_ptr() as *mut _,
        iov_len: buffer.len(),
    };
    let msg = libc::msghdr {
        msg_name: dest.as_ptr() as *mut _,
        msg_namelen: dest.len(),
        msg_iov: &iov as *const _ as *mut _,
        msg_iovlen: 1,
        msg_control: control.as_ptr() as *mut _,
        msg_controllen: control.len(),
        msg_flags: 0,
    };

    let fd = socket.raw().as_raw_fd();
    let rc = unsafe { libc::sendmsg(fd, &msg, 0) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::AddressFamily;
    use crate::route_table::{ForwardingEntry, InMemoryRouteTable};
    use ip_network::IpNetwork;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Weak};

    fn loopback_route_table(iface: u32) -> InMemoryRouteTable {
        InMemoryRouteTable::new()
            .with_route(ForwardingEntry {
                destination: IpNetwork::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
                metric: 1,
                interface_index: iface,
                preferred_source: None,
            })
            .with_interface(iface, 0, true, std::net::IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn empty_list_is_rejected_before_any_allocation() {
        let device = Device::new(1);
        let peer = Peer::new(Weak::new());
        let pool = SendContextPool::new(4);
        let route_table = loopback_route_table(2);
        let generations = RoutingGenerations::new();

        let err = send_datagram_list_to_peer(
            &device,
            &peer,
            &pool,
            &route_table,
            &generations,
            0,
            DatagramList::new(vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::AlreadyComplete));
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn send_without_a_bound_socket_is_network_unreachable() {
        let device = Device::new(1);
        let peer = Peer::new(Weak::new());
        peer.set_endpoint(&{
            let mut e = Endpoint::default();
            e.set_remote(crate::endpoint::RemoteAddress::V4(
                std::net::SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9999),
            ));
            e
        });
        let pool = SendContextPool::new(4);
        let route_table = loopback_route_table(2);
        let generations = RoutingGenerations::new();

        let err = send_buffer_to_peer(
            &device,
            &peer,
            &pool,
            &route_table,
            &generations,
            0,
            Bytes::from_static(b"hello"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NetworkUnreachable));
    }

    #[test]
    fn send_buffer_to_peer_over_loopback_succeeds() {
        let device = Device::new(1);
        let (socket, local_addr) = SocketObject::create_and_bind(
            Weak::new(),
            AddressFamily::V4,
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();
        device.sockets.reinit(Some(Arc::new(socket)), None);

        let peer = Peer::new(Weak::new());
        peer.set_endpoint(&{
            let mut e = Endpoint::default();
            e.set_remote(crate::endpoint::RemoteAddress::from(local_addr));
            e
        });

        let pool = SendContextPool::new(4);
        let route_table = loopback_route_table(2);
        let generations = RoutingGenerations::new();

        send_buffer_to_peer(
            &device,
            &peer,
            &pool,
            &route_table,
            &generations,
            0,
            Bytes::from_static(b"hello"),
        )
        .unwrap();

        assert_eq!(peer.tx_bytes(), 5);
        assert_eq!(
            device.stats.tx_bytes.load(std::sync::atomic::Ordering::Relaxed),
            5
        );
    }
}
