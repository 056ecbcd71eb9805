// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Receive dispatcher (§4.6): accepts a batch of raw datagram indications
//! from the kernel socket, wraps each one that the device can still accept,
//! and hands the survivors to the packet-receive collaborator.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::collaborators::PacketReceiver;
use crate::device::Device;
use crate::rundown::RundownGuard;
use crate::socket::SocketObject;

/// One accepted inbound datagram, still holding the socket's rundown
/// protection until it's dropped by the receive collaborator.
pub struct ReceivedDatagram {
    pub remote: SocketAddr,
    pub payload: Bytes,
    pub control: Vec<u8>,
    _rundown: RundownGuard,
}

impl ReceivedDatagram {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn control(&self) -> &[u8] {
        &self.control
    }
}

/// One raw indication off the wire, before rundown/device-state admission.
pub struct RawIndication {
    pub remote: SocketAddr,
    pub payload: Bytes,
    pub control: Vec<u8>,
}

/// Process one batch of indications from `socket`. Indications are dropped
/// (and counted as discards) when the device is down or the socket's
/// rundown protection can't be acquired; survivors are handed to
/// `receiver`. Mirrors the kernel callback's `(socket, flags, chain)`
/// signature, minus the flags this crate never inspects.
pub fn dispatch(
    device: &Device,
    socket: &SocketObject,
    indications: Vec<RawIndication>,
    receiver: &dyn PacketReceiver,
) {
    if indications.is_empty() {
        return;
    }

    let mut accepted = Vec::with_capacity(indications.len());
    let mut discards = 0u64;

    for indication in indications {
        if !device.is_up() {
            discards += 1;
            continue;
        }

        let Some(rundown) = socket.rundown().acquire() else {
            discards += 1;
            continue;
        };

        accepted.push(ReceivedDatagram {
            remote: indication.remote,
            payload: indication.payload,
            control: indication.control,
            _rundown: rundown,
        });
    }

    if discards > 0 {
        device.add_rx_discards(discards);
    }

    if !accepted.is_empty() {
        receiver.packet_receive(accepted);
    }
}

/// Same as [`dispatch`] but resolves the socket from the registry by family
/// first, discarding the whole batch if no socket is currently published
/// for it (mirrors the device-down discard path).
pub fn dispatch_for_family(
    device: &Device,
    family: crate::family::AddressFamily,
    indications: Vec<RawIndication>,
    receiver: &dyn PacketReceiver,
) {
    let count = indications.len() as u64;
    match device.sockets.load(family) {
        Some(socket) => dispatch(device, &socket, indications, receiver),
        None => device.add_rx_discards(count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::AddressFamily;
    use std::sync::Mutex;
    use std::sync::Weak;

    struct RecordingReceiver {
        batches: Mutex<Vec<usize>>,
    }

    impl PacketReceiver for RecordingReceiver {
        fn packet_receive(&self, datagrams: Vec<ReceivedDatagram>) {
            self.batches.lock().unwrap().push(datagrams.len());
        }
    }

    fn indication(remote: &str) -> RawIndication {
        RawIndication {
            remote: remote.parse().unwrap(),
            payload: Bytes::from_static(b"x"),
            control: Vec::new(),
        }
    }

    #[test]
    fn device_down_discards_everything() {
        let device = Device::new(1);
        let (socket, _) = crate::socket::SocketObject::create_and_bind(
            Weak::new(),
            AddressFamily::V4,
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();
        let receiver = RecordingReceiver {
            batches: Mutex::new(vec![]),
        };

        dispatch(
            &device,
            &socket,
            vec![
                indication("192.0.2.1:1"),
                indication("192.0.2.1:2"),
                indication("192.0.2.1:3"),
            ],
            &receiver,
        );

        assert_eq!(device.stats.rx_discards.load(std::sync::atomic::Ordering::Relaxed), 3);
        assert!(receiver.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn device_up_accepts_and_forwards() {
        let device = Device::new(1);
        device.set_up(true);
        let (socket, _) = crate::socket::SocketObject::create_and_bind(
            Weak::new(),
            AddressFamily::V4,
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();
        let receiver = RecordingReceiver {
            batches: Mutex::new(vec![]),
        };

        dispatch(&device, &socket, vec![indication("192.0.2.1:1")], &receiver);

        assert_eq!(receiver.batches.lock().unwrap().as_slice(), &[1]);
        assert_eq!(device.stats.rx_discards.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
