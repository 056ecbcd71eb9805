// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The two address families this data plane ever deals with.

use std::net::IpAddr;

/// Address family tag used throughout the endpoint and socket model.
///
/// Unlike `std::net`'s implicit family (carried on `IpAddr`/`SocketAddr`),
/// ours has a third state: an endpoint that has never been told a remote
/// address yet.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}
