// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::io;

/// Error taxonomy produced by the UDP socket layer.
///
/// Send-path failures discovered synchronously carry enough information for
/// the caller to free whatever it already owns; failures discovered inside a
/// completion callback are logged and absorbed rather than propagated (see
/// [`crate::send`]).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("insufficient resources")]
    InsufficientResources,

    #[error("no socket bound for the required address family")]
    NetworkUnreachable,

    #[error("no route to the peer's remote address")]
    UnreachableAddress,

    #[error("kernel could not produce a source address for this route")]
    NetworkPath,

    #[error("received datagram has no supported address family or PKTINFO")]
    InvalidAddress,

    #[error("send called with an empty datagram list")]
    AlreadyComplete,

    #[error("requested port is already in use")]
    AddressAlreadyInUse,

    #[error("lifecycle operation attempted before Init() completed")]
    NotInitialized,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
