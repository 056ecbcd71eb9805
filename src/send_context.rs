// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The fixed-size lookaside pool send contexts are drawn from. Modeled as a
//! bounded token bucket rather than a buffer-reuse pool, since a send
//! context's payload varies in size call to call — what's fixed is the
//! *count* of sends that may be in flight at once.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;

use crate::endpoint::Endpoint;
use crate::error::Error;

/// A send context's payload: the caller's already-batched list, or a single
/// buffer built for a control/reply send.
#[derive(Debug)]
pub enum SendPayload {
    Batched(Vec<Bytes>),
    Single(Bytes),
}

/// Per-send state: the endpoint is copied by value at allocation time so a
/// concurrent `SetPeerEndpoint` on the peer can't change an in-flight send's
/// destination out from under it.
#[derive(Debug)]
pub struct SendContext {
    pub endpoint: Endpoint,
    pub payload: SendPayload,
    pool: Arc<SendContextPool>,
}

impl Drop for SendContext {
    fn drop(&mut self) {
        let _ = self.pool.tokens.push(());
    }
}

#[derive(Debug)]
pub struct SendContextPool {
    tokens: ArrayQueue<()>,
}

impl SendContextPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let tokens = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            let _ = tokens.push(());
        }
        Arc::new(SendContextPool { tokens })
    }

    pub fn allocate(
        self: &Arc<Self>,
        endpoint: Endpoint,
        payload: SendPayload,
    ) -> Result<SendContext, Error> {
        self.tokens.pop().ok_or(Error::InsufficientResources)?;
        Ok(SendContext {
            endpoint,
            payload,
            pool: self.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.tokens.capacity()
    }
}
