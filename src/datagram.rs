// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The datagram batch a caller hands to [`crate::send`]. A `Vec<Bytes>`
//! plays the role of the kernel's linked list of buffer descriptors: each
//! element is already an independently-owned, already-encrypted datagram.

use bytes::Bytes;

use crate::collaborators::KEEPALIVE_DATA_LEN;

/// A batch of already-encrypted datagrams bound for one peer.
pub struct DatagramList {
    buffers: Vec<Bytes>,
}

impl DatagramList {
    pub fn new(buffers: Vec<Bytes>) -> Self {
        DatagramList { buffers }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.buffers.iter().map(|b| b.len() as u64).sum()
    }

    /// `false` as soon as any buffer's length differs from the
    /// keepalive-canonical empty-data message length.
    pub fn all_keepalive(&self) -> bool {
        self.buffers
            .iter()
            .all(|b| b.len() == KEEPALIVE_DATA_LEN)
    }

    pub fn into_buffers(self) -> Vec<Bytes> {
        self.buffers
    }

    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_reports_no_buffers() {
        let list = DatagramList::new(vec![]);
        assert!(list.is_empty());
        assert_eq!(list.total_bytes(), 0);
    }

    #[test]
    fn mixed_lengths_are_not_all_keepalive() {
        let list = DatagramList::new(vec![Bytes::new(), Bytes::from_static(b"x")]);
        assert!(!list.all_keepalive());
        assert_eq!(list.total_bytes(), 1);
    }

    #[test]
    fn all_empty_buffers_are_keepalive() {
        let list = DatagramList::new(vec![Bytes::new(), Bytes::new()]);
        assert!(list.all_keepalive());
    }
}
