// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Quorum counters keyed by routing key.
//!
//! A [`ReadyTable`] is a rendezvous point: peers (or pipeline stages) call
//! [`ReadyTable::add_ready_count`] as they finish their part; the waiting
//! stage's queue predicate polls [`ReadyTable::is_key_ready`] and claims the
//! entry with [`ReadyTable::clear_ready_count`] on exactly one delivery.
//! Counting past the quorum is a programming error.

use std::collections::HashMap;

use parking_lot::Mutex;

pub struct ReadyTable {
    quorum: i32,
    name: &'static str,
    counts: Mutex<HashMap<u64, i32>>,
}

impl ReadyTable {
    pub fn new(quorum: i32, name: &'static str) -> Self {
        Self { quorum, name, counts: Mutex::new(HashMap::new()) }
    }

    pub fn quorum(&self) -> i32 {
        self.quorum
    }

    /// Count one arrival for `key`; returns the new count.
    pub fn add_ready_count(&self, key: u64) -> i32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        debug_assert!(
            *count <= self.quorum,
            "{}: key {key} overflowed its quorum of {}",
            self.name,
            self.quorum
        );
        tracing::trace!(table = self.name, key, count = *count, quorum = self.quorum);
        *count
    }

    pub fn is_key_ready(&self, key: u64) -> bool {
        self.counts.lock().get(&key).copied().unwrap_or(0) >= self.quorum
    }

    /// Current arrival count, for gates whose quorum varies per submission.
    pub fn ready_count(&self, key: u64) -> i32 {
        self.counts.lock().get(&key).copied().unwrap_or(0)
    }

    /// Claim a ready entry. Exactly one claimer dequeues per quorum.
    pub fn clear_ready_count(&self, key: u64) {
        self.counts.lock().remove(&key);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The rendezvous tables of one runtime. Which tables exist depends on role:
/// the local root waits for its peers, peers wait for the root, and the
/// receive-side tables are fed by the fabric.
#[derive(Default)]
pub struct Tables {
    // all-reduce
    pub reduce: Option<ReadyTable>,
    pub pcie_reduce: Option<ReadyTable>,
    pub broadcast: Option<ReadyTable>,
    pub push: Option<ReadyTable>,
    /// Non-root: the local root finished its host-to-device copy.
    pub copy: Option<ReadyTable>,
    // CPU all-reduce
    pub cpu_reduce: Option<ReadyTable>,
    pub cpu_bcast: Option<ReadyTable>,
    pub cpu_bcast_finish: Option<ReadyTable>,
    // p2p / all-to-all, fed by the fabric receive path
    pub p2p_copy: Option<ReadyTable>,
    pub p2p_group_copy: Option<ReadyTable>,
    pub p2p_pull_response: Option<ReadyTable>,
    pub p2p_ack: Option<ReadyTable>,
    // GDR
    pub gdr_push_pull: Option<ReadyTable>,
    // all-gather
    pub allgather: Option<ReadyTable>,
    pub allgather_bcast: Option<ReadyTable>,
    pub allgather_copy_h2d: Option<ReadyTable>,
    pub allgather_pull_resp: Option<ReadyTable>,
    pub allgather_pull_ack: Option<ReadyTable>,
    pub allgather_wlr_resp: Option<ReadyTable>,
    pub allgather_wlr_ack: Option<ReadyTable>,
    /// Byte lengths of fabric payloads received for group operations whose
    /// sizes are unknown to the receiver until arrival.
    pub recv_lens: dashmap::DashMap<u64, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_up_to_quorum() {
        let table = ReadyTable::new(3, "TEST");
        assert!(!table.is_key_ready(5));
        assert_eq!(table.add_ready_count(5), 1);
        assert_eq!(table.add_ready_count(5), 2);
        assert!(!table.is_key_ready(5));
        assert_eq!(table.add_ready_count(5), 3);
        assert!(table.is_key_ready(5));
    }

    #[test]
    fn test_clear_permits_reuse() {
        let table = ReadyTable::new(1, "TEST");
        table.add_ready_count(9);
        assert!(table.is_key_ready(9));
        table.clear_ready_count(9);
        assert!(!table.is_key_ready(9));
        table.add_ready_count(9);
        assert!(table.is_key_ready(9));
    }

    #[test]
    fn test_keys_are_independent() {
        let table = ReadyTable::new(2, "TEST");
        table.add_ready_count(1);
        table.add_ready_count(1);
        table.add_ready_count(2);
        assert!(table.is_key_ready(1));
        assert!(!table.is_key_ready(2));
    }
}
