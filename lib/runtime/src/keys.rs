// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Routing-key layout and server assignment.
//!
//! The total key space is `[0, 2^64)`. It is divided over N servers, N <=
//! 2^16, leaving 48 bits per server shard:
//!
//! ```text
//! [63..32] sender rank      (0 for broadcast-shared keys)
//! [31..16] declared key
//! [15..10] operation tag
//! [ 9.. 0] partition index
//! ```
//!
//! So up to 2^16 tensors per namespace and up to 2^10 partitions per tensor.
//! [`KeyEncoder::encode_default_key`] memoizes the server chosen for a key so
//! repeated calls return the same assignment for the process lifetime, and
//! accumulates per-server assigned byte lengths for load observability.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use parking_lot::Mutex;

use crate::config::HashFn;

/// Operation tag encoded into bits 15..10 of a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum OpType {
    PushPull = 1,
    P2p = 2,
    AllToAll = 3,
    AllGather = 4,
}

impl OpType {
    pub fn name(&self) -> &'static str {
        match self {
            OpType::PushPull => "push_pull",
            OpType::P2p => "p2p",
            OpType::AllToAll => "alltoall",
            OpType::AllGather => "allgather",
        }
    }
}

/// Maximum partitions per tensor (10 bits of partition index).
pub const MAX_PARTITIONS: u64 = 1 << 10;

/// First routing key of a tensor: partitions occupy consecutive keys above it.
pub fn start_key(op: OpType, declared_key: u32, sender: u32) -> u64 {
    ((sender as u64) << 32) | ((declared_key as u64) << 16) | ((op as u64) << 10)
}

/// The shared request/response key used by one rank's half of an all-to-all.
pub fn alltoall_key(declared_key: u32, rank: u32) -> u64 {
    start_key(OpType::AllToAll, declared_key, rank)
}

/// Strips the sender bits, leaving the per-tensor identity. Group receives
/// with unknown sizes rendezvous on this id rather than on a sender-specific
/// key.
pub fn alltoall_tensor_id(key: u64) -> u64 {
    key & 0xFFFF_FFFF
}

/// A key after placement: the fabric-visible key plus its server and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsKv {
    pub keys: Vec<u64>,
    pub lens: Vec<usize>,
    pub size: usize,
    pub server: usize,
}

/// Per-key server assignment, memoized for the process lifetime.
pub struct KeyEncoder {
    hash_fn: HashFn,
    built_in_coef: u64,
    mixed_bound: u64,
    num_servers: usize,
    num_phy_node: usize,
    local_size: usize,
    server_local_root: usize,
    num_worker: usize,
    state: Mutex<EncoderState>,
}

#[derive(Default)]
struct EncoderState {
    memo: HashMap<u64, PsKv>,
    server_accumulated_len: Vec<u64>,
    total_accumulated_len: u64,
}

impl KeyEncoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hash_fn: HashFn,
        built_in_coef: u64,
        mixed_bound: u64,
        num_servers: usize,
        num_phy_node: usize,
        local_size: usize,
        server_local_root: usize,
        num_worker: usize,
    ) -> Self {
        Self {
            hash_fn,
            built_in_coef,
            mixed_bound,
            num_servers,
            num_phy_node,
            local_size,
            server_local_root,
            num_worker,
            state: Mutex::new(EncoderState {
                memo: HashMap::new(),
                server_accumulated_len: vec![0; num_servers],
                total_accumulated_len: 0,
            }),
        }
    }

    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// The contiguous slice of the key space owned by `server`.
    pub fn server_key_range(&self, server: usize) -> Range<u64> {
        debug_assert!(server < self.num_servers);
        let shard = u64::MAX / self.num_servers as u64;
        let begin = shard * server as u64;
        begin..begin + shard
    }

    /// Assign `key` to a server, memoizing the choice. A later call with a
    /// different `len` updates the stored length but never the assignment.
    pub fn encode_default_key(&self, key: u64, len: usize) -> PsKv {
        let mut state = self.state.lock();
        if let Some(pskv) = state.memo.get_mut(&key) {
            if len > 0 && pskv.size != len {
                pskv.size = len;
                pskv.lens[0] = len;
            }
            return pskv.clone();
        }

        let server = self.pick_server(key);
        state.server_accumulated_len[server] += len as u64;
        state.total_accumulated_len += len as u64;
        tracing::debug!(
            key,
            server,
            accumulated = state.server_accumulated_len[server],
            share = format_args!(
                "{:.1}%",
                100.0 * state.server_accumulated_len[server] as f64
                    / state.total_accumulated_len as f64
            ),
            "assigned key to server",
        );

        let range = self.server_key_range(server);
        let ps_key = range.start + key;
        debug_assert!(ps_key < range.end);
        let pskv = PsKv { keys: vec![ps_key], lens: vec![len], size: len, server };
        state.memo.insert(key, pskv.clone());
        pskv
    }

    /// Route a key directly to the receiver's server shard, no hashing.
    pub fn encode_p2p_key(&self, key: u64, len: usize, receiver: usize) -> PsKv {
        debug_assert!(
            receiver < self.num_servers,
            "receiver {receiver} out of range, num_servers={}",
            self.num_servers
        );
        let range = self.server_key_range(receiver);
        let ps_key = range.start + key;
        debug_assert!(ps_key < range.end);
        PsKv { keys: vec![ps_key], lens: vec![len], size: len, server: receiver }
    }

    /// Bytes assigned to each server so far.
    pub fn server_accumulated_len(&self) -> Vec<u64> {
        self.state.lock().server_accumulated_len.clone()
    }

    fn pick_server(&self, key: u64) -> usize {
        let n = self.num_servers as u64;
        debug_assert!(n > 0);
        let server = match self.hash_fn {
            HashFn::Naive => hash_naive(key) % n,
            HashFn::BuiltIn => hash_built_in(key, self.built_in_coef) % n,
            HashFn::Djb2 => hash_djb2(key) % n,
            HashFn::Djb2Colocate => {
                let node = hash_djb2(key) % self.num_phy_node as u64;
                node * self.local_size as u64 + self.server_local_root as u64
            }
            HashFn::Sdbm => hash_sdbm(key) % n,
            HashFn::Mixed => self.hash_mixed(key),
        };
        debug_assert!(server < n);
        server as usize
    }

    /// Mixed-mode placement: a fraction of keys (derived from the worker and
    /// non-colocated server counts) goes to the non-colocated group, the rest
    /// to the colocated group.
    fn hash_mixed(&self, key: u64) -> u64 {
        let num_server_total = self.num_servers as u64;
        let num_worker_total = self.num_worker as u64;
        let noncolocate = num_server_total - num_worker_total;
        let colocate = num_worker_total;

        // The bound must cover every server; too large a bound skews the
        // threshold rounding.
        let bound = self.mixed_bound;
        assert!(bound >= num_server_total, "mixed-mode bound {bound} < {num_server_total}");
        let ratio = (2.0 * noncolocate as f64 * (num_worker_total as f64 - 1.0))
            / (num_worker_total as f64 * (num_worker_total + noncolocate) as f64
                - 2.0 * noncolocate as f64);
        assert!(
            (0.0..=1.0).contains(&ratio),
            "more non-colocated servers than workers is not permitted in mixed mode"
        );
        let threshold = ratio * bound as f64;

        let hash_res = hash_djb2(key) % bound;
        if (hash_res as f64) < threshold {
            hash_djb2(hash_res) % noncolocate
        } else {
            noncolocate + hash_djb2(hash_res) % colocate
        }
    }
}

fn hash_naive(key: u64) -> u64 {
    ((key >> 16).wrapping_add(key % 65536)).wrapping_mul(9973)
}

fn hash_built_in(key: u64, coef: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.to_string().hash(&mut hasher);
    hasher.finish().wrapping_mul(coef)
}

fn hash_djb2(key: u64) -> u64 {
    // hash(i) = hash(i-1) * 33 ^ str[i]
    let mut hash: u64 = 5381;
    for c in key.to_string().bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(c as u64);
    }
    hash
}

fn hash_sdbm(key: u64) -> u64 {
    // hash(i) = hash(i-1) * 65599 + str[i]
    let mut hash: u64 = 0;
    for c in key.to_string().bytes() {
        hash = (c as u64)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(hash_fn: HashFn, num_servers: usize) -> KeyEncoder {
        KeyEncoder::new(hash_fn, 1, 101, num_servers, 1, 1, 0, 1)
    }

    #[test]
    fn test_key_layout() {
        let key = start_key(OpType::PushPull, 3, 0);
        assert_eq!(key, (3 << 16) | (1 << 10));
        let key = start_key(OpType::P2p, 1, 7);
        assert_eq!(key >> 32, 7);
        assert_eq!((key >> 16) & 0xFFFF, 1);
        assert_eq!((key >> 10) & 0x3F, OpType::P2p as u64);
        assert_eq!(key & 0x3FF, 0);
    }

    #[test]
    fn test_alltoall_tensor_id_strips_sender() {
        let a = alltoall_key(9, 2);
        let b = alltoall_key(9, 5);
        assert_ne!(a, b);
        assert_eq!(alltoall_tensor_id(a), alltoall_tensor_id(b));
    }

    #[test]
    fn test_encode_is_memoized() {
        let enc = encoder(HashFn::Djb2, 4);
        let first = enc.encode_default_key(42, 1000);
        for _ in 0..10 {
            let again = enc.encode_default_key(42, 1000);
            assert_eq!(again.server, first.server);
            assert_eq!(again.keys, first.keys);
        }
        // only the first encode accumulates load
        assert_eq!(enc.server_accumulated_len().iter().sum::<u64>(), 1000);
    }

    #[test]
    fn test_encode_len_update_keeps_assignment() {
        let enc = encoder(HashFn::Sdbm, 3);
        let first = enc.encode_default_key(7, 100);
        let resized = enc.encode_default_key(7, 999);
        assert_eq!(resized.server, first.server);
        assert_eq!(resized.size, 999);
        assert_eq!(resized.lens, vec![999]);
    }

    #[test]
    fn test_p2p_key_routes_to_receiver() {
        let enc = encoder(HashFn::Djb2, 4);
        for receiver in 0..4 {
            let pskv = enc.encode_p2p_key(5, 64, receiver);
            assert_eq!(pskv.server, receiver);
            assert!(enc.server_key_range(receiver).contains(&pskv.keys[0]));
        }
    }

    #[test]
    fn test_naive_hash_formula() {
        assert_eq!(hash_naive(0), 0);
        assert_eq!(hash_naive(1), 9973);
        assert_eq!(hash_naive(1 << 16), 9973);
        assert_eq!(hash_naive((1 << 16) + 1), 2 * 9973);
    }

    #[test]
    fn test_djb2_colocate_lands_on_local_root() {
        // 2 physical nodes, 4 ranks each, server local root 3 -> servers 3, 7
        let enc = KeyEncoder::new(HashFn::Djb2Colocate, 1, 101, 8, 2, 4, 3, 8);
        for key in 0..32u64 {
            let server = enc.encode_default_key(key, 1).server;
            assert!(server == 3 || server == 7, "key {key} -> server {server}");
        }
    }

    #[test]
    fn test_mixed_mode_share_within_tolerance() {
        // 4 workers, 2 non-colocated + 4 colocated servers, bound 101
        let num_workers = 4u64;
        let noncolocate = 2u64;
        let enc = KeyEncoder::new(
            HashFn::Mixed,
            1,
            101,
            (num_workers + noncolocate) as usize,
            1,
            1,
            0,
            num_workers as usize,
        );
        let ratio = (2.0 * noncolocate as f64 * (num_workers as f64 - 1.0))
            / (num_workers as f64 * (num_workers + noncolocate) as f64
                - 2.0 * noncolocate as f64);
        let expected = ratio * 101.0;

        let hits = (0..100u64)
            .map(|k| enc.encode_default_key(start_key(OpType::PushPull, k as u32, 0), 1))
            .filter(|pskv| pskv.server < noncolocate as usize)
            .count() as f64;
        // the observed non-colocated share, scaled back to the bound, falls
        // within +-10% of the computed threshold
        let observed = hits / 100.0 * 101.0;
        assert!(
            (observed - expected).abs() <= 10.1,
            "observed {observed:.1}, expected {expected:.1}"
        );
    }
}
