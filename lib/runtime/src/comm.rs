// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Topology discovery and the local control channel.
//!
//! Ranks on one host exchange small coordination signals: non-root ranks tell
//! the local root that a partition finished a stage, the root tells everyone
//! that a broadcast is ready, and init uses a one-shot barrier. The channel
//! carries nothing else; bulk data always moves through shared memory or the
//! fabric.

use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

/// Placement of this process within the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Global rank.
    pub rank: i32,
    /// Rank within the host.
    pub local_rank: i32,
    /// Total ranks in the job.
    pub size: i32,
    /// Ranks per host.
    pub local_size: i32,
    /// Worker id assigned by the fabric scheduler.
    pub worker_id: i32,
    /// Host index.
    pub phy_node_id: i32,
    /// Number of hosts.
    pub num_phy_node: i32,
}

impl Topology {
    /// Derive placement from the environment, the way the launcher exports it.
    pub fn from_env(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let local_rank: i32 = std::env::var("PSBUS_LOCAL_RANK")
            .unwrap_or_else(|_| "0".to_string())
            .parse()?;
        let local_size: i32 = std::env::var("PSBUS_LOCAL_SIZE")
            .unwrap_or_else(|_| "1".to_string())
            .parse()?;
        let worker_id: i32 = std::env::var("DMLC_WORKER_ID")
            .unwrap_or_else(|_| "0".to_string())
            .parse()?;
        Ok(Self::derive(config, local_rank, local_size, worker_id))
    }

    /// In joint mode every rank is a fabric worker of its own; otherwise one
    /// worker id covers all local ranks of a host.
    pub fn derive(
        config: &RuntimeConfig,
        local_rank: i32,
        local_size: i32,
        worker_id: i32,
    ) -> Self {
        assert!(local_size > 0, "local_size must be positive");
        if config.is_joint() {
            let rank = worker_id;
            let num_phy_node = (config.num_worker / local_size).max(1);
            Self {
                rank,
                local_rank,
                size: config.num_worker,
                local_size,
                worker_id,
                phy_node_id: rank / local_size,
                num_phy_node,
            }
        } else {
            Self {
                rank: worker_id * local_size + local_rank,
                local_rank,
                size: config.num_worker * local_size,
                local_size,
                worker_id,
                phy_node_id: worker_id,
                num_phy_node: config.num_worker.max(1),
            }
        }
    }
}

/// Coordination signal kinds. One variant per rendezvous point; the key names
/// the partition being coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Barrier,
    ReduceReady,
    PcieReduceReady,
    PushReady,
    BcastReady,
    /// Root finished its host-to-device copy; peers may copy out of shm.
    CopyReady,
    CpuReduceReady,
    CpuBcastReady,
    CpuBcastFinishReady,
    AllgatherReady,
    AllgatherBcastReady,
    AllgatherCopyH2dReady,
}

/// One control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommMsg {
    pub src: i32,
    pub signal: Signal,
    pub key: u64,
}

/// The local peer control channel.
pub trait PeerComm: Send + Sync {
    fn local_rank(&self) -> i32;

    fn local_size(&self) -> i32;

    /// The local root rank this channel coordinates around.
    fn root(&self) -> i32;

    fn send_to(&self, local_rank: i32, msg: CommMsg) -> anyhow::Result<()>;

    fn send_to_root(&self, msg: CommMsg) -> anyhow::Result<()> {
        self.send_to(self.root(), msg)
    }

    /// Root-only: deliver to every non-root local rank.
    fn broadcast(&self, msg: CommMsg) -> anyhow::Result<()>;

    /// Blocking receive with a timeout, so listen threads can observe
    /// shutdown between messages.
    fn recv_timeout(&self, timeout: Duration) -> Option<CommMsg>;
}

/// In-process channel hub. Each local rank takes one [`LoopbackComm`]
/// endpoint; tests run several runtimes of one host inside a single process.
pub struct LoopbackHub {
    senders: Vec<mpsc::Sender<CommMsg>>,
    receivers: Mutex<Vec<Option<mpsc::Receiver<CommMsg>>>>,
    root: i32,
}

impl LoopbackHub {
    pub fn new(local_size: i32, root: i32) -> Self {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..local_size {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(Some(rx));
        }
        Self { senders, receivers: Mutex::new(receivers), root }
    }

    /// Claim the endpoint for `local_rank`. Panics if claimed twice.
    pub fn endpoint(&self, local_rank: i32) -> LoopbackComm {
        let rx = self.receivers.lock()[local_rank as usize]
            .take()
            .expect("endpoint already claimed");
        LoopbackComm {
            local_rank,
            root: self.root,
            senders: self.senders.clone(),
            receiver: Mutex::new(rx),
        }
    }
}

/// One rank's end of a [`LoopbackHub`].
pub struct LoopbackComm {
    local_rank: i32,
    root: i32,
    senders: Vec<mpsc::Sender<CommMsg>>,
    receiver: Mutex<mpsc::Receiver<CommMsg>>,
}

impl LoopbackComm {
    /// A single-rank channel with nothing on the other side.
    pub fn solo() -> Self {
        LoopbackHub::new(1, 0).endpoint(0)
    }
}

impl PeerComm for LoopbackComm {
    fn local_rank(&self) -> i32 {
        self.local_rank
    }

    fn local_size(&self) -> i32 {
        self.senders.len() as i32
    }

    fn root(&self) -> i32 {
        self.root
    }

    fn send_to(&self, local_rank: i32, msg: CommMsg) -> anyhow::Result<()> {
        self.senders[local_rank as usize]
            .send(msg)
            .map_err(|_| anyhow::anyhow!("peer {local_rank} hung up"))
    }

    fn broadcast(&self, msg: CommMsg) -> anyhow::Result<()> {
        for (rank, tx) in self.senders.iter().enumerate() {
            if rank as i32 == self.local_rank {
                continue;
            }
            tx.send(msg)
                .map_err(|_| anyhow::anyhow!("peer {rank} hung up"))?;
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<CommMsg> {
        self.receiver.lock().recv_timeout(timeout).ok()
    }
}

/// Cross-process channel over unix datagram sockets, one socket per local
/// rank at `<dir>/psbus_comm_<job>_<local_rank>`.
pub struct SocketComm {
    local_rank: i32,
    local_size: i32,
    root: i32,
    socket: std::os::unix::net::UnixDatagram,
    peer_path: Box<dyn Fn(i32) -> std::path::PathBuf + Send + Sync>,
}

impl SocketComm {
    pub fn bind(job_id: &str, local_rank: i32, local_size: i32, root: i32) -> anyhow::Result<Self> {
        let dir = std::env::temp_dir();
        let job = job_id.to_string();
        let peer_path = move |rank: i32| dir.join(format!("psbus_comm_{job}_{rank}"));
        let my_path = peer_path(local_rank);
        // stale socket from a previous run of this rank
        let _ = std::fs::remove_file(&my_path);
        let socket = std::os::unix::net::UnixDatagram::bind(&my_path)?;
        Ok(Self {
            local_rank,
            local_size,
            root,
            socket,
            peer_path: Box::new(peer_path),
        })
    }

    fn send_raw(&self, local_rank: i32, msg: CommMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&msg)?;
        let path = (self.peer_path)(local_rank);
        // peers bind at startup; retry briefly so init-order does not matter
        let mut last_err = None;
        for _ in 0..200 {
            match self.socket.send_to(&payload, &path) {
                Result::Ok(_) => return Ok(()),
                Result::Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        Err(anyhow::anyhow!("send to local rank {local_rank} failed: {:?}", last_err))
    }
}

impl PeerComm for SocketComm {
    fn local_rank(&self) -> i32 {
        self.local_rank
    }

    fn local_size(&self) -> i32 {
        self.local_size
    }

    fn root(&self) -> i32 {
        self.root
    }

    fn send_to(&self, local_rank: i32, msg: CommMsg) -> anyhow::Result<()> {
        self.send_raw(local_rank, msg)
    }

    fn broadcast(&self, msg: CommMsg) -> anyhow::Result<()> {
        for rank in 0..self.local_size {
            if rank == self.local_rank {
                continue;
            }
            self.send_raw(rank, msg)?;
        }
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<CommMsg> {
        self.socket.set_read_timeout(Some(timeout)).ok()?;
        let mut buf = [0u8; 256];
        let n = self.socket.recv(&mut buf).ok()?;
        serde_json::from_slice(&buf[..n]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_non_joint() {
        let mut cfg = RuntimeConfig::default();
        cfg.num_worker = 3;
        let topo = Topology::derive(&cfg, 1, 4, 2);
        assert_eq!(topo.rank, 9);
        assert_eq!(topo.size, 12);
        assert_eq!(topo.phy_node_id, 2);
        assert_eq!(topo.num_phy_node, 3);
    }

    #[test]
    fn test_topology_joint() {
        let mut cfg = RuntimeConfig::default();
        cfg.role = crate::config::Role::Joint;
        cfg.num_worker = 8;
        let topo = Topology::derive(&cfg, 1, 4, 5);
        assert_eq!(topo.rank, 5);
        assert_eq!(topo.size, 8);
        assert_eq!(topo.local_size, 4);
        assert_eq!(topo.phy_node_id, 1);
        assert_eq!(topo.num_phy_node, 2);
    }

    #[test]
    fn test_loopback_send_and_broadcast() {
        let hub = LoopbackHub::new(3, 2);
        let c0 = hub.endpoint(0);
        let c1 = hub.endpoint(1);
        let c2 = hub.endpoint(2);

        let msg = CommMsg { src: 0, signal: Signal::ReduceReady, key: 77 };
        c0.send_to_root(msg).unwrap();
        let got = c2.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(got, msg);

        let bcast = CommMsg { src: 2, signal: Signal::BcastReady, key: 78 };
        c2.broadcast(bcast).unwrap();
        assert_eq!(c0.recv_timeout(Duration::from_millis(100)).unwrap(), bcast);
        assert_eq!(c1.recv_timeout(Duration::from_millis(100)).unwrap(), bcast);
        // the sender does not hear its own broadcast
        assert!(c2.recv_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_socket_comm_roundtrip() {
        let a = SocketComm::bind("socktest", 0, 2, 1).unwrap();
        let b = SocketComm::bind("socktest", 1, 2, 1).unwrap();
        let msg = CommMsg { src: 0, signal: Signal::Barrier, key: 0 };
        a.send_to_root(msg).unwrap();
        let got = b.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(got, msg);
    }
}
