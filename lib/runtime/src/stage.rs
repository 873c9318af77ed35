// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The stage catalog and pipeline selection.
//!
//! Every task carries a subsequence of [`Stage`] as its remaining pipeline.
//! Which subsequence depends on placement (CPU/GPU), topology (distributed,
//! cross-PCIe-switch, multi-node), role (local root or not) and feature flags
//! (GDR, compression); the builders here mirror those rules for each
//! operation family.

use std::fmt;

use crate::config::GdrLevel;
use crate::runtime::Runtime;
use crate::tensor::CPU_DEVICE_ID;

macro_rules! stages {
    ($($name:ident),+ $(,)?) => {
        /// One stage of the pipeline; each active stage owns a queue and a
        /// worker thread.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(clippy::upper_case_acronyms)]
        pub enum Stage {
            $($name,)+
        }

        impl Stage {
            pub const ALL: &'static [Stage] = &[$(Stage::$name,)+];

            pub fn name(&self) -> &'static str {
                match self {
                    $(Stage::$name => stringify!($name),)+
                }
            }
        }
    };
}

stages! {
    COORDINATE_REDUCE,
    REDUCE,
    COPYD2H,
    PCIE_REDUCE,
    COORDINATE_PUSH,
    COMPRESS,
    PUSH,
    PULL,
    GDR_V1_PUSH_PULL,
    GDR_V2_PUSH_PULL,
    GDR_WAIT_PUSH_PULL,
    DECOMPRESS,
    COPYH2D,
    COORDINATE_BROADCAST,
    BROADCAST,
    SEND,
    RECV,
    P2P_GROUP_COPYH2D,
    P2P_PULL,
    P2P_PULL_RESPONSE,
    P2P_WAIT_ACK,
    CPU_COPY,
    CPU_REDUCE,
    CPU_BCAST,
    CPU_BCAST_FINISH,
    ALLGATHER,
    COORDINATE_ALLGATHER,
    ALLGATHER_PULL,
    ALLGATHER_PULL_RESP,
    ALLGATHER_BCAST,
    COORDINATE_ALLGATHER_BCAST,
    ALLGATHER_PULL_ACK,
    ALLGATHER_COPYD2H,
    ALLGATHER_COPYH2D,
    ALLGATHER_PULL_WORKER_LOCAL_ROOT,
    ALLGATHER_PULL_WORKER_LOCAL_ROOT_RESP,
    ALLGATHER_PULL_WORKER_LOCAL_ROOT_ACK,
}

/// Number of stages, and thus of scheduled queues.
pub const STAGE_COUNT: usize = Stage::ALL.len();

impl Stage {
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(idx: usize) -> Stage {
        Stage::ALL[idx]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Push half of the all-reduce pipeline for a GPU tensor, non-GDR.
fn push_stages_gpu(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.is_signal_root() {
        list.push(Stage::REDUCE);
    } else {
        list.push(Stage::COORDINATE_REDUCE);
        list.push(Stage::REDUCE);
    }
    if rt.is_distributed() || rt.is_cross_pcie_switch() {
        list.push(Stage::COPYD2H);
    }
    if rt.is_cross_pcie_switch() {
        list.push(Stage::PCIE_REDUCE);
    }
    // in the cross-PCIe-switch single-node case PUSH runs as a dummy barrier
    if rt.is_distributed() || rt.is_cross_pcie_switch() {
        if rt.is_root_device() {
            list.push(Stage::PUSH);
        } else {
            list.push(Stage::COORDINATE_PUSH);
        }
    }
    list
}

fn push_stages_cpu(rt: &Runtime) -> Vec<Stage> {
    let mut list = vec![Stage::CPU_COPY, Stage::CPU_REDUCE];
    if (rt.is_distributed() || rt.is_cross_pcie_switch()) && rt.is_root_device() {
        list.push(Stage::PUSH);
    }
    list
}

fn push_stages_gdr(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.is_signal_root() {
        list.push(Stage::REDUCE);
    } else {
        list.push(Stage::COORDINATE_REDUCE);
        list.push(Stage::REDUCE);
    }
    if rt.num_phy_node() > 1 {
        if rt.gdr_level() == GdrLevel::Gpu2Gpu {
            list.push(Stage::GDR_V2_PUSH_PULL);
        } else {
            list.push(Stage::GDR_V1_PUSH_PULL);
        }
        list.push(Stage::GDR_WAIT_PUSH_PULL);
    }
    list
}

fn pull_stages_gpu(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.is_distributed() && rt.is_root_device() {
        list.push(Stage::PULL);
    }
    if rt.is_distributed() || rt.is_cross_pcie_switch() {
        list.push(Stage::COPYH2D);
    }
    if rt.is_signal_root() {
        list.push(Stage::BROADCAST);
    } else {
        list.push(Stage::COORDINATE_BROADCAST);
        list.push(Stage::BROADCAST);
    }
    list
}

fn pull_stages_cpu(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.is_distributed() && rt.is_root_device() {
        list.push(Stage::PULL);
    }
    list.push(Stage::CPU_BCAST);
    if rt.is_root_device() {
        list.push(Stage::CPU_BCAST_FINISH);
    }
    list
}

fn pull_stages_gdr(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.num_phy_node() > 1 {
        if rt.is_signal_root() {
            list.push(Stage::BROADCAST);
        } else {
            list.push(Stage::COORDINATE_BROADCAST);
            list.push(Stage::BROADCAST);
        }
    }
    list
}

/// The full all-reduce pipeline for a tensor on `device`.
pub fn push_pull_stages(rt: &Runtime, device: i32) -> Vec<Stage> {
    let mut list = if device == CPU_DEVICE_ID {
        push_stages_cpu(rt)
    } else if rt.is_gdr() {
        push_stages_gdr(rt)
    } else {
        push_stages_gpu(rt)
    };
    list.extend(if device == CPU_DEVICE_ID {
        pull_stages_cpu(rt)
    } else if rt.is_gdr() {
        pull_stages_gdr(rt)
    } else {
        pull_stages_gpu(rt)
    });
    list
}

pub fn send_stages() -> Vec<Stage> {
    vec![Stage::SEND]
}

pub fn recv_stages() -> Vec<Stage> {
    vec![Stage::RECV]
}

/// The single request stage of an all-to-all submission.
pub fn alltoall_request_stages(use_pull: bool) -> Vec<Stage> {
    vec![if use_pull { Stage::P2P_PULL } else { Stage::SEND }]
}

/// The response-side stages of an all-to-all submission.
pub fn alltoall_response_stages(
    rt: &Runtime,
    use_pull: bool,
    output_size_unknown: bool,
) -> Vec<Stage> {
    if use_pull {
        if rt.config().p2p_disable_pull_ack {
            vec![Stage::P2P_PULL_RESPONSE]
        } else {
            vec![Stage::P2P_PULL_RESPONSE, Stage::P2P_WAIT_ACK]
        }
    } else if output_size_unknown {
        vec![Stage::P2P_GROUP_COPYH2D]
    } else {
        vec![Stage::RECV]
    }
}

pub fn allgather_request_stages(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.is_signal_root() {
        list.push(Stage::ALLGATHER);
    } else {
        list.push(Stage::COORDINATE_ALLGATHER);
        list.push(Stage::ALLGATHER);
    }
    if rt.num_phy_node() > 1 {
        if !rt.is_gdr_allgather() {
            list.push(Stage::ALLGATHER_COPYD2H);
        }
        if rt.is_root_device() {
            list.push(Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT);
            list.push(Stage::ALLGATHER_PULL);
        }
        if !rt.is_gdr_allgather() {
            list.push(Stage::ALLGATHER_COPYH2D);
        }
        if rt.is_signal_root() {
            list.push(Stage::ALLGATHER_BCAST);
        } else {
            list.push(Stage::COORDINATE_ALLGATHER_BCAST);
            list.push(Stage::ALLGATHER_BCAST);
        }
    }
    list
}

pub fn allgather_response_stages(rt: &Runtime) -> Vec<Stage> {
    let mut list = Vec::new();
    if rt.num_phy_node() > 1 {
        if rt.local_rank() == 0 {
            list.push(Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_RESP);
            if !rt.config().allgather_disable_pull_ack {
                list.push(Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_ACK);
            }
        }
        if rt.is_root_device() {
            list.push(Stage::ALLGATHER_PULL_RESP);
            if !rt.config().allgather_disable_pull_ack {
                list.push(Stage::ALLGATHER_PULL_ACK);
            }
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_index_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_index(stage.index()), *stage);
        }
        assert_eq!(STAGE_COUNT, 37);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::COORDINATE_REDUCE.to_string(), "COORDINATE_REDUCE");
        assert_eq!(Stage::GDR_V2_PUSH_PULL.name(), "GDR_V2_PUSH_PULL");
    }

    #[test]
    fn test_alltoall_response_shapes() {
        // rt-independent paths
        assert_eq!(alltoall_request_stages(false), vec![Stage::SEND]);
        assert_eq!(alltoall_request_stages(true), vec![Stage::P2P_PULL]);
    }
}
