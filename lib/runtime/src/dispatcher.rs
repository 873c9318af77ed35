// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The loop dispatcher.
//!
//! One worker thread per active stage: dequeue, perform the stage action,
//! route to the next stage in the task's pipeline. Which stages are active
//! depends on role and feature flags. The listen thread feeds the ready
//! tables from peer control messages; the monitor thread watches for stalled
//! queues.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::Status;
use crate::comm::{CommMsg, Signal};
use crate::keys::OpType;
use crate::queue::{Gate, ScheduledQueue, open_gate};
use crate::ready_table::Tables;
use crate::runtime::Runtime;
use crate::stage::Stage;
use crate::task::{Task, TaskKind};
use crate::telemetry::{CommTime, now_micros};
use crate::tensor::{CPU_DEVICE_ID, ReduceOp, Tensor};
use crate::transport::{Command, DeviceKind, RequestType};

// ----------------------------------------------------------------------
// gates
// ----------------------------------------------------------------------

/// Everything a queue gate may consult. Gates only read; consuming a ready
/// entry happens in the stage action, after exactly one delivery.
#[derive(Clone)]
pub struct GateEnv {
    pub tables: Arc<Tables>,
    pub is_root: bool,
    pub is_signal_root: bool,
    pub local_size: i32,
    pub is_distributed: bool,
}

fn event_ready(task: &Task) -> bool {
    task.ready_event.as_ref().map(|e| e.ready()).unwrap_or(true)
}

fn table_ready(table: &Option<crate::ready_table::ReadyTable>, key: u64) -> bool {
    table.as_ref().map(|t| t.is_key_ready(key)).unwrap_or(true)
}

/// The stage precondition evaluated by the queue before delivering a task.
pub fn gate_for(stage: Stage, env: GateEnv) -> Gate {
    match stage {
        Stage::COPYD2H | Stage::ALLGATHER_COPYD2H | Stage::CPU_COPY | Stage::SEND
        | Stage::P2P_PULL => Arc::new(move |task: &Task| event_ready(task)),
        Stage::REDUCE => {
            Arc::new(move |task: &Task| event_ready(task) && table_ready(&env.tables.reduce, task.key))
        }
        Stage::PCIE_REDUCE => Arc::new(move |task: &Task| table_ready(&env.tables.pcie_reduce, task.key)),
        Stage::PUSH => Arc::new(move |task: &Task| table_ready(&env.tables.push, task.key)),
        Stage::COPYH2D => Arc::new(move |task: &Task| {
            env.is_root || table_ready(&env.tables.copy, task.key)
        }),
        Stage::BROADCAST => Arc::new(move |task: &Task| table_ready(&env.tables.broadcast, task.key)),
        Stage::CPU_REDUCE => Arc::new(move |task: &Task| {
            !env.is_root || table_ready(&env.tables.cpu_reduce, task.key)
        }),
        Stage::CPU_BCAST => Arc::new(move |task: &Task| {
            env.is_root || table_ready(&env.tables.cpu_bcast, task.key)
        }),
        Stage::CPU_BCAST_FINISH => {
            Arc::new(move |task: &Task| table_ready(&env.tables.cpu_bcast_finish, task.key))
        }
        Stage::RECV => Arc::new(move |task: &Task| {
            event_ready(task) && table_ready(&env.tables.p2p_copy, task.key)
        }),
        Stage::P2P_GROUP_COPYH2D => Arc::new(move |task: &Task| {
            let expected = task.group().map(|g| g.expected_peers - 1).unwrap_or(0);
            env.tables
                .p2p_group_copy
                .as_ref()
                .map(|t| t.ready_count(task.key) >= expected)
                .unwrap_or(true)
        }),
        Stage::P2P_PULL_RESPONSE => {
            Arc::new(move |task: &Task| table_ready(&env.tables.p2p_pull_response, task.key))
        }
        Stage::P2P_WAIT_ACK => Arc::new(move |task: &Task| table_ready(&env.tables.p2p_ack, task.key)),
        Stage::GDR_WAIT_PUSH_PULL => {
            Arc::new(move |task: &Task| table_ready(&env.tables.gdr_push_pull, task.key))
        }
        Stage::ALLGATHER => {
            Arc::new(move |task: &Task| event_ready(task) && table_ready(&env.tables.allgather, task.key))
        }
        Stage::ALLGATHER_BCAST => {
            Arc::new(move |task: &Task| table_ready(&env.tables.allgather_bcast, task.key))
        }
        Stage::ALLGATHER_COPYH2D => Arc::new(move |task: &Task| {
            env.is_root || table_ready(&env.tables.allgather_copy_h2d, task.key)
        }),
        Stage::ALLGATHER_PULL_RESP => {
            Arc::new(move |task: &Task| table_ready(&env.tables.allgather_pull_resp, task.key))
        }
        Stage::ALLGATHER_PULL_ACK => {
            Arc::new(move |task: &Task| table_ready(&env.tables.allgather_pull_ack, task.key))
        }
        Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_RESP => {
            Arc::new(move |task: &Task| table_ready(&env.tables.allgather_wlr_resp, task.key))
        }
        Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_ACK => {
            Arc::new(move |task: &Task| table_ready(&env.tables.allgather_wlr_ack, task.key))
        }
        _ => open_gate(),
    }
}

// ----------------------------------------------------------------------
// stage activation
// ----------------------------------------------------------------------

/// Which stages get a worker thread in this process, by role and feature
/// flags.
pub fn active_stages(rt: &Runtime) -> Vec<Stage> {
    let cfg = rt.config();
    let mut stages = Vec::new();

    if rt.is_distributed() {
        if rt.is_joint() && !cfg.disable_p2p {
            if !cfg.disable_send_recv {
                stages.push(Stage::RECV);
                stages.push(Stage::SEND);
            }
            if cfg.alltoall_use_pull {
                stages.push(Stage::P2P_PULL);
                stages.push(Stage::P2P_PULL_RESPONSE);
                stages.push(Stage::P2P_WAIT_ACK);
            } else {
                stages.push(Stage::P2P_GROUP_COPYH2D);
            }
        }
        if rt.is_root_device()
            && (!cfg.disable_cpu_allreduce || (!cfg.disable_gpu_allreduce && !rt.is_gdr()))
        {
            stages.push(Stage::PULL);
        }
    }

    if rt.is_cross_pcie_switch() && !cfg.disable_gpu_allreduce {
        stages.push(Stage::PCIE_REDUCE);
    }

    stages.push(Stage::COORDINATE_REDUCE);
    stages.push(Stage::COORDINATE_PUSH);
    stages.push(Stage::COORDINATE_BROADCAST);

    if (rt.is_cross_pcie_switch() || rt.is_distributed())
        && (!cfg.disable_cpu_allreduce || (!cfg.disable_gpu_allreduce && !rt.is_gdr()))
    {
        stages.push(Stage::COPYD2H);
        stages.push(Stage::COPYH2D);
        if rt.is_root_device() {
            // PUSH is a real push in distributed mode, a barrier across PCIe
            // switches otherwise
            stages.push(Stage::PUSH);
        }
    }

    if rt.is_root_device() && !cfg.disable_compress {
        if rt.is_distributed() {
            stages.push(Stage::DECOMPRESS);
        }
        if rt.is_cross_pcie_switch() || rt.is_distributed() {
            stages.push(Stage::COMPRESS);
        }
    }

    if !cfg.disable_gpu_allreduce || !cfg.disable_gpu_allgather {
        stages.push(Stage::REDUCE);
        stages.push(Stage::BROADCAST);
        if rt.is_gdr() && rt.num_phy_node() > 1 {
            if rt.is_gdr_gpu2gpu() {
                stages.push(Stage::GDR_V2_PUSH_PULL);
            } else {
                stages.push(Stage::GDR_V1_PUSH_PULL);
            }
            stages.push(Stage::GDR_WAIT_PUSH_PULL);
        }
    }

    if !cfg.disable_cpu_allreduce {
        stages.push(Stage::CPU_COPY);
        stages.push(Stage::CPU_REDUCE);
        stages.push(Stage::CPU_BCAST);
        if rt.is_root_device() {
            stages.push(Stage::CPU_BCAST_FINISH);
        }
    }

    if rt.is_joint() && !cfg.disable_gpu_allgather {
        stages.push(Stage::ALLGATHER);
        stages.push(Stage::COORDINATE_ALLGATHER);
        stages.push(Stage::ALLGATHER_BCAST);
        stages.push(Stage::COORDINATE_ALLGATHER_BCAST);
        if rt.is_distributed() {
            if rt.is_root_device() {
                stages.push(Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT);
                stages.push(Stage::ALLGATHER_PULL);
                stages.push(Stage::ALLGATHER_PULL_RESP);
            }
            if rt.local_rank() == 0 {
                stages.push(Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_RESP);
            }
            if rt.is_root_device() || rt.local_rank() == 0 {
                stages.push(Stage::ALLGATHER_PULL_ACK);
                stages.push(Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_ACK);
            }
            if !rt.is_gdr_allgather() {
                stages.push(Stage::ALLGATHER_COPYD2H);
                stages.push(Stage::ALLGATHER_COPYH2D);
            }
        }
    }

    stages.sort();
    stages.dedup();
    stages
}

/// Spawn one worker thread per active stage.
pub fn start_loops(rt: &Arc<Runtime>) -> Vec<std::thread::JoinHandle<()>> {
    let stages = active_stages(rt);
    tracing::debug!(
        count = stages.len(),
        local_rank = rt.local_rank(),
        "starting background stage threads"
    );
    stages
        .into_iter()
        .map(|stage| {
            let rt = rt.clone();
            std::thread::Builder::new()
                .name(format!("psbus-{}", stage.name().to_lowercase()))
                .spawn(move || stage_loop(rt, stage))
                .expect("spawn stage thread")
        })
        .collect()
}

fn stage_loop(rt: Arc<Runtime>, stage: Stage) {
    let queue = rt.queue(stage).clone();
    while let Some(task) = queue.get_task() {
        let profiling = task.context.profiling();
        let mut record = profiling.then(|| CommTime::begin(Some(task.key), Some(stage)));
        let status = run_stage(&rt, stage, &task);
        if let Some(record) = record.as_mut() {
            record.end();
            task.context.push_part_comm_time(task.key, stage, record.clone());
        }
        route_to_next(&rt, &queue, task, status);
    }
    tracing::trace!(%stage, local_rank = rt.local_rank(), "stage loop joined");
}

/// Advance the task through its pipeline, or finish its partition. The
/// terminal callback fires through the shared completion exactly once, after
/// the last partition drains.
fn route_to_next(rt: &Arc<Runtime>, queue: &ScheduledQueue, task: Arc<Task>, status: Status) {
    if !status.is_ok() {
        tracing::error!(
            name = %task.name,
            key = task.key,
            stage = %queue.stage(),
            %status,
            "stage failed"
        );
        task.completion.record_error(status);
    }
    queue.report_finish(task.len);
    match task.advance() {
        Some(next) => rt.queue(next).add_task(task),
        None => {
            let ctx = task.context.clone();
            let completion = task.completion.clone();
            // release tensor handles before the callback can observe completion
            drop(task);
            if completion.part_done() {
                rt.telemetry().record_end(&ctx.base_name);
                if ctx.op_type == OpType::AllToAll {
                    rt.contexts().mark_done(&ctx.base_name);
                }
                if ctx.profiling() {
                    let started = completion.started_at();
                    ctx.push_comm_time(CommTime {
                        start_t: started,
                        dur: now_micros() - started,
                        key: None,
                        stage: None,
                    });
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// stage actions
// ----------------------------------------------------------------------

fn tensor_window(tensor: &dyn Tensor, offset: usize, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    tensor.read(offset, &mut data);
    data
}

/// The reduced-side tensor: output where present, else input.
fn reduced_tensor(task: &Task) -> Option<&Arc<dyn Tensor>> {
    task.output.as_ref().or(task.tensor.as_ref())
}

fn signal_root_msg(rt: &Runtime, signal: Signal, key: u64) -> Status {
    let msg = CommMsg { src: rt.local_rank(), signal, key };
    match rt.comm().send_to_root(msg) {
        Result::Ok(()) => Status::ok(),
        Result::Err(e) => Status::unknown_error(e.to_string()),
    }
}

fn broadcast_msg(rt: &Runtime, signal: Signal, key: u64) -> Status {
    let msg = CommMsg { src: rt.local_rank(), signal, key };
    match rt.comm().broadcast(msg) {
        Result::Ok(()) => Status::ok(),
        Result::Err(e) => Status::unknown_error(e.to_string()),
    }
}

/// Scale the output window by `1/size` for averaging reduce ops.
fn apply_average(rt: &Runtime, task: &Task) {
    if task.reduce_op != ReduceOp::Average {
        return;
    }
    if let Some(output) = &task.output {
        let dtype = output.dtype();
        let mut window = tensor_window(output.as_ref(), task.offset, task.len);
        rt.reducer().scale(&mut window, task.len, dtype, 1.0 / rt.size() as f64);
        output.write(task.offset, &window);
    }
}

fn dtype_of(task: &Task) -> crate::tensor::DataType {
    task.tensor
        .as_ref()
        .or(task.output.as_ref())
        .map(|t| t.dtype())
        .unwrap_or(crate::tensor::DataType::UInt8)
}

/// Perform one stage's action on one task. Ready-table entries consumed by
/// this stage are cleared here, after the single delivery.
pub fn run_stage(rt: &Arc<Runtime>, stage: Stage, task: &Arc<Task>) -> Status {
    match stage {
        // coordination: tell the local root this partition is ready
        Stage::COORDINATE_REDUCE => signal_root_msg(rt, Signal::ReduceReady, task.key),
        Stage::COORDINATE_PUSH => signal_root_msg(rt, Signal::PushReady, task.key),
        Stage::COORDINATE_BROADCAST => signal_root_msg(rt, Signal::BcastReady, task.key),
        Stage::COORDINATE_ALLGATHER => signal_root_msg(rt, Signal::AllgatherReady, task.key),
        Stage::COORDINATE_ALLGATHER_BCAST => {
            signal_root_msg(rt, Signal::AllgatherBcastReady, task.key)
        }

        Stage::REDUCE => {
            let (Some(input), Some(output)) = (&task.tensor, reduced_tensor(task)) else {
                return Status::invalid_argument("reduce without tensors");
            };
            let status = rt.collective().reduce(
                task.key,
                input.as_ref(),
                output.as_ref(),
                task.offset,
                task.len,
                ReduceOp::Sum,
            );
            if let Some(table) = &rt.tables().reduce {
                table.clear_ready_count(task.key);
            }
            status
        }

        Stage::COPYD2H => {
            // only the root's copy lands in the shared staging segment
            if !rt.is_root_device() {
                return Status::ok();
            }
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for COPYD2H");
            };
            let Some(tensor) = reduced_tensor(task) else {
                return Status::invalid_argument("COPYD2H without tensors");
            };
            rt.gpu().copy_d2h(
                crate::gpu::StreamKind::CopyD2H,
                buff,
                task.offset,
                tensor.as_ref(),
                task.offset,
                task.len,
            )
        }

        Stage::PCIE_REDUCE => {
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for PCIE_REDUCE");
            };
            let dtype = dtype_of(task);
            for peer in task.pcie_cpu_buff.iter().take(task.pcie_cpu_buff.len().saturating_sub(1))
            {
                let src = crate::enqueue::read_shared_window(peer, task.offset, task.len);
                buff.with_range_mut(task.offset, task.len, |dst| {
                    rt.reducer().sum(dst, &src, task.len, dtype)
                });
            }
            if let Some(table) = &rt.tables().pcie_reduce {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }

        Stage::COMPRESS => {
            let Some(compressor) = &task.compressor else {
                return Status::ok();
            };
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for COMPRESS");
            };
            let compressed =
                buff.with_range(task.offset, task.len, |window| compressor.compress(window));
            *task.compressed.lock() = Some(compressed);
            Status::ok()
        }

        Stage::PUSH => {
            if !rt.is_distributed() {
                // single-host cross-PCIe jobs use PUSH as a dummy barrier
                if let Some(table) = &rt.tables().push {
                    table.clear_ready_count(task.key);
                }
                return Status::ok();
            }
            let ps = match rt.ps() {
                Result::Ok(ps) => ps,
                Result::Err(status) => return status,
            };
            let dtype = dtype_of(task);
            let cmd = Command::new(RequestType::DefaultPushPull, dtype, DeviceKind::Cpu);
            let status = if let Some(compressed) = task.compressed.lock().clone() {
                let pskv = rt.encoder().encode_default_key(task.key, compressed.len());
                ps.push(&pskv, &compressed.data, cmd)
            } else {
                let Some(buff) = &task.cpu_buff else {
                    return Status::precondition_error("no staging buffer for PUSH");
                };
                let pskv = rt.encoder().encode_default_key(task.key, task.len);
                let data = crate::enqueue::read_shared_window(buff, task.offset, task.len);
                ps.push(&pskv, &data, cmd)
            };
            if let Some(table) = &rt.tables().push {
                table.clear_ready_count(task.key);
            }
            status
        }

        Stage::PULL => {
            let ps = match rt.ps() {
                Result::Ok(ps) => ps,
                Result::Err(status) => return status,
            };
            let dtype = dtype_of(task);
            let cmd = Command::new(RequestType::DefaultPushPull, dtype, DeviceKind::Cpu);
            if let Some(compressed) = task.compressed.lock().as_mut() {
                let pskv = rt.encoder().encode_default_key(task.key, compressed.len());
                let mut data = vec![0u8; compressed.len()];
                let status = ps.pull(&pskv, &mut data, cmd);
                compressed.data = data.into();
                return status;
            }
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for PULL");
            };
            let pskv = rt.encoder().encode_default_key(task.key, task.len);
            let mut data = vec![0u8; task.len];
            let status = ps.pull(&pskv, &mut data, cmd);
            buff.write_at(task.offset, &data);
            status
        }

        Stage::DECOMPRESS => {
            let Some(compressor) = &task.compressor else {
                return Status::ok();
            };
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for DECOMPRESS");
            };
            let Some(compressed) = task.compressed.lock().take() else {
                return Status::precondition_error("DECOMPRESS without compressed payload");
            };
            buff.with_range_mut(task.offset, task.len, |window| {
                compressor.decompress(&compressed, window)
            });
            Status::ok()
        }

        Stage::COPYH2D => {
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for COPYH2D");
            };
            let Some(output) = &task.output else {
                return Status::invalid_argument("COPYH2D without output");
            };
            let status = rt.gpu().copy_h2d(
                crate::gpu::StreamKind::CopyH2D,
                output.as_ref(),
                task.offset,
                buff,
                task.offset,
                task.len,
            );
            if !status.is_ok() {
                return status;
            }
            if rt.is_root_device() {
                if rt.local_size() > 1 {
                    return broadcast_msg(rt, Signal::CopyReady, task.key);
                }
            } else if let Some(table) = &rt.tables().copy {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }

        Stage::BROADCAST => {
            let Some(output) = &task.output else {
                return Status::invalid_argument("BROADCAST without output");
            };
            let status =
                rt.collective().broadcast(task.key, output.as_ref(), task.offset, task.len);
            if let Some(table) = &rt.tables().broadcast {
                table.clear_ready_count(task.key);
            }
            if !status.is_ok() {
                return status;
            }
            apply_average(rt, task);
            Status::ok()
        }

        Stage::SEND => run_send(rt, task),
        Stage::RECV => run_recv(rt, task),
        Stage::P2P_GROUP_COPYH2D => run_group_copy(rt, task),
        Stage::P2P_PULL => run_p2p_pull(rt, task),
        Stage::P2P_PULL_RESPONSE => run_p2p_pull_response(rt, task),
        Stage::P2P_WAIT_ACK => {
            if let Some(table) = &rt.tables().p2p_ack {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }

        Stage::GDR_V1_PUSH_PULL | Stage::GDR_V2_PUSH_PULL => {
            // GPU-direct: the partition window moves without host staging
            let ps = match rt.ps() {
                Result::Ok(ps) => ps,
                Result::Err(status) => return status,
            };
            let Some(tensor) = reduced_tensor(task) else {
                return Status::invalid_argument("GDR push without tensors");
            };
            let pskv = rt.encoder().encode_default_key(task.key, task.len);
            let cmd = Command::new(RequestType::DefaultPushPull, dtype_of(task), DeviceKind::Gpu);
            let data = tensor_window(tensor.as_ref(), task.offset, task.len);
            ps.push(&pskv, &data, cmd)
        }
        Stage::GDR_WAIT_PUSH_PULL => {
            let ps = match rt.ps() {
                Result::Ok(ps) => ps,
                Result::Err(status) => return status,
            };
            let Some(output) = reduced_tensor(task) else {
                return Status::invalid_argument("GDR wait without tensors");
            };
            let pskv = rt.encoder().encode_default_key(task.key, task.len);
            let cmd = Command::new(RequestType::DefaultPushPull, dtype_of(task), DeviceKind::Gpu);
            let mut data = vec![0u8; task.len];
            let status = ps.pull(&pskv, &mut data, cmd);
            output.write(task.offset, &data);
            task.push_pull_counter.store(0, Ordering::Release);
            if let Some(table) = &rt.tables().gdr_push_pull {
                table.clear_ready_count(task.key);
            }
            if !status.is_ok() {
                return status;
            }
            apply_average(rt, task);
            Status::ok()
        }

        Stage::CPU_COPY => {
            let Some(input) = &task.tensor else {
                return Status::invalid_argument("CPU_COPY without input");
            };
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for CPU_COPY");
            };
            buff.with_range_mut(task.offset, task.len, |w| input.read(task.offset, w));
            Status::ok()
        }
        Stage::CPU_REDUCE => run_cpu_reduce(rt, task),
        Stage::CPU_BCAST => run_cpu_bcast(rt, task),
        Stage::CPU_BCAST_FINISH => {
            if let Some(table) = &rt.tables().cpu_bcast_finish {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }

        Stage::ALLGATHER => run_allgather(rt, task),
        Stage::ALLGATHER_COPYD2H => {
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for ALLGATHER_COPYD2H");
            };
            let Some(output) = &task.output else {
                return Status::invalid_argument("ALLGATHER_COPYD2H without output");
            };
            let (offset, len) = allgather_node_span(rt, task);
            rt.gpu().copy_d2h(
                crate::gpu::StreamKind::AllgatherCopyD2H,
                buff,
                offset,
                output.as_ref(),
                offset,
                len,
            )
        }
        Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT => {
            // the local root collects the host's slice before the cross-node
            // pulls; with the gather already in the output this is bookkeeping
            if let Some(counter) = task.group().and_then(|g| g.wlr_counter.clone()) {
                counter.store(0, Ordering::Release);
            }
            Status::ok()
        }
        Stage::ALLGATHER_PULL => run_allgather_pull(rt, task),
        Stage::ALLGATHER_COPYH2D => {
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no staging buffer for ALLGATHER_COPYH2D");
            };
            let Some(output) = &task.output else {
                return Status::invalid_argument("ALLGATHER_COPYH2D without output");
            };
            let status = rt.gpu().copy_h2d(
                crate::gpu::StreamKind::AllgatherCopyH2D,
                output.as_ref(),
                0,
                buff,
                0,
                output.size().min(buff.len()),
            );
            if !status.is_ok() {
                return status;
            }
            if rt.is_root_device() {
                if rt.local_size() > 1 {
                    return broadcast_msg(rt, Signal::AllgatherCopyH2dReady, task.key);
                }
            } else if let Some(table) = &rt.tables().allgather_copy_h2d {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }
        Stage::ALLGATHER_BCAST => {
            let Some(output) = &task.output else {
                return Status::invalid_argument("ALLGATHER_BCAST without output");
            };
            let status =
                rt.collective().broadcast(task.key, output.as_ref(), 0, output.size());
            if let Some(table) = &rt.tables().allgather_bcast {
                table.clear_ready_count(task.key);
            }
            status
        }
        // receive-side bookkeeping of the all-gather pull protocol; the
        // rendezvous entries are fed by the fabric and consumed here
        Stage::ALLGATHER_PULL_RESP => {
            if let Some(table) = &rt.tables().allgather_pull_resp {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }
        Stage::ALLGATHER_PULL_ACK => {
            if let Some(table) = &rt.tables().allgather_pull_ack {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }
        Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_RESP => {
            if let Some(table) = &rt.tables().allgather_wlr_resp {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }
        Stage::ALLGATHER_PULL_WORKER_LOCAL_ROOT_ACK => {
            if let Some(table) = &rt.tables().allgather_wlr_ack {
                table.clear_ready_count(task.key);
            }
            Status::ok()
        }
    }
}

// ----------------------------------------------------------------------
// send / recv / alltoall actions
// ----------------------------------------------------------------------

fn run_send(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let ps = match rt.ps() {
        Result::Ok(ps) => ps,
        Result::Err(status) => return status,
    };
    let dtype = dtype_of(task);
    match &task.kind {
        TaskKind::P2p => {
            let Some(input) = &task.tensor else {
                return Status::invalid_argument("SEND without input");
            };
            let receiver = task.context.receiver;
            let cmd = Command::new(RequestType::DefaultSend, dtype, DeviceKind::Cpu);
            let pskv = rt.encoder().encode_p2p_key(task.key, task.len, receiver as usize);
            let data = if let Some(buff) = &task.cpu_buff {
                // stage through the registered aligned buffer
                buff.with_range_mut(0, task.len, |w| input.read(task.offset, w));
                crate::enqueue::read_shared_window(buff, 0, task.len)
            } else {
                tensor_window(input.as_ref(), task.offset, task.len)
            };
            ps.push(&pskv, &data, cmd)
        }
        TaskKind::AllToAll(ext) => {
            let my_rank = rt.rank() as usize;
            let num_ranks = ext.key_list.len();
            let on_gpu = ext.output_device != CPU_DEVICE_ID;
            let cmd = Command::new(RequestType::DefaultSend, dtype, device_kind_for(on_gpu));
            for i in 0..num_ranks {
                if i == my_rank {
                    continue;
                }
                let size = ext.offset_list[i + 1] - ext.offset_list[i];
                if size == 0 && !ext.output_size_unknown {
                    continue;
                }
                let data = match task.group_tensor(i) {
                    Some(tensor) if !ext.group_tensors.is_empty() => {
                        tensor_window(tensor.as_ref(), 0, size.min(tensor.size()))
                    }
                    Some(tensor) => tensor_window(tensor.as_ref(), ext.offset_list[i], size),
                    None => Vec::new(),
                };
                let pskv = rt.encoder().encode_p2p_key(ext.key_list[i], data.len(), i);
                if let Some(Some(buff)) = ext.cpu_buff_list.get(i) {
                    buff.write_at(0, &data);
                }
                let status = ps.push(&pskv, &data, cmd);
                if !status.is_ok() {
                    return status;
                }
                if let Some(counter) = &ext.request_counter {
                    counter.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Status::ok()
        }
        _ => Status::invalid_argument("SEND on a non-p2p task"),
    }
}

fn run_recv(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let clear = |key| {
        if let Some(table) = &rt.tables().p2p_copy {
            table.clear_ready_count(key);
        }
    };
    match &task.kind {
        TaskKind::P2p => {
            let Some(output) = &task.output else {
                return Status::invalid_argument("RECV without output");
            };
            let Some(buff) = &task.cpu_buff else {
                return Status::precondition_error("no receive staging for RECV");
            };
            buff.with_range(0, task.len, |r| output.write(task.offset, r));
            clear(task.key);
            Status::ok()
        }
        TaskKind::AllToAll(ext) => {
            let my_rank = rt.rank() as usize;
            let Some(index) = ext.key_list.iter().position(|k| *k == task.key) else {
                return Status::invalid_argument("response key not in key list");
            };
            let dst_offset =
                if ext.group_outputs.is_empty() { ext.offset_list[index] } else { 0 };
            let Some(output) = task.group_output(index).cloned() else {
                return Status::invalid_argument("RECV without output");
            };
            if index == my_rank {
                // local short-circuit: input window straight into the output
                let Some(input) = task.group_tensor(index).cloned() else {
                    return Status::invalid_argument("RECV without input for the self slot");
                };
                let src_offset = if ext.group_tensors.is_empty() { task.offset } else { 0 };
                let data = tensor_window(input.as_ref(), src_offset, task.len);
                output.write(dst_offset, &data);
            } else {
                let Some(Some(buff)) = ext.cpu_buff_list.get(index) else {
                    return Status::precondition_error("no receive staging for RECV");
                };
                buff.with_range(0, task.len, |r| output.write(dst_offset, r));
            }
            clear(task.key);
            Status::ok()
        }
        _ => Status::invalid_argument("RECV on a non-p2p task"),
    }
}

/// Group receive with unknown sizes: all payloads arrived, copy them out in
/// rank order, publish the received sizes, resize the output.
fn run_group_copy(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let TaskKind::AllToAll(ext) = &task.kind else {
        return Status::invalid_argument("group copy on a non-alltoall task");
    };
    let Some(output) = &task.output else {
        return Status::invalid_argument("group copy without output");
    };
    let my_rank = rt.rank() as usize;
    let num_ranks = ext.key_list.len();
    let unit = dtype_of(task).size();

    let mut sizes = vec![0usize; num_ranks];
    for (i, size) in sizes.iter_mut().enumerate() {
        if i == my_rank {
            *size = ext.offset_list[i + 1] - ext.offset_list[i];
        } else {
            *size = rt.tables().recv_lens.get(&ext.key_list[i]).map(|e| *e).unwrap_or(0);
        }
    }
    let total: usize = sizes.iter().sum();
    let stride: usize = {
        let shape = task.tensor.as_ref().map(|t| t.shape()).unwrap_or_default();
        (shape.row_stride().max(1)) as usize
    };
    let _ = output.resize(&crate::tensor::TensorShape::new(vec![
        (total / unit / stride) as i64,
        stride as i64,
    ]));

    let mut cursor = 0usize;
    for i in 0..num_ranks {
        let size = sizes[i];
        if size == 0 {
            continue;
        }
        if i == my_rank {
            if let Some(input) = task.group_tensor(i) {
                let data = tensor_window(input.as_ref(), ext.offset_list[i], size);
                output.write(cursor, &data);
            }
        } else if let Some(Some(buff)) = ext.cpu_buff_list.get(i) {
            buff.with_range(0, size, |r| output.write(cursor, r));
        }
        cursor += size;
    }

    // publish per-rank received sizes for the caller
    if let Some(aux) = &ext.aux_output {
        let rows: Vec<u8> = sizes
            .iter()
            .flat_map(|s| ((*s / unit) as i32).to_le_bytes())
            .collect();
        aux.write(0, &rows);
    }

    for key in &ext.key_list {
        rt.tables().recv_lens.remove(key);
    }
    if let Some(table) = &rt.tables().p2p_group_copy {
        table.clear_ready_count(task.key);
    }
    Status::ok()
}

fn run_p2p_pull(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let TaskKind::AllToAll(ext) = &task.kind else {
        return Status::invalid_argument("pull on a non-alltoall task");
    };
    let Some(output) = &task.output else {
        return Status::invalid_argument("pull without output");
    };
    let ps = match rt.ps() {
        Result::Ok(ps) => ps,
        Result::Err(status) => return status,
    };
    let my_rank = rt.rank() as usize;
    let dtype = dtype_of(task);
    let pull_cmd = Command::new(RequestType::GatherPull, dtype, DeviceKind::Cpu);
    let ack_cmd = Command::new(RequestType::AckSignal, dtype, DeviceKind::Cpu);
    for i in 0..ext.key_list.len() {
        if i == my_rank {
            continue;
        }
        let size = ext.offset_list[i + 1] - ext.offset_list[i];
        if size == 0 {
            continue;
        }
        // the responder publishes our slice under our composed key on its
        // own shard
        let key = crate::keys::alltoall_key(task.context.declared_key, my_rank as u32);
        let pskv = rt.encoder().encode_p2p_key(key, size, i);
        let mut data = vec![0u8; size];
        let status = ps.pull(&pskv, &mut data, pull_cmd);
        if !status.is_ok() {
            return status;
        }
        output.write(ext.offset_list[i], &data);
        if !rt.config().p2p_disable_pull_ack {
            let status = ps.push(&pskv, &[], ack_cmd);
            if !status.is_ok() {
                return status;
            }
        }
        if let Some(counter) = &ext.request_counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
    Status::ok()
}

fn run_p2p_pull_response(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let TaskKind::AllToAll(ext) = &task.kind else {
        return Status::invalid_argument("pull response on a non-alltoall task");
    };
    let my_rank = rt.rank() as usize;
    let Some(index) = ext.key_list.iter().position(|k| *k == task.key) else {
        return Status::invalid_argument("response key not in key list");
    };
    let status = if index == my_rank {
        // self slot: input window straight into the output
        let (Some(input), Some(output)) = (&task.tensor, &task.output) else {
            return Status::invalid_argument("pull response without tensors");
        };
        let data = tensor_window(input.as_ref(), task.offset, task.len);
        let dst = if ext.group_outputs.is_empty() { ext.offset_list[index] } else { 0 };
        output.write(dst, &data);
        Status::ok()
    } else {
        let Some(input) = &task.tensor else {
            return Status::invalid_argument("pull response without input");
        };
        let ps = match rt.ps() {
            Result::Ok(ps) => ps,
            Result::Err(status) => return status,
        };
        // publish the requester's slice on our shard under its composed key
        let data = tensor_window(input.as_ref(), ext.offset_list[index], task.len);
        let pskv = rt.encoder().encode_p2p_key(task.key, data.len(), rt.rank() as usize);
        let cmd = Command::new(RequestType::DefaultSend, dtype_of(task), DeviceKind::Cpu);
        ps.push(&pskv, &data, cmd)
    };
    if let Some(table) = &rt.tables().p2p_pull_response {
        table.clear_ready_count(task.key);
    }
    status
}

// ----------------------------------------------------------------------
// all-gather actions
// ----------------------------------------------------------------------

/// Byte offset of a global rank's slice in the gathered output.
fn allgather_rank_offset(task: &Task, rank: usize) -> usize {
    match task.group() {
        Some(ext) if !ext.offset_list.is_empty() => ext.offset_list[rank],
        _ => rank * task.tensor.as_ref().map(|t| t.size()).unwrap_or(0),
    }
}

/// This host's span (offset, len) within the gathered output.
fn allgather_node_span(rt: &Runtime, task: &Task) -> (usize, usize) {
    let first = (rt.phy_node_id() * rt.local_size()) as usize;
    let last = first + rt.local_size() as usize;
    let begin = allgather_rank_offset(task, first);
    let end = if last >= rt.size() as usize {
        task.output.as_ref().map(|t| t.size()).unwrap_or(0)
    } else {
        allgather_rank_offset(task, last)
    };
    (begin, end.saturating_sub(begin))
}

fn run_allgather(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let (Some(input), Some(output)) = (&task.tensor, &task.output) else {
        return Status::invalid_argument("ALLGATHER without tensors");
    };
    let first = (rt.phy_node_id() * rt.local_size()) as usize;
    let offsets: Vec<usize> = (0..rt.local_size() as usize)
        .map(|j| allgather_rank_offset(task, first + j))
        .collect();
    let status =
        rt.collective().allgather(task.key, input.as_ref(), output.as_ref(), &offsets);
    if let Some(table) = &rt.tables().allgather {
        table.clear_ready_count(task.key);
    }
    status
}

fn run_allgather_pull(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let TaskKind::AllGather(ext) = &task.kind else {
        return Status::invalid_argument("allgather pull on a wrong task kind");
    };
    let Some(output) = &task.output else {
        return Status::invalid_argument("allgather pull without output");
    };
    let ps = match rt.ps() {
        Result::Ok(ps) => ps,
        Result::Err(status) => return status,
    };
    let dtype = dtype_of(task);
    let my_node = rt.phy_node_id();

    // publish this host's span, then collect every other host's
    let (offset, len) = allgather_node_span(rt, task);
    let span = {
        let mut data = vec![0u8; len];
        output.read(offset, &mut data);
        data
    };
    let send_cmd = Command::new(RequestType::DefaultSend, dtype, DeviceKind::Cpu);
    let own_key = ext.key_list[my_node as usize];
    let pskv = rt.encoder().encode_p2p_key(own_key, span.len(), my_node as usize);
    let status = ps.push(&pskv, &span, send_cmd);
    if !status.is_ok() {
        return status;
    }

    let pull_cmd = Command::new(RequestType::GatherPull, dtype, DeviceKind::Cpu);
    for node in 0..rt.num_phy_node() {
        if node == my_node {
            continue;
        }
        let first = (node * rt.local_size()) as usize;
        let last = first + rt.local_size() as usize;
        let begin = allgather_rank_offset(task, first);
        let end = if last >= rt.size() as usize {
            output.size()
        } else {
            allgather_rank_offset(task, last)
        };
        let mut data = vec![0u8; end.saturating_sub(begin)];
        let pskv =
            rt.encoder().encode_p2p_key(ext.key_list[node as usize], data.len(), node as usize);
        let status = ps.pull(&pskv, &mut data, pull_cmd);
        if !status.is_ok() {
            return status;
        }
        output.write(begin, &data);
        if let Some(counter) = &ext.request_counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
    Status::ok()
}

fn device_kind_for(on_gpu: bool) -> DeviceKind {
    if on_gpu { DeviceKind::Gpu } else { DeviceKind::Cpu }
}

fn run_cpu_reduce(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    if !rt.is_root_device() {
        // own contribution already staged by CPU_COPY; announce it
        if rt.local_size() > 1 {
            return signal_root_msg(rt, Signal::CpuReduceReady, task.key);
        }
        return Status::ok();
    }
    let Some(buff) = &task.cpu_buff else {
        return Status::precondition_error("no staging buffer for CPU_REDUCE");
    };
    let dtype = dtype_of(task);
    let root = rt.worker_local_root() as usize;
    for (i, peer) in task.numa_cpu_buff.iter().enumerate() {
        if i == root {
            continue;
        }
        let src = crate::enqueue::read_shared_window(peer, task.offset, task.len);
        buff.with_range_mut(task.offset, task.len, |dst| {
            rt.reducer().sum(dst, &src, task.len, dtype)
        });
    }
    if let Some(table) = &rt.tables().cpu_reduce {
        table.clear_ready_count(task.key);
    }
    Status::ok()
}

fn run_cpu_bcast(rt: &Arc<Runtime>, task: &Arc<Task>) -> Status {
    let Some(output) = &task.output else {
        return Status::invalid_argument("CPU_BCAST without output");
    };
    let dtype = dtype_of(task);
    if rt.is_root_device() {
        let Some(buff) = &task.cpu_buff else {
            return Status::precondition_error("no staging buffer for CPU_BCAST");
        };
        buff.with_range(task.offset, task.len, |r| output.write(task.offset, r));
        if task.reduce_op == ReduceOp::Average {
            let mut window = tensor_window(output.as_ref(), task.offset, task.len);
            rt.reducer().scale(&mut window, task.len, dtype, 1.0 / rt.size() as f64);
            output.write(task.offset, &window);
        }
        if rt.local_size() > 1 {
            return broadcast_msg(rt, Signal::CpuBcastReady, task.key);
        }
        Status::ok()
    } else {
        // read the final data out of the root's shared segment
        let root = task
            .context
            .worker_local_root
            .load(Ordering::Relaxed)
            .max(0) as usize;
        let Some(root_buff) = task.numa_cpu_buff.get(root) else {
            return Status::precondition_error("root staging segment not mapped");
        };
        root_buff.with_range(task.offset, task.len, |r| output.write(task.offset, r));
        if task.reduce_op == ReduceOp::Average {
            let mut window = tensor_window(output.as_ref(), task.offset, task.len);
            rt.reducer().scale(&mut window, task.len, dtype, 1.0 / rt.size() as f64);
            output.write(task.offset, &window);
        }
        if let Some(table) = &rt.tables().cpu_bcast {
            table.clear_ready_count(task.key);
        }
        signal_root_msg(rt, Signal::CpuBcastFinishReady, task.key)
    }
}

// ----------------------------------------------------------------------
// listen / monitor loops
// ----------------------------------------------------------------------

/// Routes peer control messages into the ready tables.
pub fn start_listen_loop(rt: &Arc<Runtime>) -> std::thread::JoinHandle<()> {
    let rt = rt.clone();
    std::thread::Builder::new()
        .name("psbus-listen".to_string())
        .spawn(move || {
            while !rt.should_shutdown() {
                let Some(msg) = rt.comm().recv_timeout(Duration::from_millis(100)) else {
                    continue;
                };
                let tables = rt.tables();
                let table = match msg.signal {
                    Signal::Barrier => None,
                    Signal::ReduceReady => tables.reduce.as_ref(),
                    Signal::PcieReduceReady => tables.pcie_reduce.as_ref(),
                    Signal::PushReady => tables.push.as_ref(),
                    Signal::BcastReady => tables.broadcast.as_ref(),
                    Signal::CopyReady => tables.copy.as_ref(),
                    Signal::CpuReduceReady => tables.cpu_reduce.as_ref(),
                    Signal::CpuBcastReady => tables.cpu_bcast.as_ref(),
                    Signal::CpuBcastFinishReady => tables.cpu_bcast_finish.as_ref(),
                    Signal::AllgatherReady => tables.allgather.as_ref(),
                    Signal::AllgatherBcastReady => tables.allgather_bcast.as_ref(),
                    Signal::AllgatherCopyH2dReady => tables.allgather_copy_h2d.as_ref(),
                };
                if let Some(table) = table {
                    table.add_ready_count(msg.key);
                } else if msg.signal != Signal::Barrier {
                    tracing::warn!(?msg, "control message for a table this role does not own");
                }
            }
            tracing::trace!("listen loop joined");
        })
        .expect("spawn listen thread")
}

/// Logs queues that have not drained since the last interval; optionally
/// aborts the process on a stall.
pub fn start_monitor_loop(rt: &Arc<Runtime>) -> std::thread::JoinHandle<()> {
    let rt = rt.clone();
    std::thread::Builder::new()
        .name("psbus-monitor".to_string())
        .spawn(move || {
            let interval = Duration::from_secs(rt.config().monitor_interval_secs);
            let mut last: Vec<usize> = Stage::ALL.iter().map(|s| rt.queue(*s).pending()).collect();
            loop {
                if rt.shutdown_signal().wait_timeout(interval) {
                    break;
                }
                let mut stalled = false;
                for (stage, previous) in Stage::ALL.iter().zip(last.iter_mut()) {
                    let pending = rt.queue(*stage).pending();
                    if pending > 0 && pending == *previous {
                        tracing::warn!(stage = %stage, pending, "queue has not drained since the last check");
                        stalled = true;
                    }
                    *previous = pending;
                }
                if stalled && rt.config().abort_on_timeout {
                    tracing::error!("aborting on stalled pipeline");
                    std::process::abort();
                }
            }
            tracing::trace!("monitor loop joined");
        })
        .expect("spawn monitor thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn launch(config: RuntimeConfig) -> Arc<Runtime> {
        let dir = tempfile::tempdir().unwrap();
        Runtime::builder()
            .config(config)
            .shm_base_dir(dir.into_path())
            .launch()
            .unwrap()
    }

    #[test]
    fn test_active_stages_single_node() {
        let rt = launch(RuntimeConfig::default());
        let stages = active_stages(&rt);
        // no fabric traffic without a distributed job
        assert!(!stages.contains(&Stage::PUSH));
        assert!(!stages.contains(&Stage::PULL));
        assert!(!stages.contains(&Stage::SEND));
        // the local collective loops still run
        assert!(stages.contains(&Stage::REDUCE));
        assert!(stages.contains(&Stage::BROADCAST));
        assert!(stages.contains(&Stage::CPU_REDUCE));
        rt.shutdown();
    }

    #[test]
    fn test_active_stages_distributed_root() {
        let mut config = RuntimeConfig::default();
        config.num_worker = 2;
        config.num_server = 1;
        let rt = launch(config);
        let stages = active_stages(&rt);
        assert!(stages.contains(&Stage::PUSH));
        assert!(stages.contains(&Stage::PULL));
        assert!(stages.contains(&Stage::COPYD2H));
        assert!(stages.contains(&Stage::COPYH2D));
        // compression loops stay off by default
        assert!(!stages.contains(&Stage::COMPRESS));
        rt.shutdown();
    }

    #[test]
    fn test_active_stages_joint_alltoall() {
        let mut config = RuntimeConfig::default();
        config.role = crate::config::Role::Joint;
        config.num_worker = 2;
        config.num_server = 2;
        let rt = launch(config);
        let stages = active_stages(&rt);
        assert!(stages.contains(&Stage::SEND));
        assert!(stages.contains(&Stage::RECV));
        assert!(stages.contains(&Stage::P2P_GROUP_COPYH2D));
        assert!(!stages.contains(&Stage::P2P_PULL));
        assert!(stages.contains(&Stage::ALLGATHER));
        rt.shutdown();
    }
}
