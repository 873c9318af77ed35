// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The submission front-end.
//!
//! `enqueue_tensor` turns one framework submission into `ceil(size / bound)`
//! partition tasks with consecutive routing keys and posts each onto the
//! first queue of its pipeline. The all-to-all and all-gather front-ends
//! build one request task plus a set of response tasks sharing a single
//! completion counter. First use of a context runs its initialization here:
//! key-list generation, staging allocation, shared-memory attachment and the
//! blocking registration pushes that double as a global barrier.

use std::sync::Arc;
use std::sync::atomic::AtomicI32;

use crate::Status;
use crate::compress;
use crate::context::{Context, ContextBuffers};
use crate::gpu::ReadyEvent;
use crate::keys::{self, MAX_PARTITIONS, OpType};
use crate::runtime::Runtime;
use crate::shm::SharedBuffer;
use crate::stage::{self, Stage};
use crate::task::{Completion, GroupExt, StatusCallback, Task, TaskKind};
use crate::tensor::{CPU_DEVICE_ID, DataType, Tensor, TensorShape};
use crate::transport::{Command, DeviceKind, RequestType};

/// Byte lengths of the partitions of a `size`-byte tensor.
pub fn partition_lens(size: usize, bound: usize) -> Vec<usize> {
    debug_assert!(bound > 0);
    let mut lens = Vec::with_capacity(size.div_ceil(bound));
    let mut accumulated = 0;
    while accumulated < size {
        let len = bound.min(size - accumulated);
        lens.push(len);
        accumulated += len;
    }
    lens
}

/// Staging alignment: pad to a dtype-derived block so compressors and the
/// fabric see whole elements.
fn align_size(size: usize, dtype: DataType) -> usize {
    let min_size = dtype.size() * dtype.size() * 8;
    size + (min_size - size % min_size) % min_size
}

fn device_kind(on_gpu: bool) -> DeviceKind {
    if on_gpu { DeviceKind::Gpu } else { DeviceKind::Cpu }
}

pub fn read_shared_window(buff: &SharedBuffer, offset: usize, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    buff.read_at(offset, &mut data);
    data
}

// ----------------------------------------------------------------------
// lazy initialization
// ----------------------------------------------------------------------

/// Generate consecutive partition keys starting at the namespace base.
fn partition_keys(op: OpType, declared_key: u32, sender: u32, parts: usize) -> Result<Vec<u64>, Status> {
    if parts as u64 > MAX_PARTITIONS {
        return Err(Status::invalid_argument(format!(
            "{parts} partitions exceed the {MAX_PARTITIONS}-partition key budget"
        )));
    }
    let start = keys::start_key(op, declared_key, sender);
    Ok((0..parts as u64).map(|i| start + i).collect())
}

/// Push-pull initialization: partition keys, staging buffers (shared-memory
/// backed for anything local peers read), compressors, and the leader's
/// registration pushes.
fn init_push_pull(
    rt: &Runtime,
    ctx: &Arc<Context>,
    size: usize,
    dtype: DataType,
    cpu_tensor: bool,
) -> Result<(), Status> {
    ctx.init_once(|| {
        if size == 0 {
            return Err(Status::invalid_argument(format!("{}: empty tensor", ctx.name)));
        }
        ctx.local_rank.store(rt.local_rank(), std::sync::atomic::Ordering::Relaxed);
        ctx.worker_local_root.store(rt.worker_local_root(), std::sync::atomic::Ordering::Relaxed);

        let bound = rt.partition_bytes() as usize;
        let lens = partition_lens(size, bound);
        let key_list = partition_keys(OpType::PushPull, ctx.declared_key, 0, lens.len())?;
        tracing::debug!(
            name = %ctx.name,
            parts = key_list.len(),
            total_len = size,
            key_range = ?(key_list.first(), key_list.last()),
            rank = rt.rank(),
            "partitioned tensor",
        );

        let mut buffers = ContextBuffers { key_list, ..Default::default() };
        let aligned = align_size(size, dtype);
        let shm_err = |e: anyhow::Error| Status::unknown_error(e.to_string());
        let key0 = buffers.key_list[0];

        if rt.is_cross_pcie_switch() {
            if cpu_tensor {
                return Err(Status::invalid_argument(
                    "CPU all-reduce does not support cross-PCIe-switch topologies",
                ));
            }
            let prefix = format!("BytePS_Pcie_{}", rt.config().job_id);
            buffers.pcie_cpu_buff = rt
                .shm()
                .open_pcie_shared(&prefix, key0, aligned, rt.collective().num_switch() as usize)
                .map(|v| v.into_iter().map(Arc::new).collect::<Vec<_>>())
                .map_err(shm_err)?;
            buffers.cpu_buff = buffers.pcie_cpu_buff.last().cloned();
        } else if cpu_tensor {
            if rt.config().disable_cpu_allreduce {
                return Err(Status::precondition_error("CPU all-reduce is disabled"));
            }
            let root = rt.worker_local_root();
            for i in 0..rt.local_size() {
                let mut prefix = format!("BytePS_ShM_{}_", rt.config().job_id);
                if i != root {
                    prefix.push_str(&format!("_Numa_{i}"));
                }
                let seg = rt.shm().open_shared(&prefix, key0, aligned).map_err(shm_err)?;
                buffers.numa_cpu_buff.push(Arc::new(seg));
            }
            buffers.cpu_buff = Some(buffers.numa_cpu_buff[rt.local_rank() as usize].clone());
        } else if !rt.is_gdr() {
            if rt.config().disable_gpu_allreduce {
                return Err(Status::precondition_error("GPU all-reduce is disabled"));
            }
            let prefix = format!("BytePS_ShM_{}_", rt.config().job_id);
            let seg = rt.shm().open_shared(&prefix, key0, aligned).map_err(shm_err)?;
            buffers.cpu_buff = Some(Arc::new(seg));
        }

        // small tensors are never compressed
        let mut kwargs = ctx.kwargs();
        if size < rt.config().min_compress_bytes as usize {
            ctx.clear_kwargs();
            kwargs.clear();
        }

        let should_init_push = rt.is_root_device() && (cpu_tensor || !rt.is_gdr());
        if rt.is_distributed() && should_init_push {
            let ps = rt.ps()?;
            let cpu_buff = buffers
                .cpu_buff
                .as_ref()
                .ok_or_else(|| Status::precondition_error("no staging buffer allocated"))?;
            let cmd = Command::new(RequestType::LeaderPushPull, dtype, DeviceKind::Cpu);
            let mut accumulated = 0;
            for (key, len) in buffers.key_list.iter().zip(&lens) {
                let pskv = rt.encoder().encode_default_key(*key, *len);
                let data = read_shared_window(cpu_buff, accumulated, *len);
                // blocking push, also a global barrier
                let status = ps.push(&pskv, &data, cmd);
                if !status.is_ok() {
                    return Err(status);
                }
                if !kwargs.is_empty() {
                    if let Some(compressor) =
                        compress::create(&kwargs, align_size(*len, dtype), dtype)
                    {
                        buffers.compressors.push(compressor);
                    }
                }
                accumulated += len;
            }

            if !kwargs.is_empty() {
                let content = serde_json::to_vec(&kwargs)
                    .map_err(|e| Status::unknown_error(e.to_string()))?;
                let cmd = Command::new(RequestType::CompressedPushPull, dtype, DeviceKind::Cpu);
                for key in &buffers.key_list {
                    let pskv = rt.encoder().encode_default_key(*key, content.len());
                    let status = ps.push(&pskv, &content, cmd);
                    if !status.is_ok() {
                        return Err(status);
                    }
                }
            }
        }

        tracing::trace!(name = %ctx.name, size, parts = buffers.key_list.len(), "finish init");
        Ok(buffers)
    })?;
    Ok(())
}

/// p2p initialization: per-pair keys, sender/receiver staging in the p2p
/// shared-memory namespace, and the sender's blocking registration push.
fn init_p2p(
    rt: &Runtime,
    ctx: &Arc<Context>,
    size: usize,
    dtype: DataType,
    recv_on_gpu: bool,
) -> Result<(), Status> {
    if !rt.is_joint() {
        return Err(Status::precondition_error("send/recv requires joint mode"));
    }
    if size == 0 {
        return Err(Status::invalid_argument(format!("{}: empty tensor", ctx.name)));
    }
    let bound = rt.partition_bytes() as usize;
    if ctx.initialized() {
        // the number of partitions must not change across submissions
        let parts = size.div_ceil(bound);
        if ctx.key_list().len() != parts {
            return Err(Status::precondition_error(format!(
                "{}: unexpected partition count {} vs {}",
                ctx.name,
                parts,
                ctx.key_list().len()
            )));
        }
        return Ok(());
    }
    let sender = if ctx.sender == -1 { rt.rank() } else { ctx.sender };
    let receiver = if ctx.receiver == -1 { rt.rank() } else { ctx.receiver };
    ctx.init_once(|| {
        ctx.local_rank.store(rt.local_rank(), std::sync::atomic::Ordering::Relaxed);
        let lens = partition_lens(size, bound);
        let key_list = partition_keys(OpType::P2p, ctx.declared_key, sender as u32, lens.len())?;
        tracing::debug!(
            name = %ctx.name,
            parts = key_list.len(),
            total_len = size,
            sender,
            receiver,
            worker_id = rt.worker_id(),
            "partitioned p2p tensor",
        );

        let mut buffers = ContextBuffers { key_list, ..Default::default() };
        let shm_name =
            format!("BytePS_P2P_ShM_{}_{}_", rt.config().job_id, rt.worker_id());
        let ps = rt.ps()?;
        let my_rank = rt.rank();
        let cmd = Command::new(RequestType::DefaultSend, dtype, device_kind(recv_on_gpu));
        for key in &buffers.key_list {
            // encode at full bound: partition count must stay stable
            let pskv = rt.encoder().encode_p2p_key(*key, bound, receiver as usize);
            if sender == my_rank && sender != receiver {
                let buff = Arc::new(
                    rt.shm()
                        .open_shared(&shm_name, pskv.keys[0], bound)
                        .map_err(|e| Status::unknown_error(e.to_string()))?,
                );
                // blocking push, also a global barrier
                let status = ps.push(&pskv, &read_shared_window(&buff, 0, bound), cmd);
                if !status.is_ok() {
                    return Err(status);
                }
                buffers.cpu_buff_list.push(Some(buff));
            } else if receiver == my_rank {
                // receive staging the fabric delivery path lands in
                let buff = Arc::new(
                    rt.shm()
                        .open_shared(&shm_name, pskv.keys[0], bound)
                        .map_err(|e| Status::unknown_error(e.to_string()))?,
                );
                buffers.cpu_buff_list.push(Some(buff));
            } else {
                buffers.cpu_buff_list.push(None);
            }
        }
        Ok(buffers)
    })?;
    Ok(())
}

/// All-to-all initialization: per-rank bounds sized from the first
/// minibatch, the composed request/response key list, per-rank staging and
/// the registration pushes that act as a barrier across ranks.
#[allow(clippy::too_many_arguments)]
fn init_alltoall(
    rt: &Runtime,
    ctx: &Arc<Context>,
    request_size_list: &[usize],
    resp_size_list: &[usize],
    dtype: DataType,
    recv_on_gpu: bool,
    use_pull: bool,
) -> Result<(), Status> {
    let num_ranks = request_size_list.len();
    let min_bound = rt.alltoall_buff_bytes();
    if !ctx.initialized() {
        ctx.init_once(|| {
            ctx.local_rank.store(rt.local_rank(), std::sync::atomic::Ordering::Relaxed);
            let factor = rt.config().alltoall_buff_factor;
            let mut bounds_for_ranks = Vec::with_capacity(num_ranks);
            for i in 0..num_ranks {
                let first = request_size_list[i].max(resp_size_list[i]);
                let needed = (first as f64 * factor) as u32;
                bounds_for_ranks.push(needed.max(min_bound));
            }
            tracing::debug!(
                name = %ctx.base_name,
                min_bound,
                factor,
                ?bounds_for_ranks,
                "set alltoall buffer bounds",
            );

            let my_rank = rt.rank() as u32;
            let mut key_list = Vec::with_capacity(num_ranks * 2);
            // the request half shares this rank's key
            let request_key = keys::alltoall_key(ctx.declared_key, my_rank);
            key_list.extend(std::iter::repeat_n(request_key, num_ranks));
            for i in 0..num_ranks as u32 {
                key_list.push(keys::alltoall_key(ctx.declared_key, i));
            }

            let mut buffers = ContextBuffers {
                key_list,
                bounds_for_ranks: bounds_for_ranks.clone(),
                ..Default::default()
            };
            let ps = rt.ps()?;
            let cmd = Command::new(RequestType::DefaultSend, dtype, device_kind(recv_on_gpu));
            for i in 0..num_ranks {
                if use_pull {
                    buffers.cpu_buff_list.push(None);
                    continue;
                }
                let buff = Arc::new(SharedBuffer::alloc(bounds_for_ranks[i] as usize));
                if i != rt.rank() as usize {
                    let pskv = rt.encoder().encode_p2p_key(
                        buffers.key_list[i],
                        bounds_for_ranks[i] as usize,
                        i,
                    );
                    // blocking push, also a global barrier
                    let status =
                        ps.push(&pskv, &read_shared_window(&buff, 0, buff.len()), cmd);
                    if !status.is_ok() {
                        return Err(status);
                    }
                }
                if rt.config().skip_input_copy {
                    buffers.cpu_buff_list.push(None);
                } else {
                    buffers.cpu_buff_list.push(Some(buff));
                }
            }
            for i in 0..num_ranks {
                // response staging the fabric delivery path lands in
                buffers
                    .cpu_buff_list
                    .push(Some(Arc::new(SharedBuffer::alloc(bounds_for_ranks[i] as usize))));
            }
            Ok(buffers)
        })?;
    }

    // on every minibatch, sizes are checked against the ceiling
    let buffers = ctx.buffers()?;
    for i in 0..num_ranks {
        let bound = *buffers.bounds_for_ranks.get(i).unwrap_or(&0) as usize;
        if request_size_list[i] > bound || resp_size_list[i] > bound {
            return Err(Status::invalid_argument(format!(
                "{}: alltoall size for rank {i} exceeds buffer bound {bound} \
                 (send={}, recv={})",
                ctx.name, request_size_list[i], resp_size_list[i]
            )));
        }
    }
    Ok(())
}

fn init_allgather(
    rt: &Runtime,
    ctx: &Arc<Context>,
    input_size: usize,
    output_size: usize,
    dtype: DataType,
) -> Result<(), Status> {
    ctx.init_once(|| {
        if input_size == 0 || output_size == 0 {
            return Err(Status::invalid_argument(format!("{}: empty tensor", ctx.name)));
        }
        ctx.worker_local_root.store(rt.worker_local_root(), std::sync::atomic::Ordering::Relaxed);
        ctx.local_rank.store(rt.local_rank(), std::sync::atomic::Ordering::Relaxed);

        let num_phy_node = rt.num_phy_node();
        let mut key_list = Vec::with_capacity(num_phy_node as usize);
        for i in 0..num_phy_node as u32 {
            key_list.push(keys::start_key(OpType::AllGather, ctx.declared_key, i));
        }
        let mut buffers = ContextBuffers { key_list, ..Default::default() };

        // host staging is only needed off the GPU-direct path
        if !rt.is_gdr_allgather() {
            let prefix = format!("BytePS_ShM_{}_", rt.config().job_id);
            let seg = rt
                .shm()
                .open_shared(&prefix, buffers.key_list[0], align_size(output_size, dtype))
                .map_err(|e| Status::unknown_error(e.to_string()))?;
            buffers.cpu_buff = Some(Arc::new(seg));
        }
        tracing::trace!(name = %ctx.name, input_size, "finish init allgather");
        Ok(buffers)
    })?;
    Ok(())
}

// ----------------------------------------------------------------------
// push-pull / p2p submission
// ----------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn enqueue_tensor(
    rt: &Arc<Runtime>,
    ctx: Arc<Context>,
    input: Option<Arc<dyn Tensor>>,
    output: Option<Arc<dyn Tensor>>,
    ready_event: Option<Arc<dyn ReadyEvent>>,
    device: i32,
    priority: i32,
    version: i32,
    callback: Option<StatusCallback>,
    mut stage_list: Vec<Stage>,
    reduce_op: crate::tensor::ReduceOp,
) -> Result<(), Status> {
    if rt.should_shutdown() {
        return Ok(());
    }
    let name = ctx.name.clone();
    if let (Some(input), Some(output)) = (&input, &output) {
        if ctx.op_type == OpType::PushPull && input.size() != output.size() {
            return Err(Status::invalid_argument(format!(
                "{name}: output tensor size does not match ({} vs {})",
                input.size(),
                output.size()
            )));
        }
    }
    let reference = input.as_ref().or(output.as_ref()).ok_or_else(|| {
        Status::invalid_argument(format!("{name}: neither input nor output given"))
    })?;
    let size = reference.size();
    let dtype = reference.dtype();

    match ctx.op_type {
        OpType::PushPull => init_push_pull(rt, &ctx, size, dtype, device == CPU_DEVICE_ID)?,
        OpType::P2p => {
            let recv_on_gpu = output.as_ref().map(|o| o.device() != CPU_DEVICE_ID).unwrap_or(false);
            init_p2p(rt, &ctx, size, dtype, recv_on_gpu)?;
        }
        _ => {
            return Err(Status::invalid_argument(format!(
                "{name}: {} submissions use their own front-end",
                ctx.op_type.name()
            )));
        }
    }
    let buffers = ctx.buffers()?;

    // the root compresses just before PUSH and expands just after PULL
    if rt.is_root_device() && !buffers.compressors.is_empty() {
        if let Some(pos) = stage_list.iter().position(|s| *s == Stage::PUSH) {
            stage_list.insert(pos, Stage::COMPRESS);
        }
        if let Some(pos) = stage_list.iter().position(|s| *s == Stage::PULL) {
            stage_list.insert(pos + 1, Stage::DECOMPRESS);
        }
    }

    let total_partnum = buffers.key_list.len() as u32;
    let completion = Completion::new(total_partnum, callback.clone());

    if stage_list.is_empty() {
        tracing::trace!(name = %name, device, "no stages assigned, skipped");
        completion.complete_now();
        return Ok(());
    }

    ctx.op_count
        .store(rt.telemetry().record_start(&ctx.base_name), std::sync::atomic::Ordering::Relaxed);
    if ctx.update_profile(&rt.config().trace, rt.trace_state()) {
        // the last traced tensor left the window: emit asynchronously
        let rt = rt.clone();
        std::thread::spawn(move || {
            if let Err(e) = rt.output_traces() {
                tracing::warn!(error = %e, "trace output failed");
            }
        });
    }
    ctx.step_cnt.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let bound = rt.partition_bytes() as usize;
    let lens = partition_lens(size, bound);
    if lens.len() != buffers.key_list.len() {
        return Err(Status::invalid_argument(format!(
            "{name}: partition count changed ({} vs {})",
            lens.len(),
            buffers.key_list.len()
        )));
    }

    let kind = || match ctx.op_type {
        OpType::P2p => TaskKind::P2p,
        _ => TaskKind::PushPull,
    };
    let mut accumulated = 0usize;
    for (i, (key, len)) in buffers.key_list.iter().zip(&lens).enumerate() {
        let mut task = Task::new(
            format!("{name}_{i}"),
            ctx.clone(),
            stage_list.clone(),
            completion.clone(),
            kind(),
        );
        task.key = *key;
        task.tensor = input.clone();
        task.output = output.clone();
        task.ready_event = ready_event.clone();
        task.priority = priority;
        task.version = version;
        task.device = device;
        task.reduce_op = reduce_op;
        task.offset = accumulated;
        task.len = *len;
        task.total_partnum = total_partnum;
        task.push_pull_counter = Arc::new(AtomicI32::new(rt.num_phy_node() - 1));
        if ctx.op_type == OpType::P2p {
            task.cpu_buff = buffers.cpu_buff_list.get(i).cloned().flatten();
        } else {
            task.cpu_buff = buffers.cpu_buff.clone();
        }
        task.pcie_cpu_buff = buffers.pcie_cpu_buff.clone();
        task.numa_cpu_buff = buffers.numa_cpu_buff.clone();
        task.compressor = buffers.compressors.get(i).cloned();

        // small partitions skip host staging entirely on the GDR-GPU2GPU
        // fast path, unless an explicit reduce-root set is in force
        if device != CPU_DEVICE_ID
            && rt.num_phy_node() > 1
            && rt.is_gdr()
            && rt.is_gdr_gpu2gpu()
            && *len <= rt.config().gdr_phase1_tensor_threshold
            && !rt.is_using_reduce()
        {
            task.replace_stages(vec![Stage::GDR_V2_PUSH_PULL]);
        }

        let first = task.current_stage().expect("non-empty stage list");
        tracing::trace!(
            name = %task.name,
            key = task.key,
            offset = task.offset,
            len = task.len,
            device = task.device,
            local_rank = rt.local_rank(),
            "enqueue",
        );
        rt.queue(first).add_task(Arc::new(task));
        accumulated += len;
    }
    debug_assert_eq!(accumulated, size);

    // keep a reference of the callback for asynchronous error handling
    if let Some(callback) = callback {
        rt.callbacks().record(buffers.key_list[0], callback);
    }
    tracing::trace!(name = %name, rank = rt.local_rank(), "enqueue finished");
    Ok(())
}

/// Submit the send side of a p2p transfer.
#[allow(clippy::too_many_arguments)]
pub fn enqueue_send(
    rt: &Arc<Runtime>,
    ctx: Arc<Context>,
    input: Arc<dyn Tensor>,
    ready_event: Option<Arc<dyn ReadyEvent>>,
    device: i32,
    priority: i32,
    version: i32,
    callback: Option<StatusCallback>,
) -> Result<(), Status> {
    if rt.config().disable_send_recv {
        return Err(Status::precondition_error("send/recv is disabled"));
    }
    enqueue_tensor(
        rt,
        ctx,
        Some(input),
        None,
        ready_event,
        device,
        priority,
        version,
        callback,
        stage::send_stages(),
        crate::tensor::ReduceOp::Sum,
    )
}

/// Submit the receive side of a p2p transfer.
#[allow(clippy::too_many_arguments)]
pub fn enqueue_recv(
    rt: &Arc<Runtime>,
    ctx: Arc<Context>,
    output: Arc<dyn Tensor>,
    ready_event: Option<Arc<dyn ReadyEvent>>,
    device: i32,
    priority: i32,
    version: i32,
    callback: Option<StatusCallback>,
) -> Result<(), Status> {
    if rt.config().disable_send_recv {
        return Err(Status::precondition_error("send/recv is disabled"));
    }
    enqueue_tensor(
        rt,
        ctx,
        None,
        Some(output),
        ready_event,
        device,
        priority,
        version,
        callback,
        stage::recv_stages(),
        crate::tensor::ReduceOp::Sum,
    )
}

// ----------------------------------------------------------------------
// all-to-all
// ----------------------------------------------------------------------

/// Inputs of one all-to-all submission. `send_begin` / `recv_begin` are
/// cumulative element offsets of length `num_ranks + 1`, first element zero.
pub struct AlltoallParams {
    pub input: Option<Arc<dyn Tensor>>,
    pub group_inputs: Vec<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub group_outputs: Vec<Arc<dyn Tensor>>,
    /// Receives the per-rank received sizes when the output size is unknown.
    pub size_output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub input_device: i32,
    pub output_device: i32,
    pub priority: i32,
    pub version: i32,
    pub callback: Option<StatusCallback>,
    pub send_begin: Vec<usize>,
    pub recv_begin: Vec<usize>,
    pub output_size_unknown: bool,
}

/// Counters of a submitted all-to-all, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlltoallSummary {
    pub num_ps_requests: usize,
    pub request_parts: usize,
    pub resp_parts: usize,
}

pub fn enqueue_alltoall(
    rt: &Arc<Runtime>,
    ctx: Arc<Context>,
    params: AlltoallParams,
) -> Result<AlltoallSummary, Status> {
    if rt.should_shutdown() {
        return Ok(AlltoallSummary { num_ps_requests: 0, request_parts: 0, resp_parts: 0 });
    }
    if !rt.is_joint() {
        return Err(Status::precondition_error("alltoall requires joint mode"));
    }
    let output_size_unknown = params.output_size_unknown;
    // pull-based mode requires known receive sizes
    let use_pull = rt.config().alltoall_use_pull && !output_size_unknown;
    let num_ranks = params.send_begin.len().saturating_sub(1);
    if num_ranks == 0 || params.recv_begin.len() != num_ranks + 1 {
        return Err(Status::invalid_argument("malformed begin offset lists"));
    }
    for begin in [&params.send_begin, &params.recv_begin] {
        if begin[0] != 0 || begin.windows(2).any(|w| w[1] < w[0]) {
            return Err(Status::invalid_argument(
                "begin offsets must start at zero and be non-decreasing",
            ));
        }
    }
    let reference = params
        .input
        .as_ref()
        .or(params.group_inputs.first())
        .ok_or_else(|| Status::invalid_argument("alltoall without input"))?;
    let dtype = reference.dtype();
    let unit_size = dtype.size();
    let my_rank = rt.rank() as usize;
    let recv_on_gpu = params.output_device != CPU_DEVICE_ID;

    ctx.op_count
        .store(rt.telemetry().record_start(&ctx.base_name), std::sync::atomic::Ordering::Relaxed);
    ctx.step_cnt.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    // request offsets follow the pulled (recv) side in pull mode
    let request_begin = if use_pull { &params.recv_begin } else { &params.send_begin };
    let resp_begin = if use_pull { &params.send_begin } else { &params.recv_begin };

    let request_q = stage::alltoall_request_stages(use_pull);
    let response_q = stage::alltoall_response_stages(rt, use_pull, output_size_unknown);

    let mut num_ps_requests = 0usize;
    let mut resp_total_partnum = if output_size_unknown { 1 } else { 0 };
    let mut request_size_list = Vec::with_capacity(num_ranks);
    let mut resp_size_list = Vec::with_capacity(num_ranks);
    let mut request_offsets = vec![0usize];
    let mut resp_offsets = vec![0usize];
    for i in 0..num_ranks {
        let request_size = unit_size * (request_begin[i + 1] - request_begin[i]);
        request_size_list.push(request_size);
        request_offsets.push(request_begin[i + 1] * unit_size);
        if i != my_rank && (output_size_unknown || request_size != 0) {
            num_ps_requests += 1;
        }
        let resp_size = unit_size * (resp_begin[i + 1] - resp_begin[i]);
        resp_size_list.push(resp_size);
        resp_offsets.push(resp_begin[i + 1] * unit_size);
        if !output_size_unknown && resp_size != 0 {
            resp_total_partnum += 1;
        }
    }
    let request_total_partnum =
        if !output_size_unknown && num_ps_requests == 0 { 0 } else { 1 };
    let total_partnum = request_total_partnum + resp_total_partnum;

    init_alltoall(
        rt,
        &ctx,
        &request_size_list,
        &resp_size_list,
        dtype,
        recv_on_gpu,
        use_pull,
    )?;
    let buffers = ctx.buffers()?;
    debug_assert_eq!(buffers.key_list.len(), num_ranks * 2);
    let request_keys: Vec<u64> = buffers.key_list[..num_ranks].to_vec();
    let resp_keys: Vec<u64> = buffers.key_list[num_ranks..].to_vec();
    let request_buffs = buffers.cpu_buff_list[..num_ranks].to_vec();
    let resp_buffs = buffers.cpu_buff_list[num_ranks..].to_vec();

    let completion = Completion::new(total_partnum.max(1) as u32, params.callback.clone());
    let request_counter = Arc::new(AtomicI32::new(num_ps_requests as i32));

    if request_total_partnum > 0 {
        let ext = GroupExt {
            offset_list: request_offsets.clone(),
            key_list: request_keys.clone(),
            request_counter: Some(request_counter.clone()),
            output_device: params.output_device,
            output_size_unknown,
            group_tensors: params.group_inputs.clone(),
            group_outputs: params.group_outputs.clone(),
            cpu_buff_list: request_buffs,
            expected_peers: num_ranks as i32,
            ..Default::default()
        };
        let mut task = Task::new(
            format!("{}_request", ctx.base_name),
            ctx.clone(),
            request_q.clone(),
            completion.clone(),
            TaskKind::AllToAll(Box::new(ext)),
        );
        task.key = request_keys[0];
        task.tensor = params.input.clone();
        task.output = params.output.clone();
        task.ready_event = params.ready_event.clone();
        task.priority = params.priority;
        task.version = params.version;
        task.device = params.input_device;
        task.total_partnum = total_partnum as u32;
        rt.queue(request_q[0]).add_task(Arc::new(task));
    }

    if total_partnum == 0 {
        completion.complete_now();
        return Ok(AlltoallSummary { num_ps_requests, request_parts: 0, resp_parts: 0 });
    }

    if resp_total_partnum > 0 {
        // keep a reference of the callback for asynchronous error handling
        if let Some(callback) = params.callback.clone() {
            rt.callbacks().record(buffers.key_list[0], callback);
        }

        let base_ext = || GroupExt {
            offset_list: resp_offsets.clone(),
            key_list: resp_keys.clone(),
            request_counter: Some(request_counter.clone()),
            aux_output: params.size_output.clone(),
            output_device: params.output_device,
            output_size_unknown,
            group_tensors: params.group_inputs.clone(),
            group_outputs: params.group_outputs.clone(),
            cpu_buff_list: resp_buffs.clone(),
            expected_peers: num_ranks as i32,
            ..Default::default()
        };
        let fill = |task: &mut Task| {
            task.tensor = params.input.clone();
            task.output = params.output.clone();
            task.ready_event = params.ready_event.clone();
            task.priority = params.priority;
            task.version = params.version;
            task.device = params.input_device;
            task.total_partnum = total_partnum as u32;
        };

        if output_size_unknown {
            // one group task waits for the whole set of incoming payloads
            let mut task = Task::new(
                format!("{}_resp", ctx.base_name),
                ctx.clone(),
                response_q.clone(),
                completion.clone(),
                TaskKind::AllToAll(Box::new(base_ext())),
            );
            fill(&mut task);
            task.key = keys::alltoall_tensor_id(resp_keys[0]);
            rt.queue(response_q[0]).add_task(Arc::new(task));
        } else {
            for i in 0..num_ranks {
                let resp_size = resp_size_list[i];
                if resp_size == 0 {
                    continue;
                }
                let mut task = Task::new(
                    format!("{}_request_{i}_resp_{my_rank}", ctx.base_name),
                    ctx.clone(),
                    response_q.clone(),
                    completion.clone(),
                    TaskKind::AllToAll(Box::new(base_ext())),
                );
                fill(&mut task);
                task.key = resp_keys[i];
                task.len = resp_size;
                task.offset = if params.group_inputs.is_empty() { resp_offsets[i] } else { 0 };
                if i == my_rank {
                    // the self slot never touches the fabric: remember where
                    // the input lives and pre-open the rendezvous
                    task.offset = request_begin[i] * unit_size;
                    let table = if use_pull {
                        rt.tables().p2p_pull_response.as_ref()
                    } else {
                        rt.tables().p2p_copy.as_ref()
                    };
                    if let Some(table) = table {
                        table.add_ready_count(task.key);
                    }
                }
                rt.queue(response_q[0]).add_task(Arc::new(task));
            }
        }
    }

    tracing::trace!(
        name = %ctx.name,
        rank = rt.rank(),
        request_parts = request_total_partnum,
        resp_parts = resp_total_partnum,
        num_ps_requests,
        "enqueue alltoall finished",
    );
    Ok(AlltoallSummary {
        num_ps_requests,
        request_parts: request_total_partnum,
        resp_parts: resp_total_partnum,
    })
}

/// Validate splits, resolve the session name and compute the cumulative
/// begin offsets (element units) for one all-to-all call.
pub struct PreparedAlltoall {
    pub session_name: String,
    pub send_begin: Vec<usize>,
    pub recv_begin: Vec<usize>,
    pub dim0_out: i64,
}

pub fn prepare_alltoall(
    rt: &Runtime,
    name: &str,
    shape: &TensorShape,
    split: &[i64],
    recv_split: &[i64],
) -> Result<PreparedAlltoall, Status> {
    let stride = shape.row_stride();
    let mut send_begin = vec![0usize];
    let mut dim0_in: i64 = 0;
    for (i, s) in split.iter().enumerate() {
        if *s < 0 {
            return Err(Status::invalid_argument(format!(
                "{name}: invalid split[{i}]={s}"
            )));
        }
        dim0_in += s;
        send_begin.push(send_begin[i] + (*s * stride) as usize);
    }
    if shape.ndim() > 0 && dim0_in != shape.dim(0) {
        return Err(Status::invalid_argument(format!(
            "{name}: invalid split. tensor.shape[0]={} split={split:?}",
            shape.dim(0)
        )));
    }
    let mut recv_begin = vec![0usize];
    let mut dim0_out: i64 = 0;
    for (i, s) in recv_split.iter().enumerate() {
        if *s < 0 {
            return Err(Status::invalid_argument(format!(
                "{name}: invalid recv_split[{i}]={s}"
            )));
        }
        dim0_out += s;
        recv_begin.push(recv_begin[i] + (*s * stride) as usize);
    }

    // declare every session up front so resumed runs reproduce the keys
    for session in 0..rt.session_size() {
        rt.contexts().declare(name, OpType::AllToAll, None, Some(session))?;
    }
    let session_id = rt.session_id(name);
    Ok(PreparedAlltoall {
        session_name: format!("session_{session_id}_{name}"),
        send_begin,
        recv_begin,
        dim0_out,
    })
}

// ----------------------------------------------------------------------
// all-gather
// ----------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn enqueue_allgather(
    rt: &Arc<Runtime>,
    ctx: Arc<Context>,
    input: Arc<dyn Tensor>,
    output: Arc<dyn Tensor>,
    ready_event: Option<Arc<dyn ReadyEvent>>,
    device: i32,
    priority: i32,
    version: i32,
    shape_list: Vec<i64>,
    callback: Option<StatusCallback>,
) -> Result<(), Status> {
    if rt.should_shutdown() {
        return Ok(());
    }
    if !rt.is_joint() {
        return Err(Status::precondition_error("allgather requires joint mode"));
    }
    let dtype = input.dtype();
    init_allgather(rt, &ctx, input.size(), output.size(), dtype)?;
    let buffers = ctx.buffers()?;

    let num_phy_node = rt.num_phy_node();
    let phy_id = rt.phy_node_id();
    if buffers.key_list.len() != num_phy_node as usize {
        return Err(Status::precondition_error(format!(
            "{}: key list does not match the physical node count",
            ctx.name
        )));
    }

    let req_q = stage::allgather_request_stages(rt);
    let resp_q = stage::allgather_response_stages(rt);
    let total_partnum: u32 = if rt.is_distributed() && (rt.local_rank() == 0 || rt.is_root_device())
    {
        num_phy_node as u32
    } else {
        1
    };

    // byte offsets per rank for ragged gathers; empty means equal slices
    let mut offset_list = Vec::new();
    if !shape_list.is_empty() {
        let remaining: i64 = input.shape().row_stride();
        let unit = dtype.size();
        let rank_num = rt.size() as usize;
        offset_list.resize(rank_num + 1, 0usize);
        for i in 1..=rank_num {
            offset_list[i] =
                offset_list[i - 1] + (shape_list[i - 1] * remaining) as usize * unit;
        }
    }

    ctx.op_count
        .store(rt.telemetry().record_start(&ctx.base_name), std::sync::atomic::Ordering::Relaxed);
    ctx.step_cnt.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let completion = Completion::new(total_partnum, callback);
    let make_ext = || GroupExt {
        offset_list: offset_list.clone(),
        key_list: buffers.key_list.clone(),
        shape_list: shape_list.clone(),
        request_counter: Some(Arc::new(AtomicI32::new(num_phy_node - 1))),
        wlr_counter: Some(Arc::new(AtomicI32::new(num_phy_node - 1))),
        output_device: device,
        expected_peers: num_phy_node,
        ..Default::default()
    };
    let fill = |task: &mut Task| {
        task.tensor = Some(input.clone());
        task.output = Some(output.clone());
        task.ready_event = ready_event.clone();
        task.priority = priority;
        task.version = version;
        task.device = device;
        task.cpu_buff = buffers.cpu_buff.clone();
        task.total_partnum = total_partnum;
    };

    if !req_q.is_empty() {
        let mut task = Task::new(
            ctx.name.clone(),
            ctx.clone(),
            req_q.clone(),
            completion.clone(),
            TaskKind::AllGather(Box::new(make_ext())),
        );
        fill(&mut task);
        task.key = buffers.key_list[phy_id as usize];
        task.len = input.size();
        rt.queue(req_q[0]).add_task(Arc::new(task));
    }
    if !resp_q.is_empty() {
        for i in 0..num_phy_node {
            if i == phy_id {
                continue;
            }
            let mut task = Task::new(
                ctx.name.clone(),
                ctx.clone(),
                resp_q.clone(),
                completion.clone(),
                TaskKind::AllGather(Box::new(make_ext())),
            );
            fill(&mut task);
            task.key = buffers.key_list[i as usize];
            task.len = input.size();
            rt.queue(resp_q[0]).add_task(Arc::new(task));
        }
    }

    tracing::trace!(name = %ctx.name, rank = rt.local_rank(), "enqueue allgather finished");
    Ok(())
}
