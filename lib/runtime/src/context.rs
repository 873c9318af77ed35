// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The context table: one [`Context`] per declared tensor name.
//!
//! Declaration assigns a small monotonic key within the operation-type
//! namespace and remembers insertion order, so a suspend/resume cycle can
//! replay declarations and reproduce every key. Initialization (buffer
//! allocation, shared-memory attachment, fabric registration) happens lazily
//! on first enqueue, at most once per context, guarded by a `OnceCell`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::Status;
use crate::compress::Compressor;
use crate::config::TraceConfig;
use crate::keys::OpType;
use crate::shm::SharedBuffer;
use crate::stage::Stage;
use crate::telemetry::{CommTime, TraceRecord, TraceState};

/// Buffers and keys of an initialized context. Immutable once set.
#[derive(Default)]
pub struct ContextBuffers {
    /// One routing key per partition (push-pull), per rank pair (all-to-all)
    /// or per physical node (all-gather).
    pub key_list: Vec<u64>,
    /// Page-aligned staging copy, shared-memory backed where local peers
    /// need it.
    pub cpu_buff: Option<Arc<SharedBuffer>>,
    /// Per-PCIe-switch staging for cross-switch merging.
    pub pcie_cpu_buff: Vec<Arc<SharedBuffer>>,
    /// Per-NUMA-node staging for the CPU all-reduce path.
    pub numa_cpu_buff: Vec<Arc<SharedBuffer>>,
    /// Per-rank staging for the group operations; request half then response
    /// half.
    pub cpu_buff_list: Vec<Option<Arc<SharedBuffer>>>,
    /// All-to-all allocation ceiling per rank.
    pub bounds_for_ranks: Vec<u32>,
    /// One compressor per partition when compression is registered.
    pub compressors: Vec<Arc<dyn Compressor>>,
}

pub struct Context {
    /// Possibly session-prefixed name, unique in the table.
    pub name: String,
    /// Name as the framework declared it.
    pub base_name: String,
    pub declared_key: u32,
    pub op_type: OpType,
    /// Sending rank for p2p contexts, -1 otherwise.
    pub sender: i32,
    /// Receiving rank for p2p contexts, -1 otherwise.
    pub receiver: i32,

    buffers: OnceCell<ContextBuffers>,

    pub op_count: AtomicU64,
    pub step_cnt: AtomicI32,
    pub profile_flag: AtomicBool,
    pub local_rank: AtomicI32,
    pub worker_local_root: AtomicI32,

    comm_time: Mutex<Vec<CommTime>>,
    part_comm_time: Mutex<HashMap<u64, HashMap<Stage, Vec<CommTime>>>>,
    kwargs: Mutex<HashMap<String, String>>,
}

impl Context {
    fn new(name: String, base_name: String, declared_key: u32, op_type: OpType) -> Self {
        Self {
            name,
            base_name,
            declared_key,
            op_type,
            sender: -1,
            receiver: -1,
            buffers: OnceCell::new(),
            op_count: AtomicU64::new(0),
            step_cnt: AtomicI32::new(0),
            profile_flag: AtomicBool::new(false),
            local_rank: AtomicI32::new(0),
            worker_local_root: AtomicI32::new(0),
            comm_time: Mutex::new(Vec::new()),
            part_comm_time: Mutex::new(HashMap::new()),
            kwargs: Mutex::new(HashMap::new()),
        }
    }

    pub fn initialized(&self) -> bool {
        self.buffers.get().is_some()
    }

    /// Run `init` at most once, even under concurrent first enqueues.
    pub fn init_once(
        &self,
        init: impl FnOnce() -> Result<ContextBuffers, Status>,
    ) -> Result<&ContextBuffers, Status> {
        self.buffers.get_or_try_init(init)
    }

    /// Initialized buffers; a precondition error before initialization.
    pub fn buffers(&self) -> Result<&ContextBuffers, Status> {
        self.buffers.get().ok_or_else(|| {
            Status::precondition_error(format!("{} is not initialized", self.name))
        })
    }

    pub fn key_list(&self) -> &[u64] {
        self.buffers.get().map(|b| b.key_list.as_slice()).unwrap_or(&[])
    }

    pub fn kwargs(&self) -> HashMap<String, String> {
        self.kwargs.lock().clone()
    }

    pub fn set_kwargs(&self, kwargs: HashMap<String, String>) {
        *self.kwargs.lock() = kwargs;
    }

    pub fn clear_kwargs(&self) {
        self.kwargs.lock().clear();
    }

    /// Append a whole-operation timing record.
    pub fn push_comm_time(&self, record: CommTime) {
        self.comm_time.lock().push(record);
    }

    /// Append a per-partition, per-stage timing record.
    pub fn push_part_comm_time(&self, key: u64, stage: Stage, record: CommTime) {
        self.part_comm_time
            .lock()
            .entry(key)
            .or_default()
            .entry(stage)
            .or_default()
            .push(record);
    }

    /// Drain all timing records for trace output.
    pub fn drain_trace(&self) -> TraceRecord {
        let mut records: Vec<CommTime> = self.comm_time.lock().drain(..).collect();
        for (_, by_stage) in self.part_comm_time.lock().drain() {
            for (_, mut recs) in by_stage {
                records.append(&mut recs);
            }
        }
        TraceRecord { tensor_name: self.name.clone(), records }
    }

    /// Flip the profile flag at the trace window edges. Returns true when
    /// this tensor just left the window and it was the last one, i.e. the
    /// caller should emit the trace file.
    pub fn update_profile(&self, trace: &TraceConfig, state: &TraceState) -> bool {
        if !trace.enabled {
            self.profile_flag.store(false, Ordering::Relaxed);
            return false;
        }
        assert!(
            trace.start_step >= 1 && trace.end_step > trace.start_step,
            "trace start step must be >= 1 and end step must be larger"
        );
        let step = self.step_cnt.load(Ordering::Relaxed);
        if step == trace.start_step - 1 {
            self.profile_flag.store(true, Ordering::Relaxed);
            state.register_output(&self.name);
        } else if step == trace.end_step {
            self.profile_flag.store(false, Ordering::Relaxed);
            return state.all_arrived(&self.name);
        }
        false
    }

    pub fn profiling(&self) -> bool {
        self.profile_flag.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct TableInner {
    by_name: HashMap<String, Arc<Context>>,
    /// Prefixed names in declaration order, preserved across shutdown for
    /// deterministic re-declaration.
    declared_order: Vec<String>,
    next_keys: HashMap<OpType, u32>,
    used_keys: HashMap<OpType, HashSet<u32>>,
    /// Per (sender, receiver) pair key space.
    p2p_next_keys: HashMap<u64, u32>,
    session_ids: HashMap<String, u64>,
    completions: HashMap<String, u64>,
}

/// Process-wide registry mapping tensor name to context.
pub struct ContextTable {
    inner: Mutex<TableInner>,
    session_size: u32,
}

impl ContextTable {
    pub fn new(session_size: u32) -> Self {
        Self { inner: Mutex::new(TableInner::default()), session_size: session_size.max(1) }
    }

    /// Declare `name` under `op_type`, optionally with a caller-chosen key
    /// and an all-to-all session index. Re-declaring an existing name returns
    /// its original key.
    pub fn declare(
        &self,
        name: &str,
        op_type: OpType,
        provided_key: Option<u32>,
        session: Option<u32>,
    ) -> Result<u32, Status> {
        let tensor_name = match session {
            Some(s) => format!("session_{s}_{name}"),
            None => name.to_string(),
        };
        let mut inner = self.inner.lock();
        if let Some(ctx) = inner.by_name.get(&tensor_name) {
            return Ok(ctx.declared_key);
        }
        if !inner.declared_order.iter().any(|n| n == &tensor_name) {
            inner.declared_order.push(tensor_name.clone());
        }
        inner.used_keys.entry(op_type).or_default();
        let key = match provided_key {
            Some(key) => {
                if inner.used_keys[&op_type].contains(&key) {
                    return Err(Status::invalid_argument(format!(
                        "key {key} already declared in the {} namespace",
                        op_type.name()
                    )));
                }
                key
            }
            None => loop {
                let next = inner.next_keys.entry(op_type).or_insert(0);
                let candidate = *next;
                *next += 1;
                if !inner.used_keys[&op_type].contains(&candidate) {
                    break candidate;
                }
            },
        };
        inner.used_keys.get_mut(&op_type).unwrap().insert(key);
        let ctx = Arc::new(Context::new(tensor_name.clone(), name.to_string(), key, op_type));
        inner.by_name.insert(tensor_name, ctx);
        tracing::debug!(name, key, op = op_type.name(), ?session, "declared tensor");
        Ok(key)
    }

    /// Declare a p2p tensor; the key space is per (sender, receiver) pair.
    pub fn declare_p2p(&self, name: &str, sender: i32, receiver: i32) -> Result<u32, Status> {
        if sender == receiver {
            return Err(Status::invalid_argument(format!(
                "{name}: self send/recv is not supported (rank {sender})"
            )));
        }
        let mut inner = self.inner.lock();
        if let Some(ctx) = inner.by_name.get(name) {
            return Ok(ctx.declared_key);
        }
        if !inner.declared_order.iter().any(|n| n == name) {
            inner.declared_order.push(name.to_string());
        }
        let pair = ((sender as u64) << 16) | receiver as u64;
        let next = inner.p2p_next_keys.entry(pair).or_insert(0);
        let key = *next;
        *next += 1;
        let mut ctx = Context::new(name.to_string(), name.to_string(), key, OpType::P2p);
        ctx.sender = sender;
        ctx.receiver = receiver;
        inner.by_name.insert(name.to_string(), Arc::new(ctx));
        tracing::debug!(name, key, sender, receiver, "declared p2p tensor");
        Ok(key)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Context>, Status> {
        self.inner
            .lock()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Status::precondition_error(format!("{name} is not declared")))
    }

    /// Replay remembered declarations after a resume, in insertion order, so
    /// every key is reproduced identically.
    pub fn re_declare(&self) -> Result<(), Status> {
        let names = self.inner.lock().declared_order.clone();
        for name in names {
            tracing::debug!(name, "redeclare tensor");
            self.declare(&name, OpType::PushPull, None, None)?;
        }
        Ok(())
    }

    /// Attach compressor configuration; applied at the next initialization.
    pub fn register_compressor(
        &self,
        name: &str,
        kwargs: HashMap<String, String>,
    ) -> Result<(), Status> {
        let ctx = self.get(name)?;
        ctx.set_kwargs(kwargs);
        Ok(())
    }

    /// Next rolling session index for an all-to-all name.
    pub fn next_session(&self, name: &str) -> u64 {
        let mut inner = self.inner.lock();
        let counter = inner.session_ids.entry(name.to_string()).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    pub fn mark_done(&self, name: &str) {
        let mut inner = self.inner.lock();
        *inner.completions.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Submissions started but not yet marked done for `name`.
    pub fn outstanding(&self, name: &str) -> u64 {
        let inner = self.inner.lock();
        let started = inner.session_ids.get(name).copied().unwrap_or(0);
        let done = inner.completions.get(name).copied().unwrap_or(0);
        started.saturating_sub(done)
    }

    pub fn session_size(&self) -> u32 {
        self.session_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contexts(&self) -> Vec<Arc<Context>> {
        self.inner.lock().by_name.values().cloned().collect()
    }

    /// Declaration order so far; survives suspend through the builder.
    pub fn declared_names(&self) -> Vec<String> {
        self.inner.lock().declared_order.clone()
    }

    /// Seed the declaration order, for resume in a fresh runtime.
    pub fn restore_declared(&self, names: Vec<String>) {
        if !names.is_empty() {
            self.inner.lock().declared_order = names;
        }
    }

    /// Drop all contexts and key assignments but keep the declaration order,
    /// which re-declaration after resume depends on.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_name.clear();
        inner.next_keys.clear();
        inner.used_keys.clear();
        inner.p2p_next_keys.clear();
    }
}
