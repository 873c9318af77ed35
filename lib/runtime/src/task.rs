// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The unit of work carried between stage queues.
//!
//! A submission becomes one [`Task`] per partition. Partitions share a
//! [`Completion`]: an atomic counter plus the submission callback, taken out
//! exactly once when the last partition drains its pipeline. The task borrows
//! the caller's tensors and the context's staging buffers; it owns nothing
//! but its remaining stage list.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::Status;
use crate::compress::{Compressed, Compressor};
use crate::context::Context;
use crate::gpu::ReadyEvent;
use crate::shm::SharedBuffer;
use crate::stage::Stage;
use crate::tensor::{ReduceOp, Tensor};

/// Called with the terminal status of a submission.
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// Shared completion state of all partitions of one submission.
pub struct Completion {
    total: u32,
    finished: AtomicU32,
    callback: Mutex<Option<StatusCallback>>,
    first_error: Mutex<Option<Status>>,
    started_at: i64,
}

impl Completion {
    pub fn new(total: u32, callback: Option<StatusCallback>) -> Arc<Self> {
        Arc::new(Self {
            total,
            finished: AtomicU32::new(0),
            callback: Mutex::new(callback),
            first_error: Mutex::new(None),
            started_at: crate::telemetry::now_micros(),
        })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Submission start in the trace timebase.
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Fire the callback immediately, for submissions with nothing to do.
    pub fn complete_now(&self) {
        if let Some(callback) = self.callback.lock().take() {
            let status = self.first_error.lock().clone().unwrap_or_else(Status::ok);
            callback(status);
        }
    }

    /// Remember the first non-OK status observed by any partition.
    pub fn record_error(&self, status: Status) {
        debug_assert!(!status.is_ok());
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(status);
        }
    }

    /// Count one partition as fully drained. The callback fires on the call
    /// that completes the set, with OK or the first recorded error; taking it
    /// out of the mutex makes a second fire impossible.
    pub fn part_done(&self) -> bool {
        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(done <= self.total);
        if done < self.total {
            return false;
        }
        if let Some(callback) = self.callback.lock().take() {
            let status = self.first_error.lock().clone().unwrap_or_else(Status::ok);
            callback(status);
        }
        true
    }
}

/// Extension fields for the group operations (all-to-all, all-gather).
#[derive(Default)]
pub struct GroupExt {
    /// Cumulative byte offsets per rank, length `num_ranks + 1`.
    pub offset_list: Vec<usize>,
    /// Routing keys this task may touch (one per rank / physical node).
    pub key_list: Vec<u64>,
    /// Axis-0 sizes per rank for ragged all-gather.
    pub shape_list: Vec<i64>,
    pub worker_local_root_list: Vec<i32>,
    /// Outstanding fabric requests of the request task.
    pub request_counter: Option<Arc<AtomicI32>>,
    /// Outstanding worker-local-root pulls of an all-gather.
    pub wlr_counter: Option<Arc<AtomicI32>>,
    /// Receives the per-rank sizes when the output size is unknown.
    pub aux_output: Option<Arc<dyn Tensor>>,
    pub output_device: i32,
    pub output_size_unknown: bool,
    pub group_tensors: Vec<Arc<dyn Tensor>>,
    pub group_outputs: Vec<Arc<dyn Tensor>>,
    /// Per-rank staging, first half request side, second half response side.
    pub cpu_buff_list: Vec<Option<Arc<SharedBuffer>>>,
    /// Peers a group rendezvous waits for (ranks, or physical nodes).
    pub expected_peers: i32,
}

/// Which operation family a task belongs to, with the group extension where
/// one applies.
pub enum TaskKind {
    PushPull,
    P2p,
    AllToAll(Box<GroupExt>),
    AllGather(Box<GroupExt>),
}

pub struct Task {
    pub name: String,
    pub key: u64,
    pub context: Arc<Context>,
    pub tensor: Option<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub priority: i32,
    pub version: i32,
    pub device: i32,
    pub reduce_op: ReduceOp,
    /// Byte offset of this partition within the tensor.
    pub offset: usize,
    /// Byte length of this partition.
    pub len: usize,
    pub cpu_buff: Option<Arc<SharedBuffer>>,
    pub pcie_cpu_buff: Vec<Arc<SharedBuffer>>,
    pub numa_cpu_buff: Vec<Arc<SharedBuffer>>,
    pub completion: Arc<Completion>,
    /// Remote contributions still outstanding on the GDR wait path.
    pub push_pull_counter: Arc<AtomicI32>,
    pub total_partnum: u32,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub compressed: Mutex<Option<Compressed>>,
    pub kind: TaskKind,
    queue_list: Mutex<Vec<Stage>>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        context: Arc<Context>,
        queue_list: Vec<Stage>,
        completion: Arc<Completion>,
        kind: TaskKind,
    ) -> Self {
        Self {
            name,
            key: 0,
            context,
            tensor: None,
            output: None,
            ready_event: None,
            priority: 0,
            version: 0,
            device: crate::tensor::CPU_DEVICE_ID,
            reduce_op: ReduceOp::default(),
            offset: 0,
            len: 0,
            cpu_buff: None,
            pcie_cpu_buff: Vec::new(),
            numa_cpu_buff: Vec::new(),
            completion,
            push_pull_counter: Arc::new(AtomicI32::new(0)),
            total_partnum: 0,
            compressor: None,
            compressed: Mutex::new(None),
            kind,
            queue_list: Mutex::new(queue_list),
        }
    }

    /// The stage whose queue currently holds (or will next hold) this task.
    pub fn current_stage(&self) -> Option<Stage> {
        self.queue_list.lock().first().copied()
    }

    /// Pop the finished stage; returns the next one, if any.
    pub fn advance(&self) -> Option<Stage> {
        let mut list = self.queue_list.lock();
        if !list.is_empty() {
            list.remove(0);
        }
        list.first().copied()
    }

    /// Replace the remaining pipeline, for fast-path rewrites at enqueue time.
    pub fn replace_stages(&self, stages: Vec<Stage>) {
        *self.queue_list.lock() = stages;
    }

    pub fn remaining_stages(&self) -> Vec<Stage> {
        self.queue_list.lock().clone()
    }

    pub fn group(&self) -> Option<&GroupExt> {
        match &self.kind {
            TaskKind::AllToAll(ext) | TaskKind::AllGather(ext) => Some(ext),
            _ => None,
        }
    }

    /// Input handle for the `index`-th rank slot of a grouped submission, or
    /// the flat input.
    pub fn group_tensor(&self, index: usize) -> Option<&Arc<dyn Tensor>> {
        match self.group() {
            Some(ext) if !ext.group_tensors.is_empty() => ext.group_tensors.get(index),
            _ => self.tensor.as_ref(),
        }
    }

    pub fn group_output(&self, index: usize) -> Option<&Arc<dyn Tensor>> {
        match self.group() {
            Some(ext) if !ext.group_outputs.is_empty() => ext.group_outputs.get(index),
            _ => self.output.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_completion_fires_once_after_all_parts() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let completion = Completion::new(
            3,
            Some(Arc::new(move |status: Status| {
                assert!(status.is_ok());
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(!completion.part_done());
        assert!(!completion.part_done());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(completion.part_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_reports_first_error() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let completion = Completion::new(
            2,
            Some(Arc::new(move |status: Status| {
                *seen2.lock() = Some(status);
            })),
        );
        completion.record_error(Status::data_loss("partition 0 lost"));
        completion.record_error(Status::aborted("partition 1 aborted"));
        completion.part_done();
        completion.part_done();
        let status = seen.lock().clone().unwrap();
        assert_eq!(status.kind(), crate::StatusKind::DataLoss);
        assert_eq!(status.reason(), "partition 0 lost");
    }
}
