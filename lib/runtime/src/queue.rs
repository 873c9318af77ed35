// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stage scheduled queues.
//!
//! Each active stage owns one bounded FIFO with exactly one consumer thread.
//! The scheduling discipline is peek-and-conditionally-deliver: a task is
//! handed out only when its stage precondition (the *gate*) holds — COPYD2H
//! withholds until the ready event fired, PUSH until all local peers
//! contributed, BROADCAST until the local root finished. Stages never
//! busy-wait on external tables; the queue re-polls its gate on a short
//! condvar timeout and parks the thread in between.
//!
//! Stages of the push-pull family deliver in priority order among
//! concurrently-ready tasks; PUSH can additionally be credit-bounded so only
//! a window of bytes is in flight toward the fabric.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::stage::Stage;
use crate::task::Task;

/// How long a consumer parks before re-polling gates that external events
/// cannot notify through this queue's condvar.
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Process-wide shutdown latch. Stage threads observe it between deliveries;
/// `wait_timeout` backs the public bounded wait.
#[derive(Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Wait until shutdown or `timeout`; true when shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut guard = self.mutex.lock();
        if self.is_set() {
            return true;
        }
        self.cv.wait_for(&mut guard, timeout);
        self.is_set()
    }
}

/// Stage precondition checked against each queued task before delivery.
pub type Gate = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

pub fn open_gate() -> Gate {
    Arc::new(|_| true)
}

struct QueueInner {
    tasks: Vec<Arc<Task>>,
    credits: i64,
}

pub struct ScheduledQueue {
    stage: Stage,
    prioritized: bool,
    /// Byte credit, or `None` for unbounded stages.
    credit_limit: Option<i64>,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    shutdown: Arc<ShutdownSignal>,
    gate: Gate,
}

impl ScheduledQueue {
    pub fn new(stage: Stage, shutdown: Arc<ShutdownSignal>, credit_limit: Option<i64>, gate: Gate) -> Self {
        let prioritized = matches!(
            stage,
            Stage::REDUCE
                | Stage::COPYD2H
                | Stage::PUSH
                | Stage::PULL
                | Stage::COPYH2D
                | Stage::BROADCAST
        );
        Self {
            stage,
            prioritized,
            credit_limit,
            inner: Mutex::new(QueueInner { tasks: Vec::new(), credits: credit_limit.unwrap_or(0) }),
            cv: Condvar::new(),
            shutdown,
            gate,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn add_task(&self, task: Arc<Task>) {
        let mut inner = self.inner.lock();
        inner.tasks.push(task);
        self.cv.notify_all();
    }

    /// Deliverable tasks honor the gate and, on credit-bounded stages, fit in
    /// the remaining credit.
    fn pick(&self, inner: &QueueInner) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, task) in inner.tasks.iter().enumerate() {
            if self.credit_limit.is_some() && inner.credits < task.len as i64 {
                continue;
            }
            if !(self.gate)(task) {
                continue;
            }
            match best {
                Some(b) if !self.prioritized || inner.tasks[b].priority >= task.priority => {}
                _ => best = Some(idx),
            }
            if !self.prioritized {
                break;
            }
        }
        best
    }

    /// Blocking dequeue; `None` means shutdown.
    pub fn get_task(&self) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();
        loop {
            if self.shutdown.is_set() {
                return None;
            }
            if let Some(idx) = self.pick(&inner) {
                let task = inner.tasks.remove(idx);
                if self.credit_limit.is_some() {
                    inner.credits -= task.len as i64;
                }
                tracing::trace!(stage = %self.stage, name = %task.name, key = task.key, "deliver");
                return Some(task);
            }
            self.cv.wait_for(&mut inner, GATE_POLL_INTERVAL);
        }
    }

    /// Non-blocking variant for loops that interleave several queues.
    pub fn try_get_task(&self) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();
        let idx = self.pick(&inner)?;
        let task = inner.tasks.remove(idx);
        if self.credit_limit.is_some() {
            inner.credits -= task.len as i64;
        }
        Some(task)
    }

    /// Return the credit consumed by a delivered task once its stage action
    /// finished.
    pub fn report_finish(&self, len: usize) {
        if self.credit_limit.is_none() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.credits += len as i64;
        self.cv.notify_all();
    }

    /// Wake the consumer so it can observe shutdown.
    pub fn notify(&self) {
        let _inner = self.inner.lock();
        self.cv.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTable;
    use crate::keys::OpType;
    use crate::task::{Completion, TaskKind};

    fn make_task(name: &str, priority: i32, len: usize) -> Arc<Task> {
        let table = ContextTable::new(2);
        table.declare(name, OpType::PushPull, None, None).unwrap();
        let ctx = table.get(name).unwrap();
        let completion = Completion::new(1, None);
        let mut task = Task::new(
            name.to_string(),
            ctx,
            vec![Stage::PUSH],
            completion,
            TaskKind::PushPull,
        );
        task.priority = priority;
        task.len = len;
        Arc::new(task)
    }

    #[test]
    fn test_fifo_delivery() {
        let q = ScheduledQueue::new(Stage::SEND, ShutdownSignal::new(), None, open_gate());
        q.add_task(make_task("a", 0, 10));
        q.add_task(make_task("b", 5, 10));
        assert_eq!(q.get_task().unwrap().name, "a");
        assert_eq!(q.get_task().unwrap().name, "b");
    }

    #[test]
    fn test_priority_delivery() {
        let q = ScheduledQueue::new(Stage::PUSH, ShutdownSignal::new(), None, open_gate());
        q.add_task(make_task("low", -3, 10));
        q.add_task(make_task("high", 7, 10));
        q.add_task(make_task("mid", 1, 10));
        assert_eq!(q.get_task().unwrap().name, "high");
        assert_eq!(q.get_task().unwrap().name, "mid");
        assert_eq!(q.get_task().unwrap().name, "low");
    }

    #[test]
    fn test_gate_withholds_until_ready() {
        let ready = Arc::new(AtomicBool::new(false));
        let gate_ready = ready.clone();
        let gate: Gate = Arc::new(move |_| gate_ready.load(Ordering::SeqCst));
        let q = Arc::new(ScheduledQueue::new(
            Stage::COPYD2H,
            ShutdownSignal::new(),
            None,
            gate,
        ));
        q.add_task(make_task("waiting", 0, 10));
        assert!(q.try_get_task().is_none());

        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.get_task());
        std::thread::sleep(Duration::from_millis(20));
        ready.store(true, Ordering::SeqCst);
        let task = handle.join().unwrap().unwrap();
        assert_eq!(task.name, "waiting");
    }

    #[test]
    fn test_credit_bounds_in_flight_bytes() {
        let q = ScheduledQueue::new(Stage::PUSH, ShutdownSignal::new(), Some(100), open_gate());
        q.add_task(make_task("first", 0, 80));
        q.add_task(make_task("second", 0, 80));
        assert!(q.try_get_task().is_some());
        // only 20 credits left, second must wait
        assert!(q.try_get_task().is_none());
        q.report_finish(80);
        assert!(q.try_get_task().is_some());
    }

    #[test]
    fn test_smaller_task_overtakes_when_credit_is_low() {
        let q = ScheduledQueue::new(Stage::PUSH, ShutdownSignal::new(), Some(100), open_gate());
        q.add_task(make_task("big", 9, 90));
        q.add_task(make_task("small", 1, 40));
        assert_eq!(q.try_get_task().unwrap().name, "big");
        // small does not fit into the remaining 10 bytes of credit
        assert!(q.try_get_task().is_none());
        q.report_finish(90);
        assert_eq!(q.try_get_task().unwrap().name, "small");
        q.add_task(make_task("big2", 9, 90));
        q.add_task(make_task("small2", 1, 5));
        // big2 exceeds the remaining credit, the lower-priority small2 goes
        assert_eq!(q.try_get_task().unwrap().name, "small2");
    }

    #[test]
    fn test_shutdown_wakes_blocked_consumers() {
        let shutdown = ShutdownSignal::new();
        let queues: Vec<Arc<ScheduledQueue>> = [Stage::PUSH, Stage::PULL, Stage::SEND]
            .iter()
            .map(|s| Arc::new(ScheduledQueue::new(*s, shutdown.clone(), None, open_gate())))
            .collect();
        let handles: Vec<_> = queues
            .iter()
            .map(|q| {
                let q = q.clone();
                std::thread::spawn(move || q.get_task())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        for h in handles {
            assert!(h.join().unwrap().is_none());
        }
        assert!(shutdown.wait_timeout(Duration::from_secs(1)));
    }
}
