// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Operation telemetry and communication traces.
//!
//! Two consumers: a rolling latency summary per tensor (mean/stdev queried by
//! the binding layer) and, when tracing is enabled for a step window, raw
//! per-stage timing records emitted as a Chrome-tracing JSON file at
//! `<trace_dir>/<rank>/comm.json`.

use std::collections::HashMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::json;

use crate::stage::Stage;

/// Microseconds since the epoch, the trace timebase.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// One timed interval: a whole operation (`stage == None`) or one stage of
/// one partition.
#[derive(Debug, Clone)]
pub struct CommTime {
    pub start_t: i64,
    pub dur: i64,
    pub key: Option<u64>,
    pub stage: Option<Stage>,
}

impl CommTime {
    pub fn begin(key: Option<u64>, stage: Option<Stage>) -> Self {
        Self { start_t: now_micros(), dur: 0, key, stage }
    }

    pub fn end(&mut self) {
        self.dur = now_micros() - self.start_t;
    }
}

#[derive(Default)]
struct TensorStats {
    sum_us: f64,
    sum_sq_us: f64,
    count: u64,
    op_count: u64,
    started_at: Option<i64>,
}

/// Rolling per-tensor latency summary.
#[derive(Default)]
pub struct Telemetry {
    stats: Mutex<HashMap<String, TensorStats>>,
}

/// One row of the telemetry surface.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEntry {
    pub name: String,
    pub mean_us: f32,
    pub stdev_us: f32,
    pub count: i32,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a submission start; returns the per-tensor operation count.
    pub fn record_start(&self, name: &str) -> u64 {
        let mut stats = self.stats.lock();
        let entry = stats.entry(name.to_string()).or_default();
        entry.op_count += 1;
        entry.started_at = Some(now_micros());
        entry.op_count
    }

    /// Mark the matching completion and fold the latency into the summary.
    pub fn record_end(&self, name: &str) {
        let mut stats = self.stats.lock();
        if let Some(entry) = stats.get_mut(name) {
            if let Some(started) = entry.started_at.take() {
                let dur = (now_micros() - started) as f64;
                entry.sum_us += dur;
                entry.sum_sq_us += dur * dur;
                entry.count += 1;
            }
        }
    }

    pub fn size(&self) -> usize {
        self.stats.lock().len()
    }

    pub fn data(&self) -> Vec<TelemetryEntry> {
        let stats = self.stats.lock();
        let mut rows: Vec<TelemetryEntry> = stats
            .iter()
            .map(|(name, s)| {
                let count = s.count.max(1) as f64;
                let mean = s.sum_us / count;
                let var = (s.sum_sq_us / count - mean * mean).max(0.0);
                TelemetryEntry {
                    name: name.clone(),
                    mean_us: mean as f32,
                    stdev_us: var.sqrt() as f32,
                    count: s.count as i32,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

/// Drained trace records of one tensor.
pub struct TraceRecord {
    pub tensor_name: String,
    pub records: Vec<CommTime>,
}

/// Tracks which traced tensors have reached their end step, so the trace file
/// is written once, after the last of them.
#[derive(Default)]
pub struct TraceState {
    inner: Mutex<TraceStateInner>,
}

#[derive(Default)]
struct TraceStateInner {
    name2end: HashMap<String, i32>,
    output_counter: i32,
}

impl TraceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor whose trace will be emitted.
    pub fn register_output(&self, name: &str) {
        let mut inner = self.inner.lock();
        if !inner.name2end.contains_key(name) {
            inner.name2end.insert(name.to_string(), 1);
            inner.output_counter += 1;
        }
    }

    /// Count one tensor as done tracing; true when it was the last.
    pub fn all_arrived(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.name2end.contains_key(name),
            "tensor {name} was never registered for trace output"
        );
        inner.output_counter -= 1;
        inner.output_counter == 0
    }
}

fn trace_event(tensor_name: &str, rec: &CommTime) -> serde_json::Value {
    let para_name = format!("Comm.{tensor_name}");
    let (name, tid) = match (rec.key, rec.stage) {
        (Some(key), Some(stage)) => (format!("{para_name}.{stage}"), key.to_string()),
        _ => (para_name.clone(), "total".to_string()),
    };
    json!({
        "ph": "X",
        "args": { "name": para_name },
        "pid": para_name,
        "name": name,
        "ts": rec.start_t,
        "dur": rec.dur,
        "tid": tid,
        "cat": "Comm",
    })
}

/// Write `<trace_dir>/<rank>/comm.json` in Chrome-tracing format.
pub fn output_traces(trace_dir: &str, rank: i32, drained: &[TraceRecord]) -> anyhow::Result<()> {
    let dir = std::path::Path::new(trace_dir).join(rank.to_string());
    std::fs::create_dir_all(&dir)?;
    let events: Vec<serde_json::Value> = drained
        .iter()
        .flat_map(|t| t.records.iter().map(|r| trace_event(&t.tensor_name, r)))
        .collect();
    let doc = json!({
        "traceEvents": events,
        "displayTimeUnit": "ms",
    });
    let mut file = std::fs::File::create(dir.join("comm.json"))?;
    file.write_all(serde_json::to_string_pretty(&doc)?.as_bytes())?;
    tracing::debug!(rank, dir = %dir.display(), "communication traces output done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_start_returns_op_count() {
        let t = Telemetry::new();
        assert_eq!(t.record_start("grad.0"), 1);
        t.record_end("grad.0");
        assert_eq!(t.record_start("grad.0"), 2);
        assert_eq!(t.record_start("grad.1"), 1);
        assert_eq!(t.size(), 2);
    }

    #[test]
    fn test_data_rows_sorted_and_counted() {
        let t = Telemetry::new();
        t.record_start("b");
        t.record_end("b");
        t.record_start("a");
        t.record_end("a");
        let rows = t.data();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "a");
        assert_eq!(rows[0].count, 1);
        assert!(rows[0].mean_us >= 0.0);
    }

    #[test]
    fn test_trace_state_last_arrival_wins() {
        let s = TraceState::new();
        s.register_output("x");
        s.register_output("y");
        s.register_output("x"); // duplicate registration is idempotent
        assert!(!s.all_arrived("x"));
        assert!(s.all_arrived("y"));
    }

    #[test]
    fn test_output_traces_writes_chrome_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = CommTime::begin(Some(42), Some(Stage::PUSH));
        rec.end();
        let drained = vec![TraceRecord {
            tensor_name: "grad.0".to_string(),
            records: vec![rec, CommTime { start_t: 5, dur: 9, key: None, stage: None }],
        }];
        output_traces(dir.path().to_str().unwrap(), 3, &drained).unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("3").join("comm.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        let events = doc["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ph"], "X");
        assert_eq!(events[0]["name"], "Comm.grad.0.PUSH");
        assert_eq!(events[0]["cat"], "Comm");
        assert_eq!(events[1]["tid"], "total");
        assert_eq!(doc["displayTimeUnit"], "ms");
    }
}
