// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Parameter-server fabric seam.
//!
//! The scheduler issues blocking push/pull calls against [`PsClient`]; the
//! real client wraps the fabric's RPC library and is provided by the binding
//! layer. [`LoopbackPs`] is the in-process stand-in: it aggregates push-pull
//! rounds the way a server shard would and lets tests observe every request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::Status;
use crate::keys::PsKv;
use crate::reducer::CpuReducer;
use crate::tensor::DataType;

/// Request verbs understood by the server shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Registration push issued by the leader during tensor init.
    LeaderPushPull = 0,
    /// A data push of one all-reduce partition.
    DefaultPushPull = 1,
    /// A push of compressor configuration.
    CompressedPushPull = 2,
    /// A p2p / all-to-all data send.
    DefaultSend = 3,
    /// Pull-response acknowledgement.
    AckSignal = 4,
    /// All-gather pull.
    GatherPull = 5,
}

/// Whether the payload lands in host or device memory on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// The command word attached to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub request: RequestType,
    pub dtype: DataType,
    pub device: DeviceKind,
}

impl Command {
    pub fn new(request: RequestType, dtype: DataType, device: DeviceKind) -> Self {
        Self { request, dtype, device }
    }

    /// Pack into the fabric's integer command encoding.
    pub fn encode(&self) -> i32 {
        ((self.request as i32) << 8)
            | ((self.dtype as i32) << 1)
            | matches!(self.device, DeviceKind::Gpu) as i32
    }
}

/// Callback invoked on fabric-level errors, long after the request returned.
pub type ErrHandle = Arc<dyn Fn(Status) + Send + Sync>;

/// Blocking client to the parameter-server fabric.
pub trait PsClient: Send + Sync + std::fmt::Debug {
    fn num_servers(&self) -> usize;

    /// Blocking push of `data` under `pskv`. Registration pushes double as a
    /// global barrier: they return only when the server acknowledged.
    fn push(&self, pskv: &PsKv, data: &[u8], cmd: Command) -> Status;

    /// Blocking pull into `dst`.
    fn pull(&self, pskv: &PsKv, dst: &mut [u8], cmd: Command) -> Status;

    fn set_err_handle(&self, _handle: ErrHandle) {}

    /// Tear down the connection; called once during shutdown.
    fn finalize(&self) {}
}

/// One observed push, for test assertions.
#[derive(Debug, Clone)]
pub struct PushRecord {
    pub ps_key: u64,
    pub len: usize,
    pub cmd: Command,
}

/// Delivery hook fired for every `DefaultSend` push. `first` marks the
/// registration push of a key.
pub type ReceiveHook = Box<dyn Fn(u64, &Bytes, Command, bool) + Send + Sync>;

#[derive(Default)]
struct Shard {
    acc: Vec<u8>,
    dtype: Option<DataType>,
    pushes: usize,
    pulls: usize,
}

#[derive(Default)]
struct LoopbackState {
    shards: HashMap<u64, Shard>,
    sends: HashMap<u64, Bytes>,
    log: Vec<PushRecord>,
}

/// In-process fabric: aggregates push-pull rounds across `expected_pushes`
/// workers and fans `DefaultSend` payloads out to a receive hook.
pub struct LoopbackPs {
    num_servers: usize,
    expected_pushes: usize,
    state: Mutex<LoopbackState>,
    cv: Condvar,
    reducer: CpuReducer,
    hook: Mutex<Option<ReceiveHook>>,
}

impl std::fmt::Debug for LoopbackPs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPs")
            .field("num_servers", &self.num_servers)
            .field("expected_pushes", &self.expected_pushes)
            .finish()
    }
}

impl LoopbackPs {
    pub fn new(num_servers: usize, expected_pushes: usize) -> Arc<Self> {
        Arc::new(Self {
            num_servers,
            expected_pushes: expected_pushes.max(1),
            state: Mutex::new(LoopbackState::default()),
            cv: Condvar::new(),
            reducer: CpuReducer::new(),
            hook: Mutex::new(None),
        })
    }

    pub fn set_receive_hook(&self, hook: ReceiveHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Number of pushes observed for a fabric key.
    pub fn pushes_for(&self, ps_key: u64) -> usize {
        self.state.lock().log.iter().filter(|r| r.ps_key == ps_key).count()
    }

    pub fn push_log(&self) -> Vec<PushRecord> {
        self.state.lock().log.clone()
    }
}

impl PsClient for LoopbackPs {
    fn num_servers(&self) -> usize {
        self.num_servers
    }

    fn push(&self, pskv: &PsKv, data: &[u8], cmd: Command) -> Status {
        let ps_key = pskv.keys[0];
        let mut state = self.state.lock();
        state.log.push(PushRecord { ps_key, len: data.len(), cmd });

        match cmd.request {
            RequestType::LeaderPushPull => {
                // registration: size the shard, do not aggregate
                let shard = state.shards.entry(ps_key).or_default();
                if shard.acc.len() < data.len() {
                    shard.acc.resize(data.len(), 0);
                }
                shard.dtype = Some(cmd.dtype);
            }
            RequestType::DefaultPushPull => {
                let shard = state.shards.entry(ps_key).or_default();
                if shard.acc.len() < data.len() {
                    shard.acc.resize(data.len(), 0);
                }
                if shard.pushes == 0 {
                    shard.acc[..data.len()].copy_from_slice(data);
                } else {
                    self.reducer.sum(&mut shard.acc, data, data.len(), cmd.dtype);
                }
                shard.dtype = Some(cmd.dtype);
                shard.pushes += 1;
                self.cv.notify_all();
            }
            RequestType::CompressedPushPull => {
                // configuration payloads are opaque to the shard
            }
            RequestType::DefaultSend | RequestType::AckSignal | RequestType::GatherPull => {
                let first = !state.sends.contains_key(&ps_key);
                let payload = Bytes::copy_from_slice(data);
                state.sends.insert(ps_key, payload.clone());
                self.cv.notify_all();
                drop(state);
                if let Some(hook) = self.hook.lock().as_ref() {
                    hook(ps_key, &payload, cmd, first);
                }
                return Status::ok();
            }
        }
        Status::ok()
    }

    fn pull(&self, pskv: &PsKv, dst: &mut [u8], cmd: Command) -> Status {
        let ps_key = pskv.keys[0];
        match cmd.request {
            RequestType::DefaultPushPull | RequestType::LeaderPushPull => {
                let mut state = self.state.lock();
                loop {
                    let shard = state.shards.entry(ps_key).or_default();
                    if shard.pushes >= self.expected_pushes {
                        break;
                    }
                    self.cv.wait(&mut state);
                }
                let expected = self.expected_pushes;
                let shard = state.shards.get_mut(&ps_key).unwrap();
                let len = dst.len().min(shard.acc.len());
                dst[..len].copy_from_slice(&shard.acc[..len]);
                shard.pulls += 1;
                if shard.pulls >= expected {
                    // round complete, reset for the next minibatch
                    shard.acc.fill(0);
                    shard.pushes = 0;
                    shard.pulls = 0;
                }
                Status::ok()
            }
            RequestType::GatherPull | RequestType::DefaultSend => {
                // block until the publisher pushed, like a real shard would
                let mut state = self.state.lock();
                while !state.sends.contains_key(&ps_key) {
                    self.cv.wait(&mut state);
                }
                let payload = &state.sends[&ps_key];
                let len = dst.len().min(payload.len());
                dst[..len].copy_from_slice(&payload[..len]);
                Status::ok()
            }
            _ => Status::invalid_argument("pull with a push-only command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pskv(key: u64, len: usize) -> PsKv {
        PsKv { keys: vec![key], lens: vec![len], size: len, server: 0 }
    }

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_command_encoding_is_injective_enough() {
        let a = Command::new(RequestType::DefaultSend, DataType::Float32, DeviceKind::Cpu);
        let b = Command::new(RequestType::DefaultSend, DataType::Float32, DeviceKind::Gpu);
        let c = Command::new(RequestType::DefaultPushPull, DataType::Float32, DeviceKind::Cpu);
        assert_ne!(a.encode(), b.encode());
        assert_ne!(a.encode(), c.encode());
    }

    #[test]
    fn test_push_pull_round_aggregates_two_workers() {
        let ps = LoopbackPs::new(1, 2);
        let kv = pskv(100, 8);
        let cmd = Command::new(RequestType::DefaultPushPull, DataType::Float32, DeviceKind::Cpu);

        ps.push(&kv, &f32_bytes(&[1.0, 2.0]), cmd);
        let ps2 = ps.clone();
        let kv2 = kv.clone();
        let t = std::thread::spawn(move || {
            let mut out = vec![0u8; 8];
            ps2.pull(&kv2, &mut out, cmd);
            out
        });
        ps.push(&kv, &f32_bytes(&[10.0, 20.0]), cmd);
        assert_eq!(t.join().unwrap(), f32_bytes(&[11.0, 22.0]));

        let mut out = vec![0u8; 8];
        ps.pull(&kv, &mut out, cmd);
        assert_eq!(out, f32_bytes(&[11.0, 22.0]));

        // both workers pulled, next round starts clean
        ps.push(&kv, &f32_bytes(&[5.0, 5.0]), cmd);
        ps.push(&kv, &f32_bytes(&[1.0, 1.0]), cmd);
        let mut out = vec![0u8; 8];
        ps.pull(&kv, &mut out, cmd);
        assert_eq!(out, f32_bytes(&[6.0, 6.0]));
        ps.pull(&kv, &mut out, cmd);
    }

    #[test]
    fn test_send_fires_hook_with_first_flag() {
        let ps = LoopbackPs::new(1, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        ps.set_receive_hook(Box::new(move |key, data, _cmd, first| {
            seen2.lock().push((key, data.len(), first));
        }));
        let cmd = Command::new(RequestType::DefaultSend, DataType::UInt8, DeviceKind::Cpu);
        ps.push(&pskv(7, 4), &[0u8; 4], cmd);
        ps.push(&pskv(7, 2), &[1u8; 2], cmd);
        assert_eq!(seen.lock().as_slice(), &[(7, 4, true), (7, 2, false)]);
        assert_eq!(ps.pushes_for(7), 2);
    }
}
