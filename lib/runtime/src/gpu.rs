// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! GPU runtime seam.
//!
//! The scheduler never talks to a device API directly; it goes through
//! [`GpuRuntime`] for stream management and device<->host copies, and through
//! [`LocalCollective`] for the per-PCIe-switch reduce/broadcast/allgather
//! primitives. [`HostGpu`] and [`HostCollectiveHub`] back the single-host and
//! test configurations with plain memory operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::Status;
use crate::reducer::CpuReducer;
use crate::shm::SharedBuffer;
use crate::tensor::{ReduceOp, Tensor};

/// "Data is ready on this device" capability.
pub trait ReadyEvent: Send + Sync {
    fn ready(&self) -> bool;
}

/// CPU tensors are ready the moment they are submitted.
pub struct AlwaysReady;

impl ReadyEvent for AlwaysReady {
    fn ready(&self) -> bool {
        true
    }
}

/// An event toggled by the producer, for tests and host-side staging.
#[derive(Default)]
pub struct ManualEvent {
    fired: AtomicBool,
}

impl ManualEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }
}

impl ReadyEvent for ManualEvent {
    fn ready(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Copy streams owned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    CopyD2H,
    CopyH2D,
    AllgatherCopyD2H,
    AllgatherCopyH2D,
}

/// Device plumbing: streams and device<->host copies.
pub trait GpuRuntime: Send + Sync {
    fn set_device(&self, _device: i32) {}

    fn create_streams(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy_streams(&self) {}

    /// Copy a device-tensor window into a host staging buffer.
    fn copy_d2h(
        &self,
        stream: StreamKind,
        dst: &SharedBuffer,
        dst_offset: usize,
        src: &dyn Tensor,
        src_offset: usize,
        len: usize,
    ) -> Status;

    /// Copy a host staging window into a device tensor.
    fn copy_h2d(
        &self,
        stream: StreamKind,
        dst: &dyn Tensor,
        dst_offset: usize,
        src: &SharedBuffer,
        src_offset: usize,
        len: usize,
    ) -> Status;
}

/// Host-memory device: copies are memcpys, streams are free.
#[derive(Default)]
pub struct HostGpu;

impl GpuRuntime for HostGpu {
    fn copy_d2h(
        &self,
        _stream: StreamKind,
        dst: &SharedBuffer,
        dst_offset: usize,
        src: &dyn Tensor,
        src_offset: usize,
        len: usize,
    ) -> Status {
        dst.with_range_mut(dst_offset, len, |w| src.read(src_offset, w));
        Status::ok()
    }

    fn copy_h2d(
        &self,
        _stream: StreamKind,
        dst: &dyn Tensor,
        dst_offset: usize,
        src: &SharedBuffer,
        src_offset: usize,
        len: usize,
    ) -> Status {
        src.with_range(src_offset, len, |r| dst.write(dst_offset, r));
        Status::ok()
    }
}

/// Per-PCIe-switch collective primitives.
///
/// `reduce` leaves the combined window on the signal root, combining
/// elements according to the input tensor's dtype; `broadcast` and
/// `allgather` move raw bytes and never interpret elements. Calls block
/// until all switch members of the same key arrive, which is why stage
/// threads (never lock holders) are the only callers.
pub trait LocalCollective: Send + Sync {
    /// Whether this rank issues the collective for its switch group.
    fn is_signal_root(&self) -> bool;

    /// Ranks per switch group.
    fn switch_size(&self) -> i32;

    /// Switch groups per host.
    fn num_switch(&self) -> i32;

    fn reduce(
        &self,
        key: u64,
        input: &dyn Tensor,
        output: &dyn Tensor,
        offset: usize,
        len: usize,
        op: ReduceOp,
    ) -> Status;

    fn broadcast(&self, key: u64, output: &dyn Tensor, offset: usize, len: usize) -> Status;

    fn allgather(
        &self,
        key: u64,
        input: &dyn Tensor,
        output: &dyn Tensor,
        rank_offsets: &[usize],
    ) -> Status;
}

/// A single rank with no peers: reduce copies input to output, broadcast is a
/// no-op.
pub struct SoloCollective;

impl LocalCollective for SoloCollective {
    fn is_signal_root(&self) -> bool {
        true
    }

    fn switch_size(&self) -> i32 {
        1
    }

    fn num_switch(&self) -> i32 {
        1
    }

    fn reduce(
        &self,
        _key: u64,
        input: &dyn Tensor,
        output: &dyn Tensor,
        offset: usize,
        len: usize,
        _op: ReduceOp,
    ) -> Status {
        let mut window = vec![0u8; len];
        input.read(offset, &mut window);
        output.write(offset, &window);
        Status::ok()
    }

    fn broadcast(&self, _key: u64, _output: &dyn Tensor, _offset: usize, _len: usize) -> Status {
        Status::ok()
    }

    fn allgather(
        &self,
        _key: u64,
        input: &dyn Tensor,
        output: &dyn Tensor,
        rank_offsets: &[usize],
    ) -> Status {
        let len = input.size();
        let dst = rank_offsets.first().copied().unwrap_or(0);
        let mut window = vec![0u8; len];
        input.read(0, &mut window);
        output.write(dst, &window);
        Status::ok()
    }
}

/// In-process collective hub for several local ranks of one test process.
///
/// Members rendezvous per key: contributions are combined with the
/// dtype-dispatched host kernels, the root's call writes the result to its
/// output, and `broadcast` republishes the root window to every member.
pub struct HostCollectiveHub {
    size: i32,
    state: Mutex<HubState>,
    cv: Condvar,
    reducer: CpuReducer,
}

#[derive(Default)]
struct HubState {
    reduce: HashMap<u64, ReduceSlot>,
    bcast: HashMap<u64, (Vec<u8>, i32)>,
    gather: HashMap<u64, GatherSlot>,
}

#[derive(Default)]
struct GatherSlot {
    slices: Vec<Option<Vec<u8>>>,
    taken: i32,
}

struct ReduceSlot {
    acc: Vec<u8>,
    arrived: i32,
    generation: u64,
}

impl HostCollectiveHub {
    pub fn new(size: i32) -> Arc<Self> {
        Arc::new(Self {
            size,
            state: Mutex::new(HubState::default()),
            cv: Condvar::new(),
            reducer: CpuReducer::new(),
        })
    }

    /// The endpoint for one local rank. The last rank is the signal root,
    /// matching the default worker-local-root choice.
    pub fn endpoint(self: &Arc<Self>, local_rank: i32) -> Arc<HostCollective> {
        Arc::new(HostCollective { hub: self.clone(), local_rank })
    }
}

/// One rank's view of a [`HostCollectiveHub`].
pub struct HostCollective {
    hub: Arc<HostCollectiveHub>,
    local_rank: i32,
}

impl LocalCollective for HostCollective {
    fn is_signal_root(&self) -> bool {
        self.local_rank == self.hub.size - 1
    }

    fn switch_size(&self) -> i32 {
        self.hub.size
    }

    fn num_switch(&self) -> i32 {
        1
    }

    fn reduce(
        &self,
        key: u64,
        input: &dyn Tensor,
        output: &dyn Tensor,
        offset: usize,
        len: usize,
        op: ReduceOp,
    ) -> Status {
        let dtype = input.dtype();
        let mut window = vec![0u8; len];
        input.read(offset, &mut window);

        let mut state = self.hub.state.lock();
        let slot = state.reduce.entry(key).or_insert_with(|| ReduceSlot {
            acc: vec![0u8; len],
            arrived: 0,
            generation: 0,
        });
        // the accumulator is zeroed between rounds, so summing the first
        // contribution into it is exact for every element type
        self.hub.reducer.sum(&mut slot.acc, &window, len, dtype);
        slot.arrived += 1;
        let generation = slot.generation;
        if slot.arrived == self.hub.size {
            self.hub.cv.notify_all();
        } else {
            loop {
                let slot = state.reduce.get(&key).unwrap();
                if slot.generation != generation || slot.arrived >= self.hub.size {
                    break;
                }
                self.hub.cv.wait(&mut state);
            }
        }

        if self.is_signal_root() {
            let slot = state.reduce.get_mut(&key).unwrap();
            if op == ReduceOp::Average {
                self.hub.reducer.scale(&mut slot.acc, len, dtype, 1.0 / self.hub.size as f64);
            }
            output.write(offset, &slot.acc);
            slot.acc.fill(0);
            slot.arrived = 0;
            slot.generation += 1;
        }
        Status::ok()
    }

    fn broadcast(&self, key: u64, output: &dyn Tensor, offset: usize, len: usize) -> Status {
        let mut state = self.hub.state.lock();
        if self.is_signal_root() {
            let mut window = vec![0u8; len];
            output.read(offset, &mut window);
            state.bcast.insert(key, (window, 1));
            self.hub.cv.notify_all();
            // wait for all members to take their copy before retiring the slot
            while state.bcast.get(&key).map(|(_, taken)| *taken < self.hub.size) == Some(true) {
                self.hub.cv.wait(&mut state);
            }
            state.bcast.remove(&key);
        } else {
            while !state.bcast.contains_key(&key) {
                self.hub.cv.wait(&mut state);
            }
            let (window, taken) = state.bcast.get_mut(&key).unwrap();
            output.write(offset, &window.clone());
            *taken += 1;
            self.hub.cv.notify_all();
        }
        Status::ok()
    }

    fn allgather(
        &self,
        key: u64,
        input: &dyn Tensor,
        output: &dyn Tensor,
        rank_offsets: &[usize],
    ) -> Status {
        let mut window = vec![0u8; input.size()];
        input.read(0, &mut window);

        let size = self.hub.size;
        let mut state = self.hub.state.lock();
        let slot = state.gather.entry(key).or_insert_with(|| GatherSlot {
            slices: vec![None; size as usize],
            taken: 0,
        });
        slot.slices[self.local_rank as usize] = Some(window);
        if slot.slices.iter().all(|s| s.is_some()) {
            self.hub.cv.notify_all();
        } else {
            while !state.gather[&key].slices.iter().all(|s| s.is_some()) {
                self.hub.cv.wait(&mut state);
            }
        }

        // every member writes the full gathered set into its own output
        let slot = state.gather.get_mut(&key).unwrap();
        for (rank, slice) in slot.slices.iter().enumerate() {
            if let (Some(slice), Some(offset)) = (slice, rank_offsets.get(rank)) {
                output.write(*offset, slice);
            }
        }
        slot.taken += 1;
        if slot.taken == size {
            state.gather.remove(&key);
        }
        Status::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, HostTensor, TensorShape};

    #[test]
    fn test_manual_event() {
        let ev = ManualEvent::new();
        assert!(!ev.ready());
        ev.fire();
        assert!(ev.ready());
    }

    #[test]
    fn test_host_gpu_copies() {
        let gpu = HostGpu;
        let tensor = HostTensor::from_vec(
            DataType::UInt8,
            TensorShape::new(vec![4]),
            vec![1, 2, 3, 4],
        );
        let buf = SharedBuffer::alloc(16);
        assert!(gpu.copy_d2h(StreamKind::CopyD2H, &buf, 8, &tensor, 0, 4).is_ok());
        let out = HostTensor::new(DataType::UInt8, TensorShape::new(vec![4]));
        assert!(gpu.copy_h2d(StreamKind::CopyH2D, &out, 0, &buf, 8, 4).is_ok());
        assert_eq!(out.to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_hub_reduce_sums_across_ranks() {
        let hub = HostCollectiveHub::new(2);
        let a = hub.endpoint(0);
        let b = hub.endpoint(1);

        let make = |v: f32| {
            Arc::new(HostTensor::from_vec(
                DataType::Float32,
                TensorShape::new(vec![2]),
                [v, v].iter().flat_map(|x| x.to_le_bytes()).collect(),
            ))
        };
        let in0 = make(1.0);
        let in1 = make(2.0);
        let out0 = make(0.0);
        let out1 = make(0.0);

        let t = std::thread::spawn({
            let in0 = in0.clone();
            let out0 = out0.clone();
            move || a.reduce(7, in0.as_ref(), out0.as_ref(), 0, 8, ReduceOp::Sum)
        });
        assert!(b.reduce(7, in1.as_ref(), out1.as_ref(), 0, 8, ReduceOp::Sum).is_ok());
        assert!(t.join().unwrap().is_ok());

        // result lands on the signal root (rank 1) only
        assert_eq!(out1.as_f32_vec(), vec![3.0, 3.0]);
        assert_eq!(out0.as_f32_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_hub_reduce_dispatches_on_dtype() {
        use half::f16;

        let hub = HostCollectiveHub::new(2);
        let a = hub.endpoint(0);
        let b = hub.endpoint(1);

        let make = |v: f32| {
            Arc::new(HostTensor::from_vec(
                DataType::Float16,
                TensorShape::new(vec![2]),
                [v, v].iter().flat_map(|x| f16::from_f32(*x).to_le_bytes()).collect(),
            ))
        };
        let in0 = make(1.25);
        let in1 = make(2.5);
        let out0 = make(0.0);
        let out1 = make(0.0);

        let t = std::thread::spawn({
            let in0 = in0.clone();
            let out0 = out0.clone();
            move || a.reduce(9, in0.as_ref(), out0.as_ref(), 0, 4, ReduceOp::Sum)
        });
        assert!(b.reduce(9, in1.as_ref(), out1.as_ref(), 0, 4, ReduceOp::Sum).is_ok());
        assert!(t.join().unwrap().is_ok());

        let halves: Vec<f32> = out1
            .to_vec()
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect();
        assert_eq!(halves, vec![3.75, 3.75]);
    }
}
