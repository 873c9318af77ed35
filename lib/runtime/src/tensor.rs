// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Framework-facing tensor handles.
//!
//! The runtime never owns tensor data. Framework adapters hand in reference
//! counted [`Tensor`] handles which stay alive until the terminal callback of
//! the submission fires; everything the scheduler stages in between lives in
//! context-owned buffers.

use std::fmt;

/// Device id used for CPU tensors.
pub const CPU_DEVICE_ID: i32 = -1;

/// Device id for tensors whose placement is not yet decided.
pub const UNDECIDED_DEVICE_ID: i32 = -2;

/// Element types supported on the wire. The numeric values match the fabric's
/// command encoding and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum DataType {
    Float32 = 0,
    Float64 = 1,
    Float16 = 2,
    UInt8 = 3,
    Int32 = 4,
    Int8 = 5,
    Int64 = 6,
    UInt16 = 7,
    Int16 = 8,
    Bool = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float64 | DataType::Int64 => 8,
            DataType::Float16 | DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt8 | DataType::Int8 | DataType::Bool => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Float16 => "float16",
            DataType::UInt8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Int8 => "int8",
            DataType::Int64 => "int64",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Bool => "bool",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction applied by the all-reduce family of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReduceOp {
    Average,
    #[default]
    Sum,
}

/// A dense tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, idx: usize) -> i64 {
        self.dims[idx]
    }

    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Product of all dimensions after the first. All-to-all splits tensors
    /// along axis 0, so this is the per-row stride in elements.
    pub fn row_stride(&self) -> i64 {
        self.dims.iter().skip(1).product()
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }
}

impl From<&[i64]> for TensorShape {
    fn from(dims: &[i64]) -> Self {
        Self { dims: dims.to_vec() }
    }
}

/// A caller-owned tensor handle.
///
/// The copy-based accessors keep the trait object safe to share between stage
/// threads: concurrent stages only ever touch disjoint `offset..offset+len`
/// windows, which the partitioner guarantees.
pub trait Tensor: Send + Sync {
    fn dtype(&self) -> DataType;

    fn shape(&self) -> TensorShape;

    /// Total size in bytes.
    fn size(&self) -> usize;

    /// Device holding the data, or [`CPU_DEVICE_ID`].
    fn device(&self) -> i32;

    /// Copy `dst.len()` bytes starting at `offset` out of the tensor.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the tensor starting at `offset`.
    fn write(&self, offset: usize, src: &[u8]);

    /// Re-shape the tensor to hold `shape`, for outputs whose size is only
    /// known when the data arrives. Handles that cannot grow report
    /// a precondition error.
    fn resize(&self, shape: &TensorShape) -> crate::Status {
        let _ = shape;
        crate::Status::precondition_error("tensor handle does not support resize")
    }
}

/// Host-memory tensor used by the pure-CPU paths and throughout the tests.
pub struct HostTensor {
    dtype: DataType,
    shape: parking_lot::Mutex<TensorShape>,
    data: parking_lot::Mutex<Vec<u8>>,
    device: i32,
}

impl HostTensor {
    pub fn new(dtype: DataType, shape: TensorShape) -> Self {
        let bytes = shape.num_elements() as usize * dtype.size();
        Self {
            dtype,
            shape: parking_lot::Mutex::new(shape),
            data: parking_lot::Mutex::new(vec![0u8; bytes]),
            device: CPU_DEVICE_ID,
        }
    }

    pub fn from_vec(dtype: DataType, shape: TensorShape, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), shape.num_elements() as usize * dtype.size());
        Self {
            dtype,
            shape: parking_lot::Mutex::new(shape),
            data: parking_lot::Mutex::new(data),
            device: CPU_DEVICE_ID,
        }
    }

    /// Mark the handle as living on `device` without moving any data. Used by
    /// tests driving the GPU pipeline against host memory.
    pub fn on_device(self, device: i32) -> Self {
        Self { device, ..self }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn as_f32_vec(&self) -> Vec<f32> {
        self.data
            .lock()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl Tensor for HostTensor {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn shape(&self) -> TensorShape {
        self.shape.lock().clone()
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn device(&self) -> i32 {
        self.device
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    fn resize(&self, shape: &TensorShape) -> crate::Status {
        let bytes = shape.num_elements() as usize * self.dtype.size();
        self.data.lock().resize(bytes, 0);
        *self.shape.lock() = shape.clone();
        crate::Status::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DataType::Float32.size(), 4);
        assert_eq!(DataType::Float16.size(), 2);
        assert_eq!(DataType::Int64.size(), 8);
        assert_eq!(DataType::Bool.size(), 1);
    }

    #[test]
    fn test_shape_row_stride() {
        let shape = TensorShape::new(vec![7, 3, 2]);
        assert_eq!(shape.num_elements(), 42);
        assert_eq!(shape.row_stride(), 6);
        assert_eq!(TensorShape::new(vec![5]).row_stride(), 1);
    }

    #[test]
    fn test_host_tensor_read_write() {
        let t = HostTensor::new(DataType::UInt8, TensorShape::new(vec![8]));
        t.write(2, &[1, 2, 3]);
        let mut out = [0u8; 4];
        t.read(1, &mut out);
        assert_eq!(out, [0, 1, 2, 3]);
    }

    #[test]
    fn test_host_tensor_resize() {
        let t = HostTensor::new(DataType::Float32, TensorShape::new(vec![2]));
        assert_eq!(t.size(), 8);
        assert!(t.resize(&TensorShape::new(vec![4])).is_ok());
        assert_eq!(t.size(), 16);
    }
}
