// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-side reduction kernels.
//!
//! Used by the CPU all-reduce stages and by cross-PCIe-switch merging. Wide
//! buffers are split across the rayon pool; the per-chunk kernels are plain
//! scalar loops the compiler vectorizes.

use half::f16;
use rayon::prelude::*;

use crate::tensor::DataType;

/// Below this size the rayon fan-out costs more than it saves.
const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Stateless summation kernels over raw byte windows.
#[derive(Default)]
pub struct CpuReducer;

impl CpuReducer {
    pub fn new() -> Self {
        Self
    }

    /// `dst[i] += src[i]` elementwise over `len` bytes.
    pub fn sum(&self, dst: &mut [u8], src: &[u8], len: usize, dtype: DataType) {
        debug_assert!(dst.len() >= len && src.len() >= len);
        debug_assert_eq!(len % dtype.size(), 0);
        let dst = &mut dst[..len];
        let src = &src[..len];
        if len >= PARALLEL_THRESHOLD {
            // chunk on an element boundary
            let chunk = (len / rayon::current_num_threads().max(1) + dtype.size())
                / dtype.size()
                * dtype.size();
            dst.par_chunks_mut(chunk)
                .zip(src.par_chunks(chunk))
                .for_each(|(d, s)| sum_chunk(d, s, dtype));
        } else {
            sum_chunk(dst, src, dtype);
        }
    }

    /// `dst[i] = dst[i] * alpha` elementwise, for averaging.
    pub fn scale(&self, dst: &mut [u8], len: usize, dtype: DataType, alpha: f64) {
        debug_assert!(dst.len() >= len);
        scale_chunk(&mut dst[..len], dtype, alpha);
    }

    pub fn copy(&self, dst: &mut [u8], src: &[u8], len: usize) {
        dst[..len].copy_from_slice(&src[..len]);
    }
}

macro_rules! sum_as {
    ($dst:expr, $src:expr, $ty:ty) => {{
        let width = std::mem::size_of::<$ty>();
        for (d, s) in $dst.chunks_exact_mut(width).zip($src.chunks_exact(width)) {
            let a = <$ty>::from_le_bytes(d.try_into().unwrap());
            let b = <$ty>::from_le_bytes(s.try_into().unwrap());
            d.copy_from_slice(&(a.wrapping_add(b)).to_le_bytes());
        }
    }};
}

fn sum_chunk(dst: &mut [u8], src: &[u8], dtype: DataType) {
    match dtype {
        DataType::Float32 => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let a = f32::from_le_bytes(d.try_into().unwrap());
                let b = f32::from_le_bytes(s.try_into().unwrap());
                d.copy_from_slice(&(a + b).to_le_bytes());
            }
        }
        DataType::Float64 => {
            for (d, s) in dst.chunks_exact_mut(8).zip(src.chunks_exact(8)) {
                let a = f64::from_le_bytes(d.try_into().unwrap());
                let b = f64::from_le_bytes(s.try_into().unwrap());
                d.copy_from_slice(&(a + b).to_le_bytes());
            }
        }
        DataType::Float16 => {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                let a = f16::from_le_bytes(d.try_into().unwrap());
                let b = f16::from_le_bytes(s.try_into().unwrap());
                d.copy_from_slice(&(a + b).to_le_bytes());
            }
        }
        DataType::Int32 => sum_as!(dst, src, i32),
        DataType::Int64 => sum_as!(dst, src, i64),
        DataType::Int16 => sum_as!(dst, src, i16),
        DataType::UInt16 => sum_as!(dst, src, u16),
        DataType::Int8 => sum_as!(dst, src, i8),
        DataType::UInt8 | DataType::Bool => sum_as!(dst, src, u8),
    }
}

fn scale_chunk(dst: &mut [u8], dtype: DataType, alpha: f64) {
    match dtype {
        DataType::Float32 => {
            for d in dst.chunks_exact_mut(4) {
                let a = f32::from_le_bytes(d.try_into().unwrap());
                d.copy_from_slice(&(a * alpha as f32).to_le_bytes());
            }
        }
        DataType::Float64 => {
            for d in dst.chunks_exact_mut(8) {
                let a = f64::from_le_bytes(d.try_into().unwrap());
                d.copy_from_slice(&(a * alpha).to_le_bytes());
            }
        }
        DataType::Float16 => {
            for d in dst.chunks_exact_mut(2) {
                let a = f16::from_le_bytes(d.try_into().unwrap());
                d.copy_from_slice(&f16::from_f32(a.to_f32() * alpha as f32).to_le_bytes());
            }
        }
        // integral averages are not defined; leave the sum in place
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_sum_f32() {
        let reducer = CpuReducer::new();
        let mut dst = f32_bytes(&[1.0, 2.0, 3.0]);
        let src = f32_bytes(&[0.5, 0.5, 0.5]);
        reducer.sum(&mut dst, &src, 12, DataType::Float32);
        assert_eq!(dst, f32_bytes(&[1.5, 2.5, 3.5]));
    }

    #[test]
    fn test_sum_i64_wraps() {
        let reducer = CpuReducer::new();
        let mut dst = i64::MAX.to_le_bytes().to_vec();
        let src = 1i64.to_le_bytes().to_vec();
        reducer.sum(&mut dst, &src, 8, DataType::Int64);
        assert_eq!(i64::from_le_bytes(dst.try_into().unwrap()), i64::MIN);
    }

    #[test]
    fn test_sum_f16() {
        let reducer = CpuReducer::new();
        let mut dst = f16::from_f32(1.5).to_le_bytes().to_vec();
        let src = f16::from_f32(2.25).to_le_bytes().to_vec();
        reducer.sum(&mut dst, &src, 2, DataType::Float16);
        let out = f16::from_le_bytes(dst.try_into().unwrap());
        assert_eq!(out.to_f32(), 3.75);
    }

    #[test]
    fn test_sum_wide_buffer_matches_narrow() {
        let reducer = CpuReducer::new();
        let n = 100_000;
        let vals: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let mut wide = f32_bytes(&vals);
        let src = f32_bytes(&vec![1.0; n]);
        reducer.sum(&mut wide, &src, n * 4, DataType::Float32);
        let out: Vec<f32> = wide
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert!(out.iter().enumerate().all(|(i, v)| *v == i as f32 + 1.0));
    }

    #[test]
    fn test_scale_average() {
        let reducer = CpuReducer::new();
        let mut dst = f32_bytes(&[4.0, 8.0]);
        reducer.scale(&mut dst, 8, DataType::Float32, 0.25);
        assert_eq!(dst, f32_bytes(&[1.0, 2.0]));
    }
}
