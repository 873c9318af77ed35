// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compression plugin seam.
//!
//! Gradient compressors are external plugins. A context registers kwargs via
//! `register_compressor`; on initialization the registry instantiates one
//! compressor per partition from the `compressor` kwarg. The COMPRESS stage
//! shrinks the staged window before PUSH, DECOMPRESS restores it after PULL.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::tensor::DataType;

/// A compressed window, ready to push.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub data: Bytes,
}

impl Compressed {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One partition's compressor instance.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8]) -> Compressed;

    /// Restore `compressed` into `output`; `output` is the full partition
    /// window.
    fn decompress(&self, compressed: &Compressed, output: &mut [u8]);
}

/// Factory signature: kwargs, aligned partition length, element type.
pub type CompressorFactory =
    Arc<dyn Fn(&HashMap<String, String>, usize, DataType) -> Arc<dyn Compressor> + Send + Sync>;

static REGISTRY: Lazy<DashMap<String, CompressorFactory>> = Lazy::new(DashMap::new);

/// Register a plugin under `name` (the value of the `compressor` kwarg).
pub fn register_factory(name: &str, factory: CompressorFactory) {
    REGISTRY.insert(name.to_string(), factory);
}

/// Instantiate the compressor requested by `kwargs`, or `None` when no (or an
/// unknown) compressor is requested.
pub fn create(
    kwargs: &HashMap<String, String>,
    aligned_len: usize,
    dtype: DataType,
) -> Option<Arc<dyn Compressor>> {
    let name = kwargs.get("compressor")?;
    match REGISTRY.get(name) {
        Some(factory) => Some(factory(kwargs, aligned_len, dtype)),
        None => {
            tracing::warn!(compressor = %name, "unknown compressor requested, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keeps every fourth byte; decompress re-expands with zeros.
    struct StrideCompressor;

    impl Compressor for StrideCompressor {
        fn compress(&self, input: &[u8]) -> Compressed {
            Compressed { data: input.iter().copied().step_by(4).collect::<Vec<u8>>().into() }
        }

        fn decompress(&self, compressed: &Compressed, output: &mut [u8]) {
            output.fill(0);
            for (i, b) in compressed.data.iter().enumerate() {
                output[i * 4] = *b;
            }
        }
    }

    #[test]
    fn test_registry_create() {
        register_factory("stride", Arc::new(|_, _, _| Arc::new(StrideCompressor)));
        let mut kwargs = HashMap::new();
        assert!(create(&kwargs, 16, DataType::Float32).is_none());

        kwargs.insert("compressor".to_string(), "stride".to_string());
        let c = create(&kwargs, 16, DataType::Float32).unwrap();
        let packed = c.compress(&[1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(packed.len(), 2);
        let mut out = [9u8; 8];
        c.decompress(&packed, &mut out);
        assert_eq!(out, [1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_compressor_is_none() {
        let mut kwargs = HashMap::new();
        kwargs.insert("compressor".to_string(), "no_such_plugin".to_string());
        assert!(create(&kwargs, 16, DataType::Float32).is_none());
    }
}
