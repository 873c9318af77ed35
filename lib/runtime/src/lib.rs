// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! psbus runtime
//!
//! A staged communication scheduler for distributed deep-learning collectives.
//! Tensors submitted through the enqueue front-end are partitioned into
//! fixed-size work items that flow through a pipeline of per-stage queues,
//! coordinated across local peers by quorum tables and a small control channel,
//! and pushed/pulled through a parameter-server fabric.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod comm;
pub mod compress;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod enqueue;
pub mod error;
pub mod gpu;
pub mod keys;
pub mod logging;
pub mod queue;
pub mod ready_table;
pub mod reducer;
pub mod runtime;
pub mod shm;
pub mod stage;
pub mod task;
pub mod telemetry;
pub mod tensor;
pub mod transport;

pub use config::RuntimeConfig;
pub use error::{Status, StatusKind};
pub use runtime::{Runtime, RuntimeBuilder};
pub use stage::Stage;
pub use task::{StatusCallback, Task};
pub use tensor::{DataType, ReduceOp, Tensor, TensorShape, CPU_DEVICE_ID};
