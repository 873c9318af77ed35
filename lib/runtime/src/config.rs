// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Every knob is an environment variable with a `PSBUS_` prefix; the fabric's
//! own `DMLC_*` variables keep their names. [`RuntimeConfig::from_env`] reads
//! the effective set once at init; tests construct configs directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default partition bound in bytes, before page alignment.
pub const DEFAULT_PARTITION_BYTES: u32 = 4_096_000;

/// Tensors smaller than this are never compressed.
pub const DEFAULT_MIN_COMPRESS_BYTES: u32 = 1 << 16;

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_str(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_str(name).as_deref() {
        Some(v) => !matches!(v, "0" | "false" | "FALSE" | "False"),
        None => default,
    }
}

/// Hash function used to assign routing keys to servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFn {
    /// `((k >> 16) + (k % 65536)) * 9973`
    Naive,
    /// The standard library string hasher with a configurable coefficient.
    BuiltIn,
    /// djb2 over the decimal-stringified key.
    Djb2,
    /// djb2 to a physical-node index, then offset by the server local root.
    Djb2Colocate,
    /// sdbm over the decimal-stringified key.
    Sdbm,
    /// Split servers into colocated and non-colocated groups; a deterministic
    /// threshold chooses between them.
    Mixed,
}

impl fmt::Display for HashFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HashFn::Naive => "naive",
            HashFn::BuiltIn => "built_in",
            HashFn::Djb2 => "djb2",
            HashFn::Djb2Colocate => "djb2-colocate",
            HashFn::Sdbm => "sdbm",
            HashFn::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

impl FromStr for HashFn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(HashFn::Naive),
            "built_in" => Ok(HashFn::BuiltIn),
            "djb2" => Ok(HashFn::Djb2),
            "djb2-colocate" => Ok(HashFn::Djb2Colocate),
            "sdbm" => Ok(HashFn::Sdbm),
            "mixed" => Ok(HashFn::Mixed),
            _ => anyhow::bail!(
                "invalid PSBUS_KEY_HASH_FN '{s}', must be one of \
                 [naive, built_in, djb2, djb2-colocate, sdbm, mixed]"
            ),
        }
    }
}

/// GPU-direct all-reduce level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GdrLevel {
    Gpu2Cpu = 0,
    Gpu2Gpu = 1,
}

/// Process role within the job, from `DMLC_ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Worker,
    Server,
    Scheduler,
    /// Worker and server colocated in one process. Required for p2p,
    /// all-to-all and all-gather.
    Joint,
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Role::Worker),
            "server" => Ok(Role::Server),
            "scheduler" => Ok(Role::Scheduler),
            "joint" => Ok(Role::Joint),
            _ => anyhow::bail!("invalid DMLC_ROLE '{s}'"),
        }
    }
}

/// Communication-trace knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    pub enabled: bool,
    pub start_step: i32,
    pub end_step: i32,
    pub dir: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { enabled: false, start_step: 10, end_step: 20, dir: "./trace".to_string() }
    }
}

/// The effective configuration of one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub job_id: String,

    // partitioning
    pub partition_bytes: u32,
    pub alltoall_buff_bytes: u32,
    pub alltoall_buff_factor: f64,
    pub alltoall_session_size: u32,
    pub alltoall_copy_group_size: usize,
    pub alltoall_use_pull: bool,

    // feature flags
    pub disable_p2p: bool,
    pub disable_send_recv: bool,
    pub disable_compress: bool,
    pub disable_cpu_allreduce: bool,
    pub disable_gpu_allreduce: bool,
    pub disable_gpu_allgather: bool,
    pub skip_input_copy: bool,
    pub p2p_disable_pull_ack: bool,
    pub allgather_disable_pull_ack: bool,

    // GPU-direct
    pub use_gdr_allreduce: bool,
    pub use_gdr_allgather: bool,
    pub gdr_allreduce_level: GdrLevel,
    pub gdr_phase1_tensor_threshold: usize,
    pub gdr_phase2_tensor_threshold: usize,

    // key hashing
    pub key_hash_fn: Option<HashFn>,
    pub mixed_mode: bool,
    pub mixed_mode_bound: u64,
    pub built_in_hash_coef: u64,

    // local reduce strategy
    pub reduce_roots: Vec<i32>,
    pub worker_local_root: Option<i32>,
    pub server_local_root: Option<i32>,

    pub min_compress_bytes: u32,
    pub threadpool_size: usize,
    /// Byte credit for the PUSH stage; 0 leaves it unbounded.
    pub scheduling_credit: u32,

    // supervision
    pub monitor_interval_secs: u64,
    pub abort_on_timeout: bool,
    pub enable_err_handling: bool,

    pub trace: TraceConfig,

    // job shape, from the fabric's environment
    pub role: Role,
    pub num_worker: i32,
    pub num_server: i32,
    pub group_size: usize,
    pub force_distributed: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            job_id: "0".to_string(),
            partition_bytes: DEFAULT_PARTITION_BYTES,
            alltoall_buff_bytes: DEFAULT_PARTITION_BYTES,
            alltoall_buff_factor: 1.5,
            alltoall_session_size: 2,
            alltoall_copy_group_size: 16,
            alltoall_use_pull: false,
            disable_p2p: false,
            disable_send_recv: false,
            disable_compress: true,
            disable_cpu_allreduce: false,
            disable_gpu_allreduce: false,
            disable_gpu_allgather: false,
            skip_input_copy: false,
            p2p_disable_pull_ack: false,
            allgather_disable_pull_ack: false,
            use_gdr_allreduce: false,
            use_gdr_allgather: true,
            gdr_allreduce_level: GdrLevel::Gpu2Gpu,
            gdr_phase1_tensor_threshold: 102_400,
            gdr_phase2_tensor_threshold: 1_024_000,
            key_hash_fn: None,
            mixed_mode: false,
            mixed_mode_bound: 101,
            built_in_hash_coef: 1,
            reduce_roots: Vec::new(),
            worker_local_root: None,
            server_local_root: None,
            min_compress_bytes: DEFAULT_MIN_COMPRESS_BYTES,
            threadpool_size: 4,
            scheduling_credit: 0,
            monitor_interval_secs: 300,
            abort_on_timeout: false,
            enable_err_handling: false,
            trace: TraceConfig::default(),
            role: Role::Worker,
            num_worker: 1,
            num_server: 0,
            group_size: 1,
            force_distributed: false,
        }
    }
}

impl RuntimeConfig {
    /// Read the effective configuration from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        cfg.job_id = env_str("PSBUS_JOB_ID").unwrap_or_else(|| "0".to_string());

        cfg.partition_bytes = env_parse("PSBUS_PARTITION_BYTES", cfg.partition_bytes);
        // the all-to-all buffer bound follows the partition bound unless
        // overridden separately
        cfg.alltoall_buff_bytes =
            env_parse("PSBUS_P2P_PARTITION_BYTES", cfg.partition_bytes);
        cfg.alltoall_buff_factor =
            env_parse("PSBUS_ALLTOALL_MEM_FACTOR", cfg.alltoall_buff_factor);
        anyhow::ensure!(
            cfg.alltoall_buff_factor > 0.0,
            "PSBUS_ALLTOALL_MEM_FACTOR must be positive, got {}",
            cfg.alltoall_buff_factor
        );
        cfg.alltoall_session_size =
            env_parse("PSBUS_ALLTOALL_SESSION_SIZE", cfg.alltoall_session_size);
        cfg.alltoall_copy_group_size =
            env_parse("PSBUS_ALLTOALL_COPY_GROUP_SIZE", cfg.alltoall_copy_group_size);
        cfg.alltoall_use_pull = env_flag("PSBUS_ALL2ALL_USE_PULL", false);

        cfg.disable_p2p = env_flag("PSBUS_DISABLE_P2P", false);
        cfg.disable_send_recv = env_flag("PSBUS_DISABLE_SEND_RECV", false);
        cfg.disable_compress = env_flag("PSBUS_DISABLE_COMPRESS", true);
        cfg.disable_cpu_allreduce = env_flag("PSBUS_DISABLE_CPU_ALLREDUCE", false);
        cfg.disable_gpu_allreduce = env_flag("PSBUS_DISABLE_GPU_ALLREDUCE", false);
        cfg.disable_gpu_allgather = env_flag("PSBUS_DISABLE_GPU_ALLGATHER", false);
        cfg.skip_input_copy = env_flag("PSBUS_P2P_SKIP_INPUT_COPY", false);
        // ack suppression for p2p pulls and all-gather pulls are two
        // independent flags
        cfg.p2p_disable_pull_ack = env_flag("PSBUS_DISABLE_P2P_ACK", false);
        cfg.allgather_disable_pull_ack = env_flag("PSBUS_DISABLE_ALLGATHER_ACK", false);

        cfg.use_gdr_allreduce = env_flag("PSBUS_USE_GDR_ALLREDUCE", false);
        cfg.use_gdr_allgather = env_flag("PSBUS_USE_GDR_ALLGATHER", true);
        if cfg.use_gdr_allreduce && cfg.disable_gpu_allreduce {
            tracing::info!(
                "GDR allreduce enabled, forcing PSBUS_DISABLE_GPU_ALLREDUCE to be false"
            );
            cfg.disable_gpu_allreduce = false;
        }
        let level = env_parse("PSBUS_GDR_ALLREDUCE_LEVEL", 1i32);
        cfg.gdr_allreduce_level = match level {
            0 => GdrLevel::Gpu2Cpu,
            1 => GdrLevel::Gpu2Gpu,
            _ => anyhow::bail!("PSBUS_GDR_ALLREDUCE_LEVEL must be 0 or 1, got {level}"),
        };
        cfg.gdr_phase1_tensor_threshold =
            env_parse("PSBUS_GDR_PHASE1_TENSOR_THRESH", cfg.gdr_phase1_tensor_threshold);
        cfg.gdr_phase2_tensor_threshold =
            env_parse("PSBUS_GDR_PHASE2_TENSOR_THRESH", cfg.gdr_phase2_tensor_threshold);
        if cfg.use_gdr_allreduce && cfg.gdr_allreduce_level == GdrLevel::Gpu2Gpu {
            anyhow::ensure!(
                cfg.gdr_phase1_tensor_threshold < cfg.gdr_phase2_tensor_threshold,
                "PSBUS_GDR_PHASE1_TENSOR_THRESH must be smaller than \
                 PSBUS_GDR_PHASE2_TENSOR_THRESH"
            );
        }

        cfg.key_hash_fn = match env_str("PSBUS_KEY_HASH_FN") {
            Some(s) => Some(s.parse()?),
            None => None,
        };
        cfg.mixed_mode = env_flag("PSBUS_ENABLE_MIXED_MODE", false);
        if cfg.mixed_mode {
            cfg.key_hash_fn = Some(HashFn::Mixed);
        }
        cfg.mixed_mode_bound = env_parse("PSBUS_MIXED_MODE_BOUND", cfg.mixed_mode_bound);
        cfg.built_in_hash_coef =
            env_parse("PSBUS_BUILT_IN_HASH_COEF", cfg.built_in_hash_coef);

        if let Some(roots) = env_str("PSBUS_REDUCE_ROOTS") {
            cfg.reduce_roots = roots
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.trim().parse())
                .collect::<Result<_, _>>()
                .map_err(|e| anyhow::anyhow!("invalid PSBUS_REDUCE_ROOTS: {e}"))?;
        }
        cfg.worker_local_root = env_str("PSBUS_WORKER_LOCAL_ROOT")
            .and_then(|s| s.parse().ok());
        cfg.server_local_root = env_str("PSBUS_SERVER_LOCAL_ROOT")
            .and_then(|s| s.parse().ok());

        cfg.min_compress_bytes =
            env_parse("PSBUS_MIN_COMPRESS_BYTES", cfg.min_compress_bytes);
        cfg.threadpool_size = env_parse("PSBUS_THREADPOOL_SIZE", cfg.threadpool_size);
        cfg.scheduling_credit = env_parse("PSBUS_SCHEDULING_CREDIT", cfg.scheduling_credit);

        cfg.monitor_interval_secs =
            env_parse("PSBUS_MONITOR_INTERVAL", cfg.monitor_interval_secs);
        cfg.abort_on_timeout = env_flag("PSBUS_ABORT_ON_TIMEOUT", false);
        cfg.enable_err_handling = env_flag("PSBUS_ENABLE_ERR_HANDLING", false);

        cfg.trace = TraceConfig {
            enabled: env_parse("PSBUS_TRACE_ON", 0i32) == 1,
            start_step: env_parse("PSBUS_TRACE_START_STEP", 10),
            end_step: env_parse("PSBUS_TRACE_END_STEP", 20),
            dir: env_str("PSBUS_TRACE_DIR").unwrap_or_else(|| "./trace".to_string()),
        };

        cfg.role = match env_str("DMLC_ROLE") {
            Some(s) => s.parse()?,
            None => Role::Worker,
        };
        cfg.num_worker = env_parse("DMLC_NUM_WORKER", 1);
        cfg.num_server = env_parse("DMLC_NUM_SERVER", 0);
        cfg.group_size = env_parse("DMLC_GROUP_SIZE", 1);
        cfg.force_distributed = env_flag("PSBUS_FORCE_DISTRIBUTED", false);

        Ok(cfg)
    }

    pub fn is_joint(&self) -> bool {
        self.role == Role::Joint
    }

    /// Hash function after defaulting: djb2, or djb2-colocate in joint mode.
    pub fn effective_hash_fn(&self) -> HashFn {
        self.key_hash_fn.unwrap_or(if self.is_joint() {
            HashFn::Djb2Colocate
        } else {
            HashFn::Djb2
        })
    }

    /// Whether this job spans more than one worker process group.
    pub fn is_distributed(&self, local_size: i32) -> bool {
        if self.force_distributed {
            return true;
        }
        if self.is_joint() {
            self.num_worker > local_size
        } else {
            self.num_worker > 1
        }
    }
}

/// Round `size` up to the next multiple of `align`.
pub fn round_up(size: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    size.div_ceil(align) * align
}

/// The system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_fn_from_str() {
        assert_eq!("djb2".parse::<HashFn>().unwrap(), HashFn::Djb2);
        assert_eq!("djb2-colocate".parse::<HashFn>().unwrap(), HashFn::Djb2Colocate);
        assert_eq!("mixed".parse::<HashFn>().unwrap(), HashFn::Mixed);
        assert!("crc32".parse::<HashFn>().is_err());
    }

    #[test]
    fn test_effective_hash_fn_defaults() {
        let mut cfg = RuntimeConfig::default();
        assert_eq!(cfg.effective_hash_fn(), HashFn::Djb2);
        cfg.role = Role::Joint;
        assert_eq!(cfg.effective_hash_fn(), HashFn::Djb2Colocate);
        cfg.key_hash_fn = Some(HashFn::Sdbm);
        assert_eq!(cfg.effective_hash_fn(), HashFn::Sdbm);
    }

    #[test]
    fn test_is_distributed() {
        let mut cfg = RuntimeConfig::default();
        cfg.num_worker = 1;
        assert!(!cfg.is_distributed(1));
        cfg.num_worker = 2;
        assert!(cfg.is_distributed(1));
        // joint mode counts one worker per local rank
        cfg.role = Role::Joint;
        cfg.num_worker = 4;
        assert!(!cfg.is_distributed(4));
        assert!(cfg.is_distributed(2));
        cfg.force_distributed = true;
        assert!(cfg.is_distributed(4));
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(4_096_000, 4096), 4_096_000);
        assert_eq!(round_up(4_096_001, 4096), 4_100_096);
        assert_eq!(round_up(1, 8192), 8192);
    }
}
