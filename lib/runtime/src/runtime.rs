// SPDX-FileCopyrightText: Copyright (c) 2025-2026 The psbus Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global lifecycle.
//!
//! A [`Runtime`] is an explicit value created through [`RuntimeBuilder`]:
//! topology discovery, table and queue construction, stage-thread launch, the
//! init barrier across local peers, and the shutdown path all live here. A
//! process-wide handle exists for binding-layer convenience
//! ([`set_global`] / [`global`]); nothing constructs a runtime implicitly.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::comm::{CommMsg, LoopbackComm, PeerComm, Signal, Topology};
use crate::config::{GdrLevel, RuntimeConfig, page_size, round_up};
use crate::context::ContextTable;
use crate::dispatcher;
use crate::error::CallbackTable;
use crate::gpu::{GpuRuntime, HostGpu, LocalCollective, SoloCollective};
use crate::keys::KeyEncoder;
use crate::queue::{ScheduledQueue, ShutdownSignal};
use crate::ready_table::{ReadyTable, Tables};
use crate::reducer::CpuReducer;
use crate::shm::ShmManager;
use crate::stage::{STAGE_COUNT, Stage};
use crate::telemetry::{Telemetry, TraceState};
use crate::transport::{ErrHandle, PsClient};
use crate::{Status, logging};

type PsFactory = Box<dyn FnOnce() -> anyhow::Result<Arc<dyn PsClient>> + Send>;

static GLOBAL: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

/// Install the process-wide handle. Replaces a previous one after shutdown.
pub fn set_global(rt: Arc<Runtime>) {
    *GLOBAL.lock() = Some(rt);
}

pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.lock().clone()
}

pub fn clear_global() {
    GLOBAL.lock().take();
}

pub struct Runtime {
    id: String,
    config: RuntimeConfig,
    topo: Topology,
    partition_bytes: u32,
    alltoall_buff_bytes: u32,
    worker_local_root: i32,
    server_local_root: i32,
    is_distributed: bool,
    is_cross_pcie_switch: bool,

    queues: Vec<Arc<ScheduledQueue>>,
    tables: Arc<Tables>,
    contexts: ContextTable,
    encoder: KeyEncoder,
    telemetry: Telemetry,
    trace_state: TraceState,
    callbacks: Arc<CallbackTable>,
    reducer: CpuReducer,
    shm: ShmManager,

    comm: Arc<dyn PeerComm>,
    gpu: Arc<dyn GpuRuntime>,
    collective: Arc<dyn LocalCollective>,
    ps: OnceCell<Arc<dyn PsClient>>,
    ps_factory: Mutex<Option<PsFactory>>,

    shutdown: Arc<ShutdownSignal>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn topo(&self) -> &Topology {
        &self.topo
    }

    pub fn rank(&self) -> i32 {
        self.topo.rank
    }

    pub fn local_rank(&self) -> i32 {
        self.topo.local_rank
    }

    pub fn size(&self) -> i32 {
        self.topo.size
    }

    pub fn local_size(&self) -> i32 {
        self.topo.local_size
    }

    pub fn worker_id(&self) -> i32 {
        self.topo.worker_id
    }

    pub fn phy_node_id(&self) -> i32 {
        self.topo.phy_node_id
    }

    pub fn num_phy_node(&self) -> i32 {
        self.topo.num_phy_node
    }

    pub fn worker_local_root(&self) -> i32 {
        self.worker_local_root
    }

    pub fn server_local_root(&self) -> i32 {
        self.server_local_root
    }

    /// Whether this rank performs cross-node communication for its host.
    pub fn is_root_device(&self) -> bool {
        self.topo.local_rank == self.worker_local_root
    }

    pub fn is_distributed(&self) -> bool {
        self.is_distributed
    }

    pub fn is_cross_pcie_switch(&self) -> bool {
        self.is_cross_pcie_switch
    }

    pub fn is_joint(&self) -> bool {
        self.config.is_joint()
    }

    pub fn is_gdr(&self) -> bool {
        self.config.use_gdr_allreduce
    }

    pub fn gdr_level(&self) -> GdrLevel {
        self.config.gdr_allreduce_level
    }

    pub fn is_gdr_gpu2gpu(&self) -> bool {
        self.config.gdr_allreduce_level == GdrLevel::Gpu2Gpu
    }

    pub fn is_gdr_allgather(&self) -> bool {
        self.config.use_gdr_allgather
    }

    /// Whether an explicit reduce-root set overrides the GDR fast path.
    pub fn is_using_reduce(&self) -> bool {
        !self.config.reduce_roots.is_empty()
    }

    pub fn is_signal_root(&self) -> bool {
        self.collective.is_signal_root()
    }

    /// Partition bound, page-aligned per host.
    pub fn partition_bytes(&self) -> u32 {
        self.partition_bytes
    }

    pub fn alltoall_buff_bytes(&self) -> u32 {
        self.alltoall_buff_bytes
    }

    pub fn queue(&self, stage: Stage) -> &Arc<ScheduledQueue> {
        &self.queues[stage.index()]
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    pub fn encoder(&self) -> &KeyEncoder {
        &self.encoder
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn reducer(&self) -> &CpuReducer {
        &self.reducer
    }

    pub fn shm(&self) -> &ShmManager {
        &self.shm
    }

    pub fn comm(&self) -> &Arc<dyn PeerComm> {
        &self.comm
    }

    pub fn gpu(&self) -> &Arc<dyn GpuRuntime> {
        &self.gpu
    }

    pub fn collective(&self) -> &Arc<dyn LocalCollective> {
        &self.collective
    }

    /// The fabric client, connecting on first use. The first call performs
    /// the PS handshake; registration pushes double as a global barrier.
    pub fn ps(&self) -> Result<Arc<dyn PsClient>, Status> {
        self.ps
            .get_or_try_init(|| {
                let factory = self.ps_factory.lock().take().ok_or_else(|| {
                    Status::precondition_error("no parameter-server client configured")
                })?;
                let client = factory().map_err(|e| Status::unknown_error(e.to_string()))?;
                if self.config.enable_err_handling {
                    let callbacks = self.callbacks.clone();
                    let handle: ErrHandle = Arc::new(move |status: Status| {
                        callbacks.fail_all(&status);
                    });
                    client.set_err_handle(handle);
                }
                tracing::debug!(rank = self.topo.rank, "parameter-server client initialized");
                Result::<_, Status>::Ok(client)
            })
            .map(|client| client.clone())
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.is_set()
    }

    pub(crate) fn shutdown_signal(&self) -> &Arc<ShutdownSignal> {
        &self.shutdown
    }

    /// Bounded wait for shutdown; true once it was triggered.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.wait_timeout(timeout)
    }

    // ------------------------------------------------------------------
    // declaration surface
    // ------------------------------------------------------------------

    pub fn declare_tensor(&self, name: &str, provided_key: Option<u32>) -> Result<u32, Status> {
        self.contexts.declare(name, crate::keys::OpType::PushPull, provided_key, None)
    }

    pub fn declare_alltoall_tensor(
        &self,
        name: &str,
        provided_key: Option<u32>,
        session: u32,
    ) -> Result<u32, Status> {
        self.contexts.declare(name, crate::keys::OpType::AllToAll, provided_key, Some(session))
    }

    pub fn declare_allgather_tensor(
        &self,
        name: &str,
        provided_key: Option<u32>,
    ) -> Result<u32, Status> {
        self.contexts.declare(name, crate::keys::OpType::AllGather, provided_key, None)
    }

    pub fn declare_p2p_tensor(&self, name: &str, sender: i32, receiver: i32) -> Result<u32, Status> {
        self.contexts.declare_p2p(name, sender, receiver)
    }

    pub fn register_compressor(
        &self,
        name: &str,
        kwargs: std::collections::HashMap<String, String>,
    ) -> Result<(), Status> {
        self.contexts.register_compressor(name, kwargs)
    }

    pub fn session_id(&self, name: &str) -> u64 {
        self.contexts.next_session(name) % self.contexts.session_size() as u64
    }

    pub fn mark_done(&self, name: &str) {
        self.contexts.mark_done(name);
    }

    pub fn session_size(&self) -> u32 {
        self.contexts.session_size()
    }

    // ------------------------------------------------------------------
    // shutdown
    // ------------------------------------------------------------------

    /// Cooperative global shutdown: flag, wake every stage thread, join them,
    /// finalize the fabric, tear down streams and tables.
    pub fn shutdown(&self) {
        tracing::debug!(rank = self.topo.local_rank, "shutdown: start to clean the resources");
        self.shutdown.trigger();
        for queue in &self.queues {
            queue.notify();
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let total = threads.len();
        tracing::debug!(rank = self.topo.local_rank, total, "shutdown: joining stage threads");
        for handle in threads {
            let _ = handle.join();
        }

        if let Some(ps) = self.ps.get() {
            tracing::debug!(rank = self.topo.local_rank, "shutdown: finalizing fabric client");
            ps.finalize();
        }
        self.gpu.destroy_streams();
        self.contexts.clear();
        tracing::debug!(rank = self.topo.local_rank, "shutdown: all resources cleaned");
    }

    /// Shutdown that keeps the declaration order for a later [`resume`].
    pub fn suspend(&self) -> Vec<String> {
        let declared = self.contexts.declared_names();
        self.shutdown();
        declared
    }

    /// Replay remembered declarations after a resume so keys are reproduced
    /// identically.
    pub fn resume(&self) -> Result<(), Status> {
        self.contexts.re_declare()
    }

    /// Drain trace records of every context and write the per-rank trace
    /// file.
    pub fn output_traces(&self) -> anyhow::Result<()> {
        let drained: Vec<_> =
            self.contexts.contexts().iter().map(|c| c.drain_trace()).collect();
        crate::telemetry::output_traces(&self.config.trace.dir, self.topo.rank, &drained)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.shutdown.is_set() {
            self.shutdown();
        }
    }
}

fn build_tables(
    config: &RuntimeConfig,
    topo: &Topology,
    is_root: bool,
    is_cross_pcie: bool,
    collective: &Arc<dyn LocalCollective>,
) -> Tables {
    let mut tables = Tables::default();
    let local_peers = topo.local_size - 1;

    if is_root {
        tables.push = Some(ReadyTable::new(local_peers, "PUSH"));
        tables.cpu_reduce = Some(ReadyTable::new(local_peers, "CPU_REDUCE"));
        tables.cpu_bcast_finish = Some(ReadyTable::new(local_peers, "CPU_BCAST_FINISH"));
    } else {
        tables.copy = Some(ReadyTable::new(1, "COPY"));
        tables.cpu_bcast = Some(ReadyTable::new(1, "CPU_BCAST"));
        tables.allgather_copy_h2d = Some(ReadyTable::new(1, "ALLGATHER_COPY_H2D"));
    }

    if collective.is_signal_root() {
        let switch_peers = collective.switch_size() - 1;
        tables.reduce = Some(ReadyTable::new(switch_peers, "REDUCE"));
        tables.broadcast = Some(ReadyTable::new(switch_peers, "BROADCAST"));
        tables.allgather = Some(ReadyTable::new(switch_peers, "ALLGATHER"));
        tables.allgather_bcast = Some(ReadyTable::new(switch_peers, "ALLGATHER_BCAST"));
    }

    if is_cross_pcie {
        tables.pcie_reduce = Some(ReadyTable::new(collective.num_switch() - 1, "PCIE_REDUCE"));
    }

    if config.is_joint() {
        // receive-side rendezvous, fed by the fabric delivery path
        tables.p2p_copy = Some(ReadyTable::new(1, "P2P_COPY"));
        tables.p2p_group_copy = Some(ReadyTable::new(1, "P2P_GROUP_COPY"));
        tables.p2p_pull_response = Some(ReadyTable::new(1, "P2P_PULL_RESPONSE"));
        tables.p2p_ack = Some(ReadyTable::new(1, "P2P_ACK"));
        tables.allgather_pull_resp = Some(ReadyTable::new(1, "ALLGATHER_PULL_RESP"));
        tables.allgather_pull_ack = Some(ReadyTable::new(1, "ALLGATHER_PULL_ACK"));
        tables.allgather_wlr_resp =
            Some(ReadyTable::new(1, "ALLGATHER_PULL_WORKER_LOCAL_ROOT_RESP"));
        tables.allgather_wlr_ack =
            Some(ReadyTable::new(1, "ALLGATHER_PULL_WORKER_LOCAL_ROOT_ACK"));
    }
    if config.use_gdr_allreduce {
        tables.gdr_push_pull = Some(ReadyTable::new(1, "GDR_PUSH_PULL"));
    }

    tables
}

#[derive(Default)]
pub struct RuntimeBuilder {
    config: Option<RuntimeConfig>,
    local_rank: Option<i32>,
    local_size: Option<i32>,
    worker_id: Option<i32>,
    comm: Option<Arc<dyn PeerComm>>,
    gpu: Option<Arc<dyn GpuRuntime>>,
    collective: Option<Arc<dyn LocalCollective>>,
    ps_factory: Option<PsFactory>,
    shm_base_dir: Option<std::path::PathBuf>,
    declared: Vec<String>,
    install_global: bool,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn placement(mut self, local_rank: i32, local_size: i32, worker_id: i32) -> Self {
        self.local_rank = Some(local_rank);
        self.local_size = Some(local_size);
        self.worker_id = Some(worker_id);
        self
    }

    pub fn comm(mut self, comm: Arc<dyn PeerComm>) -> Self {
        self.comm = Some(comm);
        self
    }

    pub fn gpu(mut self, gpu: Arc<dyn GpuRuntime>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn collective(mut self, collective: Arc<dyn LocalCollective>) -> Self {
        self.collective = Some(collective);
        self
    }

    pub fn ps_client(mut self, client: Arc<dyn PsClient>) -> Self {
        self.ps_factory = Some(Box::new(move || Ok(client)));
        self
    }

    pub fn ps_factory(
        mut self,
        factory: impl FnOnce() -> anyhow::Result<Arc<dyn PsClient>> + Send + 'static,
    ) -> Self {
        self.ps_factory = Some(Box::new(factory));
        self
    }

    pub fn shm_base_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.shm_base_dir = Some(dir.into());
        self
    }

    /// Seed the declaration order from a suspended runtime, for resume.
    pub fn declared_names(mut self, names: Vec<String>) -> Self {
        self.declared = names;
        self
    }

    pub fn install_global(mut self) -> Self {
        self.install_global = true;
        self
    }

    /// Build the runtime: round the partition bound, create tables and
    /// queues, start the stage threads, run the init barrier, start the
    /// listen thread.
    pub fn launch(self) -> anyhow::Result<Arc<Runtime>> {
        logging::init();
        let config = match self.config {
            Some(config) => config,
            None => RuntimeConfig::from_env()?,
        };

        let comm: Arc<dyn PeerComm> = match self.comm {
            Some(comm) => comm,
            None => Arc::new(LoopbackComm::solo()),
        };
        let local_rank = self.local_rank.unwrap_or_else(|| comm.local_rank());
        let local_size = self.local_size.unwrap_or_else(|| comm.local_size());
        let worker_id = self.worker_id.unwrap_or(0);
        let topo = Topology::derive(&config, local_rank, local_size, worker_id);

        let worker_local_root = config.worker_local_root.unwrap_or(local_size - 1);
        let server_local_root = config.server_local_root.unwrap_or(local_size - 1);
        let is_root = local_rank == worker_local_root;
        let is_distributed = config.is_distributed(local_size);
        anyhow::ensure!(
            !is_distributed || config.num_server > 0,
            "launching a distributed job, but DMLC_NUM_SERVER is not set"
        );

        let partition_bytes =
            round_up(config.partition_bytes, local_size as u32 * page_size() as u32);
        let alltoall_buff_bytes = config.alltoall_buff_bytes;
        tracing::debug!(partition_bytes, "partition size rounded up to page alignment");

        let gpu = self.gpu.unwrap_or_else(|| Arc::new(HostGpu));
        gpu.set_device(local_rank % local_size.max(1));
        gpu.create_streams()?;
        let collective: Arc<dyn LocalCollective> =
            self.collective.unwrap_or_else(|| Arc::new(SoloCollective));
        // more than one switch group on this host means reduced data crosses
        // the PCIe switch boundary through host staging
        let is_cross_pcie = collective.num_switch() > 1;

        if !config.reduce_roots.is_empty() {
            anyhow::ensure!(
                !is_cross_pcie,
                "PSBUS_REDUCE_ROOTS cannot be used with a cross-PCIe-switch topology"
            );
            if config.use_gdr_allreduce {
                tracing::info!(roots = ?config.reduce_roots, "GDR local reduce roots set");
            }
        }
        if config.use_gdr_allreduce {
            anyhow::ensure!(
                !is_cross_pcie,
                "GDR allreduce cannot be used with a cross-PCIe-switch topology"
            );
            anyhow::ensure!(config.is_joint(), "GDR allreduce requires joint mode");
        }

        let num_servers = if is_distributed {
            config.num_server.max(1) as usize
        } else {
            // key encoding still works in single-node jobs
            1
        };
        let encoder = KeyEncoder::new(
            config.effective_hash_fn(),
            config.built_in_hash_coef,
            config.mixed_mode_bound,
            num_servers,
            topo.num_phy_node as usize,
            local_size as usize,
            server_local_root as usize,
            config.num_worker as usize,
        );

        let tables = Arc::new(build_tables(&config, &topo, is_root, is_cross_pcie, &collective));
        let shutdown = ShutdownSignal::new();

        let gate_env = dispatcher::GateEnv {
            tables: tables.clone(),
            is_root,
            is_signal_root: collective.is_signal_root(),
            local_size,
            is_distributed,
        };
        let credit = if config.scheduling_credit > 0 {
            Some(config.scheduling_credit as i64)
        } else {
            None
        };
        let queues: Vec<Arc<ScheduledQueue>> = Stage::ALL
            .iter()
            .map(|stage| {
                let stage_credit = match stage {
                    Stage::PUSH | Stage::GDR_V1_PUSH_PULL | Stage::GDR_V2_PUSH_PULL => credit,
                    _ => None,
                };
                Arc::new(ScheduledQueue::new(
                    *stage,
                    shutdown.clone(),
                    stage_credit,
                    dispatcher::gate_for(*stage, gate_env.clone()),
                ))
            })
            .collect();
        debug_assert_eq!(queues.len(), STAGE_COUNT);

        let contexts = ContextTable::new(config.alltoall_session_size);
        contexts.restore_declared(self.declared);

        let shm = match self.shm_base_dir {
            Some(dir) => ShmManager::with_base_dir(dir),
            None => ShmManager::new(),
        };

        let runtime = Arc::new(Runtime {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            topo,
            partition_bytes,
            alltoall_buff_bytes,
            worker_local_root,
            server_local_root,
            is_distributed,
            is_cross_pcie_switch: is_cross_pcie,
            queues,
            tables,
            contexts,
            encoder,
            telemetry: Telemetry::new(),
            trace_state: TraceState::new(),
            callbacks: Arc::new(CallbackTable::new()),
            reducer: CpuReducer::new(),
            shm,
            comm,
            gpu,
            collective,
            ps: OnceCell::new(),
            ps_factory: Mutex::new(self.ps_factory),
            shutdown,
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = dispatcher::start_loops(&runtime);

        // init barrier: non-roots all wait for the root device
        if runtime.is_root_device() {
            tracing::debug!(rank = local_rank, "init barrier: root broadcasts");
            runtime.comm.broadcast(CommMsg {
                src: local_rank,
                signal: Signal::Barrier,
                key: 0,
            })?;
        } else {
            loop {
                match runtime.comm.recv_timeout(Duration::from_secs(60)) {
                    Some(msg) if msg.signal == Signal::Barrier => break,
                    Some(_) => continue,
                    None => anyhow::bail!("timed out waiting for the init barrier"),
                }
            }
            tracing::debug!(rank = local_rank, "init barrier: received root signal");
        }

        // the listen thread must not race the barrier receive above
        threads.push(dispatcher::start_listen_loop(&runtime));
        if runtime.config.monitor_interval_secs > 0 {
            threads.push(dispatcher::start_monitor_loop(&runtime));
        }
        *runtime.threads.lock() = threads;

        tracing::debug!(
            rank = runtime.topo.rank,
            local_rank,
            size = runtime.topo.size,
            local_size,
            worker_id,
            distributed = is_distributed,
            "runtime initialized"
        );

        if self.install_global {
            set_global(runtime.clone());
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runtime() -> Arc<Runtime> {
        let dir = tempfile::tempdir().unwrap();
        Runtime::builder()
            .config(RuntimeConfig::default())
            .shm_base_dir(dir.into_path())
            .launch()
            .unwrap()
    }

    #[test]
    fn test_launch_single_rank() {
        let rt = test_runtime();
        assert_eq!(rt.rank(), 0);
        assert_eq!(rt.local_size(), 1);
        assert!(rt.is_root_device());
        assert!(!rt.is_distributed());
        // partition bound is page aligned
        assert_eq!(rt.partition_bytes() as usize % page_size(), 0);
        rt.shutdown();
    }

    #[test]
    fn test_wait_for_shutdown() {
        let rt = test_runtime();
        assert!(!rt.wait_for_shutdown(Duration::from_millis(10)));
        rt.shutdown();
        assert!(rt.wait_for_shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_ps_unconfigured_is_precondition_error() {
        let rt = test_runtime();
        let err = rt.ps().unwrap_err();
        assert_eq!(err.kind(), crate::StatusKind::PreconditionError);
        rt.shutdown();
    }

    #[test]
    fn test_global_handle() {
        let rt = test_runtime();
        set_global(rt.clone());
        assert!(global().is_some());
        clear_global();
        assert!(global().is_none());
        rt.shutdown();
    }
}
