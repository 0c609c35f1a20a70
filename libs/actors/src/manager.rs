//! Module Manager
//!
//! Owns the worker pool and routes every message by address arithmetic
//! alone: the receiver's bits `[23:16]` select the worker inbox, nothing is
//! looked up. A receiver naming a worker that does not exist is dropped
//! without error.
//!
//! `ModuleManager` is a cheap cloneable handle. Modules reach it through
//! [`ModuleContext::manager`](crate::ModuleContext::manager), which holds a
//! weak reference, so placed modules never keep the runtime alive. Dropping
//! the last handle stops every worker.

use crate::address::{IdAllocator, ModuleId};
use crate::error::{Result, RuntimeError};
use crate::message::{Message, MessageType};
use crate::metrics::{RuntimeMetrics, RuntimeStats};
use crate::module::{Module, ModuleCell, ModuleContext};
use crate::worker::Worker;
use bytes::Bytes;
use dashmap::DashMap;
use fabric_config::defaults::runtime::MAX_WORKER_NUM;
use fabric_config::RuntimeConfig;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: RuntimeConfig,
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    ids: Arc<IdAllocator>,
    caches: DashMap<u32, Bytes>,
    next_cache: AtomicU32,
    metrics: Arc<RuntimeMetrics>,
    running: AtomicBool,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

/// Non-owning link from a module back to its manager
#[derive(Clone)]
pub(crate) struct ManagerRef(Weak<ManagerInner>);

impl ManagerRef {
    pub(crate) fn upgrade(&self) -> Option<ModuleManager> {
        self.0.upgrade().map(|inner| ModuleManager { inner })
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        ManagerRef(Weak::new())
    }
}

impl ModuleManager {
    /// Build from a flat `key:value;...` string. Missing or malformed keys
    /// are logged and defaulted.
    pub fn init(config: &str) -> Self {
        Self::new(RuntimeConfig::from_kv_str(config))
    }

    /// Create `worker_num` workers with indices `0..worker_num`. Threads
    /// start on [`run`](Self::run).
    pub fn new(mut config: RuntimeConfig) -> Self {
        let clamped = config.worker_num.clamp(1, MAX_WORKER_NUM);
        if clamped != config.worker_num {
            warn!(requested = config.worker_num, using = clamped, "Worker count clamped");
            config.worker_num = clamped;
        }

        let metrics = Arc::new(RuntimeMetrics::default());
        let ids = Arc::new(IdAllocator::new(config.machine_id));
        let interval = Duration::from_millis(config.update_interval_ms);

        let workers = (0..config.worker_num)
            .map(|i| Worker::new(i as u8, interval, Arc::clone(&metrics), Arc::clone(&ids)))
            .collect();

        info!(
            machine_id = config.machine_id,
            "ModuleManager initialized with {} worker threads",
            config.worker_num
        );

        Self {
            inner: Arc::new(ManagerInner {
                config,
                workers,
                next_worker: AtomicUsize::new(0),
                ids,
                caches: DashMap::new(),
                next_cache: AtomicU32::new(1),
                metrics,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Copy `data` into a new message and route it.
    ///
    /// # Panics
    ///
    /// If `msg_type` is [`MessageType::UNKNOWN`].
    pub fn send(
        &self,
        sender: ModuleId,
        receiver: ModuleId,
        data: &[u8],
        userdata: &str,
        rpc_id: u64,
        msg_type: MessageType,
    ) {
        self.send_ex(sender, receiver, Bytes::copy_from_slice(data), userdata, rpc_id, msg_type);
    }

    /// Route a pre-built payload without copying it.
    ///
    /// # Panics
    ///
    /// If `msg_type` is [`MessageType::UNKNOWN`].
    pub fn send_ex(
        &self,
        sender: ModuleId,
        receiver: ModuleId,
        data: Bytes,
        userdata: &str,
        rpc_id: u64,
        msg_type: MessageType,
    ) {
        assert!(!msg_type.is_unknown(), "send unknown type message!");

        let msg = Message::new(sender, receiver, msg_type, data)
            .with_userdata(userdata)
            .with_rpc_id(rpc_id);
        self.route(Arc::new(msg));
    }

    fn route(&self, msg: Arc<Message>) {
        match self.inner.workers.get(msg.receiver().worker_index() as usize) {
            Some(worker) => worker.dispatch_message(msg),
            None => {
                self.inner.metrics.record_drop();
                trace!(receiver = %msg.receiver(), "Receiver worker out of range, message dropped");
            }
        }
    }

    /// One shared message to every module on every worker, except `sender`.
    ///
    /// # Panics
    ///
    /// If `msg_type` is [`MessageType::UNKNOWN`].
    pub fn broadcast(&self, sender: ModuleId, data: &[u8], userdata: &str, msg_type: MessageType) {
        assert!(!msg_type.is_unknown(), "send unknown type message!");

        let msg = Arc::new(
            Message::new(sender, ModuleId::BROADCAST, msg_type, Bytes::copy_from_slice(data))
                .with_userdata(userdata),
        );
        self.inner.metrics.record_broadcast();
        for worker in &self.inner.workers {
            worker.broadcast(Arc::clone(&msg));
        }
    }

    /// Ask the owning worker to destroy and drop a module.
    pub fn remove_module(&self, id: ModuleId) {
        match self.inner.workers.get(id.worker_index() as usize) {
            Some(worker) => worker.remove_module(id),
            None => trace!(module_id = %id, "Remove for out-of-range worker ignored"),
        }
    }

    /// Round-robin placement cursor
    pub fn next_worker_id(&self) -> u8 {
        let next = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        (next % self.inner.workers.len()) as u8
    }

    /// Allocate an id for `module` and run its `init` on this thread.
    ///
    /// The module is placed on `worker` when given, otherwise on
    /// [`next_worker_id`](Self::next_worker_id).
    pub fn prepare_module(
        &self,
        module: Box<dyn Module>,
        config: &str,
        worker: Option<u8>,
    ) -> Result<ModuleCell> {
        let worker = worker.unwrap_or_else(|| self.next_worker_id());
        self.check_worker(worker)?;

        let id = self
            .inner
            .ids
            .allocate(worker)
            .ok_or(RuntimeError::IdExhausted { worker })?;

        let ctx = ModuleContext::new(id, ManagerRef(Arc::downgrade(&self.inner)));
        let mut cell = ModuleCell::new(module, ctx, Arc::clone(&self.inner.metrics));

        if !cell.init(config) {
            self.inner.ids.release(id);
            warn!(module_id = %id, "Module init rejected. config: {}", config);
            return Err(RuntimeError::InitRejected { module_id: id });
        }

        debug!(module_id = %id, name = cell.name(), worker, "Module initialized");
        Ok(cell)
    }

    /// Hand a prepared module to its worker; `start` runs there.
    pub fn add_module_to_worker(&self, worker: u8, cell: ModuleCell) -> Result<ModuleId> {
        let id = cell.id();
        if let Err(e) = self.check_worker(worker) {
            self.inner.ids.release(id);
            return Err(e);
        }
        if id.worker_index() != worker {
            self.inner.ids.release(id);
            return Err(RuntimeError::WorkerMismatch { module_id: id, worker });
        }

        self.inner.workers[worker as usize].add_module(cell)?;
        Ok(id)
    }

    /// [`prepare_module`](Self::prepare_module) followed by
    /// [`add_module_to_worker`](Self::add_module_to_worker).
    pub fn create_module(
        &self,
        module: Box<dyn Module>,
        config: &str,
        worker: Option<u8>,
    ) -> Result<ModuleId> {
        let cell = self.prepare_module(module, config, worker)?;
        let id = cell.id();
        self.add_module_to_worker(id.worker_index(), cell)
    }

    fn check_worker(&self, worker: u8) -> Result<()> {
        let count = self.inner.workers.len();
        if (worker as usize) < count {
            Ok(())
        } else {
            Err(RuntimeError::WorkerOutOfRange { worker, count })
        }
    }

    /// Register a payload for repeated zero-copy sends. It stays until
    /// [`release_cache`](Self::release_cache).
    pub fn create_cache(&self, data: impl Into<Bytes>) -> u32 {
        let cache_id = loop {
            let candidate = self.inner.next_cache.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !self.inner.caches.contains_key(&candidate) {
                break candidate;
            }
        };
        self.inner.caches.insert(cache_id, data.into());
        cache_id
    }

    /// Send a cached payload; every recipient shares the same storage.
    pub fn send_by_cache(
        &self,
        sender: ModuleId,
        receiver: ModuleId,
        cache_id: u32,
        userdata: &str,
        rpc_id: u64,
        msg_type: MessageType,
    ) -> Result<()> {
        let data = self
            .inner
            .caches
            .get(&cache_id)
            .map(|entry| entry.value().clone())
            .ok_or(RuntimeError::UnknownCache { cache_id })?;

        self.send_ex(sender, receiver, data, userdata, rpc_id, msg_type);
        Ok(())
    }

    /// Forget a cached payload. Messages already sent keep their reference.
    pub fn release_cache(&self, cache_id: u32) -> bool {
        self.inner.caches.remove(&cache_id).is_some()
    }

    pub fn cache_count(&self) -> usize {
        self.inner.caches.len()
    }

    /// Start every worker thread.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for worker in &self.inner.workers {
            if let Err(e) = worker.run() {
                for started in &self.inner.workers {
                    started.stop();
                }
                self.inner.running.store(false, Ordering::Release);
                return Err(e);
            }
        }

        info!("ModuleManager start");
        Ok(())
    }

    /// Stop and join every worker. Modules still placed are destroyed on
    /// their worker; later sends are dropped.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for worker in &self.inner.workers {
            worker.stop();
        }
        info!("ModuleManager stop");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.inner.workers
    }

    pub fn machine_id(&self) -> u8 {
        self.inner.config.machine_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Modules created and not yet removed, across every worker
    pub fn module_count(&self) -> usize {
        self.inner.ids.live_count()
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.inner.metrics
    }

    pub fn stats(&self) -> RuntimeStats {
        self.inner.metrics.snapshot()
    }
}
