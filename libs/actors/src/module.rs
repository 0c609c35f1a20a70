//! Module Contract
//!
//! A module is a unit of processing that lives on exactly one worker thread.
//! It is driven through five hooks:
//!
//! - `init` runs once on the creating thread, before the module is placed
//! - `start` runs on the worker when the module is added
//! - `on_message` runs once per delivered message
//! - `update` runs once per worker tick when update is enabled
//! - `destroy` runs on removal, only if the module is still healthy
//!
//! The runtime wraps every module in a [`ModuleCell`], which owns the
//! private inbox and catches hook failures. A hook that returns `Err` or
//! panics marks the module not-ok; it receives nothing further and is
//! removed at the end of the current tick.

use crate::address::ModuleId;
use crate::error::Result;
use crate::manager::{ManagerRef, ModuleManager};
use crate::message::{Message, MessageType};
use crate::metrics::RuntimeMetrics;
use bytes::Bytes;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Hooks implemented by every module
pub trait Module: Send + 'static {
    /// Parse `config` and prepare. Returning false rejects the module.
    fn init(&mut self, _ctx: &mut ModuleContext, _config: &str) -> bool {
        true
    }

    fn start(&mut self, _ctx: &mut ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Periodic tick; `interval_ms` is the wall-clock time since the last one.
    fn update(&mut self, _ctx: &mut ModuleContext, _interval_ms: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctx: &mut ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_message(&mut self, ctx: &mut ModuleContext, msg: &Message) -> anyhow::Result<()>;
}

/// A module's view of itself and of the runtime
pub struct ModuleContext {
    id: ModuleId,
    name: String,
    enable_update: bool,
    ok: bool,
    exit_requested: bool,
    manager: ManagerRef,
}

impl ModuleContext {
    pub(crate) fn new(id: ModuleId, manager: ManagerRef) -> Self {
        Self {
            id,
            name: String::new(),
            enable_update: false,
            ok: true,
            exit_requested: false,
            manager,
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_enable_update(&mut self, enable: bool) {
        self.enable_update = enable;
    }

    pub fn is_enable_update(&self) -> bool {
        self.enable_update
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Index of the worker this module runs on
    pub fn worker_index(&self) -> u8 {
        self.id.worker_index()
    }

    /// Handle to the owning manager, `None` once it has been dropped
    pub fn manager(&self) -> Option<ModuleManager> {
        self.manager.upgrade()
    }

    pub fn send(&self, receiver: ModuleId, data: &[u8], userdata: &str, rpc_id: u64, msg_type: MessageType) {
        if let Some(manager) = self.manager() {
            manager.send(self.id, receiver, data, userdata, rpc_id, msg_type);
        }
    }

    /// Send a payload registered with [`create_cache`](Self::create_cache).
    pub fn send_by_cache(
        &self,
        receiver: ModuleId,
        cache_id: u32,
        userdata: &str,
        rpc_id: u64,
        msg_type: MessageType,
    ) -> Result<()> {
        match self.manager() {
            Some(manager) => manager.send_by_cache(self.id, receiver, cache_id, userdata, rpc_id, msg_type),
            None => Ok(()),
        }
    }

    /// Send to every module except this one.
    pub fn broadcast(&self, data: &[u8], userdata: &str, msg_type: MessageType) {
        if let Some(manager) = self.manager() {
            manager.broadcast(self.id, data, userdata, msg_type);
        }
    }

    pub fn create_cache(&self, data: impl Into<Bytes>) -> Option<u32> {
        self.manager().map(|manager| manager.create_cache(data))
    }

    /// Ask to be removed. Takes effect at the end of the current tick.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested
    }
}

/// Runtime-owned wrapper around one module
pub struct ModuleCell {
    module: Box<dyn Module>,
    ctx: ModuleContext,
    inbox: VecDeque<Arc<Message>>,
    metrics: Arc<RuntimeMetrics>,
}

impl ModuleCell {
    pub(crate) fn new(module: Box<dyn Module>, ctx: ModuleContext, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            module,
            ctx,
            inbox: VecDeque::new(),
            metrics,
        }
    }

    pub fn id(&self) -> ModuleId {
        self.ctx.id
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn is_ok(&self) -> bool {
        self.ctx.ok
    }

    pub fn is_exit_requested(&self) -> bool {
        self.ctx.exit_requested
    }

    pub fn push_message(&mut self, msg: Arc<Message>) {
        self.inbox.push_back(msg);
    }

    /// Handle at most one queued message. Returns true while more remain.
    pub fn peek_message(&mut self) -> bool {
        if !self.ctx.ok || self.ctx.exit_requested {
            self.inbox.clear();
            return false;
        }

        let Some(msg) = self.inbox.pop_front() else {
            return false;
        };

        let started = Instant::now();
        if self.guard("on_message", |module, ctx| module.on_message(ctx, &msg)) {
            self.metrics.record_delivery(started.elapsed());
        }

        self.ctx.ok && !self.ctx.exit_requested && !self.inbox.is_empty()
    }

    pub fn mq_size(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn init(&mut self, config: &str) -> bool {
        let Self { module, ctx, .. } = self;
        match panic::catch_unwind(AssertUnwindSafe(|| module.init(ctx, config))) {
            Ok(accepted) => accepted,
            Err(payload) => {
                error!(
                    module_id = %self.ctx.id,
                    "Module init panicked: {}",
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }

    pub(crate) fn start(&mut self) {
        self.guard("start", |module, ctx| module.start(ctx));
    }

    pub(crate) fn update(&mut self, interval_ms: u64) {
        if self.ctx.ok && self.ctx.enable_update && !self.ctx.exit_requested {
            self.guard("update", |module, ctx| module.update(ctx, interval_ms));
        }
    }

    /// Runs `destroy` unless the module already faulted.
    pub(crate) fn destroy(&mut self) {
        if self.ctx.ok {
            self.guard("destroy", |module, ctx| module.destroy(ctx));
        } else {
            debug!(module_id = %self.ctx.id, "Skipping destroy for faulted module");
        }
        self.inbox.clear();
    }

    fn guard<F>(&mut self, hook: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut dyn Module, &mut ModuleContext) -> anyhow::Result<()>,
    {
        let Self { module, ctx, .. } = self;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| f(module.as_mut(), ctx))) {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        self.ctx.ok = false;
        self.ctx.exit_requested = true;
        self.metrics.record_fault();
        error!(
            module_id = %self.ctx.id,
            name = %self.ctx.name,
            hook,
            "Module fault: {}",
            failure
        );
        false
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
