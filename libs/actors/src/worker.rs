//! Worker Threads
//!
//! Each worker owns a set of modules and one dedicated OS thread. Producers
//! on any thread push [`WorkerCommand`]s into the worker's unbounded inbox
//! without blocking; only the worker thread ever touches its modules.
//!
//! One tick:
//! 1. drain every command queued so far (dispatch, add, remove)
//! 2. deliver one message per module, round-robin, until every inbox is empty
//! 3. remove modules that asked to exit or faulted
//! 4. call `update` on every healthy module with update enabled
//!
//! Between ticks the thread blocks on the inbox for at most the update
//! interval.

use crate::address::{IdAllocator, ModuleId};
use crate::error::{Result, RuntimeError};
use crate::message::Message;
use crate::metrics::RuntimeMetrics;
use crate::module::ModuleCell;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Commands accepted by a worker inbox
pub(crate) enum WorkerCommand {
    Dispatch(Arc<Message>),
    Add(Box<ModuleCell>),
    Remove(ModuleId),
    Wake,
}

pub struct Worker {
    index: u8,
    sender: Sender<WorkerCommand>,
    receiver: Receiver<WorkerCommand>,
    stopping: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    update_interval: Duration,
    module_count: Arc<AtomicUsize>,
    metrics: Arc<RuntimeMetrics>,
    ids: Arc<IdAllocator>,
}

impl Worker {
    pub(crate) fn new(
        index: u8,
        update_interval: Duration,
        metrics: Arc<RuntimeMetrics>,
        ids: Arc<IdAllocator>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            index,
            sender,
            receiver,
            stopping: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            update_interval: update_interval.max(Duration::from_millis(1)),
            module_count: Arc::new(AtomicUsize::new(0)),
            metrics,
            ids,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Modules currently placed on this worker
    pub fn module_count(&self) -> usize {
        self.module_count.load(Ordering::Acquire)
    }

    /// Commands waiting in the inbox
    pub fn queue_len(&self) -> usize {
        self.receiver.len()
    }

    /// Queue `msg` for the module it is addressed to. Dropped once the
    /// worker is stopping.
    pub fn dispatch_message(&self, msg: Arc<Message>) {
        if self.stopping.load(Ordering::Acquire) {
            self.metrics.record_drop();
            trace!(worker = self.index, receiver = %msg.receiver(), "Worker stopped, message dropped");
            return;
        }
        self.metrics.record_dispatch();
        self.push(WorkerCommand::Dispatch(msg));
    }

    /// Queue a receiver-0 message for every local module except its sender.
    pub fn broadcast(&self, msg: Arc<Message>) {
        debug_assert!(msg.is_broadcast());
        self.dispatch_message(msg);
    }

    /// Queue `cell` for placement. A stopped worker refuses it and releases
    /// its id.
    pub(crate) fn add_module(&self, cell: ModuleCell) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            debug!(worker = self.index, module_id = %cell.id(), "Worker stopped, module discarded");
            self.ids.release(cell.id());
            return Err(RuntimeError::WorkerStopped { worker: self.index });
        }
        debug!(worker = self.index, module_id = %cell.id(), "Queueing module");
        self.push(WorkerCommand::Add(Box::new(cell)));
        Ok(())
    }

    pub(crate) fn remove_module(&self, id: ModuleId) {
        self.push(WorkerCommand::Remove(id));
    }

    fn push(&self, command: WorkerCommand) {
        // the worker holds its own receiver, so the channel never disconnects
        let _ = self.sender.send(command);
    }

    pub(crate) fn run(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        // commands that slipped past the stop flag after the last shutdown
        if self.stopping.swap(false, Ordering::AcqRel) {
            let discarded = discard_queued(self.index, &self.receiver, &self.metrics, &self.ids);
            if discarded > 0 {
                debug!(worker = self.index, discarded, "Discarded commands queued while stopped");
            }
        }

        let worker_loop = WorkerLoop {
            index: self.index,
            receiver: self.receiver.clone(),
            stopping: Arc::clone(&self.stopping),
            update_interval: self.update_interval,
            module_count: Arc::clone(&self.module_count),
            metrics: Arc::clone(&self.metrics),
            ids: Arc::clone(&self.ids),
            modules: BTreeMap::new(),
        };

        let handle = thread::Builder::new()
            .name(format!("fabric-worker-{}", self.index))
            .spawn(move || worker_loop.run())
            .map_err(|source| RuntimeError::ThreadSpawn {
                worker: self.index,
                source,
            })?;

        *thread = Some(handle);
        Ok(())
    }

    /// Stop the thread after its current drain and join it. Called from the
    /// worker's own thread, the join is skipped.
    pub(crate) fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        self.stopping.store(true, Ordering::Release);
        self.push(WorkerCommand::Wake);

        if handle.thread().id() == thread::current().id() {
            debug!(worker = self.index, "Worker stop requested from its own thread");
            return;
        }
        if handle.join().is_err() {
            error!(worker = self.index, "Worker thread panicked");
        }
    }
}

/// State owned by the worker thread
struct WorkerLoop {
    index: u8,
    receiver: Receiver<WorkerCommand>,
    stopping: Arc<AtomicBool>,
    update_interval: Duration,
    module_count: Arc<AtomicUsize>,
    metrics: Arc<RuntimeMetrics>,
    ids: Arc<IdAllocator>,
    modules: BTreeMap<ModuleId, ModuleCell>,
}

impl WorkerLoop {
    fn run(mut self) {
        info!(worker = self.index, "Worker started");
        let mut last_update = Instant::now();

        loop {
            match self.receiver.recv_timeout(self.update_interval) {
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // bounded by what is queued now, so a busy producer cannot starve update
            for _ in 0..self.receiver.len() {
                match self.receiver.try_recv() {
                    Ok(command) => self.handle(command),
                    Err(_) => break,
                }
            }

            self.deliver();
            self.sweep_exits();

            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            let interval_ms = now.duration_since(last_update).as_millis() as u64;
            last_update = now;
            for cell in self.modules.values_mut() {
                cell.update(interval_ms);
            }
            self.sweep_exits();
            self.metrics.record_tick();
        }

        self.shutdown();
        info!(worker = self.index, "Worker stopped");
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Dispatch(msg) => self.route(msg),
            WorkerCommand::Add(cell) => self.add(*cell),
            WorkerCommand::Remove(id) => {
                if let Some(cell) = self.modules.remove(&id) {
                    self.retire(cell);
                } else {
                    trace!(worker = self.index, module_id = %id, "Remove for unknown module");
                }
            }
            WorkerCommand::Wake => {}
        }
    }

    fn route(&mut self, msg: Arc<Message>) {
        if msg.is_broadcast() {
            let sender = msg.sender();
            for cell in self.modules.values_mut().filter(|cell| cell.id() != sender) {
                cell.push_message(Arc::clone(&msg));
            }
            return;
        }

        match self.modules.get_mut(&msg.receiver()) {
            Some(cell) => cell.push_message(msg),
            None => {
                self.metrics.record_drop();
                trace!(
                    worker = self.index,
                    receiver = %msg.receiver(),
                    msg_type = %msg.msg_type(),
                    "No such module, message dropped"
                );
            }
        }
    }

    fn add(&mut self, mut cell: ModuleCell) {
        let id = cell.id();
        if self.modules.contains_key(&id) {
            warn!(worker = self.index, module_id = %id, "Module id already placed, ignoring duplicate");
            return;
        }

        cell.start();
        self.metrics.record_start();
        self.modules.insert(id, cell);
        self.module_count.store(self.modules.len(), Ordering::Release);
        debug!(worker = self.index, module_id = %id, "Module started");
    }

    /// Round-robin single-message delivery until every inbox is empty.
    fn deliver(&mut self) {
        loop {
            let mut pending = false;
            for cell in self.modules.values_mut() {
                pending |= cell.peek_message();
            }
            if !pending {
                break;
            }
        }
    }

    fn sweep_exits(&mut self) {
        let exiting: Vec<ModuleId> = self
            .modules
            .values()
            .filter(|cell| cell.is_exit_requested())
            .map(|cell| cell.id())
            .collect();

        for id in exiting {
            if let Some(cell) = self.modules.remove(&id) {
                self.retire(cell);
            }
        }
    }

    fn retire(&mut self, mut cell: ModuleCell) {
        let id = cell.id();
        cell.destroy();
        self.ids.release(id);
        self.metrics.record_removal();
        self.module_count.store(self.modules.len(), Ordering::Release);
        debug!(worker = self.index, module_id = %id, ok = cell.is_ok(), "Module removed");
    }

    fn shutdown(&mut self) {
        let modules = std::mem::take(&mut self.modules);
        for (_, cell) in modules {
            self.retire(cell);
        }

        // anything that raced the stop flag
        discard_queued(self.index, &self.receiver, &self.metrics, &self.ids);
        self.module_count.store(0, Ordering::Release);
    }
}

/// Empty the inbox without running anything. Returns the number of
/// commands discarded.
fn discard_queued(
    index: u8,
    receiver: &Receiver<WorkerCommand>,
    metrics: &RuntimeMetrics,
    ids: &IdAllocator,
) -> usize {
    let mut discarded = 0;
    while let Ok(command) = receiver.try_recv() {
        match command {
            WorkerCommand::Dispatch(_) => metrics.record_drop(),
            WorkerCommand::Add(cell) => {
                debug!(worker = index, module_id = %cell.id(), "Discarding module queued during stop");
                ids.release(cell.id());
            }
            WorkerCommand::Remove(_) | WorkerCommand::Wake => continue,
        }
        discarded += 1;
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerRef;
    use crate::message::MessageType;
    use crate::module::{Module, ModuleContext};
    use bytes::Bytes;

    struct Idle;

    impl Module for Idle {
        fn on_message(&mut self, _ctx: &mut ModuleContext, _msg: &Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn worker() -> (Worker, Arc<RuntimeMetrics>, Arc<IdAllocator>) {
        let metrics = Arc::new(RuntimeMetrics::default());
        let ids = Arc::new(IdAllocator::new(1));
        let worker = Worker::new(0, Duration::from_millis(5), Arc::clone(&metrics), Arc::clone(&ids));
        (worker, metrics, ids)
    }

    fn cell(ids: &IdAllocator, metrics: &Arc<RuntimeMetrics>) -> ModuleCell {
        let id = ids.allocate(0).unwrap();
        ModuleCell::new(Box::new(Idle), ModuleContext::new(id, ManagerRef::detached()), Arc::clone(metrics))
    }

    #[test]
    fn test_add_after_stop_is_refused() {
        let (worker, metrics, ids) = worker();
        worker.run().unwrap();
        worker.stop();

        let err = worker.add_module(cell(&ids, &metrics)).unwrap_err();
        assert!(matches!(err, RuntimeError::WorkerStopped { worker: 0 }));
        assert_eq!(ids.live_count(), 0);
        assert_eq!(worker.queue_len(), 0);
    }

    #[test]
    fn test_restart_discards_commands_queued_while_stopped() {
        let (worker, metrics, ids) = worker();
        worker.run().unwrap();
        worker.stop();

        // a sender that read the stop flag before it was set pushes afterwards
        let stale = Message::new(
            ModuleId::BROADCAST,
            ModuleId::encode(1, 0, 1),
            MessageType::MODULE_DATA,
            Bytes::from_static(b"late"),
        );
        worker.push(WorkerCommand::Dispatch(Arc::new(stale)));
        worker.push(WorkerCommand::Add(Box::new(cell(&ids, &metrics))));
        assert_eq!(worker.queue_len(), 2);
        assert_eq!(ids.live_count(), 1);

        let dropped_before = metrics.snapshot().messages_dropped;
        worker.run().unwrap();
        assert_eq!(worker.queue_len(), 0);
        assert_eq!(metrics.snapshot().messages_dropped, dropped_before + 1);
        assert_eq!(ids.live_count(), 0);
        assert_eq!(worker.module_count(), 0);
        worker.stop();
    }

    #[test]
    fn test_modules_queued_before_first_run_are_started() {
        let (worker, metrics, ids) = worker();
        worker.add_module(cell(&ids, &metrics)).unwrap();
        worker.run().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.module_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(worker.module_count(), 1);
        worker.stop();
        assert_eq!(ids.live_count(), 0);
    }
}
