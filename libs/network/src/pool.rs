//! I/O Execution Pool
//!
//! A fixed set of execution contexts, each a single-threaded tokio runtime
//! driven by one dedicated OS thread. New sessions are assigned round-robin
//! and never move: every read, write and close for a session runs on the
//! thread of the context that created it.
//!
//! # Ownership
//!
//! ```text
//! NetworkServicePool
//!  ├── ExecutionContext[i]   owns Runtime + thread
//!  │     └── Arc<ContextShared>  session registry, timeout, handle
//!  └── Arc<ContextRouter>    Arc<ContextShared> per context + cursor
//! ```
//!
//! Tasks only capture `Arc<ContextShared>` / `Arc<ContextRouter>`, never the
//! runtime itself, so dropping the pool shuts every runtime down and releases
//! the tasks with it.

use crate::delegate::SessionDelegate;
use crate::error::{NetworkError, Result};
use crate::metrics::{ContextMetrics, ContextStats};
use crate::session::{
    decode_context, encode_session_id, next_sequence, spawn_session, CloseReason, Session, SessionId,
    SEQUENCE_MASK,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// How long a stopping context waits for its sessions to report closed
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// State of one execution context that tasks may hold on to
pub struct ContextShared {
    index: u8,
    handle: Handle,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_sequence: AtomicU32,
    timeout_ms: AtomicU64,
    max_message_size: usize,
    metrics: ContextMetrics,
}

impl ContextShared {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn metrics(&self) -> &ContextMetrics {
        &self.metrics
    }

    fn advance_sequence(&self) -> u32 {
        let mut current = self.next_sequence.load(Ordering::Relaxed);
        loop {
            let next = next_sequence(current);
            match self.next_sequence.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Next id whose sequence is not held by a registered session
    fn free_session_id(&self, live: &HashMap<SessionId, Arc<Session>>) -> Option<SessionId> {
        (0..SEQUENCE_MASK)
            .map(|_| encode_session_id(self.index, self.advance_sequence()))
            .find(|id| !live.contains_key(id))
    }

    /// Pick a free id and register the session built for it under one lock.
    pub(crate) fn insert_new<F>(&self, build: F) -> Result<Arc<Session>>
    where
        F: FnOnce(SessionId) -> Arc<Session>,
    {
        let mut sessions = self.sessions.write();
        let Some(id) = self.free_session_id(&sessions) else {
            return Err(NetworkError::runtime(format!(
                "No free session id on execution context {}",
                self.index
            )));
        };
        let session = build(id);
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    /// Unregister `session`; a different session holding the same id stays.
    pub(crate) fn remove_session(&self, session: &Session) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(&session.id())
            .is_some_and(|stored| std::ptr::eq(Arc::as_ptr(stored), session))
        {
            sessions.remove(&session.id());
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Adopt a std stream connected elsewhere; it is re-registered with this
    /// context's reactor.
    pub fn adopt(
        self: &Arc<Self>,
        stream: std::net::TcpStream,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Result<SessionId> {
        stream
            .set_nonblocking(true)
            .map_err(|e| NetworkError::io("Failed to set socket non-blocking", e))?;

        let _guard = self.handle.enter();
        let stream = tokio::net::TcpStream::from_std(stream)
            .map_err(|e| NetworkError::io("Failed to register socket with execution context", e))?;
        let session = spawn_session(self, stream, delegate)?;
        Ok(session.id())
    }

    /// Register a stream that was created on this context.
    pub fn register(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Result<SessionId> {
        let _guard = self.handle.enter();
        let session = spawn_session(self, stream, delegate)?;
        Ok(session.id())
    }

    pub fn send(&self, id: SessionId, data: Bytes) -> Result<()> {
        match self.session(id) {
            Some(session) => session.send(data),
            None => Err(NetworkError::SessionNotFound { session_id: id }),
        }
    }

    pub fn close_session(&self, id: SessionId, reason: CloseReason) -> bool {
        match self.session(id) {
            Some(session) => session.close(reason),
            None => false,
        }
    }

    fn close_all(&self, reason: CloseReason) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.iter().filter(|s| s.close(reason)).count()
    }

    async fn drain(&self, limit: Duration) {
        let started = Instant::now();
        while self.session_count() > 0 && started.elapsed() < limit {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let remaining = self.session_count();
        if remaining > 0 {
            warn!(context = self.index, remaining, "Sessions still registered after drain");
        }
    }
}

/// Round-robin access to the shared half of every context
pub struct ContextRouter {
    contexts: Vec<Arc<ContextShared>>,
    cursor: AtomicUsize,
}

impl ContextRouter {
    /// Select the context for the next session
    pub fn poll(&self) -> &Arc<ContextShared> {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        &self.contexts[next]
    }

    pub fn get(&self, index: u8) -> Option<&Arc<ContextShared>> {
        self.contexts.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn owner_of(&self, id: SessionId) -> Option<&Arc<ContextShared>> {
        self.get(decode_context(id))
    }

    pub fn send(&self, id: SessionId, data: Bytes) -> Result<()> {
        match self.owner_of(id) {
            Some(ctx) => ctx.send(id, data),
            None => Err(NetworkError::SessionNotFound { session_id: id }),
        }
    }

    pub fn close_session(&self, id: SessionId, reason: CloseReason) -> bool {
        self.owner_of(id)
            .map(|ctx| ctx.close_session(id, reason))
            .unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        self.contexts.iter().map(|c| c.session_count()).sum()
    }

    pub fn stats(&self) -> ContextStats {
        self.contexts
            .iter()
            .map(|c| c.metrics().snapshot())
            .fold(ContextStats::default(), ContextStats::merge)
    }
}

/// One runtime plus the thread that drives it
pub struct ExecutionContext {
    shared: Arc<ContextShared>,
    runtime: Mutex<Option<Runtime>>,
    thread: Mutex<Option<JoinHandle<Runtime>>>,
    stop_signal: Arc<Notify>,
}

impl ExecutionContext {
    fn new(index: u8, max_message_size: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(format!("net-io-{}", index))
            .build()
            .map_err(|e| NetworkError::runtime_with_source("Failed to build execution context", e))?;

        let shared = Arc::new(ContextShared {
            index,
            handle: runtime.handle().clone(),
            sessions: RwLock::new(HashMap::new()),
            next_sequence: AtomicU32::new(0),
            timeout_ms: AtomicU64::new(0),
            max_message_size,
            metrics: ContextMetrics::default(),
        });

        Ok(Self {
            shared,
            runtime: Mutex::new(Some(runtime)),
            thread: Mutex::new(None),
            stop_signal: Arc::new(Notify::new()),
        })
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    fn run(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let Some(runtime) = self.runtime.lock().take() else {
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop_signal);
        let spawned = std::thread::Builder::new()
            .name(format!("net-io-{}", self.shared.index))
            .spawn(move || {
                debug!(context = shared.index, "Execution context started");
                runtime.block_on(stop.notified());
                runtime.block_on(shared.drain(DRAIN_TIMEOUT));
                debug!(context = shared.index, "Execution context stopped");
                runtime
            });

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => Err(NetworkError::runtime_with_source(
                format!("Failed to spawn thread for execution context {}", self.shared.index),
                e,
            )),
        }
    }

    fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        let closed = self.shared.close_all(CloseReason::Shutdown);
        debug!(context = self.shared.index, closed, "Closing sessions for shutdown");

        self.stop_signal.notify_one();
        match handle.join() {
            Ok(runtime) => *self.runtime.lock() = Some(runtime),
            Err(_) => error!(context = self.shared.index, "Execution context thread panicked"),
        }
    }
}

/// Fixed pool of execution contexts
pub struct NetworkServicePool {
    contexts: Vec<ExecutionContext>,
    router: Arc<ContextRouter>,
}

impl NetworkServicePool {
    /// Create `thread_num` contexts. Threads start on [`run`](Self::run).
    pub fn new(thread_num: usize, max_message_size: usize) -> Result<Self> {
        let count = thread_num.clamp(1, 256);
        if count != thread_num {
            warn!(requested = thread_num, using = count, "Network thread count clamped");
        }

        let contexts = (0..count)
            .map(|i| ExecutionContext::new(i as u8, max_message_size))
            .collect::<Result<Vec<_>>>()?;

        let router = Arc::new(ContextRouter {
            contexts: contexts.iter().map(|c| Arc::clone(c.shared())).collect(),
            cursor: AtomicUsize::new(0),
        });

        info!("NetworkServicePool initialized with {} execution contexts", count);
        Ok(Self { contexts, router })
    }

    pub fn router(&self) -> &Arc<ContextRouter> {
        &self.router
    }

    /// Round-robin context selection for a new session
    pub fn poll_context(&self) -> &Arc<ContextShared> {
        self.router.poll()
    }

    pub fn contexts(&self) -> &[ExecutionContext] {
        &self.contexts
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn send(&self, id: SessionId, data: Bytes) -> Result<()> {
        self.router.send(id, data)
    }

    pub fn close_session(&self, id: SessionId, reason: CloseReason) -> bool {
        self.router.close_session(id, reason)
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        for ctx in &self.contexts {
            ctx.shared().set_timeout(timeout_ms);
        }
    }

    pub fn run(&self) -> Result<()> {
        for ctx in &self.contexts {
            ctx.run()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        for ctx in &self.contexts {
            ctx.stop();
        }
    }
}

impl Drop for NetworkServicePool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn test_round_robin_assignment() {
        let pool = NetworkServicePool::new(3, 1024).unwrap();
        let picked: Vec<u8> = (0..6).map(|_| pool.poll_context().index()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_session_ids_encode_owner() {
        let pool = NetworkServicePool::new(2, 1024).unwrap();
        let ctx = pool.router().get(1).unwrap();
        let a = ctx.free_session_id(&HashMap::new()).unwrap();
        let b = ctx.free_session_id(&HashMap::new()).unwrap();
        assert_ne!(a, b);
        assert_eq!(decode_context(a), 1);
        assert_eq!(pool.router().owner_of(b).unwrap().index(), 1);
    }

    #[test]
    fn test_unknown_session_operations() {
        let pool = NetworkServicePool::new(1, 1024).unwrap();
        assert!(matches!(
            pool.send(encode_session_id(0, 99), Bytes::from_static(b"x")),
            Err(NetworkError::SessionNotFound { .. })
        ));
        assert!(!pool.close_session(encode_session_id(9, 1), CloseReason::Local));
    }

    #[test]
    fn test_run_stop_idempotent() {
        let pool = NetworkServicePool::new(2, 1024).unwrap();
        pool.run().unwrap();
        pool.run().unwrap();
        assert!(pool.contexts().iter().all(|c| c.is_running()));
        pool.stop();
        pool.stop();
        assert!(pool.contexts().iter().all(|c| !c.is_running()));
        // restart after a full stop
        pool.run().unwrap();
        pool.stop();
    }

    struct Discard;

    impl SessionDelegate for Discard {
        fn on_message(&self, _session_id: SessionId, _data: Bytes) {}
    }

    /// Server half of a fresh loopback connection, plus the client to keep it open
    fn loopback_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_wrapped_sequence_skips_live_session() {
        let pool = NetworkServicePool::new(1, 1024).unwrap();
        pool.run().unwrap();
        let ctx = Arc::clone(pool.router().get(0).unwrap());
        let delegate: Arc<dyn SessionDelegate> = Arc::new(Discard);

        let (server_a, _client_a) = loopback_pair();
        let first = ctx.adopt(server_a, Arc::clone(&delegate)).unwrap();
        assert_eq!(first, encode_session_id(0, 1));

        // the counter comes back around to the live session's sequence
        ctx.next_sequence.store(0, Ordering::Relaxed);
        let (server_b, _client_b) = loopback_pair();
        let second = ctx.adopt(server_b, Arc::clone(&delegate)).unwrap();
        assert_eq!(second, encode_session_id(0, 2));
        assert_eq!(ctx.session_count(), 2);
        assert!(ctx.session(first).unwrap().state() != SessionState::Closed);

        // closing the older session leaves the newer one reachable
        assert!(pool.close_session(first, CloseReason::Local));
        assert!(wait_for(|| ctx.session_count() == 1));
        assert!(ctx.session(first).is_none());
        pool.send(second, Bytes::from_static(b"still here")).unwrap();

        pool.stop();
    }

    #[test]
    fn test_timeout_propagates() {
        let pool = NetworkServicePool::new(3, 1024).unwrap();
        pool.set_timeout(2500);
        assert!(pool.router().contexts.iter().all(|c| c.timeout_ms() == 2500));
    }
}
