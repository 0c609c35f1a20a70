//! Network Frame
//!
//! Listen, accept and dial on top of the [`NetworkServicePool`]. Every new
//! session is pinned to one execution context and announced to the
//! registered [`SessionDelegate`].
//!
//! Error policy:
//! - resolve and socket-open failures in [`NetworkFrame::listen`] are
//!   returned as `Err`
//! - option, bind and listen failures are recorded and logged; the frame
//!   stays non-listening
//! - an accept failure is recorded and stops the accept loop for good
//! - a failed dial affects only that attempt
//!
//! The last recorded failure is available from [`NetworkFrame::error_code`]
//! and [`NetworkFrame::error_message`].
//!
//! The frame owns runtimes; drop it from a plain thread, not from inside an
//! async task.

use crate::delegate::SessionDelegate;
use crate::error::{NetworkError, Result};
use crate::metrics::ContextStats;
use crate::pool::{ContextRouter, NetworkServicePool};
use crate::session::{CloseReason, SessionId, INVALID_SESSION};
use bytes::Bytes;
use fabric_config::defaults::network::LISTEN_BACKLOG;
use fabric_config::NetworkConfig;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Last recorded transport failure
#[derive(Debug, Default)]
pub struct LastError {
    inner: Mutex<Option<(i32, String)>>,
}

impl LastError {
    pub fn record(&self, err: &io::Error) {
        let code = err.raw_os_error().unwrap_or(-1);
        *self.inner.lock() = Some((code, err.to_string()));
    }

    pub fn code(&self) -> i32 {
        self.inner.lock().as_ref().map(|(code, _)| *code).unwrap_or(0)
    }

    pub fn message(&self) -> String {
        self.inner
            .lock()
            .as_ref()
            .map(|(_, message)| message.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }
}

struct PendingListener {
    listener: TcpListener,
    context: u8,
}

/// TCP front end of the fabric
pub struct NetworkFrame {
    pool: NetworkServicePool,
    delegate: Arc<dyn SessionDelegate>,
    pending: Mutex<Option<PendingListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    last_error: Arc<LastError>,
    listen_failed: AtomicBool,
    open: AtomicBool,
}

impl NetworkFrame {
    /// Create a frame with `thread_num` execution contexts.
    pub fn new(delegate: Arc<dyn SessionDelegate>, thread_num: usize) -> Result<Self> {
        let config = NetworkConfig {
            thread_num,
            ..Default::default()
        };
        Self::with_config(delegate, &config)
    }

    pub fn with_config(delegate: Arc<dyn SessionDelegate>, config: &NetworkConfig) -> Result<Self> {
        let pool = NetworkServicePool::new(config.thread_num, config.max_message_size)?;
        pool.set_timeout(config.timeout_ms);

        Ok(Self {
            pool,
            delegate,
            pending: Mutex::new(None),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            last_error: Arc::new(LastError::default()),
            listen_failed: AtomicBool::new(false),
            open: AtomicBool::new(false),
        })
    }

    /// Resolve `ip:port`, then open, configure, bind and listen.
    pub fn listen(&self, ip: &str, port: &str) -> Result<()> {
        let endpoint = match resolve(ip, port) {
            Ok(addrs) => addrs[0],
            Err(e) => {
                self.last_error.record(&e);
                self.listen_failed.store(true, Ordering::Release);
                return Err(NetworkError::resolve(ip, port, e));
            }
        };

        let ctx = self.pool.poll_context();
        let _guard = ctx.handle().enter();

        let opened = if endpoint.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                self.last_error.record(&e);
                self.listen_failed.store(true, Ordering::Release);
                return Err(NetworkError::socket_open(ip, port, e));
            }
        };

        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("acceptor set SO_REUSEADDR failed: {}. address:{} port:{}", e, ip, port);
            self.fail_listen(&e);
            return Ok(());
        }

        if let Err(e) = socket.bind(endpoint) {
            warn!("acceptor bind failed: {}. address:{} port:{}", e, ip, port);
            self.fail_listen(&e);
            return Ok(());
        }

        let listener = match socket.listen(LISTEN_BACKLOG) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("acceptor listen failed: {}. address:{} port:{}", e, ip, port);
                self.fail_listen(&e);
                return Ok(());
            }
        };

        let bound = listener.local_addr().ok();
        *self.local_addr.lock() = bound;
        *self.pending.lock() = Some(PendingListener {
            listener,
            context: ctx.index(),
        });
        self.listen_failed.store(false, Ordering::Release);

        info!(address = ?bound, context = ctx.index(), "Listening");
        Ok(())
    }

    fn fail_listen(&self, err: &io::Error) {
        self.last_error.record(err);
        self.listen_failed.store(true, Ordering::Release);
    }

    /// Start the accept loop on the listener's context.
    fn post_accept(&self) {
        let Some(PendingListener { listener, context }) = self.pending.lock().take() else {
            return;
        };
        let Some(ctx) = self.pool.router().get(context) else {
            return;
        };

        let task = ctx.handle().spawn(accept_loop(
            listener,
            Arc::clone(self.pool.router()),
            Arc::clone(&self.delegate),
            Arc::clone(&self.last_error),
        ));
        *self.accept_task.lock() = Some(task);
    }

    /// Dial without blocking; the session is registered on success.
    pub fn async_connect(&self, ip: &str, port: &str) {
        let addrs = match resolve(ip, port) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("resolve endpoint failed: {}. address:{} port:{}", e, ip, port);
                self.last_error.record(&e);
                return;
            }
        };

        let ctx = Arc::clone(self.pool.poll_context());
        let delegate = Arc::clone(&self.delegate);
        let last_error = Arc::clone(&self.last_error);
        let (ip, port) = (ip.to_string(), port.to_string());

        let handle = ctx.handle().clone();
        handle.spawn(async move {
            match TcpStream::connect(&addrs[..]).await {
                Ok(stream) => match ctx.register(stream, delegate) {
                    Ok(id) => debug!(session_id = id, "Async connect succeeded. address:{} port:{}", ip, port),
                    Err(e) => warn!(error = %e, "Failed to register dialed session"),
                },
                Err(e) => {
                    warn!("connect failed: {}. address:{} port:{}", e, ip, port);
                    last_error.record(&e);
                }
            }
        });
    }

    /// Dial and block the calling thread until the connect completes.
    ///
    /// Returns [`INVALID_SESSION`] on failure; the reason is then available
    /// from [`error_code`](Self::error_code). Never call this from a worker
    /// tick.
    pub fn sync_connect(&self, ip: &str, port: &str) -> SessionId {
        let addrs = match resolve(ip, port) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("resolve endpoint failed: {}. address:{} port:{}", e, ip, port);
                self.last_error.record(&e);
                return INVALID_SESSION;
            }
        };

        let stream = match std::net::TcpStream::connect(&addrs[..]) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("connect failed: {}. address:{} port:{}", e, ip, port);
                self.last_error.record(&e);
                return INVALID_SESSION;
            }
        };

        let ctx = self.pool.poll_context();
        match ctx.adopt(stream, Arc::clone(&self.delegate)) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Failed to register connected session");
                if let Some(source) = e.io_source() {
                    self.last_error.record(source);
                }
                INVALID_SESSION
            }
        }
    }

    /// Queue a frame on the owning context.
    pub fn send(&self, session_id: SessionId, data: Bytes) -> Result<()> {
        self.pool.send(session_id, data)
    }

    /// Request close of a session. Returns false for unknown or already
    /// closing sessions. With [`CloseReason::Local`] frames already queued by
    /// [`send`](Self::send) are written before the connection shuts down.
    pub fn close_session(&self, session_id: SessionId, reason: CloseReason) -> bool {
        self.pool.close_session(session_id, reason)
    }

    /// Start every context thread and the accept loop.
    pub fn run(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.listen_failed.load(Ordering::Acquire) {
            error!(
                "NetworkFrame listen setup failed: {}; running without acceptor",
                self.last_error.message()
            );
        }

        if let Err(e) = self.pool.run() {
            self.open.store(false, Ordering::Release);
            return Err(e);
        }
        self.post_accept();

        info!("NetworkFrame start succeed");
        Ok(())
    }

    /// Stop accepting, close every session, and join every context thread.
    pub fn stop(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.pending.lock().take();
        *self.local_addr.lock() = None;

        self.pool.stop();

        let code = self.last_error.code();
        if code != 0 {
            info!("NetworkFrame stop: {}", self.last_error.message());
        } else {
            info!("NetworkFrame stop: OK");
        }
    }

    /// Propagate an idle-session timeout (milliseconds, 0 disables) to every
    /// context.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.pool.set_timeout(timeout_ms);
    }

    /// OS error code of the last failure, 0 when none
    pub fn error_code(&self) -> i32 {
        self.last_error.code()
    }

    pub fn error_message(&self) -> String {
        self.last_error.message()
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.pool.router().session_count()
    }

    pub fn stats(&self) -> ContextStats {
        self.pool.router().stats()
    }

    pub fn thread_num(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for NetworkFrame {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Inbound connections for the accept loop
trait ConnectionSource: Send + 'static {
    fn next_connection(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl ConnectionSource for TcpListener {
    fn next_connection(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        self.accept()
    }
}

/// Re-arm after every accepted connection; the first accept error is
/// recorded and ends the loop.
async fn accept_loop<S: ConnectionSource>(
    mut source: S,
    router: Arc<ContextRouter>,
    delegate: Arc<dyn SessionDelegate>,
    last_error: Arc<LastError>,
) {
    loop {
        match source.next_connection().await {
            Ok((stream, peer)) => {
                let target = router.poll();
                let adopted = stream
                    .into_std()
                    .map_err(|e| NetworkError::io("Failed to detach accepted socket", e))
                    .and_then(|std_stream| target.adopt(std_stream, Arc::clone(&delegate)));

                match adopted {
                    Ok(id) => debug!(session_id = id, peer = %peer, context = target.index(), "Accepted session"),
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to register accepted session"),
                }
            }
            Err(e) => {
                error!("accept failed: {}; listener stops accepting", e);
                last_error.record(&e);
                return;
            }
        }
    }
}

/// Resolve `host:port` with standard name and service resolution.
fn resolve(host: &str, port: &str) -> io::Result<Vec<SocketAddr>> {
    let port_num: u16 = port
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port '{}'", port)))?;

    let addrs: Vec<SocketAddr> = (host, port_num).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for '{}'", host),
        ));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[test]
    fn test_resolve_loopback() {
        let addrs = resolve("127.0.0.1", "8080").unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_resolve_rejects_bad_port() {
        let err = resolve("127.0.0.1", "http-ish").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    struct Discard;

    impl SessionDelegate for Discard {
        fn on_message(&self, _session_id: SessionId, _data: Bytes) {}
    }

    /// Hands out queued accept results, then waits forever
    struct Scripted(VecDeque<io::Result<(TcpStream, SocketAddr)>>);

    impl ConnectionSource for Scripted {
        async fn next_connection(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            match self.0.pop_front() {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    #[test]
    fn test_accept_error_stops_listener() {
        let pool = NetworkServicePool::new(1, 1024).unwrap();
        let last_error = Arc::new(LastError::default());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let finished = runtime.block_on(async {
            let pending = TcpStream::from_std(server).unwrap();
            let script = Scripted(VecDeque::from([
                Err(io::Error::from_raw_os_error(24)),
                Ok((pending, peer)),
            ]));
            tokio::time::timeout(
                Duration::from_secs(5),
                accept_loop(
                    script,
                    Arc::clone(pool.router()),
                    Arc::new(Discard),
                    Arc::clone(&last_error),
                ),
            )
            .await
        });

        assert!(finished.is_ok(), "accept loop kept running after an accept error");
        assert_eq!(last_error.code(), 24);
        assert_eq!(pool.router().session_count(), 0);
        drop(runtime);
    }

    #[test]
    fn test_last_error_starts_clear() {
        let last = LastError::default();
        assert_eq!(last.code(), 0);
        assert!(last.message().is_empty());

        last.record(&io::Error::from_raw_os_error(111));
        assert_eq!(last.code(), 111);
        assert!(!last.message().is_empty());

        last.clear();
        assert_eq!(last.code(), 0);
    }
}
