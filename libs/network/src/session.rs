//! Per-connection sessions
//!
//! A session wraps one TCP stream and stays on the execution context that
//! created it. Two tasks run on that context: a reader that decodes
//! length-prefixed frames and hands them to the [`SessionDelegate`], and a
//! writer that drains the outbound queue. Both hold an `Arc<Session>` and
//! check the session state before acting, so a completion that races a close
//! never touches a torn-down connection.
//!
//! # Wire format
//!
//! ```text
//! ┌──────────────────┬─────────────────────────┐
//! │ length: u32 (BE) │ payload: `length` bytes │
//! └──────────────────┴─────────────────────────┘
//! ```

use crate::delegate::SessionDelegate;
use crate::error::{NetworkError, Result};
use crate::pool::ContextShared;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Session identifier: `[31:24]` owning context, `[23:0]` sequence
pub type SessionId = u32;

/// Returned by `sync_connect` on failure; never assigned to a live session
pub const INVALID_SESSION: SessionId = 0;

pub(crate) const SEQUENCE_MASK: u32 = 0x00FF_FFFF;

/// Build a session id owned by `context`
#[inline]
pub fn encode_session_id(context: u8, sequence: u32) -> SessionId {
    ((context as u32) << 24) | (sequence & SEQUENCE_MASK)
}

/// Index of the execution context that owns `id`
#[inline]
pub fn decode_context(id: SessionId) -> u8 {
    (id >> 24) as u8
}

/// Next non-zero 24-bit sequence after `current`
#[inline]
pub(crate) fn next_sequence(current: u32) -> u32 {
    let next = current.wrapping_add(1) & SEQUENCE_MASK;
    if next == 0 {
        1
    } else {
        next
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for SessionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close_session` was called locally
    Local,
    /// The peer closed the connection
    Remote,
    /// No frame arrived within the idle timeout
    Timeout,
    /// A read, write or framing error
    Error,
    /// The owning execution context is stopping
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Local => "local",
            CloseReason::Remote => "remote",
            CloseReason::Timeout => "timeout",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Shared handle to one connection
pub struct Session {
    id: SessionId,
    context_index: u8,
    peer_addr: SocketAddr,
    state: AtomicU8,
    /// Set once `on_connect` was delivered; gates `on_close`
    opened: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    /// Set by a local close; the writer sends what is queued before shutdown
    flush_on_close: AtomicBool,
    writer: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
    max_message_size: usize,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("context_index", &self.context_index)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn context_index(&self) -> u8 {
        self.context_index
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queue one frame for the writer task.
    pub fn send(&self, data: Bytes) -> Result<()> {
        match self.state() {
            SessionState::Connecting | SessionState::Open => {}
            _ => return Err(NetworkError::SessionClosed { session_id: self.id }),
        }

        if data.len() > self.max_message_size {
            return Err(NetworkError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                data.len(),
                self.max_message_size
            )));
        }

        self.writer
            .send(data)
            .map_err(|_| NetworkError::SessionClosed { session_id: self.id })
    }

    /// Request close. Returns false when the session was already closing.
    ///
    /// A `Local` close still writes frames queued by earlier `send` calls;
    /// every other reason drops them.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match SessionState::from(current) {
                SessionState::Connecting | SessionState::Open => {}
                _ => return false,
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        *self.close_reason.lock() = Some(reason);
        if reason == CloseReason::Local {
            self.flush_on_close.store(true, Ordering::Release);
        }
        self.shutdown.send_replace(true);
        debug!(session_id = self.id, reason = %reason, "Session closing");
        true
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `Closed` exactly once, unregister, and notify the delegate.
    fn finish(&self, fallback: CloseReason, ctx: &ContextShared, delegate: &dyn SessionDelegate) {
        let previous = SessionState::from(self.state.swap(SessionState::Closed as u8, Ordering::AcqRel));
        if previous == SessionState::Closed {
            return;
        }

        let reason = self.close_reason.lock().take().unwrap_or(fallback);
        self.shutdown.send_replace(true);
        ctx.remove_session(self);
        ctx.metrics().record_close();

        debug!(
            session_id = self.id,
            context = self.context_index,
            peer = %self.peer_addr,
            reason = %reason,
            "Session closed"
        );

        if self.opened.load(Ordering::Acquire) {
            delegate.on_close(self.id, reason);
        }
    }
}

/// Register `stream` as a new session on `ctx` and spawn its tasks.
///
/// Must be called with `ctx`'s runtime entered, since the stream is already
/// registered with that runtime's reactor.
pub(crate) fn spawn_session(
    ctx: &Arc<ContextShared>,
    stream: tokio::net::TcpStream,
    delegate: Arc<dyn SessionDelegate>,
) -> Result<Arc<Session>> {
    let peer_addr = stream
        .peer_addr()
        .map_err(|e| NetworkError::connection_with_source("Failed to get peer address", None, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let (reader, writer) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session = ctx.insert_new(|id| {
        Arc::new(Session {
            id,
            context_index: ctx.index(),
            peer_addr,
            state: AtomicU8::new(SessionState::Connecting as u8),
            opened: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            flush_on_close: AtomicBool::new(false),
            writer: write_tx,
            shutdown: shutdown_tx,
            max_message_size: ctx.max_message_size(),
        })
    })?;
    ctx.metrics().record_open();

    ctx.handle().spawn(read_loop(
        Arc::clone(&session),
        reader,
        Arc::clone(ctx),
        Arc::clone(&delegate),
        shutdown_rx.clone(),
    ));
    ctx.handle().spawn(write_loop(
        Arc::clone(&session),
        writer,
        write_rx,
        Arc::clone(ctx),
        shutdown_rx,
    ));

    debug!(
        session_id = session.id,
        context = session.context_index,
        peer = %peer_addr,
        "Session registered"
    );
    Ok(session)
}

enum ReadOutcome {
    Frame(Bytes),
    Eof,
    Timeout,
    Failed(NetworkError),
}

async fn read_with_timeout(reader: &mut OwnedReadHalf, max_size: usize, timeout_ms: u64) -> ReadOutcome {
    let read = read_frame(reader, max_size);
    let result = if timeout_ms == 0 {
        read.await
    } else {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), read).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::Timeout,
        }
    };

    match result {
        Ok(Some(frame)) => ReadOutcome::Frame(frame),
        Ok(None) => ReadOutcome::Eof,
        Err(e) => ReadOutcome::Failed(e),
    }
}

async fn read_loop(
    session: Arc<Session>,
    mut reader: OwnedReadHalf,
    ctx: Arc<ContextShared>,
    delegate: Arc<dyn SessionDelegate>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !session.transition(SessionState::Connecting, SessionState::Open) {
        session.finish(CloseReason::Local, &ctx, delegate.as_ref());
        return;
    }
    session.opened.store(true, Ordering::Release);
    delegate.on_connect(session.id, session.peer_addr);

    let reason = loop {
        if *shutdown.borrow() {
            break CloseReason::Local;
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => break CloseReason::Local,
            outcome = read_with_timeout(&mut reader, ctx.max_message_size(), ctx.timeout_ms()) => outcome,
        };

        match outcome {
            ReadOutcome::Frame(frame) => {
                // A close may have landed while the read was in flight
                if !session.is_open() {
                    break CloseReason::Local;
                }
                ctx.metrics().record_receive(frame.len());
                trace!(session_id = session.id, bytes = frame.len(), "Received frame");
                delegate.on_message(session.id, frame);
            }
            ReadOutcome::Eof => break CloseReason::Remote,
            ReadOutcome::Timeout => {
                debug!(session_id = session.id, timeout_ms = ctx.timeout_ms(), "Session idle timeout");
                break CloseReason::Timeout;
            }
            ReadOutcome::Failed(e) => {
                ctx.metrics().record_error();
                debug!(session_id = session.id, error = %e, "Session read failed");
                break CloseReason::Error;
            }
        }
    };

    session.finish(reason, &ctx, delegate.as_ref());
}

async fn write_loop(
    session: Arc<Session>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    ctx: Arc<ContextShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut held = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            next = outbound.recv() => next,
        };

        let Some(data) = next else { break };

        if session.state() != SessionState::Open && session.state() != SessionState::Connecting {
            held = Some(data);
            break;
        }

        if let Err(e) = write_frame(&mut writer, &mut buffer, &data).await {
            ctx.metrics().record_error();
            debug!(session_id = session.id, error = %e, "Session write failed");
            session.close(CloseReason::Error);
            break;
        }
        ctx.metrics().record_send(data.len());
    }

    if session.flush_on_close.load(Ordering::Acquire) {
        while let Some(data) = held.take().or_else(|| outbound.try_recv().ok()) {
            if let Err(e) = write_frame(&mut writer, &mut buffer, &data).await {
                debug!(session_id = session.id, error = %e, "Flush on close failed");
                break;
            }
            ctx.metrics().record_send(data.len());
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(session_id = session.id, "Error shutting down write half: {}", e);
    }
}

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::io("Failed to read frame length", e)),
    }

    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len > max_size {
        return Err(NetworkError::protocol(format!(
            "Frame size {} exceeds maximum {}",
            frame_len, max_size
        )));
    }

    let mut payload = BytesMut::zeroed(frame_len);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetworkError::io("Failed to read frame payload", e))?;

    Ok(Some(payload.freeze()))
}

/// Write one length-prefixed frame using `buffer` as scratch space.
pub async fn write_frame<W>(writer: &mut W, buffer: &mut BytesMut, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    buffer.clear();
    buffer.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buffer.extend_from_slice(data);

    writer
        .write_all(buffer)
        .await
        .map_err(|e| NetworkError::io("Failed to write frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::io("Failed to flush frame", e))?;
    Ok(())
}
