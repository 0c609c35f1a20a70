//! Session event sink.

use crate::session::{CloseReason, SessionId};
use bytes::Bytes;
use std::net::SocketAddr;

/// Receives session events from the execution contexts.
///
/// Callbacks run on the session's own execution-context thread. Handing the
/// data to another thread (for example a module worker) must go through a
/// non-blocking enqueue.
pub trait SessionDelegate: Send + Sync + 'static {
    /// A session was accepted or dialed and is now open
    fn on_connect(&self, _session_id: SessionId, _peer: SocketAddr) {}

    /// One complete frame arrived
    fn on_message(&self, session_id: SessionId, data: Bytes);

    /// The session reached `Closed`; called exactly once per opened session
    fn on_close(&self, _session_id: SessionId, _reason: CloseReason) {}
}
