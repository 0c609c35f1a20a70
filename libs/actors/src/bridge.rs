//! Network to module bridge
//!
//! A [`SessionDelegate`] that turns session events into messages for one
//! target module. The session id travels in `rpc_id`, the sender is
//! [`ModuleId::BROADCAST`] (no module), and payloads are passed through
//! without copying.
//!
//! | event        | type             | payload        | userdata      |
//! |--------------|------------------|----------------|---------------|
//! | `on_connect` | `SOCKET_CONNECT` | peer address   | empty         |
//! | `on_message` | `SOCKET_DATA`    | frame bytes    | empty         |
//! | `on_close`   | `SOCKET_CLOSE`   | empty          | close reason  |

use crate::address::ModuleId;
use crate::manager::ModuleManager;
use crate::message::MessageType;
use bytes::Bytes;
use fabric_network::{CloseReason, SessionDelegate, SessionId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

pub struct ModuleSessionDelegate {
    manager: ModuleManager,
    target: AtomicU32,
}

impl ModuleSessionDelegate {
    /// Events are dropped until a target is set.
    pub fn new(manager: ModuleManager) -> Self {
        Self {
            manager,
            target: AtomicU32::new(0),
        }
    }

    pub fn with_target(manager: ModuleManager, target: ModuleId) -> Self {
        let delegate = Self::new(manager);
        delegate.set_target(target);
        delegate
    }

    pub fn set_target(&self, target: ModuleId) {
        self.target.store(target.raw(), Ordering::Release);
    }

    pub fn target(&self) -> Option<ModuleId> {
        match self.target.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ModuleId::from_raw(raw)),
        }
    }

    fn forward(&self, session_id: SessionId, msg_type: MessageType, data: Bytes, userdata: &str) {
        let Some(target) = self.target() else {
            trace!(session_id, msg_type = %msg_type, "No target module, session event dropped");
            return;
        };
        self.manager
            .send_ex(ModuleId::BROADCAST, target, data, userdata, session_id as u64, msg_type);
    }
}

impl SessionDelegate for ModuleSessionDelegate {
    fn on_connect(&self, session_id: SessionId, peer: SocketAddr) {
        self.forward(
            session_id,
            MessageType::SOCKET_CONNECT,
            Bytes::from(peer.to_string()),
            "",
        );
    }

    fn on_message(&self, session_id: SessionId, data: Bytes) {
        self.forward(session_id, MessageType::SOCKET_DATA, data, "");
    }

    fn on_close(&self, session_id: SessionId, reason: CloseReason) {
        self.forward(
            session_id,
            MessageType::SOCKET_CLOSE,
            Bytes::new(),
            &reason.to_string(),
        );
    }
}

/// Session id carried by a message the bridge produced
pub fn session_of(rpc_id: u64) -> SessionId {
    rpc_id as SessionId
}
