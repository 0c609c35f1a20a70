//! Message Envelope
//!
//! Built once per send and shared as `Arc<Message>`; a broadcast hands the
//! same envelope to every recipient.

use crate::address::ModuleId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 8-bit message kind. `0` is reserved and never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const UNKNOWN: MessageType = MessageType(0);
    /// A network session opened
    pub const SOCKET_CONNECT: MessageType = MessageType(1);
    /// Bytes received on a network session
    pub const SOCKET_DATA: MessageType = MessageType(2);
    /// A network session closed
    pub const SOCKET_CLOSE: MessageType = MessageType(3);
    /// Plain module-to-module traffic
    pub const MODULE_DATA: MessageType = MessageType(4);
    /// Module request expecting a reply keyed by `rpc_id`
    pub const MODULE_RPC: MessageType = MessageType(5);
    /// Payload a module wants written back to a client session
    pub const TO_CLIENT: MessageType = MessageType(6);

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNKNOWN => f.write_str("unknown"),
            Self::SOCKET_CONNECT => f.write_str("socket_connect"),
            Self::SOCKET_DATA => f.write_str("socket_data"),
            Self::SOCKET_CLOSE => f.write_str("socket_close"),
            Self::MODULE_DATA => f.write_str("module_data"),
            Self::MODULE_RPC => f.write_str("module_rpc"),
            Self::TO_CLIENT => f.write_str("to_client"),
            MessageType(other) => write!(f, "type-{}", other),
        }
    }
}

/// Immutable envelope routed between modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: ModuleId,
    receiver: ModuleId,
    msg_type: MessageType,
    payload: Bytes,
    userdata: String,
    rpc_id: u64,
}

impl Message {
    pub fn new(sender: ModuleId, receiver: ModuleId, msg_type: MessageType, payload: Bytes) -> Self {
        Self {
            sender,
            receiver,
            msg_type,
            payload,
            userdata: String::new(),
            rpc_id: 0,
        }
    }

    pub fn with_userdata(mut self, userdata: impl Into<String>) -> Self {
        self.userdata = userdata.into();
        self
    }

    pub fn with_rpc_id(mut self, rpc_id: u64) -> Self {
        self.rpc_id = rpc_id;
        self
    }

    pub fn sender(&self) -> ModuleId {
        self.sender
    }

    /// Destination; [`ModuleId::BROADCAST`] for a broadcast
    pub fn receiver(&self) -> ModuleId {
        self.receiver
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn userdata(&self) -> &str {
        &self.userdata
    }

    pub fn rpc_id(&self) -> u64 {
        self.rpc_id
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_broadcast()
    }

    /// Payload as UTF-8, if it is
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fields() {
        let msg = Message::new(
            ModuleId::from_raw(0x0100_0001),
            ModuleId::from_raw(0x0101_0002),
            MessageType::MODULE_RPC,
            Bytes::from_static(b"ping"),
        )
        .with_userdata("reply-to")
        .with_rpc_id(99);

        assert_eq!(msg.sender().raw(), 0x0100_0001);
        assert_eq!(msg.receiver().worker_index(), 1);
        assert_eq!(msg.msg_type(), MessageType::MODULE_RPC);
        assert_eq!(msg.payload_str(), Some("ping"));
        assert_eq!(msg.userdata(), "reply-to");
        assert_eq!(msg.rpc_id(), 99);
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(MessageType::SOCKET_DATA.to_string(), "socket_data");
        assert_eq!(MessageType(200).to_string(), "type-200");
        assert!(MessageType::default().is_unknown());
    }
}
