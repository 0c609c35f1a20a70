//! Echo module: writes every frame back to the session it came from.

use fabric_actors::{session_of, Message, MessageType, Module, ModuleContext};
use fabric_config::kv::{optional_value_or, parse_key_values};
use fabric_network::NetworkFrame;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_REPORT_INTERVAL_MS: u64 = 5_000;

pub struct EchoModule {
    frame: Arc<NetworkFrame>,
    report_interval_ms: u64,
    since_report_ms: u64,
    counters: EchoCounters,
}

#[derive(Debug, Default, Clone, Copy)]
struct EchoCounters {
    connected: u64,
    closed: u64,
    echoed: u64,
    failed: u64,
}

impl EchoModule {
    pub fn new(frame: Arc<NetworkFrame>) -> Self {
        Self {
            frame,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            since_report_ms: 0,
            counters: EchoCounters::default(),
        }
    }
}

impl Module for EchoModule {
    /// Accepts `name:<name>;report_interval:<ms>`; a zero interval disables
    /// the periodic report.
    fn init(&mut self, ctx: &mut ModuleContext, config: &str) -> bool {
        let pairs = parse_key_values(config);
        ctx.set_name(pairs.get("name").cloned().unwrap_or_else(|| "echo".to_string()));
        self.report_interval_ms = optional_value_or(&pairs, "report_interval", DEFAULT_REPORT_INTERVAL_MS);
        ctx.set_enable_update(self.report_interval_ms > 0);
        true
    }

    fn start(&mut self, ctx: &mut ModuleContext) -> anyhow::Result<()> {
        info!(module_id = %ctx.id(), name = ctx.name(), worker = ctx.worker_index(), "Echo module started");
        Ok(())
    }

    fn update(&mut self, ctx: &mut ModuleContext, interval_ms: u64) -> anyhow::Result<()> {
        self.since_report_ms += interval_ms;
        if self.since_report_ms >= self.report_interval_ms {
            self.since_report_ms = 0;
            info!(
                module_id = %ctx.id(),
                sessions = self.frame.session_count(),
                connected = self.counters.connected,
                closed = self.counters.closed,
                echoed = self.counters.echoed,
                failed = self.counters.failed,
                "Echo report"
            );
        }
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut ModuleContext) -> anyhow::Result<()> {
        info!(module_id = %ctx.id(), counters = ?self.counters, "Echo module destroyed");
        Ok(())
    }

    fn on_message(&mut self, _ctx: &mut ModuleContext, msg: &Message) -> anyhow::Result<()> {
        let session_id = session_of(msg.rpc_id());
        match msg.msg_type() {
            MessageType::SOCKET_CONNECT => {
                self.counters.connected += 1;
                debug!(session_id, peer = msg.payload_str().unwrap_or_default(), "Client connected");
            }
            MessageType::SOCKET_DATA => match self.frame.send(session_id, msg.payload().clone()) {
                Ok(()) => self.counters.echoed += 1,
                Err(e) => {
                    self.counters.failed += 1;
                    warn!(session_id, error = %e, "Echo failed");
                }
            },
            MessageType::SOCKET_CLOSE => {
                self.counters.closed += 1;
                debug!(session_id, reason = msg.userdata(), "Client disconnected");
            }
            other => debug!(msg_type = %other, sender = %msg.sender(), "Ignoring message"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_actors::{ModuleManager, ModuleSessionDelegate};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn gateway() -> (ModuleManager, Arc<ModuleSessionDelegate>, Arc<NetworkFrame>) {
        let manager = ModuleManager::init("worker_num:2");
        let delegate = Arc::new(ModuleSessionDelegate::new(manager.clone()));
        let frame = Arc::new(NetworkFrame::new(delegate.clone(), 1).unwrap());
        (manager, delegate, frame)
    }

    #[test]
    fn test_init_reads_name() {
        let (manager, _delegate, frame) = gateway();
        let cell = manager
            .prepare_module(Box::new(EchoModule::new(frame)), "name:edge;report_interval:0", None)
            .unwrap();
        assert_eq!(cell.name(), "edge");
    }

    #[test_log::test]
    fn test_frames_are_echoed() {
        let (manager, delegate, frame) = gateway();
        let echo = manager
            .create_module(Box::new(EchoModule::new(Arc::clone(&frame))), "name:echo", None)
            .unwrap();
        delegate.set_target(echo);

        frame.listen("127.0.0.1", "0").unwrap();
        manager.run().unwrap();
        frame.run().unwrap();

        let mut client = TcpStream::connect(frame.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(&5u32.to_be_bytes()).unwrap();
        client.write_all(b"hello").unwrap();

        let mut len = [0u8; 4];
        client.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        client.read_exact(&mut body).unwrap();
        assert_eq!(body, b"hello");

        frame.stop();
        manager.stop();
    }
}
