//! Module Fabric Runtime
//!
//! In-process actor runtime: modules exchange typed messages through
//! addresses that encode their owning worker thread, and network sessions
//! feed the same fabric through a delegate.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐  send / broadcast   ┌──────────────────────────┐
//! │  ModuleManager    │ ──────────────────▶ │ Worker[i]  inbox         │
//! │  receiver >> 16   │   (worker index)    │  ├─ module A  (inbox)    │
//! └─────────▲─────────┘                     │  └─ module B  (inbox)    │
//!           │                               │  dedicated thread        │
//!           │ SOCKET_* messages             └──────────────────────────┘
//! ┌─────────┴──────────────┐
//! │ ModuleSessionDelegate  │ ◀── NetworkFrame sessions
//! └────────────────────────┘
//! ```
//!
//! # Examples
//!
//! ```rust
//! use fabric_actors::{Message, MessageType, Module, ModuleContext, ModuleManager};
//!
//! struct Greeter;
//!
//! impl Module for Greeter {
//!     fn on_message(&mut self, ctx: &mut ModuleContext, msg: &Message) -> anyhow::Result<()> {
//!         tracing::info!("{} got {:?}", ctx.id(), msg.payload_str());
//!         Ok(())
//!     }
//! }
//!
//! let manager = ModuleManager::init("worker_num:2;machine_id:1");
//! let greeter = manager.create_module(Box::new(Greeter), "", None).unwrap();
//! manager.run().unwrap();
//! manager.send(Default::default(), greeter, b"hello", "", 0, MessageType::MODULE_DATA);
//! manager.stop();
//! ```

pub mod address;
pub mod bridge;
pub mod error;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod module;
pub mod worker;

pub use address::{decode_worker, ModuleId};
pub use bridge::{session_of, ModuleSessionDelegate};
pub use error::{Result, RuntimeError};
pub use manager::ModuleManager;
pub use message::{Message, MessageType};
pub use metrics::{RuntimeMetrics, RuntimeStats};
pub use module::{Module, ModuleCell, ModuleContext};
pub use worker::Worker;
