//! Network Infrastructure
//!
//! TCP transport for the module fabric: a fixed pool of I/O execution
//! contexts, per-connection sessions pinned to one context for life, and a
//! network frame that listens, accepts and dials.
//!
//! ```text
//! ┌──────────────┐  accept/dial   ┌──────────────────────────┐
//! │ NetworkFrame │ ─────────────▶ │ NetworkServicePool       │
//! │  listener    │                │  ctx[0]  ctx[1] … ctx[M] │
//! └──────────────┘                │  thread  thread   thread │
//!                                 └────────────┬─────────────┘
//!                                              │ frames
//!                                              ▼
//!                                     SessionDelegate (module fabric)
//! ```

pub mod delegate;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod pool;
pub mod session;

// Re-export commonly used types
pub use delegate::SessionDelegate;
pub use error::{NetworkError, Result};
pub use frame::NetworkFrame;
pub use metrics::ContextStats;
pub use pool::{ContextRouter, ContextShared, ExecutionContext, NetworkServicePool};
pub use session::{
    decode_context, encode_session_id, read_frame, write_frame, CloseReason, Session, SessionId,
    SessionState, INVALID_SESSION,
};
