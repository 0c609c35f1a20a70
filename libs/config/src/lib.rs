//! # Fabric Configuration
//!
//! Configuration and defaults for the module fabric runtime.
//!
//! ## Features
//!
//! - **Flat key/value strings**: `worker_num:4;machine_id:2` as accepted by
//!   the module manager at startup
//! - **Typed settings**: [`RuntimeConfig`] for the worker pool and
//!   [`NetworkConfig`] for the I/O execution pool
//! - **File loading**: TOML files with `FABRIC_` environment overrides
//!
//! ## Usage
//!
//! ```rust
//! use fabric_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_kv_str("worker_num:4; machine_id:2");
//! assert_eq!(config.worker_num, 4);
//! assert_eq!(config.machine_id, 2);
//! ```

pub mod defaults;
pub mod kv;
pub mod runtime_config;

// Re-export commonly used types
pub use kv::parse_key_values;
pub use runtime_config::{load_config, FabricConfig, NetworkConfig, RuntimeConfig};
