//! Runtime error types

use crate::address::ModuleId;
use thiserror::Error;

/// Errors raised by the module manager
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A module's `init` hook returned false or panicked
    #[error("Module {module_id} rejected init")]
    InitRejected { module_id: ModuleId },

    #[error("Worker {worker} out of range (worker count {count})")]
    WorkerOutOfRange { worker: u8, count: usize },

    /// A cell was handed to a worker its id does not encode
    #[error("Module {module_id} belongs to worker {}, not worker {worker}", .module_id.worker_index())]
    WorkerMismatch { module_id: ModuleId, worker: u8 },

    /// The worker was stopped; restart the manager before placing modules
    #[error("Worker {worker} is stopped")]
    WorkerStopped { worker: u8 },

    #[error("No free module id on worker {worker}")]
    IdExhausted { worker: u8 },

    #[error("Unknown payload cache {cache_id}")]
    UnknownCache { cache_id: u32 },

    #[error("Failed to spawn thread for worker {worker}")]
    ThreadSpawn {
        worker: u8,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::InitRejected { .. } => "init",
            RuntimeError::WorkerOutOfRange { .. }
            | RuntimeError::WorkerMismatch { .. }
            | RuntimeError::WorkerStopped { .. } => "placement",
            RuntimeError::IdExhausted { .. } => "address",
            RuntimeError::UnknownCache { .. } => "cache",
            RuntimeError::ThreadSpawn { .. } => "thread",
        }
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_message_names_both_workers() {
        let err = RuntimeError::WorkerMismatch {
            module_id: ModuleId::encode(1, 2, 5),
            worker: 0,
        };
        assert_eq!(err.to_string(), "Module module-01020005 belongs to worker 2, not worker 0");
        assert_eq!(err.category(), "placement");
    }
}
