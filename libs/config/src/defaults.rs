//! Default values shared by the worker pool and the network layer.

/// Worker pool defaults
pub mod runtime {
    /// Number of worker threads when `worker_num` is absent
    pub const WORKER_NUM: usize = 1;

    /// Upper bound on workers; the worker index occupies 8 address bits
    pub const MAX_WORKER_NUM: usize = 256;

    /// Machine identifier when `machine_id` is absent
    pub const MACHINE_ID: u8 = 1;

    /// Worker tick period (milliseconds) when no message wakes the loop
    pub const UPDATE_INTERVAL_MS: u64 = 10;
}

/// Network layer defaults
pub mod network {
    /// Number of I/O execution contexts
    pub const THREAD_NUM: usize = 1;

    /// Idle session timeout (milliseconds); 0 disables the timeout
    pub const SESSION_TIMEOUT_MS: u64 = 0;

    /// Largest frame accepted from a peer
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Listen backlog passed to the OS
    pub const LISTEN_BACKLOG: u32 = 1024;
}

/// Recognized keys of the flat configuration string
pub mod keys {
    pub const WORKER_NUM: &str = "worker_num";
    pub const MACHINE_ID: &str = "machine_id";
    pub const UPDATE_INTERVAL: &str = "update_interval";
    pub const NET_THREAD_NUM: &str = "net_thread_num";
    pub const TIMEOUT: &str = "timeout";
}
