//! Runtime counters shared by the manager and every worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub messages_dispatched: AtomicU64,
    pub messages_delivered: AtomicU64,
    /// Out-of-range receiver, unknown module, or worker stopped
    pub messages_dropped: AtomicU64,
    pub broadcasts: AtomicU64,
    pub modules_started: AtomicU64,
    pub modules_removed: AtomicU64,
    pub module_faults: AtomicU64,
    pub ticks: AtomicU64,
    pub total_handling_time_ns: AtomicU64,
}

impl RuntimeMetrics {
    pub fn record_dispatch(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, duration: Duration) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        self.total_handling_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_start(&self) {
        self.modules_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.modules_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.module_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_handling_time_ns(&self) -> f64 {
        let count = self.messages_delivered.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_handling_time_ns.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            modules_started: self.modules_started.load(Ordering::Relaxed),
            modules_removed: self.modules_removed.load(Ordering::Relaxed),
            module_faults: self.module_faults.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            avg_handling_time_ns: self.avg_handling_time_ns(),
        }
    }
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuntimeStats {
    pub messages_dispatched: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub broadcasts: u64,
    pub modules_started: u64,
    pub modules_removed: u64,
    pub module_faults: u64,
    pub ticks: u64,
    pub avg_handling_time_ns: f64,
}
