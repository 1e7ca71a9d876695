use registry_database::models::Meta;
use std::sync::atomic::{AtomicU64, Ordering};

/// Observability counters for the update loop. All fields are atomic so the
/// struct can be read from any task without locking.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub last_block_number: AtomicU64,
    pub last_block_timestamp: AtomicU64,
    pub completed_cycles: AtomicU64,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, meta: &Meta) {
        self.last_block_number
            .store(meta.block_number, Ordering::Relaxed);
        self.last_block_timestamp
            .store(meta.timestamp, Ordering::Relaxed);
        self.completed_cycles.fetch_add(1, Ordering::Relaxed);
    }
}
