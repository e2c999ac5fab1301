use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Delivery-path counters.
///
/// Bumped from completion dispatchers without locking; read through
/// [`DeliveryStats::snapshot`].
#[derive(Debug, Default)]
pub struct DeliveryStats {
    chunks_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    transient_drops: AtomicU64,
    callback_faults: AtomicU64,
    consecutive_faults: AtomicU32,
    stale_completions: AtomicU64,
    buffers_reclaimed: AtomicU64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chunk reached its consumer. Clears the consecutive fault run.
    pub fn record_delivery(&self, bytes: usize) {
        self.chunks_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
        self.consecutive_faults.store(0, Ordering::Relaxed);
    }

    /// Returns the running total.
    pub fn record_drop(&self) -> u64 {
        self.transient_drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the length of the current consecutive run.
    pub fn record_fault(&self) -> u32 {
        self.callback_faults.fetch_add(1, Ordering::Relaxed);
        self.consecutive_faults.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_stale(&self) -> u64 {
        self.stale_completions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reclaimed(&self) {
        self.buffers_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            transient_drops: self.transient_drops.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
            consecutive_faults: self.consecutive_faults.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            buffers_reclaimed: self.buffers_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub chunks_delivered: u64,
    pub bytes_delivered: u64,
    pub transient_drops: u64,
    pub callback_faults: u64,
    pub consecutive_faults: u32,
    pub stale_completions: u64,
    pub buffers_reclaimed: u64,
}

/// Diagnostics for a whole loopback session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopbackDiagnostics {
    pub capture: DeliveryStatsSnapshot,
    pub playback: DeliveryStatsSnapshot,
    pub delivery_suspended: bool,
}

/// Log on the 1st, 2nd, 4th, 8th... occurrence so a sustained fault does not
/// flood the log from the audio path.
pub(crate) fn should_log(count: u64) -> bool {
    count.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_clears_consecutive_faults() {
        let stats = DeliveryStats::new();
        assert_eq!(stats.record_fault(), 1);
        assert_eq!(stats.record_fault(), 2);
        stats.record_delivery(64);
        assert_eq!(stats.record_fault(), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.callback_faults, 3);
        assert_eq!(snap.consecutive_faults, 1);
        assert_eq!(snap.chunks_delivered, 1);
        assert_eq!(snap.bytes_delivered, 64);
    }

    #[test]
    fn drop_and_stale_totals() {
        let stats = DeliveryStats::new();
        assert_eq!(stats.record_drop(), 1);
        assert_eq!(stats.record_drop(), 2);
        assert_eq!(stats.record_stale(), 1);
        stats.record_reclaimed();

        let snap = stats.snapshot();
        assert_eq!(snap.transient_drops, 2);
        assert_eq!(snap.stale_completions, 1);
        assert_eq!(snap.buffers_reclaimed, 1);
    }

    #[test]
    fn log_throttle_is_exponential() {
        let logged: Vec<u64> = (1..=20).filter(|n| should_log(*n)).collect();
        assert_eq!(logged, vec![1, 2, 4, 8, 16]);
    }
}
