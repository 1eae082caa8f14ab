use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters updated by the channel worker and the transmitter.
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    pub accepted: AtomicU64,
    pub serialization_failures: AtomicU64,
    pub enqueue_dropped_capacity: AtomicU64,
    pub enqueue_dropped_io: AtomicU64,
    pub sent: AtomicU64,
    pub retried: AtomicU64,
    pub dropped_deadline: AtomicU64,
    pub dropped_permanent: AtomicU64,
}

impl TelemetryCounters {
    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            serialization_failures: self.serialization_failures.load(Ordering::Relaxed),
            enqueue_dropped_capacity: self.enqueue_dropped_capacity.load(Ordering::Relaxed),
            enqueue_dropped_io: self.enqueue_dropped_io.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped_deadline: self.dropped_deadline.load(Ordering::Relaxed),
            dropped_permanent: self.dropped_permanent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub accepted: u64,
    pub serialization_failures: u64,
    pub enqueue_dropped_capacity: u64,
    pub enqueue_dropped_io: u64,
    pub sent: u64,
    pub retried: u64,
    pub dropped_deadline: u64,
    pub dropped_permanent: u64,
}
