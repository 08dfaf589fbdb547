use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handshake-level ticket counters.
#[derive(Debug, Default)]
pub struct TicketStats {
    issued: AtomicU64,
    resumed: AtomicU64,
    renewed: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TicketStatsSnapshot {
    pub issued: u64,
    pub resumed: u64,
    pub renewed: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

impl TicketStats {
    pub(crate) fn record_issued(&self) {
        self.issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resumed(&self, renewed: bool) {
        self.resumed.fetch_add(1, Ordering::Relaxed);
        if renewed {
            self.renewed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TicketStatsSnapshot {
        TicketStatsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            renewed: self.renewed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
