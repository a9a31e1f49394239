//! Data path counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the data path and observers
#[derive(Debug, Default)]
pub struct DataPathStats {
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    keepalives_out: AtomicU64,
    keepalives_in: AtomicU64,
    dropped_hmac: AtomicU64,
    dropped_replay: AtomicU64,
    dropped_unknown_key: AtomicU64,
    dropped_malformed: AtomicU64,
    overflow_out: AtomicU64,
    overflow_in: AtomicU64,
}

/// Point-in-time copy of [`DataPathStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_out: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub keepalives_out: u64,
    pub keepalives_in: u64,
    pub dropped_hmac: u64,
    pub dropped_replay: u64,
    pub dropped_unknown_key: u64,
    pub dropped_malformed: u64,
    pub overflow_out: u64,
    pub overflow_in: u64,
}

impl StatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_hmac + self.dropped_replay + self.dropped_unknown_key + self.dropped_malformed
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DataPathStats {
    pub(crate) fn sent(&self, bytes: usize) {
        bump(&self.packets_out);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn received(&self, bytes: usize) {
        bump(&self.packets_in);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn keepalive_sent(&self) {
        bump(&self.keepalives_out);
    }

    pub(crate) fn keepalive_received(&self) {
        bump(&self.keepalives_in);
    }

    pub(crate) fn dropped_hmac(&self) {
        bump(&self.dropped_hmac);
    }

    pub(crate) fn dropped_replay(&self) {
        bump(&self.dropped_replay);
    }

    pub(crate) fn dropped_unknown_key(&self) {
        bump(&self.dropped_unknown_key);
    }

    pub(crate) fn dropped_malformed(&self) {
        bump(&self.dropped_malformed);
    }

    pub(crate) fn overflow_out(&self) {
        bump(&self.overflow_out);
    }

    pub(crate) fn overflow_in(&self) {
        bump(&self.overflow_in);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_out: load(&self.packets_out),
            bytes_out: load(&self.bytes_out),
            packets_in: load(&self.packets_in),
            bytes_in: load(&self.bytes_in),
            keepalives_out: load(&self.keepalives_out),
            keepalives_in: load(&self.keepalives_in),
            dropped_hmac: load(&self.dropped_hmac),
            dropped_replay: load(&self.dropped_replay),
            dropped_unknown_key: load(&self.dropped_unknown_key),
            dropped_malformed: load(&self.dropped_malformed),
            overflow_out: load(&self.overflow_out),
            overflow_in: load(&self.overflow_in),
        }
    }
}
