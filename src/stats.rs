//! Running transfer counters for one endpoint.
//!
//! Counters are updated atomically on the hot path and read as a coherent
//! snapshot on demand. A message counts when its frame has been fully
//! written or fully routed; control frames are not counted.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Atomic transfer counters shared between the receive loop and senders.
#[derive(Debug)]
pub struct LinkStatistics {
    started_at: DateTime<Utc>,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
}

impl Default for LinkStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStatistics {
    pub fn new() -> Self {
        LinkStatistics {
            started_at: Utc::now(),
            received_messages: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            sent_messages: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        }
    }

    /// Count one fully received message of `payload_bytes`.
    pub fn record_received(&self, payload_bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes
            .fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Count one fully sent message of `payload_bytes`.
    pub fn record_sent(&self, payload_bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Zero every counter. The start time is preserved.
    pub fn reset(&self) {
        self.received_messages.store(0, Ordering::Relaxed);
        self.received_bytes.store(0, Ordering::Relaxed);
        self.sent_messages.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
    }

    /// A point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
        }
    }
}

/// The counters as plain values.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    /// When this endpoint started.
    pub started_at: DateTime<Utc>,
    /// Seconds since `started_at`.
    pub uptime_seconds: u64,
    /// Fully received application messages.
    pub received_messages: u64,
    /// Payload bytes across received messages.
    pub received_bytes: u64,
    /// Fully sent application messages.
    pub sent_messages: u64,
    /// Payload bytes across sent messages.
    pub sent_bytes: u64,
}

impl std::fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "up {}s, rx {} msgs / {} bytes, tx {} msgs / {} bytes",
            self.uptime_seconds,
            self.received_messages,
            self.received_bytes,
            self.sent_messages,
            self.sent_bytes
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
