use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Lock-free counters shared between the reader and the forwarding worker
#[derive(Debug)]
pub struct RelayMetrics {
    started_at: DateTime<Utc>,
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    processing_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub processing_errors: u64,
    pub reconnects: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// A chat message was handed to the forwarding worker
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// The webhook accepted a request
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A message was filtered out by the prefix
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Decode, encode, build or send failure
    pub fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
