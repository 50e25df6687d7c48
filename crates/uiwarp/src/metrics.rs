//! Per-stream counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of stream metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamMetricsSnapshot {
    /// RDMAP messages written, Read Responses included.
    pub messages_sent: u64,
    /// RDMAP messages fully placed.
    pub messages_received: u64,
    /// DDP segments written.
    pub segments_sent: u64,
    /// DDP segments placed.
    pub segments_received: u64,
    /// Payload bytes written.
    pub bytes_sent: u64,
    /// Payload bytes placed.
    pub bytes_received: u64,
    /// Work completions published.
    pub completions: u64,
    /// Read Responses served for the peer.
    pub read_responses: u64,
    /// Errors that ended the stream or failed a request.
    pub errors: u64,
}

/// Thread-safe stream metrics collector.
pub struct StreamMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    segments_sent: AtomicU64,
    segments_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    completions: AtomicU64,
    read_responses: AtomicU64,
    errors: AtomicU64,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl StreamMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            segments_sent: AtomicU64::new(0),
            segments_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            read_responses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Records one outbound message.
    pub fn record_sent(&self, segments: usize, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.segments_sent
            .fetch_add(segments as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records one placed message.
    pub fn record_received(&self, segments: usize, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.segments_received
            .fetch_add(segments as u64, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Increments the completions counter.
    pub fn inc_completions(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the read responses counter.
    pub fn inc_read_responses(&self) {
        self.read_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the errors counter.
    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            segments_sent: self.segments_sent.load(Ordering::Relaxed),
            segments_received: self.segments_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            read_responses: self.read_responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
