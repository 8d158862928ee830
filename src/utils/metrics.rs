//! Observability and Metrics
//!
//! Per-connection counters for traffic, correlation outcomes, callback
//! delivery and lifecycle events. Each `Connection` owns its own instance.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one connection
#[derive(Debug)]
pub struct Metrics {
    /// Packets written to the socket
    pub packets_sent: AtomicU64,
    /// Packets read from the socket
    pub packets_received: AtomicU64,
    /// Bytes written
    pub bytes_sent: AtomicU64,
    /// Bytes read
    pub bytes_received: AtomicU64,
    /// Responses that completed a pending call
    pub responses_matched: AtomicU64,
    /// Responses nobody was waiting for
    pub responses_discarded: AtomicU64,
    /// Calls that ran out of time
    pub request_timeouts: AtomicU64,
    /// Events handed to user handlers
    pub callbacks_dispatched: AtomicU64,
    /// Events dropped as noise
    pub callbacks_dropped: AtomicU64,
    /// Disconnect probes sent
    pub probes_sent: AtomicU64,
    /// Successful connects (user and automatic)
    pub connects: AtomicU64,
    /// Successful automatic reconnects
    pub reconnects: AtomicU64,
    /// Authentication attempts
    pub auth_attempts: AtomicU64,
    /// Authentication attempts that the daemon accepted
    pub auth_success: AtomicU64,
    /// Authentication attempts that failed
    pub auth_failed: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            responses_discarded: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            callbacks_dispatched: AtomicU64::new(0),
            callbacks_dropped: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            auth_attempts: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn response_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_discarded(&self) {
        self.responses_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_dispatched(&self) {
        self.callbacks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_dropped(&self) {
        self.callbacks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connected(&self, automatic: bool) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if automatic {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn auth_attempt(&self) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_result(&self, accepted: bool) {
        if accepted {
            self.auth_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_discarded: self.responses_discarded.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            callbacks_dispatched: self.callbacks_dispatched.load(Ordering::Relaxed),
            callbacks_dropped: self.callbacks_dropped.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            responses_matched = snapshot.responses_matched,
            responses_discarded = snapshot.responses_discarded,
            request_timeouts = snapshot.request_timeouts,
            callbacks_dispatched = snapshot.callbacks_dispatched,
            callbacks_dropped = snapshot.callbacks_dropped,
            probes_sent = snapshot.probes_sent,
            connects = snapshot.connects,
            reconnects = snapshot.reconnects,
            auth_attempts = snapshot.auth_attempts,
            auth_success = snapshot.auth_success,
            auth_failed = snapshot.auth_failed,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub responses_matched: u64,
    pub responses_discarded: u64,
    pub request_timeouts: u64,
    pub callbacks_dispatched: u64,
    pub callbacks_dropped: u64,
    pub probes_sent: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub auth_attempts: u64,
    pub auth_success: u64,
    pub auth_failed: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.packet_sent(12);
        metrics.packet_sent(8);
        metrics.connected(false);
        metrics.connected(true);
        metrics.auth_result(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 20);
        assert_eq!(snap.connects, 2);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.auth_failed, 1);
        assert_eq!(snap.auth_success, 0);
    }
}
