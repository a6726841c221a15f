//! Gateway metrics: process-wide atomic counters with a plain snapshot.
//!
//! Counters feed the health document and a periodic debug log line;
//! recording is relaxed atomics only, never a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for the whole gateway process.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// HTTP requests accepted and dispatched toward a tunnel.
    pub requests_forwarded: AtomicU64,
    /// Responses relayed back to public callers.
    pub responses_relayed: AtomicU64,
    /// Requests that hit the correlation timeout.
    pub requests_timed_out: AtomicU64,
    /// Requests rejected or failed before a response arrived.
    pub requests_failed: AtomicU64,
    /// Requests refused by the rate limiter.
    pub requests_rate_limited: AtomicU64,
    /// Tunnels registered over the process lifetime.
    pub tunnels_registered: AtomicU64,
    /// Tunnels unregistered over the process lifetime.
    pub tunnels_unregistered: AtomicU64,
    /// Frames decoded off control connections.
    pub frames_in: AtomicU64,
    /// Frames written to control connections.
    pub frames_out: AtomicU64,
    /// Payload bytes received on control connections.
    pub bytes_in: AtomicU64,
    /// Payload bytes sent on control connections.
    pub bytes_out: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_forwarded(&self) {
        self.requests_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.responses_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.requests_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_registered(&self) {
        self.tunnels_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_unregistered(&self) {
        self.tunnels_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_in(&self, payload_bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_out(&self, payload_bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    /// Non-atomic copy for serialization and logging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_forwarded: self.requests_forwarded.load(Ordering::Relaxed),
            responses_relayed: self.responses_relayed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rate_limited: self.requests_rate_limited.load(Ordering::Relaxed),
            tunnels_registered: self.tunnels_registered.load(Ordering::Relaxed),
            tunnels_unregistered: self.tunnels_unregistered.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_forwarded: u64,
    pub responses_relayed: u64,
    pub requests_timed_out: u64,
    pub requests_failed: u64,
    pub requests_rate_limited: u64,
    pub tunnels_registered: u64,
    pub tunnels_unregistered: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl MetricsSnapshot {
    /// One-line summary for periodic debug logging.
    pub fn summary(&self) -> String {
        format!(
            "forwarded {}, relayed {}, timed out {}, failed {}, rate limited {}; tunnels {}/{} registered/unregistered; frames {}/{} in/out",
            self.requests_forwarded,
            self.responses_relayed,
            self.requests_timed_out,
            self.requests_failed,
            self.requests_rate_limited,
            self.tunnels_registered,
            self.tunnels_unregistered,
            self.frames_in,
            self.frames_out,
        )
    }
}
