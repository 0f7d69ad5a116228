//! Liveness tracking for node connections.
//!
//! Any inbound frame counts as traffic. A probe is due once nothing has been
//! heard for half the timeout window; the connection is dead once the whole
//! window passes in silence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// What the owner of a connection should do after polling the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Traffic is recent enough.
    Idle,
    /// Send a liveness probe now.
    ProbeDue,
    /// No traffic within the timeout window.
    Expired {
        /// Time since the last inbound traffic.
        silent_for: Duration,
    },
}

/// Statistics for keep-alive tracking of a single connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LivenessStats {
    /// Total number of probes sent.
    pub probes_sent: u64,
    /// Total number of probe answers received.
    pub probes_answered: u64,
    /// Average round-trip time in microseconds, if available.
    pub average_rtt_us: Option<u64>,
}

/// Tracks liveness for a single connection.
pub struct LivenessTracker {
    timeout: Duration,
    epoch: Instant,
    /// Microseconds since `epoch` of the last inbound frame.
    last_traffic_us: AtomicU64,
    probe_outstanding: AtomicBool,
    probes_sent: AtomicU64,
    probes_answered: AtomicU64,
    rtt_sum_us: AtomicU64,
}

impl LivenessTracker {
    /// Creates a tracker; the connection counts as fresh traffic now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            epoch: Instant::now(),
            last_traffic_us: AtomicU64::new(0),
            probe_outstanding: AtomicBool::new(false),
            probes_sent: AtomicU64::new(0),
            probes_answered: AtomicU64::new(0),
            rtt_sum_us: AtomicU64::new(0),
        }
    }

    /// Configured timeout window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records inbound traffic of any kind.
    pub fn record_traffic(&self) {
        self.last_traffic_us
            .fetch_max(self.now_us(), Ordering::SeqCst);
    }

    /// Records that a probe went out.
    pub fn record_probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
        self.probe_outstanding.store(true, Ordering::SeqCst);
    }

    /// Records the answer to a probe that took `rtt`.
    pub fn record_probe_answered(&self, rtt: Duration) {
        self.probes_answered.fetch_add(1, Ordering::Relaxed);
        self.rtt_sum_us
            .fetch_add(rtt.as_micros() as u64, Ordering::Relaxed);
        self.probe_outstanding.store(false, Ordering::SeqCst);
        self.record_traffic();
    }

    /// Clears the outstanding flag after a probe failed without an answer.
    pub fn record_probe_failed(&self) {
        self.probe_outstanding.store(false, Ordering::SeqCst);
    }

    /// Time since the last inbound traffic.
    pub fn silence(&self) -> Duration {
        let now = self.now_us();
        Duration::from_micros(now.saturating_sub(self.last_traffic_us.load(Ordering::SeqCst)))
    }

    /// Decides whether to probe, wait, or give up.
    pub fn poll(&self) -> LivenessVerdict {
        let silent_for = self.silence();
        if silent_for >= self.timeout {
            LivenessVerdict::Expired { silent_for }
        } else if silent_for >= self.timeout / 2 && !self.probe_outstanding.load(Ordering::SeqCst) {
            LivenessVerdict::ProbeDue
        } else {
            LivenessVerdict::Idle
        }
    }

    /// Snapshot of probe counters.
    pub fn stats(&self) -> LivenessStats {
        let answered = self.probes_answered.load(Ordering::Relaxed);
        LivenessStats {
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            probes_answered: answered,
            average_rtt_us: (answered > 0)
                .then(|| self.rtt_sum_us.load(Ordering::Relaxed) / answered),
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}
