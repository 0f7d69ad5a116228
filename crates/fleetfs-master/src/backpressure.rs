//! Pausing remerge streams while the commit backlog is too deep.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// What to tell reconciling nodes after a backlog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Backlog crossed the high-water mark: stop sending listings.
    Pause,
    /// Backlog fell below the low-water mark: continue.
    Resume,
}

/// Hysteresis between a high and a low water mark on the commit backlog.
#[derive(Debug)]
pub struct RemergeThrottle {
    high_water: usize,
    low_water: usize,
    paused: AtomicBool,
}

impl RemergeThrottle {
    /// Creates a throttle. A low mark above the high mark is clamped to it.
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            high_water,
            low_water: low_water.min(high_water),
            paused: AtomicBool::new(false),
        }
    }

    /// Whether reconciling nodes are currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Feeds the current backlog; returns an action only on a state change.
    pub fn evaluate(&self, backlog: usize) -> Option<ThrottleAction> {
        if backlog > self.high_water {
            if !self.paused.swap(true, Ordering::SeqCst) {
                info!(backlog, high_water = self.high_water, "pausing remerge streams");
                return Some(ThrottleAction::Pause);
            }
        } else if backlog < self.low_water && self.paused.swap(false, Ordering::SeqCst) {
            info!(backlog, low_water = self.low_water, "resuming remerge streams");
            return Some(ThrottleAction::Resume);
        }
        None
    }
}
