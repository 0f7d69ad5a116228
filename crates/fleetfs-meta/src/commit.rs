//! Coalescing, delayed write-back of mutated metadata objects.
//!
//! Producers call [`CommitQueue::schedule`] after every mutation. A single
//! worker persists entries once they are older than the configured delay, so
//! an object mutated many times inside the window is written once. Failed
//! writes stay queued and are retried on the next cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::types::{MetaError, VfsPath};

/// Identity of a committable object.
///
/// Objects are referenced by key and resolved at write time, so the queue
/// always persists the latest state and never holds the object itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommitKey {
    /// A storage node record, by node name.
    Node(String),
    /// A directory, by path.
    Directory(VfsPath),
    /// A file, by path.
    File(VfsPath),
}

impl std::fmt::Display for CommitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitKey::Node(name) => write!(f, "node:{name}"),
            CommitKey::Directory(path) => write!(f, "dir:{path}"),
            CommitKey::File(path) => write!(f, "file:{path}"),
        }
    }
}

/// Writes the current state of one object to durable storage.
pub trait Committer: Send + Sync {
    /// Persists the object behind `key`, or removes its record if the object is gone.
    fn commit(&self, key: &CommitKey) -> Result<(), MetaError>;
}

/// Configuration for the commit queue.
#[derive(Debug, Clone)]
pub struct CommitQueueConfig {
    /// Minimum age of an entry before the worker writes it.
    pub delay: Duration,
}

impl Default for CommitQueueConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
        }
    }
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries written and removed.
    pub written: usize,
    /// Entries whose write failed; they remain queued.
    pub failed: usize,
}

/// Counters exposed for the admin surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitStats {
    /// Entries currently queued.
    pub queued: usize,
    /// Successful writes since start.
    pub writes: u64,
    /// Failed writes since start.
    pub failures: u64,
}

/// Identity-deduplicated write-back queue.
pub struct CommitQueue {
    config: CommitQueueConfig,
    entries: DashMap<CommitKey, Instant>,
    draining: AtomicBool,
    /// Serializes writes so one object is never written twice concurrently.
    write_lock: Mutex<()>,
    wakeup: Notify,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl CommitQueue {
    /// Creates an empty queue.
    pub fn new(config: CommitQueueConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            draining: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            wakeup: Notify::new(),
            writes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Queues `key` unless it is already queued. Returns whether a new entry was added.
    pub fn schedule(&self, key: CommitKey) -> bool {
        let mut added = false;
        self.entries.entry(key).or_insert_with(|| {
            added = true;
            Instant::now()
        });
        added
    }

    /// Whether `key` is waiting to be written.
    pub fn contains(&self, key: &CommitKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the queue ignores the delay for final shutdown.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Counters snapshot.
    pub fn stats(&self) -> CommitStats {
        CommitStats {
            queued: self.len(),
            writes: self.writes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Writes `key` immediately, outside the normal delay.
    ///
    /// On failure the entry is queued again so the worker retries it.
    pub fn flush_now(&self, key: &CommitKey, committer: &dyn Committer) -> Result<(), MetaError> {
        let queued_at = self.entries.remove(key).map(|(_, at)| at);
        match self.write(key, committer) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.entries
                    .entry(key.clone())
                    .or_insert(queued_at.unwrap_or_else(Instant::now));
                Err(e)
            }
        }
    }

    /// Switches the queue into ignore-delay mode for the final flush. Irrevocable.
    pub fn drain_all(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!(queued = self.len(), "commit queue draining");
        }
        self.wakeup.notify_one();
    }

    /// Writes every entry older than the delay (or every entry when draining).
    pub fn process_due(&self, committer: &dyn Committer) -> FlushReport {
        let draining = self.is_draining();
        let now = Instant::now();
        let mut due: Vec<(CommitKey, Instant)> = self
            .entries
            .iter()
            .filter(|e| draining || now.duration_since(*e.value()) >= self.config.delay)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        due.sort_by_key(|(_, at)| *at);

        let mut report = FlushReport::default();
        for (key, queued_at) in due {
            // Removed before writing: a schedule() racing with the write re-queues the key.
            if self.entries.remove_if(&key, |_, at| *at == queued_at).is_none() {
                continue;
            }
            match self.write(&key, committer) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "commit failed, will retry");
                    self.entries.entry(key).or_insert(queued_at);
                    report.failed += 1;
                }
            }
        }
        if report.written > 0 || report.failed > 0 {
            debug!(
                written = report.written,
                failed = report.failed,
                remaining = self.len(),
                "commit pass finished"
            );
        }
        report
    }

    /// Worker loop. Wakes every `delay` (or on drain), writes due entries, and
    /// on shutdown drains everything it can before returning.
    pub async fn run(self: Arc<Self>, committer: Arc<dyn Committer>, mut shutdown: watch::Receiver<bool>) {
        info!(delay_ms = self.config.delay.as_millis() as u64, "commit worker started");
        loop {
            let stop = tokio::select! {
                _ = tokio::time::sleep(self.config.delay) => false,
                _ = self.wakeup.notified() => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            let stop = stop || *shutdown.borrow();
            if stop {
                self.drain_all();
            }
            let queue = self.clone();
            let writer = committer.clone();
            let report = match tokio::task::spawn_blocking(move || queue.process_due(&*writer)).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "commit pass panicked");
                    FlushReport::default()
                }
            };
            if stop {
                if report.failed > 0 || !self.is_empty() {
                    warn!(remaining = self.len(), "commit queue not empty at shutdown");
                }
                info!("commit worker stopped");
                return;
            }
        }
    }

    fn write(&self, key: &CommitKey, committer: &dyn Committer) -> Result<(), MetaError> {
        let _guard = self.write_lock.lock();
        match committer.commit(key) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingCommitter {
        writes: Mutex<HashMap<CommitKey, usize>>,
        fail: AtomicBool,
    }

    impl CountingCommitter {
        fn count(&self, key: &CommitKey) -> usize {
            self.writes.lock().get(key).copied().unwrap_or(0)
        }
    }

    impl Committer for CountingCommitter {
        fn commit(&self, key: &CommitKey) -> Result<(), MetaError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MetaError::KvError("disk full".to_string()));
            }
            *self.writes.lock().entry(key.clone()).or_default() += 1;
            Ok(())
        }
    }

    fn file_key(p: &str) -> CommitKey {
        CommitKey::File(VfsPath::new(p).unwrap())
    }

    #[test]
    fn test_schedule_deduplicates() {
        let queue = CommitQueue::new(CommitQueueConfig::default());
        assert!(queue.schedule(file_key("/a")));
        assert!(!queue.schedule(file_key("/a")));
        assert!(queue.schedule(CommitKey::Node("nodeA".to_string())));
        assert_eq!(queue.len(), 2);
        assert!(queue.contains(&file_key("/a")));
    }

    #[test]
    fn test_many_schedules_one_write() {
        let queue = CommitQueue::new(CommitQueueConfig {
            delay: Duration::ZERO,
        });
        let committer = CountingCommitter::default();
        for _ in 0..50 {
            queue.schedule(file_key("/a"));
        }
        let report = queue.process_due(&committer);
        assert_eq!(report.written, 1);
        assert_eq!(committer.count(&file_key("/a")), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_young_entries_wait_for_delay() {
        let queue = CommitQueue::new(CommitQueueConfig {
            delay: Duration::from_secs(3600),
        });
        let committer = CountingCommitter::default();
        queue.schedule(file_key("/a"));
        assert_eq!(queue.process_due(&committer), FlushReport::default());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_ignores_delay() {
        let queue = CommitQueue::new(CommitQueueConfig {
            delay: Duration::from_secs(3600),
        });
        let committer = CountingCommitter::default();
        queue.schedule(file_key("/a"));
        queue.schedule(file_key("/b"));
        queue.drain_all();
        assert!(queue.is_draining());
        assert_eq!(queue.process_due(&committer).written, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failed_write_stays_queued() {
        let queue = CommitQueue::new(CommitQueueConfig {
            delay: Duration::ZERO,
        });
        let committer = CountingCommitter::default();
        committer.fail.store(true, Ordering::SeqCst);
        queue.schedule(file_key("/a"));

        let report = queue.process_due(&committer);
        assert_eq!(report.failed, 1);
        assert!(queue.contains(&file_key("/a")));
        assert_eq!(queue.stats().failures, 1);

        committer.fail.store(false, Ordering::SeqCst);
        assert_eq!(queue.process_due(&committer).written, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_now_bypasses_delay() {
        let queue = CommitQueue::new(CommitQueueConfig {
            delay: Duration::from_secs(3600),
        });
        let committer = CountingCommitter::default();
        queue.schedule(file_key("/a"));
        queue.flush_now(&file_key("/a"), &committer).unwrap();
        assert!(queue.is_empty());
        assert_eq!(committer.count(&file_key("/a")), 1);
    }

    #[test]
    fn test_flush_now_failure_requeues() {
        let queue = CommitQueue::new(CommitQueueConfig::default());
        let committer = CountingCommitter::default();
        committer.fail.store(true, Ordering::SeqCst);
        assert!(queue.flush_now(&file_key("/a"), &committer).is_err());
        assert!(queue.contains(&file_key("/a")));
    }

    #[tokio::test]
    async fn test_worker_drains_on_shutdown() {
        let queue = Arc::new(CommitQueue::new(CommitQueueConfig {
            delay: Duration::from_secs(3600),
        }));
        let committer = Arc::new(CountingCommitter::default());
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(queue.clone().run(committer.clone(), rx));

        queue.schedule(file_key("/a"));
        queue.schedule(CommitKey::Node("nodeA".to_string()));
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(committer.count(&file_key("/a")), 1);
        assert_eq!(committer.count(&CommitKey::Node("nodeA".to_string())), 1);
    }
}
