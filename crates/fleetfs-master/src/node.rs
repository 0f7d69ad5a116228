//! Per-node state that outlives individual sessions.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use fleetfs_meta::{CommitKey, CommitQueue, NodeRecord};
use fleetfs_transport::message::{DiskStatus, TransferDirection, TransferStatus};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::SlaveConnection;

/// Where a node is in its session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// No live session.
    Offline,
    /// Handshake and capability probes in progress.
    Connecting,
    /// Remerge in progress; not eligible for new placements.
    Reconciling,
    /// Serving steady-state traffic.
    Available,
}

impl NodeState {
    /// Lower-case name for logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Offline => "offline",
            NodeState::Connecting => "connecting",
            NodeState::Reconciling => "reconciling",
            NodeState::Available => "available",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications published by the registry and node sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node was added to the registry.
    Added(String),
    /// A node finished its remerge and serves traffic.
    Available(String),
    /// A node that had been available went offline.
    Removed(String),
    /// A node was deleted from the registry.
    Deleted(String),
}

/// Network errors inside a sliding window.
#[derive(Debug, Default)]
pub struct ErrorBudget {
    errors: VecDeque<Instant>,
}

impl ErrorBudget {
    /// Records an error at `now`. Returns true when more than `max_errors`
    /// errors fall inside `window`.
    pub fn record(&mut self, now: Instant, max_errors: u32, window: Duration) -> bool {
        self.errors.push_back(now);
        self.count(now, window) > max_errors as usize
    }

    /// Errors still inside `window`.
    pub fn count(&mut self, now: Instant, window: Duration) -> usize {
        while let Some(oldest) = self.errors.front() {
            if now.duration_since(*oldest) > window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.len()
    }

    /// Forgets every recorded error.
    pub fn clear(&mut self) {
        self.errors.clear();
    }
}

/// Accumulated transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Throughput {
    /// Bytes the node has sent in finished transfers.
    pub bytes_sent: u64,
    /// Bytes the node has received in finished transfers.
    pub bytes_received: u64,
    /// Transfers that finished cleanly.
    pub transfers_completed: u64,
    /// Transfers that finished with an error.
    pub transfers_failed: u64,
}

/// Instantaneous transfer rate over in-flight transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferRate {
    /// Bytes per second being sent.
    pub sending_bps: u64,
    /// Bytes per second being received.
    pub receiving_bps: u64,
}

impl std::ops::AddAssign for TransferRate {
    fn add_assign(&mut self, rhs: Self) {
        self.sending_bps += rhs.sending_bps;
        self.receiving_bps += rhs.receiving_bps;
    }
}

/// A configured storage node.
pub struct SlaveNode {
    name: String,
    record: Mutex<NodeRecord>,
    commits: Arc<CommitQueue>,
    session: Mutex<Option<Weak<SlaveConnection>>>,
    errors: Mutex<ErrorBudget>,
    last_error: Mutex<Option<String>>,
    transfers: Mutex<HashMap<u64, TransferStatus>>,
    disk: Mutex<Option<DiskStatus>>,
    totals: Mutex<Throughput>,
    max_path_length: AtomicU32,
    tls_capable: AtomicBool,
}

impl SlaveNode {
    /// Wraps a record. Record changes are committed through `commits`.
    pub fn new(record: NodeRecord, commits: Arc<CommitQueue>) -> Arc<Self> {
        Arc::new(Self {
            name: record.name.clone(),
            record: Mutex::new(record),
            commits,
            session: Mutex::new(None),
            errors: Mutex::new(ErrorBudget::default()),
            last_error: Mutex::new(None),
            transfers: Mutex::new(HashMap::new()),
            disk: Mutex::new(None),
            totals: Mutex::new(Throughput::default()),
            max_path_length: AtomicU32::new(0),
            tls_capable: AtomicBool::new(false),
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the persisted record.
    pub fn record(&self) -> NodeRecord {
        self.record.lock().clone()
    }

    /// Mutates the record and schedules it for commit.
    pub fn update_record<R>(&self, f: impl FnOnce(&mut NodeRecord) -> R) -> R {
        let result = f(&mut self.record.lock());
        self.commits.schedule(CommitKey::Node(self.name.clone()));
        result
    }

    /// Response timeout for commands.
    pub fn timeout(&self) -> Duration {
        self.record.lock().timeout()
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<Arc<SlaveConnection>> {
        self.session
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|s| s.state() != NodeState::Offline)
    }

    /// Current state; `Offline` without a live session.
    pub fn state(&self) -> NodeState {
        self.session()
            .map(|s| s.state())
            .unwrap_or(NodeState::Offline)
    }

    /// Whether the node serves steady-state traffic.
    pub fn is_available(&self) -> bool {
        self.state() == NodeState::Available
    }

    /// Installs `session` unless another live session exists.
    pub(crate) fn attach(&self, session: &Arc<SlaveConnection>) -> bool {
        let mut current = self.session.lock();
        let live = current
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|s| s.state() != NodeState::Offline);
        if live {
            return false;
        }
        *current = Some(Arc::downgrade(session));
        true
    }

    /// Drops the session reference if it still points at session `id`.
    pub(crate) fn detach(&self, id: u64) {
        let mut current = self.session.lock();
        let matches = current
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(true, |s| s.id() == id);
        if matches {
            *current = None;
        }
    }

    /// Whether a connection from `ip` matches one of the node's masks.
    /// A node without masks accepts no connection.
    pub fn allows_address(&self, ip: IpAddr) -> bool {
        self.record
            .lock()
            .masks
            .iter()
            .any(|mask| mask_matches(mask, ip))
    }

    /// Charges a network error to the budget. Returns true when the budget is exhausted.
    pub fn record_network_error(&self, reason: &str) -> bool {
        let (max_errors, window) = {
            let record = self.record.lock();
            (record.max_errors(), record.error_window())
        };
        self.set_last_error(reason);
        let exceeded = self.errors.lock().record(Instant::now(), max_errors, window);
        if exceeded {
            warn!(node = %self.name, max_errors, reason, "error budget exhausted");
        }
        exceeded
    }

    /// Errors currently inside the window.
    pub fn recent_errors(&self) -> usize {
        let window = self.record.lock().error_window();
        self.errors.lock().count(Instant::now(), window)
    }

    /// Resets the error budget, as on a fresh session.
    pub fn clear_errors(&self) {
        self.errors.lock().clear();
    }

    /// Remembers the most recent failure for reports.
    pub fn set_last_error(&self, reason: &str) {
        *self.last_error.lock() = Some(reason.to_string());
    }

    /// Most recent failure reason.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Applies a transfer progress report. Returns the report if the transfer finished.
    pub fn update_transfer(&self, status: TransferStatus) -> Option<TransferStatus> {
        if !status.finished {
            self.transfers.lock().insert(status.transfer_id, status);
            return None;
        }
        self.transfers.lock().remove(&status.transfer_id);
        let mut totals = self.totals.lock();
        match (&status.error, status.direction) {
            (Some(error), _) => {
                totals.transfers_failed += 1;
                debug!(node = %self.name, id = status.transfer_id, error = %error, "transfer failed");
            }
            (None, TransferDirection::Sending) => {
                totals.transfers_completed += 1;
                totals.bytes_sent += status.transferred;
            }
            (None, TransferDirection::Receiving) => {
                totals.transfers_completed += 1;
                totals.bytes_received += status.transferred;
            }
        }
        Some(status)
    }

    /// In-flight transfers.
    pub fn transfers(&self) -> Vec<TransferStatus> {
        let mut transfers: Vec<_> = self.transfers.lock().values().cloned().collect();
        transfers.sort_by_key(|t| t.transfer_id);
        transfers
    }

    /// Forgets all in-flight transfers. Returns how many there were.
    pub fn clear_transfers(&self) -> usize {
        let mut transfers = self.transfers.lock();
        let cleared = transfers.len();
        transfers.clear();
        cleared
    }

    /// Current rate over in-flight transfers.
    pub fn transfer_rate(&self) -> TransferRate {
        let mut rate = TransferRate::default();
        for t in self.transfers.lock().values() {
            if t.elapsed_ms == 0 {
                continue;
            }
            let bps = t.transferred.saturating_mul(1000) / t.elapsed_ms;
            match t.direction {
                TransferDirection::Sending => rate.sending_bps += bps,
                TransferDirection::Receiving => rate.receiving_bps += bps,
            }
        }
        rate
    }

    /// Totals over finished transfers.
    pub fn throughput(&self) -> Throughput {
        *self.totals.lock()
    }

    /// Stores the latest disk report.
    pub fn update_disk_status(&self, status: DiskStatus) {
        *self.disk.lock() = Some(status);
    }

    /// Latest disk report.
    pub fn disk_status(&self) -> Option<DiskStatus> {
        *self.disk.lock()
    }

    /// Free bytes above the node's `minFreeSpace` reserve; zero when unknown.
    pub fn usable_space(&self) -> u64 {
        let reserve = self.record.lock().min_free_space();
        self.disk_status()
            .map(|d| d.free_bytes.saturating_sub(reserve))
            .unwrap_or(0)
    }

    /// Stores the capabilities probed during the handshake.
    pub fn set_capabilities(&self, max_path_length: u32, tls_capable: bool) {
        self.max_path_length.store(max_path_length, Ordering::Relaxed);
        self.tls_capable.store(tls_capable, Ordering::Relaxed);
    }

    /// Longest path the node accepts; zero before the first handshake.
    pub fn max_path_length(&self) -> u32 {
        self.max_path_length.load(Ordering::Relaxed)
    }

    /// Whether the node reported TLS readiness.
    pub fn tls_capable(&self) -> bool {
        self.tls_capable.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SlaveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveNode")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Matches a connecting address against one mask.
///
/// A mask is a CIDR block (`10.0.0.0/8`), a plain address, or a glob over the
/// textual address (`10.0.*.*`). An `ident@` prefix is ignored.
pub fn mask_matches(mask: &str, ip: IpAddr) -> bool {
    let host = mask.rsplit('@').next().unwrap_or(mask).trim();
    if let Ok(net) = host.parse::<ipnet::IpNet>() {
        return net.contains(&ip);
    }
    if let Ok(addr) = host.parse::<IpAddr>() {
        return addr == ip;
    }
    match glob::Pattern::new(host) {
        Ok(pattern) => pattern.matches(&ip.to_string()),
        Err(e) => {
            warn!(mask, error = %e, "ignoring malformed address mask");
            false
        }
    }
}
