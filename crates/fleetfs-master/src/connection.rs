//! One live session with a storage node.
//!
//! A session moves through `Connecting -> Reconciling -> Available` and ends in
//! `Offline`; a new connection starts a new session. Four tasks serve it:
//!
//! - the read loop, sole owner of the socket's read half, which completes
//!   tickets and feeds remerge listings to the reconcile worker;
//! - the reconcile worker, which merges one directory at a time into the
//!   namespace;
//! - the liveness loop, which probes an idle node and declares a silent one dead;
//! - the establish task, which probes capabilities, replays the offline queue
//!   and requests the remerge.
//!
//! Commands are issued concurrently by any task through [`SlaveConnection::issue`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetfs_meta::node_record::PROP_LAST_REMERGE_MS;
use fleetfs_meta::{now_ms, VfsPath};
use fleetfs_transport::keepalive::{LivenessStats, LivenessTracker, LivenessVerdict};
use fleetfs_transport::message::{
    AbortTransferRequest, Command, DiskStatus, HandshakeReply, Inbound, RemergeEntry,
    RemergeRequest, RenameRequest, Reply, TransferStatus,
};
use fleetfs_transport::tcp::{FrameReader, FrameWriter, TcpConnection};
use fleetfs_transport::TransportError;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::backpressure::ThrottleAction;
use crate::context::MasterContext;
use crate::error::{NodeError, Result};
use crate::node::{NodeEvent, NodeState, SlaveNode};
use crate::offline_queue::OfflineOperationQueue;
use crate::remerge::{RemergeReconciler, RemergeStats, RemoteAction};
use crate::tickets::TicketRegistry;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct RemergeProgress {
    partial: bool,
    started_ms: u64,
    stats: RemergeStats,
}

/// A live session with one storage node.
pub struct SlaveConnection {
    id: u64,
    node: Arc<SlaveNode>,
    ctx: Arc<MasterContext>,
    peer_addr: SocketAddr,
    writer: FrameWriter,
    tickets: Arc<TicketRegistry>,
    state: Mutex<NodeState>,
    reached_available: AtomicBool,
    replaying: AtomicBool,
    liveness: LivenessTracker,
    remerge: Mutex<RemergeProgress>,
    remerge_tx: mpsc::Sender<RemergeEntry>,
    remerge_rx: Mutex<Option<mpsc::Receiver<RemergeEntry>>>,
    shutdown: watch::Sender<bool>,
}

impl SlaveConnection {
    /// Wraps an accepted connection whose identity has been checked. The
    /// session starts in `Connecting`; nothing runs until [`start`](Self::start).
    pub(crate) fn new(
        node: Arc<SlaveNode>,
        ctx: Arc<MasterContext>,
        conn: TcpConnection,
    ) -> (Arc<Self>, FrameReader) {
        let peer_addr = conn.peer_addr();
        let (reader, writer) = conn.into_split();
        let session = &ctx.session;
        let tickets = TicketRegistry::new(
            node.name(),
            session.ticket_pool_size,
            session.ticket_reserve_timeout,
        );
        let (remerge_tx, remerge_rx) = mpsc::channel(session.remerge_queue_depth);
        let (shutdown, _) = watch::channel(false);
        let liveness = LivenessTracker::new(node.timeout());
        let connection = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            node,
            ctx,
            peer_addr,
            writer,
            tickets,
            state: Mutex::new(NodeState::Connecting),
            reached_available: AtomicBool::new(false),
            replaying: AtomicBool::new(false),
            liveness,
            remerge: Mutex::new(RemergeProgress::default()),
            remerge_tx,
            remerge_rx: Mutex::new(Some(remerge_rx)),
            shutdown,
        });
        (connection, reader)
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The node this session belongs to.
    pub fn node(&self) -> &Arc<SlaveNode> {
        &self.node
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Remote address of the node.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Commands sent and not yet answered.
    pub fn outstanding_commands(&self) -> usize {
        self.tickets.outstanding()
    }

    /// Counters of the current or most recent remerge.
    pub fn remerge_stats(&self) -> RemergeStats {
        self.remerge.lock().stats
    }

    /// Probe counters.
    pub fn liveness_stats(&self) -> LivenessStats {
        self.liveness.stats()
    }

    /// Whether this session has completed a remerge.
    pub fn has_been_available(&self) -> bool {
        self.reached_available.load(Ordering::SeqCst)
    }

    /// Writes the handshake acceptance and spawns the session tasks.
    pub(crate) async fn start(self: &Arc<Self>, reader: FrameReader) -> Result<()> {
        let frame = HandshakeReply::Accepted.to_frame()?;
        if let Err(e) = self.writer.write_frame(&frame).await {
            self.go_offline(&format!("handshake reply failed: {e}"));
            return Err(e.into());
        }
        self.liveness.record_traffic();

        tokio::spawn(self.clone().read_loop(reader));
        tokio::spawn(self.clone().liveness_loop());
        if let Some(entries) = self.remerge_rx.lock().take() {
            tokio::spawn(self.clone().reconcile_worker(entries));
        }
        tokio::spawn(self.clone().establish());
        Ok(())
    }

    /// Turns the peer away after the session lost the race to attach.
    pub(crate) async fn refuse(&self, reason: &str) {
        *self.state.lock() = NodeState::Offline;
        self.tickets.invalidate_all();
        if let Ok(frame) = (HandshakeReply::Rejected {
            reason: reason.to_string(),
        })
        .to_frame()
        {
            let _ = self.writer.write_frame(&frame).await;
        }
        let _ = self.writer.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Sends `command` and waits for the node's answer.
    ///
    /// Timeouts and protocol violations force the node offline before the
    /// error is returned. Write failures are charged to the node's error
    /// budget. Failures the node reports itself come back as
    /// [`NodeError::Remote`] and leave the session alone.
    pub async fn issue(&self, command: Command) -> Result<Reply> {
        if self.state() == NodeState::Offline {
            return Err(self.unavailable());
        }
        let reserved = self.tickets.reserve().await?;
        let pending = match self.tickets.send(reserved, &command, &self.writer).await {
            Ok(pending) => pending,
            Err(e) => return Err(self.fail(e)),
        };
        let response = match self.tickets.await_response(pending, self.node.timeout()).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };
        response.map_err(NodeError::Remote)
    }

    /// Deletes a path on the node.
    pub async fn delete(&self, path: &VfsPath) -> Result<()> {
        let reply = self
            .issue(Command::Delete {
                path: path.to_string(),
            })
            .await?;
        self.expect_ack("delete", reply)
    }

    /// Renames a path on the node.
    pub async fn rename(&self, from: &VfsPath, to_dir: &VfsPath, to_name: &str) -> Result<()> {
        let reply = self
            .issue(Command::Rename(RenameRequest {
                from: from.to_string(),
                to_dir: to_dir.to_string(),
                to_name: to_name.to_string(),
            }))
            .await?;
        self.expect_ack("rename", reply)
    }

    /// CRC32 of a file as computed by the node. The value is cached on the
    /// namespace entry when the node holds a replica of it.
    pub async fn checksum(&self, path: &VfsPath) -> Result<u32> {
        let crc = match self
            .issue(Command::Checksum {
                path: path.to_string(),
            })
            .await?
        {
            Reply::Checksum(crc) => crc,
            other => return Err(self.unexpected("checksum", other)),
        };
        if let Some(file) = self.ctx.namespace.file(path) {
            let changed = {
                let mut state = file.lock();
                let changed = state.replicas.contains(self.node.name()) && state.checksum != Some(crc);
                if changed {
                    state.checksum = Some(crc);
                }
                changed
            };
            if changed {
                self.ctx.namespace.mark_file_dirty(path);
            }
        }
        Ok(crc)
    }

    /// Asks the node for its disk status and records the answer.
    pub async fn check_disk_status(&self) -> Result<DiskStatus> {
        match self.issue(Command::CheckDiskStatus).await? {
            Reply::DiskStatus(status) => {
                self.node.update_disk_status(status);
                Ok(status)
            }
            other => Err(self.unexpected("checkdiskstatus", other)),
        }
    }

    /// Round trip of a liveness probe.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let reply = self.issue(Command::Ping).await?;
        self.expect_ack("ping", reply)?;
        Ok(started.elapsed())
    }

    /// Aborts a transfer running on the node.
    pub async fn abort_transfer(&self, transfer_id: u64, reason: &str) -> Result<()> {
        let reply = self
            .issue(Command::AbortTransfer(AbortTransferRequest {
                transfer_id,
                reason: reason.to_string(),
            }))
            .await?;
        self.expect_ack("aborttransfer", reply)
    }

    /// Tells the node to shut down, then ends the session.
    pub async fn shutdown_node(&self) -> Result<()> {
        let reply = self.issue(Command::Shutdown).await;
        self.go_offline("shutdown requested");
        reply.and_then(|r| self.expect_ack("shutdown", r))
    }

    fn expect_ack(&self, command: &str, reply: Reply) -> Result<()> {
        match reply {
            Reply::Ack => Ok(()),
            other => Err(self.unexpected(command, other)),
        }
    }

    fn unexpected(&self, command: &str, reply: Reply) -> NodeError {
        self.fail(NodeError::Protocol(format!(
            "unexpected reply {reply:?} to {command}"
        )))
    }

    /// Applies the session consequences of a failed command and hands the error back.
    fn fail(&self, error: NodeError) -> NodeError {
        match &error {
            NodeError::Transport(e) if !e.is_protocol_violation() => {
                if self.node.record_network_error(&e.to_string()) {
                    self.go_offline(&format!("error budget exhausted: {e}"));
                }
            }
            e if e.is_node_fatal() => {
                self.node.record_network_error(&e.to_string());
                self.go_offline(&e.to_string());
            }
            _ => {}
        }
        error
    }

    fn unavailable(&self) -> NodeError {
        NodeError::NodeUnavailable {
            node: self.node.name().to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Ends the session. Safe to call any number of times from any task.
    ///
    /// Every outstanding command fails with `NodeUnavailable`, in-flight
    /// transfers are forgotten and the session tasks stop.
    pub fn go_offline(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == NodeState::Offline {
                return;
            }
            *state = NodeState::Offline;
        }
        let woken = self.tickets.invalidate_all();
        let _ = self.shutdown.send(true);
        let transfers = self.node.clear_transfers();
        self.node.set_last_error(reason);
        self.node.detach(self.id);
        info!(
            node = %self.node.name(),
            session = self.id,
            reason,
            woken,
            transfers,
            "node offline"
        );
        if self.has_been_available() {
            self.ctx
                .publish(NodeEvent::Removed(self.node.name().to_string()));
        }
    }

    async fn establish(self: Arc<Self>) {
        if let Err(e) = self.probe_capabilities().await {
            self.go_offline(&format!("capability probe failed: {e}"));
            return;
        }
        // Queued operations go first so the listing already reflects them.
        if !self.node.record().queued_ops.is_empty() {
            self.replay_queue().await;
        }
        if let Err(e) = self.begin_remerge(self.ctx.session.partial_remerge).await {
            self.go_offline(&format!("remerge request failed: {e}"));
        }
    }

    async fn probe_capabilities(&self) -> Result<()> {
        let max_path = match self.issue(Command::MaxPathLength).await? {
            Reply::MaxPathLength(n) => n,
            other => return Err(self.unexpected("maxpath", other)),
        };
        let tls = match self.issue(Command::TlsCapability).await? {
            Reply::TlsCapability(tls) => tls,
            other => return Err(self.unexpected("tlscapability", other)),
        };
        self.node.set_capabilities(max_path, tls);
        debug!(node = %self.node.name(), max_path, tls, "capabilities probed");
        Ok(())
    }

    /// Moves into `Reconciling` and asks the node for its listing.
    async fn begin_remerge(&self, allow_partial: bool) -> Result<()> {
        let last_remerge = self.node.record().last_remerge_ms();
        let partial = allow_partial && last_remerge.is_some();
        let cutoff_ms = match last_remerge {
            Some(last) if partial => {
                last.saturating_sub(self.ctx.session.remerge_cutoff.as_millis() as u64)
            }
            _ => 0,
        };
        let started_ms = now_ms();
        {
            let mut state = self.state.lock();
            match *state {
                NodeState::Connecting | NodeState::Available => *state = NodeState::Reconciling,
                NodeState::Offline => return Err(self.unavailable()),
                NodeState::Reconciling => {
                    return Err(NodeError::InvalidState {
                        node: self.node.name().to_string(),
                        state: NodeState::Reconciling.as_str(),
                        operation: "remerge",
                    })
                }
            }
        }
        *self.remerge.lock() = RemergeProgress {
            partial,
            started_ms,
            stats: RemergeStats::default(),
        };
        info!(node = %self.node.name(), partial, cutoff_ms, "remerge requested");

        let reply = self
            .issue(Command::Remerge(RemergeRequest {
                path: VfsPath::root().to_string(),
                partial,
                cutoff_ms,
                master_time_ms: started_ms,
            }))
            .await?;
        self.expect_ack("remerge", reply)?;
        if self.ctx.throttle.is_paused() {
            self.send_throttle(ThrottleAction::Pause).await;
        }
        Ok(())
    }

    /// Runs a full remerge on an available node.
    pub async fn force_remerge(&self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Available {
            return Err(NodeError::InvalidState {
                node: self.node.name().to_string(),
                state: state.as_str(),
                operation: "remerge",
            });
        }
        self.begin_remerge(false).await
    }

    /// Passes a backpressure decision on to a reconciling node.
    pub async fn send_throttle(&self, action: ThrottleAction) {
        if self.state() != NodeState::Reconciling {
            return;
        }
        let command = match action {
            ThrottleAction::Pause => Command::RemergePause,
            ThrottleAction::Resume => Command::RemergeResume,
        };
        let name = command.name();
        match self.issue(command).await {
            Ok(_) => debug!(node = %self.node.name(), command = name, "throttle sent"),
            Err(e) => warn!(node = %self.node.name(), command = name, error = %e, "throttle failed"),
        }
    }

    fn finish_remerge(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != NodeState::Reconciling {
                return;
            }
            *state = NodeState::Available;
        }
        let (started_ms, stats) = {
            let progress = self.remerge.lock();
            (progress.started_ms, progress.stats)
        };
        self.node
            .update_record(|r| r.set_property(PROP_LAST_REMERGE_MS, started_ms));
        let first = !self.reached_available.swap(true, Ordering::SeqCst);
        info!(
            node = %self.node.name(),
            first,
            directories = stats.directories,
            files_created = stats.files_created,
            replicas_added = stats.replicas_added,
            conflicts = stats.conflicts,
            replicas_unlinked = stats.replicas_unlinked,
            "remerge complete, node available"
        );
        self.ctx
            .publish(NodeEvent::Available(self.node.name().to_string()));

        if !self.node.record().queued_ops.is_empty() {
            self.spawn_replay();
        }
    }

    fn spawn_replay(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move { session.replay_queue().await });
    }

    async fn replay_queue(&self) {
        if self.replaying.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = OfflineOperationQueue::new(self.node.clone());
        queue.replay(self, &self.ctx.namespace).await;
        self.replaying.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let frame = tokio::select! {
                frame = reader.read_frame() => frame,
                _ = shutdown.changed() => break,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(TransportError::ConnectionClosed) => {
                    self.go_offline("connection closed by node");
                    break;
                }
                Err(e) if e.is_protocol_violation() => {
                    error!(node = %self.node.name(), error = %e, "protocol violation");
                    self.go_offline(&format!("protocol violation: {e}"));
                    break;
                }
                Err(e) => {
                    self.node.record_network_error(&e.to_string());
                    self.go_offline(&format!("read failed: {e}"));
                    break;
                }
            };
            self.liveness.record_traffic();
            let inbound = match Inbound::from_frame(&frame) {
                Ok(inbound) => inbound,
                Err(e) => {
                    error!(node = %self.node.name(), error = %e, "protocol violation");
                    self.go_offline(&format!("protocol violation: {e}"));
                    break;
                }
            };
            if let Err(reason) = self.dispatch(inbound, &mut shutdown).await {
                error!(node = %self.node.name(), %reason, "protocol violation");
                self.go_offline(&format!("protocol violation: {reason}"));
                break;
            }
        }
        if let Err(e) = self.writer.shutdown().await {
            trace!(node = %self.node.name(), error = %e, "writer shutdown");
        }
        debug!(node = %self.node.name(), session = self.id, "read loop stopped");
    }

    async fn dispatch(
        &self,
        inbound: Inbound,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), String> {
        match inbound {
            Inbound::Response { ticket, response } => {
                self.tickets.complete(ticket, response);
            }
            Inbound::RemergeEntry(entry) => {
                let state = self.state();
                if state != NodeState::Reconciling {
                    return Err(format!(
                        "remerge listing for {} while {state}",
                        entry.directory
                    ));
                }
                // Blocks reading while the worker is behind.
                tokio::select! {
                    sent = self.remerge_tx.send(entry) => {
                        if sent.is_err() {
                            return Err("reconcile worker gone".to_string());
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            }
            Inbound::DiskStatus(status) => self.node.update_disk_status(status),
            Inbound::TransferStatus(status) => self.on_transfer_status(status),
            Inbound::Unknown { opcode } => {
                warn!(node = %self.node.name(), opcode, "discarding message of unknown kind");
            }
        }
        Ok(())
    }

    fn on_transfer_status(&self, status: TransferStatus) {
        let Some(done) = self.node.update_transfer(status) else {
            return;
        };
        if let Some(reason) = &done.error {
            self.node
                .set_last_error(&format!("transfer {} failed: {reason}", done.transfer_id));
            return;
        }
        let Ok(path) = VfsPath::new(&done.path) else {
            warn!(node = %self.node.name(), path = %done.path, "transfer for an invalid path");
            return;
        };
        if let Some(file) = self.ctx.namespace.file(&path) {
            file.lock().xfer_time_ms += done.elapsed_ms;
            self.ctx.namespace.mark_file_dirty(&path);
        }
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.ctx.session.liveness_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.liveness.poll() {
                LivenessVerdict::Idle => {}
                LivenessVerdict::ProbeDue => {
                    self.liveness.record_probe_sent();
                    tokio::spawn(self.clone().probe());
                }
                LivenessVerdict::Expired { silent_for } => {
                    self.node.record_network_error("liveness timeout");
                    self.go_offline(&format!(
                        "no traffic for {} ms",
                        silent_for.as_millis()
                    ));
                    break;
                }
            }
        }
    }

    async fn probe(self: Arc<Self>) {
        match self.ping().await {
            Ok(rtt) => self.liveness.record_probe_answered(rtt),
            Err(NodeError::NodeUnavailable { .. }) => self.liveness.record_probe_failed(),
            Err(e) => {
                self.liveness.record_probe_failed();
                self.go_offline(&format!("ping failed: {e}"));
            }
        }
    }

    async fn reconcile_worker(self: Arc<Self>, mut entries: mpsc::Receiver<RemergeEntry>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let entry = tokio::select! {
                entry = entries.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            match self.state() {
                NodeState::Reconciling => {}
                NodeState::Offline => break,
                state => {
                    warn!(node = %self.node.name(), directory = %entry.directory, %state, "dropping listing outside a remerge");
                    continue;
                }
            }
            let partial = self.remerge.lock().partial;
            let reconciler =
                RemergeReconciler::new(self.ctx.namespace.clone(), self.node.name(), partial);
            match reconciler.apply(&entry) {
                Ok(outcome) => {
                    self.remerge.lock().stats += outcome.stats;
                    if !outcome.actions.is_empty() {
                        self.dispatch_actions(outcome.actions);
                    }
                }
                Err(e) => {
                    error!(
                        node = %self.node.name(),
                        directory = %entry.directory,
                        error = %e,
                        "remerge aborted"
                    );
                    self.go_offline(&format!("remerge aborted: {e}"));
                    break;
                }
            }
            if entry.is_final {
                self.finish_remerge();
            }
        }
        debug!(node = %self.node.name(), session = self.id, "reconcile worker stopped");
    }

    /// Runs follow-up commands outside the worker so a full remerge channel
    /// cannot stall their responses.
    fn dispatch_actions(self: &Arc<Self>, actions: Vec<RemoteAction>) {
        let session = self.clone();
        tokio::spawn(async move {
            for action in actions {
                match session.issue(action.to_command()).await {
                    Ok(_) => trace!(node = %session.node.name(), ?action, "remerge follow-up done"),
                    Err(e) if e.is_remote_not_found() => {
                        debug!(node = %session.node.name(), ?action, "remerge follow-up target already gone")
                    }
                    Err(NodeError::NodeUnavailable { .. }) => break,
                    Err(e) => {
                        warn!(node = %session.node.name(), ?action, error = %e, "remerge follow-up failed")
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for SlaveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveConnection")
            .field("id", &self.id)
            .field("node", &self.node.name())
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
