//! The set of configured storage nodes and the entry point for their connections.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use fleetfs_meta::{NodeRecord, NodeRecordSource, QueuedOperation, VfsPath};
use fleetfs_transport::message::HandshakeReply;
use fleetfs_transport::tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::NodeBootstrap;
use crate::connection::SlaveConnection;
use crate::context::MasterContext;
use crate::error::{NodeError, Result};
use crate::node::{NodeEvent, NodeState, SlaveNode};
use crate::offline_queue::OfflineOperationQueue;

/// How a broadcast operation reached the nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Nodes that carried it out, or no longer had the path.
    pub delivered: usize,
    /// Nodes that will get it from their offline queue.
    pub queued: usize,
    /// Nodes that refused it.
    pub failed: usize,
}

enum Delivery {
    Delivered,
    Queued,
    Failed,
}

/// Registry of storage nodes, keyed by name.
pub struct SlaveRegistry {
    ctx: Arc<MasterContext>,
    nodes: DashMap<String, Arc<SlaveNode>>,
    transport: TcpTransport,
}

impl SlaveRegistry {
    /// Creates an empty registry.
    pub fn new(ctx: Arc<MasterContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            nodes: DashMap::new(),
            transport: TcpTransport::new(TcpTransportConfig::default()),
        })
    }

    /// Shared services.
    pub fn context(&self) -> &Arc<MasterContext> {
        &self.ctx
    }

    /// Installs persisted records, then folds in the nodes declared in the
    /// config. Declared nodes without a record are created.
    pub fn load(&self, records: Vec<NodeRecord>, bootstrap: &[NodeBootstrap]) {
        let persisted = records.len();
        for record in records {
            let node = SlaveNode::new(record, self.ctx.commits().clone());
            self.nodes.insert(node.name().to_string(), node);
        }
        let mut created = 0;
        for entry in bootstrap {
            match self.node(&entry.name) {
                Some(node) => node.update_record(|record| entry.apply_to(record)),
                None => {
                    if self.add_node(entry.to_record()).is_ok() {
                        created += 1;
                    }
                }
            }
        }
        info!(persisted, created, total = self.nodes.len(), "node registry loaded");
    }

    /// Adds a node. Fails if the name is taken.
    pub fn add_node(&self, record: NodeRecord) -> Result<Arc<SlaveNode>> {
        let name = record.name.clone();
        let node = match self.nodes.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(NodeError::NodeExists(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let node = SlaveNode::new(record, self.ctx.commits().clone());
                slot.insert(node.clone());
                node
            }
        };
        node.update_record(|_| ());
        info!(node = %name, "node added");
        self.ctx.publish(NodeEvent::Added(name));
        Ok(node)
    }

    /// Deletes a node, ending its session and dropping its record.
    pub fn remove_node(&self, name: &str) -> Result<Arc<SlaveNode>> {
        let (_, node) = self
            .nodes
            .remove(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()))?;
        if let Some(session) = node.session() {
            session.go_offline("node removed");
        }
        self.ctx
            .commits()
            .schedule(fleetfs_meta::CommitKey::Node(name.to_string()));
        info!(node = %name, "node removed");
        self.ctx.publish(NodeEvent::Deleted(name.to_string()));
        Ok(node)
    }

    /// Looks a node up by name.
    pub fn node(&self, name: &str) -> Option<Arc<SlaveNode>> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    /// Every node, sorted by name.
    pub fn nodes(&self) -> Vec<Arc<SlaveNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Nodes currently serving traffic.
    pub fn available_nodes(&self) -> Vec<Arc<SlaveNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.is_available())
            .collect()
    }

    /// Subscribes to node lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.subscribe()
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Up to `count` available nodes not in `excluding`, ordered by usable
    /// space: most first, or least first when `ascending`.
    pub fn find_by_available_space(
        &self,
        count: usize,
        excluding: &[&str],
        ascending: bool,
    ) -> Vec<Arc<SlaveNode>> {
        let mut candidates: Vec<_> = self
            .available_nodes()
            .into_iter()
            .filter(|n| !excluding.contains(&n.name()))
            .map(|n| (n.usable_space(), n))
            .collect();
        candidates.sort_by(|(a_space, a), (b_space, b)| {
            let by_space = if ascending {
                a_space.cmp(b_space)
            } else {
                b_space.cmp(a_space)
            };
            by_space.then_with(|| a.name().cmp(b.name()))
        });
        candidates.into_iter().take(count).map(|(_, n)| n).collect()
    }

    /// The available node with the least usable space.
    pub fn find_smallest_free_node(&self) -> Option<Arc<SlaveNode>> {
        self.find_by_available_space(1, &[], true).into_iter().next()
    }

    /// Usable space summed over available nodes.
    pub fn total_usable_space(&self) -> u64 {
        self.available_nodes()
            .iter()
            .map(|n| n.usable_space())
            .sum()
    }

    // ------------------------------------------------------------------
    // Broadcast operations
    // ------------------------------------------------------------------

    /// Deletes `path` on every node; nodes that cannot take it now get it queued.
    pub async fn broadcast_delete(&self, path: &VfsPath) -> BroadcastReport {
        self.broadcast(QueuedOperation::delete(path.clone())).await
    }

    /// Renames `from` to `to_dir/to_name` on every node, queueing where needed.
    pub async fn broadcast_rename(
        &self,
        from: &VfsPath,
        to_dir: &VfsPath,
        to_name: &str,
    ) -> Result<BroadcastReport> {
        let destination = to_dir.join(to_name)?;
        Ok(self
            .broadcast(QueuedOperation::rename(from.clone(), destination))
            .await)
    }

    async fn broadcast(&self, op: QueuedOperation) -> BroadcastReport {
        let mut deliveries = JoinSet::new();
        for node in self.nodes() {
            let op = op.clone();
            deliveries.spawn(deliver_or_queue(node, op));
        }
        let mut report = BroadcastReport::default();
        while let Some(result) = deliveries.join_next().await {
            match result {
                Ok(Delivery::Delivered) => report.delivered += 1,
                Ok(Delivery::Queued) => report.queued += 1,
                Ok(Delivery::Failed) => report.failed += 1,
                Err(e) => {
                    warn!(error = %e, "broadcast task failed");
                    report.failed += 1;
                }
            }
        }
        debug!(
            source = %op.source,
            delivered = report.delivered,
            queued = report.queued,
            failed = report.failed,
            "broadcast finished"
        );
        report
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Binds the listener nodes connect to.
    pub async fn listen(&self, addr: SocketAddr) -> Result<TcpListener> {
        Ok(self.transport.listen(&addr.to_string()).await?)
    }

    /// Runs the handshake on a fresh connection and starts its session.
    ///
    /// The identity line must arrive within the handshake timeout and name a
    /// configured node that has no live session and whose masks admit the
    /// peer address. Otherwise the peer gets a rejection and the connection
    /// is closed.
    pub async fn accept(&self, mut conn: TcpConnection) -> Result<Arc<SlaveConnection>> {
        let peer = conn.peer_addr();
        let received = tokio::time::timeout(
            self.ctx.session.handshake_timeout,
            conn.reader().read_identity(),
        )
        .await;
        let identity = match received {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                return Self::reject(conn, format!("bad identity: {e}")).await;
            }
            Err(_) => {
                return Self::reject(conn, "no identity received".to_string()).await;
            }
        };
        let Some(node) = self.node(&identity) else {
            return Self::reject(conn, format!("unknown node {identity}")).await;
        };
        if node.session().is_some() {
            return Self::reject(conn, format!("node {identity} is already connected")).await;
        }
        if !node.allows_address(peer.ip()) {
            return Self::reject(conn, format!("address {} not allowed for {identity}", peer.ip()))
                .await;
        }

        let (session, reader) = SlaveConnection::new(node.clone(), self.ctx.clone(), conn);
        if !node.attach(&session) {
            let reason = format!("node {identity} is already connected");
            warn!(%peer, %reason, "rejecting node connection");
            session.refuse(&reason).await;
            return Err(NodeError::Rejected(reason));
        }
        node.clear_errors();
        session.start(reader).await?;
        info!(node = %identity, %peer, session = session.id(), "node connected");
        Ok(session)
    }

    async fn reject(conn: TcpConnection, reason: String) -> Result<Arc<SlaveConnection>> {
        warn!(peer = %conn.peer_addr(), %reason, "rejecting node connection");
        let reply = HandshakeReply::Rejected {
            reason: reason.clone(),
        };
        if let Ok(frame) = reply.to_frame() {
            let _ = conn.writer().write_frame(&frame).await;
        }
        let _ = conn.writer().shutdown().await;
        Err(NodeError::Rejected(reason))
    }

    /// Accepts node connections until `shutdown` flips.
    pub async fn run_accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?listener.local_addr().ok(), "accepting node connections");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.transport.accept(&listener) => accepted,
                _ = shutdown.changed() => break,
            };
            match accepted {
                Ok(conn) => {
                    let registry = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = registry.accept(conn).await {
                            debug!(error = %e, "connection not established");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        info!("accept loop stopped");
    }

    /// Watches the commit backlog and pauses or resumes reconciling nodes.
    pub async fn run_backpressure_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.session.liveness_check_interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let Some(action) = self.ctx.throttle.evaluate(self.ctx.commits().len()) else {
                continue;
            };
            for node in self.nodes() {
                if let Some(session) = node.session() {
                    if session.state() == NodeState::Reconciling {
                        tokio::spawn(async move { session.send_throttle(action).await });
                    }
                }
            }
        }
    }

    /// Ends every session.
    pub fn disconnect_all(&self, reason: &str) {
        for node in self.nodes() {
            if let Some(session) = node.session() {
                session.go_offline(reason);
            }
        }
    }
}

impl NodeRecordSource for SlaveRegistry {
    fn node_record(&self, name: &str) -> Option<NodeRecord> {
        self.node(name).map(|n| n.record())
    }
}

async fn deliver_or_queue(node: Arc<SlaveNode>, op: QueuedOperation) -> Delivery {
    let queue = OfflineOperationQueue::new(node.clone());
    let session = node
        .session()
        .filter(|s| s.state() == NodeState::Available);
    if let Some(session) = session {
        match OfflineOperationQueue::execute(&session, &op).await {
            Ok(()) => return Delivery::Delivered,
            Err(e) if e.is_remote_not_found() => return Delivery::Delivered,
            Err(e) if e.is_node_fatal() || matches!(e, NodeError::NodeUnavailable { .. }) => {
                debug!(node = %node.name(), error = %e, "node lost during broadcast, queueing");
            }
            Err(e) => {
                warn!(node = %node.name(), source = %op.source, error = %e, "node refused operation");
                return Delivery::Failed;
            }
        }
    }
    match queue.enqueue(op) {
        Ok(()) => Delivery::Queued,
        Err(e) => {
            warn!(node = %node.name(), error = %e, "could not queue operation");
            Delivery::Failed
        }
    }
}
