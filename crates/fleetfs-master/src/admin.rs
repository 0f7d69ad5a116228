//! Administrative operations over the node registry.
//!
//! Every report is `Serialize` so a front end can render it as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetfs_meta::NodeRecord;
use fleetfs_transport::keepalive::LivenessStats;
use serde::Serialize;
use tracing::info;

use crate::error::{NodeError, Result};
use crate::node::{NodeState, SlaveNode, Throughput, TransferRate};
use crate::registry::SlaveRegistry;
use crate::remerge::RemergeStats;

/// Status of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Node name.
    pub name: String,
    /// Current state.
    pub state: NodeState,
    /// Remote address of the live session.
    pub peer_addr: Option<String>,
    /// Most recent failure reason.
    pub last_error: Option<String>,
    /// Network errors inside the decay window.
    pub recent_errors: usize,
    /// Free bytes from the last disk report.
    pub free_bytes: Option<u64>,
    /// Total bytes from the last disk report.
    pub total_bytes: Option<u64>,
    /// Transfers in flight.
    pub transfers: usize,
    /// Operations waiting in the offline queue.
    pub queued_operations: usize,
    /// Commands awaiting an answer.
    pub outstanding_commands: usize,
    /// Files the namespace lists on this node.
    pub files: usize,
    /// Accepted address masks.
    pub masks: Vec<String>,
    /// Counters of the session's current or last remerge.
    pub remerge: Option<RemergeStats>,
    /// Probe counters of the live session.
    pub liveness: Option<LivenessStats>,
}

/// Transfer throughput of one node or of all nodes.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThroughputReport {
    /// Rate over in-flight transfers.
    pub rate: TransferRate,
    /// Totals over finished transfers.
    pub totals: Throughput,
    /// Transfers in flight.
    pub transfers: usize,
}

/// Disk capacity of one node or of all nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    /// Free bytes.
    pub free_bytes: u64,
    /// Total bytes.
    pub total_bytes: u64,
    /// Free bytes above each node's reserve, available nodes only.
    pub usable_bytes: u64,
    /// Nodes that have reported disk status.
    pub nodes_reporting: usize,
}

/// Administrative entry point.
#[derive(Clone)]
pub struct MasterAdmin {
    registry: Arc<SlaveRegistry>,
}

impl MasterAdmin {
    /// Wraps a registry.
    pub fn new(registry: Arc<SlaveRegistry>) -> Self {
        Self { registry }
    }

    /// Adds a node with the given masks and properties.
    pub fn add_node(
        &self,
        name: &str,
        masks: Vec<String>,
        properties: BTreeMap<String, String>,
    ) -> Result<NodeReport> {
        let mut record = NodeRecord::new(name);
        record.masks = masks;
        for (key, value) in properties {
            record.set_property(&key, value);
        }
        let node = self.registry.add_node(record)?;
        Ok(self.report(&node))
    }

    /// Ends the node's session and deletes it.
    pub fn remove_node(&self, name: &str) -> Result<()> {
        self.registry.remove_node(name).map(|_| ())
    }

    /// Reports every node, sorted by name.
    pub fn list_nodes(&self) -> Vec<NodeReport> {
        self.registry
            .nodes()
            .iter()
            .map(|node| self.report(node))
            .collect()
    }

    /// Reports one node.
    pub fn node_report(&self, name: &str) -> Result<NodeReport> {
        let node = self.lookup(name)?;
        Ok(self.report(&node))
    }

    /// Ends the node's session now.
    pub fn force_offline(&self, name: &str, reason: &str) -> Result<()> {
        let node = self.lookup(name)?;
        let session = node.session().ok_or_else(|| NodeError::InvalidState {
            node: name.to_string(),
            state: NodeState::Offline.as_str(),
            operation: "force offline",
        })?;
        info!(node = %name, reason, "forcing node offline");
        session.go_offline(&format!("forced offline: {reason}"));
        Ok(())
    }

    /// Re-runs a full remerge on an available node.
    pub async fn force_remerge(&self, name: &str) -> Result<()> {
        let node = self.lookup(name)?;
        let session = node.session().ok_or_else(|| NodeError::NodeUnavailable {
            node: name.to_string(),
        })?;
        info!(node = %name, "forcing remerge");
        session.force_remerge().await
    }

    /// Throughput of one node, or the sum over all nodes.
    pub fn throughput(&self, name: Option<&str>) -> Result<ThroughputReport> {
        let nodes = self.select(name)?;
        let mut report = ThroughputReport::default();
        for node in nodes {
            report.rate += node.transfer_rate();
            let totals = node.throughput();
            report.totals.bytes_sent += totals.bytes_sent;
            report.totals.bytes_received += totals.bytes_received;
            report.totals.transfers_completed += totals.transfers_completed;
            report.totals.transfers_failed += totals.transfers_failed;
            report.transfers += node.transfers().len();
        }
        Ok(report)
    }

    /// Capacity of one node, or the sum over all nodes.
    pub fn capacity(&self, name: Option<&str>) -> Result<CapacityReport> {
        let nodes = self.select(name)?;
        let mut report = CapacityReport::default();
        for node in nodes {
            if let Some(disk) = node.disk_status() {
                report.free_bytes += disk.free_bytes;
                report.total_bytes += disk.total_bytes;
                report.nodes_reporting += 1;
            }
            if node.is_available() {
                report.usable_bytes += node.usable_space();
            }
        }
        Ok(report)
    }

    fn lookup(&self, name: &str) -> Result<Arc<SlaveNode>> {
        self.registry
            .node(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()))
    }

    fn select(&self, name: Option<&str>) -> Result<Vec<Arc<SlaveNode>>> {
        match name {
            Some(name) => Ok(vec![self.lookup(name)?]),
            None => Ok(self.registry.nodes()),
        }
    }

    fn report(&self, node: &SlaveNode) -> NodeReport {
        let session = node.session();
        let record = node.record();
        let disk = node.disk_status();
        NodeReport {
            name: node.name().to_string(),
            state: session
                .as_ref()
                .map(|s| s.state())
                .unwrap_or(NodeState::Offline),
            peer_addr: session.as_ref().map(|s| s.peer_addr().to_string()),
            last_error: node.last_error(),
            recent_errors: node.recent_errors(),
            free_bytes: disk.map(|d| d.free_bytes),
            total_bytes: disk.map(|d| d.total_bytes),
            transfers: node.transfers().len(),
            queued_operations: record.queued_ops.len(),
            outstanding_commands: session.as_ref().map_or(0, |s| s.outstanding_commands()),
            files: self
                .registry
                .context()
                .namespace
                .files_on_node(node.name())
                .len(),
            masks: record.masks,
            remerge: session.as_ref().map(|s| s.remerge_stats()),
            liveness: session.as_ref().map(|s| s.liveness_stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::RemergeThrottle;
    use crate::config::SessionConfig;
    use crate::context::MasterContext;
    use fleetfs_meta::{CommitQueue, CommitQueueConfig, Namespace, VfsPath};
    use fleetfs_transport::message::DiskStatus;

    fn admin() -> MasterAdmin {
        let commits = Arc::new(CommitQueue::new(CommitQueueConfig::default()));
        let ctx = MasterContext::new(
            Arc::new(Namespace::new(commits)),
            RemergeThrottle::new(100, 50),
            SessionConfig::default(),
        );
        MasterAdmin::new(SlaveRegistry::new(ctx))
    }

    #[test]
    fn test_add_list_remove() {
        let admin = admin();
        let report = admin
            .add_node(
                "nodeB",
                vec!["10.0.0.0/8".into()],
                BTreeMap::from([("timeout".to_string(), "2000".to_string())]),
            )
            .unwrap();
        assert_eq!(report.state, NodeState::Offline);
        assert_eq!(report.masks, vec!["10.0.0.0/8".to_string()]);
        admin.add_node("nodeA", vec![], BTreeMap::new()).unwrap();

        let names: Vec<_> = admin.list_nodes().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["nodeA", "nodeB"]);

        admin.remove_node("nodeA").unwrap();
        assert!(matches!(
            admin.node_report("nodeA"),
            Err(NodeError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_force_offline_requires_session() {
        let admin = admin();
        admin.add_node("nodeA", vec![], BTreeMap::new()).unwrap();
        assert!(matches!(
            admin.force_offline("nodeA", "test"),
            Err(NodeError::InvalidState { .. })
        ));
        assert!(matches!(
            admin.force_offline("nodeZ", "test"),
            Err(NodeError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_force_remerge_on_offline_node() {
        let admin = admin();
        admin.add_node("nodeA", vec![], BTreeMap::new()).unwrap();
        assert!(matches!(
            admin.force_remerge("nodeA").await,
            Err(NodeError::NodeUnavailable { .. })
        ));
    }

    #[test]
    fn test_capacity_and_report_counts() {
        let admin = admin();
        admin.add_node("nodeA", vec![], BTreeMap::new()).unwrap();
        admin.add_node("nodeB", vec![], BTreeMap::new()).unwrap();
        let node = admin.registry.node("nodeA").unwrap();
        node.update_disk_status(DiskStatus {
            free_bytes: 400,
            total_bytes: 1_000,
            ..DiskStatus::default()
        });
        admin
            .registry
            .context()
            .namespace
            .add_file(&VfsPath::new("/d").unwrap(), "f", 1, 1, "nodeA")
            .unwrap();

        let total = admin.capacity(None).unwrap();
        assert_eq!(total.free_bytes, 400);
        assert_eq!(total.total_bytes, 1_000);
        assert_eq!(total.nodes_reporting, 1);
        assert_eq!(total.usable_bytes, 0);
        assert_eq!(admin.capacity(Some("nodeB")).unwrap().nodes_reporting, 0);

        let report = admin.node_report("nodeA").unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.free_bytes, Some(400));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "Offline");
    }

    #[test]
    fn test_throughput_of_idle_nodes() {
        let admin = admin();
        admin.add_node("nodeA", vec![], BTreeMap::new()).unwrap();
        let report = admin.throughput(None).unwrap();
        assert_eq!(report.transfers, 0);
        assert_eq!(report.rate, TransferRate::default());
        assert!(admin.throughput(Some("missing")).is_err());
    }
}
