//! Deletes and renames held for nodes that were not available when issued.
//!
//! Entries live in the node's persisted record, so they survive master
//! restarts. They are replayed in order when the node reconnects, before its
//! listing is merged, and again after the remerge for anything queued meanwhile.

use std::sync::Arc;

use fleetfs_meta::{MetaError, Namespace, QueuedOperation, VfsPath};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::SlaveConnection;
use crate::error::{NodeError, Result};
use crate::node::{NodeState, SlaveNode};

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Operations the node carried out.
    pub completed: usize,
    /// Operations whose source was already gone on the node.
    pub already_absent: usize,
    /// Renames whose destination existed; the node's copy was moved aside.
    pub conflicts: usize,
    /// Operations kept for a later replay.
    pub retained: usize,
}

/// The offline queue of one node.
pub struct OfflineOperationQueue {
    node: Arc<SlaveNode>,
}

impl OfflineOperationQueue {
    /// Queue view over `node`'s record.
    pub fn new(node: Arc<SlaveNode>) -> Self {
        Self { node }
    }

    /// Queues a delete of `path`.
    pub fn enqueue_delete(&self, path: VfsPath) -> Result<()> {
        self.enqueue(QueuedOperation::delete(path))
    }

    /// Queues a rename of `path` to `dest_dir/dest_name`.
    pub fn enqueue_rename(&self, path: VfsPath, dest_dir: &VfsPath, dest_name: &str) -> Result<()> {
        let destination = dest_dir.join(dest_name)?;
        self.enqueue(QueuedOperation::rename(path, destination))
    }

    /// Appends an operation. Only legal while the node is not available; an
    /// identical operation already queued is not repeated.
    pub fn enqueue(&self, op: QueuedOperation) -> Result<()> {
        let state = self.node.state();
        if state == NodeState::Available {
            warn!(node = %self.node.name(), source = %op.source, "refusing to queue for an available node");
            return Err(NodeError::InvalidState {
                node: self.node.name().to_string(),
                state: state.as_str(),
                operation: "queue an offline operation",
            });
        }
        let queued = self.node.update_record(|record| {
            if record.queued_ops.contains(&op) {
                return false;
            }
            record.queued_ops.push(op.clone());
            true
        });
        if queued {
            debug!(node = %self.node.name(), source = %op.source, delete = op.is_delete(), "operation queued");
        }
        Ok(())
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.node.record().queued_ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queued operations in replay order.
    pub fn entries(&self) -> Vec<QueuedOperation> {
        self.node.record().queued_ops
    }

    /// Sends `op` to the node.
    pub(crate) async fn execute(session: &SlaveConnection, op: &QueuedOperation) -> Result<()> {
        match &op.destination {
            None => session.delete(&op.source).await,
            Some(destination) => {
                let dest_dir = destination.parent().ok_or(MetaError::RootDirectory)?;
                session
                    .rename(&op.source, &dest_dir, destination.name())
                    .await
            }
        }
    }

    /// Replays the queue in order through `session` and updates the namespace
    /// to match what the node now holds.
    ///
    /// An entry is removed once the node carried it out or reported its source
    /// as already gone. A rename onto an existing destination moves the node's
    /// copy aside as `<name>.<node>.conflict`. A session failure stops the
    /// pass; other failures keep the entry for the next one.
    pub async fn replay(&self, session: &SlaveConnection, namespace: &Namespace) -> ReplayReport {
        let ops = self.entries();
        let mut report = ReplayReport::default();
        let name = self.node.name().to_string();
        for (index, op) in ops.iter().enumerate() {
            match Self::execute(session, op).await {
                Ok(()) => {
                    self.apply_to_namespace(namespace, op, op.destination.as_ref());
                    self.remove(op);
                    report.completed += 1;
                }
                Err(e) if e.is_remote_not_found() => {
                    debug!(node = %name, source = %op.source, "queued operation target already gone");
                    self.apply_to_namespace(namespace, op, None);
                    self.remove(op);
                    report.already_absent += 1;
                }
                Err(e) if e.is_remote_already_exists() && !op.is_delete() => {
                    match self.move_aside(session, namespace, op).await {
                        Ok(()) => {
                            self.remove(op);
                            report.conflicts += 1;
                        }
                        Err(e) if stops_replay(&e) => {
                            report.retained += ops.len() - index;
                            break;
                        }
                        Err(e) => {
                            warn!(node = %name, source = %op.source, error = %e, "conflict rename failed");
                            report.retained += 1;
                        }
                    }
                }
                Err(e) if stops_replay(&e) => {
                    warn!(node = %name, error = %e, "replay interrupted");
                    report.retained += ops.len() - index;
                    break;
                }
                Err(e) => {
                    warn!(node = %name, source = %op.source, error = %e, "queued operation failed, keeping it");
                    report.retained += 1;
                }
            }
        }
        info!(
            node = %name,
            completed = report.completed,
            already_absent = report.already_absent,
            conflicts = report.conflicts,
            retained = report.retained,
            "offline queue replayed"
        );
        report
    }

    async fn move_aside(
        &self,
        session: &SlaveConnection,
        namespace: &Namespace,
        op: &QueuedOperation,
    ) -> Result<()> {
        let Some(destination) = &op.destination else {
            return Ok(());
        };
        let dest_dir = destination.parent().ok_or(MetaError::RootDirectory)?;
        let aside_name = format!("{}.{}.conflict", destination.name(), self.node.name());
        warn!(
            node = %self.node.name(),
            source = %op.source,
            destination = %destination,
            aside = %aside_name,
            "rename destination exists on node, moving copy aside"
        );
        session.rename(&op.source, &dest_dir, &aside_name).await?;
        let aside = dest_dir.join(&aside_name)?;
        self.apply_to_namespace(namespace, op, Some(&aside));
        Ok(())
    }

    /// Drops the node from `op.source` and, when `moved_to` is set, records the
    /// node's copy there instead.
    fn apply_to_namespace(&self, namespace: &Namespace, op: &QueuedOperation, moved_to: Option<&VfsPath>) {
        let node = self.node.name();
        if let Some(file) = namespace.file(&op.source) {
            let state = file.snapshot();
            if !state.replicas.contains(node) {
                return;
            }
            if let Err(e) = namespace.remove_replica(&op.source, node) {
                debug!(node, source = %op.source, error = %e, "replica already gone");
            }
            if let Some(target) = moved_to {
                self.record_copy(namespace, target, state.size, state.last_modified);
            }
            return;
        }
        // Directories are picked up again at their new place by the next remerge.
        let Some(parent_path) = op.source.parent() else {
            return;
        };
        if let Some(parent) = namespace.directory(&parent_path) {
            let mut guard = parent.lock();
            if guard.is_directory(op.source.name()) {
                if let Err(e) = namespace.unlink_node_from_subtree(&mut guard, op.source.name(), node) {
                    warn!(node, source = %op.source, error = %e, "could not unlink moved directory");
                }
            }
        }
    }

    fn record_copy(&self, namespace: &Namespace, target: &VfsPath, size: u64, last_modified: u64) {
        let node = self.node.name();
        if let Some(existing) = namespace.file(target) {
            if existing.size() == size {
                namespace.add_replica(&existing, node);
            } else {
                debug!(node, path = %target, "size differs at destination, left for remerge");
            }
            return;
        }
        let Some(dir) = target.parent() else {
            return;
        };
        if let Err(e) = namespace.add_file(&dir, target.name(), size, last_modified, node) {
            debug!(node, path = %target, error = %e, "could not record moved copy");
        }
    }

    fn remove(&self, op: &QueuedOperation) {
        self.node.update_record(|record| {
            if let Some(index) = record.queued_ops.iter().position(|queued| queued == op) {
                record.queued_ops.remove(index);
            }
        });
    }
}

fn stops_replay(error: &NodeError) -> bool {
    error.is_node_fatal() || matches!(error, NodeError::NodeUnavailable { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetfs_meta::{CommitQueue, CommitQueueConfig, NodeRecord};

    fn node() -> Arc<SlaveNode> {
        SlaveNode::new(
            NodeRecord::new("nodeA"),
            Arc::new(CommitQueue::new(CommitQueueConfig::default())),
        )
    }

    fn path(raw: &str) -> VfsPath {
        VfsPath::new(raw).unwrap()
    }

    #[test]
    fn test_enqueue_on_offline_node() {
        let node = node();
        let queue = OfflineOperationQueue::new(node.clone());
        queue.enqueue_delete(path("/a/f1")).unwrap();
        queue
            .enqueue_rename(path("/a/f2"), &path("/b"), "f2")
            .unwrap();
        queue.enqueue_delete(path("/a/f1")).unwrap();

        let entries = queue.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_delete());
        assert_eq!(entries[1].destination, Some(path("/b/f2")));
        assert_eq!(node.record().queued_ops, entries);
    }

    #[test]
    fn test_enqueue_schedules_record_commit() {
        let node = node();
        let commits = Arc::new(CommitQueue::new(CommitQueueConfig::default()));
        let node = SlaveNode::new(node.record(), commits.clone());
        OfflineOperationQueue::new(node)
            .enqueue_delete(path("/x"))
            .unwrap();
        assert!(commits.contains(&fleetfs_meta::CommitKey::Node("nodeA".into())));
    }

    #[test]
    fn test_remove_keeps_order() {
        let node = node();
        let queue = OfflineOperationQueue::new(node);
        for name in ["/a", "/b", "/c"] {
            queue.enqueue_delete(path(name)).unwrap();
        }
        queue.remove(&QueuedOperation::delete(path("/b")));
        let sources: Vec<_> = queue.entries().into_iter().map(|op| op.source).collect();
        assert_eq!(sources, vec![path("/a"), path("/c")]);
    }

    #[test]
    fn test_namespace_follow_up_for_rename() {
        let commits = Arc::new(CommitQueue::new(CommitQueueConfig::default()));
        let namespace = Namespace::new(commits);
        let file = namespace
            .add_file(&path("/a"), "f1", 10, 1, "nodeA")
            .unwrap();
        namespace.add_replica(&file, "nodeB");
        let queue = OfflineOperationQueue::new(node());
        let op = QueuedOperation::rename(path("/a/f1"), path("/b/f1"));

        queue.apply_to_namespace(&namespace, &op, op.destination.as_ref());

        assert_eq!(
            namespace.file(&path("/a/f1")).unwrap().replicas(),
            ["nodeB".to_string()].into()
        );
        let moved = namespace.file(&path("/b/f1")).unwrap();
        assert_eq!(moved.size(), 10);
        assert!(moved.has_replica("nodeA"));
    }

    #[test]
    fn test_namespace_follow_up_for_delete_drops_last_replica() {
        let commits = Arc::new(CommitQueue::new(CommitQueueConfig::default()));
        let namespace = Namespace::new(commits);
        namespace
            .add_file(&path("/a"), "f1", 10, 1, "nodeA")
            .unwrap();
        let queue = OfflineOperationQueue::new(node());

        queue.apply_to_namespace(&namespace, &QueuedOperation::delete(path("/a/f1")), None);

        assert!(namespace.file(&path("/a/f1")).is_none());
    }
}
