//! Services shared by the registry and every node session.

use std::sync::Arc;

use fleetfs_meta::{CommitQueue, Namespace};
use tokio::sync::broadcast;
use tracing::trace;

use crate::backpressure::RemergeThrottle;
use crate::config::SessionConfig;
use crate::node::NodeEvent;

const EVENT_CAPACITY: usize = 256;

/// Explicitly constructed master services, handed to each component that needs them.
pub struct MasterContext {
    /// The namespace tree.
    pub namespace: Arc<Namespace>,
    /// Remerge backpressure state.
    pub throttle: RemergeThrottle,
    /// Per-session settings.
    pub session: SessionConfig,
    events: broadcast::Sender<NodeEvent>,
}

impl MasterContext {
    /// Bundles the services.
    pub fn new(namespace: Arc<Namespace>, throttle: RemergeThrottle, session: SessionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            namespace,
            throttle,
            session,
            events,
        })
    }

    /// The commit queue behind the namespace.
    pub fn commits(&self) -> &Arc<CommitQueue> {
        self.namespace.commits()
    }

    /// Publishes a node event; having no subscriber is fine.
    pub fn publish(&self, event: NodeEvent) {
        trace!(?event, subscribers = self.events.receiver_count(), "node event");
        let _ = self.events.send(event);
    }

    /// Subscribes to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
