//! Wiring of the master: storage, namespace, registry and background workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetfs_meta::{
    CommitKey, CommitQueue, CommitQueueConfig, DirKvStore, KvStore, MetaStore, Namespace,
    StoreCommitter,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admin::MasterAdmin;
use crate::backpressure::RemergeThrottle;
use crate::config::MasterConfig;
use crate::context::MasterContext;
use crate::error::Result;
use crate::node::NodeEvent;
use crate::registry::SlaveRegistry;

/// A master instance with its state loaded and its workers not yet started.
pub struct MasterDaemon {
    config: MasterConfig,
    ctx: Arc<MasterContext>,
    registry: Arc<SlaveRegistry>,
    committer: Arc<StoreCommitter>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl MasterDaemon {
    /// Opens the on-disk store under `config.data_dir` and loads state from it.
    pub fn open(config: MasterConfig) -> Result<Self> {
        let kv = DirKvStore::open(&config.data_dir)?;
        Self::with_store(config, Arc::new(kv))
    }

    /// Loads state from `kv`.
    pub fn with_store(config: MasterConfig, kv: Arc<dyn KvStore>) -> Result<Self> {
        let store = Arc::new(MetaStore::new(kv));
        let commits = Arc::new(CommitQueue::new(CommitQueueConfig {
            delay: Duration::from_millis(config.commit_delay_ms),
        }));
        let namespace = Arc::new(Namespace::new(commits));
        store.load_namespace(&namespace)?;

        let ctx = MasterContext::new(
            namespace.clone(),
            RemergeThrottle::new(config.remerge_high_water, config.remerge_low_water),
            config.session(),
        );
        let registry = SlaveRegistry::new(ctx.clone());
        registry.load(store.load_nodes()?, &config.nodes);

        let committer = Arc::new(StoreCommitter::new(store, namespace, registry.clone()));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            ctx,
            registry,
            committer,
            shutdown,
            workers: Vec::new(),
        })
    }

    /// Binds the node listener and starts the accept loop, the commit worker
    /// and the backpressure monitor. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let listener = self.registry.listen(self.config.bind_addr).await?;
        let addr = listener
            .local_addr()
            .map_err(fleetfs_transport::TransportError::from)?;

        let commits = self.ctx.commits().clone();
        self.workers.push(tokio::spawn(
            commits.run(self.committer.clone(), self.shutdown.subscribe()),
        ));
        self.workers.push(tokio::spawn(
            self.registry
                .clone()
                .run_backpressure_monitor(self.shutdown.subscribe()),
        ));
        self.workers.push(tokio::spawn(
            self.registry
                .clone()
                .run_accept_loop(listener, self.shutdown.subscribe()),
        ));
        info!(%addr, nodes = self.registry.nodes().len(), "master started");
        Ok(addr)
    }

    /// The node registry.
    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    /// The namespace tree.
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ctx.namespace
    }

    /// The shared commit queue.
    pub fn commits(&self) -> &Arc<CommitQueue> {
        self.ctx.commits()
    }

    /// Writes `key` to the store now instead of after the commit delay, for an
    /// object that is about to be read back from disk.
    pub fn flush_now(&self, key: &CommitKey) -> Result<()> {
        self.ctx.commits().flush_now(key, self.committer.as_ref())?;
        Ok(())
    }

    /// Administrative operations.
    pub fn admin(&self) -> MasterAdmin {
        MasterAdmin::new(self.registry.clone())
    }

    /// Subscribes to node lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.subscribe()
    }

    /// Disconnects every node, stops the workers and drains the commit queue.
    pub async fn shutdown(self) {
        info!("master shutting down");
        self.registry.disconnect_all("master shutdown");
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        if !self.ctx.commits().is_empty() {
            warn!(remaining = self.ctx.commits().len(), "commits left unwritten");
        }
        info!("master stopped");
    }
}
