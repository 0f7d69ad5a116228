use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetfs_meta::NodeRecord;

/// A node declared in the config file. Merged into the persisted records at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBootstrap {
    /// Node name.
    pub name: String,
    /// Allowed source addresses: CIDR blocks, plain addresses or globs.
    #[serde(default)]
    pub masks: Vec<String>,
    /// Node properties (timeout, maxErrors, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl NodeBootstrap {
    /// Folds this entry into a record: masks are replaced, properties overlaid,
    /// queued operations kept.
    pub fn apply_to(&self, record: &mut NodeRecord) {
        if !self.masks.is_empty() {
            record.masks = self.masks.clone();
        }
        for (key, value) in &self.properties {
            record.set_property(key, value);
        }
    }

    /// A fresh record for this entry.
    pub fn to_record(&self) -> NodeRecord {
        let mut record = NodeRecord::new(&self.name);
        self.apply_to(&mut record);
        record
    }
}

/// Master daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address nodes connect to.
    pub bind_addr: SocketAddr,
    /// Directory for persisted metadata records.
    pub data_dir: PathBuf,
    /// Minimum age of a queued commit before it is written.
    pub commit_delay_ms: u64,
    /// Commit backlog above which reconciling nodes are paused.
    pub remerge_high_water: usize,
    /// Commit backlog below which paused nodes are resumed.
    pub remerge_low_water: usize,
    /// Concurrent outstanding commands per node.
    pub ticket_pool_size: usize,
    /// How long a command waits for a free ticket.
    pub ticket_reserve_timeout_ms: u64,
    /// Ask nodes that remerged before for changes since their last remerge only.
    pub partial_remerge: bool,
    /// Safety margin subtracted from the last remerge time in partial mode.
    pub remerge_cutoff_ms: u64,
    /// Period of liveness and backlog checks.
    pub liveness_check_interval_ms: u64,
    /// How long a fresh connection has to send its identity.
    pub handshake_timeout_ms: u64,
    /// Remerge messages buffered between the read loop and the reconcile worker.
    pub remerge_queue_depth: usize,
    /// Nodes declared up front.
    pub nodes: Vec<NodeBootstrap>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1099)),
            data_dir: PathBuf::from("/var/lib/fleetfs/master"),
            commit_delay_ms: 10_000,
            remerge_high_water: 10_000,
            remerge_low_water: 5_000,
            ticket_pool_size: 256,
            ticket_reserve_timeout_ms: 30_000,
            partial_remerge: false,
            remerge_cutoff_ms: 60_000,
            liveness_check_interval_ms: 1_000,
            handshake_timeout_ms: 10_000,
            remerge_queue_depth: 64,
            nodes: Vec::new(),
        }
    }
}

impl MasterConfig {
    /// Loads TOML or JSON, chosen by file extension, and validates the result.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MasterConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the master cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.ticket_pool_size > 0, "ticket_pool_size must be positive");
        ensure!(
            self.remerge_low_water < self.remerge_high_water,
            "remerge_low_water ({}) must be below remerge_high_water ({})",
            self.remerge_low_water,
            self.remerge_high_water
        );
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            ensure!(!node.name.trim().is_empty(), "node with an empty name");
            ensure!(seen.insert(node.name.as_str()), "node {} declared twice", node.name);
        }
        Ok(())
    }

    /// Per-session settings derived from this config.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            ticket_pool_size: self.ticket_pool_size,
            ticket_reserve_timeout: Duration::from_millis(self.ticket_reserve_timeout_ms),
            partial_remerge: self.partial_remerge,
            remerge_cutoff: Duration::from_millis(self.remerge_cutoff_ms),
            liveness_check_interval: Duration::from_millis(self.liveness_check_interval_ms.max(1)),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            remerge_queue_depth: self.remerge_queue_depth.max(1),
        }
    }
}

/// Settings every node session reads.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tickets per session.
    pub ticket_pool_size: usize,
    /// Wait for a free ticket.
    pub ticket_reserve_timeout: Duration,
    /// Whether partial remerges are requested.
    pub partial_remerge: bool,
    /// Safety margin for partial remerge cutoffs.
    pub remerge_cutoff: Duration,
    /// Liveness polling period.
    pub liveness_check_interval: Duration,
    /// Identity line deadline.
    pub handshake_timeout: Duration,
    /// Read loop to reconcile worker buffer.
    pub remerge_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        MasterConfig::default().session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MasterConfig::default();
        assert_eq!(config.commit_delay_ms, 10_000);
        assert_eq!(config.ticket_pool_size, 256);
        assert_eq!(config.remerge_high_water, 10_000);
        assert_eq!(config.remerge_low_water, 5_000);
        assert!(!config.partial_remerge);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "10.0.0.1:1099"
data_dir = "/srv/fleetfs"
commit_delay_ms = 500
partial_remerge = true

[[nodes]]
name = "nodeA"
masks = ["10.0.0.0/24"]

[nodes.properties]
timeout = "5000"

[[nodes]]
name = "nodeB"
            "#
        )
        .unwrap();

        let config = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([10, 0, 0, 1], 1099)));
        assert_eq!(config.data_dir, PathBuf::from("/srv/fleetfs"));
        assert_eq!(config.commit_delay_ms, 500);
        assert!(config.partial_remerge);
        assert_eq!(config.ticket_pool_size, 256);
        assert_eq!(config.nodes.len(), 2);
        let record = config.nodes[0].to_record();
        assert_eq!(record.masks, vec!["10.0.0.0/24".to_string()]);
        assert_eq!(record.timeout(), Duration::from_secs(5));
        assert!(config.nodes[1].masks.is_empty());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"bind_addr": "127.0.0.1:2000", "ticket_pool_size": 8}}"#
        )
        .unwrap();
        let config = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 2000)));
        assert_eq!(config.session().ticket_pool_size, 8);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MasterConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(MasterConfig::default().validate().is_ok());

        let inverted = MasterConfig {
            remerge_low_water: 20,
            remerge_high_water: 10,
            ..MasterConfig::default()
        };
        assert!(inverted.validate().is_err());

        let node = NodeBootstrap {
            name: "nodeA".into(),
            masks: vec![],
            properties: BTreeMap::new(),
        };
        let duplicated = MasterConfig {
            nodes: vec![node.clone(), node],
            ..MasterConfig::default()
        };
        let err = duplicated.validate().unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_bootstrap_keeps_queued_operations() {
        let mut record = NodeRecord::new("nodeA");
        record.masks.push("192.168.0.0/16".into());
        record
            .queued_ops
            .push(fleetfs_meta::QueuedOperation::delete(fleetfs_meta::VfsPath::root()));
        let bootstrap = NodeBootstrap {
            name: "nodeA".into(),
            masks: vec![],
            properties: BTreeMap::from([("maxErrors".to_string(), "9".to_string())]),
        };
        bootstrap.apply_to(&mut record);
        assert_eq!(record.masks.len(), 1);
        assert_eq!(record.max_errors(), 9);
        assert_eq!(record.queued_ops.len(), 1);
    }
}
