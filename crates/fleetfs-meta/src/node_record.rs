//! Persisted identity and configuration of a storage node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::VfsPath;

/// Property key: per-command response timeout in milliseconds.
pub const PROP_TIMEOUT_MS: &str = "timeout";
/// Property key: network errors tolerated within the error window.
pub const PROP_MAX_ERRORS: &str = "maxErrors";
/// Property key: length of the error decay window in milliseconds.
pub const PROP_ERROR_WINDOW_MS: &str = "errorWindow";
/// Property key: bytes that must stay free before the node takes new files.
pub const PROP_MIN_FREE_SPACE: &str = "minFreeSpace";
/// Property key: last time (ms) the node finished a remerge, for partial remerges.
pub const PROP_LAST_REMERGE_MS: &str = "lastRemerge";

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_ERRORS: u32 = 5;
const DEFAULT_ERROR_WINDOW_MS: u64 = 60_000;

/// A delete or rename that could not reach the node and waits for it to reconnect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Path the operation applies to.
    pub source: VfsPath,
    /// Rename destination; `None` means delete.
    pub destination: Option<VfsPath>,
}

impl QueuedOperation {
    /// A queued delete.
    pub fn delete(source: VfsPath) -> Self {
        Self {
            source,
            destination: None,
        }
    }

    /// A queued rename.
    pub fn rename(source: VfsPath, destination: VfsPath) -> Self {
        Self {
            source,
            destination: Some(destination),
        }
    }

    /// Whether this is a delete.
    pub fn is_delete(&self) -> bool {
        self.destination.is_none()
    }
}

/// Everything about a node that survives a master restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node name.
    pub name: String,
    /// Address patterns the node may connect from (CIDR or glob).
    pub masks: Vec<String>,
    /// Free-form settings.
    pub properties: BTreeMap<String, String>,
    /// Operations waiting for the node to come back.
    pub queued_ops: Vec<QueuedOperation>,
}

impl NodeRecord {
    /// A record with no masks, properties or queued operations.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            masks: Vec::new(),
            properties: BTreeMap::new(),
            queued_ops: Vec::new(),
        }
    }

    /// Raw property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parses a property, falling back to `default` when missing or malformed.
    pub fn property_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.property(key).map(str::parse::<T>) {
            Some(Ok(value)) => value,
            Some(Err(_)) => {
                tracing::warn!(node = %self.name, key, "malformed node property, using default");
                default
            }
            None => default,
        }
    }

    /// Sets a property.
    pub fn set_property(&mut self, key: &str, value: impl ToString) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    /// How long to wait for a command response before presuming the node wedged.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.property_or(PROP_TIMEOUT_MS, DEFAULT_TIMEOUT_MS))
    }

    /// Network errors tolerated within [`Self::error_window`].
    pub fn max_errors(&self) -> u32 {
        self.property_or(PROP_MAX_ERRORS, DEFAULT_MAX_ERRORS)
    }

    /// Window after which a recorded network error no longer counts.
    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.property_or(PROP_ERROR_WINDOW_MS, DEFAULT_ERROR_WINDOW_MS))
    }

    /// Bytes that must stay free for the node to take new files.
    pub fn min_free_space(&self) -> u64 {
        self.property_or(PROP_MIN_FREE_SPACE, 0)
    }

    /// When the node last completed a remerge, if ever.
    pub fn last_remerge_ms(&self) -> Option<u64> {
        self.property(PROP_LAST_REMERGE_MS)
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_defaults() {
        let record = NodeRecord::new("nodeA");
        assert_eq!(record.timeout(), Duration::from_secs(60));
        assert_eq!(record.max_errors(), 5);
        assert_eq!(record.min_free_space(), 0);
        assert!(record.last_remerge_ms().is_none());
    }

    #[test]
    fn test_property_overrides() {
        let mut record = NodeRecord::new("nodeA");
        record.set_property(PROP_TIMEOUT_MS, 1500);
        record.set_property(PROP_MAX_ERRORS, "bogus");
        assert_eq!(record.timeout(), Duration::from_millis(1500));
        assert_eq!(record.max_errors(), 5);
    }

    #[test]
    fn test_queued_operation_kinds() {
        let src = VfsPath::new("/a").unwrap();
        assert!(QueuedOperation::delete(src.clone()).is_delete());
        assert!(!QueuedOperation::rename(src, VfsPath::new("/b").unwrap()).is_delete());
    }
}
