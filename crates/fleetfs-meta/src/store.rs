//! Durable records for nodes, directories and files.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commit::{CommitKey, Committer};
use crate::kvstore::KvStore;
use crate::namespace::{FileState, Namespace};
use crate::node_record::NodeRecord;
use crate::types::{MetaError, VfsPath};

const NODE_PREFIX: &str = "node/";
const DIR_PREFIX: &str = "dir/";
const FILE_PREFIX: &str = "file/";

/// Persisted form of a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Directory path.
    pub path: VfsPath,
    /// Modification time, ms since epoch.
    pub last_modified: u64,
}

/// Persisted form of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File path.
    pub path: VfsPath,
    /// Length in bytes.
    pub size: u64,
    /// Modification time, ms since epoch.
    pub last_modified: u64,
    /// CRC32, if known.
    pub checksum: Option<u32>,
    /// Accumulated transfer time, ms.
    pub xfer_time_ms: u64,
    /// Nodes holding a copy.
    pub replicas: BTreeSet<String>,
}

impl FileRecord {
    fn from_state(path: &VfsPath, state: FileState) -> Self {
        Self {
            path: path.clone(),
            size: state.size,
            last_modified: state.last_modified,
            checksum: state.checksum,
            xfer_time_ms: state.xfer_time_ms,
            replicas: state.replicas,
        }
    }

    fn into_state(self) -> (VfsPath, FileState) {
        (
            self.path,
            FileState {
                size: self.size,
                last_modified: self.last_modified,
                checksum: self.checksum,
                xfer_time_ms: self.xfer_time_ms,
                replicas: self.replicas,
            },
        )
    }
}

/// One persisted object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitRecord {
    /// A node record.
    Node(NodeRecord),
    /// A directory record.
    Directory(DirectoryRecord),
    /// A file record.
    File(FileRecord),
}

impl CommitRecord {
    /// The commit key this record is stored under.
    pub fn key(&self) -> CommitKey {
        match self {
            CommitRecord::Node(n) => CommitKey::Node(n.name.clone()),
            CommitRecord::Directory(d) => CommitKey::Directory(d.path.clone()),
            CommitRecord::File(f) => CommitKey::File(f.path.clone()),
        }
    }
}

fn storage_key(key: &CommitKey) -> Vec<u8> {
    match key {
        CommitKey::Node(name) => format!("{NODE_PREFIX}{name}").into_bytes(),
        CommitKey::Directory(path) => format!("{DIR_PREFIX}{path}").into_bytes(),
        CommitKey::File(path) => format!("{FILE_PREFIX}{path}").into_bytes(),
    }
}

/// What [`MetaStore::load_namespace`] rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Directories restored.
    pub directories: usize,
    /// Files restored.
    pub files: usize,
    /// File records skipped because no replica remained.
    pub orphans: usize,
    /// Records that could not be decoded.
    pub corrupt: usize,
    /// Records skipped because another record already claims their path with
    /// a different shape (a directory where a file is recorded, or the reverse).
    pub conflicting: usize,
}

/// Typed access to persisted records.
pub struct MetaStore {
    kv: Arc<dyn KvStore>,
}

impl MetaStore {
    /// Wraps a KV backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Writes a record, replacing any previous version.
    pub fn persist(&self, record: &CommitRecord) -> Result<(), MetaError> {
        let bytes = bincode::serialize(record)?;
        self.kv.put(storage_key(&record.key()), bytes)
    }

    /// Removes the record behind `key`, if any.
    pub fn remove(&self, key: &CommitKey) -> Result<(), MetaError> {
        self.kv.delete(&storage_key(key))
    }

    /// Reads the record behind `key`.
    pub fn get(&self, key: &CommitKey) -> Result<Option<CommitRecord>, MetaError> {
        match self.kv.get(&storage_key(key))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All persisted node records.
    pub fn load_nodes(&self) -> Result<Vec<NodeRecord>, MetaError> {
        let mut nodes = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(NODE_PREFIX.as_bytes())? {
            match bincode::deserialize::<CommitRecord>(&bytes) {
                Ok(CommitRecord::Node(record)) => nodes.push(record),
                Ok(_) | Err(_) => {
                    warn!(key = %String::from_utf8_lossy(&key), "skipping unreadable node record");
                }
            }
        }
        Ok(nodes)
    }

    /// Rebuilds `namespace` from persisted directories and files without
    /// scheduling any commits.
    pub fn load_namespace(&self, namespace: &Namespace) -> Result<LoadReport, MetaError> {
        let mut report = LoadReport::default();

        let mut dirs = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(DIR_PREFIX.as_bytes())? {
            match bincode::deserialize::<CommitRecord>(&bytes) {
                Ok(CommitRecord::Directory(record)) => dirs.push(record),
                _ => {
                    warn!(key = %String::from_utf8_lossy(&key), "skipping unreadable directory record");
                    report.corrupt += 1;
                }
            }
        }
        dirs.sort_by_key(|d| d.path.depth());
        for record in dirs {
            match namespace.restore_directory(&record.path, record.last_modified) {
                Ok(()) => report.directories += 1,
                Err(e) => {
                    warn!(path = %record.path, error = %e, "skipping conflicting directory record");
                    report.conflicting += 1;
                }
            }
        }

        for (key, bytes) in self.kv.scan_prefix(FILE_PREFIX.as_bytes())? {
            let record = match bincode::deserialize::<CommitRecord>(&bytes) {
                Ok(CommitRecord::File(record)) => record,
                _ => {
                    warn!(key = %String::from_utf8_lossy(&key), "skipping unreadable file record");
                    report.corrupt += 1;
                    continue;
                }
            };
            let (path, state) = record.into_state();
            match namespace.restore_file(&path, state) {
                Ok(true) => report.files += 1,
                Ok(false) => report.orphans += 1,
                Err(e) => {
                    warn!(%path, error = %e, "skipping conflicting file record");
                    report.conflicting += 1;
                }
            }
        }

        info!(
            directories = report.directories,
            files = report.files,
            orphans = report.orphans,
            corrupt = report.corrupt,
            conflicting = report.conflicting,
            bytes = namespace.total_size(),
            "namespace loaded"
        );
        Ok(report)
    }
}

/// Supplies the current node record for a name, for the committer.
pub trait NodeRecordSource: Send + Sync {
    /// Current record of `name`, or `None` if the node was removed.
    fn node_record(&self, name: &str) -> Option<NodeRecord>;
}

/// Resolves commit keys against live state and writes them to a [`MetaStore`].
/// A key whose object no longer exists has its record removed.
pub struct StoreCommitter {
    store: Arc<MetaStore>,
    namespace: Arc<Namespace>,
    nodes: Arc<dyn NodeRecordSource>,
}

impl StoreCommitter {
    /// Creates a committer over the given state.
    pub fn new(
        store: Arc<MetaStore>,
        namespace: Arc<Namespace>,
        nodes: Arc<dyn NodeRecordSource>,
    ) -> Self {
        Self {
            store,
            namespace,
            nodes,
        }
    }

    fn resolve(&self, key: &CommitKey) -> Option<CommitRecord> {
        match key {
            CommitKey::Node(name) => self.nodes.node_record(name).map(CommitRecord::Node),
            CommitKey::Directory(path) => self.namespace.directory(path).map(|d| {
                CommitRecord::Directory(DirectoryRecord {
                    path: path.clone(),
                    last_modified: d.lock().last_modified(),
                })
            }),
            CommitKey::File(path) => {
                let file = self.namespace.file(path)?;
                let state = file.snapshot();
                if state.replicas.is_empty() {
                    return None;
                }
                Some(CommitRecord::File(FileRecord::from_state(path, state)))
            }
        }
    }
}

impl Committer for StoreCommitter {
    fn commit(&self, key: &CommitKey) -> Result<(), MetaError> {
        match self.resolve(key) {
            Some(record) => self.store.persist(&record),
            None => {
                debug!(key = %key, "object gone, removing record");
                self.store.remove(key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitQueue, CommitQueueConfig};
    use crate::kvstore::{DirKvStore, MemoryKvStore};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StaticNodes(Mutex<HashMap<String, NodeRecord>>);

    impl NodeRecordSource for StaticNodes {
        fn node_record(&self, name: &str) -> Option<NodeRecord> {
            self.0.lock().get(name).cloned()
        }
    }

    fn p(s: &str) -> VfsPath {
        VfsPath::new(s).unwrap()
    }

    fn new_namespace() -> Arc<Namespace> {
        Arc::new(Namespace::new(Arc::new(CommitQueue::new(
            CommitQueueConfig::default(),
        ))))
    }

    #[test]
    fn test_commit_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetaStore::new(Arc::new(DirKvStore::open(dir.path()).unwrap())));
        let namespace = new_namespace();
        let nodes = Arc::new(StaticNodes::default());
        let mut record = NodeRecord::new("nodeA");
        record.masks.push("127.0.0.1/32".into());
        nodes.0.lock().insert("nodeA".into(), record.clone());

        namespace.add_file(&p("/dirX/sub"), "f1", 100, 7, "nodeA").unwrap();
        let committer = StoreCommitter::new(store.clone(), namespace.clone(), nodes);
        namespace.commits().drain_all();
        namespace.commits().schedule(CommitKey::Node("nodeA".into()));
        let flushed = namespace.commits().process_due(&committer);
        assert_eq!(flushed.failed, 0);
        assert!(namespace.commits().is_empty());

        let reloaded = new_namespace();
        let report = store.load_namespace(&reloaded).unwrap();
        assert_eq!(report.files, 1);
        assert!(report.directories >= 2);
        let file = reloaded.file(&p("/dirX/sub/f1")).unwrap();
        assert_eq!(file.size(), 100);
        assert!(file.has_replica("nodeA"));
        assert!(reloaded.commits().is_empty());
        assert_eq!(store.load_nodes().unwrap(), vec![record]);
    }

    #[test]
    fn test_vanished_objects_lose_their_records() {
        let store = Arc::new(MetaStore::new(Arc::new(MemoryKvStore::new())));
        let namespace = new_namespace();
        let committer =
            StoreCommitter::new(store.clone(), namespace.clone(), Arc::new(StaticNodes::default()));

        namespace.add_file(&p("/d"), "f", 1, 1, "nodeA").unwrap();
        let key = CommitKey::File(p("/d/f"));
        committer.commit(&key).unwrap();
        assert!(store.get(&key).unwrap().is_some());

        namespace.remove_replica(&p("/d/f"), "nodeA").unwrap();
        committer.commit(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());

        committer.commit(&CommitKey::Node("ghost".into())).unwrap();
    }

    #[test]
    fn test_orphan_file_records_are_skipped() {
        let store = MetaStore::new(Arc::new(MemoryKvStore::new()));
        store
            .persist(&CommitRecord::File(FileRecord {
                path: p("/lost/f"),
                size: 1,
                last_modified: 1,
                checksum: None,
                xfer_time_ms: 0,
                replicas: BTreeSet::new(),
            }))
            .unwrap();
        let namespace = new_namespace();
        let report = store.load_namespace(&namespace).unwrap();
        assert_eq!(report.orphans, 1);
        assert!(namespace.file(&p("/lost/f")).is_none());
    }

    #[test]
    fn test_conflicting_records_do_not_block_loading() {
        let store = MetaStore::new(Arc::new(MemoryKvStore::new()));
        store
            .persist(&CommitRecord::Directory(DirectoryRecord {
                path: p("/x"),
                last_modified: 1,
            }))
            .unwrap();
        store
            .persist(&CommitRecord::File(FileRecord {
                path: p("/x"),
                size: 4,
                last_modified: 1,
                checksum: None,
                xfer_time_ms: 0,
                replicas: BTreeSet::from(["nodeA".to_string()]),
            }))
            .unwrap();
        store
            .persist(&CommitRecord::File(FileRecord {
                path: p("/y/f"),
                size: 2,
                last_modified: 1,
                checksum: None,
                xfer_time_ms: 0,
                replicas: BTreeSet::from(["nodeA".to_string()]),
            }))
            .unwrap();

        let namespace = new_namespace();
        let report = store.load_namespace(&namespace).unwrap();
        assert_eq!(report.conflicting, 1);
        assert_eq!(report.files, 1);
        assert!(namespace.directory(&p("/x")).is_some());
        assert!(namespace.file(&p("/x")).is_none());
        assert!(namespace.file(&p("/y/f")).is_some());
    }
}
