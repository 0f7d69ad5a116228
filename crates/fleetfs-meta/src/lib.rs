#![warn(missing_docs)]

//! fleetfs metadata subsystem: namespace tree, node records, persistence, coalescing commit queue

pub mod commit;
pub mod kvstore;
pub mod namespace;
pub mod node_record;
pub mod store;
pub mod types;

pub use commit::{CommitKey, CommitQueue, CommitQueueConfig, Committer};
pub use kvstore::{DirKvStore, KvStore, MemoryKvStore};
pub use namespace::{Child, DirectoryNode, FileNode, FileState, Namespace, ReplicaRemoval};
pub use node_record::{NodeRecord, QueuedOperation};
pub use store::{MetaStore, NodeRecordSource, StoreCommitter};
pub use types::{now_ms, MetaError, VfsPath};
