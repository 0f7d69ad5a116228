//! Key-value storage for persisted metadata records.
//!
//! [`MemoryKvStore`] backs tests; [`DirKvStore`] keeps one file per key under
//! a data directory and replaces files through a rename so a crash never
//! leaves a half-written record.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::MetaError;

/// Record key, e.g. `dir//a/b` or `node/nodeA`.
pub type Key = Vec<u8>;
/// Encoded record.
pub type Value = Vec<u8>;
/// One record as returned by a scan.
pub type KvPair = (Key, Value);

/// Byte-keyed record storage the metadata store writes through.
pub trait KvStore: Send + Sync {
    /// The record under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Stores `value` under `key`, replacing what was there.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Drops the record under `key`; a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Every record whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;
}

/// Records held in a sorted map; nothing survives the process.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    records: Arc<RwLock<BTreeMap<Key, Value>>>,
}

impl MemoryKvStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        self.records.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.records.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let records = self.records.read();
        Ok(records
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// File-per-key store under a directory. File names are the hex-encoded key.
pub struct DirKvStore {
    root: PathBuf,
}

impl DirKvStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, MetaError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the records.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        self.root.join(hex::encode(key))
    }
}

impl KvStore for DirKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        let target = self.path_for(&key);
        let tmp = target.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let mut result = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // leftovers from an interrupted put
            if name.ends_with(".tmp") {
                continue;
            }
            let key = match hex::decode(name) {
                Ok(key) => key,
                Err(_) => {
                    tracing::warn!(file = name, "skipping foreign file in metadata directory");
                    continue;
                }
            };
            if key.starts_with(prefix) {
                result.push((key, fs::read(entry.path())?));
            }
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }
}
