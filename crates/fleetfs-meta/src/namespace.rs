//! The master's namespace tree.
//!
//! Directories are indexed by path in a shared map; each directory guards its
//! children with its own mutex, and each file guards its attributes and
//! replica set with another. Children never point back at their parent: the
//! parent is found by path. Lock order is always parent directory, then child
//! directory, then file.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::commit::{CommitKey, CommitQueue};
use crate::types::{now_ms, MetaError, VfsPath};

/// Mutable attributes of a file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileState {
    /// Length in bytes; authoritative once any replica agrees with it.
    pub size: u64,
    /// Modification time, ms since epoch.
    pub last_modified: u64,
    /// CRC32 once computed by a node.
    pub checksum: Option<u32>,
    /// Accumulated time spent transferring this file, ms.
    pub xfer_time_ms: u64,
    /// Names of nodes holding a copy.
    pub replicas: BTreeSet<String>,
}

/// A file in the namespace.
#[derive(Debug)]
pub struct FileNode {
    path: VfsPath,
    state: Mutex<FileState>,
}

impl FileNode {
    fn new(path: VfsPath, state: FileState) -> Self {
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Full path of the file.
    pub fn path(&self) -> &VfsPath {
        &self.path
    }

    /// Locks the file's attributes. Never take a directory lock while holding this.
    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock()
    }

    /// Copy of the current attributes.
    pub fn snapshot(&self) -> FileState {
        self.state.lock().clone()
    }

    /// Current size.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Current replica set.
    pub fn replicas(&self) -> BTreeSet<String> {
        self.state.lock().replicas.clone()
    }

    /// Whether `node` holds a copy.
    pub fn has_replica(&self, node: &str) -> bool {
        self.state.lock().replicas.contains(node)
    }
}

/// A child entry of a directory.
#[derive(Clone, Debug)]
pub enum Child {
    /// A subdirectory; look it up in the namespace by path.
    Directory,
    /// A file.
    File(Arc<FileNode>),
}

/// Mutable contents of a directory.
#[derive(Debug, Default)]
pub struct DirState {
    children: BTreeMap<String, Child>,
    last_modified: u64,
}

impl DirState {
    /// Child by name.
    pub fn get(&self, name: &str) -> Option<&Child> {
        self.children.get(name)
    }

    /// File child by name.
    pub fn file(&self, name: &str) -> Option<Arc<FileNode>> {
        match self.children.get(name) {
            Some(Child::File(f)) => Some(f.clone()),
            _ => None,
        }
    }

    /// Whether `name` is a subdirectory.
    pub fn is_directory(&self, name: &str) -> bool {
        matches!(self.children.get(name), Some(Child::Directory))
    }

    /// Child names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// All children in sorted order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Child)> {
        self.children.iter()
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the directory has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Modification time, ms since epoch.
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }
}

/// A directory in the namespace.
#[derive(Debug)]
pub struct DirectoryNode {
    path: VfsPath,
    state: Mutex<DirState>,
}

impl DirectoryNode {
    fn new(path: VfsPath, last_modified: u64) -> Self {
        Self {
            path,
            state: Mutex::new(DirState {
                children: BTreeMap::new(),
                last_modified,
            }),
        }
    }

    /// Full path of the directory.
    pub fn path(&self) -> &VfsPath {
        &self.path
    }

    /// Locks the directory for a structural change.
    pub fn lock(&self) -> DirectoryGuard<'_> {
        DirectoryGuard {
            node: self,
            state: self.state.lock(),
        }
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Whether the directory has no children.
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }
}

/// A held directory lock.
pub struct DirectoryGuard<'a> {
    node: &'a DirectoryNode,
    state: MutexGuard<'a, DirState>,
}

impl DirectoryGuard<'_> {
    /// Path of the locked directory.
    pub fn path(&self) -> &VfsPath {
        &self.node.path
    }
}

impl Deref for DirectoryGuard<'_> {
    type Target = DirState;

    fn deref(&self) -> &DirState {
        &self.state
    }
}

impl DerefMut for DirectoryGuard<'_> {
    fn deref_mut(&mut self) -> &mut DirState {
        &mut self.state
    }
}

/// What happened when a node was unlinked from a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRemoval {
    /// The node was not a replica.
    NotPresent,
    /// The node was removed; other replicas remain.
    Removed,
    /// The node was the last replica; the file was removed from the namespace.
    FileDeleted,
}

/// Tally of a recursive unlink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlinkReport {
    /// Files the node was removed from.
    pub files_unlinked: usize,
    /// Files deleted because no replica remained.
    pub files_deleted: usize,
    /// Directories removed because they became empty.
    pub directories_removed: usize,
}

impl std::ops::AddAssign for UnlinkReport {
    fn add_assign(&mut self, rhs: Self) {
        self.files_unlinked += rhs.files_unlinked;
        self.files_deleted += rhs.files_deleted;
        self.directories_removed += rhs.directories_removed;
    }
}

/// The namespace tree. Every mutation schedules a commit of the touched objects.
pub struct Namespace {
    dirs: DashMap<VfsPath, Arc<DirectoryNode>>,
    commits: Arc<CommitQueue>,
}

impl Namespace {
    /// Creates a namespace holding only the root directory.
    pub fn new(commits: Arc<CommitQueue>) -> Self {
        let dirs = DashMap::new();
        dirs.insert(
            VfsPath::root(),
            Arc::new(DirectoryNode::new(VfsPath::root(), now_ms())),
        );
        Self { dirs, commits }
    }

    /// The commit queue mutations are scheduled on.
    pub fn commits(&self) -> &Arc<CommitQueue> {
        &self.commits
    }

    /// The root directory.
    pub fn root(&self) -> Arc<DirectoryNode> {
        self.directory(&VfsPath::root())
            .unwrap_or_else(|| Arc::new(DirectoryNode::new(VfsPath::root(), now_ms())))
    }

    /// Directory at `path`, if any.
    pub fn directory(&self, path: &VfsPath) -> Option<Arc<DirectoryNode>> {
        self.dirs.get(path).map(|d| d.value().clone())
    }

    /// File at `path`, if any.
    pub fn file(&self, path: &VfsPath) -> Option<Arc<FileNode>> {
        let parent = self.directory(&path.parent()?)?;
        let guard = parent.lock();
        guard.file(path.name())
    }

    /// Number of directories, root included.
    pub fn directory_count(&self) -> usize {
        self.dirs.len()
    }

    /// Snapshot of all directory paths.
    pub fn directory_paths(&self) -> Vec<VfsPath> {
        let mut paths: Vec<VfsPath> = self.dirs.iter().map(|d| d.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Queues a commit of the directory record.
    pub fn mark_directory_dirty(&self, path: &VfsPath) {
        self.commits.schedule(CommitKey::Directory(path.clone()));
    }

    /// Queues a commit of the file record.
    pub fn mark_file_dirty(&self, path: &VfsPath) {
        self.commits.schedule(CommitKey::File(path.clone()));
    }

    /// Creates `path` and any missing ancestors.
    pub fn create_directory_all(&self, path: &VfsPath) -> Result<Arc<DirectoryNode>, MetaError> {
        if let Some(existing) = self.directory(path) {
            return Ok(existing);
        }
        let mut current = self.root();
        for name in path.components() {
            let next = {
                let mut guard = current.lock();
                self.ensure_directory(&mut guard, name, now_ms())?
            };
            current = next;
        }
        Ok(current)
    }

    /// Returns the subdirectory `name` of the locked directory, creating it if absent.
    pub fn ensure_directory(
        &self,
        parent: &mut DirectoryGuard<'_>,
        name: &str,
        last_modified: u64,
    ) -> Result<Arc<DirectoryNode>, MetaError> {
        let path = parent.path().join(name)?;
        match parent.get(name) {
            Some(Child::Directory) => {
                if let Some(existing) = self.directory(&path) {
                    return Ok(existing);
                }
            }
            Some(Child::File(_)) => return Err(MetaError::NotADirectory(path)),
            None => {}
        }
        let node = Arc::new(DirectoryNode::new(path.clone(), last_modified));
        self.dirs.insert(path.clone(), node.clone());
        parent.children.insert(name.to_string(), Child::Directory);
        parent.last_modified = now_ms();
        self.mark_directory_dirty(parent.path());
        self.mark_directory_dirty(&path);
        trace!(path = %path, "directory created");
        Ok(node)
    }

    /// Adds a new file to the locked directory with `replica` as its only replica.
    pub fn insert_file(
        &self,
        parent: &mut DirectoryGuard<'_>,
        name: &str,
        size: u64,
        last_modified: u64,
        replica: &str,
    ) -> Result<Arc<FileNode>, MetaError> {
        let path = parent.path().join(name)?;
        if parent.get(name).is_some() {
            return Err(MetaError::EntryExists(path));
        }
        let mut replicas = BTreeSet::new();
        replicas.insert(replica.to_string());
        let file = Arc::new(FileNode::new(
            path.clone(),
            FileState {
                size,
                last_modified,
                replicas,
                ..FileState::default()
            },
        ));
        parent
            .children
            .insert(name.to_string(), Child::File(file.clone()));
        parent.last_modified = now_ms();
        self.mark_directory_dirty(parent.path());
        self.mark_file_dirty(&path);
        trace!(path = %path, node = replica, size, "file created");
        Ok(file)
    }

    /// Adds a file under `dir`, creating the directory chain if needed.
    pub fn add_file(
        &self,
        dir: &VfsPath,
        name: &str,
        size: u64,
        last_modified: u64,
        replica: &str,
    ) -> Result<Arc<FileNode>, MetaError> {
        let directory = self.create_directory_all(dir)?;
        let mut guard = directory.lock();
        self.insert_file(&mut guard, name, size, last_modified, replica)
    }

    /// Adds `node` as a replica. Returns whether it was newly added.
    pub fn add_replica(&self, file: &FileNode, node: &str) -> bool {
        let added = file.lock().replicas.insert(node.to_string());
        if added {
            self.mark_file_dirty(file.path());
        }
        added
    }

    /// Removes `node` from the replicas of file `name` in the locked directory,
    /// deleting the file when no replica remains.
    pub fn remove_replica_locked(
        &self,
        parent: &mut DirectoryGuard<'_>,
        name: &str,
        node: &str,
    ) -> ReplicaRemoval {
        let Some(file) = parent.file(name) else {
            return ReplicaRemoval::NotPresent;
        };
        let now_empty = {
            let mut state = file.lock();
            if !state.replicas.remove(node) {
                return ReplicaRemoval::NotPresent;
            }
            state.replicas.is_empty()
        };
        self.mark_file_dirty(file.path());
        if now_empty {
            parent.children.remove(name);
            parent.last_modified = now_ms();
            self.mark_directory_dirty(parent.path());
            debug!(path = %file.path(), node, "last replica gone, file removed");
            ReplicaRemoval::FileDeleted
        } else {
            ReplicaRemoval::Removed
        }
    }

    /// Removes `node` from the replicas of the file at `path`.
    pub fn remove_replica(&self, path: &VfsPath, node: &str) -> Result<ReplicaRemoval, MetaError> {
        let parent_path = path.parent().ok_or(MetaError::RootDirectory)?;
        let parent = self
            .directory(&parent_path)
            .ok_or_else(|| MetaError::DirectoryNotFound(parent_path.clone()))?;
        let mut guard = parent.lock();
        if guard.file(path.name()).is_none() {
            return Err(MetaError::FileNotFound(path.clone()));
        }
        Ok(self.remove_replica_locked(&mut guard, path.name(), node))
    }

    /// Removes the file at `path` regardless of its replicas.
    pub fn remove_file(&self, path: &VfsPath) -> Result<Arc<FileNode>, MetaError> {
        let parent_path = path.parent().ok_or(MetaError::RootDirectory)?;
        let parent = self
            .directory(&parent_path)
            .ok_or_else(|| MetaError::DirectoryNotFound(parent_path.clone()))?;
        let mut guard = parent.lock();
        let file = guard
            .file(path.name())
            .ok_or_else(|| MetaError::FileNotFound(path.clone()))?;
        guard.children.remove(path.name());
        guard.last_modified = now_ms();
        self.mark_directory_dirty(&parent_path);
        self.mark_file_dirty(path);
        Ok(file)
    }

    /// Unlinks `node` from every file below the subdirectory `name` of the locked
    /// directory. The subdirectory is removed if this leaves it empty; one that
    /// was already empty is left alone.
    pub fn unlink_node_from_subtree(
        &self,
        parent: &mut DirectoryGuard<'_>,
        name: &str,
        node: &str,
    ) -> Result<UnlinkReport, MetaError> {
        let path = parent.path().join(name)?;
        let Some(directory) = self.directory(&path) else {
            return Ok(UnlinkReport::default());
        };
        let mut report = UnlinkReport::default();
        let now_empty = {
            let mut guard = directory.lock();
            let was_empty = guard.is_empty();
            for child in guard.names() {
                if guard.is_directory(&child) {
                    report += self.unlink_node_from_subtree(&mut guard, &child, node)?;
                } else {
                    match self.remove_replica_locked(&mut guard, &child, node) {
                        ReplicaRemoval::NotPresent => {}
                        ReplicaRemoval::Removed => report.files_unlinked += 1,
                        ReplicaRemoval::FileDeleted => {
                            report.files_unlinked += 1;
                            report.files_deleted += 1;
                        }
                    }
                }
            }
            !was_empty && guard.is_empty()
        };
        if now_empty {
            self.detach_directory(parent, name)?;
            report.directories_removed += 1;
        }
        Ok(report)
    }

    /// Removes the subdirectory `name` of the locked directory together with its
    /// whole subtree. Returns the number of files dropped.
    pub fn detach_directory(
        &self,
        parent: &mut DirectoryGuard<'_>,
        name: &str,
    ) -> Result<usize, MetaError> {
        let path = parent.path().join(name)?;
        if !parent.is_directory(name) {
            return Err(MetaError::DirectoryNotFound(path));
        }
        let mut dropped = 0;
        if let Some(directory) = self.directory(&path) {
            let mut guard = directory.lock();
            for child in guard.names() {
                if guard.is_directory(&child) {
                    dropped += self.detach_directory(&mut guard, &child)?;
                } else if let Some(Child::File(file)) = guard.children.remove(&child) {
                    self.mark_file_dirty(file.path());
                    dropped += 1;
                }
            }
        }
        self.dirs.remove(&path);
        parent.children.remove(name);
        parent.last_modified = now_ms();
        self.mark_directory_dirty(parent.path());
        self.mark_directory_dirty(&path);
        debug!(path = %path, files = dropped, "directory removed");
        Ok(dropped)
    }

    /// Removes the directory at `path` and everything below it.
    pub fn remove_directory_tree(&self, path: &VfsPath) -> Result<usize, MetaError> {
        let parent_path = path.parent().ok_or(MetaError::RootDirectory)?;
        let parent = self
            .directory(&parent_path)
            .ok_or_else(|| MetaError::DirectoryNotFound(parent_path.clone()))?;
        let mut guard = parent.lock();
        self.detach_directory(&mut guard, path.name())
    }

    /// Moves a file or directory. Each directory involved is updated atomically;
    /// the move as a whole is not.
    pub fn rename(&self, from: &VfsPath, to: &VfsPath) -> Result<(), MetaError> {
        if from.is_root() || to.is_root() {
            return Err(MetaError::RootDirectory);
        }
        if from.is_ancestor_of(to) {
            return Err(MetaError::InvalidPath {
                path: to.to_string(),
                reason: "destination inside source",
            });
        }
        if self.directory(to).is_some() || self.file(to).is_some() {
            return Err(MetaError::EntryExists(to.clone()));
        }
        let dest_parent = to.parent().ok_or(MetaError::RootDirectory)?;
        if let Some(file) = self.file(from) {
            let state = file.snapshot();
            let dest = self.create_directory_all(&dest_parent)?;
            {
                let mut guard = dest.lock();
                if guard.get(to.name()).is_some() {
                    return Err(MetaError::EntryExists(to.clone()));
                }
                self.attach_file(&mut guard, to.name(), state)?;
            }
            self.remove_file(from)?;
            return Ok(());
        }
        if self.directory(from).is_none() {
            return Err(MetaError::FileNotFound(from.clone()));
        }
        self.copy_tree(from, to)?;
        self.remove_directory_tree(from)?;
        Ok(())
    }

    fn copy_tree(&self, from: &VfsPath, to: &VfsPath) -> Result<(), MetaError> {
        let source = self
            .directory(from)
            .ok_or_else(|| MetaError::DirectoryNotFound(from.clone()))?;
        let dest = self.create_directory_all(to)?;
        let (files, subdirs): (Vec<_>, Vec<_>) = {
            let guard = source.lock();
            let mut files = Vec::new();
            let mut subdirs = Vec::new();
            for (name, child) in guard.entries() {
                match child {
                    Child::File(f) => files.push((name.clone(), f.snapshot())),
                    Child::Directory => subdirs.push(name.clone()),
                }
            }
            (files, subdirs)
        };
        {
            let mut guard = dest.lock();
            for (name, state) in files {
                self.attach_file(&mut guard, &name, state)?;
            }
        }
        for name in subdirs {
            self.copy_tree(&from.join(&name)?, &to.join(&name)?)?;
        }
        Ok(())
    }

    fn attach_file(
        &self,
        parent: &mut DirectoryGuard<'_>,
        name: &str,
        state: FileState,
    ) -> Result<Arc<FileNode>, MetaError> {
        let path = parent.path().join(name)?;
        let file = Arc::new(FileNode::new(path.clone(), state));
        parent
            .children
            .insert(name.to_string(), Child::File(file.clone()));
        parent.last_modified = now_ms();
        self.mark_directory_dirty(parent.path());
        self.mark_file_dirty(&path);
        Ok(file)
    }

    /// Snapshot of a directory's children as (name, file state or `None` for a subdirectory).
    pub fn list(&self, path: &VfsPath) -> Result<Vec<(String, Option<FileState>)>, MetaError> {
        let directory = self
            .directory(path)
            .ok_or_else(|| MetaError::DirectoryNotFound(path.clone()))?;
        let guard = directory.lock();
        Ok(guard
            .entries()
            .map(|(name, child)| match child {
                Child::Directory => (name.clone(), None),
                Child::File(f) => (name.clone(), Some(f.snapshot())),
            })
            .collect())
    }

    /// Number of replicas of the file at `path`.
    pub fn replica_count(&self, path: &VfsPath) -> Result<usize, MetaError> {
        self.file(path)
            .map(|f| f.lock().replicas.len())
            .ok_or_else(|| MetaError::FileNotFound(path.clone()))
    }

    /// Walks the tree and returns every file, sorted by path.
    pub fn all_files(&self) -> Vec<Arc<FileNode>> {
        let mut files = Vec::new();
        for path in self.directory_paths() {
            if let Some(directory) = self.directory(&path) {
                let guard = directory.lock();
                for (_, child) in guard.entries() {
                    if let Child::File(f) = child {
                        files.push(f.clone());
                    }
                }
            }
        }
        files.sort_by(|a, b| a.path().cmp(b.path()));
        files
    }

    /// Paths of files that `node` holds a copy of.
    pub fn files_on_node(&self, node: &str) -> Vec<VfsPath> {
        self.all_files()
            .into_iter()
            .filter(|f| f.has_replica(node))
            .map(|f| f.path().clone())
            .collect()
    }

    /// Sum of file sizes.
    pub fn total_size(&self) -> u64 {
        self.all_files().iter().map(|f| f.size()).sum()
    }

    /// Rebuilds a directory from its persisted record without scheduling a commit.
    pub fn restore_directory(&self, path: &VfsPath, last_modified: u64) -> Result<(), MetaError> {
        if path.is_root() {
            if let Some(root) = self.directory(path) {
                root.lock().last_modified = last_modified;
            }
            return Ok(());
        }
        let parent_path = path.parent().ok_or(MetaError::RootDirectory)?;
        self.restore_directory_chain(&parent_path)?;
        let parent = self
            .directory(&parent_path)
            .ok_or_else(|| MetaError::DirectoryNotFound(parent_path.clone()))?;
        let mut guard = parent.lock();
        match guard.get(path.name()) {
            Some(Child::Directory) => {
                if let Some(existing) = self.directory(path) {
                    existing.lock().last_modified = last_modified;
                }
            }
            Some(Child::File(_)) => return Err(MetaError::NotADirectory(path.clone())),
            None => {
                self.dirs.insert(
                    path.clone(),
                    Arc::new(DirectoryNode::new(path.clone(), last_modified)),
                );
                guard
                    .children
                    .insert(path.name().to_string(), Child::Directory);
            }
        }
        Ok(())
    }

    fn restore_directory_chain(&self, path: &VfsPath) -> Result<(), MetaError> {
        if self.directory(path).is_some() {
            return Ok(());
        }
        self.restore_directory(path, now_ms())
    }

    /// Rebuilds a file from its persisted record without scheduling a commit.
    /// A record with no replicas is logically deleted and skipped.
    pub fn restore_file(&self, path: &VfsPath, state: FileState) -> Result<bool, MetaError> {
        if state.replicas.is_empty() {
            return Ok(false);
        }
        let parent_path = path.parent().ok_or(MetaError::RootDirectory)?;
        self.restore_directory_chain(&parent_path)?;
        let parent = self
            .directory(&parent_path)
            .ok_or_else(|| MetaError::DirectoryNotFound(parent_path.clone()))?;
        let mut guard = parent.lock();
        if guard.is_directory(path.name()) {
            return Err(MetaError::EntryExists(path.clone()));
        }
        guard.children.insert(
            path.name().to_string(),
            Child::File(Arc::new(FileNode::new(path.clone(), state))),
        );
        Ok(true)
    }
}
