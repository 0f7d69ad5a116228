//! Merging a node's directory listings into the namespace.
//!
//! Each [`RemergeEntry`] describes one directory on one node. The reconciler
//! applies it under that directory's lock, so other nodes and readers see the
//! directory either before or after the merge, never halfway. Work the node
//! itself has to do (deleting garbage, renaming conflicting copies aside) is
//! returned as [`RemoteAction`]s rather than executed inline.

use std::collections::HashSet;
use std::sync::Arc;

use fleetfs_meta::namespace::{DirectoryGuard, ReplicaRemoval};
use fleetfs_meta::{Child, MetaError, Namespace, VfsPath};
use fleetfs_transport::message::{Command, ListingEntry, RemergeEntry, RenameRequest};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

/// A command the node must run to match the master's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction {
    /// Delete the node's copy.
    Delete {
        /// Path on the node.
        path: VfsPath,
    },
    /// Move the node's copy.
    Rename {
        /// Current path on the node.
        from: VfsPath,
        /// Destination directory.
        to_dir: VfsPath,
        /// Destination name.
        to_name: String,
    },
}

impl RemoteAction {
    /// The wire command for this action.
    pub fn to_command(&self) -> Command {
        match self {
            RemoteAction::Delete { path } => Command::Delete {
                path: path.to_string(),
            },
            RemoteAction::Rename {
                from,
                to_dir,
                to_name,
            } => Command::Rename(RenameRequest {
                from: from.to_string(),
                to_dir: to_dir.to_string(),
                to_name: to_name.clone(),
            }),
        }
    }
}

/// Counters for one remerge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemergeStats {
    /// Directory messages applied.
    pub directories: usize,
    /// Directories created in the namespace.
    pub directories_created: usize,
    /// Files created with this node as sole replica.
    pub files_created: usize,
    /// Existing files that gained this node as a replica.
    pub replicas_added: usize,
    /// Files whose size was corrected from their sole replica.
    pub sizes_corrected: usize,
    /// Conflicting copies renamed aside.
    pub conflicts: usize,
    /// Zero-length copies deleted on the node.
    pub garbage_deleted: usize,
    /// Files this node no longer backs.
    pub replicas_unlinked: usize,
    /// Files removed because no replica remained.
    pub files_deleted: usize,
    /// Directories removed because they became empty.
    pub directories_removed: usize,
    /// Entries ignored because master and node disagree on file versus directory.
    pub skipped: usize,
}

impl std::ops::AddAssign for RemergeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.directories += rhs.directories;
        self.directories_created += rhs.directories_created;
        self.files_created += rhs.files_created;
        self.replicas_added += rhs.replicas_added;
        self.sizes_corrected += rhs.sizes_corrected;
        self.conflicts += rhs.conflicts;
        self.garbage_deleted += rhs.garbage_deleted;
        self.replicas_unlinked += rhs.replicas_unlinked;
        self.files_deleted += rhs.files_deleted;
        self.directories_removed += rhs.directories_removed;
        self.skipped += rhs.skipped;
    }
}

/// Result of applying one directory message.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// What changed.
    pub stats: RemergeStats,
    /// Commands to send to the node, in order.
    pub actions: Vec<RemoteAction>,
}

enum FileVerdict {
    Match { added: bool },
    Garbage,
    Corrected { was: u64 },
    Conflict { master_size: u64 },
}

/// Applies one node's listings to the namespace.
pub struct RemergeReconciler {
    namespace: Arc<Namespace>,
    node: String,
    partial: bool,
}

impl RemergeReconciler {
    /// A reconciler for `node`. In partial mode listings only carry changed
    /// entries, so absent entries are not unlinked.
    pub fn new(namespace: Arc<Namespace>, node: &str, partial: bool) -> Self {
        Self {
            namespace,
            node: node.to_string(),
            partial,
        }
    }

    /// Node this reconciler works for.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Applies one directory listing.
    ///
    /// An invalid directory or entry name aborts before anything changes; the
    /// caller must treat that as fatal for the remerge.
    pub fn apply(&self, entry: &RemergeEntry) -> Result<MergeOutcome, MetaError> {
        let mut outcome = MergeOutcome::default();
        // a bare end-of-stream marker
        if entry.directory.is_empty() {
            return Ok(outcome);
        }
        let dir_path = VfsPath::new(&entry.directory)?;
        for item in &entry.listing {
            dir_path.join(&item.name)?;
        }

        let directory = match self.namespace.create_directory_all(&dir_path) {
            Ok(directory) => directory,
            Err(MetaError::NotADirectory(at)) => {
                warn!(node = %self.node, directory = %dir_path, file = %at, "reported directory is a file on the master, skipping");
                outcome.stats.skipped += entry.listing.len();
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };

        let mut guard = directory.lock();
        outcome.stats.directories += 1;
        let mut reported: HashSet<String> = HashSet::with_capacity(entry.listing.len());
        // Conflict copies this listing has already settled. The node's own
        // entry under that name is about to be overwritten by the rename.
        let mut settled: HashSet<String> = HashSet::new();
        for item in &entry.listing {
            reported.insert(item.name.clone());
            if item.is_directory {
                self.merge_directory(&mut guard, item, &mut outcome)?;
            } else if settled.contains(&item.name) {
                trace!(node = %self.node, directory = %dir_path, name = %item.name, "conflict copy already settled");
            } else {
                self.merge_file(&mut guard, item, &mut reported, &mut settled, &mut outcome)?;
            }
        }

        if !self.partial {
            self.unlink_unreported(&mut guard, &reported, &mut outcome)?;
        }
        trace!(node = %self.node, directory = %dir_path, entries = entry.listing.len(), "directory merged");
        Ok(outcome)
    }

    fn merge_directory(
        &self,
        guard: &mut DirectoryGuard<'_>,
        item: &ListingEntry,
        outcome: &mut MergeOutcome,
    ) -> Result<(), MetaError> {
        match guard.get(&item.name) {
            Some(Child::Directory) => {}
            Some(Child::File(file)) => {
                warn!(node = %self.node, path = %file.path(), "node reports a directory where the master has a file, skipping");
                outcome.stats.skipped += 1;
            }
            None => {
                self.namespace
                    .ensure_directory(guard, &item.name, item.last_modified)?;
                outcome.stats.directories_created += 1;
            }
        }
        Ok(())
    }

    fn merge_file(
        &self,
        guard: &mut DirectoryGuard<'_>,
        item: &ListingEntry,
        reported: &mut HashSet<String>,
        settled: &mut HashSet<String>,
        outcome: &mut MergeOutcome,
    ) -> Result<(), MetaError> {
        let file = match guard.get(&item.name) {
            None => {
                self.namespace.insert_file(
                    guard,
                    &item.name,
                    item.size,
                    item.last_modified,
                    &self.node,
                )?;
                outcome.stats.files_created += 1;
                return Ok(());
            }
            Some(Child::Directory) => {
                warn!(node = %self.node, directory = %guard.path(), name = %item.name, "node reports a file where the master has a directory, skipping");
                outcome.stats.skipped += 1;
                return Ok(());
            }
            Some(Child::File(file)) => file.clone(),
        };

        let verdict = {
            let mut state = file.lock();
            if state.size == item.size {
                FileVerdict::Match {
                    added: state.replicas.insert(self.node.clone()),
                }
            } else if item.size == 0 {
                FileVerdict::Garbage
            } else if state.replicas.len() == 1 && state.replicas.contains(&self.node) {
                let was = state.size;
                state.size = item.size;
                state.last_modified = item.last_modified;
                FileVerdict::Corrected { was }
            } else {
                FileVerdict::Conflict {
                    master_size: state.size,
                }
            }
        };

        match verdict {
            FileVerdict::Match { added } => {
                if added {
                    self.namespace.mark_file_dirty(file.path());
                    outcome.stats.replicas_added += 1;
                }
            }
            FileVerdict::Corrected { was } => {
                self.namespace.mark_file_dirty(file.path());
                outcome.stats.sizes_corrected += 1;
                info!(node = %self.node, path = %file.path(), was, now = item.size, "size corrected from sole replica");
            }
            FileVerdict::Garbage => {
                debug!(node = %self.node, path = %file.path(), "zero-length copy, deleting on node");
                self.unlink(guard, &item.name, outcome);
                outcome.actions.push(RemoteAction::Delete {
                    path: file.path().clone(),
                });
                outcome.stats.garbage_deleted += 1;
            }
            FileVerdict::Conflict { master_size } => {
                let conflict_name = format!("{}.{}.conflict", item.name, self.node);
                warn!(
                    node = %self.node,
                    path = %file.path(),
                    master_size,
                    reported_size = item.size,
                    conflict = %conflict_name,
                    "size conflict, renaming node copy aside"
                );
                self.unlink(guard, &item.name, outcome);
                if self.attach_conflict(guard, &conflict_name, item, outcome)? {
                    outcome.actions.push(RemoteAction::Rename {
                        from: file.path().clone(),
                        to_dir: guard.path().clone(),
                        to_name: conflict_name.clone(),
                    });
                    outcome.stats.conflicts += 1;
                    settled.insert(conflict_name.clone());
                }
                reported.insert(conflict_name);
            }
        }
        Ok(())
    }

    /// Creates the conflict file or joins an existing one. Returns false when
    /// the name is taken by a directory.
    fn attach_conflict(
        &self,
        guard: &mut DirectoryGuard<'_>,
        conflict_name: &str,
        item: &ListingEntry,
        outcome: &mut MergeOutcome,
    ) -> Result<bool, MetaError> {
        match guard.get(conflict_name) {
            None => {
                self.namespace.insert_file(
                    guard,
                    conflict_name,
                    item.size,
                    item.last_modified,
                    &self.node,
                )?;
                outcome.stats.files_created += 1;
                Ok(true)
            }
            Some(Child::File(existing)) => {
                let existing = existing.clone();
                let changed = {
                    let mut state = existing.lock();
                    let mut changed = false;
                    if state.size != item.size && state.replicas.iter().all(|r| r == &self.node) {
                        state.size = item.size;
                        state.last_modified = item.last_modified;
                        changed = true;
                    }
                    state.replicas.insert(self.node.clone()) || changed
                };
                if changed {
                    self.namespace.mark_file_dirty(existing.path());
                }
                Ok(true)
            }
            Some(Child::Directory) => {
                warn!(node = %self.node, directory = %guard.path(), name = conflict_name, "conflict name taken by a directory, leaving node copy in place");
                outcome.stats.skipped += 1;
                Ok(false)
            }
        }
    }

    fn unlink_unreported(
        &self,
        guard: &mut DirectoryGuard<'_>,
        reported: &HashSet<String>,
        outcome: &mut MergeOutcome,
    ) -> Result<(), MetaError> {
        for name in guard.names() {
            if reported.contains(&name) {
                continue;
            }
            if guard.is_directory(&name) {
                let report = self
                    .namespace
                    .unlink_node_from_subtree(guard, &name, &self.node)?;
                outcome.stats.replicas_unlinked += report.files_unlinked;
                outcome.stats.files_deleted += report.files_deleted;
                outcome.stats.directories_removed += report.directories_removed;
            } else {
                self.unlink(guard, &name, outcome);
            }
        }
        Ok(())
    }

    fn unlink(&self, guard: &mut DirectoryGuard<'_>, name: &str, outcome: &mut MergeOutcome) {
        match self.namespace.remove_replica_locked(guard, name, &self.node) {
            ReplicaRemoval::NotPresent => {}
            ReplicaRemoval::Removed => outcome.stats.replicas_unlinked += 1,
            ReplicaRemoval::FileDeleted => {
                outcome.stats.replicas_unlinked += 1;
                outcome.stats.files_deleted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetfs_meta::{CommitQueue, CommitQueueConfig};
    use std::collections::BTreeSet;

    fn namespace() -> Arc<Namespace> {
        Arc::new(Namespace::new(Arc::new(CommitQueue::new(
            CommitQueueConfig::default(),
        ))))
    }

    fn p(s: &str) -> VfsPath {
        VfsPath::new(s).unwrap()
    }

    fn listing(directory: &str, listing: Vec<ListingEntry>) -> RemergeEntry {
        RemergeEntry {
            directory: directory.to_string(),
            listing,
            is_final: false,
        }
    }

    fn replicas(ns: &Namespace, path: &str) -> BTreeSet<String> {
        ns.file(&p(path)).unwrap().replicas()
    }

    /// Every file with its size and replicas, plus every directory.
    fn shape(ns: &Namespace) -> (Vec<VfsPath>, Vec<(VfsPath, u64, BTreeSet<String>)>) {
        let files = ns
            .all_files()
            .iter()
            .map(|f| {
                let s = f.snapshot();
                (f.path().clone(), s.size, s.replicas)
            })
            .collect();
        (ns.directory_paths(), files)
    }

    #[test]
    fn test_new_directory_and_file() {
        let ns = namespace();
        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let outcome = reconciler
            .apply(&listing("/dirX", vec![ListingEntry::file("f1", 100, 5)]))
            .unwrap();
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.stats.files_created, 1);
        assert!(ns.directory(&p("/dirX")).is_some());
        let f1 = ns.file(&p("/dirX/f1")).unwrap();
        assert_eq!(f1.size(), 100);
        assert_eq!(f1.replicas(), BTreeSet::from(["A".to_string()]));
    }

    #[test]
    fn test_reported_directories_are_created_eagerly() {
        let ns = namespace();
        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        reconciler
            .apply(&listing("/", vec![ListingEntry::directory("sub", 1)]))
            .unwrap();
        assert!(ns.directory(&p("/sub")).is_some());
        reconciler
            .apply(&listing("/sub", vec![ListingEntry::file("g", 3, 1)]))
            .unwrap();
        assert_eq!(ns.file(&p("/sub/g")).unwrap().size(), 3);
    }

    #[test]
    fn test_size_conflict_renames_aside() {
        let ns = namespace();
        let f1 = ns.add_file(&VfsPath::root(), "f1", 100, 1, "A").unwrap();
        ns.add_replica(&f1, "B");

        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let outcome = reconciler
            .apply(&listing("/", vec![ListingEntry::file("f1", 50, 2)]))
            .unwrap();

        assert_eq!(outcome.stats.conflicts, 1);
        assert_eq!(
            outcome.actions,
            vec![RemoteAction::Rename {
                from: p("/f1"),
                to_dir: VfsPath::root(),
                to_name: "f1.A.conflict".to_string(),
            }]
        );
        let original = ns.file(&p("/f1")).unwrap();
        assert_eq!(original.size(), 100);
        assert_eq!(original.replicas(), BTreeSet::from(["B".to_string()]));
        let conflict = ns.file(&p("/f1.A.conflict")).unwrap();
        assert_eq!(conflict.size(), 50);
        assert_eq!(conflict.replicas(), BTreeSet::from(["A".to_string()]));
    }

    #[test]
    fn test_stale_conflict_copy_in_same_listing_keeps_new_size() {
        let ns = namespace();
        let f1 = ns.add_file(&VfsPath::root(), "f1", 100, 1, "B").unwrap();
        ns.add_replica(&f1, "A");

        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let outcome = reconciler
            .apply(&listing(
                "/",
                vec![
                    ListingEntry::file("f1", 50, 2),
                    ListingEntry::file("f1.A.conflict", 30, 1),
                ],
            ))
            .unwrap();

        assert_eq!(outcome.stats.conflicts, 1);
        assert_eq!(outcome.stats.sizes_corrected, 0);
        let conflict = ns.file(&p("/f1.A.conflict")).unwrap();
        assert_eq!(conflict.size(), 50);
        assert_eq!(conflict.replicas(), BTreeSet::from(["A".to_string()]));
        assert_eq!(replicas(&ns, "/f1"), BTreeSet::from(["B".to_string()]));
    }

    #[test]
    fn test_sole_replica_corrects_size() {
        let ns = namespace();
        ns.add_file(&VfsPath::root(), "f1", 100, 1, "A").unwrap();
        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let outcome = reconciler
            .apply(&listing("/", vec![ListingEntry::file("f1", 70, 9)]))
            .unwrap();
        assert_eq!(outcome.stats.sizes_corrected, 1);
        assert!(outcome.actions.is_empty());
        assert_eq!(ns.file(&p("/f1")).unwrap().size(), 70);
        assert!(ns.file(&p("/f1.A.conflict")).is_none());
    }

    #[test]
    fn test_zero_length_copy_is_deleted_on_node() {
        let ns = namespace();
        let f1 = ns.add_file(&VfsPath::root(), "f1", 100, 1, "B").unwrap();
        ns.add_replica(&f1, "A");
        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let outcome = reconciler
            .apply(&listing("/", vec![ListingEntry::file("f1", 0, 9)]))
            .unwrap();
        assert_eq!(outcome.actions, vec![RemoteAction::Delete { path: p("/f1") }]);
        assert_eq!(replicas(&ns, "/f1"), BTreeSet::from(["B".to_string()]));
        assert_eq!(ns.file(&p("/f1")).unwrap().size(), 100);
    }

    #[test]
    fn test_absent_entries_are_unlinked() {
        let ns = namespace();
        let shared = ns.add_file(&VfsPath::root(), "shared", 1, 1, "A").unwrap();
        ns.add_replica(&shared, "B");
        ns.add_file(&VfsPath::root(), "mine", 1, 1, "A").unwrap();
        ns.add_file(&p("/old/deep"), "x", 1, 1, "A").unwrap();

        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let outcome = reconciler.apply(&listing("/", vec![])).unwrap();

        assert_eq!(replicas(&ns, "/shared"), BTreeSet::from(["B".to_string()]));
        assert!(ns.file(&p("/mine")).is_none());
        assert!(ns.directory(&p("/old")).is_none());
        assert_eq!(outcome.stats.files_deleted, 2);
        assert_eq!(outcome.stats.directories_removed, 2);
    }

    #[test]
    fn test_partial_listing_keeps_absent_entries() {
        let ns = namespace();
        ns.add_file(&VfsPath::root(), "mine", 1, 1, "A").unwrap();
        let reconciler = RemergeReconciler::new(ns.clone(), "A", true);
        reconciler
            .apply(&listing("/", vec![ListingEntry::file("new", 2, 2)]))
            .unwrap();
        assert!(ns.file(&p("/mine")).is_some());
        assert!(ns.file(&p("/new")).is_some());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let ns = namespace();
        let f1 = ns.add_file(&p("/d"), "f1", 100, 1, "B").unwrap();
        ns.add_replica(&f1, "A");
        let conflicted = ns.add_file(&p("/d"), "f2", 10, 1, "B").unwrap();
        ns.add_replica(&conflicted, "C");
        ns.add_file(&p("/d"), "gone", 1, 1, "A").unwrap();

        let stream = vec![
            listing(
                "/",
                vec![ListingEntry::directory("d", 1), ListingEntry::directory("e", 1)],
            ),
            listing(
                "/d",
                vec![
                    ListingEntry::file("f1", 100, 1),
                    ListingEntry::file("f2", 20, 1),
                    ListingEntry::file("new", 5, 1),
                ],
            ),
            listing("/e", vec![ListingEntry::file("g", 7, 1)]),
        ];
        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        for entry in &stream {
            reconciler.apply(entry).unwrap();
        }
        let first = shape(&ns);
        for entry in &stream {
            reconciler.apply(entry).unwrap();
        }
        assert_eq!(shape(&ns), first);
        assert!(ns.file(&p("/d/f2.A.conflict")).is_some());
        assert!(ns.file(&p("/d/gone")).is_none());
    }

    #[test]
    fn test_invalid_name_aborts_without_changes() {
        let ns = namespace();
        let reconciler = RemergeReconciler::new(ns.clone(), "A", false);
        let bad = listing(
            "/d",
            vec![ListingEntry::file("ok", 1, 1), ListingEntry::file("..", 1, 1)],
        );
        assert!(matches!(
            reconciler.apply(&bad),
            Err(MetaError::InvalidPath { .. })
        ));
        assert!(ns.directory(&p("/d")).is_none());
        assert!(reconciler.apply(&listing("relative", vec![])).is_err());
    }

    #[test]
    fn test_type_conflicts_are_skipped() {
        let ns = namespace();
        ns.add_file(&VfsPath::root(), "thing", 1, 1, "B").unwrap();
        ns.create_directory_all(&p("/dir")).unwrap();
        let reconciler = RemergeReconciler::new(ns.clone(), "A", true);
        let outcome = reconciler
            .apply(&listing(
                "/",
                vec![ListingEntry::directory("thing", 1), ListingEntry::file("dir", 1, 1)],
            ))
            .unwrap();
        assert_eq!(outcome.stats.skipped, 2);
        let outcome = reconciler.apply(&listing("/thing", vec![])).unwrap();
        assert_eq!(outcome.stats.skipped, 0);
        assert_eq!(outcome.stats.directories, 0);
    }

    #[test]
    fn test_remote_action_commands() {
        let delete = RemoteAction::Delete { path: p("/a") }.to_command();
        assert_eq!(delete, Command::Delete { path: "/a".into() });
        let rename = RemoteAction::Rename {
            from: p("/a/f"),
            to_dir: p("/a"),
            to_name: "f.A.conflict".into(),
        }
        .to_command();
        assert_eq!(rename.name(), "rename");
    }
}
