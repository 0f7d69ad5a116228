use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch, as carried in listings and records.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A normalized absolute path in the master's namespace.
///
/// Always starts with `/`, never ends with one (except the root), and has
/// no empty, `.` or `..` components.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VfsPath(String);

impl VfsPath {
    /// The namespace root.
    pub fn root() -> Self {
        VfsPath("/".to_string())
    }

    /// Parses and normalizes a path. Repeated and trailing slashes are dropped.
    pub fn new(raw: &str) -> Result<Self, MetaError> {
        if !raw.starts_with('/') {
            return Err(MetaError::InvalidPath {
                path: raw.to_string(),
                reason: "not absolute",
            });
        }
        let mut normalized = String::with_capacity(raw.len());
        for component in raw.split('/').filter(|c| !c.is_empty()) {
            validate_name(component).map_err(|reason| MetaError::InvalidPath {
                path: raw.to_string(),
                reason,
            })?;
            normalized.push('/');
            normalized.push_str(component);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }
        Ok(VfsPath(normalized))
    }

    /// Whether this is the root.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The path as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last component; empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    /// Containing directory; `None` for the root.
    pub fn parent(&self) -> Option<VfsPath> {
        if self.is_root() {
            return None;
        }
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            Some(VfsPath::root())
        } else {
            Some(VfsPath(self.0[..idx].to_string()))
        }
    }

    /// Appends one component.
    pub fn join(&self, name: &str) -> Result<VfsPath, MetaError> {
        validate_name(name).map_err(|reason| MetaError::InvalidPath {
            path: format!("{}/{}", self.0.trim_end_matches('/'), name),
            reason,
        })?;
        if self.is_root() {
            Ok(VfsPath(format!("/{name}")))
        } else {
            Ok(VfsPath(format!("{}/{}", self.0, name)))
        }
    }

    /// Components from the root down.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components; zero for the root.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Whether `other` lies strictly below this path.
    pub fn is_ancestor_of(&self, other: &VfsPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty component");
    }
    if name == "." || name == ".." {
        return Err("relative component");
    }
    if name.contains('/') || name.contains('\0') {
        return Err("illegal character");
    }
    Ok(())
}

/// Error types for namespace, persistence and commit operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// A path failed validation.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The requested directory does not exist.
    #[error("directory {0} not found")]
    DirectoryNotFound(VfsPath),

    /// The requested file does not exist.
    #[error("file {0} not found")]
    FileNotFound(VfsPath),

    /// A child with this name already exists.
    #[error("entry {0} already exists")]
    EntryExists(VfsPath),

    /// A path component is a file where a directory was required.
    #[error("{0} is not a directory")]
    NotADirectory(VfsPath),

    /// The root cannot be removed or renamed.
    #[error("operation not permitted on the root directory")]
    RootDirectory,

    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalization() {
        assert_eq!(VfsPath::new("/").unwrap(), VfsPath::root());
        assert_eq!(VfsPath::new("//a///b/").unwrap().as_str(), "/a/b");
        assert!(VfsPath::new("a/b").is_err());
        assert!(VfsPath::new("/a/../b").is_err());
        assert!(VfsPath::new("/a/./b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        let path = VfsPath::new("/dirX/f1").unwrap();
        assert_eq!(path.name(), "f1");
        assert_eq!(path.parent().unwrap().as_str(), "/dirX");
        assert_eq!(path.parent().unwrap().parent().unwrap(), VfsPath::root());
        assert!(VfsPath::root().parent().is_none());
        assert_eq!(VfsPath::root().name(), "");
    }

    #[test]
    fn test_join() {
        let root = VfsPath::root();
        let dir = root.join("dirX").unwrap();
        assert_eq!(dir.as_str(), "/dirX");
        assert_eq!(dir.join("f1").unwrap().as_str(), "/dirX/f1");
        assert!(dir.join("a/b").is_err());
        assert!(dir.join("..").is_err());
    }

    #[test]
    fn test_ancestry() {
        let a = VfsPath::new("/a").unwrap();
        let ab = VfsPath::new("/a/b").unwrap();
        let abc = VfsPath::new("/abc").unwrap();
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&abc));
        assert!(!a.is_ancestor_of(&a));
        assert!(VfsPath::root().is_ancestor_of(&a));
        assert_eq!(ab.depth(), 2);
    }

    proptest! {
        #[test]
        fn prop_normalized_paths_are_fixed_points(parts in proptest::collection::vec("[a-z0-9_]{1,8}", 0..6)) {
            let raw = format!("/{}/", parts.join("//"));
            let once = VfsPath::new(&raw).unwrap();
            let twice = VfsPath::new(once.as_str()).unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.depth(), parts.len());
        }
    }
}
