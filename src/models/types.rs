use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::StorageError;
use crate::utils::{depth_of, join_child, name_of, parent_of};

/// Kind discriminator for emitted metadata records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// A file inside a directory listing, with optional observed metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub name: String,
    pub path: String,
    pub depth: u32,
    pub parent_path: String,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
}

/// One ordered child of a directory node
///
/// Directory children are held as whole nodes so a seeded tree can nest
/// arbitrarily deep; the codec flattens them to stubs before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildNode {
    File(FileSummary),
    Dir(Box<DirectoryNode>),
}

impl ChildNode {
    pub fn name(&self) -> &str {
        match self {
            ChildNode::File(f) => &f.name,
            ChildNode::Dir(d) => &d.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ChildNode::File(f) => &f.path,
            ChildNode::Dir(d) => &d.path,
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            ChildNode::File(f) => f.depth,
            ChildNode::Dir(d) => d.depth,
        }
    }

    pub fn parent_path(&self) -> &str {
        match self {
            ChildNode::File(f) => &f.parent_path,
            ChildNode::Dir(d) => d.parent_path.as_deref().unwrap_or(""),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ChildNode::Dir(_))
    }
}

/// In-memory directory tree node
///
/// `path` is the canonical cache path (root is the empty string).
/// `is_loaded == true` means `children` is an authoritative enumeration of
/// the directory at the time it was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub path: String,
    pub depth: u32,
    pub parent_path: Option<String>,
    pub children: Vec<ChildNode>,
    pub is_loaded: bool,
    pub mtime: Option<DateTime<Utc>>,
}

impl DirectoryNode {
    /// Creates an empty, unloaded node; name, depth and parent are derived
    /// from the path.
    pub fn new(path: &str) -> Self {
        Self {
            name: name_of(path).to_string(),
            path: path.to_string(),
            depth: depth_of(path),
            parent_path: parent_of(path),
            children: Vec::new(),
            is_loaded: false,
            mtime: None,
        }
    }

    /// Creates an empty node already marked as an authoritative listing.
    pub fn new_loaded(path: &str) -> Self {
        let mut node = Self::new(path);
        node.is_loaded = true;
        node
    }

    pub fn with_mtime(mut self, mtime: DateTime<Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Appends a file child with path and depth derived from this node.
    pub fn push_file(&mut self, name: &str, size: Option<u64>, mtime: Option<DateTime<Utc>>) {
        self.children.push(ChildNode::File(FileSummary {
            name: name.to_string(),
            path: join_child(&self.path, name),
            depth: self.depth + 1,
            parent_path: self.path.clone(),
            size,
            mtime,
        }));
    }

    /// Appends an unexpanded child directory stub.
    pub fn push_dir_stub(&mut self, name: &str, is_loaded: bool) {
        let mut child = DirectoryNode::new(&join_child(&self.path, name));
        child.is_loaded = is_loaded;
        self.children.push(ChildNode::Dir(Box::new(child)));
    }

    /// Appends an already-built directory child (e.g. a loaded subtree).
    pub fn push_dir(&mut self, child: DirectoryNode) {
        self.children.push(ChildNode::Dir(Box::new(child)));
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name()).collect()
    }

    pub fn dir_children(&self) -> impl Iterator<Item = &DirectoryNode> {
        self.children.iter().filter_map(|c| match c {
            ChildNode::Dir(d) => Some(d.as_ref()),
            ChildNode::File(_) => None,
        })
    }

    pub fn file_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_dir()).count()
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

/// A single cached directory entry as stored by the controller
///
/// Timestamps are logical epoch milliseconds from the controller's clock.
/// `accessed_at` equals `cached_at` at first write and both only ever grow.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDirectoryEntry {
    pub node: DirectoryNode,
    pub cached_at: u64,
    pub accessed_at: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub size_estimate_bytes: u64,
    /// Insertion sequence; breaks LRU ties deterministically.
    pub(crate) seq: u64,
}

impl CachedDirectoryEntry {
    pub fn path(&self) -> &str {
        &self.node.path
    }

    pub fn children(&self) -> &[ChildNode] {
        &self.node.children
    }

    pub fn is_loaded(&self) -> bool {
        self.node.is_loaded
    }
}

/// A request to load one directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefetchTarget {
    pub path: String,
    pub name: String,
    pub depth: u32,
    pub parent_path: Option<String>,
}

impl PrefetchTarget {
    pub fn for_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: name_of(path).to_string(),
            depth: depth_of(path),
            parent_path: parent_of(path),
        }
    }

    pub fn from_node(node: &DirectoryNode) -> Self {
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            depth: node.depth,
            parent_path: node.parent_path.clone(),
        }
    }
}

/// Sampled scheduler state emitted through `onStatus`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PrefetchStatus {
    pub running: bool,
    pub pending: usize,
    pub deferred: usize,
    pub indexed_file_count: u64,
    pub processed_count: u64,
    pub last_duration_ms: u64,
    pub average_duration_ms: u64,
    pub milestone: Option<String>,
}

/// Stub metadata for a directory the scheduler does not retain in the live tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredDirMetadata {
    pub kind: NodeKind,
    pub name: String,
    pub path: String,
    pub parent_path: Option<String>,
    pub depth: u32,
    pub is_loaded: bool,
}

impl DeferredDirMetadata {
    pub fn from_node(node: &DirectoryNode) -> Self {
        Self {
            kind: NodeKind::Directory,
            name: node.name.clone(),
            path: node.path.clone(),
            parent_path: node.parent_path.clone(),
            depth: node.depth,
            is_loaded: false,
        }
    }
}

/// Cache and scheduler errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("corrupted cache record for '{path}': {reason}")]
    Corrupted { path: String, reason: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("result belongs to an expired scheduler session")]
    DeferredSession,

    #[error("filesystem adapter failed for '{path}': {message}")]
    AdapterFailure { path: String, message: String },

    #[error("entry is currently being written")]
    EvictionRequested,
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
