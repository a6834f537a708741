use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CacheError, CachedDirectoryEntry, ChildNode, DirectoryNode, FileSummary, Result};
use crate::utils::{depth_of, join_child, name_of, parent_of};

/// Bump when the on-disk record layout changes; older records decode as
/// corrupted and are repaired away.
pub const SCHEMA_VERSION: u32 = 1;

/// Serialized form of one cached directory.
///
/// Children carry only their name and per-kind payload; path, depth and
/// parent are re-derived from the record's own path on decode, so a decoded
/// entry can never contain an inconsistent child.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    schema_version: u32,
    path: String,
    name: String,
    depth: u32,
    parent_path: Option<String>,
    children: Vec<ChildRecord>,
    is_loaded: bool,
    cached_at: u64,
    accessed_at: u64,
    seq: u64,
    mtime: Option<DateTime<Utc>>,
    size_estimate_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum ChildRecord {
    File {
        name: String,
        size: Option<u64>,
        mtime: Option<DateTime<Utc>>,
    },
    Dir {
        name: String,
        is_loaded: bool,
    },
}

/// An encoded entry: the bytes for the KV backend plus the normalized
/// in-memory view the controller hands to readers.
#[derive(Debug)]
pub(crate) struct EncodedEntry {
    pub entry: CachedDirectoryEntry,
    pub bytes: Vec<u8>,
}

/// Checks the §-invariants a caller-supplied node must satisfy before it
/// may be committed: derived fields agree with the path, and every child
/// belongs directly under this node.
pub(crate) fn validate_node(node: &DirectoryNode) -> Result<()> {
    if node.name != name_of(&node.path) {
        return Err(CacheError::InvalidNode(format!(
            "name '{}' does not match path '{}'",
            node.name, node.path
        )));
    }
    if node.depth != depth_of(&node.path) {
        return Err(CacheError::InvalidNode(format!(
            "depth {} does not match path '{}'",
            node.depth, node.path
        )));
    }
    if node.parent_path != parent_of(&node.path) {
        return Err(CacheError::InvalidNode(format!(
            "parent '{:?}' does not match path '{}'",
            node.parent_path, node.path
        )));
    }

    for child in &node.children {
        let name = child.name();
        if name.is_empty() || name.contains('/') {
            return Err(CacheError::InvalidNode(format!(
                "child of '{}' has invalid name '{}'",
                node.path, name
            )));
        }
        if child.path() != join_child(&node.path, name) {
            return Err(CacheError::InvalidNode(format!(
                "child path '{}' is not directly under '{}'",
                child.path(),
                node.path
            )));
        }
        if child.parent_path() != node.path {
            return Err(CacheError::InvalidNode(format!(
                "child '{}' carries parent '{}' instead of '{}'",
                child.path(),
                child.parent_path(),
                node.path
            )));
        }
        if child.depth() != node.depth + 1 {
            return Err(CacheError::InvalidNode(format!(
                "child '{}' has depth {} under parent depth {}",
                child.path(),
                child.depth(),
                node.depth
            )));
        }
    }

    Ok(())
}

/// Encodes a directory node into a cache record.
///
/// Nested grandchildren beneath directory children are stripped; only the
/// stub fields survive. Deeper state belongs to the children's own entries.
pub(crate) fn encode(
    node: &DirectoryNode,
    cached_at: u64,
    accessed_at: u64,
    seq: u64,
    mtime: Option<DateTime<Utc>>,
) -> Result<EncodedEntry> {
    validate_node(node)?;

    let children: Vec<ChildRecord> = node
        .children
        .iter()
        .map(|child| match child {
            ChildNode::File(f) => ChildRecord::File {
                name: f.name.clone(),
                size: f.size,
                mtime: f.mtime,
            },
            ChildNode::Dir(d) => ChildRecord::Dir {
                name: d.name.clone(),
                is_loaded: d.is_loaded,
            },
        })
        .collect();

    let mut record = CacheRecord {
        schema_version: SCHEMA_VERSION,
        path: node.path.clone(),
        name: node.name.clone(),
        depth: node.depth,
        parent_path: node.parent_path.clone(),
        children,
        is_loaded: node.is_loaded,
        cached_at,
        accessed_at,
        seq,
        mtime,
        size_estimate_bytes: 0,
    };

    record.size_estimate_bytes = bincode::serialized_size(&record)
        .map_err(|e| CacheError::InvalidNode(format!("unserializable node: {}", e)))?;

    let bytes = bincode::serialize(&record)
        .map_err(|e| CacheError::InvalidNode(format!("unserializable node: {}", e)))?;

    Ok(EncodedEntry {
        entry: entry_from_record(&record),
        bytes,
    })
}

/// Decodes a cache record fetched under `key`.
///
/// Any mismatch between the bytes and the schema, or between the record and
/// the key it was stored under, is `Corrupted`.
pub(crate) fn decode(key: &str, bytes: &[u8]) -> Result<CachedDirectoryEntry> {
    let record: CacheRecord = bincode::deserialize(bytes).map_err(|e| CacheError::Corrupted {
        path: key.to_string(),
        reason: e.to_string(),
    })?;

    if record.schema_version != SCHEMA_VERSION {
        return Err(CacheError::Corrupted {
            path: key.to_string(),
            reason: format!(
                "schema version {} (expected {})",
                record.schema_version, SCHEMA_VERSION
            ),
        });
    }
    if record.path != key {
        return Err(CacheError::Corrupted {
            path: key.to_string(),
            reason: format!("record path '{}' stored under wrong key", record.path),
        });
    }
    if record.name != name_of(&record.path)
        || record.depth != depth_of(&record.path)
        || record.parent_path != parent_of(&record.path)
    {
        return Err(CacheError::Corrupted {
            path: key.to_string(),
            reason: "derived fields disagree with record path".to_string(),
        });
    }
    if record.cached_at > record.accessed_at {
        return Err(CacheError::Corrupted {
            path: key.to_string(),
            reason: "accessed_at precedes cached_at".to_string(),
        });
    }
    for child in &record.children {
        let name = match child {
            ChildRecord::File { name, .. } | ChildRecord::Dir { name, .. } => name,
        };
        if name.is_empty() || name.contains('/') {
            return Err(CacheError::Corrupted {
                path: key.to_string(),
                reason: format!("child has invalid name '{}'", name),
            });
        }
    }

    Ok(entry_from_record(&record))
}

fn entry_from_record(record: &CacheRecord) -> CachedDirectoryEntry {
    let children = record
        .children
        .iter()
        .map(|child| match child {
            ChildRecord::File { name, size, mtime } => ChildNode::File(FileSummary {
                name: name.clone(),
                path: join_child(&record.path, name),
                depth: record.depth + 1,
                parent_path: record.path.clone(),
                size: *size,
                mtime: *mtime,
            }),
            ChildRecord::Dir { name, is_loaded } => {
                let mut stub = DirectoryNode::new(&join_child(&record.path, name));
                stub.is_loaded = *is_loaded;
                ChildNode::Dir(Box::new(stub))
            }
        })
        .collect();

    let node = DirectoryNode {
        name: record.name.clone(),
        path: record.path.clone(),
        depth: record.depth,
        parent_path: record.parent_path.clone(),
        children,
        is_loaded: record.is_loaded,
        mtime: record.mtime,
    };

    CachedDirectoryEntry {
        node,
        cached_at: record.cached_at,
        accessed_at: record.accessed_at,
        mtime: record.mtime,
        size_estimate_bytes: record.size_estimate_bytes,
        seq: record.seq,
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
