use std::collections::{HashMap, HashSet};

use log::warn;
use serde::Serialize;

use super::cache::TreeCacheController;
use super::codec;
use super::CacheEvent;

/// Entries deleted per progress bucket during a full clear.
const CLEAR_BUCKET_SIZE: usize = 50;

/// Maintenance operations dispatched by `perform_cache_management`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOp {
    Clear,
    Cleanup,
    Validate,
    Compact,
}

/// Progress sample handed to maintenance callbacks.
///
/// The final sample of every operation satisfies `completed == total` and
/// carries a completion marker in `current_operation`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceProgress {
    pub completed: usize,
    pub total: usize,
    pub current_operation: String,
}

/// Optional progress callback wrapper; `none()` reports nowhere.
#[derive(Default)]
pub struct ProgressSink(Option<Box<dyn Fn(MaintenanceProgress) + Send + Sync>>);

impl ProgressSink {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(f: impl Fn(MaintenanceProgress) + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub(crate) fn emit(&self, completed: usize, total: usize, operation: impl Into<String>) {
        if let Some(f) = &self.0 {
            f(MaintenanceProgress {
                completed,
                total,
                current_operation: operation.into(),
            });
        }
    }
}

/// Integrity validation outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub valid_entries: usize,
    pub corrupted_entries: usize,
    pub repaired_entries: usize,
    pub issues: Vec<String>,
}

/// Compaction outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionReport {
    pub removed_entries: usize,
    pub space_saved: u64,
}

/// Result of one maintenance dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceReport {
    Cleared { removed_entries: usize },
    Cleanup { removed_entries: usize },
    Integrity(IntegrityReport),
    Compaction(CompactionReport),
}

impl TreeCacheController {
    /// Dispatches one maintenance operation. Storage errors are swallowed;
    /// maintenance always runs to completion.
    pub async fn perform_cache_management(
        &self,
        op: MaintenanceOp,
        max_age_ms: Option<u64>,
        progress: &ProgressSink,
    ) -> MaintenanceReport {
        match op {
            MaintenanceOp::Clear => MaintenanceReport::Cleared {
                removed_entries: self.clear_cache_with_progress(progress).await,
            },
            MaintenanceOp::Cleanup => MaintenanceReport::Cleanup {
                removed_entries: self.cleanup_old_entries(max_age_ms, progress).await,
            },
            MaintenanceOp::Validate => {
                MaintenanceReport::Integrity(self.validate_cache_integrity(progress).await)
            }
            MaintenanceOp::Compact => {
                MaintenanceReport::Compaction(self.compact_cache(progress).await)
            }
        }
    }

    /// Empties the cache, reporting progress per bucket of deletions.
    pub async fn clear_cache_with_progress(&self, progress: &ProgressSink) -> usize {
        let keys = match self.dirs_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("clear scan failed: {}", err);
                Vec::new()
            }
        };

        let total = keys.len();
        let mut deleted = 0usize;
        for bucket in keys.chunks(CLEAR_BUCKET_SIZE) {
            for key in bucket {
                self.remove_entry(key).await;
                deleted += 1;
            }
            progress.emit(deleted, total, "Clearing cached directories");
        }

        // catch anything written during the sweep, plus the snapshots
        self.clear_cache().await;
        progress.emit(total, total, "Clear complete");
        total
    }

    /// Removes entries older than the TTL (defaults to the configured
    /// `max_age_ms`). Returns the number of entries removed.
    pub async fn cleanup_old_entries(
        &self,
        max_age_ms: Option<u64>,
        progress: &ProgressSink,
    ) -> usize {
        let ttl = max_age_ms.unwrap_or(self.max_age_ms);
        let now = self.clock().now_ms();

        let mut expired: Vec<String> = Vec::new();
        let scan = self
            .iterate_dirs(&mut |key, bytes| {
                let cached_at = codec::decode(key, bytes).map(|e| e.cached_at).unwrap_or(0);
                if now.saturating_sub(cached_at) > ttl {
                    expired.push(key.to_string());
                }
            })
            .await;
        if let Err(err) = scan {
            warn!("cleanup scan failed: {}", err);
        }

        let total = expired.len();
        for (index, path) in expired.iter().enumerate() {
            self.remove_entry(path).await;
            self.emit_event(CacheEvent::Evicted { path: path.clone() });
            progress.emit(index + 1, total, format!("Removed expired '{}'", path));
        }
        progress.emit(total, total, "Cleanup complete");
        total
    }

    /// Decodes every record; entries that fail decode are deleted and
    /// counted as repaired. No partial recovery is attempted.
    pub async fn validate_cache_integrity(&self, progress: &ProgressSink) -> IntegrityReport {
        let keys = match self.dirs_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("integrity scan failed: {}", err);
                Vec::new()
            }
        };

        let total = keys.len();
        let mut report = IntegrityReport {
            valid_entries: 0,
            corrupted_entries: 0,
            repaired_entries: 0,
            issues: Vec::new(),
        };

        for (index, key) in keys.iter().enumerate() {
            match self.dirs_get(key).await {
                Ok(Some(bytes)) => match codec::decode(key, &bytes) {
                    Ok(_) => report.valid_entries += 1,
                    Err(err) => {
                        self.repair_entry(key).await;
                        report.corrupted_entries += 1;
                        report.repaired_entries += 1;
                        report
                            .issues
                            .push(format!("Removed corrupted entry '{}': {}", key, err));
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    report
                        .issues
                        .push(format!("Could not read '{}': {}", key, err));
                }
            }
            progress.emit(index + 1, total, format!("Validated '{}'", key));
        }

        progress.emit(total, total, "Integrity validation complete");
        report
    }

    /// Removes stub-only entries and entries whose parent no longer lists
    /// them. Returns the space reclaimed.
    pub async fn compact_cache(&self, progress: &ProgressSink) -> CompactionReport {
        struct Scanned {
            size: u64,
            stub_only: bool,
            parent: Option<String>,
            name: String,
        }

        let mut scanned: Vec<(String, Scanned)> = Vec::new();
        let mut dir_children: HashMap<String, HashSet<String>> = HashMap::new();

        let scan = self
            .iterate_dirs(&mut |key, bytes| {
                if let Ok(entry) = codec::decode(key, bytes) {
                    let children: HashSet<String> = entry
                        .node
                        .children
                        .iter()
                        .filter(|c| c.is_dir())
                        .map(|c| c.name().to_string())
                        .collect();
                    dir_children.insert(key.to_string(), children);
                    scanned.push((
                        key.to_string(),
                        Scanned {
                            size: entry.size_estimate_bytes,
                            stub_only: !entry.node.is_loaded && entry.node.children.is_empty(),
                            parent: entry.node.parent_path.clone(),
                            name: entry.node.name.clone(),
                        },
                    ));
                }
            })
            .await;
        if let Err(err) = scan {
            warn!("compaction scan failed: {}", err);
        }

        let victims: Vec<(String, u64)> = scanned
            .iter()
            .filter(|(path, meta)| {
                if !path.is_empty() && meta.stub_only {
                    return true;
                }
                // unreachable: the parent entry exists but no longer lists
                // this directory among its children
                match &meta.parent {
                    Some(parent) => dir_children
                        .get(parent)
                        .map(|names| !names.contains(&meta.name))
                        .unwrap_or(false),
                    None => false,
                }
            })
            .map(|(path, meta)| (path.clone(), meta.size))
            .collect();

        let total = victims.len();
        let mut report = CompactionReport {
            removed_entries: 0,
            space_saved: 0,
        };
        for (index, (path, size)) in victims.iter().enumerate() {
            if self.remove_entry(path).await {
                report.removed_entries += 1;
                report.space_saved += size;
                self.emit_event(CacheEvent::Evicted { path: path.clone() });
            }
            progress.emit(index + 1, total, format!("Compacted '{}'", path));
        }

        progress.emit(total, total, "Compaction complete");
        report
    }
}

#[cfg(test)]
#[path = "maintenance_tests.rs"]
mod tests;
