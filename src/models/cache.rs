use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::codec;
use super::maintenance::ProgressSink;
use super::{
    CacheConfig, CacheError, CacheEvent, CachedDirectoryEntry, ChildNode, DirectoryNode,
    EventChannel, RecordedEvent, Result,
};
use crate::io::{KvBackend, MemoryBackend, NoopBackend, SledDatabase, StorageError};
use crate::utils::{is_within, LogicalClock};

/// Decoded-entry cache in front of the KV backend.
const HOT_CACHE_CAPACITY: usize = 100;

/// Snapshot schema; bumped independently of the directory record schema.
const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Aggregate cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub average_load_time_ms: f64,
    pub batch_writes: u64,
    pub average_batch_write_time_ms: f64,
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

/// Storage footprint summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSize {
    pub total_entries: usize,
    pub estimated_size_bytes: u64,
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

/// Combined stats + size, as handed to UI consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    pub stats: CacheStats,
    pub size: CacheSize,
}

/// One page of children served by `load_more_children`
#[derive(Debug, Clone, PartialEq)]
pub struct ChildPage {
    pub children: Vec<ChildNode>,
    pub offset: usize,
    pub total: usize,
    /// True once every child of the entry has been served.
    pub complete: bool,
}

#[derive(Debug, Default)]
struct StatsInner {
    hits: u64,
    misses: u64,
    load_time_total_ms: u64,
    load_samples: u64,
    batch_writes: u64,
    batch_time_total_ms: u64,
}

/// Persisted root snapshot; unlike directory records this keeps the whole
/// tree so a cold start can paint instantly before any per-path lookups.
#[derive(Debug, Serialize, Deserialize)]
struct TreeSnapshotRecord {
    schema_version: u32,
    saved_at: u64,
    root: DirectoryNode,
}

/// Single owner of every cached directory entry.
///
/// All reads and writes to the KV backend go through this type; the
/// scheduler and UI consumers only hold references. When durable storage
/// is disabled or unavailable the controller degrades to a no-op backend
/// whose reads are always absent, so callers never need a special case.
pub struct TreeCacheController {
    dirs: Arc<dyn KvBackend>,
    roots: Arc<dyn KvBackend>,
    database: Option<SledDatabase>,
    clock: Arc<LogicalClock>,
    hot: Mutex<LruCache<String, CachedDirectoryEntry>>,
    in_flight: Mutex<HashSet<String>>,
    write_released: Notify,
    stats: Mutex<StatsInner>,
    entry_count: tokio::sync::Mutex<Option<usize>>,
    seq: AtomicU64,
    events: EventChannel<CacheEvent>,
    caching_enabled: bool,
    pub(crate) max_entries: usize,
    pub(crate) max_age_ms: u64,
    fresh_ttl_ms: u64,
}

impl TreeCacheController {
    /// Opens the configured sled database, degrading to the no-op backend
    /// when caching is disabled or storage cannot be opened.
    pub fn new(config: &CacheConfig) -> Self {
        if !config.enable_caching {
            return Self::build(Arc::new(NoopBackend), Arc::new(NoopBackend), config, false);
        }
        match SledDatabase::open(&config.db_name) {
            Ok(db) => Self::from_database(db, config),
            Err(err) => {
                warn!(
                    "cache storage '{}' unavailable, running filesystem-only: {}",
                    config.db_name, err
                );
                Self::build(Arc::new(NoopBackend), Arc::new(NoopBackend), config, false)
            }
        }
    }

    /// Opens the database at an explicit path instead of the platform
    /// cache directory.
    pub fn open_at(path: &Path, config: &CacheConfig) -> Self {
        match SledDatabase::open_at(path) {
            Ok(db) => Self::from_database(db, config),
            Err(err) => {
                warn!(
                    "cache storage at '{}' unavailable, running filesystem-only: {}",
                    path.display(),
                    err
                );
                Self::build(Arc::new(NoopBackend), Arc::new(NoopBackend), config, false)
            }
        }
    }

    fn from_database(db: SledDatabase, config: &CacheConfig) -> Self {
        let namespaces = db.namespace(&config.store_name).and_then(|dirs| {
            let roots = db.namespace(&format!("{}.roots", config.store_name))?;
            Ok((dirs, roots))
        });
        match namespaces {
            Ok((dirs, roots)) => {
                let mut controller =
                    Self::build(Arc::new(dirs), Arc::new(roots), config, true);
                controller.database = Some(db);
                controller
            }
            Err(err) => {
                warn!("cache namespaces unavailable, running filesystem-only: {}", err);
                Self::build(Arc::new(NoopBackend), Arc::new(NoopBackend), config, false)
            }
        }
    }

    /// Builds a controller over caller-supplied namespaces.
    pub fn with_backends(
        dirs: Arc<dyn KvBackend>,
        roots: Arc<dyn KvBackend>,
        config: &CacheConfig,
    ) -> Self {
        Self::build(dirs, roots, config, true)
    }

    /// Ephemeral controller backed by in-process B-trees.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::build(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            config,
            true,
        )
    }

    fn build(
        dirs: Arc<dyn KvBackend>,
        roots: Arc<dyn KvBackend>,
        config: &CacheConfig,
        caching_enabled: bool,
    ) -> Self {
        let clock = Arc::new(LogicalClock::new());
        let capacity =
            NonZeroUsize::new(HOT_CACHE_CAPACITY).expect("hot cache capacity must be non-zero");
        Self {
            dirs,
            roots,
            database: None,
            events: EventChannel::new(Arc::clone(&clock)),
            clock,
            hot: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashSet::new()),
            write_released: Notify::new(),
            stats: Mutex::new(StatsInner::default()),
            entry_count: tokio::sync::Mutex::new(None),
            seq: AtomicU64::new(0),
            caching_enabled,
            max_entries: config.max_entries.max(1),
            max_age_ms: config.max_age_ms,
            fresh_ttl_ms: config.fresh_ttl_ms,
        }
    }

    /// Logical clock shared with the event channel; exposed for the
    /// scheduler's status stamps.
    pub(crate) fn clock(&self) -> Arc<LogicalClock> {
        Arc::clone(&self.clock)
    }

    /// Forces buffered storage writes to disk, when the backend buffers.
    pub async fn flush(&self) -> Result<()> {
        if let Some(database) = &self.database {
            database.flush().await.map_err(CacheError::StorageUnavailable)?;
        }
        Ok(())
    }

    /// Subscribes to the cache's event history; with `replay` the retained
    /// events are delivered first.
    pub fn subscribe_events(&self, replay: bool) -> flume::Receiver<RecordedEvent<CacheEvent>> {
        self.events.subscribe(replay)
    }

    // --- reads -----------------------------------------------------------

    /// Returns the cached entry for `path`, bumping its access time.
    ///
    /// Never fails: storage errors and corrupted records read as absent
    /// (the latter are deleted on the spot).
    pub async fn get_cached_directory(&self, path: &str) -> Option<CachedDirectoryEntry> {
        let started = Instant::now();

        let hot_hit = {
            let mut hot = self.hot.lock().unwrap_or_else(|e| e.into_inner());
            hot.get(path).cloned()
        };
        if let Some(entry) = hot_hit {
            return Some(self.commit_access(path, entry, started).await);
        }

        match self.dirs.get(path).await {
            Ok(Some(bytes)) => match codec::decode(path, &bytes) {
                Ok(entry) => Some(self.commit_access(path, entry, started).await),
                Err(err) => {
                    error!("repairing corrupted cache entry '{}': {}", path, err);
                    self.repair_entry(path).await;
                    self.record_miss(path);
                    None
                }
            },
            Ok(None) => {
                self.record_miss(path);
                None
            }
            Err(err) => {
                warn!("cache read failed for '{}': {}", path, err);
                self.record_miss(path);
                None
            }
        }
    }

    /// Returns the entry truncated to at most `max_children` children;
    /// a truncated entry reads as not loaded. Access time is not bumped.
    pub async fn get_cached_directory_lazy(
        &self,
        path: &str,
        max_children: usize,
    ) -> Option<CachedDirectoryEntry> {
        let entry = self.peek_entry(path).await?;
        Some(Self::truncate_entry(entry, max_children))
    }

    /// `get_cached_directory_lazy` with paging progress, as exposed to UI
    /// consumers.
    pub async fn load_directory_lazy(
        &self,
        path: &str,
        max_children: usize,
        progress: &ProgressSink,
    ) -> Option<CachedDirectoryEntry> {
        let entry = self.peek_entry(path).await?;
        let total = entry.node.children.len();
        let entry = Self::truncate_entry(entry, max_children);
        let served = entry.node.children.len();
        progress.emit(
            served,
            total,
            if served == total {
                "All children served"
            } else {
                "Serving first page"
            },
        );
        Some(entry)
    }

    /// Serves the next page of children after an initial lazy load.
    ///
    /// The page is `complete` only once every child has been served.
    pub async fn load_more_children(
        &self,
        path: &str,
        current_children_count: usize,
        batch_size: usize,
        progress: &ProgressSink,
    ) -> Option<ChildPage> {
        let entry = self.peek_entry(path).await?;
        let total = entry.node.children.len();
        let offset = current_children_count.min(total);
        let end = offset.saturating_add(batch_size).min(total);
        let children = entry.node.children[offset..end].to_vec();
        let complete = end >= total;
        progress.emit(
            end,
            total,
            if complete {
                "All children served"
            } else {
                "Serving children"
            },
        );
        Some(ChildPage {
            children,
            offset,
            total,
            complete,
        })
    }

    /// True iff the entry exists and was cached within `ttl` (defaults to
    /// the configured freshness TTL). Access time is not bumped.
    pub async fn is_directory_fresh(&self, path: &str, ttl_ms: Option<u64>) -> bool {
        let ttl = ttl_ms.unwrap_or(self.fresh_ttl_ms);
        match self.peek_entry(path).await {
            Some(entry) => self.clock.now_ms().saturating_sub(entry.cached_at) <= ttl,
            None => false,
        }
    }

    /// Paths whose cached mtime differs from the observed one, plus paths
    /// with no entry at all.
    pub async fn get_directories_needing_update(
        &self,
        observed: &[(String, DateTime<Utc>)],
    ) -> Vec<String> {
        let mut stale = Vec::new();
        for (path, mtime) in observed {
            match self.peek_entry(path).await {
                None => stale.push(path.clone()),
                Some(entry) if entry.mtime != Some(*mtime) => stale.push(path.clone()),
                Some(_) => {}
            }
        }
        stale
    }

    // --- writes ----------------------------------------------------------

    /// Commits one entry. `cached_at` defaults to the current clock.
    pub async fn set_cached_directory(
        &self,
        path: &str,
        node: &DirectoryNode,
        cached_at: Option<u64>,
    ) -> Result<()> {
        self.check_path(path, node)?;
        codec::validate_node(node)?;

        let existing = self.peek_entry(path).await;
        let now = self.clock.now_ms();
        let cached_at = cached_at.unwrap_or(now);
        let encoded = self.stage_entry(node, existing.as_ref(), cached_at, node.mtime)?;

        self.write_guarded(path, encoded.bytes)
            .await
            .map_err(CacheError::StorageUnavailable)?;
        self.commit_entry(path, encoded.entry, existing.is_none())
            .await;
        self.enforce_capacity().await;
        Ok(())
    }

    /// Commits several entries as one batch write.
    ///
    /// Validation runs up front; a storage failure mid-batch rolls back the
    /// already-written prefix, so observers see all entries or none.
    pub async fn batch_set_directories(&self, entries: &[(String, DirectoryNode)]) -> Result<()> {
        let items: Vec<(String, DirectoryNode, Option<DateTime<Utc>>)> = entries
            .iter()
            .map(|(path, node)| (path.clone(), node.clone(), node.mtime))
            .collect();
        self.batch_commit(items).await
    }

    /// Replaces the entry wholesale, advancing `cached_at` and preserving
    /// a greater `accessed_at`. Storage failures are logged, not surfaced.
    pub async fn merge_directory_update(&self, path: &str, fresh: &DirectoryNode) -> Result<()> {
        self.merge_inner(path, fresh, fresh.mtime).await
    }

    /// Like `merge_directory_update` but records an observed mtime.
    pub async fn perform_incremental_update(
        &self,
        path: &str,
        fresh: &DirectoryNode,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.merge_inner(path, fresh, mtime.or(fresh.mtime)).await
    }

    /// Batched `perform_incremental_update`; counted as one batch write.
    pub async fn perform_batch_incremental_update(
        &self,
        entries: Vec<(String, DirectoryNode, Option<DateTime<Utc>>)>,
    ) -> Result<()> {
        let items = entries
            .into_iter()
            .map(|(path, node, mtime)| {
                let mtime = mtime.or(node.mtime);
                (path, node, mtime)
            })
            .collect();
        self.batch_commit(items).await
    }

    async fn merge_inner(
        &self,
        path: &str,
        fresh: &DirectoryNode,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check_path(path, fresh)?;
        codec::validate_node(fresh)?;

        let existing = self.peek_entry(path).await;
        let now = self.clock.now_ms();
        let encoded = self.stage_entry(fresh, existing.as_ref(), now, mtime)?;

        match self.write_guarded(path, encoded.bytes).await {
            Ok(()) => {
                self.commit_entry(path, encoded.entry, existing.is_none())
                    .await;
                self.enforce_capacity().await;
            }
            Err(err) => warn!("merge write failed for '{}': {}", path, err),
        }
        Ok(())
    }

    async fn batch_commit(
        &self,
        items: Vec<(String, DirectoryNode, Option<DateTime<Utc>>)>,
    ) -> Result<()> {
        let started = Instant::now();

        for (path, node, _) in &items {
            self.check_path(path, node)?;
            codec::validate_node(node)?;
        }

        // path → previous bytes, for rollback of a partial batch
        let mut written: Vec<(String, Option<Vec<u8>>)> = Vec::new();
        let mut staged = Vec::new();
        let mut created = 0usize;

        for (path, node, mtime) in &items {
            let previous = self.dirs.get(path).await.unwrap_or(None);
            let existing = previous
                .as_deref()
                .and_then(|bytes| codec::decode(path, bytes).ok());
            let now = self.clock.now_ms();
            let encoded = self.stage_entry(node, existing.as_ref(), now, *mtime)?;

            if let Err(err) = self.write_guarded(path, encoded.bytes.clone()).await {
                self.rollback_batch(&written).await;
                return Err(CacheError::StorageUnavailable(err));
            }

            if existing.is_none() {
                created += 1;
            }
            written.push((path.clone(), previous));
            staged.push((path.clone(), encoded.entry));
        }

        // all writes landed; only now publish to the hot layer and stats
        for (path, entry) in staged {
            if self.caching_enabled {
                let mut hot = self.hot.lock().unwrap_or_else(|e| e.into_inner());
                hot.put(path, entry);
            }
        }
        self.adjust_count(created as isize).await;
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.batch_writes += 1;
            stats.batch_time_total_ms += started.elapsed().as_millis() as u64;
        }
        self.events.emit(CacheEvent::BatchWrite { count: items.len() });
        self.enforce_capacity().await;
        Ok(())
    }

    async fn rollback_batch(&self, written: &[(String, Option<Vec<u8>>)]) {
        for (path, previous) in written.iter().rev() {
            let result = match previous {
                Some(bytes) => self.dirs.put(path, bytes.clone()).await,
                None => self.dirs.delete(path).await,
            };
            if let Err(err) = result {
                warn!("batch rollback failed for '{}': {}", path, err);
            }
        }
    }

    // --- invalidation ----------------------------------------------------

    /// Deletes one entry. Never fatal.
    pub async fn invalidate_directory(&self, path: &str) {
        if self.remove_entry(path).await {
            self.events.emit(CacheEvent::Invalidated {
                path: path.to_string(),
            });
        }
    }

    /// Deletes the entry so reads return absent until the next put.
    pub async fn mark_directory_stale(&self, path: &str) {
        debug!("marking '{}' stale", path);
        self.invalidate_directory(path).await;
    }

    /// Deletes every entry at or below `path`.
    pub async fn invalidate_subtree(&self, path: &str) {
        self.invalidate_subtree_with_progress(path, &ProgressSink::none())
            .await;
    }

    /// Subtree invalidation with a progress callback after each committed
    /// deletion and once at completion.
    pub async fn invalidate_subtree_with_progress(&self, path: &str, progress: &ProgressSink) {
        let victims: Vec<String> = match self.dirs.keys().await {
            Ok(keys) => keys.into_iter().filter(|k| is_within(k, path)).collect(),
            Err(err) => {
                warn!("subtree invalidation scan failed for '{}': {}", path, err);
                Vec::new()
            }
        };

        let total = victims.len();
        for (index, victim) in victims.iter().enumerate() {
            if self.remove_entry(victim).await {
                self.events.emit(CacheEvent::Invalidated {
                    path: victim.clone(),
                });
            }
            progress.emit(index + 1, total, format!("Removed '{}'", victim));
        }
        progress.emit(total, total, "Subtree invalidation complete");
    }

    /// Empties both namespaces and resets statistics.
    pub async fn clear_cache(&self) {
        if let Err(err) = self.dirs.clear().await {
            warn!("cache clear failed: {}", err);
        }
        if let Err(err) = self.roots.clear().await {
            warn!("snapshot clear failed: {}", err);
        }
        self.reset_local_state().await;
        self.events.emit(CacheEvent::Cleared);
    }

    pub(crate) async fn reset_local_state(&self) {
        self.hot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = StatsInner::default();
        *self.entry_count.lock().await = Some(0);
    }

    // --- eviction --------------------------------------------------------

    /// Removes oldest-accessed entries until the count is within
    /// `max_entries`. Entries with an in-flight writer are skipped and
    /// retried once after the writer releases.
    pub async fn evict_lru_entries(&self, max_entries: usize) -> usize {
        let mut candidates: Vec<(u64, u64, String)> = Vec::new();
        let scan = self
            .dirs
            .iterate(&mut |key, bytes| {
                match codec::decode(key, bytes) {
                    Ok(entry) => candidates.push((entry.accessed_at, entry.seq, key.to_string())),
                    // corrupt entries sort oldest and go first
                    Err(_) => candidates.push((0, 0, key.to_string())),
                }
            })
            .await;
        if let Err(err) = scan {
            warn!("eviction scan failed: {}", err);
            return 0;
        }

        let total = candidates.len();
        if total <= max_entries {
            return 0;
        }
        let excess = total - max_entries;
        candidates.sort();

        let mut removed = 0usize;
        let mut deferred: Vec<(u64, String)> = Vec::new();

        for (accessed_at, _, path) in candidates {
            if removed >= excess {
                break;
            }
            let busy = {
                let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.contains(&path)
            };
            if busy {
                debug!("eviction deferred for '{}': writer in flight", path);
                deferred.push((accessed_at, path));
                continue;
            }
            if self.remove_entry(&path).await {
                self.events.emit(CacheEvent::Evicted { path });
                removed += 1;
            }
        }

        // one retry after the writers release; skip entries the writer
        // refreshed in the meantime
        for (snapshot_accessed_at, path) in deferred {
            if removed >= excess {
                break;
            }
            self.acquire_write(&path).await;
            self.release_write(&path);
            match self.peek_entry(&path).await {
                Some(entry) if entry.accessed_at > snapshot_accessed_at => continue,
                None => continue,
                Some(_) => {}
            }
            if self.remove_entry(&path).await {
                self.events.emit(CacheEvent::Evicted { path });
                removed += 1;
            }
        }

        removed
    }

    async fn enforce_capacity(&self) {
        if self.total_entries().await > self.max_entries {
            self.evict_lru_entries(self.max_entries).await;
        }
    }

    // --- stats -----------------------------------------------------------

    pub async fn get_cache_stats(&self) -> CacheStats {
        let (count, size, oldest, newest) = self.scan_extents().await;
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let lookups = stats.hits + stats.misses;
        let hit_rate = if lookups > 0 {
            stats.hits as f64 / lookups as f64
        } else {
            0.0
        };
        let miss_rate = if lookups > 0 {
            stats.misses as f64 / lookups as f64
        } else {
            0.0
        };
        CacheStats {
            total_entries: count,
            total_size_bytes: size,
            hit_rate,
            miss_rate,
            average_load_time_ms: if stats.load_samples > 0 {
                stats.load_time_total_ms as f64 / stats.load_samples as f64
            } else {
                0.0
            },
            batch_writes: stats.batch_writes,
            average_batch_write_time_ms: if stats.batch_writes > 0 {
                stats.batch_time_total_ms as f64 / stats.batch_writes as f64
            } else {
                0.0
            },
            oldest_entry: oldest,
            newest_entry: newest,
        }
    }

    pub async fn get_cache_size(&self) -> CacheSize {
        let (count, size, oldest, newest) = self.scan_extents().await;
        CacheSize {
            total_entries: count,
            estimated_size_bytes: size,
            oldest_entry: oldest,
            newest_entry: newest,
        }
    }

    pub async fn get_cache_info(&self) -> CacheInfo {
        CacheInfo {
            stats: self.get_cache_stats().await,
            size: self.get_cache_size().await,
        }
    }

    async fn scan_extents(&self) -> (usize, u64, Option<u64>, Option<u64>) {
        let mut count = 0usize;
        let mut total_size = 0u64;
        let mut oldest: Option<u64> = None;
        let mut newest: Option<u64> = None;

        let backend = Arc::clone(&self.dirs);
        let scan = self
            .dirs
            .iterate(&mut |key, bytes| {
                count += 1;
                match codec::decode(key, bytes) {
                    Ok(entry) => {
                        total_size += entry.size_estimate_bytes;
                        oldest = Some(oldest.map_or(entry.cached_at, |o| o.min(entry.cached_at)));
                        newest = Some(newest.map_or(entry.cached_at, |n| n.max(entry.cached_at)));
                    }
                    Err(_) => total_size += backend.approximate_size(key, bytes),
                }
            })
            .await;
        if let Err(err) = scan {
            warn!("stats scan failed: {}", err);
        }

        (count, total_size, oldest, newest)
    }

    // --- root snapshots --------------------------------------------------

    /// Persists the last-seen tree for `root_path`, for instant display on
    /// the next cold start.
    pub async fn save_tree_snapshot(&self, root_path: &str, root: &DirectoryNode) -> Result<()> {
        let record = TreeSnapshotRecord {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            saved_at: self.clock.now_ms(),
            root: root.clone(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| CacheError::InvalidNode(format!("unserializable snapshot: {}", e)))?;
        self.roots
            .put(root_path, bytes)
            .await
            .map_err(CacheError::StorageUnavailable)
    }

    /// Restores the last-seen tree for `root_path`, if one survives.
    pub async fn load_tree_snapshot(&self, root_path: &str) -> Option<DirectoryNode> {
        let bytes = match self.roots.get(root_path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!("snapshot read failed for '{}': {}", root_path, err);
                return None;
            }
        };
        match bincode::deserialize::<TreeSnapshotRecord>(&bytes) {
            Ok(record) if record.schema_version == SNAPSHOT_SCHEMA_VERSION => Some(record.root),
            Ok(record) => {
                warn!(
                    "discarding snapshot for '{}' with schema {}",
                    root_path, record.schema_version
                );
                None
            }
            Err(err) => {
                warn!("discarding unreadable snapshot for '{}': {}", root_path, err);
                None
            }
        }
    }

    // --- internals -------------------------------------------------------

    fn check_path(&self, path: &str, node: &DirectoryNode) -> Result<()> {
        if node.path != path {
            return Err(CacheError::InvalidNode(format!(
                "node path '{}' committed under key '{}'",
                node.path, path
            )));
        }
        Ok(())
    }

    /// Encodes `node` with timestamps derived from an existing entry:
    /// `accessed_at` never regresses and the insertion sequence survives
    /// overwrites.
    fn stage_entry(
        &self,
        node: &DirectoryNode,
        existing: Option<&CachedDirectoryEntry>,
        cached_at: u64,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<codec::EncodedEntry> {
        let accessed_at = existing
            .map(|e| e.accessed_at.max(cached_at))
            .unwrap_or(cached_at);
        let seq = existing
            .map(|e| e.seq)
            .unwrap_or_else(|| self.seq.fetch_add(1, Ordering::Relaxed));
        codec::encode(node, cached_at, accessed_at, seq, mtime)
    }

    async fn commit_entry(&self, path: &str, entry: CachedDirectoryEntry, created: bool) {
        if self.caching_enabled {
            let mut hot = self.hot.lock().unwrap_or_else(|e| e.into_inner());
            hot.put(path.to_string(), entry);
        }
        if created {
            self.adjust_count(1).await;
        }
        self.events.emit(CacheEvent::Write {
            path: path.to_string(),
        });
    }

    /// Reads an entry without touching stats or access time. Corrupted
    /// records are repaired (deleted) and read as absent.
    pub(crate) async fn peek_entry(&self, path: &str) -> Option<CachedDirectoryEntry> {
        {
            let hot = self.hot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = hot.peek(path) {
                return Some(entry.clone());
            }
        }
        match self.dirs.get(path).await {
            Ok(Some(bytes)) => match codec::decode(path, &bytes) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    error!("repairing corrupted cache entry '{}': {}", path, err);
                    self.repair_entry(path).await;
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("cache read failed for '{}': {}", path, err);
                None
            }
        }
    }

    async fn commit_access(
        &self,
        path: &str,
        mut entry: CachedDirectoryEntry,
        started: Instant,
    ) -> CachedDirectoryEntry {
        let now = self.clock.now_ms();
        entry.accessed_at = entry.accessed_at.max(now);

        match codec::encode(
            &entry.node,
            entry.cached_at,
            entry.accessed_at,
            entry.seq,
            entry.mtime,
        ) {
            Ok(encoded) => {
                if let Err(err) = self.write_guarded(path, encoded.bytes).await {
                    warn!("access-time write-back failed for '{}': {}", path, err);
                }
                if self.caching_enabled {
                    let mut hot = self.hot.lock().unwrap_or_else(|e| e.into_inner());
                    hot.put(path.to_string(), encoded.entry.clone());
                }
                self.record_hit(path, started);
                encoded.entry
            }
            Err(err) => {
                // decoded entries always re-encode; keep the read usable
                warn!("access-time re-encode failed for '{}': {}", path, err);
                self.record_hit(path, started);
                entry
            }
        }
    }

    fn record_hit(&self, path: &str, started: Instant) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.hits += 1;
            stats.load_samples += 1;
            stats.load_time_total_ms += started.elapsed().as_millis() as u64;
        }
        self.events.emit(CacheEvent::Hit {
            path: path.to_string(),
        });
    }

    fn record_miss(&self, path: &str) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.misses += 1;
        }
        self.events.emit(CacheEvent::Miss {
            path: path.to_string(),
        });
    }

    pub(crate) async fn repair_entry(&self, path: &str) {
        if let Err(err) = self.dirs.delete(path).await {
            warn!("repair delete failed for '{}': {}", path, err);
        }
        self.hot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(path);
        self.adjust_count(-1).await;
        self.events.emit(CacheEvent::Repaired {
            path: path.to_string(),
        });
    }

    pub(crate) async fn remove_entry(&self, path: &str) -> bool {
        let existed = matches!(self.dirs.get(path).await, Ok(Some(_)));
        self.acquire_write(path).await;
        let result = self.dirs.delete(path).await;
        self.release_write(path);
        if let Err(err) = result {
            warn!("cache delete failed for '{}': {}", path, err);
        }
        self.hot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(path);
        if existed {
            self.adjust_count(-1).await;
        }
        existed
    }

    pub(crate) async fn dirs_keys(&self) -> std::result::Result<Vec<String>, StorageError> {
        self.dirs.keys().await
    }

    pub(crate) async fn dirs_get(
        &self,
        key: &str,
    ) -> std::result::Result<Option<Vec<u8>>, StorageError> {
        self.dirs.get(key).await
    }

    pub(crate) async fn iterate_dirs(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send),
    ) -> std::result::Result<(), StorageError> {
        self.dirs.iterate(visit).await
    }

    pub(crate) fn emit_event(&self, event: CacheEvent) {
        self.events.emit(event);
    }

    async fn total_entries(&self) -> usize {
        let mut guard = self.entry_count.lock().await;
        if let Some(count) = *guard {
            return count;
        }
        match self.dirs.keys().await {
            Ok(keys) => {
                let count = keys.len();
                *guard = Some(count);
                count
            }
            Err(err) => {
                warn!("entry count scan failed: {}", err);
                0
            }
        }
    }

    async fn adjust_count(&self, delta: isize) {
        let mut guard = self.entry_count.lock().await;
        if let Some(count) = guard.as_mut() {
            *count = count.saturating_add_signed(delta);
        }
    }

    fn truncate_entry(mut entry: CachedDirectoryEntry, max_children: usize) -> CachedDirectoryEntry {
        if entry.node.children.len() > max_children {
            entry.node.children.truncate(max_children);
            entry.node.is_loaded = false;
        }
        entry
    }

    /// Serializes writes per path. The guard set, not the lock, marks an
    /// in-flight writer; it stays set across the backend write so eviction
    /// can observe it.
    async fn write_guarded(&self, path: &str, bytes: Vec<u8>) -> std::result::Result<(), StorageError> {
        self.acquire_write(path).await;
        let result = self.dirs.put(path, bytes).await;
        self.release_write(path);
        result
    }

    async fn acquire_write(&self, path: &str) {
        loop {
            {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !in_flight.contains(path) {
                    in_flight.insert(path.to_string());
                    return;
                }
            }
            let notified = self.write_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !in_flight.contains(path) {
                    in_flight.insert(path.to_string());
                    return;
                }
            }
            notified.await;
        }
    }

    fn release_write(&self, path: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(path);
        drop(in_flight);
        self.write_released.notify_waiters();
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
