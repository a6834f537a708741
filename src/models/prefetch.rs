use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, warn};
use tokio::sync::{watch, Notify, Semaphore};

use super::cache::TreeCacheController;
use super::config::MAX_CONCURRENT_TASKS;
use super::events::CallbackBus;
use super::{
    CacheConfig, CacheError, DeferredDirMetadata, DirectoryNode, PrefetchStatus, PrefetchTarget,
    Result,
};
use crate::io::DirectoryLoader;
use crate::utils::segments;

/// A worker yields briefly after this many processed targets.
const BATCH_SIZE: usize = 8;
const YIELD_DELAY: Duration = Duration::from_millis(1);
const DRAIN_POLL: Duration = Duration::from_millis(10);

lazy_static! {
    /// Directories under any of these segments are deferred: their
    /// metadata is surfaced, but they never join the live tree.
    static ref DEFERRED_SEGMENTS: HashSet<&'static str> = [
        "node_modules",
        ".git",
        ".hg",
        ".svn",
        ".vite",
        "dist",
        "build",
        ".cache",
    ]
    .into_iter()
    .collect();
}

/// Scheduler lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Draining,
    PrimaryPhase,
    DeferredPhase,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    Primary,
    Deferred,
}

enum Classification {
    Primary,
    Deferred,
    Drop,
}

enum Dispatch {
    Run(PrefetchTarget, Priority),
    Flush(Vec<DirectoryNode>),
    Wait,
    Exit,
}

#[derive(Default)]
struct QueueInner {
    primary: VecDeque<PrefetchTarget>,
    primary_paths: HashSet<String>,
    deferred: VecDeque<PrefetchTarget>,
    deferred_paths: HashSet<String>,
    loaded_dirs: HashSet<String>,
    /// Primary results held back until the primary phase completes, so
    /// consumers receive one coherent batch.
    pending_results: Vec<DirectoryNode>,
    primary_flushed: bool,
    active_primary: usize,
    active_deferred: usize,
    background_tasks: usize,
    workers: usize,
    processed: u64,
    indexed_files: u64,
    total_duration_ms: u64,
    last_duration_ms: u64,
    source: Option<String>,
}

/// True iff the child-name multisets of the two listings differ.
pub fn has_data_changed(cached: &DirectoryNode, fresh: &DirectoryNode) -> bool {
    if cached.children.len() != fresh.children.len() {
        return true;
    }
    let mut cached_names: Vec<&str> = cached.children.iter().map(|c| c.name()).collect();
    let mut fresh_names: Vec<&str> = fresh.children.iter().map(|c| c.name()).collect();
    cached_names.sort_unstable();
    fresh_names.sort_unstable();
    cached_names != fresh_names
}

/// Two-phase bounded scheduler coordinating cache-first loads and
/// background revalidation.
///
/// Primary targets are processed before any deferred target; results that
/// outlive their session (a `reset_for_source` or `dispose` happened in
/// between) are dropped silently. All cache traffic goes through the
/// controller; the scheduler owns only its queues and counters.
pub struct CachedPrefetchQueue {
    cache: Arc<TreeCacheController>,
    loader: Arc<dyn DirectoryLoader>,
    bus: Arc<CallbackBus>,
    worker_count: usize,
    max_prefetch_depth: u32,
    status_sample_interval: u64,
    max_prefetched_dirs: usize,
    session: AtomicU64,
    me: Weak<CachedPrefetchQueue>,
    state_tx: watch::Sender<SchedulerState>,
    inner: Mutex<QueueInner>,
    work_notify: Notify,
    idle_notify: Notify,
    task_semaphore: Arc<Semaphore>,
}

impl CachedPrefetchQueue {
    pub fn new(
        cache: Arc<TreeCacheController>,
        loader: Arc<dyn DirectoryLoader>,
        bus: Arc<CallbackBus>,
        config: &CacheConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cache,
            loader,
            bus,
            worker_count: config.worker_count.max(1),
            max_prefetch_depth: config.max_prefetch_depth,
            status_sample_interval: config.status_sample_interval.max(1) as u64,
            max_prefetched_dirs: config.max_prefetched_dirs.max(1),
            session: AtomicU64::new(0),
            state_tx,
            inner: Mutex::new(QueueInner::default()),
            work_notify: Notify::new(),
            idle_notify: Notify::new(),
            task_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS)),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// The source label remembered from the last `reset_for_source`.
    pub fn source(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .source
            .clone()
    }

    /// Current sampled scheduler state.
    pub fn status(&self) -> PrefetchStatus {
        let state = self.state();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let running = matches!(
            state,
            SchedulerState::PrimaryPhase | SchedulerState::DeferredPhase
        ) || inner.active_primary + inner.active_deferred > 0;
        PrefetchStatus {
            running,
            pending: inner.primary.len(),
            deferred: inner.deferred.len(),
            indexed_file_count: inner.indexed_files,
            processed_count: inner.processed,
            last_duration_ms: inner.last_duration_ms,
            average_duration_ms: if inner.processed > 0 {
                inner.total_duration_ms / inner.processed
            } else {
                0
            },
            milestone: None,
        }
    }

    // --- ingestion -------------------------------------------------------

    /// Walks a seeded tree: loaded directories are cached as one batch and
    /// announced, unloaded child directories become prefetch targets.
    pub async fn seed_tree(&self, root: &DirectoryNode) {
        if self.state() == SchedulerState::Disposed {
            return;
        }
        self.ingest_tree(root).await;
    }

    /// Re-ingests a subtree, dropping any queued target for its root first.
    pub async fn enqueue_subtree(&self, node: &DirectoryNode) {
        if self.state() == SchedulerState::Disposed {
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.primary_paths.remove(&node.path) {
                inner.primary.retain(|t| t.path != node.path);
            }
            if inner.deferred_paths.remove(&node.path) {
                inner.deferred.retain(|t| t.path != node.path);
            }
        }
        self.ingest_tree(node).await;
    }

    async fn ingest_tree(&self, root: &DirectoryNode) {
        let mut seeded: Vec<(String, DirectoryNode)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                if node.is_loaded {
                    inner.loaded_dirs.insert(node.path.clone());
                    seeded.push((node.path.clone(), node.clone()));
                }
                for child in node.dir_children() {
                    if child.is_loaded || !child.children.is_empty() {
                        stack.push(child);
                    } else {
                        self.enqueue_locked(&mut inner, PrefetchTarget::from_node(child));
                    }
                }
            }
        }

        if !seeded.is_empty() {
            if let Err(err) = self.cache.batch_set_directories(&seeded).await {
                warn!("seed cache write failed: {}", err);
            }
            for (_, node) in &seeded {
                self.bus.emit_directory_loaded(node);
            }
        }
        self.kick();
    }

    /// Marks a directory as present in the live tree and drops any queued
    /// target for it.
    pub fn mark_dir_loaded(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.loaded_dirs.insert(path.to_string());
        if inner.primary_paths.remove(path) {
            inner.primary.retain(|t| t.path != path);
        }
        if inner.deferred_paths.remove(path) {
            inner.deferred.retain(|t| t.path != path);
        }
    }

    fn classify(&self, target: &PrefetchTarget, inner: &QueueInner) -> Classification {
        if target.depth > self.max_prefetch_depth {
            return Classification::Drop;
        }
        if inner.loaded_dirs.contains(&target.path) {
            return Classification::Drop;
        }
        if segments(&target.path).any(|seg| DEFERRED_SEGMENTS.contains(seg)) {
            Classification::Deferred
        } else {
            Classification::Primary
        }
    }

    fn enqueue_locked(&self, inner: &mut QueueInner, target: PrefetchTarget) -> bool {
        match self.classify(&target, inner) {
            Classification::Drop => false,
            Classification::Primary => {
                if inner.primary_paths.insert(target.path.clone()) {
                    inner.primary.push_back(target);
                    // fresh primary work reopens the primary phase
                    inner.primary_flushed = false;
                    true
                } else {
                    false
                }
            }
            Classification::Deferred => {
                if inner.deferred_paths.insert(target.path.clone()) {
                    inner.deferred.push_back(target);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn kick(&self) {
        let (has_primary, has_deferred) = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            (!inner.primary.is_empty(), !inner.deferred.is_empty())
        };
        match self.state() {
            SchedulerState::Disposed | SchedulerState::Draining => return,
            SchedulerState::Idle if has_primary => self.set_state(SchedulerState::PrimaryPhase),
            SchedulerState::Idle if has_deferred => self.set_state(SchedulerState::DeferredPhase),
            SchedulerState::DeferredPhase if has_primary => {
                self.set_state(SchedulerState::PrimaryPhase)
            }
            _ => {}
        }
        self.ensure_workers();
        self.work_notify.notify_waiters();
        self.bus.emit_status(&self.status());
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            self.bus.emit_status(&self.status());
        }
    }

    // --- worker pool -----------------------------------------------------

    fn ensure_workers(&self) {
        let handle = match self.me.upgrade() {
            Some(handle) => handle,
            None => return,
        };
        let session = self.session.load(Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.primary.is_empty() && inner.deferred.is_empty() {
            return;
        }
        while inner.workers < self.worker_count {
            inner.workers += 1;
            let this = Arc::clone(&handle);
            tokio::spawn(async move {
                this.worker_loop(session).await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>, session: u64) {
        let mut since_yield = 0usize;
        loop {
            if self.session.load(Ordering::SeqCst) != session
                || self.state() == SchedulerState::Disposed
            {
                break;
            }
            if !self.has_prefetch_budget() {
                debug!("prefetch budget exhausted; clearing queues");
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.primary.clear();
                inner.primary_paths.clear();
                inner.deferred.clear();
                inner.deferred_paths.clear();
                break;
            }

            match self.next_dispatch() {
                Dispatch::Run(target, priority) => {
                    self.process_target(&target, priority, session).await;
                    since_yield += 1;
                    if since_yield % BATCH_SIZE == 0 {
                        tokio::time::sleep(YIELD_DELAY).await;
                    }
                }
                Dispatch::Flush(batch) => {
                    for node in &batch {
                        self.bus.emit_directory_loaded(node);
                    }
                    if self.state() == SchedulerState::PrimaryPhase {
                        self.set_state(SchedulerState::DeferredPhase);
                    }
                }
                Dispatch::Wait => {
                    let notified = self.work_notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(DRAIN_POLL) => {}
                    }
                }
                Dispatch::Exit => break,
            }
        }
        self.retire_worker(session);
    }

    /// Queue discipline: drain the primary queue, then flush the buffered
    /// primary results exactly once, then serve the deferred queue.
    fn next_dispatch(&self) -> Dispatch {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(target) = inner.primary.pop_front() {
            inner.primary_paths.remove(&target.path);
            inner.active_primary += 1;
            return Dispatch::Run(target, Priority::Primary);
        }
        if inner.active_primary > 0 {
            // a running primary job may still ingest more primary targets
            return Dispatch::Wait;
        }
        if !inner.primary_flushed {
            inner.primary_flushed = true;
            return Dispatch::Flush(std::mem::take(&mut inner.pending_results));
        }
        if let Some(target) = inner.deferred.pop_front() {
            inner.deferred_paths.remove(&target.path);
            inner.active_deferred += 1;
            return Dispatch::Run(target, Priority::Deferred);
        }
        if inner.active_deferred > 0 {
            return Dispatch::Wait;
        }
        Dispatch::Exit
    }

    async fn process_target(&self, target: &PrefetchTarget, priority: Priority, session: u64) {
        let permit = self.task_semaphore.acquire().await.ok();
        let started = Instant::now();
        let result = self.loader.load_directory(target).await;
        drop(permit);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if self.session.load(Ordering::SeqCst) != session {
            // session rolled between enqueue and completion; drop silently
            self.finish_job(priority, None);
            return;
        }

        match result {
            Ok(Some(node)) => {
                match priority {
                    Priority::Primary => {
                        if let Err(err) = self
                            .cache
                            .perform_incremental_update(&node.path, &node, node.mtime)
                            .await
                        {
                            warn!("cache write failed for '{}': {}", node.path, err);
                        }
                    }
                    Priority::Deferred => {
                        // surfaced as metadata only; not retained
                        self.bus
                            .emit_deferred_metadata(&DeferredDirMetadata::from_node(&node));
                    }
                }

                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.loaded_dirs.insert(node.path.clone());
                inner.indexed_files += node.file_count() as u64;
                if priority == Priority::Primary {
                    inner.pending_results.push(node.clone());
                }
                for child in node.dir_children() {
                    if !child.is_loaded {
                        self.enqueue_locked(&mut inner, PrefetchTarget::from_node(child));
                    }
                }
                drop(inner);
                self.work_notify.notify_waiters();
            }
            Ok(None) => {
                debug!("'{}' vanished before prefetch", target.path);
            }
            Err(err) => {
                warn!("prefetch failed for '{}': {}", target.path, err);
                self.bus
                    .emit_error(&format!("Failed to load '{}': {}", target.path, err));
            }
        }

        self.finish_job(priority, Some(elapsed_ms));
    }

    fn finish_job(&self, priority: Priority, elapsed_ms: Option<u64>) {
        let milestone = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match priority {
                Priority::Primary => inner.active_primary = inner.active_primary.saturating_sub(1),
                Priority::Deferred => {
                    inner.active_deferred = inner.active_deferred.saturating_sub(1)
                }
            }
            match elapsed_ms {
                Some(ms) => {
                    inner.processed += 1;
                    inner.total_duration_ms += ms;
                    inner.last_duration_ms = ms;
                    if inner.processed % self.status_sample_interval == 0 {
                        Some(inner.processed)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(processed) = milestone {
            let mut status = self.status();
            status.milestone = Some(format!("Processed {} directories", processed));
            self.bus.emit_status(&status);
        }
        self.work_notify.notify_waiters();
    }

    fn retire_worker(&self, session: u64) {
        let last_worker = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.workers = inner.workers.saturating_sub(1);
            inner.workers == 0
        };

        if last_worker && self.session.load(Ordering::SeqCst) == session {
            let has_work = {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                !inner.primary.is_empty() || !inner.deferred.is_empty()
            };
            let state = self.state();
            if has_work
                && state != SchedulerState::Disposed
                && state != SchedulerState::Draining
            {
                // work arrived while the pool was winding down
                self.ensure_workers();
            } else {
                self.finish_run();
            }
        }
        self.idle_notify.notify_waiters();
    }

    fn finish_run(&self) {
        // flush results stranded by a budget-exhausted run, then reset the
        // phase latch for the next run
        let leftovers = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.primary_flushed = false;
            std::mem::take(&mut inner.pending_results)
        };
        for node in &leftovers {
            self.bus.emit_directory_loaded(node);
        }

        match self.state() {
            SchedulerState::PrimaryPhase | SchedulerState::DeferredPhase => {
                // the final status (running=false) follows the last
                // directory event of the run
                self.set_state(SchedulerState::Idle);
            }
            _ => {}
        }
        self.idle_notify.notify_waiters();
    }

    fn has_prefetch_budget(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.processed as usize) < self.max_prefetched_dirs
            && inner.loaded_dirs.len() < self.max_prefetched_dirs
    }

    // --- foreground API --------------------------------------------------

    /// Cache-first read: a hit returns immediately and schedules one
    /// background validation; a miss falls through to the filesystem
    /// adapter (retried once on failure, without caching).
    pub async fn load_directory_with_cache(
        &self,
        target: &PrefetchTarget,
    ) -> Result<Option<DirectoryNode>> {
        if self.state() == SchedulerState::Disposed {
            return Err(CacheError::DeferredSession);
        }

        if let Some(entry) = self.cache.get_cached_directory(&target.path).await {
            self.mark_dir_loaded(&target.path);
            self.schedule_validation(target.clone(), entry.node.clone());
            return Ok(Some(entry.node));
        }

        match self.loader.load_directory(target).await {
            Ok(Some(node)) => {
                if let Err(err) = self
                    .cache
                    .perform_incremental_update(&node.path, &node, node.mtime)
                    .await
                {
                    warn!("cache fill failed for '{}': {}", node.path, err);
                }
                self.mark_dir_loaded(&target.path);
                Ok(Some(node))
            }
            Ok(None) => Ok(None),
            Err(original) => match self.loader.load_directory(target).await {
                Ok(retried) => Ok(retried),
                Err(_) => {
                    let message = original.to_string();
                    self.bus
                        .emit_error(&format!("Failed to load '{}': {}", target.path, message));
                    Err(CacheError::AdapterFailure {
                        path: target.path.clone(),
                        message,
                    })
                }
            },
        }
    }

    fn schedule_validation(&self, target: PrefetchTarget, cached: DirectoryNode) {
        let session = self.session.load(Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.background_tasks += 1;
        }
        let this = match self.me.upgrade() {
            Some(handle) => handle,
            None => {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.background_tasks = inner.background_tasks.saturating_sub(1);
                return;
            }
        };
        tokio::spawn(async move {
            this.validate_in_background(&target, &cached, session).await;
            {
                let mut inner = this.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.background_tasks = inner.background_tasks.saturating_sub(1);
            }
            this.idle_notify.notify_waiters();
        });
    }

    /// Re-enumerates a served path and merges on drift. Cache-layer errors
    /// never reach the foreground read that scheduled this.
    async fn validate_in_background(
        &self,
        target: &PrefetchTarget,
        cached: &DirectoryNode,
        session: u64,
    ) {
        if self.session.load(Ordering::SeqCst) != session
            || self.state() == SchedulerState::Disposed
        {
            return;
        }

        match self.loader.load_directory(target).await {
            Ok(Some(fresh)) => {
                if self.session.load(Ordering::SeqCst) != session {
                    return;
                }
                if has_data_changed(cached, &fresh) {
                    match self.cache.merge_directory_update(&fresh.path, &fresh).await {
                        Ok(()) => self.bus.emit_directory_loaded(&fresh),
                        Err(err) => {
                            warn!("validation merge failed for '{}': {}", fresh.path, err)
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!("background validation failed for '{}': {}", target.path, err);
            }
        }
    }

    /// Refreshes the given paths through the adapter, commits them as one
    /// batch and announces each update.
    pub async fn perform_incremental_update(
        &self,
        changed_paths: &[String],
        mtimes: Option<&HashMap<String, DateTime<Utc>>>,
    ) -> Result<()> {
        let mut updates: Vec<(String, DirectoryNode, Option<DateTime<Utc>>)> = Vec::new();
        for path in changed_paths {
            let target = PrefetchTarget::for_path(path);
            match self.loader.load_directory(&target).await {
                Ok(Some(node)) => {
                    let mtime = mtimes.and_then(|m| m.get(path)).copied().or(node.mtime);
                    updates.push((path.clone(), node, mtime));
                }
                Ok(None) => {
                    // the directory is gone; its entry must stop serving
                    self.cache.mark_directory_stale(path).await;
                }
                Err(err) => {
                    warn!("incremental load failed for '{}': {}", path, err);
                    self.bus
                        .emit_error(&format!("Failed to refresh '{}': {}", path, err));
                }
            }
        }

        if updates.is_empty() {
            return Ok(());
        }
        let nodes: Vec<DirectoryNode> = updates.iter().map(|(_, node, _)| node.clone()).collect();
        self.cache.perform_batch_incremental_update(updates).await?;
        for node in &nodes {
            self.bus.emit_directory_loaded(node);
        }
        Ok(())
    }

    // --- lifecycle -------------------------------------------------------

    /// Bulk cancel: bumps the session, drains in-flight work, clears all
    /// queues, stats and counters, and remembers `source`.
    pub async fn reset_for_source(&self, source: &str) {
        if self.state() == SchedulerState::Disposed {
            return;
        }
        self.set_state(SchedulerState::Draining);
        self.session.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.primary.clear();
            inner.primary_paths.clear();
            inner.deferred.clear();
            inner.deferred_paths.clear();
        }
        self.work_notify.notify_waiters();
        self.await_drain().await;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            *inner = QueueInner {
                source: Some(source.to_string()),
                ..QueueInner::default()
            };
        }
        self.set_state(SchedulerState::Idle);
    }

    /// Terminal shutdown: queued targets are rejected, in-flight work is
    /// awaited and dropped.
    pub async fn dispose(&self) {
        if self.state() == SchedulerState::Disposed {
            return;
        }
        self.session.fetch_add(1, Ordering::SeqCst);
        self.set_state(SchedulerState::Disposed);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.primary.clear();
            inner.primary_paths.clear();
            inner.deferred.clear();
            inner.deferred_paths.clear();
        }
        self.work_notify.notify_waiters();
        self.await_drain().await;
        self.bus.emit_status(&self.status());
    }

    async fn await_drain(&self) {
        loop {
            let drained = {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.active_primary == 0
                    && inner.active_deferred == 0
                    && inner.background_tasks == 0
                    && inner.workers == 0
            };
            if drained {
                return;
            }
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }

    /// Blocks until the scheduler has no queued or in-flight work left.
    pub async fn wait_for_idle(&self) {
        loop {
            let idle = {
                let state = self.state();
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                matches!(state, SchedulerState::Idle | SchedulerState::Disposed)
                    && inner.active_primary == 0
                    && inner.active_deferred == 0
                    && inner.background_tasks == 0
                    && inner.workers == 0
                    && inner.primary.is_empty()
                    && inner.deferred.is_empty()
            };
            if idle {
                return;
            }
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "prefetch_tests.rs"]
mod tests;
