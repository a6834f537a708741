mod cache;
mod codec;
mod config;
mod events;
mod maintenance;
mod prefetch;
mod types;

pub use cache::{CacheInfo, CacheSize, CacheStats, ChildPage, TreeCacheController};
pub use codec::SCHEMA_VERSION;
pub use config::{
    default_worker_count, CacheConfig, ConfigError, DEFAULT_FRESH_TTL_MS, DEFAULT_MAX_AGE_MS,
    DEFAULT_MAX_ENTRIES, DEFAULT_MAX_PREFETCHED_DIRS, DEFAULT_MAX_PREFETCH_DEPTH,
    DEFAULT_STATUS_SAMPLE_INTERVAL, MAX_CONCURRENT_TASKS,
};
pub use events::{
    CacheEvent, CallbackBus, EventChannel, ObserverCallbacks, RecordedEvent, SubscriptionId,
    EVENT_HISTORY_CAP,
};
pub use maintenance::{
    CompactionReport, IntegrityReport, MaintenanceOp, MaintenanceProgress, MaintenanceReport,
    ProgressSink,
};
pub use prefetch::{has_data_changed, CachedPrefetchQueue, SchedulerState};
pub use types::{
    CacheError, CachedDirectoryEntry, ChildNode, DeferredDirMetadata, DirectoryNode, FileSummary,
    NodeKind, PrefetchStatus, PrefetchTarget, Result,
};
