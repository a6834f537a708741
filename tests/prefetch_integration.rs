use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use tree_cache::io::{DirectoryLoader, FsDirectoryLoader};
use tree_cache::models::{
    CacheConfig, CachedPrefetchQueue, CallbackBus, ObserverCallbacks, PrefetchTarget,
    TreeCacheController,
};

fn build_workspace(root: &Path) {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::create_dir_all(root.join("node_modules/pkg")).unwrap();

    File::create(root.join("README.md"))
        .unwrap()
        .write_all(b"# workspace")
        .unwrap();
    File::create(root.join("src/main.rs"))
        .unwrap()
        .write_all(b"fn main() {}")
        .unwrap();
    File::create(root.join("src/lib.rs")).unwrap();
    File::create(root.join("docs/guide.md")).unwrap();
    File::create(root.join("node_modules/pkg/index.js")).unwrap();
}

fn test_config() -> CacheConfig {
    CacheConfig {
        worker_count: 2,
        max_entries: 1_000,
        ..CacheConfig::default()
    }
}

struct Observed {
    loaded: Arc<Mutex<Vec<String>>>,
    deferred: Arc<Mutex<Vec<String>>>,
    bus: Arc<CallbackBus>,
}

fn observed_bus() -> Observed {
    let loaded: Arc<Mutex<Vec<String>>> = Default::default();
    let deferred: Arc<Mutex<Vec<String>>> = Default::default();
    let bus = Arc::new(CallbackBus::new());

    let loaded_sink = Arc::clone(&loaded);
    let deferred_sink = Arc::clone(&deferred);
    bus.subscribe(
        ObserverCallbacks::new()
            .with_directory_loaded(move |node| loaded_sink.lock().unwrap().push(node.path.clone()))
            .with_deferred_metadata(move |meta| {
                deferred_sink.lock().unwrap().push(meta.path.clone())
            }),
    );

    Observed {
        loaded,
        deferred,
        bus,
    }
}

#[tokio::test]
async fn test_cold_scan_then_warm_restart_then_drift() {
    let workspace = TempDir::new().unwrap();
    build_workspace(workspace.path());
    let db_dir = TempDir::new().unwrap();
    let db_path = db_dir.path().join("cache-db");
    let config = test_config();

    // --- cold start: everything comes from the filesystem ---------------
    {
        let cache = Arc::new(TreeCacheController::open_at(&db_path, &config));
        let loader = Arc::new(FsDirectoryLoader::new(workspace.path()));
        let observed = observed_bus();
        let queue = CachedPrefetchQueue::new(
            Arc::clone(&cache),
            Arc::clone(&loader) as Arc<dyn DirectoryLoader>,
            Arc::clone(&observed.bus),
            &config,
        );

        let root = queue
            .load_directory_with_cache(&PrefetchTarget::for_path(""))
            .await
            .unwrap()
            .expect("workspace root");

        let names: Vec<&str> = root.children.iter().map(|c| c.name()).collect();
        assert!(names.contains(&"README.md"));
        assert!(names.contains(&"src"));
        assert!(names.contains(&"docs"));
        assert!(names.contains(&"node_modules"));

        queue.seed_tree(&root).await;
        queue.wait_for_idle().await;

        // primary subdirectories were scanned and cached
        let src = cache.get_cached_directory("/src").await.expect("src entry");
        assert!(src.is_loaded());
        let src_names: Vec<&str> = src.node.children.iter().map(|c| c.name()).collect();
        assert!(src_names.contains(&"main.rs"));
        assert!(src_names.contains(&"lib.rs"));
        assert!(cache.get_cached_directory("/docs").await.is_some());

        // node_modules was surfaced as deferred metadata only
        let deferred = observed.deferred.lock().unwrap().clone();
        assert!(deferred.contains(&"/node_modules".to_string()));
        assert!(cache.get_cached_directory("/node_modules").await.is_none());
        let loaded = observed.loaded.lock().unwrap().clone();
        assert!(!loaded.iter().any(|p| p.contains("node_modules")));

        cache.save_tree_snapshot("", &root).await.unwrap();
        queue.dispose().await;
        cache.flush().await.unwrap();
    }

    // --- warm restart: the tree is served without touching the disk -----
    {
        let cache = Arc::new(TreeCacheController::open_at(&db_path, &config));

        let snapshot = cache.load_tree_snapshot("").await.expect("root snapshot");
        assert_eq!(snapshot.path, "");
        assert!(snapshot.children.iter().any(|c| c.name() == "src"));

        let root_entry = cache.get_cached_directory("").await.expect("root entry");
        assert_eq!(root_entry.node.children.len(), snapshot.children.len());

        let src = cache.get_cached_directory("/src").await.expect("src entry");
        assert_eq!(src.node.children.len(), 2);

        let stats = cache.get_cache_stats().await;
        assert!(stats.total_entries >= 3);
    }

    // --- drift: a new file appears on disk ------------------------------
    File::create(workspace.path().join("src/new_module.rs")).unwrap();

    {
        let cache = Arc::new(TreeCacheController::open_at(&db_path, &config));
        let loader = Arc::new(FsDirectoryLoader::new(workspace.path()));
        let observed = observed_bus();
        let queue = CachedPrefetchQueue::new(
            Arc::clone(&cache),
            Arc::clone(&loader) as Arc<dyn DirectoryLoader>,
            Arc::clone(&observed.bus),
            &config,
        );

        // the cached (stale) listing is served instantly
        let served = queue
            .load_directory_with_cache(&PrefetchTarget::for_path("/src"))
            .await
            .unwrap()
            .expect("cached src");
        assert_eq!(served.children.len(), 2);

        // background validation detects the drift and merges it
        queue.wait_for_idle().await;
        let refreshed = cache.get_cached_directory("/src").await.unwrap();
        assert_eq!(refreshed.node.children.len(), 3);
        assert!(refreshed
            .node
            .children
            .iter()
            .any(|c| c.name() == "new_module.rs"));

        let loaded = observed.loaded.lock().unwrap().clone();
        assert_eq!(loaded, vec!["/src".to_string()]);

        queue.dispose().await;
    }
}

#[tokio::test]
async fn test_subtree_invalidation_forces_rescan() {
    let workspace = TempDir::new().unwrap();
    build_workspace(workspace.path());
    let db_dir = TempDir::new().unwrap();
    let config = test_config();

    let cache = Arc::new(TreeCacheController::open_at(
        &db_dir.path().join("cache-db"),
        &config,
    ));
    let loader = Arc::new(FsDirectoryLoader::new(workspace.path()));
    let observed = observed_bus();
    let queue = CachedPrefetchQueue::new(
        Arc::clone(&cache),
        Arc::clone(&loader) as Arc<dyn DirectoryLoader>,
        Arc::clone(&observed.bus),
        &config,
    );

    let root = queue
        .load_directory_with_cache(&PrefetchTarget::for_path(""))
        .await
        .unwrap()
        .unwrap();
    queue.seed_tree(&root).await;
    queue.wait_for_idle().await;
    assert!(cache.get_cached_directory("/src").await.is_some());

    cache.invalidate_subtree("").await;
    assert!(cache.get_cached_directory("").await.is_none());
    assert!(cache.get_cached_directory("/src").await.is_none());

    // the fall-back path repopulates from the filesystem
    let reloaded = queue
        .load_directory_with_cache(&PrefetchTarget::for_path("/src"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.children.len(), 2);
    assert!(cache.get_cached_directory("/src").await.is_some());

    queue.dispose().await;
}
