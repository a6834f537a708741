use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jwalk::WalkDir;
use log::warn;
use thiserror::Error;

use crate::models::{ChildNode, DirectoryNode, PrefetchTarget};

/// Filesystem adapter errors
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loader task failed: {0}")]
    Task(String),

    #[error("adapter failure: {0}")]
    Adapter(String),
}

/// Enumerates one directory for the scheduler.
///
/// `Ok(None)` means the directory is gone or unreadable as a whole; an
/// `Err` is an adapter failure the scheduler may retry once.
#[async_trait]
pub trait DirectoryLoader: Send + Sync {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> Result<Option<DirectoryNode>, LoaderError>;
}

/// Adapter over a real filesystem subtree.
///
/// Cache paths are resolved relative to `root` (the empty cache path is the
/// root itself). Enumeration is single-level and runs on a blocking task.
pub struct FsDirectoryLoader {
    root: PathBuf,
    include_hidden: bool,
}

impl FsDirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            include_hidden: false,
        }
    }

    pub fn with_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }

    fn resolve(&self, cache_path: &str) -> PathBuf {
        let relative = cache_path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

#[async_trait]
impl DirectoryLoader for FsDirectoryLoader {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> Result<Option<DirectoryNode>, LoaderError> {
        let fs_path = self.resolve(&target.path);
        let cache_path = target.path.clone();
        let include_hidden = self.include_hidden;

        tokio::task::spawn_blocking(move || {
            enumerate_directory(&fs_path, &cache_path, include_hidden)
        })
        .await
        .map_err(|e| LoaderError::Task(e.to_string()))
    }
}

fn enumerate_directory(
    fs_path: &Path,
    cache_path: &str,
    include_hidden: bool,
) -> Option<DirectoryNode> {
    let metadata = std::fs::metadata(fs_path).ok()?;
    if !metadata.is_dir() {
        return None;
    }

    let mut node = DirectoryNode::new_loaded(cache_path);
    node.mtime = metadata.modified().ok().map(DateTime::<Utc>::from);

    let walk = WalkDir::new(fs_path)
        .parallelism(jwalk::Parallelism::Serial)
        .skip_hidden(!include_hidden)
        .max_depth(1)
        .sort(true);

    for entry_result in walk {
        match entry_result {
            Ok(entry) => {
                if entry.depth() == 0 {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!("skipping unreadable entry under '{}': {}", cache_path, err);
                        continue;
                    }
                };
                if meta.is_dir() {
                    node.push_dir_stub(&name, false);
                } else {
                    node.push_file(
                        &name,
                        Some(meta.len()),
                        meta.modified().ok().map(DateTime::<Utc>::from),
                    );
                }
            }
            Err(err) => {
                warn!("enumeration error under '{}': {}", cache_path, err);
            }
        }
    }

    Some(node)
}

/// Adapter over an in-process virtual tree.
///
/// Serves enumerations from nodes registered with `insert_tree`, recording
/// every invocation. Latency and per-path failures can be injected, which
/// makes this the adapter of choice for benchmarks and scheduler tests.
#[derive(Default)]
pub struct StaticTreeLoader {
    nodes: Mutex<HashMap<String, DirectoryNode>>,
    invocations: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, usize>>,
    latency: Mutex<Option<Duration>>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl StaticTreeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node` and, recursively, every directory child that
    /// carries its own listing. Directory children inside each stored node
    /// are flattened to unloaded stubs.
    pub fn insert_tree(&self, node: &DirectoryNode) {
        self.insert_node(node);
        for child in node.dir_children() {
            if child.is_loaded || !child.children.is_empty() {
                self.insert_tree(child);
            }
        }
    }

    /// Registers exactly one directory listing.
    pub fn insert_node(&self, node: &DirectoryNode) {
        let mut flattened = node.clone();
        flattened.children = node
            .children
            .iter()
            .map(|child| match child {
                ChildNode::Dir(dir) => {
                    let mut stub = DirectoryNode::new(&dir.path);
                    stub.is_loaded = false;
                    ChildNode::Dir(Box::new(stub))
                }
                file @ ChildNode::File(_) => file.clone(),
            })
            .collect();

        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.insert(flattened.path.clone(), flattened);
    }

    pub fn remove(&self, path: &str) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.remove(path);
    }

    /// Makes the next `times` loads of `path` fail with an adapter error.
    pub fn fail_times(&self, path: &str, times: usize) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.insert(path.to_string(), times);
    }

    /// Adds an artificial delay to every load.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    /// Every path ever requested, in request order.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invocation_count_for(&self, path: &str) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    /// High-water mark of concurrent loads observed so far.
    pub fn max_observed_concurrency(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DirectoryLoader for StaticTreeLoader {
    async fn load_directory(
        &self,
        target: &PrefetchTarget,
    ) -> Result<Option<DirectoryNode>, LoaderError> {
        {
            let mut invocations = self.invocations.lock().unwrap_or_else(|e| e.into_inner());
            invocations.push(target.path.clone());
        }

        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        let should_fail = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            match failures.get_mut(&target.path) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(LoaderError::Adapter(format!(
                "injected failure for '{}'",
                target.path
            )));
        }

        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.get(&target.path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    fn target(path: &str) -> PrefetchTarget {
        PrefetchTarget::for_path(path)
    }

    #[tokio::test]
    async fn test_fs_loader_enumerates_one_level() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("a.txt"))
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub/nested.txt")).unwrap();

        let loader = FsDirectoryLoader::new(dir.path());
        let node = loader.load_directory(&target("")).await.unwrap().unwrap();

        assert!(node.is_loaded);
        assert_eq!(node.children.len(), 2);

        let file = node
            .children
            .iter()
            .find(|c| c.name() == "a.txt")
            .expect("file child");
        match file {
            ChildNode::File(f) => assert_eq!(f.size, Some(5)),
            other => panic!("expected file, got {:?}", other),
        }

        let sub = node
            .children
            .iter()
            .find(|c| c.name() == "sub")
            .expect("dir child");
        match sub {
            ChildNode::Dir(d) => {
                assert!(!d.is_loaded);
                assert!(d.children.is_empty());
                assert_eq!(d.path, "/sub");
            }
            other => panic!("expected dir, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fs_loader_skips_hidden_by_default() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join(".hidden")).unwrap();
        File::create(dir.path().join("shown.txt")).unwrap();

        let loader = FsDirectoryLoader::new(dir.path());
        let node = loader.load_directory(&target("")).await.unwrap().unwrap();
        assert_eq!(node.child_names(), vec!["shown.txt"]);

        let loader = FsDirectoryLoader::new(dir.path()).with_hidden(true);
        let node = loader.load_directory(&target("")).await.unwrap().unwrap();
        assert_eq!(node.children.len(), 2);
    }

    #[tokio::test]
    async fn test_fs_loader_absent_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let loader = FsDirectoryLoader::new(dir.path());
        let result = loader.load_directory(&target("/missing")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_fs_loader_resolves_nested_cache_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        File::create(dir.path().join("a/b/leaf.txt")).unwrap();

        let loader = FsDirectoryLoader::new(dir.path());
        let node = loader.load_directory(&target("/a/b")).await.unwrap().unwrap();
        assert_eq!(node.path, "/a/b");
        assert_eq!(node.children[0].path(), "/a/b/leaf.txt");
        assert_eq!(node.children[0].depth(), 3);
    }

    #[tokio::test]
    async fn test_static_loader_serves_registered_tree() {
        let mut root = DirectoryNode::new_loaded("");
        root.push_dir_stub("src", false);
        let mut src = DirectoryNode::new_loaded("/src");
        src.push_file("main.rs", Some(10), None);
        root.children[0] = ChildNode::Dir(Box::new(src));

        let loader = StaticTreeLoader::new();
        loader.insert_tree(&root);

        let served = loader.load_directory(&target("/src")).await.unwrap().unwrap();
        assert_eq!(served.child_names(), vec!["main.rs"]);
        assert_eq!(loader.invocations(), vec!["/src"]);
    }

    #[tokio::test]
    async fn test_static_loader_injected_failures_are_consumed() {
        let loader = StaticTreeLoader::new();
        loader.insert_node(&DirectoryNode::new_loaded("/x"));
        loader.fail_times("/x", 1);

        assert!(loader.load_directory(&target("/x")).await.is_err());
        assert!(loader.load_directory(&target("/x")).await.unwrap().is_some());
        assert_eq!(loader.invocation_count_for("/x"), 2);
    }
}
