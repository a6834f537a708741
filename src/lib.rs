//! Persistent directory-tree cache with background-validated prefetch.
//!
//! Previously observed tree structure is served instantly from durable
//! storage while a bounded worker pool re-scans the same directories in the
//! background, merges drift into the cache and streams incremental updates
//! to subscribers.

pub mod io;
pub mod models;
pub mod utils;
