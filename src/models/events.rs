use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use flume::{Receiver, Sender};

use super::{DeferredDirMetadata, DirectoryNode, PrefetchStatus};
use crate::utils::LogicalClock;

/// Retained history depth of an event channel.
pub const EVENT_HISTORY_CAP: usize = 512;

type DirectoryLoadedFn = dyn Fn(&DirectoryNode) + Send + Sync;
type DeferredMetadataFn = dyn Fn(&DeferredDirMetadata) + Send + Sync;
type StatusFn = dyn Fn(&PrefetchStatus) + Send + Sync;
type ErrorFn = dyn Fn(&str) + Send + Sync;

/// The four named callbacks a consumer may register.
#[derive(Default)]
pub struct ObserverCallbacks {
    pub on_directory_loaded: Option<Box<DirectoryLoadedFn>>,
    pub on_deferred_metadata: Option<Box<DeferredMetadataFn>>,
    pub on_status: Option<Box<StatusFn>>,
    pub on_error: Option<Box<ErrorFn>>,
}

impl ObserverCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directory_loaded(
        mut self,
        f: impl Fn(&DirectoryNode) + Send + Sync + 'static,
    ) -> Self {
        self.on_directory_loaded = Some(Box::new(f));
        self
    }

    pub fn with_deferred_metadata(
        mut self,
        f: impl Fn(&DeferredDirMetadata) + Send + Sync + 'static,
    ) -> Self {
        self.on_deferred_metadata = Some(Box::new(f));
        self
    }

    pub fn with_status(mut self, f: impl Fn(&PrefetchStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fire-and-forget fan-out of scheduler events to registered observers.
///
/// An observer that panics is caught and ignored; a misbehaving consumer
/// can never halt the scheduler.
#[derive(Default)]
pub struct CallbackBus {
    next_id: AtomicU64,
    observers: RwLock<Vec<(u64, Arc<ObserverCallbacks>)>>,
}

impl CallbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callbacks: ObserverCallbacks) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.push((id, Arc::new(callbacks)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.retain(|(observer_id, _)| *observer_id != id.0);
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn snapshot(&self) -> Vec<Arc<ObserverCallbacks>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, callbacks)| Arc::clone(callbacks))
            .collect()
    }

    pub fn emit_directory_loaded(&self, node: &DirectoryNode) {
        for observer in self.snapshot() {
            if let Some(cb) = &observer.on_directory_loaded {
                let _ = catch_unwind(AssertUnwindSafe(|| cb(node)));
            }
        }
    }

    pub fn emit_deferred_metadata(&self, metadata: &DeferredDirMetadata) {
        for observer in self.snapshot() {
            if let Some(cb) = &observer.on_deferred_metadata {
                let _ = catch_unwind(AssertUnwindSafe(|| cb(metadata)));
            }
        }
    }

    pub fn emit_status(&self, status: &PrefetchStatus) {
        for observer in self.snapshot() {
            if let Some(cb) = &observer.on_status {
                let _ = catch_unwind(AssertUnwindSafe(|| cb(status)));
            }
        }
    }

    pub fn emit_error(&self, message: &str) {
        for observer in self.snapshot() {
            if let Some(cb) = &observer.on_error {
                let _ = catch_unwind(AssertUnwindSafe(|| cb(message)));
            }
        }
    }
}

/// Observable cache traffic, recorded into the controller's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit { path: String },
    Miss { path: String },
    Write { path: String },
    BatchWrite { count: usize },
    Invalidated { path: String },
    Evicted { path: String },
    Repaired { path: String },
    Cleared,
}

/// An event stamped with the logical clock at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent<T> {
    pub at_ms: u64,
    pub event: T,
}

struct ChannelInner<T> {
    history: VecDeque<RecordedEvent<T>>,
    senders: Vec<Sender<RecordedEvent<T>>>,
}

/// A bounded history of timestamped events with replaying subscriptions.
///
/// Subscribing with replay delivers the retained snapshot in insertion
/// order before any live event. A receiver that disappears mid-replay is
/// skipped without aborting the loop, and disconnected subscribers are
/// pruned on the next emission.
pub struct EventChannel<T: Clone + Send + 'static> {
    inner: Mutex<ChannelInner<T>>,
    clock: Arc<LogicalClock>,
    cap: usize,
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    pub fn new(clock: Arc<LogicalClock>) -> Self {
        Self::with_capacity(clock, EVENT_HISTORY_CAP)
    }

    pub fn with_capacity(clock: Arc<LogicalClock>, cap: usize) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                history: VecDeque::with_capacity(cap.min(EVENT_HISTORY_CAP)),
                senders: Vec::new(),
            }),
            clock,
            cap: cap.max(1),
        }
    }

    /// Records an event and fans it out to live subscribers.
    pub fn emit(&self, event: T) {
        let recorded = RecordedEvent {
            at_ms: self.clock.now_ms(),
            event,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while inner.history.len() >= self.cap {
            inner.history.pop_front();
        }
        inner.history.push_back(recorded.clone());
        inner
            .senders
            .retain(|sender| sender.send(recorded.clone()).is_ok());
    }

    /// Registers a subscriber; with `replay`, the retained history is
    /// delivered first, in insertion order.
    pub fn subscribe(&self, replay: bool) -> Receiver<RecordedEvent<T>> {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if replay {
            for recorded in inner.history.iter() {
                // a receiver dropped mid-replay must not abort the loop
                if tx.send(recorded.clone()).is_err() {
                    continue;
                }
            }
        }
        inner.senders.push(tx);
        rx
    }

    pub fn history_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .len()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
