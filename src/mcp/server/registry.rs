//! Resource and tool registries.
//!
//! Each registry is a map behind its own short-held lock. Lookups clone the
//! `Arc` out of the map so providers and handlers always run with the lock
//! released; registering a tool never waits on a slow call of another.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::mcp::server::providers::{ResourceProvider, ToolHandler};

/// Keyed collection of shared handlers, ordered by key.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: Mutex<BTreeMap<String, Arc<T>>>,
}

/// Resource providers keyed by URI.
pub type ResourceRegistry = Registry<dyn ResourceProvider>;

/// Tool handlers keyed by name.
pub type ToolRegistry = Registry<dyn ToolHandler>;

/// One page of registry entries.
pub struct Page<T: ?Sized> {
    /// Entries on this page, in key order.
    pub entries: Vec<(String, Arc<T>)>,
    /// Key of the last entry when more entries follow.
    pub next_cursor: Option<String>,
}

impl<T: ?Sized> Registry<T> {
    pub(super) fn named(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an entry, replacing and returning any previous one under `key`.
    pub fn register(&self, key: impl Into<String>, entry: Arc<T>) -> Option<Arc<T>> {
        let key = key.into();
        let previous = self.lock().insert(key.clone(), entry);
        if previous.is_some() {
            warn!(kind = self.kind, %key, "Replaced existing registration");
        } else {
            debug!(kind = self.kind, %key, "Registered");
        }
        previous
    }

    /// Removes an entry. Returns `true` if it existed.
    pub fn unregister(&self, key: &str) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            debug!(kind = self.kind, key, "Unregistered");
        }
        removed
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.lock().get(key).cloned()
    }

    /// Whether `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Registered keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies out every entry in key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Arc<T>)> {
        self.lock()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Copies out the entries strictly after `cursor`, at most `limit` of them.
    ///
    /// A limit of zero is treated as one so every page makes progress.
    ///
    /// The cursor is the last key of the previous page, so a page boundary
    /// stays valid even if that key has since been unregistered.
    #[must_use]
    pub fn page(&self, cursor: Option<&str>, limit: Option<usize>) -> Page<T> {
        let map = self.lock();
        let lower = cursor.map_or(Bound::Unbounded, Bound::Excluded);
        let mut range = map.range::<str, _>((lower, Bound::Unbounded));
        let take = limit.unwrap_or(usize::MAX).max(1);

        let entries: Vec<(String, Arc<T>)> = range
            .by_ref()
            .take(take)
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();
        let next_cursor = if range.next().is_some() {
            entries.last().map(|(key, _)| key.clone())
        } else {
            None
        };
        Page {
            entries,
            next_cursor,
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl ResourceRegistry {
    /// Creates an empty resource registry.
    #[must_use]
    pub fn new() -> Self {
        Self::named("resource")
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Creates an empty tool registry.
    #[must_use]
    pub fn new() -> Self {
        Self::named("tool")
    }

    /// Registers a handler under its own name.
    pub fn add(&self, handler: Arc<dyn ToolHandler>) -> Option<Arc<dyn ToolHandler>> {
        let name = handler.name().to_string();
        self.register(name, handler)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("keys", &self.keys())
            .finish()
    }
}
