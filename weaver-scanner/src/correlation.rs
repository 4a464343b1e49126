use crate::filter::extract_root_domain;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use weaver_core::FrontierEntry;

/// A fetch that has been dispatched and has not reached its terminal event
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub entry: FrontierEntry,
    started: Instant,
    /// Link targets already taken from this page
    targets: HashSet<String>,
}

impl Dispatch {
    fn new(entry: FrontierEntry) -> Self {
        Self {
            entry,
            started: Instant::now(),
            targets: HashSet::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Maps the domain a worker dispatched to the frontier entry it came from, so
/// URL-keyed fetch events can be traced back to their work item.
///
/// Entries are removed on the dispatch's terminal event.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: RwLock<HashMap<String, Dispatch>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Dispatch>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Dispatch>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, entry: FrontierEntry) {
        self.write().insert(entry.domain.clone(), Dispatch::new(entry));
    }

    /// Finds the dispatch an event for `domain` belongs to.
    ///
    /// Redirects can change the host (`example.com` to `www.example.com`), so
    /// a miss on the exact domain falls back to the first live entry sharing
    /// its root domain. Returns the table key together with the entry.
    pub fn resolve(&self, domain: &str) -> Option<(String, FrontierEntry)> {
        let entries = self.read();
        if let Some(dispatch) = entries.get(domain) {
            return Some((domain.to_string(), dispatch.entry.clone()));
        }

        let root = extract_root_domain(domain);
        entries
            .iter()
            .find(|(key, _)| extract_root_domain(key) == root)
            .map(|(key, dispatch)| (key.clone(), dispatch.entry.clone()))
    }

    /// Claims `target` as one of the outbound links of the dispatch under
    /// `key`. Fails for repeats and once `max_links` targets were claimed.
    pub fn admit_link(&self, key: &str, target: &str, max_links: usize) -> bool {
        let mut entries = self.write();
        let Some(dispatch) = entries.get_mut(key) else {
            return false;
        };
        if dispatch.targets.contains(target) || dispatch.targets.len() >= max_links {
            return false;
        }
        dispatch.targets.insert(target.to_string());
        true
    }

    pub fn remove(&self, key: &str) -> Option<Dispatch> {
        self.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
