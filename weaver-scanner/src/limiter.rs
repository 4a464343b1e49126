use crate::filter::extract_root_domain;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Caps how many distinct subdomains of one root domain get into the crawl.
///
/// `can_add` and `add` lock separately. Callers racing on the same root can
/// all pass `can_add` while only some of them win `add`, so work done between
/// the two calls (recording the node) can exceed the cap by the number of
/// concurrent callers. The registry itself never holds more than the cap.
#[derive(Debug)]
pub struct SubdomainLimiter {
    max_per_root: usize,
    subdomains: RwLock<HashMap<String, HashSet<String>>>,
}

impl SubdomainLimiter {
    pub fn new(max_per_root: usize) -> Self {
        Self {
            max_per_root,
            subdomains: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashSet<String>>> {
        self.subdomains.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashSet<String>>> {
        self.subdomains.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `domain` would be admitted. Does not register it.
    pub fn can_add(&self, domain: &str) -> bool {
        let root = extract_root_domain(domain);
        match self.read().get(&root) {
            Some(set) => set.contains(domain) || set.len() < self.max_per_root,
            None => self.max_per_root > 0,
        }
    }

    /// Registers `domain` under its root. Returns false, without registering,
    /// when the root is already full.
    pub fn add(&self, domain: &str) -> bool {
        let root = extract_root_domain(domain);
        let mut subdomains = self.write();
        let set = subdomains.entry(root).or_default();

        if set.contains(domain) {
            return true;
        }
        if set.len() >= self.max_per_root {
            return false;
        }
        set.insert(domain.to_string());
        true
    }

    /// Number of subdomains registered for `root`
    pub fn count(&self, root: &str) -> usize {
        self.read().get(root).map_or(0, |set| set.len())
    }
}
