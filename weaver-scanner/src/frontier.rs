use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use weaver_core::FrontierEntry;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<FrontierEntry>,
    /// (domain, depth) pairs pushed during this run
    visited: HashSet<(String, u32)>,
    stopped: bool,
}

/// Deduplicating BFS queue shared by the crawl workers.
///
/// `pop` parks the calling task until an entry arrives or the queue is
/// stopped. Stopping is drain-then-stop: pushes are refused from then on, but
/// entries already buffered are still handed out before `pop` returns `None`.
#[derive(Debug, Default)]
pub struct FrontierQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl FrontierQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the queue is stopped or this (domain, depth) was
    /// already pushed.
    pub fn push(&self, entry: FrontierEntry) -> bool {
        {
            let mut state = self.lock();
            if state.stopped {
                return false;
            }
            if !state.visited.insert((entry.domain.clone(), entry.depth)) {
                return false;
            }
            state.items.push_back(entry);
        }

        self.available.notify_one();
        true
    }

    pub async fn pop(&self) -> Option<FrontierEntry> {
        loop {
            // Register interest before looking, so a push or stop between the
            // check and the await is not missed
            let notified = self.available.notified();
            {
                let mut state = self.lock();
                if let Some(entry) = state.items.pop_front() {
                    return Some(entry);
                }
                if state.stopped {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
        self.available.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Copy of the entries currently buffered, oldest first
    pub fn snapshot(&self) -> Vec<FrontierEntry> {
        self.lock().items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
