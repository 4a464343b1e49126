//! Crawl orchestrator.
//!
//! Workers pop frontier entries and hand them to a [`Fetcher`]. The fetcher
//! reports back through [`FetchEvents`], keyed by URL; the correlation table
//! maps those URLs back to the entry that caused the fetch, so titles, links
//! and outcomes land on the right node at the right depth.

use crate::correlation::CorrelationTable;
use crate::error::{FetchError, Result, ScanError};
use crate::fetch::{FetchEvents, Fetcher};
use crate::filter::{extract_domain, is_excluded};
use crate::frontier::FrontierQueue;
use crate::limiter::SubdomainLimiter;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OnceCell, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use weaver_core::{
    CrawlConfig, CrawlMetrics, FlushStats, FrontierEntry, GraphCache, GraphStore, NodeId,
    StoreError, TerminationReason,
};

/// Crawl limits, taken from [`CrawlConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlLimits {
    pub max_depth: u32,
    pub max_crawls_per_node: u32,
    pub max_subdomains_per_root: usize,
    pub max_outbound_links: usize,
    pub workers: usize,
}

impl From<&CrawlConfig> for CrawlLimits {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_crawls_per_node: config.max_crawls_per_node,
            max_subdomains_per_root: config.max_subdomains_per_root,
            max_outbound_links: config.max_outbound_links,
            workers: config.concurrent_workers,
        }
    }
}

/// Waits used by shutdown and idle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlTimings {
    /// How long `stop` waits for workers to exit
    pub worker_timeout: Duration,
    /// How long `stop` waits for in-flight fetches after the workers
    pub in_flight_timeout: Duration,
    /// Idle watcher poll period
    pub poll_interval: Duration,
    /// Second look before the idle watcher declares the crawl done
    pub settle_delay: Duration,
}

impl Default for CrawlTimings {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(5),
            in_flight_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// How [`Crawler::bootstrap`] seeded the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Nothing to resume; the seed was enqueued at depth 0
    Fresh { seed: NodeId },
    /// Resumable nodes were loaded from storage and `queued` entries enqueued
    Resumed { nodes: usize, queued: usize },
}

/// Count of dispatched fetches that have not reached their terminal event
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Notify,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn increment(&self) {
        *self.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        *self.lock()
    }

    async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.get() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Everything workers and fetch callbacks share
struct CrawlState {
    limits: CrawlLimits,
    queue: FrontierQueue,
    limiter: SubdomainLimiter,
    graph: GraphCache,
    correlations: CorrelationTable,
    in_flight: InFlight,
    metrics: Arc<CrawlMetrics>,
}

impl CrawlState {
    fn resolve(&self, url: &str) -> Option<(String, FrontierEntry)> {
        let domain = extract_domain(url)?;
        self.correlations.resolve(&domain)
    }

    /// Runs one frontier entry: claims a crawl, records the correlation and
    /// hands the page to the fetcher.
    fn dispatch(self: &Arc<Self>, worker_id: usize, entry: FrontierEntry, fetcher: &dyn Fetcher) {
        let Some(node) = self.graph.get_node(&entry.domain) else {
            warn!("Worker {}: {} is not in the graph, skipping", worker_id, entry.domain);
            return;
        };

        match self
            .graph
            .try_increment_crawl_count(node.id, self.limits.max_crawls_per_node)
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("Worker {}: {} reached its crawl limit", worker_id, entry.domain);
                return;
            }
            Err(e) => {
                error!("Worker {}: failed to claim {}: {}", worker_id, entry.domain, e);
                return;
            }
        }

        let url = format!("https://{}", entry.domain);
        self.correlations.insert(entry.clone());
        self.metrics.node_crawled();
        self.in_flight.increment();

        let events: Arc<dyn FetchEvents> = self.clone();
        match fetcher.visit(&url, events) {
            Ok(()) => info!(
                "Worker {}: fetching {} (depth={})",
                worker_id, entry.domain, entry.depth
            ),
            Err(e) => {
                warn!("Worker {}: failed to dispatch {}: {}", worker_id, url, e);
                self.in_flight.decrement();
                self.correlations.remove(&entry.domain);
            }
        }
    }

    fn handle_link(&self, key: &str, source: &FrontierEntry, href: &str) {
        let Some(target) = extract_domain(href) else {
            return;
        };
        if target == source.domain {
            return;
        }
        if is_excluded(&target) {
            debug!("Skipping excluded domain {}", target);
            return;
        }
        if !self
            .correlations
            .admit_link(key, &target, self.limits.max_outbound_links)
        {
            return;
        }
        if !self.limiter.can_add(&target) {
            debug!("Subdomain limit reached for {}", target);
            return;
        }

        let next_depth = source.depth + 1;
        let (target_id, created) = self.graph.upsert_node_tracked(&target, "", next_depth);
        if created {
            self.metrics.node_discovered();
        }

        if let Err(e) = self.graph.upsert_edge(source.node_id, target_id) {
            warn!("Failed to record edge {} -> {}: {}", source.domain, target, e);
            return;
        }
        self.metrics.edge_recorded();
        debug!(
            "Edge: {} -> {} (depth {}->{})",
            source.domain, target, source.depth, next_depth
        );

        if next_depth > self.limits.max_depth {
            return;
        }
        if !self.limiter.add(&target) {
            debug!("Subdomain limit reached for {} while queueing", target);
            return;
        }
        if self
            .queue
            .push(FrontierEntry::new(target_id, target.clone(), next_depth))
        {
            debug!("Queued {} at depth {}", target, next_depth);
        }
    }
}

impl FetchEvents for CrawlState {
    fn on_title(&self, url: &str, text: &str) {
        let Some((_, entry)) = self.resolve(url) else {
            debug!("No dispatch found for title on {}", url);
            return;
        };
        if text.trim().is_empty() {
            return;
        }
        self.graph.upsert_node(&entry.domain, text, entry.depth);
    }

    fn on_meta_description(&self, url: &str, text: &str) {
        let Some((_, entry)) = self.resolve(url) else {
            return;
        };
        let needs_description = self
            .graph
            .get_node(&entry.domain)
            .is_some_and(|node| !node.has_description());
        if needs_description {
            self.graph.upsert_node(&entry.domain, text, entry.depth);
        }
    }

    fn on_link(&self, url: &str, href: &str) {
        let Some((key, entry)) = self.resolve(url) else {
            debug!("No dispatch found for link on {}", url);
            return;
        };
        self.handle_link(&key, &entry, href);
    }

    fn on_response(&self, url: &str, status: u16) {
        self.in_flight.decrement();
        self.metrics.page_fetched();

        let Some((key, entry)) = self.resolve(url) else {
            debug!("Response from {} ({}) matched no dispatch", url, status);
            return;
        };
        if let Some(dispatch) = self.correlations.remove(&key) {
            self.metrics.record_fetch_time(dispatch.elapsed());
        }
        info!(
            "Fetched {} (depth={}, status={})",
            entry.domain, entry.depth, status
        );
    }

    fn on_error(&self, url: &str, error: &FetchError) {
        self.in_flight.decrement();
        self.metrics.page_failed();
        error!("Fetch failed for {}: {}", url, error);

        if let Some((key, _)) = self.resolve(url) {
            self.correlations.remove(&key);
        }
    }
}

async fn run_worker(
    worker_id: usize,
    state: Arc<CrawlState>,
    fetcher: Arc<dyn Fetcher>,
    mut stop_rx: watch::Receiver<bool>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        let stopping = *stop_rx.borrow();
        if stopping {
            break;
        }

        let entry = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            entry = state.queue.pop() => entry,
        };

        let Some(entry) = entry else {
            debug!("Worker {}: queue closed", worker_id);
            break;
        };
        state.dispatch(worker_id, entry, fetcher.as_ref());
    }

    debug!("Worker {} finished", worker_id);
}

/// Breadth-first domain crawler.
///
/// Built from a config, a [`Fetcher`] and a [`GraphStore`]. The usual run is
/// `bootstrap`, `start`, then either `wait_until_idle` or an external `stop`,
/// followed by a final `checkpoint`.
pub struct Crawler {
    state: Arc<CrawlState>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn GraphStore>,
    timings: CrawlTimings,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: OnceCell<()>,
}

impl Crawler {
    pub fn new(config: &CrawlConfig, fetcher: Arc<dyn Fetcher>, store: Arc<dyn GraphStore>) -> Self {
        let limits = CrawlLimits::from(config);
        let (stop_tx, _) = watch::channel(false);

        Self {
            state: Arc::new(CrawlState {
                limits,
                queue: FrontierQueue::new(),
                limiter: SubdomainLimiter::new(limits.max_subdomains_per_root),
                graph: GraphCache::new(),
                correlations: CorrelationTable::new(),
                in_flight: InFlight::default(),
                metrics: Arc::new(CrawlMetrics::new()),
            }),
            fetcher,
            store,
            timings: CrawlTimings::default(),
            stop_tx,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: OnceCell::new(),
        }
    }

    pub fn with_timings(mut self, timings: CrawlTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Shares `metrics` instead of the crawler's own counters.
    /// Only takes effect before the crawler starts.
    pub fn with_metrics(mut self, metrics: Arc<CrawlMetrics>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.metrics = metrics;
        }
        self
    }

    pub fn limits(&self) -> CrawlLimits {
        self.state.limits
    }

    pub fn graph(&self) -> &GraphCache {
        &self.state.graph
    }

    pub fn metrics(&self) -> Arc<CrawlMetrics> {
        self.state.metrics.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.state.queue.len()
    }

    pub fn queue_snapshot(&self) -> Vec<FrontierEntry> {
        self.state.queue.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.queue.is_stopped()
    }

    /// Seeds the frontier, either from storage or from `seed_url`.
    ///
    /// When storage holds resumable nodes they are loaded into the graph and
    /// the saved frontier snapshot is restored, followed by every resumable
    /// node at its last depth. The seed is ignored in that case. Otherwise
    /// the seed is enqueued at depth 0, first resetting its stored crawl
    /// count if a previous run used it up.
    pub fn bootstrap(&self, seed_url: &str) -> Result<StartMode> {
        let limits = self.state.limits;
        let store = self.store.as_ref();

        let loaded = self
            .state
            .graph
            .load_from_storage(store, limits.max_crawls_per_node)?;

        if !loaded.is_empty() {
            info!("Resuming crawl: found {} resumable nodes", loaded.len());
            let saved = self.state.graph.load_queue_state(store)?;
            if !saved.is_empty() {
                info!("Restoring {} saved frontier entries", saved.len());
            }

            let restored: HashSet<String> = saved.iter().map(|e| e.domain.clone()).collect();
            let requeued = loaded
                .iter()
                .filter(|node| node.last_depth <= limits.max_depth)
                .filter(|node| !restored.contains(&node.domain))
                .map(|node| FrontierEntry::new(node.id, node.domain.clone(), node.last_depth));

            let mut queued = 0;
            for entry in saved.into_iter().chain(requeued) {
                if self.enqueue(entry) {
                    queued += 1;
                }
            }

            info!("Resumed with {} entries in the frontier", queued);
            return Ok(StartMode::Resumed {
                nodes: loaded.len(),
                queued,
            });
        }

        info!("No resumable nodes found, starting fresh crawl from {}", seed_url);
        let domain =
            extract_domain(seed_url).ok_or_else(|| ScanError::InvalidUrl(seed_url.to_string()))?;

        if let Some(existing) = store.get_node(&domain)?
            && existing.crawl_count >= limits.max_crawls_per_node
        {
            info!(
                "Seed {} was crawled {} times before, resetting its crawl count",
                domain, existing.crawl_count
            );
            store.reset_crawl_count(existing.id)?;
        }

        let seed = self.enqueue_seed(&domain);
        Ok(StartMode::Fresh { seed })
    }

    fn enqueue_seed(&self, domain: &str) -> NodeId {
        let (id, created) = self.state.graph.upsert_node_tracked(domain, "", 0);
        if created {
            self.state.metrics.node_discovered();
        }
        self.enqueue(FrontierEntry::new(id, domain, 0));
        id
    }

    /// Registers the entry's domain with the subdomain limiter and pushes it
    /// onto the frontier. Returns false for duplicates and once the crawler
    /// is stopping.
    ///
    /// Entries come from an earlier admission (seed, saved frontier), so a
    /// full root does not block them here.
    pub fn enqueue(&self, entry: FrontierEntry) -> bool {
        self.state.limiter.add(&entry.domain);
        self.state.queue.push(entry)
    }

    /// Spawns the worker tasks. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers = self.state.limits.workers.max(1);
        info!("Starting crawl with {} workers", workers);

        let mut handles = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for worker_id in 1..=workers {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                self.state.clone(),
                self.fetcher.clone(),
                self.stop_tx.subscribe(),
            )));
        }
    }

    /// Stops the crawl. The first call does the work; concurrent and later
    /// calls wait for it to finish.
    ///
    /// Closes the frontier, signals the workers and waits up to the worker
    /// timeout for them, then up to the in-flight timeout for dispatched
    /// fetches. Fetches still outstanding after that are cancelled and
    /// abandoned.
    pub async fn stop(&self) {
        self.shutdown.get_or_init(|| self.shutdown_once()).await;
    }

    async fn shutdown_once(&self) {
        info!("Stopping crawler...");
        self.state.queue.stop();
        self.stop_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        if timeout(self.timings.worker_timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "Workers did not stop within {:?}, continuing shutdown",
                self.timings.worker_timeout
            );
        }

        let in_flight = self.state.in_flight.get();
        if in_flight > 0 {
            info!(
                "Waiting for {} in-flight requests (max {:?})...",
                in_flight, self.timings.in_flight_timeout
            );
            match timeout(self.timings.in_flight_timeout, self.state.in_flight.wait_drained()).await {
                Ok(()) => info!("All in-flight requests completed"),
                Err(_) => {
                    warn!(
                        "Abandoning {} in-flight requests",
                        self.state.in_flight.get()
                    );
                    self.fetcher.cancel();
                }
            }
        }

        info!("Crawler stopped");
    }

    /// Polls until the frontier is empty and nothing is in flight, confirmed
    /// once more after a settle delay, then stops the crawler.
    ///
    /// Returns `None` if the crawler was stopped by someone else first.
    pub async fn wait_until_idle(&self) -> Option<TerminationReason> {
        let mut polls: u64 = 0;

        loop {
            tokio::time::sleep(self.timings.poll_interval).await;
            if self.is_stopped() {
                return None;
            }

            polls += 1;
            let queued = self.queue_len();
            let in_flight = self.in_flight();
            if polls % 5 == 0 {
                info!("Queue status: {} queued, {} in flight", queued, in_flight);
            }
            if queued > 0 || in_flight > 0 {
                continue;
            }

            debug!("Frontier and in-flight both empty, confirming...");
            tokio::time::sleep(self.timings.settle_delay).await;
            if self.is_stopped() {
                return None;
            }
            if self.queue_len() == 0 && self.in_flight() == 0 {
                info!("Crawl complete: frontier drained");
                self.stop().await;
                return Some(TerminationReason::QueueEmpty);
            }
        }
    }

    /// Flushes the graph and saves the current frontier.
    ///
    /// Both halves are attempted; the first error is returned.
    pub fn checkpoint(&self) -> std::result::Result<FlushStats, StoreError> {
        let store = self.store.as_ref();
        let flushed = self.state.graph.flush(store);
        let snapshot = self.state.queue.snapshot();
        let saved = self.state.graph.save_queue_state(store, &snapshot);

        match (flushed, saved) {
            (Ok(stats), Ok(_)) => Ok(stats),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Drops the saved frontier snapshot, for runs that finished naturally.
    pub fn clear_saved_queue(&self) -> std::result::Result<(), StoreError> {
        self.store.clear_queue_entries()
    }
}
