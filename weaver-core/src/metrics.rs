use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why a crawl ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    QueueEmpty,
    Signal,
    ForcedExit,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::QueueEmpty => "queue_empty",
            TerminationReason::Signal => "signal",
            TerminationReason::ForcedExit => "forced_exit",
        }
    }
}

/// Metrics file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub nodes_discovered: u64,
    pub nodes_crawled: u64,
    pub edges_recorded: u64,
    pub pages_fetched: u64,
    pub pages_failed: u64,
    pub total_fetch_time_ms: u64,
    pub avg_fetch_time_ms: u64,
    pub termination_reason: Option<TerminationReason>,
}

/// Crawl counters shared between the orchestrator and whoever reports on it
#[derive(Debug)]
pub struct CrawlMetrics {
    start_time: DateTime<Utc>,
    nodes_discovered: AtomicU64,
    nodes_crawled: AtomicU64,
    edges_recorded: AtomicU64,
    pages_fetched: AtomicU64,
    pages_failed: AtomicU64,
    total_fetch_time_ms: AtomicU64,
    fetch_count: AtomicU64,
}

impl Default for CrawlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            nodes_discovered: AtomicU64::new(0),
            nodes_crawled: AtomicU64::new(0),
            edges_recorded: AtomicU64::new(0),
            pages_fetched: AtomicU64::new(0),
            pages_failed: AtomicU64::new(0),
            total_fetch_time_ms: AtomicU64::new(0),
            fetch_count: AtomicU64::new(0),
        }
    }

    pub fn node_discovered(&self) {
        self.nodes_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_crawled(&self) {
        self.nodes_crawled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edge_recorded(&self) {
        self.edges_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_time(&self, elapsed: Duration) {
        self.total_fetch_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsReport {
        let total = self.total_fetch_time_ms.load(Ordering::Relaxed);
        let count = self.fetch_count.load(Ordering::Relaxed);
        MetricsReport {
            start_time: self.start_time,
            end_time: Utc::now(),
            nodes_discovered: self.nodes_discovered.load(Ordering::Relaxed),
            nodes_crawled: self.nodes_crawled.load(Ordering::Relaxed),
            edges_recorded: self.edges_recorded.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            total_fetch_time_ms: total,
            avg_fetch_time_ms: if count > 0 { total / count } else { 0 },
            termination_reason: None,
        }
    }

    pub fn progress_line(&self) -> String {
        let s = self.snapshot();
        format!(
            "Nodes: {} discovered, {} crawled | Edges: {} | Pages: {} fetched, {} failed",
            s.nodes_discovered, s.nodes_crawled, s.edges_recorded, s.pages_fetched, s.pages_failed
        )
    }

    /// Writes the final report as pretty-printed JSON.
    pub fn write_to_file(&self, path: &Path, reason: TerminationReason) -> io::Result<MetricsReport> {
        let mut report = self.snapshot();
        report.termination_reason = Some(reason);
        let json = serde_json::to_string_pretty(&report).map_err(io::Error::other)?;
        fs::write(path, json)?;
        Ok(report)
    }
}
