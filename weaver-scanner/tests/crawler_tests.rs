// Tests for the crawl orchestrator, driven by a scripted fetcher

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weaver_core::{CrawlConfig, FrontierEntry, GraphStore, SqliteStore, TerminationReason};
use weaver_scanner::{
    CrawlTimings, Crawler, FetchError, FetchEvents, Fetcher, ScanError, StartMode,
};

// ============================================================================
// Scripted fetcher
// ============================================================================

#[derive(Debug, Clone)]
enum Script {
    Page {
        /// Host the page is served from after redirects
        final_host: Option<String>,
        title: String,
        meta: Option<String>,
        links: Vec<String>,
    },
    Fail,
    Hang,
}

fn page(title: &str, links: &[&str]) -> Script {
    Script::Page {
        final_host: None,
        title: title.to_string(),
        meta: None,
        links: links.iter().map(|l| l.to_string()).collect(),
    }
}

#[derive(Default)]
struct ScriptedFetcher {
    scripts: HashMap<String, Script>,
    visits: Mutex<Vec<String>>,
    cancels: AtomicUsize,
    reject_visits: bool,
}

impl ScriptedFetcher {
    fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(domain, script)| (domain.to_string(), script))
                .collect(),
            ..Self::default()
        }
    }

    fn rejecting() -> Self {
        Self {
            reject_visits: true,
            ..Self::default()
        }
    }

    fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

impl Fetcher for ScriptedFetcher {
    fn visit(&self, url: &str, events: Arc<dyn FetchEvents>) -> Result<(), FetchError> {
        if self.reject_visits {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }
        self.visits.lock().unwrap().push(url.to_string());

        let domain = url.trim_start_matches("https://").to_string();
        let script = self
            .scripts
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| page("", &[]));
        let url = url.to_string();

        match script {
            Script::Hang => {}
            Script::Fail => {
                tokio::spawn(async move {
                    events.on_error(&url, &FetchError::Status(500));
                });
            }
            Script::Page {
                final_host,
                title,
                meta,
                links,
            } => {
                tokio::spawn(async move {
                    let page_url = match final_host {
                        Some(host) => format!("https://{}/", host),
                        None => url,
                    };
                    events.on_title(&page_url, &title);
                    if let Some(meta) = meta {
                        events.on_meta_description(&page_url, &meta);
                    }
                    for link in &links {
                        events.on_link(&page_url, link);
                    }
                    events.on_response(&page_url, 200);
                });
            }
        }
        Ok(())
    }

    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config(max_depth: u32) -> CrawlConfig {
    CrawlConfig {
        seed_url: "https://a.com".to_string(),
        max_depth,
        max_crawls_per_node: 3,
        max_subdomains_per_root: 3,
        max_outbound_links: 10,
        concurrent_workers: 3,
        ..CrawlConfig::default()
    }
}

fn fast_timings() -> CrawlTimings {
    CrawlTimings {
        worker_timeout: Duration::from_millis(200),
        in_flight_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        settle_delay: Duration::from_millis(50),
    }
}

fn create_test_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().expect("Failed to open in-memory store"))
}

fn create_crawler(
    config: &CrawlConfig,
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<SqliteStore>,
) -> Crawler {
    Crawler::new(config, fetcher, store).with_timings(fast_timings())
}

async fn run_to_completion(crawler: &Crawler) -> Option<TerminationReason> {
    crawler.start();
    tokio::time::timeout(Duration::from_secs(5), crawler.wait_until_idle())
        .await
        .expect("crawl should go idle")
}

fn domains(crawler: &Crawler) -> Vec<String> {
    let mut domains: Vec<String> = crawler
        .graph()
        .nodes()
        .into_iter()
        .map(|n| n.domain)
        .collect();
    domains.sort();
    domains
}

fn node_id(crawler: &Crawler, domain: &str) -> i64 {
    crawler.graph().get_node(domain).unwrap().id
}

// ============================================================================
// Crawl Tests
// ============================================================================

#[tokio::test]
async fn test_crawl_records_filtered_links() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![(
        "a.com",
        page(
            "Alpha",
            &[
                "https://b.com/1",
                "https://b.com/2",
                "https://c.com",
                "https://www.facebook.com/alpha",
                "https://a.com/self",
                "/relative",
            ],
        ),
    )]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher.clone(), store.clone());

    assert!(matches!(
        crawler.bootstrap("https://a.com").unwrap(),
        StartMode::Fresh { .. }
    ));
    assert_eq!(run_to_completion(&crawler).await, Some(TerminationReason::QueueEmpty));

    assert_eq!(domains(&crawler), vec!["a.com", "b.com", "c.com"]);

    let a = node_id(&crawler, "a.com");
    let b = node_id(&crawler, "b.com");
    let c = node_id(&crawler, "c.com");
    assert_eq!(crawler.graph().edge_weight(a, b), Some(1));
    assert_eq!(crawler.graph().edge_weight(a, c), Some(1));
    assert_eq!(crawler.graph().edges().len(), 2);

    assert_eq!(crawler.graph().get_node("a.com").unwrap().crawl_count, 1);
    assert_eq!(crawler.graph().get_node("a.com").unwrap().description, "Alpha");

    let mut visits = fetcher.visits();
    visits.sort();
    assert_eq!(
        visits,
        vec!["https://a.com", "https://b.com", "https://c.com"]
    );
    assert_eq!(crawler.in_flight(), 0);
}

#[tokio::test]
async fn test_links_past_max_depth_recorded_not_followed() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        ("a.com", page("A", &["https://b.com"])),
        ("b.com", page("B", &["https://d.com"])),
    ]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher.clone(), store);

    crawler.bootstrap("https://a.com").unwrap();
    run_to_completion(&crawler).await;

    let b = node_id(&crawler, "b.com");
    let d = node_id(&crawler, "d.com");
    assert_eq!(crawler.graph().edge_weight(b, d), Some(1));
    assert_eq!(crawler.graph().get_node("d.com").unwrap().crawl_count, 0);
    assert!(!fetcher.visits().contains(&"https://d.com".to_string()));
}

#[tokio::test]
async fn test_outbound_link_cap_per_page() {
    let links: Vec<String> = (0..8).map(|i| format!("https://site{}.org", i)).collect();
    let links: Vec<&str> = links.iter().map(|s| s.as_str()).collect();
    let fetcher = Arc::new(ScriptedFetcher::new(vec![("a.com", page("A", &links))]));
    let store = create_test_store();
    let config = CrawlConfig {
        max_outbound_links: 3,
        ..test_config(1)
    };
    let crawler = create_crawler(&config, fetcher, store);

    crawler.bootstrap("https://a.com").unwrap();
    run_to_completion(&crawler).await;

    assert_eq!(crawler.graph().edges().len(), 3);
    assert!(crawler.graph().get_node("site0.org").is_some());
    assert!(crawler.graph().get_node("site3.org").is_none());
}

#[tokio::test]
async fn test_subdomain_limit_bounds_discovery() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![(
        "a.com",
        page(
            "A",
            &[
                "https://one.example.com",
                "https://two.example.com",
                "https://three.example.com",
            ],
        ),
    )]));
    let store = create_test_store();
    let config = CrawlConfig {
        max_subdomains_per_root: 2,
        ..test_config(1)
    };
    let crawler = create_crawler(&config, fetcher, store);

    crawler.bootstrap("https://a.com").unwrap();
    run_to_completion(&crawler).await;

    let example_nodes = domains(&crawler)
        .into_iter()
        .filter(|d| d.ends_with("example.com"))
        .count();
    assert_eq!(example_nodes, 2);
}

#[tokio::test]
async fn test_meta_description_fills_missing_title() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![(
        "a.com",
        Script::Page {
            final_host: None,
            title: "   ".to_string(),
            meta: Some("Described by meta".to_string()),
            links: Vec::new(),
        },
    )]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher, store);

    crawler.bootstrap("https://a.com").unwrap();
    run_to_completion(&crawler).await;

    assert_eq!(
        crawler.graph().get_node("a.com").unwrap().description,
        "Described by meta"
    );
}

#[tokio::test]
async fn test_redirected_events_resolve_by_root_domain() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![(
        "a.com",
        Script::Page {
            final_host: Some("www.a.com".to_string()),
            title: "Redirected".to_string(),
            meta: None,
            links: vec!["https://b.com".to_string()],
        },
    )]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher, store);

    crawler.bootstrap("https://a.com").unwrap();
    run_to_completion(&crawler).await;

    assert!(crawler.graph().get_node("www.a.com").is_none());
    assert_eq!(
        crawler.graph().get_node("a.com").unwrap().description,
        "Redirected"
    );
    let a = node_id(&crawler, "a.com");
    let b = node_id(&crawler, "b.com");
    assert_eq!(crawler.graph().edge_weight(a, b), Some(1));
    assert_eq!(crawler.metrics().snapshot().pages_fetched, 2);
}

#[tokio::test]
async fn test_fetch_error_releases_in_flight() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![("a.com", Script::Fail)]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher, store);

    crawler.bootstrap("https://a.com").unwrap();
    assert_eq!(run_to_completion(&crawler).await, Some(TerminationReason::QueueEmpty));

    let metrics = crawler.metrics().snapshot();
    assert_eq!(metrics.pages_failed, 1);
    assert_eq!(metrics.pages_fetched, 0);
    assert_eq!(crawler.in_flight(), 0);
}

#[tokio::test]
async fn test_dispatch_failure_is_not_fatal() {
    let fetcher = Arc::new(ScriptedFetcher::rejecting());
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher, store);

    crawler.bootstrap("https://a.com").unwrap();
    assert_eq!(run_to_completion(&crawler).await, Some(TerminationReason::QueueEmpty));

    assert_eq!(crawler.in_flight(), 0);
    assert_eq!(crawler.metrics().snapshot().nodes_crawled, 1);
    assert_eq!(crawler.graph().get_node("a.com").unwrap().crawl_count, 1);
}

#[tokio::test]
async fn test_bootstrap_rejects_bad_seed() {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher, store);

    assert!(matches!(
        crawler.bootstrap("not a url"),
        Err(ScanError::InvalidUrl(_))
    ));
}

// ============================================================================
// Resume Tests
// ============================================================================

#[tokio::test]
async fn test_resume_requeues_at_last_depth() {
    let store = create_test_store();
    let id = store.upsert_node("a.com", "Alpha", 2).unwrap();
    store.increment_crawl_count(id).unwrap();
    store.increment_crawl_count(id).unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new(vec![("a.com", page("Alpha", &[]))]));
    let crawler = create_crawler(&test_config(5), fetcher.clone(), store.clone());

    let mode = crawler.bootstrap("https://ignored.com").unwrap();
    assert_eq!(mode, StartMode::Resumed { nodes: 1, queued: 1 });
    assert_eq!(crawler.queue_snapshot(), vec![FrontierEntry::new(id, "a.com", 2)]);

    run_to_completion(&crawler).await;
    crawler.checkpoint().unwrap();

    assert_eq!(store.get_node("a.com").unwrap().unwrap().crawl_count, 3);
    assert!(store.load_resumable_nodes(3).unwrap().is_empty());
    assert_eq!(fetcher.visits(), vec!["https://a.com"]);
}

#[tokio::test]
async fn test_resume_restores_saved_frontier_first() {
    let store = create_test_store();
    let a = store.upsert_node("a.com", "", 0).unwrap();
    let b = store.upsert_node("b.com", "", 1).unwrap();
    store.save_queue_entry(&FrontierEntry::new(999, "b.com", 1)).unwrap();

    let fetcher = Arc::new(ScriptedFetcher::default());
    let crawler = create_crawler(&test_config(3), fetcher, store);

    let mode = crawler.bootstrap("https://a.com").unwrap();
    assert_eq!(mode, StartMode::Resumed { nodes: 2, queued: 2 });
    assert_eq!(
        crawler.queue_snapshot(),
        vec![
            FrontierEntry::new(b, "b.com", 1),
            FrontierEntry::new(a, "a.com", 0),
        ]
    );
}

#[tokio::test]
async fn test_capped_seed_is_reset() {
    let store = create_test_store();
    let id = store.upsert_node("a.com", "Alpha", 0).unwrap();
    for _ in 0..3 {
        store.increment_crawl_count(id).unwrap();
    }

    let fetcher = Arc::new(ScriptedFetcher::new(vec![("a.com", page("Alpha", &[]))]));
    let crawler = create_crawler(&test_config(1), fetcher.clone(), store.clone());

    assert!(matches!(
        crawler.bootstrap("https://a.com").unwrap(),
        StartMode::Fresh { .. }
    ));
    assert_eq!(store.get_node("a.com").unwrap().unwrap().crawl_count, 0);

    run_to_completion(&crawler).await;
    crawler.checkpoint().unwrap();
    assert_eq!(fetcher.visits(), vec!["https://a.com"]);
    assert_eq!(store.get_node("a.com").unwrap().unwrap().crawl_count, 1);
}

// ============================================================================
// Checkpoint Tests
// ============================================================================

#[tokio::test]
async fn test_repeated_checkpoints_do_not_inflate_edges() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![(
        "a.com",
        page("A", &["https://b.com"]),
    )]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(1), fetcher, store.clone());

    crawler.bootstrap("https://a.com").unwrap();
    run_to_completion(&crawler).await;

    crawler.checkpoint().unwrap();
    crawler.checkpoint().unwrap();

    let a = store.get_node("a.com").unwrap().unwrap();
    let b = store.get_node("b.com").unwrap().unwrap();
    assert_eq!(store.get_edge_weight(a.id, b.id).unwrap(), Some(1));
    assert_eq!(a.crawl_count, 1);
    assert_eq!(a.description, "A");
    assert!(store.load_queue_entries().unwrap().is_empty());
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_stop_with_hung_fetches_is_bounded() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        ("a.com", page("A", &["https://b.com", "https://c.com"])),
        ("b.com", Script::Hang),
        ("c.com", Script::Hang),
    ]));
    let store = create_test_store();
    let crawler = create_crawler(&test_config(2), fetcher.clone(), store.clone());

    crawler.bootstrap("https://a.com").unwrap();
    crawler.start();

    tokio::time::timeout(Duration::from_secs(5), async {
        while crawler.in_flight() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both hung fetches should be dispatched");

    let timings = fast_timings();
    let started = Instant::now();
    tokio::join!(crawler.stop(), crawler.stop());
    let elapsed = started.elapsed();

    assert!(
        elapsed < timings.worker_timeout + timings.in_flight_timeout + Duration::from_millis(500),
        "stop took {:?}",
        elapsed
    );
    assert_eq!(fetcher.cancels.load(Ordering::SeqCst), 1);
    assert!(crawler.is_stopped());
    assert!(!crawler.enqueue(FrontierEntry::new(1, "late.com", 1)));

    crawler.checkpoint().unwrap();
    assert!(store.get_node("a.com").unwrap().is_some());
    assert!(store.get_node("b.com").unwrap().is_some());
    assert!(store.get_node("c.com").unwrap().is_some());
}

#[tokio::test]
async fn test_idle_watcher_yields_to_external_stop() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![("a.com", Script::Hang)]));
    let store = create_test_store();
    let crawler = Arc::new(create_crawler(&test_config(1), fetcher, store));

    crawler.bootstrap("https://a.com").unwrap();
    crawler.start();

    let watcher = {
        let crawler = crawler.clone();
        tokio::spawn(async move { crawler.wait_until_idle().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    crawler.stop().await;

    let reason = tokio::time::timeout(Duration::from_secs(2), watcher)
        .await
        .expect("watcher should exit after stop")
        .unwrap();
    assert_eq!(reason, None);
}
