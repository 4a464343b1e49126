use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use weaver_core::{CrawlConfig, CrawlMetrics, Edge, Node, SqliteStore, TerminationReason};
use weaver_scanner::{Crawler, HttpFetcher, StartMode};

const DEFAULT_CONFIG_FILE: &str = "config.json";

pub fn print_banner() {
    let banner = r#"
 __      __
/  \    /  \ ____ _____ ___  __ ___________
\   \/\/   // __ \\__  \\  \/ // __ \_  __ \
 \        /\  ___/ / __ \\   /\  ___/|  | \/
  \__/\  /  \___  >____  /\_/  \___  >__|
       \/       \/     \/          \/
"#;
    println!("{}", banner.bright_cyan().bold());
    println!(
        "  {} v{}\n",
        "domain link-graph crawler".bright_white(),
        env!("CARGO_PKG_VERSION")
    );
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

/// Expands a leading `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlOverrides {
    pub config_path: Option<PathBuf>,
    pub seed_url: Option<String>,
    pub db_path: Option<String>,
    pub workers: Option<usize>,
    pub max_depth: Option<u32>,
    pub metrics_path: Option<String>,
}

impl CrawlOverrides {
    pub fn from_matches(args: &ArgMatches) -> Self {
        Self {
            config_path: args.get_one::<PathBuf>("config").cloned(),
            seed_url: args.get_one::<String>("url").cloned(),
            db_path: args.get_one::<String>("db").cloned(),
            workers: args.get_one::<usize>("threads").copied(),
            max_depth: args.get_one::<u32>("max-depth").copied(),
            metrics_path: args.get_one::<String>("metrics").cloned(),
        }
    }
}

/// Builds the effective config: file (explicit, or `./config.json` when it
/// exists), then flag overrides, then path expansion and validation.
pub fn resolve_config(overrides: &CrawlOverrides) -> Result<CrawlConfig> {
    let file = match &overrides.config_path {
        Some(path) => Some(expand_path(&path.to_string_lossy())),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    let mut config = match &file {
        Some(path) => CrawlConfig::read(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => CrawlConfig::default(),
    };

    if let Some(url) = &overrides.seed_url {
        config.seed_url = url.clone();
    }
    if let Some(db) = &overrides.db_path {
        config.db_path = db.clone();
    }
    if let Some(workers) = overrides.workers {
        config.concurrent_workers = workers;
    }
    if let Some(depth) = overrides.max_depth {
        config.max_depth = depth;
    }
    if let Some(metrics) = &overrides.metrics_path {
        config.metrics_path = metrics.clone();
    }

    config.db_path = expand_path(&config.db_path).to_string_lossy().into_owned();
    config.metrics_path = expand_path(&config.metrics_path).to_string_lossy().into_owned();

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn spawn_checkpoint_ticker(
    crawler: Arc<Crawler>,
    every: Duration,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = interval.tick() => {}
            }

            let crawler = crawler.clone();
            match tokio::task::spawn_blocking(move || crawler.checkpoint()).await {
                Ok(Ok(stats)) => info!(
                    "Checkpoint saved: {} nodes, {} edges",
                    stats.nodes_written, stats.edges_written
                ),
                Ok(Err(e)) => error!("Checkpoint failed: {}", e),
                Err(e) => error!("Checkpoint task failed: {}", e),
            }
        }
    })
}

fn spawn_progress_reporter(
    metrics: Arc<CrawlMetrics>,
    spinner: Option<ProgressBar>,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = if spinner.is_some() {
            Duration::from_millis(250)
        } else {
            Duration::from_secs(10)
        };
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = done.changed() => break,
                _ = interval.tick() => {}
            }
            match &spinner {
                Some(spinner) => spinner.set_message(metrics.progress_line()),
                None => info!("{}", metrics.progress_line()),
            }
        }
    })
}

fn new_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Last-resort save when a second signal arrives during shutdown
fn emergency_exit(crawler: &Crawler, metrics_path: &Path) -> ! {
    eprintln!("\n{}", "Forced exit requested, saving what we have...".red().bold());
    if let Err(e) = crawler.checkpoint() {
        error!("Emergency flush failed: {}", e);
    }
    if let Err(e) = crawler
        .metrics()
        .write_to_file(metrics_path, TerminationReason::ForcedExit)
    {
        error!("Failed to write metrics: {}", e);
    }
    std::process::exit(1);
}

pub async fn handle_crawl(args: &ArgMatches) -> Result<()> {
    let overrides = CrawlOverrides::from_matches(args);
    let config = resolve_config(&overrides)?;
    let show_progress = args.get_flag("progress");

    init_logging(if show_progress { "warn" } else { "info" });

    let db_path = PathBuf::from(&config.db_path);
    let metrics_path = PathBuf::from(&config.metrics_path);
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );
    let fetcher = Arc::new(
        HttpFetcher::new(config.concurrent_workers, config.request_timeout())
            .context("Failed to build HTTP client")?
            .with_retries(config.retry_attempts, config.retry_delay()),
    );
    let crawler = Arc::new(Crawler::new(&config, fetcher, store));

    print_divider();
    println!("  {} {}", "Seed:".bold(), config.seed_url);
    println!("  {} {}", "Database:".bold(), db_path.display());
    println!(
        "  {} {} workers, depth {}, {} crawls/node, {} subdomains/root, {} links/page",
        "Limits:".bold(),
        config.concurrent_workers,
        config.max_depth,
        config.max_crawls_per_node,
        config.max_subdomains_per_root,
        config.max_outbound_links
    );

    match crawler.bootstrap(&config.seed_url)? {
        StartMode::Fresh { .. } => println!("  {} fresh crawl", "Mode:".bold()),
        StartMode::Resumed { nodes, queued } => println!(
            "  {} resuming ({} resumable nodes, {} queued)",
            "Mode:".bold(),
            nodes,
            queued
        ),
    }
    print_divider();

    crawler.start();

    let (done_tx, done_rx) = watch::channel(false);
    let ticker = config
        .checkpoint_interval()
        .map(|every| spawn_checkpoint_ticker(crawler.clone(), every, done_rx.clone()));
    let spinner = show_progress.then(new_spinner);
    let reporter = spawn_progress_reporter(crawler.metrics(), spinner.clone(), done_rx);

    let reason = tokio::select! {
        reason = crawler.wait_until_idle() => reason.unwrap_or(TerminationReason::Signal),
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping gracefully (press Ctrl+C again to force)");
            TerminationReason::Signal
        }
    };

    let graceful = async {
        crawler.stop().await;
        done_tx.send_replace(true);
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        let _ = reporter.await;

        let final_crawler = crawler.clone();
        let stats = tokio::task::spawn_blocking(move || final_crawler.checkpoint())
            .await
            .context("Final checkpoint task failed")?;
        if reason == TerminationReason::QueueEmpty {
            crawler
                .clear_saved_queue()
                .context("Failed to clear saved frontier")?;
        }
        stats.context("Final checkpoint failed")
    };

    let stats = tokio::select! {
        stats = graceful => stats,
        _ = shutdown_signal() => emergency_exit(&crawler, &metrics_path),
    };

    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }

    let stats = match stats {
        Ok(stats) => Some(stats),
        Err(e) => {
            error!("{:#}", e);
            None
        }
    };

    let report = crawler
        .metrics()
        .write_to_file(&metrics_path, reason)
        .with_context(|| format!("Failed to write metrics to {}", metrics_path.display()))?;

    let (nodes, edges) = crawler.graph().stats();
    println!();
    print_divider();
    println!("  {}", "Crawl finished".green().bold());
    println!("  {} {}", "Reason:".bold(), reason.as_str());
    println!("  {} {} nodes, {} edges", "Graph:".bold(), nodes, edges);
    println!(
        "  {} {} fetched, {} failed, {} ms average",
        "Pages:".bold(),
        report.pages_fetched,
        report.pages_failed,
        report.avg_fetch_time_ms
    );
    match stats {
        Some(stats) => println!(
            "  {} {} nodes, {} edges written to {}",
            "Saved:".bold(),
            stats.nodes_written,
            stats.edges_written,
            db_path.display()
        ),
        None => println!("  {} {}", "Saved:".bold(), "checkpoint failed, see log".red()),
    }
    println!("  {} {}", "Metrics:".bold(), metrics_path.display());
    print_divider();

    Ok(())
}

/// Everything the store holds, as written by `weaver export`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExport {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

pub fn export_graph(store: &SqliteStore) -> Result<GraphExport> {
    Ok(GraphExport {
        nodes: store.load_all_nodes().context("Failed to load nodes")?,
        edges: store.load_edges().context("Failed to load edges")?,
    })
}

pub fn write_export(export: &GraphExport, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(export)?;
    match output {
        Some(path) => fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

pub fn handle_export(args: &ArgMatches) -> Result<()> {
    let db = args
        .get_one::<String>("db")
        .map(String::as_str)
        .unwrap_or("crawler.db");
    let db_path = expand_path(db);
    if !SqliteStore::exists(&db_path) {
        bail!("Database not found: {}", db_path.display());
    }

    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let export = export_graph(&store)?;
    let output = args.get_one::<PathBuf>("output");
    write_export(&export, output.map(PathBuf::as_path))?;

    if let Some(path) = output {
        eprintln!(
            "{} {} nodes and {} edges to {}",
            "Exported".green().bold(),
            export.nodes.len(),
            export.edges.len(),
            path.display()
        );
    }
    Ok(())
}
