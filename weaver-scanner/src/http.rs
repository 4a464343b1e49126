use crate::error::FetchError;
use crate::fetch::{FetchEvents, Fetcher};
use futures::future::BoxFuture;
use reqwest::Client;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};
use url::Url;

/// A page that was fetched successfully
struct FetchedPage {
    final_url: String,
    status: u16,
    body: Option<String>,
}

struct FetcherInner {
    client: Client,
    permits: Semaphore,
    retry_attempts: u32,
    retry_delay: Duration,
    outstanding: AtomicUsize,
    idle: Notify,
    cancelled: AtomicBool,
    cancel_signal: Notify,
}

/// [`Fetcher`] backed by reqwest, parsing HTML with scraper.
///
/// Every `visit` runs on its own task. At most `parallelism` requests are on
/// the wire at once; the rest wait for a permit. Events are reported against
/// the URL the response finally came from, after redirects.
#[derive(Clone)]
pub struct HttpFetcher {
    inner: Arc<FetcherInner>,
}

impl HttpFetcher {
    pub fn new(parallelism: usize, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent("Weaver/0.1 (+https://github.com/akses0/weaver)")
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            inner: Arc::new(FetcherInner {
                client,
                permits: Semaphore::new(parallelism.max(1)),
                retry_attempts: 0,
                retry_delay: Duration::ZERO,
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                cancelled: AtomicBool::new(false),
                cancel_signal: Notify::new(),
            }),
        })
    }

    /// Retries timeouts, connection failures and 5xx responses up to
    /// `attempts` more times, sleeping `delay` in between.
    ///
    /// Only takes effect before the fetcher is cloned or used.
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_attempts = attempts;
            inner.retry_delay = delay;
        }
        self
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }
}

impl Fetcher for HttpFetcher {
    fn visit(&self, url: &str, events: Arc<dyn FetchEvents>) -> Result<(), FetchError> {
        if self.inner.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;

        let inner = self.inner.clone();
        let url = url.to_string();
        inner.outstanding.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::select! {
                _ = inner.wait_cancelled() => {
                    events.on_error(&url, &FetchError::Cancelled);
                }
                _ = inner.run(&url, events.as_ref()) => {}
            }
            inner.finish_one();
        });

        Ok(())
    }

    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let idle = self.inner.idle.notified();
                if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        })
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        self.inner.cancel_signal.notify_waiters();
    }
}

impl FetcherInner {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn wait_cancelled(&self) {
        let signal = self.cancel_signal.notified();
        if self.is_cancelled() {
            return;
        }
        signal.await;
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Fetches `url` with retries, then reports the page or the failure.
    async fn run(&self, url: &str, events: &dyn FetchEvents) {
        let Ok(_permit) = self.permits.acquire().await else {
            events.on_error(url, &FetchError::Cancelled);
            return;
        };

        let mut attempt = 0;
        let result = loop {
            match self.fetch_once(url).await {
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    debug!(
                        "Retrying {} ({}/{}) after error: {}",
                        url, attempt, self.retry_attempts, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                other => break other,
            }
        };

        match result {
            Ok(page) => {
                if let Some(body) = &page.body {
                    emit_page_events(&page.final_url, body, events);
                }
                events.on_response(&page.final_url, page.status);
            }
            Err(e) => {
                warn!("Request to {} failed: {}", url, e);
                events.on_error(url, &e);
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        debug!("Fetching {}", url);
        let response = self.client.get(url).send().await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(FetchError::Status(status));
        }

        let final_url = response.url().to_string();
        let is_html = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);

        let body = if is_html {
            Some(response.text().await?)
        } else {
            None
        };

        Ok(FetchedPage {
            final_url,
            status,
            body,
        })
    }
}

/// Reports the title, meta description and links of an HTML page, in that
/// order. Relative links are resolved against `page_url`.
fn emit_page_events(page_url: &str, html: &str, events: &dyn FetchEvents) {
    let document = Html::parse_document(html);

    if let Ok(selector) = Selector::parse("title")
        && let Some(title) = document.select(&selector).next()
    {
        let text: String = title.text().collect();
        events.on_title(page_url, &text);
    }

    if let Ok(selector) = Selector::parse(r#"meta[name="description"]"#)
        && let Some(content) = document
            .select(&selector)
            .find_map(|meta| meta.value().attr("content"))
    {
        events.on_meta_description(page_url, content);
    }

    let Ok(selector) = Selector::parse("a[href]") else {
        return;
    };
    let base = Url::parse(page_url).ok();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if let Some(link) = resolve_link(base.as_ref(), href) {
            events.on_link(page_url, &link);
        }
    }
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with('#')
    {
        return None;
    }

    match base {
        Some(base) => {
            let mut resolved = base.join(href).ok()?;
            resolved.set_fragment(None);
            Some(resolved.to_string())
        }
        None => Some(href.to_string()),
    }
}
