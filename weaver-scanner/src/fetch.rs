use crate::error::FetchError;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Receives the outcome of every request a [`Fetcher`] makes.
///
/// Events are keyed by URL, not by whoever asked for the fetch. For a single
/// request, all page events (`on_title`, `on_meta_description`, `on_link`)
/// come before exactly one terminal event (`on_response` or `on_error`).
/// Implementations are called from the fetcher's own tasks, concurrently.
pub trait FetchEvents: Send + Sync {
    fn on_title(&self, url: &str, text: &str);

    fn on_meta_description(&self, url: &str, text: &str);

    fn on_link(&self, url: &str, href: &str);

    fn on_response(&self, url: &str, status: u16);

    fn on_error(&self, url: &str, error: &FetchError);
}

/// Asynchronous page fetcher.
pub trait Fetcher: Send + Sync {
    /// Schedules a fetch of `url` and returns without waiting for it.
    /// An error means nothing was scheduled and no event will follow.
    fn visit(&self, url: &str, events: Arc<dyn FetchEvents>) -> Result<(), FetchError>;

    /// Resolves once no scheduled fetch is outstanding.
    fn wait(&self) -> BoxFuture<'_, ()>;

    /// Best-effort abort of outstanding and future fetches.
    fn cancel(&self);
}
