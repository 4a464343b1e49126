pub mod correlation;
pub mod crawler;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod frontier;
pub mod http;
pub mod limiter;

pub use correlation::CorrelationTable;
pub use crawler::{CrawlLimits, CrawlTimings, Crawler, StartMode};
pub use error::{FetchError, ScanError};
pub use fetch::{FetchEvents, Fetcher};
pub use frontier::FrontierQueue;
pub use http::HttpFetcher;
pub use limiter::SubdomainLimiter;
