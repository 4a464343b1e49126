pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod model;

pub use config::CrawlConfig;
pub use data::{GraphStore, SqliteStore};
pub use error::{ConfigError, GraphError, StoreError};
pub use graph::{FlushStats, GraphCache};
pub use metrics::{CrawlMetrics, MetricsReport, TerminationReason};
pub use model::{Edge, FrontierEntry, Node, NodeId};
