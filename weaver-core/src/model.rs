use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric node identifier. Matches SQLite's rowid type.
pub type NodeId = i64;

/// Maximum number of characters kept for a node description.
pub const MAX_DESCRIPTION_CHARS: usize = 60;

/// A domain or subdomain in the crawl graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub domain: String,
    pub description: String,
    pub crawl_count: u32,
    /// Deepest BFS level this node has been enqueued at
    pub last_depth: u32,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: NodeId, domain: String, description: String, depth: u32) -> Self {
        Self {
            id,
            domain,
            description,
            crawl_count: 0,
            last_depth: depth,
            created_at: Utc::now(),
        }
    }

    pub fn has_description(&self) -> bool {
        !self.description.is_empty()
    }
}

/// A directed link between two nodes, weighted by the number of observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub weight: u64,
}

/// An item waiting in the BFS frontier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub node_id: NodeId,
    pub domain: String,
    pub depth: u32,
}

impl FrontierEntry {
    pub fn new(node_id: NodeId, domain: impl Into<String>, depth: u32) -> Self {
        Self {
            node_id,
            domain: domain.into(),
            depth,
        }
    }
}

/// Trims surrounding whitespace and cuts the text to [`MAX_DESCRIPTION_CHARS`].
pub fn truncate_description(text: &str) -> String {
    text.trim().chars().take(MAX_DESCRIPTION_CHARS).collect()
}
