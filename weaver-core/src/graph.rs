//! In-memory graph cache.
//!
//! The cache is the authoritative copy of the graph while a crawl runs. The
//! persistent store only sees it on [`GraphCache::flush`], and only hands data
//! back through [`GraphCache::load_from_storage`] when a crawl resumes.

use crate::data::GraphStore;
use crate::error::{GraphError, StoreError};
use crate::model::{Edge, FrontierEntry, Node, NodeId, truncate_description};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
struct EdgeWeight {
    weight: u64,
    /// Part of `weight` already replayed into the store
    persisted: u64,
}

#[derive(Debug, Default)]
struct GraphInner {
    nodes: HashMap<String, Node>,
    ids: HashMap<NodeId, String>,
    edges: HashMap<(NodeId, NodeId), EdgeWeight>,
    last_id: NodeId,
}

impl GraphInner {
    fn node_by_id_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let domain = self.ids.get(&id)?;
        self.nodes.get_mut(domain)
    }
}

/// Counters reported by a flush
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub nodes_written: usize,
    pub edges_written: usize,
    pub edges_skipped: usize,
}

#[derive(Debug, Default)]
pub struct GraphCache {
    inner: Mutex<GraphInner>,
    /// Held for the whole of a flush or queue save so overlapping
    /// checkpoints never replay the same increments twice
    checkpoint: Mutex<()>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_checkpoint(&self) -> MutexGuard<'_, ()> {
        self.checkpoint.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the node on first sight, otherwise fills in a missing
    /// description and raises `last_depth`. Returns the node id.
    pub fn upsert_node(&self, domain: &str, description: &str, depth: u32) -> NodeId {
        self.upsert_node_tracked(domain, description, depth).0
    }

    /// Same as [`GraphCache::upsert_node`], also reporting whether the node
    /// was created by this call.
    pub fn upsert_node_tracked(&self, domain: &str, description: &str, depth: u32) -> (NodeId, bool) {
        let description = truncate_description(description);
        let mut inner = self.lock();

        if let Some(node) = inner.nodes.get_mut(domain) {
            if !node.has_description() && !description.is_empty() {
                node.description = description;
            }
            node.last_depth = node.last_depth.max(depth);
            return (node.id, false);
        }

        inner.last_id += 1;
        let id = inner.last_id;
        let node = Node::new(id, domain.to_string(), description, depth);
        inner.ids.insert(id, domain.to_string());
        inner.nodes.insert(domain.to_string(), node);
        (id, true)
    }

    pub fn get_node(&self, domain: &str) -> Option<Node> {
        self.lock().nodes.get(domain).cloned()
    }

    pub fn get_node_by_id(&self, id: NodeId) -> Option<Node> {
        let inner = self.lock();
        inner.ids.get(&id).and_then(|domain| inner.nodes.get(domain)).cloned()
    }

    /// Returns the new crawl count.
    pub fn increment_crawl_count(&self, id: NodeId) -> Result<u32, GraphError> {
        let mut inner = self.lock();
        let node = inner
            .node_by_id_mut(id)
            .ok_or(GraphError::UnknownNode(id))?;
        node.crawl_count += 1;
        Ok(node.crawl_count)
    }

    /// Increments the crawl count unless it already reached `max_crawls`.
    /// Returns the new count, or `None` when the node is capped.
    pub fn try_increment_crawl_count(
        &self,
        id: NodeId,
        max_crawls: u32,
    ) -> Result<Option<u32>, GraphError> {
        let mut inner = self.lock();
        let node = inner
            .node_by_id_mut(id)
            .ok_or(GraphError::UnknownNode(id))?;
        if node.crawl_count >= max_crawls {
            return Ok(None);
        }
        node.crawl_count += 1;
        Ok(Some(node.crawl_count))
    }

    /// Records one more observation of `from -> to`. Returns the new weight.
    pub fn upsert_edge(&self, from: NodeId, to: NodeId) -> Result<u64, GraphError> {
        let mut inner = self.lock();
        if !inner.ids.contains_key(&from) {
            return Err(GraphError::UnknownNode(from));
        }
        if !inner.ids.contains_key(&to) {
            return Err(GraphError::UnknownNode(to));
        }

        let edge = inner.edges.entry((from, to)).or_default();
        edge.weight += 1;
        Ok(edge.weight)
    }

    pub fn edge_weight(&self, from: NodeId, to: NodeId) -> Option<u64> {
        self.lock().edges.get(&(from, to)).map(|e| e.weight)
    }

    /// Returns (node count, edge count)
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.nodes.len(), inner.edges.len())
    }

    /// All nodes ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.lock().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// All edges ordered by (from, to).
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .lock()
            .edges
            .iter()
            .map(|(&(from_id, to_id), e)| Edge {
                from_id,
                to_id,
                weight: e.weight,
            })
            .collect();
        edges.sort_by_key(|e| (e.from_id, e.to_id));
        edges
    }

    /// Writes the whole cache through to `store`.
    ///
    /// Nodes are upserted and their crawl count is rebuilt by resetting it and
    /// replaying one increment per crawl. Edges are written against the
    /// store's own ids, looked up by domain, replaying the increments the
    /// store has not seen yet. A failure does not stop the flush; the first
    /// error is returned once every node and edge has been attempted.
    ///
    /// Concurrent flushes run one after the other; the later one only writes
    /// what the earlier one left unpersisted.
    pub fn flush(&self, store: &dyn GraphStore) -> Result<FlushStats, StoreError> {
        let _checkpoint = self.lock_checkpoint();
        let start = Instant::now();
        info!("Starting flush to database...");

        // Work from a copy so crawl callbacks are not blocked on SQLite
        let (nodes, edges) = {
            let inner = self.lock();
            let nodes: Vec<Node> = inner.nodes.values().cloned().collect();
            let edges: Vec<((NodeId, NodeId), EdgeWeight)> =
                inner.edges.iter().map(|(k, v)| (*k, *v)).collect();
            (nodes, edges)
        };

        let mut stats = FlushStats::default();
        let mut first_err: Option<StoreError> = None;

        for node in &nodes {
            match Self::flush_node(store, node) {
                Ok(_) => stats.nodes_written += 1,
                Err(e) => {
                    warn!("Failed to flush node {}: {}", node.domain, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        let domains: HashMap<NodeId, &str> =
            nodes.iter().map(|n| (n.id, n.domain.as_str())).collect();
        let mut resolved: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        let mut resolve = |id: NodeId, first_err: &mut Option<StoreError>| -> Option<NodeId> {
            if let Some(cached) = resolved.get(&id) {
                return *cached;
            }
            let db_id = match domains.get(&id) {
                Some(domain) => match store.get_node(domain) {
                    Ok(node) => node.map(|n| n.id),
                    Err(e) => {
                        warn!("Failed to resolve node {}: {}", domain, e);
                        first_err.get_or_insert(e);
                        None
                    }
                },
                None => None,
            };
            resolved.insert(id, db_id);
            db_id
        };

        for ((from, to), edge) in edges {
            let pending = edge.weight.saturating_sub(edge.persisted);
            if pending == 0 {
                continue;
            }

            let db_from = resolve(from, &mut first_err);
            let db_to = resolve(to, &mut first_err);
            let (Some(db_from), Some(db_to)) = (db_from, db_to) else {
                warn!("Skipping edge {}->{}: node not found in storage", from, to);
                stats.edges_skipped += 1;
                continue;
            };

            let mut written = 0;
            for _ in 0..pending {
                if let Err(e) = store.upsert_edge(db_from, db_to) {
                    warn!("Failed to flush edge {}->{}: {}", db_from, db_to, e);
                    first_err.get_or_insert(e);
                    break;
                }
                written += 1;
            }

            if written > 0 {
                let mut inner = self.lock();
                if let Some(e) = inner.edges.get_mut(&(from, to)) {
                    e.persisted += written;
                }
                stats.edges_written += 1;
            }
        }

        info!(
            "Flush complete: {} nodes, {} edges written in {:?}",
            stats.nodes_written,
            stats.edges_written,
            start.elapsed()
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    fn flush_node(store: &dyn GraphStore, node: &Node) -> Result<NodeId, StoreError> {
        let db_id = store.upsert_node(&node.domain, &node.description, node.last_depth)?;
        store.reset_crawl_count(db_id)?;
        for _ in 0..node.crawl_count {
            store.increment_crawl_count(db_id)?;
        }
        Ok(db_id)
    }

    /// Loads every resumable node (`crawl_count < max_crawls`) from `store`,
    /// keeping its persisted id. Returns the loaded nodes in discovery order.
    pub fn load_from_storage(
        &self,
        store: &dyn GraphStore,
        max_crawls: u32,
    ) -> Result<Vec<Node>, StoreError> {
        info!("Loading resumable nodes from database into memory...");
        let nodes = store.load_resumable_nodes(max_crawls)?;

        let mut inner = self.lock();
        let mut loaded = Vec::with_capacity(nodes.len());
        for node in nodes {
            if inner.nodes.contains_key(&node.domain) || inner.ids.contains_key(&node.id) {
                debug!("Node {} already cached, keeping in-memory copy", node.domain);
                continue;
            }
            inner.last_id = inner.last_id.max(node.id);
            inner.ids.insert(node.id, node.domain.clone());
            inner.nodes.insert(node.domain.clone(), node.clone());
            loaded.push(node);
        }

        info!("Loaded {} nodes into memory", loaded.len());
        Ok(loaded)
    }

    /// Replaces the persisted frontier snapshot with `entries`.
    pub fn save_queue_state(
        &self,
        store: &dyn GraphStore,
        entries: &[FrontierEntry],
    ) -> Result<usize, StoreError> {
        let _checkpoint = self.lock_checkpoint();
        store.clear_queue_entries()?;
        for entry in entries {
            store.save_queue_entry(entry)?;
        }
        debug!("Saved {} queue entries", entries.len());
        Ok(entries.len())
    }

    /// Reads the persisted frontier snapshot back, re-keyed on the cached
    /// node ids. Entries whose node is not in the cache are dropped.
    pub fn load_queue_state(&self, store: &dyn GraphStore) -> Result<Vec<FrontierEntry>, StoreError> {
        let saved = store.load_queue_entries()?;
        let inner = self.lock();

        let entries: Vec<FrontierEntry> = saved
            .into_iter()
            .filter_map(|entry| match inner.nodes.get(&entry.domain) {
                Some(node) => Some(FrontierEntry::new(node.id, entry.domain, entry.depth)),
                None => {
                    debug!("Dropping saved queue entry {}: node not resumable", entry.domain);
                    None
                }
            })
            .collect();

        Ok(entries)
    }
}
