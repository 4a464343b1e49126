use crate::error::{StoreError, StoreResult};
use crate::model::{Edge, FrontierEntry, Node, NodeId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Persistent side of the crawl graph.
///
/// Every method must be safe to call from several threads at once. Writes are
/// idempotent (`upsert_node`) or accumulate (`upsert_edge`,
/// `increment_crawl_count`), which is what lets the graph cache replay its
/// state on every checkpoint.
pub trait GraphStore: Send + Sync {
    /// Inserts the node or updates it in place. An existing non-empty
    /// description is kept and `last_depth` only grows.
    fn upsert_node(&self, domain: &str, description: &str, depth: u32) -> StoreResult<NodeId>;

    fn increment_crawl_count(&self, id: NodeId) -> StoreResult<()>;

    fn reset_crawl_count(&self, id: NodeId) -> StoreResult<()>;

    fn get_node(&self, domain: &str) -> StoreResult<Option<Node>>;

    /// Inserts the edge with weight 1, or adds one to its weight.
    fn upsert_edge(&self, from: NodeId, to: NodeId) -> StoreResult<()>;

    /// Nodes with `crawl_count < max_crawls`, oldest first.
    fn load_resumable_nodes(&self, max_crawls: u32) -> StoreResult<Vec<Node>>;

    fn save_queue_entry(&self, entry: &FrontierEntry) -> StoreResult<()>;

    fn load_queue_entries(&self) -> StoreResult<Vec<FrontierEntry>>;

    fn clear_queue_entries(&self) -> StoreResult<()>;
}

/// SQLite implementation of [`GraphStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let created_at: i64 = row.get(5)?;
    Ok(Node {
        id: row.get(0)?,
        domain: row.get(1)?,
        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        crawl_count: row.get(3)?,
        last_depth: row.get(4)?,
        created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
    })
}

impl SqliteStore {
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS nodes (
                node_id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_name TEXT UNIQUE NOT NULL,
                description TEXT,
                crawl_count INTEGER NOT NULL DEFAULT 0,
                last_depth INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS edges (
                edge_id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_node_id INTEGER NOT NULL,
                to_node_id INTEGER NOT NULL,
                weight INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY(from_node_id) REFERENCES nodes(node_id),
                FOREIGN KEY(to_node_id) REFERENCES nodes(node_id),
                UNIQUE(from_node_id, to_node_id)
            );

            -- Frontier snapshot taken at checkpoint time
            CREATE TABLE IF NOT EXISTS queue_state (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                domain_name TEXT NOT NULL,
                depth INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_crawl_count ON nodes(crawl_count);
            CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_node_id);
            CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_node_id);
            CREATE INDEX IF NOT EXISTS idx_queue_state_node ON queue_state(node_id);
            ",
        )?;
        Ok(())
    }

    // Query methods
    pub fn load_all_nodes(&self) -> StoreResult<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, domain_name, description, crawl_count, last_depth, created_at
             FROM nodes ORDER BY created_at ASC, node_id ASC",
        )?;

        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn load_edges(&self) -> StoreResult<Vec<Edge>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT from_node_id, to_node_id, weight FROM edges ORDER BY edge_id ASC",
        )?;

        let edges = stmt
            .query_map([], |row| {
                Ok(Edge {
                    from_id: row.get(0)?,
                    to_id: row.get(1)?,
                    weight: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    pub fn get_edge_weight(&self, from: NodeId, to: NodeId) -> StoreResult<Option<u64>> {
        let conn = self.conn()?;
        let weight = conn
            .query_row(
                "SELECT weight FROM edges WHERE from_node_id = ?1 AND to_node_id = ?2",
                params![from, to],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(weight.map(|w| w as u64))
    }
}

impl GraphStore for SqliteStore {
    fn upsert_node(&self, domain: &str, description: &str, depth: u32) -> StoreResult<NodeId> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO nodes (domain_name, description, crawl_count, last_depth, created_at)
             VALUES (?1, ?2, 0, ?3, ?4)
             ON CONFLICT(domain_name) DO UPDATE SET
                description = CASE
                    WHEN nodes.description IS NULL OR nodes.description = ''
                    THEN excluded.description
                    ELSE nodes.description
                END,
                last_depth = MAX(nodes.last_depth, excluded.last_depth)
             RETURNING node_id",
            params![domain, description, depth, current_timestamp()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn increment_crawl_count(&self, id: NodeId) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE nodes SET crawl_count = crawl_count + 1 WHERE node_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn reset_crawl_count(&self, id: NodeId) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE nodes SET crawl_count = 0 WHERE node_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn get_node(&self, domain: &str) -> StoreResult<Option<Node>> {
        let conn = self.conn()?;
        let node = conn
            .query_row(
                "SELECT node_id, domain_name, description, crawl_count, last_depth, created_at
                 FROM nodes WHERE domain_name = ?1",
                params![domain],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    fn upsert_edge(&self, from: NodeId, to: NodeId) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO edges (from_node_id, to_node_id, weight) VALUES (?1, ?2, 1)
             ON CONFLICT(from_node_id, to_node_id) DO UPDATE SET weight = weight + 1",
            params![from, to],
        )?;
        Ok(())
    }

    fn load_resumable_nodes(&self, max_crawls: u32) -> StoreResult<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, domain_name, description, crawl_count, last_depth, created_at
             FROM nodes
             WHERE crawl_count < ?1
             ORDER BY created_at ASC, node_id ASC",
        )?;

        let nodes = stmt
            .query_map(params![max_crawls], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    fn save_queue_entry(&self, entry: &FrontierEntry) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO queue_state (node_id, domain_name, depth, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![entry.node_id, &entry.domain, entry.depth, current_timestamp()],
        )?;
        Ok(())
    }

    fn load_queue_entries(&self) -> StoreResult<Vec<FrontierEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, domain_name, depth FROM queue_state ORDER BY entry_id ASC",
        )?;

        let entries = stmt
            .query_map([], |row| {
                Ok(FrontierEntry {
                    node_id: row.get(0)?,
                    domain: row.get(1)?,
                    depth: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn clear_queue_entries(&self) -> StoreResult<()> {
        self.conn()?.execute("DELETE FROM queue_state", [])?;
        Ok(())
    }
}
