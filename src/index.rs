//! Derived SQLite index over the document tree and event log.
//!
//! Every table here is a projection. The document store write path is the
//! only code that mutates it, and a full rebuild from the documents loses
//! nothing. Full records always come from the document files; the index
//! answers id-level questions (selection, ordering, readiness, counts).

use crate::error::StoreError;
use crate::events::EventFilter;
use crate::types::{Event, EventKind, Kind, Node, Relation, Session};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, params_from_iter};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Meta keys for the freshness fingerprints.
pub(crate) const META_NODES_COUNT: &str = "nodes_count";
pub(crate) const META_SESSIONS_COUNT: &str = "sessions_count";
pub(crate) const META_EVENTS_LINES: &str = "events_lines";

#[derive(Debug)]
pub(crate) struct Index {
    db: Connection,
}

/// Raw `nodes` row, compared field-wise against documents by `reindex`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeRow {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub priority: i64,
    pub title: String,
    pub claimed_by: Option<String>,
    pub claiming_session: Option<String>,
    pub claimed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl NodeRow {
    /// The projection a document is expected to produce.
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            kind: node.kind.as_str().to_string(),
            status: node.status.as_str().to_string(),
            priority: node.priority as i64,
            title: node.title.clone(),
            claimed_by: node.claimed_by.clone(),
            claiming_session: node.claiming_session.clone(),
            claimed_at: node.claimed_at.map(|dt| dt.to_rfc3339()),
            created_at: node.created_at.to_rfc3339(),
            updated_at: node.updated_at.to_rfc3339(),
        }
    }

    /// Name the first field that differs, for drift reporting.
    pub fn first_drift(&self, other: &NodeRow) -> Option<&'static str> {
        if self.kind != other.kind {
            return Some("kind");
        }
        if self.status != other.status {
            return Some("status");
        }
        if self.priority != other.priority {
            return Some("priority");
        }
        if self.title != other.title {
            return Some("title");
        }
        if self.claimed_by != other.claimed_by {
            return Some("claimed_by");
        }
        if self.claiming_session != other.claiming_session {
            return Some("claiming_session");
        }
        if self.claimed_at != other.claimed_at {
            return Some("claimed_at");
        }
        if self.created_at != other.created_at {
            return Some("created_at");
        }
        if self.updated_at != other.updated_at {
            return Some("updated_at");
        }
        None
    }
}

/// Raw `edges` row: (source, relation, target, label).
pub(crate) type EdgeRow = (String, String, String, Option<String>);

/// Raw `sessions` row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SessionRow {
    pub id: String,
    pub agent: String,
    pub parent_session: Option<String>,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl SessionRow {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            agent: session.owning_agent.clone(),
            parent_session: session.parent_session.clone(),
            status: session.status.as_str().to_string(),
            started_at: session.started_at.to_rfc3339(),
            ended_at: session.ended_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Raw `events` row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EventRow {
    pub id: String,
    pub ts: String,
    pub seq: i64,
    pub subject: String,
    pub kind: String,
    pub agent: String,
    pub session: Option<String>,
}

impl EventRow {
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            ts: event.ts.to_rfc3339(),
            seq: event.seq as i64,
            subject: event.subject.clone(),
            kind: event.kind.as_str().to_string(),
            agent: event.agent.clone(),
            session: event.session.clone(),
        }
    }
}

impl Index {
    /// Open (creating if absent) the index database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let db = Connection::open(path)?;
        db.busy_timeout(busy_timeout)?;
        let index = Self { db };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('task', 'feat', 'bug', 'chore', 'epic')),
                status TEXT NOT NULL CHECK (status IN ('todo', 'in-progress', 'blocked', 'done')),
                priority INTEGER NOT NULL,
                title TEXT NOT NULL,
                claimed_by TEXT,
                claiming_session TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status);
            CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind);
            CREATE INDEX IF NOT EXISTS idx_nodes_priority ON nodes(priority);
            CREATE INDEX IF NOT EXISTS idx_nodes_claimed_by ON nodes(claimed_by);
            CREATE INDEX IF NOT EXISTS idx_nodes_updated ON nodes(updated_at);

            CREATE TABLE IF NOT EXISTS edges (
                source_id TEXT NOT NULL,
                relation TEXT NOT NULL CHECK (relation IN ('blocks', 'depends-on', 'related')),
                target_id TEXT NOT NULL,
                label TEXT,
                PRIMARY KEY (source_id, relation, target_id)
            );
            CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                parent_session TEXT,
                status TEXT NOT NULL CHECK (status IN ('active', 'completed', 'paused', 'failed')),
                started_at TEXT NOT NULL,
                ended_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                ts TEXT NOT NULL,
                seq INTEGER NOT NULL,
                subject TEXT NOT NULL,
                kind TEXT NOT NULL,
                agent TEXT NOT NULL,
                session TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_subject ON events(subject);
            CREATE INDEX IF NOT EXISTS idx_events_session ON events(session);
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    // ----- write-through -----

    pub fn upsert_node(&self, node: &Node) -> Result<(), StoreError> {
        let row = NodeRow::from_node(node);
        self.db.execute(
            r#"
            INSERT OR REPLACE INTO nodes (id, kind, status, priority, title, claimed_by, claiming_session, claimed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                row.id,
                row.kind,
                row.status,
                row.priority,
                row.title,
                row.claimed_by,
                row.claiming_session,
                row.claimed_at,
                row.created_at,
                row.updated_at,
            ],
        )?;

        // Delete existing edges and insert the document's current set
        self.db
            .execute("DELETE FROM edges WHERE source_id = ?", params![node.id])?;
        for edge in &node.edges {
            self.db.execute(
                "INSERT OR REPLACE INTO edges (source_id, relation, target_id, label) VALUES (?, ?, ?, ?)",
                params![node.id, edge.relation.as_str(), edge.target, edge.label],
            )?;
        }

        Ok(())
    }

    pub fn remove_node(&self, id: &str) -> Result<(), StoreError> {
        // Edges owned by other documents that point here stay, dangling.
        self.db
            .execute("DELETE FROM edges WHERE source_id = ?", params![id])?;
        self.db
            .execute("DELETE FROM nodes WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        let row = SessionRow::from_session(session);
        self.db.execute(
            r#"
            INSERT OR REPLACE INTO sessions (id, agent, parent_session, status, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                row.id,
                row.agent,
                row.parent_session,
                row.status,
                row.started_at,
                row.ended_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        let row = EventRow::from_event(event);
        self.db.execute(
            r#"
            INSERT OR REPLACE INTO events (id, ts, seq, subject, kind, agent, session)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                row.id,
                row.ts,
                row.seq,
                row.subject,
                row.kind,
                row.agent,
                row.session,
            ],
        )?;
        Ok(())
    }

    /// Clear every projection table before a rebuild.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.db.execute_batch(
            r#"
            DELETE FROM edges;
            DELETE FROM nodes;
            DELETE FROM sessions;
            DELETE FROM events;
            DELETE FROM meta;
        "#,
        )?;
        Ok(())
    }

    // ----- id-level queries -----

    /// Record ids, optionally restricted to one kind, in
    /// (priority, created_at, id) order.
    pub fn node_ids(&self, kind: Option<Kind>) -> Result<Vec<String>, StoreError> {
        let mut stmt;
        let rows: Vec<String> = match kind {
            Some(kind) => {
                stmt = self.db.prepare(
                    "SELECT id FROM nodes WHERE kind = ? ORDER BY priority ASC, created_at ASC, id ASC",
                )?;
                stmt.query_map(params![kind.as_str()], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect()
            }
            None => {
                stmt = self
                    .db
                    .prepare("SELECT id FROM nodes ORDER BY priority ASC, created_at ASC, id ASC")?;
                stmt.query_map([], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect()
            }
        };
        Ok(rows)
    }

    /// Todo records with no unfinished blocker. A blocker that does not
    /// exist locally never blocks.
    pub fn ready_ids(&self) -> Result<Vec<String>, StoreError> {
        let sql = r#"
            SELECT n.id FROM nodes n
            WHERE n.status = 'todo'
            AND NOT EXISTS (
                SELECT 1 FROM edges e
                JOIN nodes blocker ON e.source_id = blocker.id
                WHERE e.target_id = n.id
                AND e.relation = 'blocks'
                AND blocker.status IN ('todo', 'in-progress', 'blocked')
            )
            AND NOT EXISTS (
                SELECT 1 FROM edges e
                JOIN nodes dep ON e.target_id = dep.id
                WHERE e.source_id = n.id
                AND e.relation = 'depends-on'
                AND dep.status IN ('todo', 'in-progress', 'blocked')
            )
            ORDER BY n.priority ASC, n.created_at ASC, n.id ASC
        "#;
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Records held back: explicitly blocked, or unfinished with an
    /// unfinished blocker.
    pub fn blocked_ids(&self) -> Result<Vec<String>, StoreError> {
        let sql = r#"
            SELECT n.id FROM nodes n
            WHERE n.status = 'blocked'
            OR (
                n.status IN ('todo', 'in-progress')
                AND (
                    EXISTS (
                        SELECT 1 FROM edges e
                        JOIN nodes blocker ON e.source_id = blocker.id
                        WHERE e.target_id = n.id
                        AND e.relation = 'blocks'
                        AND blocker.status IN ('todo', 'in-progress', 'blocked')
                    )
                    OR EXISTS (
                        SELECT 1 FROM edges e
                        JOIN nodes dep ON e.target_id = dep.id
                        WHERE e.source_id = n.id
                        AND e.relation = 'depends-on'
                        AND dep.status IN ('todo', 'in-progress', 'blocked')
                    )
                )
            )
            ORDER BY n.priority ASC, n.created_at ASC, n.id ASC
        "#;
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Targets of a record's edges of one relation.
    pub fn edges_of(&self, id: &str, relation: Relation) -> Result<BTreeSet<String>, StoreError> {
        let mut stmt = self
            .db
            .prepare("SELECT target_id FROM edges WHERE source_id = ? AND relation = ?")?;
        let rows = stmt.query_map(params![id, relation.as_str()], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Records whose readiness depends on `id` finishing: forward blocks
    /// targets plus reverse depends-on sources.
    pub fn dependents_of(&self, id: &str) -> Result<BTreeSet<String>, StoreError> {
        let sql = r#"
            SELECT target_id FROM edges WHERE source_id = ?1 AND relation = 'blocks'
            UNION
            SELECT source_id FROM edges WHERE target_id = ?1 AND relation = 'depends-on'
        "#;
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All (source, target) pairs of one relation.
    pub fn relation_edges(&self, relation: Relation) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self
            .db
            .prepare("SELECT source_id, target_id FROM edges WHERE relation = ?")?;
        let rows = stmt.query_map(params![relation.as_str()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// In-progress records of one kind held by one agent.
    pub fn wip_count(&self, agent: &str, kind: Kind) -> Result<usize, StoreError> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM nodes WHERE claimed_by = ? AND kind = ? AND status = 'in-progress'",
            params![agent, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ----- event queries -----

    pub fn events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut bound: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(subject) = &filter.subject {
            clauses.push("subject = ?".to_string());
            bound.push(subject.clone().into());
        }
        if let Some(session) = &filter.session {
            clauses.push("session = ?".to_string());
            bound.push(session.clone().into());
        }
        if !filter.kinds.is_empty() {
            let placeholders = vec!["?"; filter.kinds.len()].join(", ");
            clauses.push(format!("kind IN ({})", placeholders));
            for kind in &filter.kinds {
                bound.push(kind.as_str().to_string().into());
            }
        }
        if let Some(since) = &filter.since {
            clauses.push("ts >= ?".to_string());
            bound.push(since.to_rfc3339().into());
        }
        if let Some(until) = &filter.until {
            clauses.push("ts <= ?".to_string());
            bound.push(until.to_rfc3339().into());
        }

        let mut sql = String::from("SELECT id, ts, seq, subject, kind, agent, session FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ts ASC, seq ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), Self::row_to_event)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn session_event_count(&self, session_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM events WHERE session = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Sessions that name `parent` as their delegating session.
    pub fn session_child_ids(&self, parent: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT id FROM sessions WHERE parent_session = ? ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![parent], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
        let ts_str: String = row.get(1)?;
        let seq: i64 = row.get(2)?;
        let kind_str: String = row.get(4)?;

        Ok(Event {
            id: row.get(0)?,
            ts: parse_ts(&ts_str),
            seq: seq as u64,
            subject: row.get(3)?,
            kind: EventKind::parse(&kind_str).unwrap_or(EventKind::Update),
            agent: row.get(5)?,
            session: row.get(6)?,
        })
    }

    // ----- raw rows for reindex -----

    pub fn node_rows(&self) -> Result<Vec<NodeRow>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT id, kind, status, priority, title, claimed_by, claiming_session, claimed_at, created_at, updated_at FROM nodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(NodeRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                status: row.get(2)?,
                priority: row.get(3)?,
                title: row.get(4)?,
                claimed_by: row.get(5)?,
                claiming_session: row.get(6)?,
                claimed_at: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn edge_rows(&self) -> Result<Vec<EdgeRow>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT source_id, relation, target_id, label FROM edges ORDER BY source_id, relation, target_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn session_rows(&self) -> Result<Vec<SessionRow>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT id, agent, parent_session, status, started_at, ended_at FROM sessions ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRow {
                id: row.get(0)?,
                agent: row.get(1)?,
                parent_session: row.get(2)?,
                status: row.get(3)?,
                started_at: row.get(4)?,
                ended_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn event_rows(&self) -> Result<Vec<EventRow>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT id, ts, seq, subject, kind, agent, session FROM events ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                seq: row.get(2)?,
                subject: row.get(3)?,
                kind: row.get(4)?,
                agent: row.get(5)?,
                session: row.get(6)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ----- freshness fingerprints -----

    pub fn meta_count(&self, key: &str) -> i64 {
        self.db
            .query_row(
                "SELECT COALESCE((SELECT value FROM meta WHERE key = ?), '0')",
                params![key],
                |row| {
                    let value: String = row.get(0)?;
                    Ok(value.parse::<i64>().unwrap_or(0))
                },
            )
            .unwrap_or(0)
    }

    pub fn set_meta_count(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.db.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    /// Adjust a fingerprint in place. The arithmetic happens inside
    /// SQLite so concurrent writers through the same file do not lose
    /// increments. A missing key stays missing; the resulting mismatch
    /// forces the rebuild that seeds it.
    pub fn bump_meta_count(&self, key: &str, delta: i64) -> Result<(), StoreError> {
        self.db.execute(
            "UPDATE meta SET value = CAST(CAST(value AS INTEGER) + ?1 AS TEXT) WHERE key = ?2",
            params![delta, key],
        )?;
        Ok(())
    }

    /// Arbitrary SELECT with one string column, for queries compiled by
    /// the query engine.
    pub fn select_ids(
        &self,
        sql: &str,
        bound: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(bound), |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
