//! Document store: one file per record, write-through SQLite index.
//!
//! The document tree under the store root is authoritative. Every write
//! goes through a per-record lock and an atomic temp+rename, then mirrors
//! into the index. When mirroring fails the index is marked unfresh and
//! rebuilt from the documents before the next indexed read.

use crate::config::StoreConfig;
use crate::document;
use crate::error::StoreError;
use crate::events::{EVENTS_FILE, EVENTS_LOCK, EventLog};
use crate::fsio::{self, RecordLock};
use crate::id;
use crate::index::{
    EdgeRow, EventRow, Index, META_EVENTS_LINES, META_NODES_COUNT, META_SESSIONS_COUNT, NodeRow,
    SessionRow,
};
use crate::types::{Context, Event, EventKind, Kind, Node, Relation, Session};
use chrono::Utc;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Directory for lock files.
const LOCKS_DIR: &str = ".locks";

/// Directory for session documents.
const SESSION_DIR: &str = "session";

/// Index database file.
const INDEX_FILE: &str = "index.db";

/// Cross-process flag that the index missed a write-through.
const DIRTY_FILE: &str = ".index.dirty";

/// Outcome of an explicit consistency check and rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexReport {
    /// True when the rebuild changed index content.
    pub rebuilt: bool,
    /// Everything that diverged between documents and index.
    pub discrepancies: Vec<Discrepancy>,
}

/// One divergence between the document tree and the index.
#[derive(Debug, Clone, PartialEq)]
pub enum Discrepancy {
    /// A document with no index row
    MissingRow { id: String },
    /// An index row with no document
    OrphanRow { id: String },
    /// An index row field that disagrees with the document
    FieldDrift { id: String, field: String },
    /// A document edge absent from the index
    MissingEdge {
        source: String,
        relation: String,
        target: String,
    },
    /// An index edge absent from the documents
    OrphanEdge {
        source: String,
        relation: String,
        target: String,
    },
    /// A session row missing, orphaned, or diverged
    SessionDrift { id: String },
    /// An event log line missing from or diverged in the index
    EventDrift { seq: u64 },
    /// A document that cannot be decoded
    CorruptDocument { origin: String, reason: String },
}

struct DocumentScan {
    nodes: Vec<Node>,
    corrupt: Vec<(String, String)>,
    file_count: i64,
}

struct SessionScan {
    sessions: Vec<Session>,
    corrupt: Vec<(String, String)>,
    file_count: i64,
}

/// Storage handle owning the root path and the derived index.
#[derive(Debug)]
pub(crate) struct Storage {
    root: PathBuf,
    config: StoreConfig,
    index: Index,
    log: EventLog,
    index_dirty: Cell<bool>,
}

impl Storage {
    /// Initialize the on-disk layout and open it. Idempotent.
    pub fn init(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        for kind in Kind::ALL {
            fs::create_dir_all(root.join(kind.as_str()))?;
        }
        fs::create_dir_all(root.join(SESSION_DIR))?;
        fs::create_dir_all(root.join(LOCKS_DIR))?;

        let events_path = root.join(EVENTS_FILE);
        if !events_path.exists() {
            File::create(&events_path)?;
        }

        let storage = Self::attach(root, config)?;
        storage.rebuild()?;
        fsio::sweep_orphans(root, storage.config.temp_sweep_age());
        Ok(storage)
    }

    /// Open an existing store. The event log file is the marker that a
    /// store was initialized here.
    pub fn open(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        if !root.join(EVENTS_FILE).exists() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no store at {}", root.display()),
            )));
        }
        // Heal missing directories; the documents are what matters.
        for kind in Kind::ALL {
            fs::create_dir_all(root.join(kind.as_str()))?;
        }
        fs::create_dir_all(root.join(SESSION_DIR))?;

        let storage = Self::attach(root, config)?;
        if storage.needs_rebuild()? {
            log::info!("index out of date at {}, rebuilding", root.display());
            storage.rebuild()?;
        }
        fsio::sweep_orphans(root, storage.config.temp_sweep_age());
        Ok(storage)
    }

    fn attach(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let index = Index::open(&root.join(INDEX_FILE), config.busy_timeout())?;
        Ok(Self {
            root: root.to_path_buf(),
            index,
            log: EventLog::new(root),
            config,
            index_dirty: Cell::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn node_path(&self, kind: Kind, id: &str) -> PathBuf {
        self.root.join(kind.as_str()).join(id)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join(SESSION_DIR).join(id)
    }

    fn dirty_sentinel(&self) -> PathBuf {
        self.root.join(DIRTY_FILE)
    }

    /// Acquire the lock for one record (or the event log).
    pub fn lock(&self, name: &str) -> Result<RecordLock, StoreError> {
        RecordLock::acquire(
            &self.root.join(LOCKS_DIR),
            name,
            self.config.lock_timeout(),
            self.config.lock_stale_age(),
        )
    }

    fn mark_index_dirty(&self) {
        self.index_dirty.set(true);
        if let Err(e) = fs::write(self.dirty_sentinel(), b"") {
            log::warn!("could not write index dirty flag: {}", e);
        }
    }

    /// The index, rebuilt first if a write-through was missed.
    pub fn index_fresh(&self) -> Result<&Index, StoreError> {
        if self.index_dirty.get() || self.dirty_sentinel().exists() {
            log::info!("rebuilding index at {} after missed write", self.root.display());
            self.rebuild()?;
        }
        Ok(&self.index)
    }

    // ----- record reads -----

    /// Read one record straight from its document file.
    pub fn get(&self, id: &str) -> Result<Option<Node>, StoreError> {
        let Some(kind) = id::node_kind(id) else {
            return Ok(None);
        };
        let path = self.node_path(kind, id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let node = document::from_document(id, &text)?;
        if node.id != id {
            return Err(StoreError::CorruptRecord {
                id: id.to_string(),
                reason: format!("document id '{}' does not match file name", node.id),
            });
        }
        Ok(Some(node))
    }

    /// All records, optionally one kind, ordered by (priority, created_at).
    ///
    /// Index-backed when fresh; falls back to a directory scan when the
    /// index cannot be brought fresh. Both paths skip unreadable files.
    pub fn list(&self, kind: Option<Kind>) -> Result<Vec<Node>, StoreError> {
        let index = match self.index_fresh() {
            Ok(index) => index,
            Err(e) => {
                log::warn!("index unavailable, listing via directory scan: {}", e);
                return self.list_by_scan(kind);
            }
        };
        let ids = index.node_ids(kind)?;
        self.load_ids(ids)
    }

    fn list_by_scan(&self, kind: Option<Kind>) -> Result<Vec<Node>, StoreError> {
        let scan = self.scan_documents()?;
        for (origin, reason) in &scan.corrupt {
            log::warn!("skipping corrupt record {}: {}", origin, reason);
        }
        let mut nodes: Vec<Node> = scan
            .nodes
            .into_iter()
            .filter(|n| kind.is_none_or(|k| n.kind == k))
            .collect();
        nodes.sort_by(|a, b| {
            (a.priority, a.created_at, a.id.as_str()).cmp(&(b.priority, b.created_at, b.id.as_str()))
        });
        Ok(nodes)
    }

    fn load_ids(&self, ids: Vec<String>) -> Result<Vec<Node>, StoreError> {
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id) {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => {}
                Err(e) => log::warn!("skipping unreadable record {}: {}", id, e),
            }
        }
        Ok(nodes)
    }

    /// Todo records with no unfinished blocker.
    pub fn ready(&self) -> Result<Vec<Node>, StoreError> {
        let ids = self.index_fresh()?.ready_ids()?;
        self.load_ids(ids)
    }

    /// Records explicitly blocked or held back by an unfinished blocker.
    pub fn blocked(&self) -> Result<Vec<Node>, StoreError> {
        let ids = self.index_fresh()?.blocked_ids()?;
        self.load_ids(ids)
    }

    /// Targets of a record's edges of one relation.
    pub fn edges(&self, id: &str, relation: Relation) -> Result<BTreeSet<String>, StoreError> {
        self.index_fresh()?.edges_of(id, relation)
    }

    /// Records whose readiness waits on `id`.
    pub fn dependents(&self, id: &str) -> Result<BTreeSet<String>, StoreError> {
        self.index_fresh()?.dependents_of(id)
    }

    /// Highest child ordinal allocated under a parent id, from the
    /// document tree. Callers allocating the next ordinal must hold the
    /// parent lock.
    pub fn max_child_ordinal(&self, parent_id: &str) -> Result<u64, StoreError> {
        let Some(kind) = id::node_kind(parent_id) else {
            return Ok(0);
        };
        let entries = match fs::read_dir(self.root.join(kind.as_str())) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let prefix = format!("{}.", parent_id);
        let mut max = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Grandchildren have a further dotted suffix and do not parse
            if let Some(rest) = name.strip_prefix(&prefix)
                && let Ok(n) = rest.parse::<u64>()
            {
                max = max.max(n);
            }
        }
        Ok(max)
    }

    // ----- record writes -----

    /// Write a record under its lock.
    pub fn put(&self, node: &Node) -> Result<(), StoreError> {
        let _lock = self.lock(&node.id)?;
        self.write_node(node)
    }

    /// Write a record document and mirror it. Caller must hold the
    /// record lock.
    pub fn write_node(&self, node: &Node) -> Result<(), StoreError> {
        let path = self.node_path(node.kind, &node.id);
        let text = document::to_document(node)?;
        let existed = path.exists();
        fsio::write_atomic(&path, text.as_bytes())?;

        let mirrored = self.index.upsert_node(node).and_then(|_| {
            if existed {
                Ok(())
            } else {
                self.index.bump_meta_count(META_NODES_COUNT, 1)
            }
        });
        if let Err(e) = mirrored {
            self.mark_index_dirty();
            return Err(e);
        }
        Ok(())
    }

    /// Delete a record under its lock.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _lock = self.lock(id)?;
        self.remove_node(id)
    }

    /// Remove a record document and its index row. Caller must hold the
    /// record lock.
    pub fn remove_node(&self, id: &str) -> Result<bool, StoreError> {
        let Some(kind) = id::node_kind(id) else {
            return Ok(false);
        };
        match fs::remove_file(self.node_path(kind, id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::Io(e)),
        }
        let mirrored = self
            .index
            .remove_node(id)
            .and_then(|_| self.index.bump_meta_count(META_NODES_COUNT, -1));
        if let Err(e) = mirrored {
            self.mark_index_dirty();
            return Err(e);
        }
        Ok(true)
    }

    // ----- sessions -----

    /// Read one session document; `event_count` comes from the index.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let text = match fs::read_to_string(self.session_path(id)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let mut session = document::session_from_document(id, &text)?;
        if session.id != id {
            return Err(StoreError::CorruptRecord {
                id: id.to_string(),
                reason: format!("document id '{}' does not match file name", session.id),
            });
        }
        session.event_count = self.index_fresh()?.session_event_count(id)?;
        Ok(Some(session))
    }

    /// Write a session under its lock.
    pub fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let _lock = self.lock(&session.id)?;
        self.write_session(session)
    }

    /// Write a session document and mirror it. Caller must hold the lock.
    pub fn write_session(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(&session.id);
        let text = document::session_to_document(session)?;
        let existed = path.exists();
        fsio::write_atomic(&path, text.as_bytes())?;

        let mirrored = self.index.upsert_session(session).and_then(|_| {
            if existed {
                Ok(())
            } else {
                self.index.bump_meta_count(META_SESSIONS_COUNT, 1)
            }
        });
        if let Err(e) = mirrored {
            self.mark_index_dirty();
            return Err(e);
        }
        Ok(())
    }

    /// All sessions ordered by start time.
    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let scan = self.scan_sessions()?;
        for (origin, reason) in &scan.corrupt {
            log::warn!("skipping corrupt session {}: {}", origin, reason);
        }
        let mut sessions = scan.sessions;
        sessions.sort_by(|a, b| (a.started_at, a.id.as_str()).cmp(&(b.started_at, b.id.as_str())));
        for session in &mut sessions {
            session.event_count = self.index_fresh()?.session_event_count(&session.id)?;
        }
        Ok(sessions)
    }

    // ----- events -----

    /// Allocate the next sequence number and append an event, mirroring
    /// it into the index.
    pub fn record_event(
        &self,
        subject: &str,
        kind: EventKind,
        ctx: &Context,
    ) -> Result<Event, StoreError> {
        let _lock = self.lock(EVENTS_LOCK)?;
        let now = Utc::now();
        let event = Event {
            id: id::generate_event_id(subject, now),
            ts: now,
            seq: self.log.next_seq()?,
            subject: subject.to_string(),
            kind,
            agent: ctx.agent.clone(),
            session: ctx.session.clone(),
        };
        let added = self.log.append(&event)?;

        // The log line is the authoritative copy; a missed mirror only
        // costs a rebuild later.
        let mirrored = self
            .index
            .insert_event(&event)
            .and_then(|_| self.index.bump_meta_count(META_EVENTS_LINES, added as i64));
        if let Err(e) = mirrored {
            log::warn!("event {} not mirrored to index: {}", event.id, e);
            self.mark_index_dirty();
        }
        Ok(event)
    }

    // ----- scans, rebuild, reindex -----

    fn scan_documents(&self) -> Result<DocumentScan, StoreError> {
        let mut scan = DocumentScan {
            nodes: Vec::new(),
            corrupt: Vec::new(),
            file_count: 0,
        };
        for kind in Kind::ALL {
            let entries = match fs::read_dir(self.root.join(kind.as_str())) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(e)),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.contains(".tmp.") || !path.is_file() {
                    continue;
                }
                scan.file_count += 1;
                let text = match fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        scan.corrupt.push((name.to_string(), e.to_string()));
                        continue;
                    }
                };
                match document::from_document(name, &text) {
                    Ok(node) if node.id != name => {
                        scan.corrupt.push((
                            name.to_string(),
                            format!("document id '{}' does not match file name", node.id),
                        ));
                    }
                    Ok(node) if node.kind != kind => {
                        scan.corrupt.push((
                            name.to_string(),
                            format!("record filed under {}/ but is a {}", kind.as_str(), node.kind.as_str()),
                        ));
                    }
                    Ok(node) => scan.nodes.push(node),
                    Err(StoreError::CorruptRecord { reason, .. }) => {
                        scan.corrupt.push((name.to_string(), reason));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(scan)
    }

    fn scan_sessions(&self) -> Result<SessionScan, StoreError> {
        let mut scan = SessionScan {
            sessions: Vec::new(),
            corrupt: Vec::new(),
            file_count: 0,
        };
        let entries = match fs::read_dir(self.root.join(SESSION_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(StoreError::Io(e)),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.contains(".tmp.") || !path.is_file() {
                continue;
            }
            scan.file_count += 1;
            let origin = format!("{}/{}", SESSION_DIR, name);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    scan.corrupt.push((origin, e.to_string()));
                    continue;
                }
            };
            match document::session_from_document(&origin, &text) {
                Ok(session) if session.id != name => {
                    scan.corrupt.push((
                        origin,
                        format!("document id '{}' does not match file name", session.id),
                    ));
                }
                Ok(session) => scan.sessions.push(session),
                Err(StoreError::CorruptRecord { reason, .. }) => {
                    scan.corrupt.push((origin, reason));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scan)
    }

    fn needs_rebuild(&self) -> Result<bool, StoreError> {
        if self.dirty_sentinel().exists() {
            return Ok(true);
        }
        let mut node_files = 0;
        for kind in Kind::ALL {
            node_files += count_dir_files(&self.root.join(kind.as_str()))?;
        }
        let session_files = count_dir_files(&self.root.join(SESSION_DIR))?;

        Ok(node_files != self.index.meta_count(META_NODES_COUNT)
            || session_files != self.index.meta_count(META_SESSIONS_COUNT)
            || self.log.line_count()? != self.index.meta_count(META_EVENTS_LINES))
    }

    /// Recompute every index table from the documents and the log.
    pub fn rebuild(&self) -> Result<(), StoreError> {
        let scan = self.scan_documents()?;
        let sessions = self.scan_sessions()?;
        let (events, event_lines) = self.log.read_all()?;
        for (origin, reason) in scan.corrupt.iter().chain(&sessions.corrupt) {
            log::warn!("not indexing corrupt document {}: {}", origin, reason);
        }
        self.rebuild_with(&scan, &sessions, &events, event_lines)
    }

    fn rebuild_with(
        &self,
        scan: &DocumentScan,
        sessions: &SessionScan,
        events: &[Event],
        event_lines: i64,
    ) -> Result<(), StoreError> {
        self.index.clear_all()?;
        for node in &scan.nodes {
            self.index.upsert_node(node)?;
        }
        for session in &sessions.sessions {
            self.index.upsert_session(session)?;
        }
        for event in events {
            self.index.insert_event(event)?;
        }
        self.index.set_meta_count(META_NODES_COUNT, scan.file_count)?;
        self.index
            .set_meta_count(META_SESSIONS_COUNT, sessions.file_count)?;
        self.index.set_meta_count(META_EVENTS_LINES, event_lines)?;

        self.index_dirty.set(false);
        fs::remove_file(self.dirty_sentinel()).ok();
        Ok(())
    }

    /// Compare the index against the documents and the log, report every
    /// divergence, then rebuild.
    pub fn reindex(&self) -> Result<ReindexReport, StoreError> {
        let scan = self.scan_documents()?;
        let sessions = self.scan_sessions()?;
        let (events, event_lines) = self.log.read_all()?;

        let mut discrepancies = Vec::new();
        for (origin, reason) in scan.corrupt.iter().chain(&sessions.corrupt) {
            discrepancies.push(Discrepancy::CorruptDocument {
                origin: origin.clone(),
                reason: reason.clone(),
            });
        }

        // Node rows
        let expected: BTreeMap<String, NodeRow> = scan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeRow::from_node(n)))
            .collect();
        let actual: BTreeMap<String, NodeRow> = self
            .index
            .node_rows()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        for (id, row) in &expected {
            match actual.get(id) {
                None => discrepancies.push(Discrepancy::MissingRow { id: id.clone() }),
                Some(existing) if existing != row => {
                    discrepancies.push(Discrepancy::FieldDrift {
                        id: id.clone(),
                        field: row.first_drift(existing).unwrap_or("id").to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        for id in actual.keys() {
            if !expected.contains_key(id) {
                discrepancies.push(Discrepancy::OrphanRow { id: id.clone() });
            }
        }

        // Edges
        let expected_edges: BTreeSet<EdgeRow> = scan
            .nodes
            .iter()
            .flat_map(|n| {
                n.edges.iter().map(|e| {
                    (
                        n.id.clone(),
                        e.relation.as_str().to_string(),
                        e.target.clone(),
                        e.label.clone(),
                    )
                })
            })
            .collect();
        let actual_edges: BTreeSet<EdgeRow> = self.index.edge_rows()?.into_iter().collect();
        for (source, relation, target, _) in expected_edges.difference(&actual_edges) {
            discrepancies.push(Discrepancy::MissingEdge {
                source: source.clone(),
                relation: relation.clone(),
                target: target.clone(),
            });
        }
        for (source, relation, target, _) in actual_edges.difference(&expected_edges) {
            discrepancies.push(Discrepancy::OrphanEdge {
                source: source.clone(),
                relation: relation.clone(),
                target: target.clone(),
            });
        }

        // Sessions
        let expected_sessions: BTreeMap<String, SessionRow> = sessions
            .sessions
            .iter()
            .map(|s| (s.id.clone(), SessionRow::from_session(s)))
            .collect();
        let actual_sessions: BTreeMap<String, SessionRow> = self
            .index
            .session_rows()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        for (id, row) in &expected_sessions {
            if actual_sessions.get(id) != Some(row) {
                discrepancies.push(Discrepancy::SessionDrift { id: id.clone() });
            }
        }
        for id in actual_sessions.keys() {
            if !expected_sessions.contains_key(id) {
                discrepancies.push(Discrepancy::SessionDrift { id: id.clone() });
            }
        }

        // Events, keyed by sequence number
        let expected_events: BTreeMap<i64, EventRow> = events
            .iter()
            .map(|e| (e.seq as i64, EventRow::from_event(e)))
            .collect();
        let actual_events: BTreeMap<i64, EventRow> = self
            .index
            .event_rows()?
            .into_iter()
            .map(|r| (r.seq, r))
            .collect();
        for (seq, row) in &expected_events {
            if actual_events.get(seq) != Some(row) {
                discrepancies.push(Discrepancy::EventDrift { seq: *seq as u64 });
            }
        }
        for seq in actual_events.keys() {
            if !expected_events.contains_key(seq) {
                discrepancies.push(Discrepancy::EventDrift { seq: *seq as u64 });
            }
        }

        self.rebuild_with(&scan, &sessions, &events, event_lines)?;

        // Corrupt documents are reported but were never indexed, so they
        // alone do not mean the rebuild changed anything.
        let rebuilt = discrepancies
            .iter()
            .any(|d| !matches!(d, Discrepancy::CorruptDocument { .. }));
        Ok(ReindexReport {
            rebuilt,
            discrepancies,
        })
    }
}

fn count_dir_files(dir: &Path) -> Result<i64, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::Io(e)),
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.contains(".tmp.") {
            continue;
        }
        if entry.path().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, Status};
    use tempfile::TempDir;

    fn setup_test_storage() -> (TempDir, Storage) {
        let temp = TempDir::new().unwrap();
        let storage = Storage::init(temp.path(), StoreConfig::default()).unwrap();
        (temp, storage)
    }

    fn make_node(id: &str, title: &str) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            kind: id::node_kind(id).unwrap(),
            status: Status::Todo,
            priority: 2,
            title: title.to_string(),
            steps: vec![],
            edges: vec![],
            claimed_by: None,
            claimed_at: None,
            claiming_session: None,
            created_at: now,
            updated_at: now,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_init_creates_layout() {
        let temp = TempDir::new().unwrap();
        let _storage = Storage::init(temp.path(), StoreConfig::default()).unwrap();

        for kind in Kind::ALL {
            assert!(temp.path().join(kind.as_str()).is_dir());
        }
        assert!(temp.path().join(SESSION_DIR).is_dir());
        assert!(temp.path().join(LOCKS_DIR).is_dir());
        assert!(temp.path().join(EVENTS_FILE).is_file());
        assert!(temp.path().join(INDEX_FILE).is_file());
    }

    #[test]
    fn test_open_requires_initialized_root() {
        let temp = TempDir::new().unwrap();
        let err = Storage::open(temp.path(), StoreConfig::default()).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_temp, storage) = setup_test_storage();
        let node = make_node("task-0000000001", "First");

        storage.put(&node).unwrap();
        let loaded = storage.get("task-0000000001").unwrap().unwrap();
        assert_eq!(loaded, node);

        assert!(storage.get("task-00000000ff").unwrap().is_none());
        assert!(storage.get("not-an-id").unwrap().is_none());
    }

    #[test]
    fn test_document_file_is_pretty_json() {
        let (temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "First")).unwrap();

        let text = fs::read_to_string(temp.path().join("task").join("task-0000000001")).unwrap();
        assert!(text.starts_with("{\n"));
        assert!(text.ends_with("\n"));
    }

    #[test]
    fn test_get_corrupt_document() {
        let (temp, storage) = setup_test_storage();
        fs::write(temp.path().join("task").join("task-0000000001"), "not json").unwrap();

        let err = storage.get("task-0000000001").unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { .. }));
    }

    #[test]
    fn test_get_detects_renamed_file() {
        let (temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "First")).unwrap();
        fs::rename(
            temp.path().join("task").join("task-0000000001"),
            temp.path().join("task").join("task-0000000002"),
        )
        .unwrap();

        let err = storage.get("task-0000000002").unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { .. }));
    }

    #[test]
    fn test_delete() {
        let (_temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "First")).unwrap();

        assert!(storage.delete("task-0000000001").unwrap());
        assert!(storage.get("task-0000000001").unwrap().is_none());
        // Second delete reports absence
        assert!(!storage.delete("task-0000000001").unwrap());
    }

    #[test]
    fn test_list_both_paths_agree() {
        let (_temp, storage) = setup_test_storage();
        let mut a = make_node("task-0000000001", "Low priority");
        a.priority = 3;
        let mut b = make_node("task-0000000002", "High priority");
        b.priority = 0;
        let c = make_node("bug-0000000003", "A bug");
        storage.put(&a).unwrap();
        storage.put(&b).unwrap();
        storage.put(&c).unwrap();

        let indexed = storage.list(None).unwrap();
        let scanned = storage.list_by_scan(None).unwrap();
        assert_eq!(indexed, scanned);
        assert_eq!(indexed[0].id, "task-0000000002");

        let tasks = storage.list(Some(Kind::Task)).unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let (temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "Good")).unwrap();
        fs::write(temp.path().join("task").join("task-0000000002"), "garbage").unwrap();

        let scanned = storage.list_by_scan(None).unwrap();
        assert_eq!(scanned.len(), 1);
    }

    #[test]
    fn test_open_heals_out_of_band_additions() {
        let temp = TempDir::new().unwrap();
        {
            let storage = Storage::init(temp.path(), StoreConfig::default()).unwrap();
            storage.put(&make_node("task-0000000001", "First")).unwrap();
        }

        // A record dropped in while no process had the store open
        let rogue = make_node("task-0000000002", "Rogue");
        let text = document::to_document(&rogue).unwrap();
        fs::write(temp.path().join("task").join("task-0000000002"), text).unwrap();

        let storage = Storage::open(temp.path(), StoreConfig::default()).unwrap();
        let ids: Vec<String> = storage.list(None).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["task-0000000001", "task-0000000002"]);
    }

    #[test]
    fn test_open_rebuilds_after_index_deletion() {
        let temp = TempDir::new().unwrap();
        {
            let storage = Storage::init(temp.path(), StoreConfig::default()).unwrap();
            storage.put(&make_node("task-0000000001", "First")).unwrap();
        }
        fs::remove_file(temp.path().join(INDEX_FILE)).unwrap();

        let storage = Storage::open(temp.path(), StoreConfig::default()).unwrap();
        assert_eq!(storage.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_dirty_sentinel_triggers_rebuild() {
        let (temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "First")).unwrap();

        storage.mark_index_dirty();
        assert!(temp.path().join(DIRTY_FILE).exists());

        // The next indexed read rebuilds and clears the flag
        assert_eq!(storage.list(None).unwrap().len(), 1);
        assert!(!temp.path().join(DIRTY_FILE).exists());
    }

    #[test]
    fn test_reindex_clean_store() {
        let (_temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "First")).unwrap();
        storage
            .record_event("task-0000000001", EventKind::Create, &Context::new("agent-a"))
            .unwrap();

        let report = storage.reindex().unwrap();
        assert!(!report.rebuilt);
        assert!(report.discrepancies.is_empty());
    }

    #[test]
    fn test_reindex_detects_field_drift() {
        let (temp, storage) = setup_test_storage();
        let node = make_node("task-0000000001", "Original");
        storage.put(&node).unwrap();

        // Out-of-band edit behind the index's back
        let mut edited = node.clone();
        edited.title = "Edited".to_string();
        let text = document::to_document(&edited).unwrap();
        fs::write(temp.path().join("task").join("task-0000000001"), text).unwrap();

        let report = storage.reindex().unwrap();
        assert!(report.rebuilt);
        assert_eq!(
            report.discrepancies,
            vec![Discrepancy::FieldDrift {
                id: "task-0000000001".to_string(),
                field: "title".to_string(),
            }]
        );

        // Repaired: a second pass is clean
        let report = storage.reindex().unwrap();
        assert!(!report.rebuilt);
        assert!(report.discrepancies.is_empty());
    }

    #[test]
    fn test_reindex_detects_missing_and_orphan_rows() {
        let (temp, storage) = setup_test_storage();
        storage.put(&make_node("task-0000000001", "Kept")).unwrap();
        storage.put(&make_node("task-0000000002", "Doomed")).unwrap();

        // One file added and one removed without touching the index
        let rogue = make_node("task-0000000003", "Rogue");
        fs::write(
            temp.path().join("task").join("task-0000000003"),
            document::to_document(&rogue).unwrap(),
        )
        .unwrap();
        fs::remove_file(temp.path().join("task").join("task-0000000002")).unwrap();

        let report = storage.reindex().unwrap();
        assert!(report.rebuilt);
        assert!(report.discrepancies.contains(&Discrepancy::MissingRow {
            id: "task-0000000003".to_string()
        }));
        assert!(report.discrepancies.contains(&Discrepancy::OrphanRow {
            id: "task-0000000002".to_string()
        }));
    }

    #[test]
    fn test_reindex_detects_edge_drift() {
        let (temp, storage) = setup_test_storage();
        let mut node = make_node("task-0000000001", "Source");
        node.edges = vec![Edge {
            relation: Relation::Blocks,
            target: "task-0000000002".to_string(),
            label: None,
        }];
        storage.put(&node).unwrap();

        // Swap the edge target out-of-band
        node.edges[0].target = "task-0000000003".to_string();
        fs::write(
            temp.path().join("task").join("task-0000000001"),
            document::to_document(&node).unwrap(),
        )
        .unwrap();

        let report = storage.reindex().unwrap();
        assert!(report.rebuilt);
        assert!(report.discrepancies.contains(&Discrepancy::MissingEdge {
            source: "task-0000000001".to_string(),
            relation: "blocks".to_string(),
            target: "task-0000000003".to_string(),
        }));
        assert!(report.discrepancies.contains(&Discrepancy::OrphanEdge {
            source: "task-0000000001".to_string(),
            relation: "blocks".to_string(),
            target: "task-0000000002".to_string(),
        }));
        // The title itself did not drift
        assert!(
            !report
                .discrepancies
                .iter()
                .any(|d| matches!(d, Discrepancy::FieldDrift { .. }))
        );
    }

    #[test]
    fn test_reindex_reports_corrupt_document() {
        let (temp, storage) = setup_test_storage();
        fs::write(temp.path().join("bug").join("bug-0000000001"), "garbage").unwrap();

        let report = storage.reindex().unwrap();
        // Never indexed, so nothing changed; still reported
        assert!(!report.rebuilt);
        assert_eq!(report.discrepancies.len(), 1);
        assert!(matches!(
            report.discrepancies[0],
            Discrepancy::CorruptDocument { .. }
        ));
    }

    #[test]
    fn test_sessions_roundtrip() {
        let (_temp, storage) = setup_test_storage();
        let session = Session {
            id: "session-0000000001".to_string(),
            owning_agent: "agent-a".to_string(),
            parent_session: None,
            status: crate::types::SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            event_count: 0,
        };
        storage.put_session(&session).unwrap();

        let loaded = storage.get_session("session-0000000001").unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(storage.get_session("session-00000000ff").unwrap().is_none());
        assert_eq!(storage.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_session_event_count_derived() {
        let (_temp, storage) = setup_test_storage();
        let session = Session {
            id: "session-0000000001".to_string(),
            owning_agent: "agent-a".to_string(),
            parent_session: None,
            status: crate::types::SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            event_count: 0,
        };
        storage.put_session(&session).unwrap();

        let ctx = Context::new("agent-a").with_session("session-0000000001");
        storage
            .record_event("task-0000000001", EventKind::Create, &ctx)
            .unwrap();
        storage
            .record_event("task-0000000001", EventKind::Start, &ctx)
            .unwrap();

        let loaded = storage.get_session("session-0000000001").unwrap().unwrap();
        assert_eq!(loaded.event_count, 2);
    }

    #[test]
    fn test_record_event_sequences() {
        let (_temp, storage) = setup_test_storage();
        let ctx = Context::new("agent-a");

        let e1 = storage
            .record_event("task-0000000001", EventKind::Create, &ctx)
            .unwrap();
        let e2 = storage
            .record_event("task-0000000001", EventKind::Start, &ctx)
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);

        // Still clean: log and index agree
        let report = storage.reindex().unwrap();
        assert!(report.discrepancies.is_empty());
    }

    #[test]
    fn test_ready_blocked_through_storage() {
        let (_temp, storage) = setup_test_storage();
        let mut blocker = make_node("task-0000000001", "Blocker");
        blocker.edges = vec![Edge {
            relation: Relation::Blocks,
            target: "task-0000000002".to_string(),
            label: None,
        }];
        storage.put(&blocker).unwrap();
        storage.put(&make_node("task-0000000002", "Victim")).unwrap();

        let ready: Vec<String> = storage.ready().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ready, vec!["task-0000000001"]);
        let blocked: Vec<String> = storage.blocked().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(blocked, vec!["task-0000000002"]);

        assert_eq!(
            storage.dependents("task-0000000001").unwrap(),
            BTreeSet::from(["task-0000000002".to_string()])
        );
    }
}
